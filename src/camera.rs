//! Embedding surface: discover devices and open sessions

use std::sync::Arc;

use tracing::info;

use crate::capture::decoder::{ImageDecoder, StandardDecoder};
use crate::clock::{Clock, SystemClock};
use crate::error::{CameraError, Result};
use crate::session::device::SessionParts;
use crate::session::{DeviceRegistry, Session, SessionOptions};
use crate::transport::{DeviceDescriptor, Transport};
use crate::StreamConfiguration;

/// Entry point tying a transport to sessions
///
/// Sessions opened from one system share its device registry, so a device
/// can only be held by one of them at a time.
pub struct CameraSystem {
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    decoder: Arc<dyn ImageDecoder>,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
}

impl CameraSystem {
    pub fn new(transport: impl Transport) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: DeviceRegistry::new(),
            decoder: Arc::new(StandardDecoder),
            clock: Arc::new(SystemClock),
            options: SessionOptions::default(),
        }
    }

    pub fn with_decoder(mut self, decoder: impl ImageDecoder) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_registry(mut self, registry: DeviceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.transport
            .enumerate_devices()
            .map_err(CameraError::from_open)
    }

    pub fn find_device(&self, id: &str) -> Result<DeviceDescriptor> {
        self.list_devices()?
            .into_iter()
            .find(|device| device.id == id)
            .ok_or_else(|| CameraError::DeviceNotFound(id.to_string()))
    }

    /// A fresh session in `Disconnected`
    pub fn session(&self) -> Session {
        Session::new(SessionParts {
            transport: Arc::clone(&self.transport),
            registry: self.registry.clone(),
            decoder: Arc::clone(&self.decoder),
            clock: Arc::clone(&self.clock),
            options: self.options.clone(),
        })
    }

    /// Open and configure a session; it is left in `Configured`
    pub fn open_session(
        &self,
        device: &DeviceDescriptor,
        config: StreamConfiguration,
    ) -> Result<Session> {
        let session = self.session();
        session.open(device)?;
        session.apply_configuration(config)?;
        info!(device = %device.id, "Session ready");
        Ok(session)
    }
}
