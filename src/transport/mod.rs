//! Device transport abstraction
//!
//! A transport enumerates and opens cameras, negotiates stream parameters,
//! accepts pooled buffers and fills them from its own capture context. Filled
//! buffers travel to the dispatcher over a bounded channel wrapped in a
//! [`FrameSink`].

pub mod sim;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;

use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capture::controls::Control;
use crate::pipeline::pool::BufferLease;
use crate::StreamConfiguration;

pub use sim::SimulatedTransport;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Transport;

/// Identifies a physical camera
///
/// Immutable once discovered; refreshed only by re-enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique id (serial number or device path)
    pub id: String,
    pub vendor: String,
    pub model: String,
    /// Transport address, e.g. an IP address or bus location
    pub address: String,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}) @ {}", self.vendor, self.model, self.id, self.address)
    }
}

/// Opaque token for an open device, issued by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    id: u64,
    device_id: String,
}

impl DeviceHandle {
    pub fn new(id: u64, device_id: impl Into<String>) -> Self {
        Self {
            id,
            device_id: device_id.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Device acknowledgement of a stream configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAck {
    /// Bytes the device will write per frame
    pub payload_size: usize,
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device busy: {0}")]
    Busy(String),

    /// Device refused parameters; the message comes from the device
    #[error("{0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("handle is not open")]
    NotOpen,
}

/// What a transport's capture context sends to the dispatcher
#[derive(Debug)]
pub enum TransportEvent {
    /// A buffer moved to Ready
    Filled(BufferLease),
    /// Stream-level failure (link loss, device error)
    Failed(String),
}

/// Producer end of the transport-to-dispatcher channel
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: Sender<TransportEvent>,
}

impl FrameSink {
    /// Bounded channel between a transport and one dispatch loop
    pub fn channel(capacity: usize) -> (Self, Receiver<TransportEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }

    /// Hand a filled buffer to the dispatcher without blocking
    ///
    /// When the dispatcher is gone or behind, the buffer is dropped back to
    /// its pool and `false` is returned.
    pub fn deliver(&self, buffer: BufferLease) -> bool {
        match self.tx.try_send(TransportEvent::Filled(buffer)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Frame sink full, buffer returned to pool");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn report_error(&self, message: impl Into<String>) {
        let _ = self.tx.try_send(TransportEvent::Failed(message.into()));
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_disconnected()
    }
}

/// Device transport collaborator
///
/// Implementations own their capture context. Buffers handed over with
/// `register_buffer` belong to the transport until they come back through the
/// sink or are dropped (which returns them to the pool).
pub trait Transport: Send + Sync + 'static {
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    fn open(&self, device: &DeviceDescriptor) -> Result<DeviceHandle, TransportError>;

    /// Release the device; drops any buffers still queued
    fn close(&self, handle: &DeviceHandle);

    fn apply_configuration(
        &self,
        handle: &DeviceHandle,
        config: &StreamConfiguration,
    ) -> Result<StreamAck, TransportError>;

    fn register_buffer(&self, handle: &DeviceHandle, buffer: BufferLease)
        -> Result<(), TransportError>;

    fn start_stream(&self, handle: &DeviceHandle, sink: FrameSink) -> Result<(), TransportError>;

    /// Stop filling; queued buffers are dropped back to their pool
    fn stop_stream(&self, handle: &DeviceHandle) -> Result<(), TransportError>;

    fn write_control(&self, handle: &DeviceHandle, control: &Control)
        -> Result<(), TransportError>;

    /// Write raw bytes to the device's serial port (lens driver)
    fn write_serial(&self, handle: &DeviceHandle, data: &[u8]) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pool::BufferPool;

    #[test]
    fn test_sink_full_returns_buffer() {
        let pool = BufferPool::preallocate(2, 4).unwrap();
        let (sink, rx) = FrameSink::channel(1);

        let first = pool.checkout_for_fill().unwrap();
        let second = pool.checkout_for_fill().unwrap();
        assert!(sink.deliver(first));
        assert!(!sink.deliver(second));

        assert_eq!(rx.len(), 1);
        assert_eq!(pool.census().free, 1);
    }

    #[test]
    fn test_sink_disconnected() {
        let pool = BufferPool::preallocate(1, 4).unwrap();
        let (sink, rx) = FrameSink::channel(4);
        drop(rx);
        assert!(!sink.is_connected());
        assert!(!sink.deliver(pool.checkout_for_fill().unwrap()));
        assert_eq!(pool.census().free, 1);
    }
}
