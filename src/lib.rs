//! cynlr-camera
//!
//! Camera acquisition for GenICam/GigE-Vision style industrial cameras.
//!
//! The crate drives one [`Session`] per physical device through
//! discovery, stream negotiation, buffer-pool management, ordered frame
//! dispatch and fault recovery. The device transport and the image decoder
//! are collaborators behind the [`transport::Transport`] and
//! [`capture::ImageDecoder`] traits.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cynlr_camera::{CameraSystem, StreamConfiguration, transport::SimulatedTransport};
//!
//! # fn main() -> cynlr_camera::Result<()> {
//! let sim = SimulatedTransport::new()
//!     .with_camera("cam-0")
//!     .with_frame_interval(Duration::from_millis(33));
//! let system = CameraSystem::new(sim);
//! let device = system.find_device("cam-0")?;
//! let session = system.open_session(&device, StreamConfiguration::default())?;
//! session.start()?;
//! let frame = session.next_frame(Duration::from_secs(1))?;
//! let meta = frame.metadata();
//! println!("frame {} is {}x{}", frame.sequence(), meta.width, meta.height);
//! frame.release()?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod capture;
pub mod clock;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod transport;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use camera::CameraSystem;
pub use capture::{AcquisitionMode, Binning, Control, Frame, FrameMetadata, PixelFormat};
pub use error::{CameraError, Result};
pub use pipeline::{DeliveryMode, FrameReceiver, PoolCensus, SessionStats};
pub use session::{
    FaultEvent, FaultKind, ReconnectPolicy, Session, SessionEvent, SessionOptions, SessionState,
};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CYNLR";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub pipeline: PipelineConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Preferred device id; the first enumerated device when unset
    pub device: Option<String>,
    pub stream: StreamConfiguration,
}

/// Stream parameters, fixed while streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfiguration {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub buffer_count: u32,
    pub binning: Binning,
    pub acquisition_mode: AcquisitionMode,
}

impl Default for StreamConfiguration {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Mono8,
            width: 1280,
            height: 1024,
            frame_rate: 30.0,
            buffer_count: 10,
            binning: Binning::default(),
            acquisition_mode: AcquisitionMode::Continuous,
        }
    }
}

impl StreamConfiguration {
    /// Reject parameters no device could honour
    pub fn validate(&self) -> Result<()> {
        let reject = |msg: String| Err(CameraError::UnsupportedConfiguration(msg));
        if self.width == 0 || self.height == 0 {
            return reject(format!("invalid resolution {}x{}", self.width, self.height));
        }
        if self.buffer_count == 0 {
            return reject("buffer count must be at least 1".to_string());
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return reject(format!("invalid frame rate {}", self.frame_rate));
        }
        let odd = match self.pixel_format {
            PixelFormat::Yuyv4 => self.width % 2 != 0,
            PixelFormat::Nv12 => self.width % 2 != 0 || self.height % 2 != 0,
            _ => false,
        };
        if odd {
            return reject(format!(
                "{} needs even dimensions, got {}x{}",
                self.pixel_format, self.width, self.height
            ));
        }
        if self.binning.dx == 0 || self.binning.dy == 0 {
            return reject(format!(
                "invalid binning {}x{}",
                self.binning.dx, self.binning.dy
            ));
        }
        Ok(())
    }

    /// Bytes per frame when the device does not report a payload size
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    /// Time between frames; fails for rates `validate` rejects
    pub fn frame_interval(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(1.0 / self.frame_rate).map_err(|_| {
            CameraError::UnsupportedConfiguration(format!(
                "invalid frame rate {}",
                self.frame_rate
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub delivery: DeliveryMode,
    /// Fault when no transport event arrives for this long; 0 disables
    pub heartbeat_timeout_ms: u64,
    /// Fault when no buffer is queued with the transport for this long
    pub starvation_grace_ms: u64,
    /// Dispatch loop wakeup period for its watchdogs
    pub dispatch_tick_ms: u64,
    /// Pin the dispatch thread to this core
    pub dispatch_cpu: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::SingleQueue,
            heartbeat_timeout_ms: 3000,
            starvation_grace_ms: 1000,
            dispatch_tick_ms: 20,
            dispatch_cpu: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 5000,
            max_attempts: 5,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `CYNLR__SECTION__KEY` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn session_options(&self) -> SessionOptions {
        let pipeline = &self.pipeline;
        SessionOptions {
            delivery: pipeline.delivery,
            heartbeat_timeout: (pipeline.heartbeat_timeout_ms > 0)
                .then(|| Duration::from_millis(pipeline.heartbeat_timeout_ms)),
            starvation_grace: Duration::from_millis(pipeline.starvation_grace_ms),
            dispatch_tick: Duration::from_millis(pipeline.dispatch_tick_ms.max(1)),
            dispatch_cpu: pipeline.dispatch_cpu,
            reconnect: ReconnectPolicy::from(&self.reconnect),
        }
    }
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
