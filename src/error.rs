//! Error types for cynlr-camera

use thiserror::Error;

use crate::capture::decoder::DecodeError;
use crate::session::SessionState;
use crate::transport::TransportError;

/// Result type alias using CameraError
pub type Result<T> = std::result::Result<T, CameraError>;

/// Camera acquisition errors
///
/// Configuration and open-time failures surface synchronously. Streaming-time
/// faults are absorbed by the fault monitor and only escalate as
/// `ReconnectExhausted` once the retry budget is spent.
#[derive(Debug, Clone, Error)]
pub enum CameraError {
    /// No device with the given identity is known to the transport
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device is already held by another session or process
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device rejected the stream parameters (message from the transport, verbatim)
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Transport refused to start streaming
    #[error("Stream start failed: {0}")]
    StartFailed(String),

    /// No free buffer available right now
    #[error("Buffer pool is empty")]
    PoolEmpty,

    /// Buffer memory could not be reserved
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Buffer released or touched by a context that does not own it
    #[error("Invalid buffer ownership: {0}")]
    InvalidOwnership(String),

    /// Operation not valid in the current session state
    #[error("Invalid state: cannot move from {current} to {attempted}")]
    InvalidState {
        current: SessionState,
        attempted: SessionState,
    },

    /// Blocking operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// A frame never arrived (non-fatal, reported as an event)
    #[error("Dropped frame {0}")]
    DroppedFrame(u64),

    /// Session was closed; buffers were reclaimed
    #[error("Session closed")]
    SessionClosed,

    /// Reconnect budget spent; the session is closed
    #[error("Reconnect exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Transport failure that has no dedicated variant
    #[error("Transport error: {0}")]
    Transport(String),

    /// Image decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),
}

impl CameraError {
    pub(crate) fn invalid_state(current: SessionState, attempted: SessionState) -> Self {
        Self::InvalidState { current, attempted }
    }

    /// Map a transport error raised while opening a device
    pub(crate) fn from_open(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(msg) => Self::DeviceNotFound(msg),
            TransportError::Busy(msg) => Self::DeviceBusy(msg),
            other => Self::Transport(other.to_string()),
        }
    }

    /// Map a transport error raised while applying stream parameters
    pub(crate) fn from_configure(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(msg) => Self::UnsupportedConfiguration(msg),
            other => Self::from_open(other),
        }
    }

    /// Any failure to bring the stream up is a start failure
    pub(crate) fn from_start(err: TransportError) -> Self {
        Self::StartFailed(err.to_string())
    }

    /// Errors that end the session for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. } | Self::SessionClosed)
    }
}

impl From<config::ConfigError> for CameraError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<TransportError> for CameraError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}
