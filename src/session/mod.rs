pub mod device;
pub mod monitor;
pub mod registry;
pub mod state;

pub use device::{Session, SessionEvent, SessionOptions};
pub use monitor::{FaultEvent, FaultHandler, FaultKind, FaultMonitor, ReconnectPolicy};
pub use registry::{DeviceRegistry, RegistryLease};
pub use state::SessionState;
