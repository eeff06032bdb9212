pub mod dispatch;
pub mod pool;
pub mod stats;

pub use dispatch::{DeliveryMode, FrameCallback, FrameReceiver};
pub use pool::{BufferLease, BufferPool, BufferState, PoolCensus};
pub use stats::SessionStats;
