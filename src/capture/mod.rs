pub mod controls;
pub mod decoder;
pub mod frame;

pub use controls::{AcquisitionMode, Binning, Control};
pub use decoder::{DecodeError, ImageDecoder, StandardDecoder};
pub use frame::{Frame, FrameMetadata, PixelFormat};
