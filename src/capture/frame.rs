use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::DynamicImage;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::capture::decoder::ImageDecoder;
use crate::error::Result;
use crate::pipeline::pool::BufferLease;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Mono8,
    Mono10,
    Mono12,
    Mono14,
    Mono16,
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Significant bits per sample for monochrome formats
    pub fn bit_depth(self) -> Option<u32> {
        match self {
            PixelFormat::Mono8 => Some(8),
            PixelFormat::Mono10 => Some(10),
            PixelFormat::Mono12 => Some(12),
            PixelFormat::Mono14 => Some(14),
            PixelFormat::Mono16 => Some(16),
            _ => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Bytes needed for one uncompressed frame, tightly packed
    ///
    /// MJPEG has no fixed size; the RGB24 size is used as its upper bound.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Mono8 => pixels,
            PixelFormat::Mono10
            | PixelFormat::Mono12
            | PixelFormat::Mono14
            | PixelFormat::Mono16
            | PixelFormat::Yuyv4 => pixels * 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Mjpeg => pixels * 3,
            PixelFormat::Nv12 => {
                let chroma = (width as usize).div_ceil(2) * (height as usize).div_ceil(2);
                pixels + chroma * 2
            }
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frame metadata, written by the transport when it fills a buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    /// Session-wide frame number, assigned at dispatch; strictly increasing
    /// across stops, restarts and reconnects
    pub sequence: u64,
    /// Block id as counted by the device; restarts with every stream
    pub block_id: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row; 0 when rows are tightly packed
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
    pub bytes_used: usize,
    /// False for incomplete or corrupted transfers
    pub valid: bool,
}

/// Consumer-facing handle over a filled buffer
///
/// Clones share the buffer; it returns to the pool when the last clone is
/// released or dropped. Decoding happens on the first `image()` call and is
/// cached for every clone.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    lease: BufferLease,
    meta: FrameMetadata,
    decoder: Arc<dyn ImageDecoder>,
    image: OnceCell<Arc<DynamicImage>>,
    received_at: Instant,
}

impl Frame {
    pub(crate) fn new(
        lease: BufferLease,
        meta: FrameMetadata,
        decoder: Arc<dyn ImageDecoder>,
        received_at: Instant,
    ) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                lease,
                meta,
                decoder,
                image: OnceCell::new(),
                received_at,
            }),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.inner.meta.sequence
    }

    /// Device block id of this frame
    pub fn block_id(&self) -> u64 {
        self.inner.meta.block_id
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.inner.meta
    }

    /// When the dispatcher picked the frame up
    pub fn received_at(&self) -> Instant {
        self.inner.received_at
    }

    pub fn buffer_id(&self) -> usize {
        self.inner.lease.id()
    }

    /// False once the session has been closed and the buffer reclaimed
    pub fn is_current(&self) -> bool {
        self.inner.lease.state().is_some()
    }

    /// Borrow the raw bytes
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.inner.lease.read(f)
    }

    /// Copy the raw bytes out of the pooled buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.read(Bytes::copy_from_slice)
    }

    /// Decoded image, converted on first access
    pub fn image(&self) -> Result<Arc<DynamicImage>> {
        self.inner
            .image
            .get_or_try_init(|| -> Result<Arc<DynamicImage>> {
                let start = Instant::now();
                let image = self
                    .inner
                    .lease
                    .read(|raw| self.inner.decoder.decode(raw, &self.inner.meta))??;
                metrics::histogram!("cynlr_camera_decode_time_us")
                    .record(start.elapsed().as_micros() as f64);
                Ok(Arc::new(image))
            })
            .cloned()
    }

    /// Give up this handle; the buffer is freed once no clone remains
    pub fn release(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.lease.release(),
            Err(_shared) => Ok(()),
        }
    }

    /// Ready -> InUse at handoff
    pub(crate) fn claim(&self) {
        let _ = self.inner.lease.mark_in_use();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.inner.meta.sequence)
            .field("block_id", &self.inner.meta.block_id)
            .field("buffer", &self.inner.lease.id())
            .field("format", &self.inner.meta.format)
            .field("width", &self.inner.meta.width)
            .field("height", &self.inner.meta.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decoder::StandardDecoder;
    use crate::error::CameraError;
    use crate::pipeline::pool::BufferPool;

    fn frame_from(pool: &BufferPool, sequence: u64) -> Frame {
        let lease = pool.checkout_for_fill().unwrap();
        lease
            .write(|buf| {
                for (i, px) in buf.iter_mut().enumerate() {
                    *px = i as u8;
                }
            })
            .unwrap();
        let meta = FrameMetadata {
            sequence,
            width: 4,
            height: 2,
            format: PixelFormat::Mono8,
            bytes_used: 8,
            valid: true,
            ..Default::default()
        };
        lease.mark_ready(meta.clone()).unwrap();
        Frame::new(lease, meta, Arc::new(StandardDecoder), Instant::now())
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Mono8.frame_size(4, 2), 8);
        assert_eq!(PixelFormat::Mono12.frame_size(4, 2), 16);
        assert_eq!(PixelFormat::Rgb24.frame_size(4, 2), 24);
        assert_eq!(PixelFormat::Nv12.frame_size(4, 2), 12);
        assert_eq!(PixelFormat::Nv12.frame_size(2, 3), 10);
    }

    #[test]
    fn test_image_is_cached() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let frame = frame_from(&pool, 1);
        let first = frame.image().unwrap();
        let second = frame.clone().image().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.width(), 4);
        assert_eq!(first.height(), 2);
    }

    #[test]
    fn test_shared_frame_returns_buffer_after_last_release() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let frame = frame_from(&pool, 1);
        frame.claim();
        let copy = frame.clone();

        frame.release().unwrap();
        assert_eq!(pool.census().in_use, 1);
        copy.release().unwrap();
        assert_eq!(pool.census().free, 1);
    }

    #[test]
    fn test_closed_pool_invalidates_frame() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let frame = frame_from(&pool, 1);
        frame.claim();
        pool.close();

        assert!(!frame.is_current());
        assert!(matches!(frame.to_bytes(), Err(CameraError::SessionClosed)));
        assert!(matches!(frame.release(), Err(CameraError::SessionClosed)));
        assert_eq!(pool.census().free, 1);
        assert_eq!(pool.census().total(), 1);
    }
}
