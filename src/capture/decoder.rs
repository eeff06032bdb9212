use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};
use thiserror::Error;

use super::frame::{FrameMetadata, PixelFormat};

/// Image decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame has zero width or height")]
    EmptyFrame,

    #[error("buffer too short: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("JPEG decode failed: {0}")]
    Jpeg(String),

    #[error("unexpected decoded layout: {0}")]
    Layout(String),
}

/// Converts a raw buffer plus its pixel format into an image
pub trait ImageDecoder: Send + Sync + 'static {
    fn decode(&self, raw: &[u8], meta: &FrameMetadata) -> Result<DynamicImage, DecodeError>;
}

/// Decoder for every `PixelFormat` we support, backed by `image` and `zune-jpeg`
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecoder;

impl ImageDecoder for StandardDecoder {
    fn decode(&self, raw: &[u8], meta: &FrameMetadata) -> Result<DynamicImage, DecodeError> {
        let (width, height) = (meta.width, meta.height);
        if width == 0 || height == 0 {
            return Err(DecodeError::EmptyFrame);
        }
        let (w, h) = (width as usize, height as usize);
        let stride = meta.stride as usize;

        match meta.format {
            PixelFormat::Mono8 => {
                let pixels = packed_rows(raw, w, h, stride)?;
                GrayImage::from_raw(width, height, pixels)
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| layout("mono8", w * h))
            }
            PixelFormat::Mono10
            | PixelFormat::Mono12
            | PixelFormat::Mono14
            | PixelFormat::Mono16 => {
                let bytes = packed_rows(raw, w * 2, h, stride)?;
                let shift = 16 - meta.format.bit_depth().unwrap_or(16);
                let samples: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|px| u16::from_le_bytes([px[0], px[1]]) << shift)
                    .collect();
                ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width, height, samples)
                    .map(DynamicImage::ImageLuma16)
                    .ok_or_else(|| layout("mono16", w * h))
            }
            PixelFormat::Rgb24 => {
                let pixels = packed_rows(raw, w * 3, h, stride)?;
                rgb_image(width, height, pixels)
            }
            PixelFormat::Bgr24 => {
                let mut pixels = packed_rows(raw, w * 3, h, stride)?;
                for px in pixels.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                rgb_image(width, height, pixels)
            }
            PixelFormat::Yuyv4 => {
                let yuyv = packed_rows(raw, w * 2, h, stride)?;
                let mut rgb = Vec::with_capacity(w * h * 3);
                for quad in yuyv.chunks_exact(4) {
                    let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                    rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                    rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
                }
                rgb.truncate(w * h * 3);
                rgb_image(width, height, rgb)
            }
            PixelFormat::Nv12 => {
                // Interleaved UV plane, one pair per 2x2 block; odd edges round up
                let luma_len = w * h;
                let chroma_row = w.div_ceil(2) * 2;
                let needed = luma_len + chroma_row * h.div_ceil(2);
                if raw.len() < needed {
                    return Err(DecodeError::Truncated {
                        needed,
                        actual: raw.len(),
                    });
                }
                let (luma, chroma) = raw.split_at(luma_len);
                let mut rgb = Vec::with_capacity(luma_len * 3);
                for (row, line) in luma.chunks_exact(w).enumerate() {
                    let uv_line = &chroma[(row / 2) * chroma_row..][..chroma_row];
                    for (col, &y) in line.iter().enumerate() {
                        let uv = col & !1;
                        rgb.extend_from_slice(&yuv_to_rgb(y, uv_line[uv], uv_line[uv + 1]));
                    }
                }
                rgb_image(width, height, rgb)
            }
            PixelFormat::Mjpeg => decode_jpeg(raw),
        }
    }
}

fn layout(format: &str, pixels: usize) -> DecodeError {
    DecodeError::Layout(format!("{format} buffer does not hold {pixels} pixels"))
}

fn rgb_image(width: u32, height: u32, pixels: Vec<u8>) -> Result<DynamicImage, DecodeError> {
    RgbImage::from_raw(width, height, pixels)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| layout("rgb", width as usize * height as usize))
}

/// Copy `rows` rows of `row_bytes` each out of a buffer with row pitch `stride`
fn packed_rows(
    raw: &[u8],
    row_bytes: usize,
    rows: usize,
    stride: usize,
) -> Result<Vec<u8>, DecodeError> {
    let stride = stride.max(row_bytes);
    let needed = stride * (rows - 1) + row_bytes;
    if raw.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            actual: raw.len(),
        });
    }
    if stride == row_bytes {
        return Ok(raw[..row_bytes * rows].to_vec());
    }
    let mut out = Vec::with_capacity(row_bytes * rows);
    for row in raw.chunks(stride).take(rows) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    Ok(out)
}

fn decode_jpeg(data: &[u8]) -> Result<DynamicImage, DecodeError> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| DecodeError::Jpeg(format!("{e:?}")))?;
    let (w, h) = decoder
        .dimensions()
        .ok_or_else(|| DecodeError::Jpeg("missing dimensions".to_string()))?;
    let (width, height) = (w as u32, h as u32);

    match pixels.len() / (w * h).max(1) {
        1 => GrayImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| layout("jpeg luma", w * h)),
        3 => rgb_image(width, height, pixels),
        channels => Err(DecodeError::Layout(format!(
            "jpeg decoded to {channels} channels"
        ))),
    }
}

/// Convert YUV values to RGB (ITU-R BT.601)
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v, y);
    let g = 0.714_14f32.mul_add(-v, 0.344_14f32.mul_add(-u, y));
    let b = 1.772f32.mul_add(u, y);

    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(format: PixelFormat, width: u32, height: u32) -> FrameMetadata {
        FrameMetadata {
            width,
            height,
            format,
            valid: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_mono8() {
        let raw: Vec<u8> = (0..12).collect();
        let image = StandardDecoder
            .decode(&raw, &meta(PixelFormat::Mono8, 4, 3))
            .unwrap();
        let gray = image.as_luma8().unwrap();
        assert_eq!(gray.get_pixel(1, 2).0, [9]);
    }

    #[test]
    fn test_mono8_with_row_padding() {
        // 2x2 image, rows padded to 4 bytes
        let raw = [1, 2, 0xAA, 0xAA, 3, 4];
        let mut m = meta(PixelFormat::Mono8, 2, 2);
        m.stride = 4;
        let image = StandardDecoder.decode(&raw, &m).unwrap();
        assert_eq!(image.as_luma8().unwrap().as_raw(), &vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_mono12_scaled_to_full_range() {
        let raw = 0x0FFFu16.to_le_bytes().repeat(4);
        let image = StandardDecoder
            .decode(&raw, &meta(PixelFormat::Mono12, 2, 2))
            .unwrap();
        assert_eq!(image.as_luma16().unwrap().get_pixel(0, 0).0, [0xFFF0]);
    }

    #[test]
    fn test_bgr_is_swapped() {
        let raw = [10, 20, 30];
        let image = StandardDecoder
            .decode(&raw, &meta(PixelFormat::Bgr24, 1, 1))
            .unwrap();
        assert_eq!(image.as_rgb8().unwrap().get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        let raw = [100, 128, 200, 128];
        let image = StandardDecoder
            .decode(&raw, &meta(PixelFormat::Yuyv4, 2, 1))
            .unwrap();
        let rgb = image.as_rgb8().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [100, 100, 100]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_nv12_neutral_chroma_is_gray() {
        let mut raw = vec![50u8; 4];
        raw.extend_from_slice(&[128, 128]);
        let image = StandardDecoder
            .decode(&raw, &meta(PixelFormat::Nv12, 2, 2))
            .unwrap();
        assert_eq!(image.as_rgb8().unwrap().get_pixel(1, 1).0, [50, 50, 50]);
    }

    #[test]
    fn test_nv12_odd_dimensions() {
        // 2x3 needs two chroma rows; nine bytes stop short of the second
        assert_eq!(
            StandardDecoder
                .decode(&[128; 9], &meta(PixelFormat::Nv12, 2, 3))
                .unwrap_err(),
            DecodeError::Truncated {
                needed: 10,
                actual: 9
            }
        );

        let mut raw = vec![90u8; 9];
        raw.extend_from_slice(&[128; 8]);
        let image = StandardDecoder
            .decode(&raw, &meta(PixelFormat::Nv12, 3, 3))
            .unwrap();
        assert_eq!(image.as_rgb8().unwrap().get_pixel(2, 2).0, [90, 90, 90]);
    }

    #[test]
    fn test_truncated_buffer() {
        let err = StandardDecoder
            .decode(&[0; 5], &meta(PixelFormat::Rgb24, 2, 1))
            .unwrap_err();
        assert_eq!(err, DecodeError::Truncated { needed: 6, actual: 5 });
    }

    #[test]
    fn test_empty_frame() {
        assert_eq!(
            StandardDecoder
                .decode(&[], &meta(PixelFormat::Mono8, 0, 4))
                .unwrap_err(),
            DecodeError::EmptyFrame
        );
    }

    #[test]
    fn test_garbage_jpeg() {
        assert!(matches!(
            StandardDecoder.decode(&[0, 1, 2, 3], &meta(PixelFormat::Mjpeg, 2, 2)),
            Err(DecodeError::Jpeg(_))
        ));
    }
}
