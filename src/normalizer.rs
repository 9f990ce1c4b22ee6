//! Frame normalizer
//!
//! Every decode path converges on packed 8-bit RGB in host memory. Frames
//! still on the accelerator are copied out exactly once, here.

use crate::decoder::{DecoderError, FrameMemory, HostImage, Plane, RawFrame, RawPixelFormat};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("Device transfer failed: {0}")]
    Transfer(DecoderError),
    #[error("Invalid frame geometry: {0}")]
    Geometry(String),
}

/// The canonical host pixel format handed to sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed R, G, B bytes, no row padding
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
        }
    }
}

/// Decoded frame ready for the sink
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub payload: Vec<u8>,
    /// Presentation timestamp in milliseconds
    pub pts: i64,
}

impl DecodedFrame {
    /// Wrap the payload as an `image` buffer without copying
    pub fn into_rgb_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.payload)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        self.payload
            .get(idx..idx + 3)
            .map(|px| [px[0], px[1], px[2]])
    }
}

/// Converts raw decoder output to [`DecodedFrame`]
#[derive(Debug, Default)]
pub struct FrameNormalizer {
    device_transfers: u64,
    frames: u64,
}

impl FrameNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, raw: RawFrame) -> Result<DecodedFrame, NormalizeError> {
        let pts = raw.pts;
        let image = match raw.memory {
            FrameMemory::Host(image) => image,
            FrameMemory::Device(surface) => {
                self.device_transfers += 1;
                surface
                    .transfer_to_host()
                    .map_err(NormalizeError::Transfer)?
            }
        };

        let payload = to_rgb24(&image)?;
        self.frames += 1;

        Ok(DecodedFrame {
            width: image.width,
            height: image.height,
            pixel_format: PixelFormat::Rgb24,
            payload,
            pts,
        })
    }

    /// Number of device-to-host copies performed
    pub fn device_transfers(&self) -> u64 {
        self.device_transfers
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Convert any supported host layout to packed RGB24
pub fn to_rgb24(image: &HostImage) -> Result<Vec<u8>, NormalizeError> {
    if image.width == 0 || image.height == 0 {
        return Err(NormalizeError::Geometry(format!(
            "empty frame {}x{}",
            image.width, image.height
        )));
    }
    if image.planes.len() < image.format.plane_count() {
        return Err(NormalizeError::Geometry(format!(
            "{:?} needs {} planes, got {}",
            image.format,
            image.format.plane_count(),
            image.planes.len()
        )));
    }

    let w = image.width as usize;
    let h = image.height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    match image.format {
        RawPixelFormat::Yuv420p => {
            check_plane(&image.planes[0], w, h, "Y")?;
            check_plane(&image.planes[1], cw, ch, "U")?;
            check_plane(&image.planes[2], cw, ch, "V")?;
            Ok(yuv420p_to_rgb(
                &image.planes[0],
                &image.planes[1],
                &image.planes[2],
                w,
                h,
            ))
        }
        RawPixelFormat::Nv12 => {
            check_plane(&image.planes[0], w, h, "Y")?;
            check_plane(&image.planes[1], cw * 2, ch, "UV")?;
            Ok(nv12_to_rgb(&image.planes[0], &image.planes[1], w, h))
        }
        RawPixelFormat::Bgra => {
            check_plane(&image.planes[0], w * 4, h, "BGRA")?;
            Ok(bgra_to_rgb(&image.planes[0], w, h))
        }
        RawPixelFormat::Rgb24 => {
            check_plane(&image.planes[0], w * 3, h, "RGB")?;
            Ok(pack_rows(&image.planes[0], w * 3, h))
        }
    }
}

/// A plane must hold `rows` rows of at least `row_bytes` bytes each
fn check_plane(plane: &Plane, row_bytes: usize, rows: usize, name: &str) -> Result<(), NormalizeError> {
    if plane.stride < row_bytes {
        return Err(NormalizeError::Geometry(format!(
            "{} stride {} shorter than row of {} bytes",
            name, plane.stride, row_bytes
        )));
    }
    let needed = plane.stride * (rows - 1) + row_bytes;
    if plane.data.len() < needed {
        return Err(NormalizeError::Geometry(format!(
            "{} plane has {} bytes, needs {}",
            name,
            plane.data.len(),
            needed
        )));
    }
    Ok(())
}

// YUV to RGB (BT.601, limited range)
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = ((298 * c + 409 * e + 128) >> 8).clamp(0, 255) as u8;
    let g = ((298 * c - 100 * d - 208 * e + 128) >> 8).clamp(0, 255) as u8;
    let b = ((298 * c + 516 * d + 128) >> 8).clamp(0, 255) as u8;
    [r, g, b]
}

fn yuv420p_to_rgb(y_plane: &Plane, u_plane: &Plane, v_plane: &Plane, w: usize, h: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; w * h * 3];

    for row in 0..h {
        let y_row = row * y_plane.stride;
        let u_row = (row / 2) * u_plane.stride;
        let v_row = (row / 2) * v_plane.stride;
        for col in 0..w {
            let px = yuv_to_rgb(
                y_plane.data[y_row + col],
                u_plane.data[u_row + col / 2],
                v_plane.data[v_row + col / 2],
            );
            let idx = (row * w + col) * 3;
            rgb[idx..idx + 3].copy_from_slice(&px);
        }
    }

    rgb
}

fn nv12_to_rgb(y_plane: &Plane, uv_plane: &Plane, w: usize, h: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; w * h * 3];

    for row in 0..h {
        let y_row = row * y_plane.stride;
        let uv_row = (row / 2) * uv_plane.stride;
        for col in 0..w {
            let uv_idx = uv_row + (col / 2) * 2;
            let px = yuv_to_rgb(
                y_plane.data[y_row + col],
                uv_plane.data[uv_idx],
                uv_plane.data[uv_idx + 1],
            );
            let idx = (row * w + col) * 3;
            rgb[idx..idx + 3].copy_from_slice(&px);
        }
    }

    rgb
}

fn bgra_to_rgb(plane: &Plane, w: usize, h: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let start = row * plane.stride;
        for px in plane.data[start..start + w * 4].chunks_exact(4) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    rgb
}

/// Strip row padding
fn pack_rows(plane: &Plane, row_bytes: usize, h: usize) -> Vec<u8> {
    if plane.stride == row_bytes {
        return plane.data[..row_bytes * h].to_vec();
    }
    let mut out = Vec::with_capacity(row_bytes * h);
    for row in 0..h {
        let start = row * plane.stride;
        out.extend_from_slice(&plane.data[start..start + row_bytes]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DeviceSurface;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn yuv420p(w: u32, h: u32, y: u8, u: u8, v: u8) -> HostImage {
        let cw = w.div_ceil(2) as usize;
        let ch = h.div_ceil(2) as usize;
        HostImage {
            format: RawPixelFormat::Yuv420p,
            width: w,
            height: h,
            planes: vec![
                Plane::new(vec![y; (w * h) as usize], w as usize),
                Plane::new(vec![u; cw * ch], cw),
                Plane::new(vec![v; cw * ch], cw),
            ],
        }
    }

    struct CountingSurface {
        image: HostImage,
        transfers: Arc<AtomicUsize>,
    }

    impl DeviceSurface for CountingSurface {
        fn transfer_to_host(&self) -> Result<HostImage, DecoderError> {
            self.transfers.fetch_add(1, Ordering::SeqCst);
            Ok(self.image.clone())
        }
    }

    struct LostSurface;

    impl DeviceSurface for LostSurface {
        fn transfer_to_host(&self) -> Result<HostImage, DecoderError> {
            Err(DecoderError::Structural("surface lost".into()))
        }
    }

    #[test]
    fn test_black_and_white_yuv() {
        let black = to_rgb24(&yuv420p(2, 2, 16, 128, 128)).unwrap();
        assert_eq!(black, vec![0u8; 12]);

        let white = to_rgb24(&yuv420p(2, 2, 235, 128, 128)).unwrap();
        assert_eq!(white, vec![255u8; 12]);
    }

    #[test]
    fn test_nv12_matches_yuv420p() {
        let planar = yuv420p(4, 2, 90, 60, 200);
        let nv12 = HostImage {
            format: RawPixelFormat::Nv12,
            width: 4,
            height: 2,
            planes: vec![
                Plane::new(vec![90; 8], 4),
                Plane::new(vec![60, 200, 60, 200], 4),
            ],
        };
        assert_eq!(to_rgb24(&planar).unwrap(), to_rgb24(&nv12).unwrap());
    }

    #[test]
    fn test_odd_dimensions() {
        let rgb = to_rgb24(&yuv420p(3, 3, 16, 128, 128)).unwrap();
        assert_eq!(rgb.len(), 27);
    }

    #[test]
    fn test_bgra_and_padded_rgb() {
        let bgra = HostImage {
            format: RawPixelFormat::Bgra,
            width: 1,
            height: 1,
            planes: vec![Plane::new(vec![1, 2, 3, 255], 4)],
        };
        assert_eq!(to_rgb24(&bgra).unwrap(), vec![3, 2, 1]);

        // Two rows of one pixel, stride padded to 4 bytes
        let rgb = HostImage {
            format: RawPixelFormat::Rgb24,
            width: 1,
            height: 2,
            planes: vec![Plane::new(vec![1, 2, 3, 0, 4, 5, 6, 0], 4)],
        };
        assert_eq!(to_rgb24(&rgb).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_short_plane_rejected() {
        let mut image = yuv420p(4, 4, 16, 128, 128);
        image.planes[0].data.truncate(10);
        assert!(matches!(to_rgb24(&image), Err(NormalizeError::Geometry(_))));

        image.planes.pop();
        assert!(matches!(to_rgb24(&image), Err(NormalizeError::Geometry(_))));
    }

    #[test]
    fn test_device_and_host_paths_converge() {
        let transfers = Arc::new(AtomicUsize::new(0));
        let mut normalizer = FrameNormalizer::new();

        let from_host = normalizer
            .normalize(RawFrame::host(40, yuv420p(2, 2, 235, 128, 128)))
            .unwrap();
        let surface = CountingSurface {
            image: yuv420p(2, 2, 235, 128, 128),
            transfers: transfers.clone(),
        };
        let from_device = normalizer
            .normalize(RawFrame::device(2, 2, 40, Box::new(surface)))
            .unwrap();

        assert_eq!(from_host, from_device);
        assert_eq!(from_device.pixel_format, PixelFormat::Rgb24);
        assert_eq!(transfers.load(Ordering::SeqCst), 1);
        assert_eq!(normalizer.device_transfers(), 1);
        assert_eq!(normalizer.frames(), 2);
    }

    #[test]
    fn test_transfer_failure_is_reported() {
        let mut normalizer = FrameNormalizer::new();
        let err = normalizer
            .normalize(RawFrame::device(2, 2, 0, Box::new(LostSurface)))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Transfer(DecoderError::Structural(_))));
    }

    #[test]
    fn test_into_rgb_image() {
        let frame = FrameNormalizer::new()
            .normalize(RawFrame::host(0, yuv420p(2, 2, 235, 128, 128)))
            .unwrap();
        assert_eq!(frame.pixel(1, 1), Some([255, 255, 255]));
        assert_eq!(frame.pixel(2, 0), None);
        let image = frame.into_rgb_image().unwrap();
        assert_eq!(image.dimensions(), (2, 2));
    }
}
