use bytes::Bytes;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CaptureError, CropWindow, Result};

/// One captured frame, owned by the loop iteration that produced it
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Camera-clock capture time, relative to the start of the stream
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    /// Bytes per line of the luma-carrying plane
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

/// Pixel layouts with a recoverable luma plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit greyscale
    Gray8,
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
    /// Planar 4:2:0, Y plane first
    Yuv420,
    /// Semi-planar 4:2:0, Y plane first
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel in a luma line
    fn luma_step(self) -> usize {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Gray8 | PixelFormat::Yuv420 | PixelFormat::Nv12 => 1,
        }
    }

    pub fn min_stride(self, width: u32) -> u32 {
        width * self.luma_step() as u32
    }
}

impl FrameRecord {
    /// Timestamp as an integer count of microseconds
    pub fn timestamp_micros(&self) -> u64 {
        self.timestamp.as_micros() as u64
    }

    /// Extract the single-plane luma image, dropping any chroma and line padding.
    pub fn luma(&self) -> Result<GrayImage> {
        let step = self.format.luma_step();
        let stride = self.stride as usize;
        let (width, height) = (self.width as usize, self.height as usize);

        if stride < width * step || self.data.len() < stride * height.saturating_sub(1) + width * step
        {
            return Err(CaptureError::Camera(format!(
                "{:?} frame {}x{} (stride {}) truncated at {} bytes",
                self.format,
                self.width,
                self.height,
                self.stride,
                self.data.len()
            )));
        }

        let mut pixels = Vec::with_capacity(width * height);
        for row in self.data.chunks(stride).take(height) {
            pixels.extend(row.iter().step_by(step).take(width));
        }

        GrayImage::from_raw(self.width, self.height, pixels)
            .ok_or_else(|| CaptureError::Camera("luma buffer size mismatch".into()))
    }

    /// Luma image restricted to `crop`.
    pub fn cropped_luma(&self, crop: &CropWindow) -> Result<GrayImage> {
        crop.check_within(self.width, self.height)?;
        let luma = self.luma()?;
        if *crop == CropWindow::full(self.width, self.height) {
            return Ok(luma);
        }
        Ok(image::imageops::crop_imm(&luma, crop.x, crop.y, crop.width, crop.height).to_image())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuyv_frame() -> FrameRecord {
        // 2x2 YUYV: luma 10, 20 / 30, 40; chroma 128
        let data = vec![10, 128, 20, 128, 30, 128, 40, 128];
        FrameRecord {
            timestamp: Duration::from_micros(1_250),
            width: 2,
            height: 2,
            stride: 4,
            format: PixelFormat::Yuyv,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn test_yuyv_luma() {
        let frame = yuyv_frame();
        assert_eq!(frame.timestamp_micros(), 1_250);
        assert_eq!(frame.luma().unwrap().into_raw(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_padded_planar_luma() {
        // 3x2 Y plane with a 4-byte stride, followed by chroma
        let data = vec![1, 2, 3, 0, 4, 5, 6, 0, 99, 99, 99, 99];
        let frame = FrameRecord {
            timestamp: Duration::ZERO,
            width: 3,
            height: 2,
            stride: 4,
            format: PixelFormat::Yuv420,
            data: Bytes::from(data),
        };
        assert_eq!(frame.luma().unwrap().into_raw(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut frame = yuyv_frame();
        frame.data = frame.data.slice(..6);
        assert!(frame.luma().is_err());
    }

    #[test]
    fn test_cropped_luma() {
        let frame = yuyv_frame();
        let crop = CropWindow { x: 1, y: 0, width: 1, height: 2 };
        assert_eq!(frame.cropped_luma(&crop).unwrap().into_raw(), vec![20, 40]);

        let outside = CropWindow { x: 1, y: 1, width: 2, height: 2 };
        assert!(frame.cropped_luma(&outside).is_err());
    }
}
