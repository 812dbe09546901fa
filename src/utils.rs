use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::{v4l2, PixelFormat};
use crate::{CaptureError, Result};

/// Marker value of `capture.device` that requests probing
pub const AUTO_DEVICE: &str = "auto";

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Formats whose luma plane the sink can persist, in order of preference
const LUMA_FORMATS: [PixelFormat; 4] = [
    PixelFormat::Gray8,
    PixelFormat::Yuyv,
    PixelFormat::Nv12,
    PixelFormat::Yuv420,
];

/// Find the first `/dev/video*` node that captures video in a luma-capable format.
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        match probe(&path) {
            Some(format) => {
                info!("Found {:?} device: {}", format, path);
                return Ok(FoundDevice { path, format });
            }
            None => debug!("Skipping {}", path),
        }
    }

    Err(CaptureError::Precondition(
        "no capture device with a supported format found".into(),
    ))
}

fn probe(path: &str) -> Option<PixelFormat> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return None;
    }
    let offered: Vec<_> = dev.enum_formats().ok()?.into_iter().map(|f| f.fourcc).collect();
    LUMA_FORMATS
        .into_iter()
        .find(|format| offered.contains(&v4l2::fourcc(*format)))
}
