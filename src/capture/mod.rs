pub mod frame;
pub mod synthetic;
pub mod v4l2;

pub use frame::FrameRecord;
pub use frame::PixelFormat;
pub use synthetic::SyntheticCamera;
pub use v4l2::V4l2Camera;

use crate::{CaptureConfig, Result};

/// A camera that can be configured, streamed and polled one frame at a time.
///
/// `capture_frame` blocks until the next frame is available and is only valid
/// while streaming.
pub trait CameraSource: Send {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()>;

    fn start_streaming(&mut self) -> Result<()>;

    fn stop_streaming(&mut self) -> Result<()>;

    fn is_streaming(&self) -> bool;

    fn capture_frame(&mut self) -> Result<FrameRecord>;
}

impl<C: CameraSource + ?Sized> CameraSource for Box<C> {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        (**self).configure(settings)
    }

    fn start_streaming(&mut self) -> Result<()> {
        (**self).start_streaming()
    }

    fn stop_streaming(&mut self) -> Result<()> {
        (**self).stop_streaming()
    }

    fn is_streaming(&self) -> bool {
        (**self).is_streaming()
    }

    fn capture_frame(&mut self) -> Result<FrameRecord> {
        (**self).capture_frame()
    }
}

/// Sensor configuration requested from a camera. `None` leaves a control untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub sensor_mode: Option<u32>,
    pub analog_gain: Option<f32>,
    pub digital_gain: Option<f32>,
    pub manual_focus: bool,
    pub saturation: Option<f32>,
    pub auto_exposure: Option<bool>,
    pub auto_white_balance: Option<bool>,
}

impl CameraSettings {
    /// Settings for the synchronized video-rate client
    pub fn video_rate(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            format: config.format,
            sensor_mode: Some(config.sensor_mode),
            analog_gain: Some(config.analog_gain),
            digital_gain: Some(config.digital_gain),
            manual_focus: false,
            saturation: None,
            auto_exposure: None,
            auto_white_balance: None,
        }
    }

    /// Manual focus, desaturated preview; exposure and white balance left automatic to settle
    pub fn calibration_preview(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fps: 30,
            format,
            sensor_mode: None,
            analog_gain: None,
            digital_gain: None,
            manual_focus: true,
            saturation: Some(0.0),
            auto_exposure: None,
            auto_white_balance: None,
        }
    }

    /// Preview settings with auto exposure and auto white balance locked
    pub fn calibration_recording(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            auto_exposure: Some(false),
            auto_white_balance: Some(false),
            ..Self::calibration_preview(width, height, format)
        }
    }
}
