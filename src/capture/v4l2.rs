//! V4L2 camera source with memory-mapped streaming

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{FrameRecord, PixelFormat};
use crate::capture::{CameraSettings, CameraSource};
use crate::{CaptureError, Result};

const V4L2_CID_SATURATION: u32 = 0x0098_0902;
const V4L2_CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_FOCUS_AUTO: u32 = 0x009a_090c;
const V4L2_CID_ANALOGUE_GAIN: u32 = 0x009e_0903;
const V4L2_CID_DIGITAL_GAIN: u32 = 0x009f_0905;

const V4L2_EXPOSURE_AUTO: i64 = 0;
const V4L2_EXPOSURE_MANUAL: i64 = 1;

/// Shortest wait for a frame before the sensor is considered stalled
const MIN_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a dequeue may block: four frame intervals, at least [`MIN_FRAME_TIMEOUT`].
fn frame_timeout(fps: u32) -> Duration {
    (Duration::from_secs(4) / fps.max(1)).max(MIN_FRAME_TIMEOUT)
}

fn dequeue_error(path: &str, timeout: Duration, err: io::Error) -> CaptureError {
    if err.kind() == io::ErrorKind::TimedOut {
        CaptureError::Camera(format!("no frame from {path} within {timeout:?}"))
    } else {
        err.into()
    }
}

pub(crate) fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Gray8 => FourCC::new(b"GREY"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
        PixelFormat::Yuv420 => FourCC::new(b"YU12"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
    }
}

/// Camera backed by a V4L2 capture device
pub struct V4l2Camera {
    device: Box<Device>,
    path: String,
    stream: Option<MmapStream<'static>>,
    buffer_count: u32,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    frame_timeout: Duration,
    /// Driver timestamp of the first frame of the current stream
    epoch: Option<Duration>,
}

impl V4l2Camera {
    pub fn open(path: &str, buffer_count: u32) -> Result<Self> {
        info!("Opening V4L2 camera: {}", path);

        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Camera(format!(
                "{path} doesn't support video capture"
            )));
        }

        Ok(Self {
            device: Box::new(device),
            path: path.to_string(),
            stream: None,
            buffer_count,
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::Yuyv,
            frame_timeout: MIN_FRAME_TIMEOUT,
            epoch: None,
        })
    }

    fn apply_control(&self, name: &str, id: u32, value: Value) {
        debug!("Setting {} = {:?}", name, value);
        if let Err(e) = self.device.set_control(Control { id, value }) {
            warn!("{}: control {} not applied: {}", self.path, name, e);
        }
    }

    fn apply_controls(&self, settings: &CameraSettings) {
        if let Some(gain) = settings.analog_gain {
            self.apply_control(
                "analogue_gain",
                V4L2_CID_ANALOGUE_GAIN,
                Value::Integer(gain.round() as i64),
            );
        }
        if let Some(gain) = settings.digital_gain {
            self.apply_control(
                "digital_gain",
                V4L2_CID_DIGITAL_GAIN,
                Value::Integer(gain.round() as i64),
            );
        }
        if settings.manual_focus {
            self.apply_control("focus_auto", V4L2_CID_FOCUS_AUTO, Value::Boolean(false));
        }
        if let Some(saturation) = settings.saturation {
            self.apply_control(
                "saturation",
                V4L2_CID_SATURATION,
                Value::Integer(saturation.round() as i64),
            );
        }
        if let Some(auto) = settings.auto_exposure {
            let mode = if auto {
                V4L2_EXPOSURE_AUTO
            } else {
                V4L2_EXPOSURE_MANUAL
            };
            self.apply_control("exposure_auto", V4L2_CID_EXPOSURE_AUTO, Value::Integer(mode));
        }
        if let Some(auto) = settings.auto_white_balance {
            self.apply_control(
                "white_balance_auto",
                V4L2_CID_AUTO_WHITE_BALANCE,
                Value::Boolean(auto),
            );
        }
    }
}

impl CameraSource for V4l2Camera {
    #[instrument(skip(self), fields(device = %self.path))]
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        if self.stream.is_some() {
            return Err(CaptureError::Camera(
                "cannot reconfigure while streaming".into(),
            ));
        }

        let mut fmt = self.device.format()?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = fourcc(settings.format);
        let actual = self.device.set_format(&fmt)?;

        if actual.fourcc != fmt.fourcc {
            return Err(CaptureError::Camera(format!(
                "device rejected {:?} (negotiated {})",
                settings.format, actual.fourcc
            )));
        }
        if actual.width != settings.width || actual.height != settings.height {
            warn!(
                "Requested {}x{}, device negotiated {}x{}",
                settings.width, settings.height, actual.width, actual.height
            );
        }

        let params = self.device.set_params(&Parameters::with_fps(settings.fps))?;
        debug!("Frame interval: {:?}", params.interval);

        // V4L2 has no sensor mode selector; the mode only travels in the handshake.
        if let Some(mode) = settings.sensor_mode {
            debug!("Sensor mode {} requested", mode);
        }

        self.apply_controls(settings);

        self.width = actual.width;
        self.height = actual.height;
        self.stride = actual.stride.max(settings.format.min_stride(actual.width));
        self.format = settings.format;
        self.frame_timeout = frame_timeout(settings.fps);

        info!(
            "Configured {}x{} {:?} @ {} fps",
            self.width, self.height, self.format, settings.fps
        );
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.width == 0 {
            return Err(CaptureError::Camera("camera not configured".into()));
        }

        let mut stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        // Without a timeout a stalled sensor blocks the dequeue forever
        stream.set_timeout(self.frame_timeout);
        self.stream = Some(stream);
        self.epoch = None;
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        // Dropping the stream issues VIDIOC_STREAMOFF and unmaps the buffers
        if self.stream.take().is_some() {
            info!("Capture stream stopped");
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    fn capture_frame(&mut self) -> Result<FrameRecord> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Camera("Stream not started".into()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| dequeue_error(&self.path, self.frame_timeout, e))?;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let data = Bytes::copy_from_slice(&buf[..used]);

        let device_time = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);
        let epoch = *self.epoch.get_or_insert(device_time);

        Ok(FrameRecord {
            timestamp: device_time.saturating_sub(epoch),
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            data,
        })
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        let _ = self.stop_streaming();
    }
}
