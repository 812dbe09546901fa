//! Deterministic camera source for tests and `--test-source` runs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::capture::frame::{FrameRecord, PixelFormat};
use crate::capture::{CameraSettings, CameraSource};
use crate::{CaptureError, Result};

/// Lifecycle calls observed by a [`SyntheticCamera`]
#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    Configured(CameraSettings),
    Started,
    Stopped,
    Captured(u64),
}

type FrameHook = Box<dyn FnMut(u64) -> Result<()> + Send>;

/// Generates gradient frames spaced exactly `1/fps` apart on the camera clock.
pub struct SyntheticCamera {
    settings: Option<CameraSettings>,
    streaming: bool,
    /// Frame index within the current stream
    index: u64,
    /// Sleep for one frame interval per capture, like a real sensor
    paced: bool,
    events: Arc<Mutex<Vec<CameraEvent>>>,
    hook: Option<FrameHook>,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            settings: None,
            streaming: false,
            index: 0,
            paced: false,
            events: Arc::new(Mutex::new(Vec::new())),
            hook: None,
        }
    }

    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    /// Run `hook` with the frame index before each capture; an error fails that capture.
    pub fn with_hook(mut self, hook: impl FnMut(u64) -> Result<()> + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Shared handle to the lifecycle log, usable after the camera is moved.
    pub fn events(&self) -> Arc<Mutex<Vec<CameraEvent>>> {
        Arc::clone(&self.events)
    }

    fn record(&self, event: CameraEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn render(settings: &CameraSettings, index: u64) -> (u32, Bytes) {
        let (width, height) = (settings.width as usize, settings.height as usize);
        let shade = |x: usize, y: usize| ((x + y + index as usize) % 256) as u8;

        match settings.format {
            PixelFormat::Yuyv => {
                let mut data = Vec::with_capacity(width * height * 2);
                for y in 0..height {
                    for x in 0..width {
                        data.push(shade(x, y));
                        data.push(128);
                    }
                }
                (settings.width * 2, Bytes::from(data))
            }
            PixelFormat::Gray8 | PixelFormat::Yuv420 | PixelFormat::Nv12 => {
                let mut data = Vec::with_capacity(width * height * 3 / 2);
                for y in 0..height {
                    data.extend((0..width).map(|x| shade(x, y)));
                }
                if settings.format != PixelFormat::Gray8 {
                    data.resize(width * height * 3 / 2, 128);
                }
                (settings.width, Bytes::from(data))
            }
        }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraSource for SyntheticCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        if self.streaming {
            return Err(CaptureError::Camera(
                "cannot reconfigure while streaming".into(),
            ));
        }
        info!(
            "Synthetic camera {}x{} {:?} @ {} fps",
            settings.width, settings.height, settings.format, settings.fps
        );
        self.settings = Some(settings.clone());
        self.record(CameraEvent::Configured(settings.clone()));
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        if self.settings.is_none() {
            return Err(CaptureError::Camera("camera not configured".into()));
        }
        if !self.streaming {
            self.streaming = true;
            self.index = 0;
            self.record(CameraEvent::Started);
        }
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        if self.streaming {
            self.streaming = false;
            self.record(CameraEvent::Stopped);
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn capture_frame(&mut self) -> Result<FrameRecord> {
        if !self.streaming {
            return Err(CaptureError::Camera("Stream not started".into()));
        }
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| CaptureError::Camera("camera not configured".into()))?;

        if let Some(hook) = self.hook.as_mut() {
            hook(self.index)?;
        }

        let interval = Duration::from_secs(1) / settings.fps.max(1);
        if self.paced {
            std::thread::sleep(interval);
        }

        let index = self.index;
        let (stride, data) = Self::render(&settings, index);
        self.index += 1;
        self.record(CameraEvent::Captured(index));

        Ok(FrameRecord {
            timestamp: interval * index as u32,
            width: settings.width,
            height: settings.height,
            stride,
            format: settings.format,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(format: PixelFormat) -> CameraSettings {
        CameraSettings {
            width: 4,
            height: 3,
            fps: 40,
            format,
            sensor_mode: None,
            analog_gain: None,
            digital_gain: None,
            manual_focus: false,
            saturation: None,
            auto_exposure: None,
            auto_white_balance: None,
        }
    }

    #[test]
    fn test_frames_require_streaming() {
        let mut camera = SyntheticCamera::new();
        assert!(camera.start_streaming().is_err());

        camera.configure(&settings(PixelFormat::Yuyv)).unwrap();
        assert!(camera.capture_frame().is_err());

        camera.start_streaming().unwrap();
        assert!(camera.is_streaming());
        assert!(camera.configure(&settings(PixelFormat::Gray8)).is_err());
    }

    #[test]
    fn test_timestamps_follow_frame_interval() {
        let mut camera = SyntheticCamera::new();
        camera.configure(&settings(PixelFormat::Yuyv)).unwrap();
        camera.start_streaming().unwrap();

        let stamps: Vec<u64> = (0..3)
            .map(|_| camera.capture_frame().unwrap().timestamp_micros())
            .collect();
        assert_eq!(stamps, vec![0, 25_000, 50_000]);

        // Restarting the stream resets the camera-local epoch
        camera.stop_streaming().unwrap();
        camera.start_streaming().unwrap();
        assert_eq!(camera.capture_frame().unwrap().timestamp_micros(), 0);
    }

    #[test]
    fn test_luma_is_recoverable_for_every_format() {
        for format in [
            PixelFormat::Gray8,
            PixelFormat::Yuyv,
            PixelFormat::Yuv420,
            PixelFormat::Nv12,
        ] {
            let mut camera = SyntheticCamera::new();
            camera.configure(&settings(format)).unwrap();
            camera.start_streaming().unwrap();
            let luma = camera.capture_frame().unwrap().luma().unwrap();
            assert_eq!(luma.dimensions(), (4, 3));
            assert_eq!(luma.get_pixel(3, 2).0[0], 5);
        }
    }

    #[test]
    fn test_events_are_recorded() {
        let mut camera = SyntheticCamera::new();
        let events = camera.events();
        camera.configure(&settings(PixelFormat::Gray8)).unwrap();
        camera.start_streaming().unwrap();
        camera.capture_frame().unwrap();
        camera.stop_streaming().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[1], CameraEvent::Started);
        assert_eq!(events[2], CameraEvent::Captured(0));
        assert_eq!(events[3], CameraEvent::Stopped);
    }
}
