//! Bounded frame acquisition with scoped stream and indicator teardown

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::capture::CameraSource;
use crate::indicator::{IndicatorGuard, IndicatorSignal};
use crate::sink::{FrameName, FrameSink};
use crate::{CaptureError, Result};

/// Keeps a camera streaming for its lifetime; streaming is disabled on every exit path.
pub struct StreamGuard<'a, C: CameraSource + ?Sized> {
    camera: &'a mut C,
    active: bool,
}

impl<'a, C: CameraSource + ?Sized> StreamGuard<'a, C> {
    pub fn start(camera: &'a mut C) -> Result<Self> {
        camera.start_streaming()?;
        Ok(Self {
            camera,
            active: true,
        })
    }

    pub fn camera(&mut self) -> &mut C {
        &mut *self.camera
    }

    /// Stop streaming, reporting any error instead of logging it.
    pub fn finish(mut self) -> Result<()> {
        self.active = false;
        self.camera.stop_streaming()
    }
}

impl<C: CameraSource + ?Sized> Drop for StreamGuard<'_, C> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.camera.stop_streaming() {
                warn!("Failed to stop camera stream: {}", e);
            }
        }
    }
}

/// What an acquisition run produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionReport {
    pub frames_captured: u64,
    /// Wall time from streaming enabled to the end of the loop
    pub elapsed_wall_secs: f64,
    /// Camera timestamp of the last persisted frame
    pub last_frame_timestamp: Duration,
}

/// Pulls frames from a camera into a timestamp-named [`FrameSink`].
pub struct AcquisitionLoop<'a> {
    sink: &'a FrameSink,
}

impl<'a> AcquisitionLoop<'a> {
    pub fn new(sink: &'a FrameSink) -> Self {
        Self { sink }
    }

    /// Capture exactly `frame_budget` frames.
    ///
    /// Cancellation aborts with [`CaptureError::Cancelled`] after teardown.
    #[instrument(skip_all, fields(budget = frame_budget))]
    pub fn run<C: CameraSource + ?Sized>(
        &self,
        camera: &mut C,
        indicator: &mut dyn IndicatorSignal,
        frame_budget: u64,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionReport> {
        self.acquire(camera, indicator, Some(frame_budget), cancel)
    }

    /// Capture until cancelled; cancellation is the normal end of the run.
    #[instrument(skip_all)]
    pub fn run_until_cancelled<C: CameraSource + ?Sized>(
        &self,
        camera: &mut C,
        indicator: &mut dyn IndicatorSignal,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionReport> {
        self.acquire(camera, indicator, None, cancel)
    }

    fn acquire<C: CameraSource + ?Sized>(
        &self,
        camera: &mut C,
        indicator: &mut dyn IndicatorSignal,
        limit: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionReport> {
        let mut stream = StreamGuard::start(camera)?;
        let indicator = IndicatorGuard::assert(indicator)?;
        let started = Instant::now();

        let mut frames_captured = 0u64;
        let mut last_frame_timestamp = Duration::ZERO;

        while limit.map_or(true, |budget| frames_captured < budget) {
            if cancel.is_cancelled() {
                if limit.is_some() {
                    warn!(
                        "Acquisition cancelled after {} of {:?} frames",
                        frames_captured, limit
                    );
                    return Err(CaptureError::Cancelled);
                }
                break;
            }

            let frame = stream.camera().capture_frame()?;
            self.sink
                .write(&FrameName::Timestamp(frame.timestamp_micros()), &frame)?;
            last_frame_timestamp = frame.timestamp;
            frames_captured += 1;
            metrics::counter!("mocap_frames_captured").increment(1);
        }

        let elapsed_wall_secs = started.elapsed().as_secs_f64();
        drop(indicator);
        stream.finish()?;

        info!("Buffer closed after {} frames", frames_captured);
        Ok(AcquisitionReport {
            frames_captured,
            elapsed_wall_secs,
            last_frame_timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{CameraEvent, SyntheticCamera};
    use crate::capture::{CameraSettings, PixelFormat};
    use crate::indicator::testing::MemoryIndicator;
    use crate::CaptureConfig;
    use std::fs;

    fn camera() -> SyntheticCamera {
        let config = CaptureConfig {
            width: 8,
            height: 6,
            fps: 40,
            format: PixelFormat::Yuyv,
            crop: crate::CropWindow::full(8, 6),
            ..Default::default()
        };
        let mut camera = SyntheticCamera::new();
        camera.configure(&CameraSettings::video_rate(&config)).unwrap();
        camera
    }

    fn file_names(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_captures_exact_budget() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new(dir.path(), "bmp");
        let mut camera = camera();
        let events = camera.events();
        let mut indicator = MemoryIndicator::default();

        let report = AcquisitionLoop::new(&sink)
            .run(&mut camera, &mut indicator, 12, &CancellationToken::new())
            .unwrap();

        assert_eq!(report.frames_captured, 12);
        assert_eq!(report.last_frame_timestamp, Duration::from_millis(275));
        assert!(!camera.is_streaming());
        assert_eq!(indicator.transitions(), vec![true, false]);

        let names = file_names(dir.path());
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "0000000000.bmp");
        assert_eq!(names[11], "0000275000.bmp");

        let stamps: Vec<u64> = names
            .iter()
            .map(|name| {
                let (stem, ext) = name.split_once('.').unwrap();
                assert_eq!(stem.len(), 10);
                assert_eq!(ext, "bmp");
                stem.parse().unwrap()
            })
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

        let events = events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| **e == CameraEvent::Started).count(), 1);
        assert_eq!(events.last(), Some(&CameraEvent::Stopped));
    }

    #[test]
    fn test_zero_budget_still_toggles_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new(dir.path(), "bmp");
        let mut camera = camera();
        let mut indicator = MemoryIndicator::default();

        let report = AcquisitionLoop::new(&sink)
            .run(&mut camera, &mut indicator, 0, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.frames_captured, 0);
        assert!(!camera.is_streaming());
        assert!(!indicator.is_on());
    }

    #[test]
    fn test_cancel_mid_session_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new(dir.path(), "bmp");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut camera = camera().with_hook(move |index| {
            if index == 5 {
                trigger.cancel();
            }
            Ok(())
        });
        let mut indicator = MemoryIndicator::default();

        let err = AcquisitionLoop::new(&sink)
            .run(&mut camera, &mut indicator, 400, &cancel)
            .unwrap_err();

        assert!(matches!(err, CaptureError::Cancelled));
        assert!(!camera.is_streaming());
        assert!(!indicator.is_on());
        assert_eq!(file_names(dir.path()).len(), 6);
    }

    #[test]
    fn test_capture_error_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new(dir.path(), "bmp");
        let mut camera = camera().with_hook(|index| {
            if index == 3 {
                Err(CaptureError::Camera("sensor timeout".into()))
            } else {
                Ok(())
            }
        });
        let mut indicator = MemoryIndicator::default();

        let err = AcquisitionLoop::new(&sink)
            .run(&mut camera, &mut indicator, 10, &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(err, CaptureError::Camera(_)));
        assert!(!camera.is_streaming());
        assert_eq!(indicator.transitions(), vec![true, false]);
    }

    #[test]
    fn test_free_run_ends_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new(dir.path(), "bmp");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut camera = camera().with_hook(move |index| {
            if index == 9 {
                trigger.cancel();
            }
            Ok(())
        });
        let mut indicator = MemoryIndicator::default();

        let report = AcquisitionLoop::new(&sink)
            .run_until_cancelled(&mut camera, &mut indicator, &cancel)
            .unwrap();

        assert_eq!(report.frames_captured, 10);
        assert!(!camera.is_streaming());
        assert!(!indicator.is_on());
    }
}
