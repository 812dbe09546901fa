//! Untriggered capture that records until the operator interrupts it

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::capture::{CameraSettings, CameraSource};
use crate::indicator::IndicatorSignal;
use crate::session::acquisition::{AcquisitionLoop, AcquisitionReport};
use crate::session::rate::RateReport;
use crate::sink::FrameSink;
use crate::{CaptureConfig, CaptureError, Result};

pub struct FreeRunSession {
    config: CaptureConfig,
    camera: Box<dyn CameraSource>,
    indicator: Box<dyn IndicatorSignal>,
    sink: FrameSink,
}

impl FreeRunSession {
    pub fn new(
        config: CaptureConfig,
        camera: Box<dyn CameraSource>,
        indicator: Box<dyn IndicatorSignal>,
        sink: FrameSink,
    ) -> Self {
        Self {
            config,
            camera,
            indicator,
            sink,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<AcquisitionReport> {
        self.config.validate()?;
        tokio::task::spawn_blocking(move || self.run_blocking(&cancel))
            .await
            .map_err(CaptureError::camera)?
    }

    fn run_blocking(mut self, cancel: &CancellationToken) -> Result<AcquisitionReport> {
        self.camera.configure(&CameraSettings::video_rate(&self.config))?;
        info!("Recording until interrupted");

        let report = AcquisitionLoop::new(&self.sink).run_until_cancelled(
            &mut self.camera,
            self.indicator.as_mut(),
            cancel,
        )?;
        RateReport::from_report(&report).log(self.config.fps);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticCamera;
    use crate::capture::PixelFormat;
    use crate::indicator::testing::MemoryIndicator;
    use crate::CropWindow;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let camera = SyntheticCamera::new().with_hook(move |index| {
            if index == 24 {
                trigger.cancel();
            }
            Ok(())
        });
        let indicator = MemoryIndicator::default();
        let probe = indicator.clone();
        let config = CaptureConfig {
            width: 8,
            height: 8,
            crop: CropWindow::full(8, 8),
            format: PixelFormat::Gray8,
            ..Default::default()
        };

        let report = FreeRunSession::new(
            config,
            Box::new(camera),
            Box::new(indicator),
            FrameSink::new(dir.path(), "bmp"),
        )
        .run(cancel)
        .await
        .unwrap();

        assert_eq!(report.frames_captured, 25);
        assert_eq!(probe.transitions(), vec![true, false]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 25);
    }
}
