//! Synchronized video-rate capture: handshake, aligned start, bounded acquisition

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::capture::{CameraSettings, CameraSource};
use crate::clock::{self, Clock, StartAlignment};
use crate::indicator::IndicatorSignal;
use crate::session::acquisition::{AcquisitionLoop, AcquisitionReport};
use crate::session::rate::RateReport;
use crate::sink::FrameSink;
use crate::trigger::{TriggerChannel, TriggerRequest, TriggerResponse};
use crate::{CaptureConfig, CaptureError, Result};

/// Outcome of a completed synchronized session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSummary {
    pub trigger: TriggerResponse,
    pub frame_budget: u64,
    pub alignment: StartAlignment,
    pub acquisition: AcquisitionReport,
    pub rates: RateReport,
}

/// One capture client's session; owns its camera and indicator for its lifetime.
pub struct SyncSession {
    config: CaptureConfig,
    camera: Box<dyn CameraSource>,
    indicator: Box<dyn IndicatorSignal>,
    trigger: TriggerChannel,
    sink: FrameSink,
    clock: Arc<dyn Clock>,
}

impl SyncSession {
    pub fn new(
        config: CaptureConfig,
        camera: Box<dyn CameraSource>,
        indicator: Box<dyn IndicatorSignal>,
        trigger: TriggerChannel,
        sink: FrameSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            camera,
            indicator,
            trigger,
            sink,
            clock,
        }
    }

    /// Run the full session on a blocking thread; the handshake uses the current runtime.
    pub async fn run(self, cancel: CancellationToken) -> Result<SyncSummary> {
        self.config.validate()?;
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || self.run_blocking(&handle, &cancel))
            .await
            .map_err(CaptureError::camera)?
    }

    #[instrument(skip_all, fields(fps = self.config.fps))]
    fn run_blocking(mut self, handle: &Handle, cancel: &CancellationToken) -> Result<SyncSummary> {
        if let Some(core) = self.config.pin_core {
            pin_current_thread(core);
        }

        info!(
            "Size {}x{}, FPS {}, mode {}",
            self.config.width, self.config.height, self.config.fps, self.config.sensor_mode
        );
        self.camera.configure(&CameraSettings::video_rate(&self.config))?;
        self.clock.sleep(Duration::from_secs(self.config.warm_up_secs));

        let request = TriggerRequest::from(&self.config);
        let trigger = handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(CaptureError::Cancelled),
                response = self.trigger.negotiate(&request) => response,
            }
        })?;
        let frame_budget = trigger.frame_budget(self.config.fps);
        info!("Waiting for trigger, budget {} frames", frame_budget);

        let alignment = clock::wait_until(self.clock.as_ref(), trigger.start_instant, cancel)?;

        let acquisition = AcquisitionLoop::new(&self.sink).run(
            &mut self.camera,
            self.indicator.as_mut(),
            frame_budget,
            cancel,
        )?;

        let rates = RateReport::from_report(&acquisition);
        rates.log(self.config.fps);

        Ok(SyncSummary {
            trigger,
            frame_budget,
            alignment,
            acquisition,
            rates,
        })
    }
}

fn pin_current_thread(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        info!("Capture thread pinned to core {}", core);
    } else {
        warn!("Could not pin capture thread to core {}", core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::RendezvousAuthority;
    use crate::capture::synthetic::{CameraEvent, SyntheticCamera};
    use crate::capture::PixelFormat;
    use crate::clock::SystemClock;
    use crate::indicator::testing::MemoryIndicator;
    use crate::{AuthorityConfig, CropWindow, TriggerConfig};

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            width: 16,
            height: 12,
            fps: 20,
            crop: CropWindow {
                x: 0,
                y: 2,
                width: 16,
                height: 8,
            },
            format: PixelFormat::Yuyv,
            warm_up_secs: 0,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_against_loopback_authority() {
        let authority = RendezvousAuthority::bind(
            &AuthorityConfig {
                bind: "127.0.0.1:0".into(),
                expected_clients: 1,
                lead_secs: 0.2,
                duration_secs: 2,
            },
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        let port = authority.local_addr().unwrap().port();
        let serve_cancel = CancellationToken::new();
        let server = tokio::spawn(async move { authority.serve_once(&serve_cancel).await });

        let dir = tempfile::tempdir().unwrap();
        let camera = SyntheticCamera::new();
        let events = camera.events();
        let indicator = MemoryIndicator::default();
        let probe = indicator.clone();

        let session = SyncSession::new(
            small_config(),
            Box::new(camera),
            Box::new(indicator),
            TriggerChannel::new(&TriggerConfig {
                host: "127.0.0.1".into(),
                port,
                timeout_secs: 5,
                buffer_size: 1024,
            }),
            FrameSink::new(dir.path(), "bmp").with_crop(small_config().crop),
            Arc::new(SystemClock),
        );

        let summary = session.run(CancellationToken::new()).await.unwrap();
        let (served, _) = server.await.unwrap().unwrap();

        assert_eq!(summary.trigger, served);
        assert_eq!(summary.frame_budget, 40);
        assert_eq!(summary.acquisition.frames_captured, 40);
        assert!(summary.alignment.lag_secs >= 0.0);
        assert_eq!(probe.transitions(), vec![true, false]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 40);

        let first = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert_eq!(image::open(first).unwrap().to_luma8().dimensions(), (16, 8));

        let events = events.lock().unwrap();
        assert!(matches!(events[0], CameraEvent::Configured(_)));
        assert_eq!(events.last(), Some(&CameraEvent::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_coordination_failure_never_streams() {
        // Nothing answers on this socket
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let camera = SyntheticCamera::new();
        let events = camera.events();
        let indicator = MemoryIndicator::default();
        let probe = indicator.clone();

        let session = SyncSession::new(
            small_config(),
            Box::new(camera),
            Box::new(indicator),
            TriggerChannel::new(&TriggerConfig {
                host: "127.0.0.1".into(),
                port,
                ..Default::default()
            })
            .with_timeout(Duration::from_millis(100)),
            FrameSink::new(dir.path(), "bmp"),
            Arc::new(SystemClock),
        );

        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CaptureError::Timeout(_)));
        assert!(probe.transitions().is_empty());
        assert!(!events.lock().unwrap().contains(&CameraEvent::Started));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_config_rejected_before_camera() {
        let camera = SyntheticCamera::new();
        let events = camera.events();
        let config = CaptureConfig {
            crop: CropWindow::full(32, 32),
            ..small_config()
        };

        let session = SyncSession::new(
            config,
            Box::new(camera),
            Box::new(MemoryIndicator::default()),
            TriggerChannel::new(&TriggerConfig::default()),
            FrameSink::new("/nonexistent", "bmp"),
            Arc::new(SystemClock),
        );

        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CaptureError::Precondition(_)));
        assert!(events.lock().unwrap().is_empty());
    }
}
