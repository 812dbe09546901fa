//! Motion-capture camera client
//!
//! ```bash
//! # Triggered capture against the rendezvous authority
//! mocap-capture sync
//!
//! # Calibration stills into a folder
//! mocap-capture calib /home/pi/calib
//!
//! # Record until Ctrl-C, without camera hardware
//! mocap-capture free --test-source
//!
//! # Hand out one start instant to the configured number of clients
//! mocap-capture authority
//! ```
//!
//! Everything else comes from `mocap.toml` and `MOCAP_*` variables.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mocap_capture::authority::RendezvousAuthority;
use mocap_capture::capture::{CameraSource, SyntheticCamera, V4l2Camera};
use mocap_capture::clock::SystemClock;
use mocap_capture::indicator::{self, IndicatorSignal, NullIndicator};
use mocap_capture::session::calibration::CalibrationPlan;
use mocap_capture::session::{CalibrationSession, FreeRunSession, SyncSession};
use mocap_capture::sink::FrameSink;
use mocap_capture::trigger::TriggerChannel;
use mocap_capture::utils::{self, AUTO_DEVICE};
use mocap_capture::{CaptureConfig, CaptureError, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sync,
    Calibration,
    FreeRun,
    Authority,
}

struct Args {
    mode: Mode,
    test_source: bool,
    /// Calibration output folder, overriding the configured one
    output: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let test_source = args.iter().any(|arg| arg == "--test-source");
        let mut positional = args.iter().filter(|arg| !arg.starts_with("--"));

        let mode = match positional.next().map(String::as_str) {
            Some("sync") | None => Mode::Sync,
            Some("calib") => Mode::Calibration,
            Some("free") => Mode::FreeRun,
            Some("authority") => Mode::Authority,
            Some(other) => {
                return Err(eyre!(
                    "unknown mode {other:?}, expected sync, calib, free or authority"
                ))
            }
        };

        Ok(Self {
            mode,
            test_source,
            output: positional.next().map(PathBuf::from),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mocap_capture=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse()?;
    let mut config = Config::load()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down (Ctrl-C again to abort)");
            interrupt.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Aborted before teardown completed");
            std::process::exit(130);
        }
    });

    if let (Mode::Calibration, Some(output)) = (args.mode, args.output) {
        config.calibration.output_folder = Some(output);
    }
    check_preconditions(args.mode, &config)?;

    match args.mode {
        Mode::Sync => {
            let camera = open_camera(&mut config.capture, args.test_source)?;
            let indicator = open_indicator(&config, args.test_source)?;
            let sink = FrameSink::new(&config.sink.output_dir, &config.sink.video_extension)
                .with_crop(config.capture.crop);

            let summary = SyncSession::new(
                config.capture,
                camera,
                indicator,
                TriggerChannel::new(&config.trigger),
                sink,
                Arc::new(SystemClock),
            )
            .run(cancel)
            .await
            .map_err(log_failure)?;
            info!(
                "Session finished: {} of {} frames, start lag {:.6}s",
                summary.acquisition.frames_captured,
                summary.frame_budget,
                summary.alignment.lag_secs
            );
        }
        Mode::Calibration => {
            let mut camera = open_camera(&mut config.capture, args.test_source)?;
            let format = config.capture.format;
            let extension = config.sink.calibration_extension;
            let calibration = config.calibration;

            let summary = tokio::task::spawn_blocking(move || {
                CalibrationSession::new(camera.as_mut(), &SystemClock, format, extension)
                    .run(&calibration, &cancel)
            })
            .await?
            .map_err(log_failure)?;
            info!("Calibration set written: {} images", summary.images.len());
        }
        Mode::FreeRun => {
            let camera = open_camera(&mut config.capture, args.test_source)?;
            let indicator = open_indicator(&config, args.test_source)?;
            let sink = FrameSink::new(&config.sink.output_dir, &config.sink.video_extension)
                .with_crop(config.capture.crop);

            info!("Press Ctrl-C to stop recording");
            let recorded = FreeRunSession::new(config.capture, camera, indicator, sink)
                .run(cancel)
                .await
                .map_err(log_failure)?;
            info!("Recorded {} frames", recorded.frames_captured);
        }
        Mode::Authority => {
            let authority =
                RendezvousAuthority::bind(&config.authority, Arc::new(SystemClock)).await?;
            let (response, clients) = authority
                .serve_once(&cancel)
                .await
                .map_err(log_failure)?;
            for client in &clients {
                info!("Triggered {} at {:.6}", client.addr, response.start_instant);
            }
        }
    }

    Ok(())
}

/// Reject invalid configuration before any camera or GPIO line is opened.
fn check_preconditions(mode: Mode, config: &Config) -> Result<(), CaptureError> {
    match mode {
        Mode::Sync | Mode::FreeRun => config.capture.validate(),
        Mode::Calibration => CalibrationPlan::from_config(&config.calibration).map(|_| ()),
        Mode::Authority => Ok(()),
    }
}

/// Open the configured camera, probing for one when the device is `auto`.
fn open_camera(config: &mut CaptureConfig, test_source: bool) -> Result<Box<dyn CameraSource>> {
    if test_source {
        info!("Using synthetic camera");
        return Ok(Box::new(SyntheticCamera::new().paced()));
    }

    if config.device == AUTO_DEVICE {
        let found = utils::auto_detect_device()?;
        config.device = found.path;
        config.format = found.format;
    }
    info!("Using capture device: {} ({:?})", config.device, config.format);
    Ok(Box::new(V4l2Camera::open(&config.device, config.buffer_count)?))
}

fn open_indicator(config: &Config, test_source: bool) -> Result<Box<dyn IndicatorSignal>> {
    if test_source {
        return Ok(Box::new(NullIndicator));
    }
    Ok(indicator::from_config(&config.indicator)?)
}

fn log_failure(e: CaptureError) -> CaptureError {
    error!(kind = ?e.kind(), "Session failed: {}", e);
    e
}
