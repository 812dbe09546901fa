//! Still-image capture for intrinsic calibration

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::capture::{CameraSettings, CameraSource, PixelFormat};
use crate::clock::Clock;
use crate::session::acquisition::StreamGuard;
use crate::sink::{self, FrameName, FrameSink};
use crate::{CalibrationConfig, CaptureError, Result};

/// Transient recording artifact left by backends that record the backing stream
pub const BACKING_ARTIFACT: &str = "video_tmp.h264";

const BAR_LENGTH: usize = 40;

/// Upper bound on the number of stills in one set
pub const MAX_IMAGES: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    ValidatingOutput,
    WarmingUp,
    Recording,
    Capturing { index: u64 },
    Finalizing,
    Done,
}

/// Validated calibration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationPlan {
    pub output: PathBuf,
    pub capture_delay: Duration,
    pub num_images: u64,
    pub width: u32,
    pub height: u32,
    pub settle: Duration,
}

impl CalibrationPlan {
    pub fn from_config(config: &CalibrationConfig) -> Result<Self> {
        let output = config.output_folder.clone().ok_or_else(|| {
            CaptureError::Precondition("calibration output folder is required".into())
        })?;
        let capture_delay = u64::try_from(config.capture_delay).map_err(|_| {
            CaptureError::Precondition(format!(
                "capture delay {} must be a non-negative integer",
                config.capture_delay
            ))
        })?;
        let num_images = u64::try_from(config.num_images)
            .ok()
            .filter(|n| *n <= MAX_IMAGES)
            .ok_or_else(|| {
                CaptureError::Precondition(format!(
                    "number of images {} must be between 0 and {}",
                    config.num_images, MAX_IMAGES
                ))
            })?;
        if config.width == 0 || config.height == 0 {
            return Err(CaptureError::Precondition(format!(
                "image size {}x{} must be non-zero",
                config.width, config.height
            )));
        }

        Ok(Self {
            output,
            capture_delay: Duration::from_secs(capture_delay),
            num_images,
            width: config.width,
            height: config.height,
            settle: Duration::from_secs(config.settle_secs),
        })
    }
}

/// Files written by a completed calibration run
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSummary {
    pub images: Vec<PathBuf>,
}

#[derive(Debug)]
struct StateLog {
    current: CalibrationState,
    history: Vec<CalibrationState>,
}

impl StateLog {
    fn enter(&mut self, state: CalibrationState) {
        debug!("Calibration state {:?} -> {:?}", self.current, state);
        self.current = state;
        self.history.push(state);
    }
}

/// Drives a camera through warm-up, recording and timed still capture.
pub struct CalibrationSession<'a> {
    camera: &'a mut dyn CameraSource,
    clock: &'a dyn Clock,
    format: PixelFormat,
    extension: String,
    log: StateLog,
    show_progress: bool,
}

impl<'a> CalibrationSession<'a> {
    pub fn new(
        camera: &'a mut dyn CameraSource,
        clock: &'a dyn Clock,
        format: PixelFormat,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            camera,
            clock,
            format,
            extension: extension.into(),
            log: StateLog {
                current: CalibrationState::Idle,
                history: vec![CalibrationState::Idle],
            },
            show_progress: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    pub fn state(&self) -> CalibrationState {
        self.log.current
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[CalibrationState] {
        &self.log.history
    }

    /// Validate `config` and run the whole capture. Nothing touches the camera or the
    /// output folder until every parameter has been checked.
    #[instrument(skip_all)]
    pub fn run(
        &mut self,
        config: &CalibrationConfig,
        cancel: &CancellationToken,
    ) -> Result<CalibrationSummary> {
        self.log.enter(CalibrationState::ValidatingOutput);
        let plan = CalibrationPlan::from_config(config)?;
        sink::prepare_output_dir(&plan.output)?;

        info!("Capturing calibration image set");
        self.warm_up(&plan)?;

        self.log.enter(CalibrationState::Recording);
        self.camera.configure(&CameraSettings::calibration_recording(
            plan.width,
            plan.height,
            self.format,
        ))?;

        let images = self.capture_stills(&plan, cancel)?;

        self.log.enter(CalibrationState::Done);
        info!("Capturing completed, {} images", images.len());
        Ok(CalibrationSummary { images })
    }

    fn warm_up(&mut self, plan: &CalibrationPlan) -> Result<()> {
        self.log.enter(CalibrationState::WarmingUp);
        self.camera.configure(&CameraSettings::calibration_preview(
            plan.width,
            plan.height,
            self.format,
        ))?;

        info!("Starting camera warm-up");
        let stream = StreamGuard::start(&mut *self.camera)?;
        self.clock.sleep(plan.settle);
        stream.finish()?;
        info!("Camera warm-up complete");
        Ok(())
    }

    fn capture_stills(
        &mut self,
        plan: &CalibrationPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let frames = FrameSink::new(&plan.output, self.extension.clone());
        let mut images = Vec::new();

        // The backing stream keeps the sensor in streaming mode between stills
        let mut stream = StreamGuard::start(&mut *self.camera)?;
        info!("Recording started. Capturing still images");

        let mut outcome = Ok(());
        for index in 0..plan.num_images {
            if cancel.is_cancelled() {
                outcome = Err(CaptureError::Cancelled);
                break;
            }
            self.log.enter(CalibrationState::Capturing { index });
            if self.show_progress {
                print_progress(index + 1, plan.num_images);
            }

            let written = stream
                .camera()
                .capture_frame()
                .and_then(|frame| frames.write(&FrameName::Sequence(index), &frame));
            match written {
                Ok(path) => images.push(path),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
            self.clock.sleep(plan.capture_delay);
        }
        if self.show_progress && plan.num_images > 0 {
            eprintln!();
        }

        self.log.enter(CalibrationState::Finalizing);
        let stopped = stream.finish();
        let removed = sink::remove_artifact(&plan.output.join(BACKING_ARTIFACT));

        outcome?;
        stopped?;
        removed?;
        Ok(images)
    }
}

/// `[====----] image i of n` with a fixed 40-cell bar
pub fn progress_line(captured: u64, total: u64) -> String {
    let filled = if total == 0 {
        BAR_LENGTH
    } else {
        (BAR_LENGTH as u64 * captured / total) as usize
    };
    format!(
        "[INFO] Capturing still images: [{}{}] image {} of {} captured",
        "=".repeat(filled),
        "-".repeat(BAR_LENGTH - filled),
        captured,
        total
    )
}

fn print_progress(captured: u64, total: u64) {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "{}\r", progress_line(captured, total));
    let _ = stderr.flush();
}
