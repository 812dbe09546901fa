use tracing::{info, warn};

use super::acquisition::AcquisitionReport;

/// Relative disagreement between the two estimates above which a warning is logged
pub const DIVERGENCE_WARN: f64 = 0.05;

/// Post-hoc throughput estimates; diagnostic only, never fed back into control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    /// Frames over the camera timestamp of the last frame
    pub timestamp_fps: Option<f64>,
    /// Frames over wall time spent in the acquisition loop
    pub wall_fps: Option<f64>,
}

fn ratio(frames: u64, secs: f64) -> Option<f64> {
    (secs > 0.0).then(|| frames as f64 / secs)
}

impl RateReport {
    pub fn from_report(report: &AcquisitionReport) -> Self {
        Self {
            timestamp_fps: ratio(
                report.frames_captured,
                report.last_frame_timestamp.as_secs_f64(),
            ),
            wall_fps: ratio(report.frames_captured, report.elapsed_wall_secs),
        }
    }

    /// Relative difference between the two estimates
    pub fn divergence(&self) -> Option<f64> {
        let (pts, wall) = (self.timestamp_fps?, self.wall_fps?);
        Some((pts - wall).abs() / pts.max(wall))
    }

    pub fn log(&self, requested_fps: u32) {
        let fmt = |fps: Option<f64>| fps.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"));
        info!(
            "[RESULTS] {} FPS (PTS) and {} FPS (time lib), {} requested",
            fmt(self.timestamp_fps),
            fmt(self.wall_fps),
            requested_fps
        );

        if let Some(divergence) = self.divergence() {
            metrics::gauge!("mocap_rate_divergence").set(divergence);
            if divergence > DIVERGENCE_WARN {
                warn!(
                    "Rate estimates diverge by {:.1}%: dropped frames or clock drift",
                    divergence * 100.0
                );
            }
        }
        if let Some(wall) = self.wall_fps {
            if wall < f64::from(requested_fps) * (1.0 - DIVERGENCE_WARN) {
                warn!("Achieved {:.2} FPS, below the requested {}", wall, requested_fps);
            }
        }
    }
}
