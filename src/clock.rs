//! Wall clock access and start-instant alignment

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{CaptureError, Result};

/// Source of wall-clock time in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How close the local start came to the shared start instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartAlignment {
    /// Seconds between the start instant and the first clock read at or after it
    pub lag_secs: f64,
    /// The start instant had already passed when waiting began
    pub degraded: bool,
}

/// Spin until `clock` reaches `start_instant`.
///
/// The clock is re-read in a tight loop with no sleeping, so the alignment error is
/// bounded by the clock read granularity.
pub fn wait_until(
    clock: &dyn Clock,
    start_instant: f64,
    cancel: &CancellationToken,
) -> Result<StartAlignment> {
    let mut now = clock.now();
    let degraded = now > start_instant;

    while now < start_instant {
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        std::hint::spin_loop();
        now = clock.now();
    }

    let lag_secs = now - start_instant;
    if degraded {
        warn!(
            "Start instant {:.6} already passed {:.6}s ago, starting immediately",
            start_instant, lag_secs
        );
    } else {
        info!("Start delay {:.6}s", lag_secs);
    }

    Ok(StartAlignment { lag_secs, degraded })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::Clock;

    /// Simulated clock that advances by `step` on every read and by the full
    /// duration on every sleep.
    pub(crate) struct ManualClock {
        now: Mutex<f64>,
        step: f64,
    }

    impl ManualClock {
        pub(crate) fn new(start: f64, step: f64) -> Self {
            Self {
                now: Mutex::new(start),
                step,
            }
        }

        /// Current time without advancing
        pub(crate) fn peek(&self) -> f64 {
            *self.now.lock().unwrap()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> f64 {
            let mut now = self.now.lock().unwrap();
            let current = *now;
            *now += self.step;
            current
        }

        fn sleep(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration.as_secs_f64();
        }
    }
}
