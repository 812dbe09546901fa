pub mod acquisition;
pub mod calibration;
pub mod free_run;
pub mod rate;
pub mod sync;

pub use acquisition::{AcquisitionLoop, AcquisitionReport, StreamGuard};
pub use calibration::{CalibrationSession, CalibrationState, CalibrationSummary};
pub use free_run::FreeRunSession;
pub use rate::RateReport;
pub use sync::{SyncSession, SyncSummary};
