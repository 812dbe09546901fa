//! Frame persistence and output directory bookkeeping

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::capture::FrameRecord;
use crate::{CaptureError, CropWindow, Result};

/// Largest timestamp that still renders in 10 digits
pub const MAX_TIMESTAMP_MICROS: u64 = 9_999_999_999;

/// File stem of a persisted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameName {
    /// Camera timestamp in microseconds, zero padded to 10 digits
    Timestamp(u64),
    /// Zero-based still index followed by nine zeros (calibration bag tooling)
    Sequence(u64),
}

impl fmt::Display for FrameName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameName::Timestamp(micros) => write!(f, "{micros:010}"),
            FrameName::Sequence(index) => write!(f, "{index}000000000"),
        }
    }
}

/// Writes luma frames into one directory
#[derive(Debug, Clone)]
pub struct FrameSink {
    dir: PathBuf,
    extension: String,
    crop: Option<CropWindow>,
}

impl FrameSink {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            crop: None,
        }
    }

    /// Persist only `crop` of each frame
    pub fn with_crop(mut self, crop: CropWindow) -> Self {
        self.crop = Some(crop);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &FrameName) -> Result<PathBuf> {
        if let FrameName::Timestamp(micros) = name {
            if *micros > MAX_TIMESTAMP_MICROS {
                return Err(CaptureError::Sink {
                    path: self.dir.clone(),
                    reason: format!("timestamp {micros}us does not fit in 10 digits"),
                });
            }
        }
        Ok(self.dir.join(format!("{name}.{}", self.extension)))
    }

    /// Encode the frame's luma plane and write it in one pass.
    pub fn write(&self, name: &FrameName, frame: &FrameRecord) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        let image = match &self.crop {
            Some(crop) => frame.cropped_luma(crop)?,
            None => frame.luma()?,
        };
        image.save(&path)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

/// Make `dir` an empty, existing directory: create it when absent, purge it otherwise.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(CaptureError::Precondition(format!(
            "{} exists and is not a directory",
            dir.display()
        )));
    }

    if !dir.exists() {
        warn!("{} does not exist, creating directory", dir.display());
        fs::create_dir_all(dir)?;
        return Ok(());
    }

    info!("Removing contents of {}", dir.display());
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Remove a transient file if it exists.
pub fn remove_artifact(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
