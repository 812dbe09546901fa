//! Binary status indicator (recording LED)

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{CaptureError, IndicatorBackend, IndicatorConfig, Result};

const GPIO_ROOT: &str = "/sys/class/gpio";

/// A single on/off output
pub trait IndicatorSignal: Send {
    fn set(&mut self, on: bool) -> Result<()>;
}

impl<I: IndicatorSignal + ?Sized> IndicatorSignal for Box<I> {
    fn set(&mut self, on: bool) -> Result<()> {
        (**self).set(on)
    }
}

/// Build the indicator selected in the configuration.
pub fn from_config(config: &IndicatorConfig) -> Result<Box<dyn IndicatorSignal>> {
    match config.backend {
        IndicatorBackend::Sysfs => Ok(Box::new(SysfsIndicator::export(config.line)?)),
        IndicatorBackend::None => Ok(Box::new(NullIndicator)),
    }
}

/// Indicator that only logs its transitions
#[derive(Debug, Default)]
pub struct NullIndicator;

impl IndicatorSignal for NullIndicator {
    fn set(&mut self, on: bool) -> Result<()> {
        debug!("Indicator {}", if on { "on" } else { "off" });
        Ok(())
    }
}

/// GPIO output line driven through the sysfs interface
#[derive(Debug)]
pub struct SysfsIndicator {
    line: u32,
    value_path: PathBuf,
}

impl SysfsIndicator {
    pub fn export(line: u32) -> Result<Self> {
        Self::export_under(PathBuf::from(GPIO_ROOT), line)
    }

    fn export_under(root: PathBuf, line: u32) -> Result<Self> {
        let line_dir = root.join(format!("gpio{line}"));

        if !line_dir.exists() {
            fs::write(root.join("export"), line.to_string()).map_err(|e| {
                CaptureError::Precondition(format!("cannot export GPIO line {line}: {e}"))
            })?;
            // udev applies permissions to the new line asynchronously
            for _ in 0..50 {
                if line_dir.join("direction").exists() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }

        fs::write(line_dir.join("direction"), "out").map_err(|e| {
            CaptureError::Precondition(format!("cannot drive GPIO line {line}: {e}"))
        })?;

        info!("Indicator on GPIO line {}", line);
        Ok(Self {
            line,
            value_path: line_dir.join("value"),
        })
    }
}

impl IndicatorSignal for SysfsIndicator {
    fn set(&mut self, on: bool) -> Result<()> {
        fs::write(&self.value_path, if on { "1" } else { "0" })?;
        debug!("GPIO {} -> {}", self.line, on as u8);
        Ok(())
    }
}

impl Drop for SysfsIndicator {
    fn drop(&mut self) {
        if let Err(e) = self.set(false) {
            warn!("Failed to clear GPIO {}: {}", self.line, e);
        }
    }
}

/// Asserts an indicator for its lifetime and deasserts it on every exit path.
pub struct IndicatorGuard<'a> {
    signal: &'a mut dyn IndicatorSignal,
}

impl<'a> IndicatorGuard<'a> {
    pub fn assert(signal: &'a mut dyn IndicatorSignal) -> Result<Self> {
        signal.set(true)?;
        info!("LED on");
        Ok(Self { signal })
    }
}

impl Drop for IndicatorGuard<'_> {
    fn drop(&mut self) {
        match self.signal.set(false) {
            Ok(()) => info!("LED off"),
            Err(e) => warn!("Failed to deassert indicator: {}", e),
        }
    }
}
