pub mod authority;
pub mod capture;
pub mod clock;
pub mod error;
pub mod indicator;
pub mod session;
pub mod sink;
pub mod trigger;
pub mod utils;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{CaptureError, ErrorKind, Result};

/// Environment variable naming the TOML configuration file
pub const CONFIG_PATH_ENV: &str = "MOCAP_CONFIG";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub trigger: TriggerConfig,
    pub sink: SinkConfig,
    pub indicator: IndicatorConfig,
    pub calibration: CalibrationConfig,
    pub authority: AuthorityConfig,
}

impl Config {
    /// Load defaults, then `mocap.toml` (or `$MOCAP_CONFIG`), then `MOCAP_*` environment overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "mocap.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix("MOCAP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Immutable per-session camera parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// V4L2 device path, or `auto` to probe `/dev/video*`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sensor_mode: u32,
    pub analog_gain: f32,
    pub digital_gain: f32,
    pub crop: CropWindow,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Sensor settle time after configuration, before recording starts
    pub warm_up_secs: u64,
    /// Pin the capture thread to this core
    pub pin_core: Option<usize>,
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Precondition(format!(
                "frame size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(CaptureError::Precondition("fps must be positive".into()));
        }
        if self.buffer_count == 0 {
            return Err(CaptureError::Precondition(
                "buffer_count must be positive".into(),
            ));
        }
        self.crop.check_within(self.width, self.height)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 960,
            height: 720,
            fps: 40,
            sensor_mode: 4,
            analog_gain: 2.0,
            digital_gain: 4.0,
            crop: CropWindow {
                x: 0,
                y: 0,
                width: 960,
                height: 640,
            },
            format: PixelFormat::Yuyv,
            buffer_count: 4,
            warm_up_secs: 2,
            pin_core: None,
        }
    }
}

/// Region of the sensor frame that is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CropWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropWindow {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn check_within(&self, width: u32, height: u32) -> Result<()> {
        let fits = self
            .x
            .checked_add(self.width)
            .is_some_and(|right| right <= width)
            && self
                .y
                .checked_add(self.height)
                .is_some_and(|bottom| bottom <= height);
        if fits {
            Ok(())
        } else {
            Err(CaptureError::Precondition(format!(
                "crop window {self} exceeds frame {width}x{height}"
            )))
        }
    }
}

impl FromStr for CropWindow {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let fields = s
            .split(',')
            .map(|field| field.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CaptureError::Precondition(format!("crop window {s:?}: {e}")))?;

        let [x, y, width, height] = fields[..] else {
            return Err(CaptureError::Precondition(format!(
                "crop window {s:?} must have 4 fields (x,y,width,height)"
            )));
        };
        if width == 0 || height == 0 {
            return Err(CaptureError::Precondition(format!(
                "crop window {s:?} has an empty area"
            )));
        }

        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }
}

impl fmt::Display for CropWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl TryFrom<String> for CropWindow {
    type Error = CaptureError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CropWindow> for String {
    fn from(value: CropWindow) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Hostname of the rendezvous authority
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub buffer_size: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            host: "debora-pc.local".into(),
            port: 8888,
            timeout_secs: 30,
            buffer_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub output_dir: PathBuf,
    pub video_extension: String,
    pub calibration_extension: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/dev/shm"),
            video_extension: "bmp".into(),
            calibration_extension: "png".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorBackend {
    Sysfs,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub backend: IndicatorBackend,
    /// BCM line number of the status LED
    pub line: u32,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            backend: IndicatorBackend::Sysfs,
            line: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub output_folder: Option<PathBuf>,
    /// Seconds between stills; signed so that negative input is reported, not wrapped
    pub capture_delay: i64,
    pub num_images: i64,
    pub width: u32,
    pub height: u32,
    /// Auto exposure / white balance convergence time before recording
    pub settle_secs: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            output_folder: None,
            capture_delay: 1,
            num_images: 60,
            width: 1536,
            height: 864,
            settle_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    pub bind: String,
    pub expected_clients: usize,
    /// Time between the last request and the shared start instant
    pub lead_secs: f64,
    pub duration_secs: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8888".into(),
            expected_clients: 1,
            lead_secs: 3.0,
            duration_secs: 10,
        }
    }
}
