//! Configuration using Figment
//!
//! Configuration is merged from, in increasing priority:
//! 1. built-in defaults
//! 2. a TOML file
//! 3. environment variables prefixed with `MARCCD_` (`__` separates nested keys)
//!
//! ```text
//! MARCCD_SERVER__ADDRESS=beamline-ccd:2222
//! MARCCD_TIMING__TIFF_TIMEOUT_MS=0
//! MARCCD_ACQUISITION__FRAME_TYPE=background
//! ```
//!
//! # Example
//!
//! ```no_run
//! use marccd_daq::config::DetectorConfig;
//!
//! let config = DetectorConfig::load_from("marccd.toml")?;
//! println!("Server: {}", config.server.address);
//! # Ok::<(), marccd_daq::error::DaqError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::core::{FrameType, ShutterMode, TriggerMode};
use crate::error::{AppResult, DaqError};

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "MARCCD_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Detector server connection
    pub server: ServerConfig,
    /// Detector identification and geometry
    pub detector: DetectorInfoConfig,
    /// Poll intervals, delays and timeouts
    pub timing: TimingConfig,
    /// Initial acquisition settings
    pub acquisition: AcquisitionConfig,
    /// Result file naming
    pub files: FilesConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Detector server connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` of the marccd server
    pub address: String,
    /// Reply timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Line terminator appended to each command
    pub terminator: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2222".to_string(),
            read_timeout_ms: 1000,
            terminator: "\n".to_string(),
        }
    }
}

impl ServerConfig {
    /// Reply timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Detector identification and geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorInfoConfig {
    /// Full sensor width in pixels
    pub max_size_x: u32,
    /// Full sensor height in pixels
    pub max_size_y: u32,
    /// Reported manufacturer
    pub manufacturer: String,
    /// Reported model
    pub model: String,
}

impl Default for DetectorInfoConfig {
    fn default() -> Self {
        Self {
            max_size_x: 2048,
            max_size_y: 2048,
            manufacturer: "MAR".to_string(),
            model: "CCD".to_string(),
        }
    }
}

/// Poll intervals, delays and timeouts, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Sleep between status polls
    pub poll_interval_ms: u64,
    /// Exposure timer wake interval
    pub exposure_tick_ms: u64,
    /// Delay between result file read attempts
    pub file_read_delay_ms: u64,
    /// Overall result file timeout (0 skips the freshness check)
    pub tiff_timeout_ms: u64,
    /// Shutter opening time
    pub shutter_open_delay_ms: u64,
    /// Shutter closing time
    pub shutter_close_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            exposure_tick_ms: 10,
            file_read_delay_ms: 10,
            tiff_timeout_ms: 20_000,
            shutter_open_delay_ms: 0,
            shutter_close_delay_ms: 0,
        }
    }
}

#[allow(missing_docs)]
impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn exposure_tick(&self) -> Duration {
        Duration::from_millis(self.exposure_tick_ms)
    }

    pub fn file_read_delay(&self) -> Duration {
        Duration::from_millis(self.file_read_delay_ms)
    }

    pub fn tiff_timeout(&self) -> Duration {
        Duration::from_millis(self.tiff_timeout_ms)
    }

    pub fn shutter_open_delay(&self) -> Duration {
        Duration::from_millis(self.shutter_open_delay_ms)
    }

    pub fn shutter_close_delay(&self) -> Duration {
        Duration::from_millis(self.shutter_close_delay_ms)
    }
}

/// Initial acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Exposure time in seconds
    pub exposure_time_s: f64,
    /// Requested number of images
    pub num_images: u32,
    /// Frame type
    pub frame_type: FrameType,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Shutter mode
    pub shutter_mode: ShutterMode,
    /// Save every frame to a file
    pub auto_save: bool,
    /// Do not wait for the file write before the next cycle
    pub overlap: bool,
    /// Horizontal binning
    pub bin_x: u32,
    /// Vertical binning
    pub bin_y: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            exposure_time_s: 1.0,
            num_images: 1,
            frame_type: FrameType::Normal,
            trigger_mode: TriggerMode::Internal,
            shutter_mode: ShutterMode::None,
            auto_save: false,
            overlap: false,
            bin_x: 1,
            bin_y: 1,
        }
    }
}

/// Result file naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Output directory as seen by the detector server
    pub path: PathBuf,
    /// Base file name
    pub name: String,
    /// Next file number
    pub number: u32,
    /// `strfmt` template with `{path}`, `{name}` and `{number}`
    pub template: String,
    /// Advance the number after every file
    pub auto_increment: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp"),
            name: "image".to_string(),
            number: 1,
            template: "{path}/{name}_{number:0>3}.tif".to_string(),
            auto_increment: true,
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `RUST_LOG` overrides it
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl DetectorConfig {
    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a DaqError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::extract(Self::figment().merge(Toml::file(path.as_ref())))
    }

    /// Defaults plus environment overrides, without a file.
    pub fn load_defaults() -> AppResult<Self> {
        Self::extract(Self::figment())
    }

    /// Parse configuration from TOML text (environment overrides still apply).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::extract(Self::figment().merge(Toml::string(toml)))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(DetectorConfig::default()))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Configuration` with a descriptive message for any
    /// validation failure.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.server.address.trim().is_empty() {
            return Err(DaqError::Configuration(
                "server.address must not be empty".to_string(),
            ));
        }
        if self.server.read_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "server.read_timeout_ms must be positive".to_string(),
            ));
        }

        if self.timing.poll_interval_ms == 0 || self.timing.exposure_tick_ms == 0 {
            return Err(DaqError::Configuration(
                "timing.poll_interval_ms and timing.exposure_tick_ms must be positive"
                    .to_string(),
            ));
        }

        if self.detector.max_size_x == 0 || self.detector.max_size_y == 0 {
            return Err(DaqError::Configuration(format!(
                "Invalid detector size {}x{}",
                self.detector.max_size_x, self.detector.max_size_y
            )));
        }

        let acquisition = &self.acquisition;
        if acquisition.bin_x == 0 || acquisition.bin_y == 0 {
            return Err(DaqError::Configuration(format!(
                "Invalid binning {}x{}",
                acquisition.bin_x, acquisition.bin_y
            )));
        }
        if !acquisition.exposure_time_s.is_finite() || acquisition.exposure_time_s < 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid exposure time {} s",
                acquisition.exposure_time_s
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.tiff_timeout(), Duration::from_secs(20));
        assert_eq!(config.server.read_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = DetectorConfig::from_toml_str(
                r#"
                [server]
                address = "ccd-host:2222"

                [acquisition]
                frame_type = "double_correlation"
                shutter_mode = "detector"
                exposure_time_s = 2.5
                "#,
            )
            .unwrap();

            assert_eq!(config.server.address, "ccd-host:2222");
            assert_eq!(config.server.read_timeout_ms, 1000);
            assert_eq!(config.acquisition.frame_type, FrameType::DoubleCorrelation);
            assert_eq!(config.acquisition.shutter_mode, ShutterMode::Detector);
            assert_eq!(config.files.number, 1);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "marccd.toml",
                r#"
                [timing]
                tiff_timeout_ms = 5000
                "#,
            )?;
            jail.set_env("MARCCD_TIMING__TIFF_TIMEOUT_MS", "0");
            jail.set_env("MARCCD_LOGGING__LEVEL", "debug");

            let config = DetectorConfig::load_from("marccd.toml").unwrap();
            assert_eq!(config.timing.tiff_timeout_ms, 0);
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = DetectorConfig::default();
        config.logging.level = "verbose".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log level"));
    }

    #[test]
    fn test_zero_binning_rejected() {
        let mut config = DetectorConfig::default();
        config.acquisition.bin_y = 0;
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_negative_exposure_rejected() {
        let mut config = DetectorConfig::default();
        config.acquisition.exposure_time_s = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = DetectorConfig::default();
        config.timing.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
