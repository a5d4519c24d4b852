//! Acquisition settings store.
//!
//! Live settings can be changed at any time. The worker takes a [`FrameRequest`]
//! snapshot under a short lock at the start of each cycle and never holds the lock
//! across a network or filesystem wait.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DetectorConfig;
use crate::core::{FrameRequest, FrameType, ShutterMode, TriggerMode};
use crate::error::{AppResult, DaqError};

/// Shutter actuation delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutterTiming {
    /// Time the shutter takes to open
    pub open_delay: Duration,
    /// Time the shutter takes to close
    pub close_delay: Duration,
}

/// Everything an operator can change between cycles.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub struct AcquisitionSettings {
    pub exposure_time: Duration,
    pub num_images: u32,
    pub frame_type: FrameType,
    pub trigger_mode: TriggerMode,
    pub shutter_mode: ShutterMode,
    pub auto_save: bool,
    pub overlap: bool,
    pub bin_x: u32,
    pub bin_y: u32,
    pub tiff_timeout: Duration,
    pub shutter: ShutterTiming,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_number: u32,
    pub file_template: String,
    pub auto_increment: bool,
}

impl AcquisitionSettings {
    /// Initial settings from configuration.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let acquisition = &config.acquisition;
        Self {
            exposure_time: Duration::try_from_secs_f64(acquisition.exposure_time_s)
                .unwrap_or_default(),
            num_images: acquisition.num_images,
            frame_type: acquisition.frame_type,
            trigger_mode: acquisition.trigger_mode,
            shutter_mode: acquisition.shutter_mode,
            auto_save: acquisition.auto_save,
            overlap: acquisition.overlap,
            bin_x: acquisition.bin_x,
            bin_y: acquisition.bin_y,
            tiff_timeout: config.timing.tiff_timeout(),
            shutter: ShutterTiming {
                open_delay: config.timing.shutter_open_delay(),
                close_delay: config.timing.shutter_close_delay(),
            },
            file_path: config.files.path.clone(),
            file_name: config.files.name.clone(),
            file_number: config.files.number,
            file_template: config.files.template.clone(),
            auto_increment: config.files.auto_increment,
        }
    }

    /// Snapshot for one cycle.
    pub fn frame_request(&self) -> FrameRequest {
        FrameRequest {
            exposure_time: self.exposure_time,
            num_images: self.num_images,
            frame_type: self.frame_type,
            trigger_mode: self.trigger_mode,
            use_shutter: self.shutter_mode == ShutterMode::Detector,
            auto_save: self.auto_save,
            overlap_enabled: self.overlap,
            corrected_on_write: self.frame_type.corrected_on_write(),
        }
    }

    /// Apply the file template to the current path, name and number.
    pub fn format_file_name(&self) -> AppResult<PathBuf> {
        let mut vars = HashMap::new();
        vars.insert("path".to_string(), self.file_path.display().to_string());
        vars.insert("name".to_string(), self.file_name.clone());
        vars.insert("number".to_string(), self.file_number.to_string());
        strfmt::strfmt(&self.file_template, &vars)
            .map(PathBuf::from)
            .map_err(|e| {
                DaqError::Configuration(format!(
                    "invalid file template '{}': {}",
                    self.file_template, e
                ))
            })
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

/// Read/write access to the live acquisition settings.
pub trait SettingsStore: Send + Sync {
    /// Snapshot of the settings that drive one cycle.
    fn frame_request(&self) -> FrameRequest;
    /// Current binning `(x, y)`.
    fn binning(&self) -> (u32, u32);
    /// Shutter delays.
    fn shutter_timing(&self) -> ShutterTiming;
    /// Overall result file timeout; zero skips the freshness check.
    fn tiff_timeout(&self) -> Duration;
    /// Name for the next saved file, advancing the file number if auto-increment is on.
    fn next_file_name(&self) -> AppResult<PathBuf>;

    /// Set the exposure time.
    fn set_exposure_time(&self, exposure: Duration);
    /// Set the requested number of images.
    fn set_num_images(&self, count: u32);
    /// Set the frame type.
    fn set_frame_type(&self, frame_type: FrameType);
    /// Set the trigger mode.
    fn set_trigger_mode(&self, mode: TriggerMode);
    /// Set the shutter mode.
    fn set_shutter_mode(&self, mode: ShutterMode);
    /// Enable or disable saving each frame.
    fn set_auto_save(&self, enabled: bool);
    /// Enable or disable overlapping the file write with the next cycle.
    fn set_overlap(&self, enabled: bool);
    /// Store new binning.
    fn set_binning(&self, x: u32, y: u32);
    /// Set the result file timeout.
    fn set_tiff_timeout(&self, timeout: Duration);
    /// Set output directory, base name and next number.
    fn set_file_name(&self, path: PathBuf, name: String, number: u32);
}

/// Settings shared between the handle and the worker.
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: Mutex<AcquisitionSettings>,
}

impl SharedSettings {
    /// Wrap initial settings.
    pub fn new(settings: AcquisitionSettings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }

    /// Copy of everything.
    pub fn snapshot(&self) -> AcquisitionSettings {
        self.inner.lock().clone()
    }
}

impl SettingsStore for SharedSettings {
    fn frame_request(&self) -> FrameRequest {
        self.inner.lock().frame_request()
    }

    fn binning(&self) -> (u32, u32) {
        let settings = self.inner.lock();
        (settings.bin_x, settings.bin_y)
    }

    fn shutter_timing(&self) -> ShutterTiming {
        self.inner.lock().shutter
    }

    fn tiff_timeout(&self) -> Duration {
        self.inner.lock().tiff_timeout
    }

    fn next_file_name(&self) -> AppResult<PathBuf> {
        let mut settings = self.inner.lock();
        let name = settings.format_file_name()?;
        if settings.auto_increment {
            settings.file_number += 1;
        }
        debug!("Next file name {}", name.display());
        Ok(name)
    }

    fn set_exposure_time(&self, exposure: Duration) {
        self.inner.lock().exposure_time = exposure;
    }

    fn set_num_images(&self, count: u32) {
        self.inner.lock().num_images = count;
    }

    fn set_frame_type(&self, frame_type: FrameType) {
        self.inner.lock().frame_type = frame_type;
    }

    fn set_trigger_mode(&self, mode: TriggerMode) {
        self.inner.lock().trigger_mode = mode;
    }

    fn set_shutter_mode(&self, mode: ShutterMode) {
        self.inner.lock().shutter_mode = mode;
    }

    fn set_auto_save(&self, enabled: bool) {
        self.inner.lock().auto_save = enabled;
    }

    fn set_overlap(&self, enabled: bool) {
        self.inner.lock().overlap = enabled;
    }

    fn set_binning(&self, x: u32, y: u32) {
        let mut settings = self.inner.lock();
        settings.bin_x = x;
        settings.bin_y = y;
    }

    fn set_tiff_timeout(&self, timeout: Duration) {
        self.inner.lock().tiff_timeout = timeout;
    }

    fn set_file_name(&self, path: PathBuf, name: String, number: u32) {
        let mut settings = self.inner.lock();
        settings.file_path = path;
        settings.file_name = name;
        settings.file_number = number;
    }
}
