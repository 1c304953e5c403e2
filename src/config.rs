//! Runtime configuration using Figment.
//!
//! Configuration is loaded from, in increasing priority:
//! 1. built-in defaults
//! 2. a TOML file
//! 3. environment variables prefixed with `NANOTRACK_`, `__` separating
//!    nesting levels (`NANOTRACK_TRIGGER__EDGE=falling`)
//!
//! The runtime components take plain parameters; this module only builds
//! them.
//!
//! # Example
//! ```no_run
//! use nanotrack::config::NanotrackConfig;
//!
//! let config = NanotrackConfig::load_from("config/nanotrack.toml")?;
//! config.validate()?;
//! println!("Tracking radius: {}", config.tracker.radius);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::bus::BusConfig;
use crate::trigger::{Edge, DEFAULT_THRESHOLD};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use nanotrack_core::SampleDtype;
use nanotrack_storage::{AnalogWriterConfig, ImageWriterConfig, TRACK_BATCH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NanotrackConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Capture loop settings
    pub acquisition: AcquisitionConfig,
    /// Broadcast bus settings
    pub bus: BusSettings,
    /// Continuous tracker settings
    pub tracker: TrackerConfig,
    /// DAQ stream and edge detection settings
    pub trigger: TriggerConfig,
    /// Session file settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format, used by [`crate::telemetry::init`]
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event, no colors
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Capture loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sleep after a read that returned nothing, in microseconds
    #[serde(default = "default_idle_sleep_us")]
    pub idle_sleep_us: u64,
}

/// Broadcast bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Producer-side queue length
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Messages buffered per subscriber
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Startup and shutdown grace period in milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Forwarder idle poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Drop messages for a full subscriber instead of waiting
    #[serde(default)]
    pub drop_on_overflow: bool,
}

/// Continuous tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Search half-width in pixels
    #[serde(default = "default_radius")]
    pub radius: usize,
}

/// DAQ stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Logic threshold, strictly above is high
    #[serde(default = "default_threshold")]
    pub threshold_volts: f64,
    /// Transition to report (rising or falling)
    #[serde(default)]
    pub edge: Edge,
    /// Sample rate in Hz
    #[serde(default = "default_frequency")]
    pub frequency_hz: f64,
    /// Samples per channel per window
    #[serde(default = "default_window_len")]
    pub window_len: usize,
}

/// Session file configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for session files
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Session file name, `.hdf5` appended when missing
    #[serde(default = "default_filename")]
    pub filename: String,
    /// Persist every Nth frame
    #[serde(default = "default_stride")]
    pub image_stride: usize,
    /// Track rows allocated per growth step
    #[serde(default = "default_track_batch")]
    pub track_batch: usize,
    /// Frames allocated per growth step
    #[serde(default = "default_image_batch")]
    pub image_batch: usize,
    /// Analog windows allocated per growth step
    #[serde(default = "default_analog_batch")]
    pub analog_batch: usize,
    /// gzip level (0-9, 0 disables compression)
    #[serde(default = "default_compression")]
    pub compression_level: u8,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_idle_sleep_us() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_grace_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_radius() -> usize {
    crate::tracker::DEFAULT_RADIUS
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_frequency() -> f64 {
    10_000.0
}

fn default_window_len() -> usize {
    1000
}

fn default_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_filename() -> String {
    "nanotrack".to_string()
}

fn default_stride() -> usize {
    1
}

fn default_track_batch() -> usize {
    TRACK_BATCH
}

fn default_image_batch() -> usize {
    16
}

fn default_analog_batch() -> usize {
    64
}

fn default_compression() -> u8 {
    4
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            idle_sleep_us: default_idle_sleep_us(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            subscriber_buffer: default_subscriber_buffer(),
            grace_ms: default_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            drop_on_overflow: false,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            radius: default_radius(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            threshold_volts: default_threshold(),
            edge: Edge::default(),
            frequency_hz: default_frequency(),
            window_len: default_window_len(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            filename: default_filename(),
            image_stride: default_stride(),
            track_batch: default_track_batch(),
            image_batch: default_image_batch(),
            analog_batch: default_analog_batch(),
            compression_level: default_compression(),
        }
    }
}

impl NanotrackConfig {
    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still
    /// apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(NanotrackConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("NANOTRACK_").split("__"))
            .extract()
    }

    /// Render the configuration as TOML, e.g. to seed a config file
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.storage.compression_level > 9 {
            return Err(format!(
                "Invalid compression_level {}. Must be 0-9",
                self.storage.compression_level
            ));
        }

        if self.trigger.frequency_hz <= 0.0 || !self.trigger.frequency_hz.is_finite() {
            return Err(format!(
                "Invalid frequency_hz {}. Must be positive",
                self.trigger.frequency_hz
            ));
        }

        let sizes = [
            ("bus.queue_capacity", self.bus.queue_capacity),
            ("bus.subscriber_buffer", self.bus.subscriber_buffer),
            ("trigger.window_len", self.trigger.window_len),
            ("storage.image_stride", self.storage.image_stride),
            ("storage.track_batch", self.storage.track_batch),
            ("storage.image_batch", self.storage.image_batch),
            ("storage.analog_batch", self.storage.analog_batch),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(format!("Invalid {name} 0. Must be at least 1"));
            }
        }

        Ok(())
    }

    /// Full path of the session file, before suffix bumping.
    pub fn session_path(&self) -> PathBuf {
        self.storage.directory.join(&self.storage.filename)
    }

    /// Empty-read sleep of the capture loops.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.acquisition.idle_sleep_us)
    }

    /// Broadcast bus tuning.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            queue_capacity: self.bus.queue_capacity,
            subscriber_buffer: self.bus.subscriber_buffer,
            grace: Duration::from_millis(self.bus.grace_ms),
            poll_interval: Duration::from_millis(self.bus.poll_interval_ms),
            drop_on_overflow: self.bus.drop_on_overflow,
        }
    }

    fn compression(&self) -> Option<u8> {
        match self.storage.compression_level {
            0 => None,
            level => Some(level),
        }
    }

    /// Settings for the `Image` writer.
    pub fn image_writer_config(&self) -> ImageWriterConfig {
        ImageWriterConfig {
            stride: self.storage.image_stride,
            batch: self.storage.image_batch,
            compression: self.compression(),
            metadata: Vec::new(),
        }
    }

    /// Settings for the `DAQ-input` / `trigger` writer.
    pub fn analog_writer_config(&self, dtype: SampleDtype) -> AnalogWriterConfig {
        AnalogWriterConfig {
            dtype,
            batch: self.storage.analog_batch,
            compression: self.compression(),
            frequency_hz: self.trigger.frequency_hz,
            metadata: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NanotrackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trigger.threshold_volts, 1.6);
        assert_eq!(config.trigger.edge, Edge::Rising);
        assert_eq!(config.storage.track_batch, 1024);
        assert_eq!(config.session_path(), PathBuf::from("data/nanotrack"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = NanotrackConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_compression_and_sizes() {
        let mut config = NanotrackConfig::default();
        config.storage.compression_level = 10;
        assert!(config.validate().is_err());

        let mut config = NanotrackConfig::default();
        config.trigger.window_len = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("trigger.window_len"));
    }

    #[test]
    #[serial]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[trigger]
edge = "falling"
window_len = 250

[storage]
image_stride = 5
compression_level = 0
"#
        )
        .unwrap();

        let config = NanotrackConfig::load_from(file.path()).unwrap();
        assert_eq!(config.trigger.edge, Edge::Falling);
        assert_eq!(config.trigger.window_len, 250);
        assert_eq!(config.trigger.threshold_volts, 1.6);
        assert_eq!(config.storage.image_stride, 5);
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.image_writer_config().compression, None);
        assert_eq!(config.image_writer_config().stride, 5);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[tracker]\nradius = 8").unwrap();

        std::env::set_var("NANOTRACK_TRACKER__RADIUS", "12");
        let loaded = NanotrackConfig::load_from(file.path());
        std::env::remove_var("NANOTRACK_TRACKER__RADIUS");

        assert_eq!(loaded.unwrap().tracker.radius, 12);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = NanotrackConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, NanotrackConfig::default());
    }

    #[test]
    #[serial]
    fn test_rendered_toml_loads_back() {
        let mut config = NanotrackConfig::default();
        config.trigger.edge = Edge::Falling;
        config.storage.directory = PathBuf::from("/tmp/runs");

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "{}", config.to_toml().unwrap()).unwrap();
        assert_eq!(NanotrackConfig::load_from(file.path()).unwrap(), config);
    }

    #[test]
    fn test_bus_config_conversion() {
        let mut config = NanotrackConfig::default();
        config.bus.grace_ms = 250;
        config.bus.drop_on_overflow = true;
        let bus = config.bus_config();
        assert_eq!(bus.grace, Duration::from_millis(250));
        assert!(bus.drop_on_overflow);
        assert_eq!(bus.queue_capacity, 1024);
    }
}
