//! Error types shared by every nanotrack crate.
//!
//! `DaqError` is the single error surfaced to the host. Its variants follow the
//! runtime's failure taxonomy:
//!
//! - **`Device`**: a frame or analog read failed. Fatal to the loop that issued
//!   the read, never retried automatically.
//! - **`AlreadyRunning`** / **`NotRunning`**: lifecycle misuse. Returned to the
//!   caller, nothing is torn down.
//! - **`PipelineStep`**: one step of one analysis chain failed. Logged and
//!   contained to that chain for the current frame.
//! - **`Persistence`**: a dataset write failed. Fatal to the writer; the
//!   writer truncates what it has before the error is handed back.
//!
//! Everything else (`Configuration`, `Io`, `Shutdown`) is plumbing around those.

use thiserror::Error;

// =============================================================================
// Device Errors
// =============================================================================

/// Category of a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Reading frames or samples failed.
    ReadFailed,
    /// A read was attempted while the device was not acquiring.
    NotAcquiring,
    /// The requested region of interest does not fit the sensor.
    InvalidRoi,
    /// The device went away.
    Disconnected,
    /// Anything the driver could not classify.
    Other,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceErrorKind::ReadFailed => "read_failed",
            DeviceErrorKind::NotAcquiring => "not_acquiring",
            DeviceErrorKind::InvalidRoi => "invalid_roi",
            DeviceErrorKind::Disconnected => "disconnected",
            DeviceErrorKind::Other => "other",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a camera or DAQ capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DeviceError {
    /// Name of the device that failed.
    pub device: String,
    /// Failure category.
    pub kind: DeviceErrorKind,
    /// Driver supplied detail.
    pub message: String,
}

impl DeviceError {
    /// Build a device error.
    pub fn new(
        device: impl Into<String>,
        kind: DeviceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Result alias for device capability calls.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition runtime.
///
/// # Example
///
/// ```rust,ignore
/// use nanotrack_core::error::{AppResult, DaqError};
///
/// fn begin(loop_: &AcquisitionLoop<CameraFeed>) -> AppResult<()> {
///     match loop_.start() {
///         Err(DaqError::AlreadyRunning) => Ok(()),
///         other => other,
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// A camera or DAQ read failed.
    ///
    /// Terminates the capture loop that issued the read. The loop keeps the
    /// error so the host can collect it after `stop()`.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// `start()` was called while a capture thread was still active.
    #[error("Acquisition is already running")]
    AlreadyRunning,

    /// An operation needed a running acquisition and there was none.
    #[error("Acquisition is not running")]
    NotRunning,

    /// One step of an analysis chain failed or panicked.
    ///
    /// Contained to the chain: the frame still reaches the persist slot and
    /// every other chain.
    #[error("Pipeline step '{step}' in chain '{chain}' failed: {message}")]
    PipelineStep {
        /// Name the chain was registered under.
        chain: String,
        /// Name reported by the failing step.
        step: String,
        /// Failure detail.
        message: String,
    },

    /// Writing to persistent storage failed.
    ///
    /// The writer that produced this error is closed (datasets truncated to
    /// the rows actually written, no `finished` stamp) before it is returned.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A configuration value is semantically invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Filesystem or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The component has been shut down and no longer accepts work.
    #[error("Component has been shut down")]
    Shutdown,
}

impl DaqError {
    /// Build a pipeline step error.
    pub fn step(chain: impl Into<String>, step: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::PipelineStep {
            chain: chain.into(),
            step: step.into(),
            message: message.into(),
        }
    }

    /// True for the categories that end the owning loop or writer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaqError::Device(_) | DaqError::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = DaqError::Device(DeviceError::new(
            "mock_camera",
            DeviceErrorKind::ReadFailed,
            "buffer overrun",
        ));
        assert_eq!(
            err.to_string(),
            "Device 'mock_camera' read_failed error: buffer overrun"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_step_error_display() {
        let err = DaqError::step("tracking", "locate", "empty frame");
        assert_eq!(
            err.to_string(),
            "Pipeline step 'locate' in chain 'tracking' failed: empty frame"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_lifecycle_errors_are_not_fatal() {
        assert!(!DaqError::AlreadyRunning.is_fatal());
        assert!(!DaqError::NotRunning.is_fatal());
        assert_eq!(
            DaqError::AlreadyRunning.to_string(),
            "Acquisition is already running"
        );
    }

    #[test]
    fn test_io_conversion() {
        fn open() -> AppResult<()> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))?;
            Ok(())
        }
        assert!(matches!(open(), Err(DaqError::Io(_))));
    }
}
