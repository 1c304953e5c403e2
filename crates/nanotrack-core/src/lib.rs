//! Core types for nanotrack.
//!
//! Shared by the runtime, the storage layer and the device drivers:
//!
//! - [`data`]: frames, analog windows, tracked points, regions of interest
//! - [`capabilities`]: the camera and digitizer traits the runtime drives
//! - [`error`]: the error taxonomy surfaced to the host
//! - [`stop`]: the cooperative cancellation token handed to every loop

pub mod capabilities;
pub mod data;
pub mod error;
pub mod stop;

pub use capabilities::{AnalogSource, FrameSource};
pub use data::{AcquisitionMode, AnalogWindow, Frame, Roi, SampleDtype, TrackedPoint};
pub use error::{AppResult, DaqError, DeviceError, DeviceErrorKind, DeviceResult};
pub use stop::StopSignal;
