//! # nanotrack
//!
//! Synchronized camera and DAQ acquisition runtime with live particle
//! tracking and incremental HDF5 persistence.
//!
//! One capture thread per device pulls data and runs it, in arrival order,
//! through a processing pipeline: the current-frame snapshot, a persist slot
//! writing the `Image` dataset, and named analysis chains (tracking, display).
//! A second thread drives the digitizer and the trigger synchronizer, which
//! maps logic edges to absolute sample indices. Anything slow (display,
//! remote viewers) consumes through the broadcast bus instead of the capture
//! thread.
//!
//! ## Modules
//!
//! - [`acquisition`]: capture thread lifecycle over camera and DAQ devices
//! - [`bus`]: topic fan-out to independently paced subscribers, plus a TCP bridge
//! - [`pipeline`]: persist slot and copy-on-write analysis chains
//! - [`tracker`]: local-window centroid tracking of live estimates
//! - [`trigger`]: cross-window edge detection on the trigger line
//! - [`experiment`]: wiring of all of the above around one session file
//! - [`config`]: figment-based configuration
//! - [`telemetry`]: tracing subscriber setup
//!
//! Shared types live in `nanotrack-core`, the storage layer in
//! `nanotrack-storage` and simulated devices in `nanotrack-driver-mock`.

pub mod acquisition;
pub mod bus;
pub mod config;
pub mod experiment;
pub mod pipeline;
pub mod telemetry;
pub mod tracker;
pub mod trigger;

pub use acquisition::{AcquisitionLoop, AnalogFeed, CameraFeed, Consumer, LoopStats};
pub use bus::{BroadcastBus, BusConfig, Envelope, Payload, Publisher, Subscription, WeakBus};
pub use config::NanotrackConfig;
pub use experiment::Experiment;
pub use pipeline::{Datum, FrameSink, Pipeline, Step};
pub use tracker::{ContinuousTracker, TrackedPoints};
pub use trigger::{Edge, EdgeDetector, TriggerSynchronizer};

pub use nanotrack_core::{AppResult, DaqError, Frame, Roi, TrackedPoint};
