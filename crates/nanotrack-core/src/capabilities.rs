//! Device capability traits.
//!
//! Vendor SDKs stay behind these traits. The runtime only ever talks to a
//! camera through [`FrameSource`] and to a digitizer through [`AnalogSource`];
//! both are synchronous because they are driven from a dedicated capture
//! thread.

use crate::data::{AcquisitionMode, AnalogWindow, Frame, Roi, SampleDtype};
use crate::error::DeviceResult;
use std::time::Duration;

/// A camera or anything else that produces 2-D frames.
pub trait FrameSource: Send {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Select free-run or single-shot delivery.
    fn set_mode(&mut self, mode: AcquisitionMode) -> DeviceResult<()>;

    /// Arm the sensor.
    fn start_acquisition(&mut self) -> DeviceResult<()>;

    /// Disarm the sensor. Must be safe to call when not acquiring.
    fn stop_acquisition(&mut self) -> DeviceResult<()>;

    /// Return every frame that is ready, possibly none.
    ///
    /// Never blocks for longer than one frame period.
    fn read_frames(&mut self) -> DeviceResult<Vec<Frame>>;

    /// Current output size as `(width, height)`.
    fn size(&self) -> (usize, usize);

    /// Full sensor size as `(width, height)`.
    fn sensor_size(&self) -> (usize, usize);

    /// Current exposure time.
    fn exposure(&self) -> Duration;

    /// Change the exposure time.
    fn set_exposure(&mut self, exposure: Duration) -> DeviceResult<()>;

    /// Restrict readout to a sub-rectangle. Returns the region actually applied.
    fn set_roi(&mut self, roi: Roi) -> DeviceResult<Roi>;

    /// Return to full-sensor readout.
    fn clear_roi(&mut self) -> DeviceResult<Roi> {
        let (width, height) = self.sensor_size();
        self.set_roi(Roi::full(width, height))
    }

    /// Acquire exactly one frame in single-shot mode.
    fn snap(&mut self) -> DeviceResult<Frame>;
}

/// A multichannel digitizer streaming fixed-length windows.
pub trait AnalogSource: Send {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Begin streaming `window_len` samples per channel per window at `frequency_hz`.
    fn start_stream(&mut self, frequency_hz: f64, window_len: usize) -> DeviceResult<()>;

    /// Stop streaming. Must be safe to call when idle.
    fn stop_stream(&mut self) -> DeviceResult<()>;

    /// Return every complete window that is ready, possibly none.
    fn read_windows(&mut self) -> DeviceResult<Vec<AnalogWindow>>;

    /// Number of channels in each window.
    fn channel_count(&self) -> usize;

    /// Sample rate of the running stream, if any.
    fn frequency_hz(&self) -> Option<f64>;

    /// Native element type, used as the on-disk dtype.
    fn sample_dtype(&self) -> SampleDtype {
        SampleDtype::F64
    }
}
