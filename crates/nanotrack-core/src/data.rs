//! Data carried through the runtime: camera frames, analog windows,
//! tracked points and regions of interest.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// A single camera image.
///
/// Pixels are stored row-major as `(height, width)`. The `index` is assigned
/// by the source and increases by one per delivered frame, so it survives any
/// stride applied later on the persistence side.
///
/// Frames travel through the runtime as `Arc<Frame>`. A step that needs to
/// change pixels calls `Arc::make_mut`, which hands it a private copy while
/// every other consumer keeps the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic frame number
    pub index: u64,

    /// Pixel data, `(height, width)`
    pub pixels: Array2<u16>,
}

impl Frame {
    /// Wrap an existing pixel array.
    pub fn new(index: u64, pixels: Array2<u16>) -> Self {
        Self { index, pixels }
    }

    /// Create a frame from a flat row-major buffer.
    ///
    /// Returns `None` when the buffer length does not match `width * height`.
    pub fn from_u16(index: u64, width: usize, height: usize, pixels: Vec<u16>) -> Option<Self> {
        Array2::from_shape_vec((height, width), pixels)
            .ok()
            .map(|pixels| Self { index, pixels })
    }

    /// A black frame of the given size.
    pub fn zeros(index: u64, width: usize, height: usize) -> Self {
        Self {
            index,
            pixels: Array2::zeros((height, width)),
        }
    }

    /// Width in pixels
    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    /// Height in pixels
    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    /// `(width, height)`, the order device capabilities report sizes in.
    pub fn size(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    /// Sum of all pixel values.
    pub fn total_intensity(&self) -> u64 {
        self.pixels.iter().map(|&p| u64::from(p)).sum()
    }
}

/// One fixed-length block of multichannel analog samples.
///
/// `samples` is `(channels, samples_per_channel)`. By convention channel 0 is
/// the signal to persist and channel 1 the trigger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogWindow {
    /// Monotonic window number
    pub index: u64,

    /// Samples in volts, `(channels, len)`
    pub samples: Array2<f64>,
}

impl AnalogWindow {
    /// Wrap an existing sample array.
    pub fn new(index: u64, samples: Array2<f64>) -> Self {
        Self { index, samples }
    }

    /// Build a window from per-channel vectors of equal length.
    ///
    /// Returns `None` if the channels differ in length or there are none.
    pub fn from_channels(index: u64, channels: &[Vec<f64>]) -> Option<Self> {
        let len = channels.first()?.len();
        if channels.iter().any(|c| c.len() != len) {
            return None;
        }
        let flat: Vec<f64> = channels.iter().flatten().copied().collect();
        Array2::from_shape_vec((channels.len(), len), flat)
            .ok()
            .map(|samples| Self { index, samples })
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.samples.nrows()
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.samples.ncols()
    }

    /// True if the window carries no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.ncols() == 0
    }

    /// View of one channel, `None` if out of range.
    pub fn channel(&self, channel: usize) -> Option<ArrayView1<'_, f64>> {
        (channel < self.channel_count()).then(|| self.samples.row(channel))
    }
}

/// A live position estimate refined by the continuous tracker.
///
/// Identity is the position in the tracked list; the tracker never adds or
/// removes points on its own.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackedPoint {
    /// Column coordinate in pixels
    pub x: f64,
    /// Row coordinate in pixels
    pub y: f64,
    /// Total intensity inside the last search window
    pub intensity: f64,
}

impl TrackedPoint {
    /// A new estimate with zero intensity.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            intensity: 0.0,
        }
    }
}

/// Sensor sub-rectangle, half-open on both axes: `[x_start, x_end) x [y_start, y_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// First column
    pub x_start: usize,
    /// One past the last column
    pub x_end: usize,
    /// First row
    pub y_start: usize,
    /// One past the last row
    pub y_end: usize,
}

impl Roi {
    /// Build a region from `[x_start, x_end]` and `[y_start, y_end]` pairs.
    pub fn new(x: [usize; 2], y: [usize; 2]) -> Self {
        Self {
            x_start: x[0],
            x_end: x[1],
            y_start: y[0],
            y_end: y[1],
        }
    }

    /// The whole sensor.
    pub fn full(width: usize, height: usize) -> Self {
        Self::new([0, width], [0, height])
    }

    /// Width in pixels (zero for an inverted range)
    pub fn width(&self) -> usize {
        self.x_end.saturating_sub(self.x_start)
    }

    /// Height in pixels (zero for an inverted range)
    pub fn height(&self) -> usize {
        self.y_end.saturating_sub(self.y_start)
    }

    /// True if the region is non-empty and lies within a `width x height` sensor.
    pub fn fits(&self, width: usize, height: usize) -> bool {
        self.width() > 0 && self.height() > 0 && self.x_end <= width && self.y_end <= height
    }
}

/// How a frame source delivers images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Free run: frames keep arriving until the acquisition is stopped
    Continuous,
    /// One frame per start
    #[default]
    Single,
}

/// Native element type of an analog source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleDtype {
    /// 32-bit float samples
    F32,
    /// 64-bit float samples
    F64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_u16_checks_length() {
        assert!(Frame::from_u16(0, 4, 3, vec![0; 12]).is_some());
        assert!(Frame::from_u16(0, 4, 3, vec![0; 11]).is_none());

        let frame = Frame::from_u16(7, 4, 3, (0..12).collect()).unwrap();
        assert_eq!(frame.size(), (4, 3));
        assert_eq!(frame.pixels[[1, 0]], 4);
        assert_eq!(frame.total_intensity(), 66);
    }

    #[test]
    fn test_analog_window_channels() {
        let window =
            AnalogWindow::from_channels(2, &[vec![0.0, 1.0, 2.0], vec![0.0, 5.0, 0.0]]).unwrap();
        assert_eq!(window.channel_count(), 2);
        assert_eq!(window.len(), 3);
        assert_eq!(window.channel(1).unwrap()[1], 5.0);
        assert!(window.channel(2).is_none());

        assert!(AnalogWindow::from_channels(0, &[vec![0.0], vec![]]).is_none());
        assert!(AnalogWindow::from_channels(0, &[]).is_none());
    }

    #[test]
    fn test_roi_fits() {
        let roi = Roi::new([10, 74], [0, 32]);
        assert_eq!(roi.width(), 64);
        assert_eq!(roi.height(), 32);
        assert!(roi.fits(128, 32));
        assert!(!roi.fits(64, 32));
        assert!(!Roi::new([5, 5], [0, 1]).fits(10, 10));
    }

    #[test]
    fn test_frame_serde_roundtrip() {
        let frame = Frame::from_u16(3, 2, 2, vec![1, 2, 3, 4]).unwrap();
        let bytes = bincode::serialize(&frame).unwrap();
        let back: Frame = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, frame);
    }
}
