//! Simulated camera.

use crate::pattern::{render_spots, Spot};
use nanotrack_core::{
    AcquisitionMode, DeviceError, DeviceErrorKind, DeviceResult, Frame, FrameSource, Roi,
};
use ndarray::{s, Array2};
use std::f64::consts::PI;
use std::time::Duration;
use tracing::{debug, warn};

/// Builder for [`MockCamera`].
#[derive(Debug, Clone)]
pub struct MockCameraBuilder {
    width: usize,
    height: usize,
    spots: Vec<Spot>,
    orbit_radius: f64,
    angular_step: f64,
    background: u16,
    noise: u16,
    exposure: Duration,
    frames_per_read: usize,
    fail_after: Option<u64>,
}

impl MockCameraBuilder {
    /// Sensor of `width x height` with no spots and a 1 ms exposure.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            spots: Vec::new(),
            orbit_radius: 0.0,
            angular_step: 0.0,
            background: 100,
            noise: 0,
            exposure: Duration::from_millis(1),
            frames_per_read: 1,
            fail_after: None,
        }
    }

    /// Add a spot at its resting position.
    pub fn spot(mut self, spot: Spot) -> Self {
        self.spots.push(spot);
        self
    }

    /// Move every spot on a circle of `radius` px, advancing `step` radians per frame.
    pub fn orbit(mut self, radius: f64, step: f64) -> Self {
        self.orbit_radius = radius;
        self.angular_step = step;
        self
    }

    /// Flat background level in counts.
    pub fn background(mut self, level: u16) -> Self {
        self.background = level;
        self
    }

    /// Peak-to-peak noise amplitude in counts.
    pub fn noise(mut self, amplitude: u16) -> Self {
        self.noise = amplitude;
        self
    }

    /// Initial exposure, which is also the time one read blocks.
    pub fn exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Frames handed back by each free-run read.
    pub fn frames_per_read(mut self, n: usize) -> Self {
        self.frames_per_read = n.max(1);
        self
    }

    /// Fail every read once `frames` frames have been produced.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Build the camera.
    pub fn build(self) -> MockCamera {
        MockCamera {
            name: "mock_camera".to_string(),
            roi: Roi::full(self.width, self.height),
            config: self,
            mode: AcquisitionMode::Single,
            acquiring: false,
            single_pending: false,
            frame_count: 0,
        }
    }
}

/// Camera that renders Gaussian spots, optionally orbiting the sensor centre.
///
/// Frame indices count up from zero for the camera's lifetime and never
/// reset between acquisitions.
#[derive(Debug)]
pub struct MockCamera {
    name: String,
    config: MockCameraBuilder,
    roi: Roi,
    mode: AcquisitionMode,
    acquiring: bool,
    single_pending: bool,
    frame_count: u64,
}

impl MockCamera {
    /// A `width x height` camera with one spot at the centre.
    pub fn new(width: usize, height: usize) -> Self {
        MockCameraBuilder::new(width, height)
            .spot(Spot::new(width as f64 / 2.0, height as f64 / 2.0))
            .build()
    }

    /// Start configuring a camera.
    pub fn builder(width: usize, height: usize) -> MockCameraBuilder {
        MockCameraBuilder::new(width, height)
    }

    /// Frames produced so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Whether the sensor is armed.
    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Current spot positions in sensor coordinates.
    pub fn spot_positions(&self) -> Vec<(f64, f64)> {
        self.spots_at(self.frame_count)
            .iter()
            .map(|s| (s.x, s.y))
            .collect()
    }

    fn spots_at(&self, frame: u64) -> Vec<Spot> {
        let angle = (frame as f64 * self.config.angular_step) % (2.0 * PI);
        let dx = self.config.orbit_radius * angle.cos() - self.config.orbit_radius;
        let dy = self.config.orbit_radius * angle.sin();
        self.config
            .spots
            .iter()
            .map(|s| Spot {
                x: s.x + dx,
                y: s.y + dy,
                ..*s
            })
            .collect()
    }

    fn error(&self, kind: DeviceErrorKind, message: impl Into<String>) -> DeviceError {
        DeviceError::new(&self.name, kind, message)
    }

    fn next_frame(&mut self) -> DeviceResult<Frame> {
        if let Some(limit) = self.config.fail_after {
            if self.frame_count >= limit {
                return Err(self.error(
                    DeviceErrorKind::ReadFailed,
                    format!("injected failure after {limit} frames"),
                ));
            }
        }
        let c = &self.config;
        let full = render_spots(
            c.width,
            c.height,
            &self.spots_at(self.frame_count),
            c.background,
            c.noise,
            self.frame_count,
        );
        let full = Array2::from_shape_vec((c.height, c.width), full)
            .map_err(|e| self.error(DeviceErrorKind::Other, e.to_string()))?;
        let roi = self.roi;
        let pixels = full
            .slice(s![roi.y_start..roi.y_end, roi.x_start..roi.x_end])
            .to_owned();
        let frame = Frame::new(self.frame_count, pixels);
        self.frame_count += 1;
        Ok(frame)
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(64, 64)
    }
}

impl FrameSource for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mode(&mut self, mode: AcquisitionMode) -> DeviceResult<()> {
        self.mode = mode;
        Ok(())
    }

    fn start_acquisition(&mut self) -> DeviceResult<()> {
        debug!(camera = %self.name, mode = ?self.mode, "Starting acquisition");
        self.acquiring = true;
        self.single_pending = self.mode == AcquisitionMode::Single;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> DeviceResult<()> {
        if self.acquiring {
            debug!(camera = %self.name, frames = self.frame_count, "Stopping acquisition");
        }
        self.acquiring = false;
        self.single_pending = false;
        Ok(())
    }

    fn read_frames(&mut self) -> DeviceResult<Vec<Frame>> {
        if !self.acquiring {
            return Err(self.error(DeviceErrorKind::NotAcquiring, "read before start"));
        }
        std::thread::sleep(self.config.exposure);
        match self.mode {
            AcquisitionMode::Single => {
                if !self.single_pending {
                    return Ok(Vec::new());
                }
                self.single_pending = false;
                Ok(vec![self.next_frame()?])
            }
            AcquisitionMode::Continuous => (0..self.config.frames_per_read)
                .map(|_| self.next_frame())
                .collect(),
        }
    }

    fn size(&self) -> (usize, usize) {
        (self.roi.width(), self.roi.height())
    }

    fn sensor_size(&self) -> (usize, usize) {
        (self.config.width, self.config.height)
    }

    fn exposure(&self) -> Duration {
        self.config.exposure
    }

    fn set_exposure(&mut self, exposure: Duration) -> DeviceResult<()> {
        self.config.exposure = exposure;
        Ok(())
    }

    fn set_roi(&mut self, roi: Roi) -> DeviceResult<Roi> {
        if !roi.fits(self.config.width, self.config.height) {
            warn!(camera = %self.name, ?roi, "Rejected ROI");
            return Err(self.error(
                DeviceErrorKind::InvalidRoi,
                format!(
                    "{roi:?} does not fit a {}x{} sensor",
                    self.config.width, self.config.height
                ),
            ));
        }
        self.roi = roi;
        Ok(roi)
    }

    fn snap(&mut self) -> DeviceResult<Frame> {
        let previous = self.mode;
        self.set_mode(AcquisitionMode::Single)?;
        self.start_acquisition()?;
        let result = self.read_frames();
        self.stop_acquisition()?;
        self.mode = previous;
        result?
            .pop()
            .ok_or_else(|| self.error(DeviceErrorKind::ReadFailed, "snap produced no frame"))
    }
}
