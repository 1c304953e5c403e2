//! Continuous tracker: refines live position estimates to the local
//! intensity centroid, frame by frame.
//!
//! For each estimate the tracker takes a square window of half-width `r`
//! around the rounded position, clipped to the image. The centroid is
//! computed inside the clipped window and placed back in image coordinates
//! from the clipped window's own origin, so a point near a border is not
//! pulled toward the nominal window centre.
//!
//! Points are only ever added and removed by the caller.

use nanotrack_core::TrackedPoint;
use ndarray::{s, ArrayView2};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Default search half-width in pixels.
pub const DEFAULT_RADIUS: usize = 16;

/// Local-window centroid tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousTracker {
    radius: usize,
}

impl Default for ContinuousTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RADIUS)
    }
}

impl ContinuousTracker {
    /// Tracker with a search half-width of `radius` pixels.
    pub fn new(radius: usize) -> Self {
        Self { radius }
    }

    /// Search half-width in pixels.
    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Refine every point in place against `pixels` (rows x columns).
    ///
    /// Returns how many points were visible, i.e. had a non-zero window sum.
    /// Invisible points keep their previous position and intensity.
    pub fn refine(&self, pixels: ArrayView2<'_, u16>, points: &mut [TrackedPoint]) -> usize {
        points
            .iter_mut()
            .map(|point| self.refine_point(pixels, point))
            .filter(|visible| *visible)
            .count()
    }

    /// Refine one point. Returns `false` if it was not visible.
    pub fn refine_point(&self, pixels: ArrayView2<'_, u16>, point: &mut TrackedPoint) -> bool {
        let (height, width) = pixels.dim();
        let Some((x0, x1)) = clipped_span(point.x, self.radius, width) else {
            return false;
        };
        let Some((y0, y1)) = clipped_span(point.y, self.radius, height) else {
            return false;
        };

        let window = pixels.slice(s![y0..y1, x0..x1]);
        let mut total = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for ((row, col), &value) in window.indexed_iter() {
            let v = f64::from(value);
            total += v;
            sum_x += v * col as f64;
            sum_y += v * row as f64;
        }
        if total == 0.0 {
            return false;
        }

        let x = x0 as f64 + sum_x / total;
        let y = y0 as f64 + sum_y / total;
        trace!(
            from_x = point.x,
            from_y = point.y,
            to_x = x,
            to_y = y,
            intensity = total,
            "Refined point"
        );
        point.x = x;
        point.y = y;
        point.intensity = total;
        true
    }
}

/// Half-open `[start, end)` of the window around `center`, clipped to
/// `[0, len)`. `None` when nothing of the window lies inside.
fn clipped_span(center: f64, radius: usize, len: usize) -> Option<(usize, usize)> {
    if !center.is_finite() || len == 0 {
        return None;
    }
    let c = center.round() as i64;
    let r = radius as i64;
    let start = (c - r).max(0);
    let end = (c + r + 1).min(len as i64);
    if start >= end {
        return None;
    }
    Some((start as usize, end as usize))
}

/// The shared, ordered list of live estimates.
///
/// Cloning yields another handle on the same list; the host adds and clears
/// points while the tracker step refines them on the capture thread.
#[derive(Debug, Clone, Default)]
pub struct TrackedPoints {
    points: Arc<Mutex<Vec<TrackedPoint>>>,
}

impl TrackedPoints {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring `(x, y)`. Returns the new point's position in the list.
    pub fn add_monitor_coordinate(&self, x: f64, y: f64) -> usize {
        let mut points = self.points.lock();
        points.push(TrackedPoint::new(x, y));
        points.len() - 1
    }

    /// Forget every point.
    pub fn clear_monitor_coordinates(&self) {
        self.points.lock().clear();
    }

    /// Copy of the current estimates.
    pub fn snapshot(&self) -> Vec<TrackedPoint> {
        self.points.lock().clone()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    /// Run `f` with exclusive access to the list.
    pub fn update<R>(&self, f: impl FnOnce(&mut [TrackedPoint]) -> R) -> R {
        f(&mut self.points.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotrack_core::Frame;
    use nanotrack_driver_mock::{render_spots, Spot};
    use ndarray::Array2;

    fn blob(width: usize, height: usize, x: f64, y: f64) -> Frame {
        let spot = Spot {
            x,
            y,
            sigma: 2.0,
            peak: 60000.0,
        };
        Frame::from_u16(0, width, height, render_spots(width, height, &[spot], 0, 0, 0)).unwrap()
    }

    fn square(width: usize, height: usize, cx: usize, cy: usize) -> Array2<u16> {
        let mut pixels = Array2::zeros((height, width));
        pixels
            .slice_mut(s![cy - 1..=cy + 1, cx - 1..=cx + 1])
            .fill(100);
        pixels
    }

    #[test]
    fn test_converges_to_blob_and_stays() {
        let frame = blob(48, 40, 20.3, 15.7);
        let tracker = ContinuousTracker::new(8);
        let mut point = TrackedPoint::new(17.0, 13.0);
        for _ in 0..10 {
            assert!(tracker.refine_point(frame.pixels.view(), &mut point));
        }
        assert!((point.x - 20.3).abs() < 0.05, "x = {}", point.x);
        assert!((point.y - 15.7).abs() < 0.05, "y = {}", point.y);

        let settled = point;
        tracker.refine_point(frame.pixels.view(), &mut point);
        assert_eq!(point, settled);
    }

    #[test]
    fn test_left_border_uses_clipped_window() {
        let pixels = square(40, 40, 2, 20);
        let tracker = ContinuousTracker::new(6);
        let mut point = TrackedPoint::new(3.0, 20.0);
        assert!(tracker.refine_point(pixels.view(), &mut point));
        assert!((point.x - 2.0).abs() < 1e-12);
        assert!((point.y - 20.0).abs() < 1e-12);
        assert_eq!(point.intensity, 900.0);
    }

    #[test]
    fn test_right_and_bottom_border_use_clipped_window() {
        let pixels = square(40, 30, 37, 27);
        let tracker = ContinuousTracker::new(6);
        let mut point = TrackedPoint::new(36.0, 26.0);
        assert!(tracker.refine_point(pixels.view(), &mut point));
        assert!((point.x - 37.0).abs() < 1e-12);
        assert!((point.y - 27.0).abs() < 1e-12);
    }

    #[test]
    fn test_dark_window_leaves_point_unchanged() {
        let pixels = square(40, 40, 5, 5);
        let tracker = ContinuousTracker::new(4);
        let mut points = [
            TrackedPoint::new(30.0, 30.0),
            TrackedPoint::new(6.0, 5.0),
            TrackedPoint::new(-100.0, 5.0),
        ];
        assert_eq!(tracker.refine(pixels.view(), &mut points), 1);
        assert_eq!(points[0], TrackedPoint::new(30.0, 30.0));
        assert!((points[1].x - 5.0).abs() < 1e-12);
        assert_eq!(points[2].x, -100.0);
    }

    #[test]
    fn test_tracked_points_list() {
        let list = TrackedPoints::new();
        assert_eq!(list.add_monitor_coordinate(1.0, 2.0), 0);
        assert_eq!(list.add_monitor_coordinate(3.0, 4.0), 1);
        let other = list.clone();
        other.update(|points| points[0].x = 9.0);
        assert_eq!(list.snapshot()[0].x, 9.0);
        list.clear_monitor_coordinates();
        assert!(other.is_empty());
    }
}
