//! Building blocks for analysis chains.
//!
//! A chain is an ordered list of [`Step`]s. The first step receives the raw
//! frame as [`Datum::Frame`]; each later step receives whatever the previous
//! one returned. A step that returns [`Datum::Empty`] ends the chain for that
//! frame.
//!
//! Frames are shared (`Arc<Frame>`) between the host, the persist slot and
//! every chain. A step that modifies pixels must work on a private copy;
//! [`BackgroundSubtract`] does this with `Arc::make_mut`.

use crate::bus::{Payload, Publisher};
use crate::tracker::{ContinuousTracker, TrackedPoints};
use nanotrack_core::{AppResult, DaqError, Frame, TrackedPoint};
use nanotrack_storage::{TrackWriter, WriterState};
use ndarray::{Array2, ArrayView2, Zip};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::warn;

/// What flows between the steps of a chain.
#[derive(Debug, Clone)]
pub enum Datum {
    /// A camera frame
    Frame(Arc<Frame>),
    /// Candidate coordinates from a locator
    Locations {
        /// Frame the candidates were found on
        frame_index: u64,
        /// `(x, y)` pairs in pixels
        coords: Vec<(f64, f64)>,
    },
    /// Refined tracked points
    Points {
        /// Frame the points were refined on
        frame_index: u64,
        /// Current estimates, in list order
        points: Vec<TrackedPoint>,
    },
    /// Nothing left to process for this frame
    Empty,
}

impl Datum {
    /// Frame the datum was derived from.
    pub fn frame_index(&self) -> Option<u64> {
        match self {
            Datum::Frame(f) => Some(f.index),
            Datum::Locations { frame_index, .. } | Datum::Points { frame_index, .. } => {
                Some(*frame_index)
            }
            Datum::Empty => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Datum::Frame(_) => "frame",
            Datum::Locations { .. } => "locations",
            Datum::Points { .. } => "points",
            Datum::Empty => "empty",
        }
    }
}

fn unexpected(step: &str, expected: &str, got: &Datum) -> DaqError {
    DaqError::Configuration(format!(
        "step '{step}' expects {expected}, got {}",
        got.kind()
    ))
}

/// One stage of an analysis chain.
pub trait Step: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Transform the previous stage's output.
    fn apply(&mut self, input: Datum) -> AppResult<Datum>;
}

// =============================================================================
// Closure step
// =============================================================================

/// A step backed by a closure.
pub struct FnStep<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named step.
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnStep<F>
where
    F: FnMut(Datum) -> AppResult<Datum> + Send,
{
    FnStep {
        name: name.into(),
        f,
    }
}

impl<F> Step for FnStep<F>
where
    F: FnMut(Datum) -> AppResult<Datum> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, input: Datum) -> AppResult<Datum> {
        (self.f)(input)
    }
}

// =============================================================================
// Frame steps
// =============================================================================

/// Keeps the latest frame that reached it, for display consumers.
pub struct Snapshot {
    latest: Arc<RwLock<Option<Arc<Frame>>>>,
}

impl Snapshot {
    /// A new snapshot buffer.
    pub fn new() -> Self {
        Self {
            latest: Arc::new(RwLock::new(None)),
        }
    }

    /// Handle that reads the buffered frame from another thread.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            latest: Arc::clone(&self.latest),
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for Snapshot {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn apply(&mut self, input: Datum) -> AppResult<Datum> {
        if let Datum::Frame(frame) = &input {
            *self.latest.write() = Some(Arc::clone(frame));
        }
        Ok(input)
    }
}

/// Read side of a [`Snapshot`].
#[derive(Clone)]
pub struct SnapshotReader {
    latest: Arc<RwLock<Option<Arc<Frame>>>>,
}

impl SnapshotReader {
    /// The most recent frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.read().clone()
    }
}

/// Subtracts a fixed background, saturating at zero.
///
/// The background is either given up front or taken from the first frame
/// the step sees. The input frame is never modified in place while shared.
pub struct BackgroundSubtract {
    background: Option<Array2<u16>>,
}

impl BackgroundSubtract {
    /// Subtract `background` (rows x columns) from every frame.
    pub fn new(background: Array2<u16>) -> Self {
        Self {
            background: Some(background),
        }
    }

    /// Use the first frame seen as the background.
    pub fn from_first_frame() -> Self {
        Self { background: None }
    }
}

impl Step for BackgroundSubtract {
    fn name(&self) -> &str {
        "background_subtract"
    }

    fn apply(&mut self, input: Datum) -> AppResult<Datum> {
        let mut frame = match input {
            Datum::Frame(frame) => frame,
            other => return Err(unexpected(self.name(), "a frame", &other)),
        };
        let Some(background) = self.background.as_ref() else {
            self.background = Some(frame.pixels.clone());
            return Ok(Datum::Frame(frame));
        };
        if background.dim() != frame.pixels.dim() {
            return Err(DaqError::Configuration(format!(
                "background is {:?}, frame {} is {:?}",
                background.dim(),
                frame.index,
                frame.pixels.dim()
            )));
        }
        let private = Arc::make_mut(&mut frame);
        Zip::from(&mut private.pixels)
            .and(background)
            .for_each(|p, &b| *p = p.saturating_sub(b));
        Ok(Datum::Frame(frame))
    }
}

// =============================================================================
// Localization and tracking
// =============================================================================

/// External peak finder returning candidate `(x, y)` coordinates.
pub trait Locator: Send {
    /// Candidates in `pixels` (rows x columns).
    fn locate(&self, pixels: ArrayView2<'_, u16>) -> AppResult<Vec<(f64, f64)>>;
}

impl<F> Locator for F
where
    F: Fn(ArrayView2<'_, u16>) -> AppResult<Vec<(f64, f64)>> + Send,
{
    fn locate(&self, pixels: ArrayView2<'_, u16>) -> AppResult<Vec<(f64, f64)>> {
        self(pixels)
    }
}

/// Runs a [`Locator`] on each frame.
pub struct Locate<L> {
    locator: L,
}

impl<L: Locator> Locate<L> {
    /// Step around `locator`.
    pub fn new(locator: L) -> Self {
        Self { locator }
    }
}

impl<L: Locator> Step for Locate<L> {
    fn name(&self) -> &str {
        "locate"
    }

    fn apply(&mut self, input: Datum) -> AppResult<Datum> {
        let Datum::Frame(frame) = &input else {
            return Err(unexpected(self.name(), "a frame", &input));
        };
        Ok(Datum::Locations {
            frame_index: frame.index,
            coords: self.locator.locate(frame.pixels.view())?,
        })
    }
}

/// Refines the shared tracked-point list against each frame.
pub struct Track {
    tracker: ContinuousTracker,
    points: TrackedPoints,
}

impl Track {
    /// Step refining `points` with `tracker`.
    pub fn new(tracker: ContinuousTracker, points: TrackedPoints) -> Self {
        Self { tracker, points }
    }
}

impl Step for Track {
    fn name(&self) -> &str {
        "track"
    }

    fn apply(&mut self, input: Datum) -> AppResult<Datum> {
        let Datum::Frame(frame) = &input else {
            return Err(unexpected(self.name(), "a frame", &input));
        };
        let tracker = self.tracker;
        let points = self.points.update(|points| {
            tracker.refine(frame.pixels.view(), points);
            points.to_vec()
        });
        Ok(Datum::Points {
            frame_index: frame.index,
            points,
        })
    }
}

/// Appends each [`Datum::Points`] to a shared [`TrackWriter`].
///
/// The writer stays reachable by the host, which finishes it when the
/// capture stops. Once the writer has closed on an error the step passes
/// data through without writing.
pub struct SaveTracks {
    writer: Arc<Mutex<TrackWriter>>,
}

impl SaveTracks {
    /// Step writing through `writer`.
    pub fn new(writer: Arc<Mutex<TrackWriter>>) -> Self {
        Self { writer }
    }
}

impl Step for SaveTracks {
    fn name(&self) -> &str {
        "save_tracks"
    }

    fn apply(&mut self, input: Datum) -> AppResult<Datum> {
        let Datum::Points {
            frame_index,
            points,
        } = &input
        else {
            return Err(unexpected(self.name(), "points", &input));
        };
        let mut writer = self.writer.lock();
        if writer.state() != WriterState::Open {
            return Ok(input);
        }
        writer.write(*frame_index, points)?;
        Ok(input)
    }
}

/// Publishes whatever passes through on a bus topic.
pub struct Publish {
    publisher: Publisher,
    topic: String,
}

impl Publish {
    /// Step publishing on `topic`.
    pub fn new(publisher: Publisher, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

impl Step for Publish {
    fn name(&self) -> &str {
        "publish"
    }

    fn apply(&mut self, input: Datum) -> AppResult<Datum> {
        let payload = match &input {
            Datum::Frame(frame) => Payload::Frame(Arc::clone(frame)),
            Datum::Points {
                frame_index,
                points,
            } => Payload::Points {
                frame_index: *frame_index,
                points: points.clone(),
            },
            Datum::Locations {
                frame_index,
                coords,
            } => Payload::Points {
                frame_index: *frame_index,
                points: coords.iter().map(|&(x, y)| TrackedPoint::new(x, y)).collect(),
            },
            Datum::Empty => return Ok(input),
        };
        if !self.publisher.publish(&self.topic, payload) {
            warn!(topic = %self.topic, "Publish dropped");
        }
        Ok(input)
    }
}
