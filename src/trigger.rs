//! Trigger / DAQ synchronizer.
//!
//! Consumes sequential two-channel windows (channel 0 the signal to keep,
//! channel 1 the trigger line), finds threshold crossings on channel 1 and
//! reports them as absolute sample indices. The level carried over from the
//! previous window is prepended to each new one, so an edge that straddles
//! a window boundary is found exactly once and at the same index whatever
//! the window length.

use crate::acquisition::Consumer;
use crate::bus::{Payload, Publisher};
use nanotrack_core::{AnalogWindow, AppResult, DaqError};
use nanotrack_storage::{TriggerWriter, WriterState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Logic threshold in volts: strictly above is high.
pub const DEFAULT_THRESHOLD: f64 = 1.6;

/// Transition direction to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Low to high
    #[default]
    Rising,
    /// High to low
    Falling,
}

/// Stateful edge finder over a windowed stream.
#[derive(Debug, Clone)]
pub struct EdgeDetector {
    threshold: f64,
    edge: Edge,
    previous_level: Option<f64>,
    samples_consumed: u64,
    windows_seen: u64,
}

impl EdgeDetector {
    /// Detector for `edge` transitions across `threshold` volts.
    pub fn new(threshold: f64, edge: Edge) -> Self {
        Self {
            threshold,
            edge,
            previous_level: None,
            samples_consumed: 0,
            windows_seen: 0,
        }
    }

    /// Absolute indices of the matching transitions in the next window.
    ///
    /// The index of an edge is that of the first sample on the new side of
    /// the threshold. The first window seeds the carried level from its own
    /// first sample, so the stream never opens with a spurious edge.
    pub fn process(&mut self, trigger: &[f64]) -> Vec<i64> {
        let Some(&first) = trigger.first() else {
            return Vec::new();
        };
        let offset = self.samples_consumed as i64;
        let mut was_high = self.previous_level.unwrap_or(first) > self.threshold;

        let mut edges = Vec::new();
        for (i, &level) in trigger.iter().enumerate() {
            let high = level > self.threshold;
            let hit = match self.edge {
                Edge::Rising => high && !was_high,
                Edge::Falling => !high && was_high,
            };
            if hit {
                edges.push(offset + i as i64);
            }
            was_high = high;
        }

        self.previous_level = trigger.last().copied();
        self.samples_consumed += trigger.len() as u64;
        self.windows_seen += 1;
        edges
    }

    /// Forget the carried level and restart the index space at zero.
    pub fn reset(&mut self) {
        self.previous_level = None;
        self.samples_consumed = 0;
        self.windows_seen = 0;
    }

    /// Samples consumed so far, i.e. the absolute index of the next sample.
    pub fn samples_consumed(&self) -> u64 {
        self.samples_consumed
    }

    /// Windows consumed so far.
    pub fn windows_seen(&self) -> u64 {
        self.windows_seen
    }

    /// Direction being reported.
    pub fn edge(&self) -> Edge {
        self.edge
    }
}

struct State {
    detector: EdgeDetector,
    writer: Option<TriggerWriter>,
    publisher: Option<(Publisher, String)>,
}

/// Runs an [`EdgeDetector`] on the DAQ thread and persists the signal
/// channel with the edges found in each window.
pub struct TriggerSynchronizer {
    state: Mutex<State>,
    last_error: Mutex<Option<DaqError>>,
    edges: AtomicU64,
}

impl TriggerSynchronizer {
    /// Synchronizer with nothing attached.
    pub fn new(threshold: f64, edge: Edge) -> Self {
        Self {
            state: Mutex::new(State {
                detector: EdgeDetector::new(threshold, edge),
                writer: None,
                publisher: None,
            }),
            last_error: Mutex::new(None),
            edges: AtomicU64::new(0),
        }
    }

    /// Attach a writer for the next run. Resets the detector so indices
    /// start at zero with the writer's first window.
    pub fn set_writer(&self, writer: TriggerWriter) {
        let mut state = self.state.lock();
        state.detector.reset();
        state.writer = Some(writer);
    }

    /// Detach the writer and stamp it finished.
    ///
    /// A writer already closed by a write failure is not stamped.
    pub fn finish_writer(&self) -> AppResult<()> {
        let writer = self.state.lock().writer.take();
        match writer {
            Some(mut w) if w.state() == WriterState::Open => {
                w.finish().map_err(DaqError::from)
            }
            _ => Ok(()),
        }
    }

    /// Republish channel 0 of every window on `topic`.
    pub fn set_publisher(&self, publisher: Publisher, topic: &str) {
        self.state.lock().publisher = Some((publisher, topic.to_string()));
    }

    /// The error that closed the writer, if any. Cleared by this call.
    pub fn take_error(&self) -> Option<DaqError> {
        self.last_error.lock().take()
    }

    /// Edges detected since construction.
    pub fn edges_detected(&self) -> u64 {
        self.edges.load(Ordering::Relaxed)
    }

    /// Absolute index of the next sample.
    pub fn samples_consumed(&self) -> u64 {
        self.state.lock().detector.samples_consumed()
    }

    fn handle(&self, window: &AnalogWindow) -> AppResult<()> {
        let (Some(signal), Some(trigger)) = (window.channel(0), window.channel(1)) else {
            return Err(DaqError::Configuration(format!(
                "trigger synchronization needs two channels, window {} has {}",
                window.index,
                window.channel_count()
            )));
        };
        let signal: Vec<f64> = signal.iter().copied().collect();
        let trigger: Vec<f64> = trigger.iter().copied().collect();

        let mut state = self.state.lock();
        let edges = state.detector.process(&trigger);
        if !edges.is_empty() {
            debug!(window = window.index, n = edges.len(), first = edges[0], "Trigger edges");
            self.edges.fetch_add(edges.len() as u64, Ordering::Relaxed);
        }
        if let Some((publisher, topic)) = &state.publisher {
            publisher.publish(topic, Payload::Samples(signal.clone()));
        }
        if let Some(writer) = state.writer.as_mut() {
            if let Err(e) = writer.write(&signal, &edges) {
                state.writer = None;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

impl Consumer<AnalogWindow> for TriggerSynchronizer {
    fn consume(&self, window: AnalogWindow) {
        if let Err(e) = self.handle(&window) {
            error!(window = window.index, error = %e, "Trigger synchronizer failed");
            let mut slot = self.last_error.lock();
            if slot.is_none() {
                *slot = Some(e);
            }
        }
    }
}
