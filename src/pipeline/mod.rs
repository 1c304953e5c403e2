//! Processing pipeline run on the capture thread.
//!
//! For every frame, in this order:
//!
//! 1. the frame becomes the *current frame* exposed to the host;
//! 2. the persist slot, if one is installed, writes it;
//! 3. each analysis chain runs, sequentially, in registration order.
//!
//! The chain list is copy-on-write: the capture thread clones an `Arc` of the
//! current list once per frame and runs it without holding any lock, so the
//! host (or a step) may add or remove chains mid-flight. A failing or
//! panicking step ends only its own chain for that frame; the error is
//! logged and counted.
//!
//! The persist sink is taken out of its slot for the duration of a write, so
//! no lock is held while it runs. A sink may install or remove sinks from
//! inside its own `write`; the sink that was writing is then finished once
//! the write returns.
//!
//! A persist failure is different: the sink is uninstalled and aborted, and
//! the error is kept for the host ([`Pipeline::take_persist_error`]).

pub mod steps;

use crate::acquisition::Consumer;
use nanotrack_core::{AppResult, DaqError, Frame};
use nanotrack_storage::ImageWriter;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, trace};

pub use steps::{Datum, Step};

/// Destination of the persist slot.
pub trait FrameSink: Send {
    /// Persist one frame.
    fn write(&mut self, frame: &Frame) -> AppResult<()>;

    /// Close cleanly.
    fn finish(&mut self) -> AppResult<()>;

    /// Close without marking the data finished.
    fn abort(&mut self);
}

impl FrameSink for ImageWriter {
    fn write(&mut self, frame: &Frame) -> AppResult<()> {
        ImageWriter::write(self, frame)?;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        Ok(ImageWriter::finish(self)?)
    }

    fn abort(&mut self) {
        ImageWriter::abort(self);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Chain {
    name: String,
    steps: Mutex<Vec<Box<dyn Step>>>,
}

impl Chain {
    fn run(&self, frame: Arc<Frame>) -> AppResult<()> {
        let mut steps = self.steps.lock();
        let mut datum = Datum::Frame(frame);
        for step in steps.iter_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| step.apply(datum)));
            datum = match outcome {
                Ok(Ok(Datum::Empty)) => return Ok(()),
                Ok(Ok(next)) => next,
                Ok(Err(e)) => return Err(DaqError::step(&self.name, step.name(), e.to_string())),
                Err(panic) => {
                    return Err(DaqError::step(
                        &self.name,
                        step.name(),
                        format!("panicked: {}", panic_message(panic.as_ref())),
                    ))
                }
            };
        }
        Ok(())
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames processed
    pub frames: u64,
    /// Frames handed to the persist slot successfully
    pub persisted: u64,
    /// Persist failures (each uninstalls the sink)
    pub persist_failures: u64,
    /// Chain runs ended by a failing step
    pub step_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    step_failures: AtomicU64,
}

#[derive(Default)]
struct PersistSlot {
    sink: Option<Box<dyn FrameSink>>,
    /// Thread writing with the sink taken out of the slot.
    writer: Option<ThreadId>,
    /// Slot changed during the write; the writing sink is not put back.
    replaced: bool,
}

/// Frame fan-out to the persist slot and the analysis chains.
#[derive(Default)]
pub struct Pipeline {
    current: RwLock<Option<Arc<Frame>>>,
    persist: Mutex<PersistSlot>,
    persist_idle: Condvar,
    persist_error: Mutex<Option<DaqError>>,
    chains: RwLock<Arc<Vec<Arc<Chain>>>>,
    counters: Counters,
}

impl Pipeline {
    /// Empty pipeline: no persist sink, no chains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the persist sink, returning the one it replaces.
    ///
    /// Takes effect from the next frame.
    /// Called from inside the writing sink, the writing sink is finished
    /// after its write instead of being returned.
    pub fn set_save_func(&self, sink: Box<dyn FrameSink>) -> Option<Box<dyn FrameSink>> {
        let mut slot = self.idle_slot();
        if slot.writer.is_some() {
            slot.replaced = true;
        }
        let previous = slot.sink.replace(sink);
        debug!(replaced = previous.is_some(), "Persist sink installed");
        previous
    }

    /// Remove the persist sink and hand it back so it can be finished.
    ///
    /// Waits for a write already in progress on another thread. Called from
    /// inside the writing sink it returns `None` and the sink is finished
    /// once its write returns.
    pub fn unset_save_func(&self) -> Option<Box<dyn FrameSink>> {
        let mut slot = self.idle_slot();
        if slot.writer.is_some() {
            slot.replaced = true;
        }
        slot.sink.take()
    }

    /// True while a persist sink is installed.
    pub fn is_saving(&self) -> bool {
        let slot = self.persist.lock();
        slot.sink.is_some() || (slot.writer.is_some() && !slot.replaced)
    }

    fn idle_slot(&self) -> MutexGuard<'_, PersistSlot> {
        let me = thread::current().id();
        let mut slot = self.persist.lock();
        while slot.writer.is_some_and(|writer| writer != me) {
            self.persist_idle.wait(&mut slot);
        }
        slot
    }

    /// Add a chain under `name`, replacing any chain of the same name.
    pub fn add_chain(&self, name: &str, steps: Vec<Box<dyn Step>>) {
        let chain = Arc::new(Chain {
            name: name.to_string(),
            steps: Mutex::new(steps),
        });
        let mut list = self.chains.write();
        let mut next: Vec<Arc<Chain>> = list.iter().filter(|c| c.name != name).cloned().collect();
        let replaced = next.len() != list.len();
        next.push(chain);
        *list = Arc::new(next);
        info!(chain = name, replaced, "Chain added");
    }

    /// Remove the chain called `name`. Returns `false` if there was none.
    pub fn remove_chain(&self, name: &str) -> bool {
        let mut list = self.chains.write();
        let next: Vec<Arc<Chain>> = list.iter().filter(|c| c.name != name).cloned().collect();
        let removed = next.len() != list.len();
        if removed {
            *list = Arc::new(next);
            info!(chain = name, "Chain removed");
        }
        removed
    }

    /// Remove every chain.
    pub fn clear_chains(&self) {
        *self.chains.write() = Arc::new(Vec::new());
    }

    /// Chain names in execution order.
    pub fn chain_names(&self) -> Vec<String> {
        self.chains.read().iter().map(|c| c.name.clone()).collect()
    }

    /// The most recent frame.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.current.read().clone()
    }

    /// The error that uninstalled the persist sink, if any. Cleared by this call.
    pub fn take_persist_error(&self) -> Option<DaqError> {
        self.persist_error.lock().take()
    }

    /// Counters since construction.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
            step_failures: self.counters.step_failures.load(Ordering::Relaxed),
        }
    }

    /// Run one frame through the pipeline.
    pub fn process(&self, frame: Frame) {
        let frame = Arc::new(frame);
        *self.current.write() = Some(Arc::clone(&frame));
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        trace!(frame = frame.index, "Processing");

        self.persist(&frame);

        let chains = Arc::clone(&*self.chains.read());
        for chain in chains.iter() {
            if let Err(e) = chain.run(Arc::clone(&frame)) {
                self.counters.step_failures.fetch_add(1, Ordering::Relaxed);
                error!(frame = frame.index, error = %e, "Chain step failed");
            }
        }
    }

    fn persist(&self, frame: &Frame) {
        let mut sink = {
            let mut slot = self.persist.lock();
            let Some(sink) = slot.sink.take() else {
                return;
            };
            slot.writer = Some(thread::current().id());
            slot.replaced = false;
            sink
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| sink.write(frame)));

        let replaced = {
            let mut slot = self.persist.lock();
            let replaced = std::mem::take(&mut slot.replaced);
            if !replaced && matches!(outcome, Ok(Ok(()))) {
                slot.sink = Some(sink);
                slot.writer = None;
                self.persist_idle.notify_all();
                drop(slot);
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                return;
            }
            replaced
        };

        // still marked as writer: callers waiting on the slot see the outcome
        if let Some(error) = self.close_detached(frame, sink, outcome, replaced) {
            error!(frame = frame.index, error = %error, replaced, "Persist failed, sink removed");
            self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            let mut stored = self.persist_error.lock();
            if stored.is_none() {
                *stored = Some(error);
            }
        }

        let mut slot = self.persist.lock();
        slot.writer = None;
        self.persist_idle.notify_all();
    }

    /// Finish a sink that was swapped out during its write, or abort one whose
    /// write failed. Returns the error to report.
    fn close_detached(
        &self,
        frame: &Frame,
        mut sink: Box<dyn FrameSink>,
        outcome: std::thread::Result<AppResult<()>>,
        replaced: bool,
    ) -> Option<DaqError> {
        match outcome {
            Ok(Ok(())) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                debug!(frame = frame.index, replaced, "Persist sink detached during write, finishing");
                sink.finish().err()
            }
            Ok(Err(e)) => {
                sink.abort();
                Some(e)
            }
            Err(panic) => {
                sink.abort();
                Some(DaqError::Persistence(format!(
                    "persist sink panicked: {}",
                    panic_message(panic.as_ref())
                )))
            }
        }
    }
}

impl Consumer<Frame> for Pipeline {
    fn consume(&self, frame: Frame) {
        self.process(frame);
    }
}
