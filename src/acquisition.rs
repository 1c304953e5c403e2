//! Capture thread lifecycle.
//!
//! An [`AcquisitionLoop`] owns one device and one dedicated OS thread. While
//! running it pulls everything the device has ready and hands each item, in
//! arrival order, to a [`Consumer`]. Nothing is dropped on the producer side:
//! a slow consumer slows the loop down.
//!
//! The device moves into the thread on `start()` and comes back on `stop()`,
//! so a stopped loop can be reconfigured through [`AcquisitionLoop::with_device`]
//! and started again.
//!
//! ```rust,ignore
//! let feed = CameraFeed::new(Box::new(MockCamera::new(128, 128)));
//! let capture = AcquisitionLoop::new(feed, pipeline.clone(), Duration::from_micros(200));
//! capture.start()?;
//! // ...
//! capture.stop();
//! if let Some(err) = capture.take_error() {
//!     error!(error = %err, "Capture ended with a device error");
//! }
//! ```

use crate::pipeline::panic_message;
use nanotrack_core::{
    AcquisitionMode, AnalogSource, AnalogWindow, AppResult, DaqError, DeviceError,
    DeviceErrorKind, DeviceResult, Frame, FrameSource, StopSignal,
};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Device adapters
// =============================================================================

/// A device the capture loop can drive.
pub trait Acquire: Send + 'static {
    /// What one read yields an element of.
    type Item: Send + 'static;

    /// Device name for logs.
    fn name(&self) -> &str;

    /// Put the device into free run. Called once per `start()`.
    fn begin(&mut self) -> DeviceResult<()>;

    /// Everything that is ready, possibly nothing.
    fn read_available(&mut self) -> DeviceResult<Vec<Self::Item>>;

    /// Leave free run. Called once when the thread exits.
    fn end(&mut self) -> DeviceResult<()>;
}

/// Receives every item a capture loop produces, on the capture thread.
pub trait Consumer<T>: Send + Sync {
    /// Handle one item. Must not block indefinitely.
    fn consume(&self, item: T);
}

impl<T, F> Consumer<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn consume(&self, item: T) {
        self(item)
    }
}

/// Drives a [`FrameSource`] in continuous mode.
pub struct CameraFeed {
    camera: Box<dyn FrameSource>,
}

impl CameraFeed {
    /// Wrap a camera.
    pub fn new(camera: Box<dyn FrameSource>) -> Self {
        Self { camera }
    }

    /// The wrapped camera.
    pub fn camera(&self) -> &dyn FrameSource {
        self.camera.as_ref()
    }

    /// The wrapped camera, mutably.
    pub fn camera_mut(&mut self) -> &mut dyn FrameSource {
        self.camera.as_mut()
    }
}

impl Acquire for CameraFeed {
    type Item = Frame;

    fn name(&self) -> &str {
        self.camera.name()
    }

    fn begin(&mut self) -> DeviceResult<()> {
        self.camera.set_mode(AcquisitionMode::Continuous)?;
        self.camera.start_acquisition()
    }

    fn read_available(&mut self) -> DeviceResult<Vec<Frame>> {
        self.camera.read_frames()
    }

    fn end(&mut self) -> DeviceResult<()> {
        self.camera.stop_acquisition()
    }
}

/// Drives an [`AnalogSource`] at a fixed rate and window length.
pub struct AnalogFeed {
    source: Box<dyn AnalogSource>,
    frequency_hz: f64,
    window_len: usize,
}

impl AnalogFeed {
    /// Wrap a digitizer streaming `window_len` samples per window at `frequency_hz`.
    pub fn new(source: Box<dyn AnalogSource>, frequency_hz: f64, window_len: usize) -> Self {
        Self {
            source,
            frequency_hz,
            window_len,
        }
    }

    /// The wrapped digitizer.
    pub fn source(&self) -> &dyn AnalogSource {
        self.source.as_ref()
    }

    /// Sample rate used on the next start.
    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    /// Window length used on the next start.
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Change the stream parameters for the next start.
    pub fn configure(&mut self, frequency_hz: f64, window_len: usize) {
        self.frequency_hz = frequency_hz;
        self.window_len = window_len;
    }
}

impl Acquire for AnalogFeed {
    type Item = AnalogWindow;

    fn name(&self) -> &str {
        self.source.name()
    }

    fn begin(&mut self) -> DeviceResult<()> {
        self.source.start_stream(self.frequency_hz, self.window_len)
    }

    fn read_available(&mut self) -> DeviceResult<Vec<AnalogWindow>> {
        self.source.read_windows()
    }

    fn end(&mut self) -> DeviceResult<()> {
        self.source.stop_stream()
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Counters for one capture loop, cumulative across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Items handed to the consumer
    pub items: u64,
    /// Reads that returned nothing
    pub empty_reads: u64,
    /// Runs ended by a device error
    pub errors: u64,
    /// Completed start/stop cycles
    pub runs: u64,
}

#[derive(Default)]
struct Counters {
    items: AtomicU64,
    empty_reads: AtomicU64,
    errors: AtomicU64,
    runs: AtomicU64,
}

/// Owns a device and the thread that reads it.
pub struct AcquisitionLoop<A: Acquire> {
    name: String,
    device: Mutex<Option<A>>,
    consumer: Arc<dyn Consumer<A::Item>>,
    stop: StopSignal,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<A>>>,
    last_error: Arc<Mutex<Option<DaqError>>>,
    counters: Arc<Counters>,
    idle_sleep: Duration,
}

impl<A: Acquire> AcquisitionLoop<A> {
    /// Idle loop over `device`, feeding `consumer`. `idle_sleep` is the pause
    /// after a read that returned nothing.
    pub fn new(device: A, consumer: Arc<dyn Consumer<A::Item>>, idle_sleep: Duration) -> Self {
        Self {
            name: device.name().to_string(),
            device: Mutex::new(Some(device)),
            consumer,
            stop: StopSignal::new(),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
            counters: Arc::new(Counters::default()),
            idle_sleep,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the capture thread.
    ///
    /// Fails with [`DaqError::AlreadyRunning`] while a previous thread is
    /// alive; exactly one thread runs per loop. A thread that already ended
    /// on a device error is reaped first, so the loop can be restarted
    /// without an explicit `stop()`.
    pub fn start(&self) -> AppResult<()> {
        let mut handle = self.handle.lock();
        if let Some(h) = handle.as_ref() {
            if !h.is_finished() {
                return Err(DaqError::AlreadyRunning);
            }
        }
        if let Some(finished) = handle.take() {
            self.reclaim(finished);
        }

        let mut device = self.device.lock().take().ok_or(DaqError::Shutdown)?;
        if let Err(e) = device.begin() {
            error!(device = %self.name, error = %e, "Failed to start acquisition");
            *self.device.lock() = Some(device);
            return Err(e.into());
        }

        self.stop.reset();
        self.running.store(true, Ordering::SeqCst);

        let stop = self.stop.clone();
        let running = Arc::clone(&self.running);
        let consumer = Arc::clone(&self.consumer);
        let last_error = Arc::clone(&self.last_error);
        let counters = Arc::clone(&self.counters);
        let idle_sleep = self.idle_sleep;
        let name = self.name.clone();

        let spawned = thread::Builder::new()
            .name(format!("capture-{name}"))
            .spawn(move || {
                debug!(device = %name, "Capture thread started");
                while !stop.is_triggered() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| match device.read_available() {
                        Ok(items) if items.is_empty() => {
                            counters.empty_reads.fetch_add(1, Ordering::Relaxed);
                            thread::sleep(idle_sleep);
                            Ok(())
                        }
                        Ok(items) => {
                            trace!(device = %name, n = items.len(), "Read");
                            for item in items {
                                consumer.consume(item);
                                counters.items.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }));
                    let failure = match outcome {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e,
                        Err(panic) => DeviceError::new(
                            &name,
                            DeviceErrorKind::Other,
                            format!("capture thread panicked: {}", panic_message(panic.as_ref())),
                        ),
                    };
                    error!(device = %name, error = %failure, "Capture failed, stopping");
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    *last_error.lock() = Some(DaqError::Device(failure));
                    break;
                }
                if let Err(e) = device.end() {
                    warn!(device = %name, error = %e, "Failed to stop acquisition cleanly");
                }
                running.store(false, Ordering::SeqCst);
                debug!(device = %name, "Capture thread exiting");
                device
            });

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                info!(device = %self.name, "Started acquisition");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(DaqError::Io(e))
            }
        }
    }

    /// Signal the thread and wait for it. A no-op when nothing is running.
    ///
    /// Bounded by at most one in-flight device read.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.stop.trigger();
        self.reclaim(handle);
        info!(
            device = %self.name,
            items = self.counters.items.load(Ordering::Relaxed),
            "Stopped acquisition"
        );
    }

    fn reclaim(&self, handle: JoinHandle<A>) {
        match handle.join() {
            Ok(device) => *self.device.lock() = Some(device),
            Err(panic) => {
                let message = format!(
                    "capture thread panicked while stopping, device lost: {}",
                    panic_message(panic.as_ref())
                );
                error!(device = %self.name, "{message}");
                *self.last_error.lock() = Some(DaqError::Device(DeviceError::new(
                    &self.name,
                    DeviceErrorKind::Other,
                    message,
                )));
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.counters.runs.fetch_add(1, Ordering::Relaxed);
    }

    /// True while the capture thread is reading.
    ///
    /// Turns false on its own when a device error ends the thread.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The error that ended the last run, if any. Cleared by this call.
    pub fn take_error(&self) -> Option<DaqError> {
        self.last_error.lock().take()
    }

    /// Run `f` against the idle device.
    ///
    /// Fails with [`DaqError::AlreadyRunning`] while the thread holds it.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut A) -> R) -> AppResult<R> {
        if self.handle.lock().is_some() {
            return Err(DaqError::AlreadyRunning);
        }
        let mut device = self.device.lock();
        let device = device.as_mut().ok_or(DaqError::Shutdown)?;
        Ok(f(device))
    }

    /// Cumulative counters.
    pub fn stats(&self) -> LoopStats {
        LoopStats {
            items: self.counters.items.load(Ordering::Relaxed),
            empty_reads: self.counters.empty_reads.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            runs: self.counters.runs.load(Ordering::Relaxed),
        }
    }
}

impl<A: Acquire> Drop for AcquisitionLoop<A> {
    fn drop(&mut self) {
        self.stop();
    }
}
