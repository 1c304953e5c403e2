//! Experiment orchestration.
//!
//! An [`Experiment`] owns one camera, an optional digitizer, the processing
//! pipeline, the broadcast bus and the session file, and exposes the
//! operator-level operations: free run, capture to disk, monitor
//! coordinates, ROI changes, single snaps and finalization.
//!
//! Threads:
//!
//! - the camera loop runs the pipeline (persist slot, `display` chain,
//!   `tracking` chain) frame by frame;
//! - the DAQ loop, while capturing, runs the trigger synchronizer;
//! - the bus forwarder delivers to subscribers.
//!
//! Topics published: [`FRAMES_TOPIC`], [`TRACKS_TOPIC`], [`DAQ_TOPIC`].

use crate::acquisition::{AcquisitionLoop, AnalogFeed, CameraFeed, Consumer, LoopStats};
use crate::bus::{BroadcastBus, Subscription};
use crate::config::NanotrackConfig;
use crate::pipeline::steps::{Publish, SaveTracks, Track};
use crate::pipeline::{Pipeline, Step};
use crate::tracker::{ContinuousTracker, TrackedPoints};
use crate::trigger::TriggerSynchronizer;
use nanotrack_core::{
    AnalogSource, AnalogWindow, AppResult, DaqError, DeviceResult, Frame, FrameSource, Roi,
    TrackedPoint,
};
use nanotrack_storage::{
    FileWrangler, ImageWriter, MemoryStore, TrackWriter, TriggerWriter, WriterState,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Every camera frame.
pub const FRAMES_TOPIC: &str = "frames";
/// Tracked points after each frame.
pub const TRACKS_TOPIC: &str = "tracks";
/// Channel 0 of every DAQ window.
pub const DAQ_TOPIC: &str = "daq";

/// Name of the chain that republishes frames.
pub const DISPLAY_CHAIN: &str = "display";
/// Name of the chain that refines, saves and publishes tracked points.
pub const TRACKING_CHAIN: &str = "tracking";

struct Capture {
    group: String,
    tracks: Arc<Mutex<TrackWriter>>,
    started_camera: bool,
}

/// Log every error and hand back the first.
fn first_error(context: &str, errors: Vec<DaqError>) -> AppResult<()> {
    let mut errors = errors.into_iter();
    let Some(first) = errors.next() else {
        return Ok(());
    };
    for other in errors {
        error!(context, error = %other, "Additional error");
    }
    Err(first)
}

/// Camera + DAQ + pipeline + session file.
pub struct Experiment {
    config: NanotrackConfig,
    camera: AcquisitionLoop<CameraFeed>,
    daq: Option<AcquisitionLoop<AnalogFeed>>,
    pipeline: Arc<Pipeline>,
    synchronizer: Arc<TriggerSynchronizer>,
    bus: BroadcastBus,
    wrangler: Mutex<FileWrangler>,
    tracker: ContinuousTracker,
    points: TrackedPoints,
    capture: Mutex<Option<Capture>>,
    finalized: AtomicBool,
}

impl Experiment {
    /// Wire the runtime around an already opened session.
    ///
    /// Nothing is started: call [`start_free_run`](Self::start_free_run)
    /// or [`start_capture`](Self::start_capture).
    pub fn new(
        config: NanotrackConfig,
        camera: Box<dyn FrameSource>,
        daq: Option<Box<dyn AnalogSource>>,
        wrangler: FileWrangler,
    ) -> AppResult<Self> {
        config.validate().map_err(DaqError::Configuration)?;

        let bus = BroadcastBus::start(config.bus_config())?;
        let pipeline = Arc::new(Pipeline::new());
        let synchronizer = Arc::new(TriggerSynchronizer::new(
            config.trigger.threshold_volts,
            config.trigger.edge,
        ));
        synchronizer.set_publisher(bus.publisher(), DAQ_TOPIC);

        let frames: Arc<dyn Consumer<Frame>> = pipeline.clone();
        let camera = AcquisitionLoop::new(CameraFeed::new(camera), frames, config.idle_sleep());
        let daq = daq.map(|source| {
            let windows: Arc<dyn Consumer<AnalogWindow>> = synchronizer.clone();
            AcquisitionLoop::new(
                AnalogFeed::new(source, config.trigger.frequency_hz, config.trigger.window_len),
                windows,
                config.idle_sleep(),
            )
        });

        let experiment = Self {
            tracker: ContinuousTracker::new(config.tracker.radius),
            points: TrackedPoints::new(),
            config,
            camera,
            daq,
            pipeline,
            synchronizer,
            bus,
            wrangler: Mutex::new(wrangler),
            capture: Mutex::new(None),
            finalized: AtomicBool::new(false),
        };
        experiment.pipeline.add_chain(
            DISPLAY_CHAIN,
            vec![Box::new(Publish::new(experiment.bus.publisher(), FRAMES_TOPIC))],
        );
        experiment
            .pipeline
            .add_chain(TRACKING_CHAIN, experiment.tracking_steps(None));

        info!(
            session = %experiment.session_path().display(),
            daq = experiment.daq.is_some(),
            "Experiment ready"
        );
        Ok(experiment)
    }

    /// Experiment whose session lives in memory.
    pub fn in_memory(
        config: NanotrackConfig,
        camera: Box<dyn FrameSource>,
        daq: Option<Box<dyn AnalogSource>>,
    ) -> AppResult<Self> {
        let wrangler = FileWrangler::in_memory(config.session_path())?;
        Self::new(config, camera, daq, wrangler)
    }

    /// Experiment writing a new HDF5 file under `storage.directory`.
    ///
    /// An existing file of the same name is never overwritten.
    #[cfg(feature = "storage_hdf5")]
    pub fn create(
        config: NanotrackConfig,
        camera: Box<dyn FrameSource>,
        daq: Option<Box<dyn AnalogSource>>,
    ) -> AppResult<Self> {
        std::fs::create_dir_all(&config.storage.directory)?;
        let wrangler = FileWrangler::create(config.session_path())?;
        Self::new(config, camera, daq, wrangler)
    }

    fn tracking_steps(&self, writer: Option<Arc<Mutex<TrackWriter>>>) -> Vec<Box<dyn Step>> {
        let mut steps: Vec<Box<dyn Step>> =
            vec![Box::new(Track::new(self.tracker, self.points.clone()))];
        if let Some(writer) = writer {
            steps.push(Box::new(SaveTracks::new(writer)));
        }
        steps.push(Box::new(Publish::new(self.bus.publisher(), TRACKS_TOPIC)));
        steps
    }

    // =========================================================================
    // Free run
    // =========================================================================

    /// Start streaming camera frames through the pipeline.
    pub fn start_free_run(&self) -> AppResult<()> {
        self.camera.start()
    }

    /// Stop the camera. A capture in progress stays open but receives no
    /// frames until the camera is started again.
    pub fn stop_free_run(&self) {
        self.camera.stop();
    }

    /// True while the camera thread is reading.
    pub fn is_free_running(&self) -> bool {
        self.camera.is_running()
    }

    // =========================================================================
    // Capture
    // =========================================================================

    /// Begin recording into a new acquisition group.
    ///
    /// Installs the image writer in the persist slot, adds a track saver to
    /// the tracking chain and, with a digitizer, starts the DAQ loop with a
    /// trigger writer attached. The camera is started if it was idle.
    pub fn start_capture(&self) -> AppResult<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(DaqError::Shutdown);
        }
        let mut capture = self.capture.lock();
        if capture.is_some() {
            return Err(DaqError::AlreadyRunning);
        }

        let group = self.wrangler.lock().start_new_acquisition_group()?;
        let group_path = group.path().to_string();

        if let Some(daq) = &self.daq {
            let dtype = daq.with_device(|feed| feed.source().sample_dtype())?;
            self.synchronizer.set_writer(TriggerWriter::new(
                group.clone(),
                self.config.analog_writer_config(dtype),
            ));
        }

        let tracks = Arc::new(Mutex::new(TrackWriter::with_batch(
            group.clone(),
            self.config.storage.track_batch,
        )));
        if let Some(mut stale) = self.pipeline.set_save_func(Box::new(ImageWriter::new(
            group,
            self.config.image_writer_config(),
        ))) {
            stale.abort();
        }
        self.pipeline
            .add_chain(TRACKING_CHAIN, self.tracking_steps(Some(Arc::clone(&tracks))));

        *capture = Some(Capture {
            group: group_path.clone(),
            tracks,
            started_camera: false,
        });

        let started = self.start_streams();
        match started {
            Ok(started_camera) => {
                if let Some(c) = capture.as_mut() {
                    c.started_camera = started_camera;
                }
                info!(group = %group_path, "Capture started");
                Ok(())
            }
            Err(e) => {
                error!(group = %group_path, error = %e, "Capture failed to start");
                if let Some(c) = capture.take() {
                    self.abort_capture(c);
                }
                Err(e)
            }
        }
    }

    /// Start the DAQ, then the camera if idle. Returns whether the camera
    /// was started here.
    fn start_streams(&self) -> AppResult<bool> {
        if let Some(daq) = &self.daq {
            daq.start()?;
        }
        if self.camera.is_running() {
            return Ok(false);
        }
        match self.camera.start() {
            Ok(()) => Ok(true),
            Err(DaqError::AlreadyRunning) => Ok(false),
            Err(e) => {
                if let Some(daq) = &self.daq {
                    daq.stop();
                }
                Err(e)
            }
        }
    }

    fn abort_capture(&self, capture: Capture) {
        if let Some(daq) = &self.daq {
            daq.stop();
        }
        if let Some(mut sink) = self.pipeline.unset_save_func() {
            sink.abort();
        }
        self.pipeline
            .add_chain(TRACKING_CHAIN, self.tracking_steps(None));
        capture.tracks.lock().abort();
        if let Err(e) = self.synchronizer.finish_writer() {
            warn!(error = %e, "Trigger writer close failed");
        }
    }

    /// Stop recording and stamp `finished` on every dataset of the group.
    ///
    /// Returns the first error from the run (device, persistence or close);
    /// the rest are logged. The camera keeps running if it was already
    /// free-running before the capture.
    pub fn stop_capture(&self) -> AppResult<()> {
        let Some(capture) = self.capture.lock().take() else {
            return Err(DaqError::NotRunning);
        };
        let mut errors = Vec::new();

        if capture.started_camera {
            self.camera.stop();
        }
        if let Some(daq) = &self.daq {
            daq.stop();
            errors.extend(daq.take_error());
        }
        errors.extend(self.camera.take_error());

        if let Some(mut sink) = self.pipeline.unset_save_func() {
            if let Err(e) = sink.finish() {
                errors.push(e);
            }
        }
        errors.extend(self.pipeline.take_persist_error());

        self.pipeline
            .add_chain(TRACKING_CHAIN, self.tracking_steps(None));
        {
            let mut tracks = capture.tracks.lock();
            if tracks.state() == WriterState::Open {
                if let Err(e) = tracks.finish() {
                    errors.push(e.into());
                }
            }
        }

        errors.extend(self.synchronizer.take_error());
        if let Err(e) = self.synchronizer.finish_writer() {
            errors.push(e);
        }

        info!(
            group = %capture.group,
            frames = self.pipeline.stats().persisted,
            edges = self.synchronizer.edges_detected(),
            errors = errors.len(),
            "Capture stopped"
        );
        first_error("stop_capture", errors)
    }

    /// True between `start_capture` and `stop_capture`.
    pub fn is_capturing(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// Path of the acquisition group being recorded, if any.
    pub fn capture_group(&self) -> Option<String> {
        self.capture.lock().as_ref().map(|c| c.group.clone())
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    /// Start tracking a particle at `(x, y)`. Returns its position in the list.
    pub fn add_monitor_coordinate(&self, x: f64, y: f64) -> usize {
        let index = self.points.add_monitor_coordinate(x, y);
        info!(index, x, y, "Monitoring coordinate");
        index
    }

    /// Stop tracking every particle.
    pub fn clear_monitor_coordinates(&self) {
        self.points.clear_monitor_coordinates();
        info!("Cleared monitor coordinates");
    }

    /// Current estimates.
    pub fn tracked_points(&self) -> Vec<TrackedPoint> {
        self.points.snapshot()
    }

    // =========================================================================
    // Camera
    // =========================================================================

    /// Restrict the readout to `roi`, pausing the camera if it is running.
    ///
    /// Refused while capturing: the `Image` dataset has a fixed frame size.
    pub fn set_roi(&self, roi: Roi) -> AppResult<Roi> {
        self.reconfigure_camera(|camera| camera.set_roi(roi))
    }

    /// Return to full-sensor readout.
    pub fn clear_roi(&self) -> AppResult<Roi> {
        self.reconfigure_camera(|camera| camera.clear_roi())
    }

    fn reconfigure_camera(
        &self,
        f: impl FnOnce(&mut dyn FrameSource) -> DeviceResult<Roi>,
    ) -> AppResult<Roi> {
        if self.is_capturing() {
            return Err(DaqError::AlreadyRunning);
        }
        let was_running = self.camera.is_running();
        self.camera.stop();
        let applied = self.camera.with_device(|feed| f(feed.camera_mut()));
        if was_running {
            self.camera.start()?;
        }
        let roi = applied??;
        info!(?roi, "Camera ROI applied");
        Ok(roi)
    }

    /// Acquire one frame with the camera idle and run it through the
    /// pipeline, so it becomes the current frame.
    pub fn snap(&self) -> AppResult<Arc<Frame>> {
        if self.camera.is_running() {
            return Err(DaqError::AlreadyRunning);
        }
        let frame = self.camera.with_device(|feed| feed.camera_mut().snap())??;
        self.pipeline.process(frame);
        self.pipeline.current_frame().ok_or(DaqError::NotRunning)
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// The most recent frame.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.pipeline.current_frame()
    }

    /// The processing pipeline, for adding analysis chains.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// The broadcast bus.
    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }

    /// Subscribe to one of the published topics.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.bus.subscribe(topic)
    }

    /// Camera loop counters.
    pub fn camera_stats(&self) -> LoopStats {
        self.camera.stats()
    }

    /// DAQ loop counters, when a digitizer is attached.
    pub fn daq_stats(&self) -> Option<LoopStats> {
        self.daq.as_ref().map(AcquisitionLoop::stats)
    }

    /// Trigger edges found since construction.
    pub fn edges_detected(&self) -> u64 {
        self.synchronizer.edges_detected()
    }

    /// Errors recorded by the loops and writers since the last call.
    pub fn take_errors(&self) -> Vec<DaqError> {
        let mut errors: Vec<DaqError> = Vec::new();
        errors.extend(self.camera.take_error());
        if let Some(daq) = &self.daq {
            errors.extend(daq.take_error());
        }
        errors.extend(self.pipeline.take_persist_error());
        errors.extend(self.synchronizer.take_error());
        errors
    }

    /// Session file path.
    pub fn session_path(&self) -> PathBuf {
        self.wrangler.lock().path().to_path_buf()
    }

    /// The session store when it is memory backed.
    pub fn memory_store(&self) -> Option<MemoryStore> {
        self.wrangler.lock().memory_store().cloned()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop everything and close the session file. Runs once; later calls
    /// return `Ok(())`.
    pub fn finalize(&self) -> AppResult<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = Vec::new();
        if self.is_capturing() {
            if let Err(e) = self.stop_capture() {
                errors.push(e);
            }
        }
        self.camera.stop();
        if let Some(daq) = &self.daq {
            daq.stop();
        }
        self.bus.stop();
        if let Err(e) = self.wrangler.lock().close() {
            errors.push(e.into());
        }
        info!(session = %self.session_path().display(), "Experiment finalized");
        first_error("finalize", errors)
    }
}

impl Drop for Experiment {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!(error = %e, "Finalize on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotrack_driver_mock::{MockCamera, MockDaq, Spot};
    use std::time::Duration;

    fn config() -> NanotrackConfig {
        let mut config = NanotrackConfig::default();
        config.acquisition.idle_sleep_us = 100;
        config.bus.grace_ms = 5;
        config.tracker.radius = 6;
        config.trigger.window_len = 20;
        config
    }

    fn camera() -> Box<MockCamera> {
        Box::new(
            MockCamera::builder(32, 24)
                .spot(Spot::new(12.0, 10.0))
                .exposure(Duration::from_millis(1))
                .build(),
        )
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_free_run_updates_current_frame() {
        let experiment = Experiment::in_memory(config(), camera(), None).unwrap();
        assert!(experiment.current_frame().is_none());
        experiment.start_free_run().unwrap();
        assert!(matches!(
            experiment.start_free_run(),
            Err(DaqError::AlreadyRunning)
        ));
        wait_for(|| experiment.camera_stats().items >= 3);
        experiment.stop_free_run();
        experiment.stop_free_run();

        let frame = experiment.current_frame().unwrap();
        assert_eq!(frame.size(), (32, 24));
        assert!(!experiment.is_free_running());
    }

    #[test]
    fn test_capture_lifecycle_errors() {
        let experiment = Experiment::in_memory(config(), camera(), None).unwrap();
        assert!(matches!(experiment.stop_capture(), Err(DaqError::NotRunning)));
        experiment.start_capture().unwrap();
        assert!(matches!(
            experiment.start_capture(),
            Err(DaqError::AlreadyRunning)
        ));
        assert_eq!(
            experiment.capture_group().as_deref(),
            Some("/data/Acquisition_0")
        );
        assert!(matches!(
            experiment.set_roi(Roi::new([0, 8], [0, 8])),
            Err(DaqError::AlreadyRunning)
        ));
        experiment.stop_capture().unwrap();
        assert!(!experiment.is_capturing());
    }

    #[test]
    fn test_capture_writes_group_and_tracks() {
        let experiment = Experiment::in_memory(
            config(),
            camera(),
            Some(Box::new(MockDaq::new(10).realtime(true))),
        )
        .unwrap();
        let store = experiment.memory_store().unwrap();
        experiment.add_monitor_coordinate(11.0, 9.0);

        experiment.start_capture().unwrap();
        assert!(experiment.is_free_running());
        wait_for(|| experiment.pipeline().stats().persisted >= 5);
        experiment.stop_capture().unwrap();
        assert!(!experiment.is_free_running());

        let image = store.dataset("/data/Acquisition_0/Image").unwrap();
        assert!(image.rows >= 5);
        assert!(image.text_attr("finished").is_some());
        let frames = store.dataset("/data/Acquisition_0/Tracks/frames").unwrap();
        assert_eq!(frames.rows, image.rows);
        assert!(frames.text_attr("finished").is_some());
        assert!(store.dataset("/data/Acquisition_0/DAQ-input").is_some());

        let point = experiment.tracked_points()[0];
        assert!((point.x - 12.0).abs() < 0.05);
        assert!((point.y - 10.0).abs() < 0.05);

        experiment.start_capture().unwrap();
        experiment.stop_capture().unwrap();
        assert!(store.has_group("/data/Acquisition_1"));
    }

    #[test]
    fn test_roi_and_snap_with_idle_camera() {
        let experiment = Experiment::in_memory(config(), camera(), None).unwrap();
        let roi = experiment.set_roi(Roi::new([4, 20], [2, 14])).unwrap();
        assert_eq!((roi.width(), roi.height()), (16, 12));
        let frame = experiment.snap().unwrap();
        assert_eq!(frame.size(), (16, 12));
        assert!(experiment.set_roi(Roi::new([0, 64], [0, 8])).is_err());

        experiment.clear_roi().unwrap();
        assert_eq!(experiment.snap().unwrap().size(), (32, 24));

        experiment.start_free_run().unwrap();
        assert!(matches!(experiment.snap(), Err(DaqError::AlreadyRunning)));
        experiment.set_roi(Roi::new([0, 10], [0, 10])).unwrap();
        assert!(experiment.is_free_running());
        wait_for(|| {
            experiment
                .current_frame()
                .is_some_and(|f| f.size() == (10, 10))
        });
    }

    #[test]
    fn test_finalize_runs_once() {
        let experiment = Experiment::in_memory(config(), camera(), None).unwrap();
        experiment.start_capture().unwrap();
        experiment.finalize().unwrap();
        assert!(!experiment.is_capturing());
        assert!(experiment.bus().is_stopped());
        experiment.finalize().unwrap();
        assert!(matches!(experiment.start_capture(), Err(DaqError::Shutdown)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.storage.compression_level = 12;
        assert!(matches!(
            Experiment::in_memory(bad, camera(), None),
            Err(DaqError::Configuration(_))
        ));
    }
}
