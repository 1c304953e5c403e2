//! End-to-end capture with simulated devices and an in-memory session.

use anyhow::{Context, Result};
use nanotrack::config::NanotrackConfig;
use nanotrack::experiment::{Experiment, TRACKS_TOPIC};
use nanotrack::{DaqError, Payload};
use nanotrack_driver_mock::{MockCamera, MockDaq, Spot};
use nanotrack_storage::AttrValue;
use std::time::Duration;

const WINDOW_LEN: usize = 20;
const TRIGGER_PERIOD: usize = 16;

fn test_config() -> NanotrackConfig {
    let mut config = NanotrackConfig::default();
    config.acquisition.idle_sleep_us = 100;
    config.bus.grace_ms = 5;
    config.tracker.radius = 6;
    config.trigger.frequency_hz = 10_000.0;
    config.trigger.window_len = WINDOW_LEN;
    config.storage.image_batch = 4;
    config.storage.analog_batch = 4;
    config.storage.track_batch = 8;
    config
}

fn camera() -> MockCamera {
    MockCamera::builder(40, 30)
        .spot(Spot::new(15.0, 12.0))
        .background(0)
        .exposure(Duration::from_millis(1))
        .build()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_trigger_indices_match_daq_stream() -> Result<()> {
    let experiment = Experiment::in_memory(
        test_config(),
        Box::new(camera()),
        Some(Box::new(MockDaq::new(TRIGGER_PERIOD))),
    )
    .context("experiment")?;
    let store = experiment.memory_store().context("memory session")?;

    experiment.start_capture().context("start capture")?;
    wait_for("DAQ windows", || {
        experiment.daq_stats().is_some_and(|s| s.items >= 12)
    });
    experiment.stop_capture().context("stop capture")?;

    let daq = store
        .dataset("/data/Acquisition_0/DAQ-input")
        .context("DAQ-input")?;
    assert_eq!(daq.spec.row_shape, vec![WINDOW_LEN]);
    assert!(daq.rows >= 12);
    assert_eq!(daq.attr("frequency"), Some(&AttrValue::F64(10_000.0)));
    assert!(daq.text_attr("finished").is_some());

    let total = (daq.rows * WINDOW_LEN) as u64;
    let expected = MockDaq::new(TRIGGER_PERIOD).rising_edges(total);
    let trigger = store.dataset("/data/Acquisition_0/trigger").context("trigger")?;
    assert_eq!(trigger.column.as_i64().context("i64 indices")?, expected.as_slice());
    assert_eq!(trigger.attr("frequency"), Some(&AttrValue::F64(10_000.0)));
    assert_eq!(experiment.edges_detected(), expected.len() as u64);

    experiment.finalize().context("finalize")?;
    Ok(())
}

#[test]
fn test_tracks_are_saved_and_published() -> Result<()> {
    let experiment =
        Experiment::in_memory(test_config(), Box::new(camera()), None).context("experiment")?;
    let store = experiment.memory_store().context("memory session")?;
    let subscription = experiment.subscribe(TRACKS_TOPIC);

    experiment.add_monitor_coordinate(13.0, 10.0);
    experiment.add_monitor_coordinate(35.0, 27.0);
    experiment.start_capture().context("start capture")?;
    wait_for("persisted frames", || {
        experiment.pipeline().stats().persisted >= 20
    });
    experiment.stop_capture().context("stop capture")?;
    experiment.finalize().context("finalize")?;

    let image = store.dataset("/data/Acquisition_0/Image").context("Image")?;
    let frames = store
        .dataset("/data/Acquisition_0/Tracks/frames")
        .context("Tracks/frames")?;
    let x = store.dataset("/data/Acquisition_0/Tracks/x").context("Tracks/x")?;
    assert_eq!(frames.rows, 2 * image.rows);
    assert_eq!(x.rows, frames.rows);

    // two rows per frame, both tagged with the frame they were refined on
    let frame_index = store
        .dataset("/data/Acquisition_0/frame_index")
        .context("frame_index")?;
    let persisted = frame_index.column.as_u64().context("u64 indices")?;
    let tagged = frames.column.as_u64().context("u64 frames")?;
    for (i, pair) in tagged.chunks(2).enumerate() {
        assert_eq!(pair[0], pair[1]);
        assert_eq!(pair[0], persisted[i]);
    }

    // rows alternate between the two points; the second never sees light
    let xs = x.column.as_f32().context("f32")?;
    let near = f64::from(xs[xs.len() - 2]);
    let far = f64::from(xs[xs.len() - 1]);
    assert!((near - 15.0).abs() < 0.05, "x = {near}");
    assert_eq!(far, 35.0);

    let published: Vec<u64> = subscription
        .filter_map(|envelope| match &envelope.payload {
            Payload::Points { frame_index, .. } => Some(*frame_index),
            _ => None,
        })
        .collect();
    assert!(!published.is_empty());
    assert!(published.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[test]
fn test_device_failure_is_reported_on_stop() -> Result<()> {
    let failing = MockCamera::builder(16, 16)
        .exposure(Duration::from_millis(1))
        .fail_after(5)
        .build();
    let experiment =
        Experiment::in_memory(test_config(), Box::new(failing), None).context("experiment")?;
    let store = experiment.memory_store().context("memory session")?;

    experiment.start_capture().context("start capture")?;
    wait_for("capture thread exit", || !experiment.is_free_running());
    let err = experiment.stop_capture().unwrap_err();
    assert!(matches!(err, DaqError::Device(_)), "{err}");

    let image = store.dataset("/data/Acquisition_0/Image").context("Image")?;
    assert_eq!(image.rows, 5);
    assert!(image.text_attr("finished").is_some());
    Ok(())
}

#[test]
fn test_persist_failure_keeps_acquisition_running() -> Result<()> {
    let experiment =
        Experiment::in_memory(test_config(), Box::new(camera()), None).context("experiment")?;
    let store = experiment.memory_store().context("memory session")?;

    experiment.start_capture().context("start capture")?;
    wait_for("first frames", || experiment.pipeline().stats().persisted >= 2);
    store.set_fail_writes(true);
    wait_for("persist failure", || {
        experiment.pipeline().stats().persist_failures == 1
    });
    let frames_at_failure = experiment.pipeline().stats().frames;
    wait_for("frames after failure", || {
        experiment.pipeline().stats().frames > frames_at_failure + 3
    });
    assert!(experiment.is_free_running());

    let err = experiment.stop_capture().unwrap_err();
    assert!(matches!(err, DaqError::Persistence(_)), "{err}");

    let image = store.dataset("/data/Acquisition_0/Image").context("Image")?;
    assert!(image.rows >= 2);
    assert!(image.text_attr("finished").is_none());
    Ok(())
}

#[test]
fn test_each_capture_gets_its_own_group() -> Result<()> {
    let experiment =
        Experiment::in_memory(test_config(), Box::new(camera()), None).context("experiment")?;
    let store = experiment.memory_store().context("memory session")?;
    experiment.start_free_run().context("free run")?;

    for n in 0..3 {
        experiment.start_capture().context("start capture")?;
        let persisted = experiment.pipeline().stats().persisted;
        wait_for("frames", || experiment.pipeline().stats().persisted > persisted + 2);
        experiment.stop_capture().context("stop capture")?;
        assert!(store.has_group(&format!("/data/Acquisition_{n}")));
    }
    // free run survives the captures
    assert!(experiment.is_free_running());
    experiment.finalize().context("finalize")?;
    assert!(!experiment.is_free_running());
    Ok(())
}
