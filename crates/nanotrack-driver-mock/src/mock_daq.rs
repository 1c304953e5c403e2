//! Simulated two-channel digitizer.
//!
//! Channel 0 carries a sine signal, channel 1 a square trigger that is low
//! for the first half of each period and high (3.3 V) for the second, so the
//! first rising edge lands at sample `period / 2`.

use nanotrack_core::{
    AnalogSource, AnalogWindow, DeviceError, DeviceErrorKind, DeviceResult, SampleDtype,
};
use ndarray::Array2;
use std::f64::consts::PI;
use std::time::Duration;
use tracing::debug;

/// High level of the trigger channel in volts.
pub const TRIGGER_HIGH: f64 = 3.3;

#[derive(Debug, Clone, Copy)]
struct Stream {
    frequency_hz: f64,
    window_len: usize,
}

/// Digitizer producing a sine on channel 0 and a square trigger on channel 1.
#[derive(Debug)]
pub struct MockDaq {
    name: String,
    trigger_period: usize,
    signal_hz: f64,
    amplitude: f64,
    dtype: SampleDtype,
    realtime: bool,
    fail_after: Option<u64>,
    stream: Option<Stream>,
    samples_emitted: u64,
    windows_emitted: u64,
}

impl MockDaq {
    /// Digitizer whose trigger repeats every `trigger_period` samples.
    pub fn new(trigger_period: usize) -> Self {
        Self {
            name: "mock_daq".to_string(),
            trigger_period: trigger_period.max(2),
            signal_hz: 50.0,
            amplitude: 1.0,
            dtype: SampleDtype::F64,
            realtime: true,
            fail_after: None,
            stream: None,
            samples_emitted: 0,
            windows_emitted: 0,
        }
    }

    /// Sine frequency and amplitude on channel 0.
    pub fn with_signal(mut self, frequency_hz: f64, amplitude: f64) -> Self {
        self.signal_hz = frequency_hz;
        self.amplitude = amplitude;
        self
    }

    /// Report `dtype` as the native sample type.
    pub fn with_dtype(mut self, dtype: SampleDtype) -> Self {
        self.dtype = dtype;
        self
    }

    /// When false, reads return immediately instead of taking one window period.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Fail every read once `windows` windows have been produced.
    pub fn fail_after(mut self, windows: u64) -> Self {
        self.fail_after = Some(windows);
        self
    }

    /// Samples per channel produced since construction.
    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted
    }

    /// Absolute indices of the rising trigger edges in `[0, total)`.
    pub fn rising_edges(&self, total: u64) -> Vec<i64> {
        let period = self.trigger_period as u64;
        (0..total)
            .filter(|k| k % period == period / 2)
            .map(|k| k as i64)
            .collect()
    }

    /// Absolute indices of the falling trigger edges in `[0, total)`.
    pub fn falling_edges(&self, total: u64) -> Vec<i64> {
        let period = self.trigger_period as u64;
        (1..total)
            .filter(|k| k % period == 0)
            .map(|k| k as i64)
            .collect()
    }

    fn trigger_level(&self, k: u64) -> f64 {
        let period = self.trigger_period as u64;
        if k % period < period / 2 {
            0.0
        } else {
            TRIGGER_HIGH
        }
    }

    fn window(&mut self, stream: Stream) -> AnalogWindow {
        let start = self.samples_emitted;
        let mut samples = Array2::<f64>::zeros((2, stream.window_len));
        for i in 0..stream.window_len {
            let k = start + i as u64;
            let t = k as f64 / stream.frequency_hz;
            samples[[0, i]] = self.amplitude * (2.0 * PI * self.signal_hz * t).sin();
            samples[[1, i]] = self.trigger_level(k);
        }
        self.samples_emitted += stream.window_len as u64;
        let window = AnalogWindow::new(self.windows_emitted, samples);
        self.windows_emitted += 1;
        window
    }
}

impl AnalogSource for MockDaq {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_stream(&mut self, frequency_hz: f64, window_len: usize) -> DeviceResult<()> {
        if frequency_hz <= 0.0 || window_len == 0 {
            return Err(DeviceError::new(
                &self.name,
                DeviceErrorKind::Other,
                format!("invalid stream: {frequency_hz} Hz, {window_len} samples per window"),
            ));
        }
        debug!(daq = %self.name, frequency_hz, window_len, "Starting stream");
        self.stream = Some(Stream {
            frequency_hz,
            window_len,
        });
        Ok(())
    }

    fn stop_stream(&mut self) -> DeviceResult<()> {
        if self.stream.take().is_some() {
            debug!(daq = %self.name, samples = self.samples_emitted, "Stopped stream");
        }
        Ok(())
    }

    fn read_windows(&mut self) -> DeviceResult<Vec<AnalogWindow>> {
        let stream = self.stream.ok_or_else(|| {
            DeviceError::new(&self.name, DeviceErrorKind::NotAcquiring, "read before start")
        })?;
        if let Some(limit) = self.fail_after {
            if self.windows_emitted >= limit {
                return Err(DeviceError::new(
                    &self.name,
                    DeviceErrorKind::ReadFailed,
                    format!("injected failure after {limit} windows"),
                ));
            }
        }
        if self.realtime {
            std::thread::sleep(Duration::from_secs_f64(
                stream.window_len as f64 / stream.frequency_hz,
            ));
        }
        Ok(vec![self.window(stream)])
    }

    fn channel_count(&self) -> usize {
        2
    }

    fn frequency_hz(&self) -> Option<f64> {
        self.stream.map(|s| s.frequency_hz)
    }

    fn sample_dtype(&self) -> SampleDtype {
        self.dtype
    }
}
