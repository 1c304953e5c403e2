use super::{abort_all, finish_all, stamp, Metadata, WriterState};
use crate::arena::{AttrValue, DatasetSpec, Dtype, GrowableDataset, RowData};
use crate::container::GroupHandle;
use crate::error::{Result, StorageError};
use crate::timestamp;
use nanotrack_core::SampleDtype;
use tracing::error;

/// Settings shared by the analog and trigger writers.
#[derive(Debug, Clone)]
pub struct AnalogWriterConfig {
    /// On-disk element type, normally the device's native type
    pub dtype: SampleDtype,
    /// Windows allocated per growth step (`DAQ-input`), indices per growth
    /// step (`trigger`)
    pub batch: usize,
    /// gzip level, `None` to disable
    pub compression: Option<u8>,
    /// Sample rate stamped as `frequency`
    pub frequency_hz: f64,
    /// Extra attributes for `DAQ-input`
    pub metadata: Metadata,
}

impl Default for AnalogWriterConfig {
    fn default() -> Self {
        Self {
            dtype: SampleDtype::F64,
            batch: 64,
            compression: Some(4),
            frequency_hz: 0.0,
            metadata: Vec::new(),
        }
    }
}

fn create_samples(
    group: &GroupHandle,
    config: &AnalogWriterConfig,
    window_len: usize,
    created: &str,
) -> Result<GrowableDataset> {
    let dtype = match config.dtype {
        SampleDtype::F32 => Dtype::F32,
        SampleDtype::F64 => Dtype::F64,
    };
    let spec = DatasetSpec::new("DAQ-input", dtype, config.batch)
        .with_row_shape(vec![window_len])
        .with_chunk_rows(1)
        .with_compression(config.compression);
    let mut ds = GrowableDataset::new(group.create_dataset(&spec)?, config.batch)?;
    stamp(&mut ds, created, &config.metadata)?;
    ds.set_attr("frequency", AttrValue::F64(config.frequency_hz))?;
    Ok(ds)
}

fn append_samples(ds: &mut GrowableDataset, dtype: SampleDtype, samples: &[f64]) -> Result<()> {
    if samples.len() != ds.row_len() {
        return Err(StorageError::ShapeMismatch {
            dataset: ds.name().to_string(),
            row_len: ds.row_len(),
            len: samples.len(),
        });
    }
    match dtype {
        SampleDtype::F64 => ds.append(RowData::F64(samples))?,
        SampleDtype::F32 => {
            let narrowed: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
            ds.append(RowData::F32(&narrowed))?
        }
    };
    Ok(())
}

/// Appends one row per analog window to `DAQ-input`.
///
/// The row length is fixed by the first window.
pub struct AnalogWriter {
    group: GroupHandle,
    config: AnalogWriterConfig,
    samples: Option<GrowableDataset>,
    state: WriterState,
}

impl AnalogWriter {
    /// Writer for `group`. Nothing is created until the first window.
    pub fn new(group: GroupHandle, config: AnalogWriterConfig) -> Self {
        Self {
            group,
            config,
            samples: None,
            state: WriterState::Open,
        }
    }

    /// Append one window of samples.
    pub fn write(&mut self, samples: &[f64]) -> Result<()> {
        self.state.check("DAQ-input")?;
        let result = self.append(samples);
        if let Err(e) = &result {
            error!(group = self.group.path(), error = %e, "Analog write failed, closing writer");
            self.abort();
        }
        result
    }

    fn append(&mut self, samples: &[f64]) -> Result<()> {
        if self.samples.is_none() {
            let created = timestamp::now();
            self.samples = Some(create_samples(
                &self.group,
                &self.config,
                samples.len(),
                &created,
            )?);
        }
        let ds = self
            .samples
            .as_mut()
            .ok_or_else(|| StorageError::Closed("DAQ-input".into()))?;
        append_samples(ds, self.config.dtype, samples)
    }

    /// Windows written so far.
    pub fn windows_written(&self) -> usize {
        self.samples.as_ref().map_or(0, |ds| ds.rows_written())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Trim and stamp `finished`.
    pub fn finish(&mut self) -> Result<()> {
        self.state.check("DAQ-input")?;
        self.state = WriterState::Finished;
        finish_all(self.samples.as_mut())
    }

    /// Trim without stamping `finished`.
    pub fn abort(&mut self) {
        if self.state != WriterState::Open {
            return;
        }
        self.state = WriterState::Aborted;
        abort_all(self.samples.as_mut());
    }
}

/// Owns `DAQ-input` and `trigger`, created together.
///
/// Both datasets share one `creation` stamp, one `frequency` attribute and,
/// on a clean stop, one `finished` stamp. `trigger` holds absolute sample
/// indices (i64) into the `DAQ-input` sample stream.
pub struct TriggerWriter {
    group: GroupHandle,
    config: AnalogWriterConfig,
    datasets: Option<(GrowableDataset, GrowableDataset)>,
    state: WriterState,
}

impl TriggerWriter {
    /// Writer for `group`. Nothing is created until the first window.
    pub fn new(group: GroupHandle, config: AnalogWriterConfig) -> Self {
        Self {
            group,
            config,
            datasets: None,
            state: WriterState::Open,
        }
    }

    /// Persist one window of the signal channel and the edges found in it.
    pub fn write(&mut self, signal: &[f64], edges: &[i64]) -> Result<()> {
        self.state.check("trigger")?;
        let result = self.append(signal, edges);
        if let Err(e) = &result {
            error!(group = self.group.path(), error = %e, "Trigger write failed, closing writer");
            self.abort();
        }
        result
    }

    fn append(&mut self, signal: &[f64], edges: &[i64]) -> Result<()> {
        if self.datasets.is_none() {
            let created = timestamp::now();
            let samples = create_samples(&self.group, &self.config, signal.len(), &created)?;
            let spec = DatasetSpec::new("trigger", Dtype::I64, self.config.batch)
                .with_compression(self.config.compression);
            let mut trigger =
                GrowableDataset::new(self.group.create_dataset(&spec)?, self.config.batch)?;
            stamp(&mut trigger, &created, &[])?;
            trigger.set_attr("frequency", AttrValue::F64(self.config.frequency_hz))?;
            self.datasets = Some((samples, trigger));
        }
        let (samples, trigger) = self
            .datasets
            .as_mut()
            .ok_or_else(|| StorageError::Closed("trigger".into()))?;
        append_samples(samples, self.config.dtype, signal)?;
        trigger.append(RowData::I64(edges))?;
        Ok(())
    }

    /// `(windows, edges)` written so far.
    pub fn rows_written(&self) -> (usize, usize) {
        self.datasets
            .as_ref()
            .map_or((0, 0), |(s, t)| (s.rows_written(), t.rows_written()))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Trim both datasets and stamp the same `finished` time on each.
    pub fn finish(&mut self) -> Result<()> {
        self.state.check("trigger")?;
        self.state = WriterState::Finished;
        match self.datasets.as_mut() {
            Some((s, t)) => finish_all([s, t]),
            None => Ok(()),
        }
    }

    /// Trim without stamping `finished`.
    pub fn abort(&mut self) {
        if self.state != WriterState::Open {
            return;
        }
        self.state = WriterState::Aborted;
        if let Some((s, t)) = self.datasets.as_mut() {
            abort_all([s, t]);
        }
    }
}
