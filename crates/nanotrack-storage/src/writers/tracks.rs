use super::{abort_aligned, finish_all, stamp, WriterState};
use crate::arena::{AttrValue, DatasetSpec, Dtype, GrowableDataset, RowData};
use crate::container::GroupHandle;
use crate::error::{Result, StorageError};
use crate::timestamp;
use nanotrack_core::TrackedPoint;
use tracing::error;

/// Default rows per growth step and per chunk for track datasets.
pub const TRACK_BATCH: usize = 1024;

struct Datasets {
    x: GrowableDataset,
    y: GrowableDataset,
    intensities: GrowableDataset,
    frames: GrowableDataset,
}

impl Datasets {
    fn all(&mut self) -> [&mut GrowableDataset; 4] {
        [
            &mut self.x,
            &mut self.y,
            &mut self.intensities,
            &mut self.frames,
        ]
    }
}

/// Appends tracked points to `Tracks/{x, y, intensities, frames}`.
///
/// One row per point per call; `frames` holds the number of the frame the
/// points were refined on. The four datasets always have the same length.
pub struct TrackWriter {
    group: GroupHandle,
    batch: usize,
    compression: Option<u8>,
    datasets: Option<Datasets>,
    state: WriterState,
}

impl TrackWriter {
    /// Writer for `group` with the default batch of [`TRACK_BATCH`].
    pub fn new(group: GroupHandle) -> Self {
        Self::with_batch(group, TRACK_BATCH)
    }

    /// Writer for `group` growing by `batch` rows.
    pub fn with_batch(group: GroupHandle, batch: usize) -> Self {
        Self {
            group,
            batch: batch.max(1),
            compression: Some(4),
            datasets: None,
            state: WriterState::Open,
        }
    }

    /// Append every point in `points`, tagged with `frame_index`.
    ///
    /// The `Tracks` group is created on the first call even if `points` is
    /// empty.
    pub fn write(&mut self, frame_index: u64, points: &[TrackedPoint]) -> Result<()> {
        self.state.check("Tracks")?;
        match self.append(frame_index, points) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(group = self.group.path(), error = %e, "Track write failed, closing writer");
                self.abort();
                Err(e)
            }
        }
    }

    fn append(&mut self, frame_index: u64, points: &[TrackedPoint]) -> Result<()> {
        if self.datasets.is_none() {
            self.datasets = Some(self.create()?);
        }
        let datasets = self
            .datasets
            .as_mut()
            .ok_or_else(|| StorageError::Closed("Tracks".into()))?;
        if points.is_empty() {
            return Ok(());
        }

        let x: Vec<f32> = points.iter().map(|p| p.x as f32).collect();
        let y: Vec<f32> = points.iter().map(|p| p.y as f32).collect();
        let intensities: Vec<f32> = points.iter().map(|p| p.intensity as f32).collect();
        let frames = vec![frame_index; points.len()];

        datasets.x.append(RowData::F32(&x))?;
        datasets.y.append(RowData::F32(&y))?;
        datasets.intensities.append(RowData::F32(&intensities))?;
        datasets.frames.append(RowData::U64(&frames))?;
        Ok(())
    }

    fn create(&self) -> Result<Datasets> {
        let created = timestamp::now();
        let tracks = self.group.create_group("Tracks")?;
        tracks.set_attr("creation", &AttrValue::Text(created.clone()))?;

        let make = |name: &str, dtype: Dtype, compression: Option<u8>| -> Result<GrowableDataset> {
            let spec = DatasetSpec::new(name, dtype, self.batch).with_compression(compression);
            let mut ds = GrowableDataset::new(tracks.create_dataset(&spec)?, self.batch)?;
            stamp(&mut ds, &created, &[])?;
            Ok(ds)
        };
        Ok(Datasets {
            x: make("x", Dtype::F32, None)?,
            y: make("y", Dtype::F32, None)?,
            intensities: make("intensities", Dtype::F32, None)?,
            frames: make("frames", Dtype::U64, self.compression)?,
        })
    }

    /// Rows written to each dataset.
    pub fn rows_written(&self) -> usize {
        self.datasets.as_ref().map_or(0, |d| d.x.rows_written())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Trim and stamp `finished`.
    pub fn finish(&mut self) -> Result<()> {
        self.state.check("Tracks")?;
        self.state = WriterState::Finished;
        match self.datasets.as_mut() {
            Some(d) => finish_all(d.all()),
            None => Ok(()),
        }
    }

    /// Trim without stamping `finished`.
    ///
    /// All four datasets are cut to the shortest one, so a write that failed
    /// part way leaves no partial rows behind.
    pub fn abort(&mut self) {
        if self.state != WriterState::Open {
            return;
        }
        self.state = WriterState::Aborted;
        if let Some(d) = self.datasets.as_mut() {
            abort_aligned(&mut d.all());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn points(n: usize) -> Vec<TrackedPoint> {
        (0..n)
            .map(|i| TrackedPoint {
                x: i as f64,
                y: 2.0 * i as f64,
                intensity: 10.0,
            })
            .collect()
    }

    #[test]
    fn test_rows_across_batches() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = TrackWriter::with_batch(group, 4);

        writer.write(0, &points(3)).unwrap();
        writer.write(1, &[]).unwrap();
        writer.write(2, &points(3)).unwrap();
        assert_eq!(writer.rows_written(), 6);
        writer.finish().unwrap();

        let x = store.dataset("/acq/Tracks/x").unwrap();
        let frames = store.dataset("/acq/Tracks/frames").unwrap();
        assert_eq!(x.rows, 6);
        assert_eq!(frames.rows, 6);
        assert_eq!(x.column.as_f32().unwrap(), &[0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
        assert_eq!(frames.column.as_u64().unwrap(), &[0, 0, 0, 2, 2, 2]);
        assert!(x.text_attr("finished").is_some());
        assert!(store
            .group_attrs("/acq/Tracks")
            .unwrap()
            .contains_key("creation"));
    }

    #[test]
    fn test_group_created_on_first_empty_write() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = TrackWriter::new(group);
        writer.write(0, &[]).unwrap();
        assert!(store.has_group("/acq/Tracks"));
        writer.finish().unwrap();
        assert_eq!(store.dataset("/acq/Tracks/y").unwrap().rows, 0);
    }

    #[test]
    fn test_failure_closes_writer() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = TrackWriter::new(group);
        writer.write(0, &points(2)).unwrap();
        store.set_fail_writes(true);
        assert!(writer.write(1, &points(2)).is_err());
        assert_eq!(writer.state(), WriterState::Aborted);
        assert!(writer.finish().is_err());
        assert_eq!(store.dataset("/acq/Tracks/x").unwrap().rows, 2);
    }

    #[test]
    fn test_partial_failure_keeps_columns_aligned() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = TrackWriter::new(group);
        writer.write(0, &points(2)).unwrap();

        // x and y land, intensities fails
        store.fail_writes_after(2);
        assert!(writer.write(1, &points(2)).is_err());
        assert_eq!(writer.state(), WriterState::Aborted);

        for name in ["x", "y", "intensities", "frames"] {
            let ds = store.dataset(&format!("/acq/Tracks/{name}")).unwrap();
            assert_eq!(ds.rows, 2, "{name}");
            assert!(ds.text_attr("finished").is_none(), "{name}");
        }
        assert_eq!(writer.rows_written(), 2);
    }
}
