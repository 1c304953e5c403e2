use super::{abort_aligned, finish_all, stamp, Metadata, WriterState};
use crate::arena::{AttrValue, DatasetSpec, Dtype, GrowableDataset, RowData};
use crate::container::GroupHandle;
use crate::error::{Result, StorageError};
use crate::timestamp;
use nanotrack_core::Frame;
use tracing::{debug, error};

/// Image writer settings.
#[derive(Debug, Clone)]
pub struct ImageWriterConfig {
    /// Persist every `stride`-th frame, starting with the first
    pub stride: usize,
    /// Frames allocated per growth step
    pub batch: usize,
    /// gzip level, `None` to disable
    pub compression: Option<u8>,
    /// Extra attributes for the `Image` dataset
    pub metadata: Metadata,
}

impl Default for ImageWriterConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            batch: 16,
            compression: Some(4),
            metadata: Vec::new(),
        }
    }
}

struct Datasets {
    size: (usize, usize),
    images: GrowableDataset,
    indices: GrowableDataset,
}

/// Appends frames to `Image` (`frames x H x W`, u16, chunked per frame).
///
/// The true frame number of every persisted frame goes to the companion
/// `frame_index` dataset, so strided files still correlate with the DAQ
/// stream.
pub struct ImageWriter {
    group: GroupHandle,
    config: ImageWriterConfig,
    datasets: Option<Datasets>,
    counter: usize,
    state: WriterState,
}

impl ImageWriter {
    /// Writer for `group`. Nothing is created until the first frame.
    pub fn new(group: GroupHandle, mut config: ImageWriterConfig) -> Self {
        config.stride = config.stride.max(1);
        Self {
            group,
            config,
            datasets: None,
            counter: 0,
            state: WriterState::Open,
        }
    }

    /// Offer a frame. Returns `true` if it was persisted, `false` if the
    /// stride skipped it.
    pub fn write(&mut self, frame: &Frame) -> Result<bool> {
        self.state.check("Image")?;
        let persist = self.counter == 0;
        self.counter = (self.counter + 1) % self.config.stride;
        if !persist {
            return Ok(false);
        }
        match self.append(frame) {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(group = self.group.path(), error = %e, "Image write failed, closing writer");
                self.abort();
                Err(e)
            }
        }
    }

    fn append(&mut self, frame: &Frame) -> Result<()> {
        if self.datasets.is_none() {
            self.datasets = Some(self.create(frame)?);
        }
        let datasets = self
            .datasets
            .as_mut()
            .ok_or_else(|| StorageError::Closed("Image".into()))?;
        if datasets.size != frame.size() {
            return Err(StorageError::FrameSize {
                expected: datasets.size,
                got: frame.size(),
            });
        }

        let pixels = frame.pixels.as_standard_layout();
        let pixels = pixels
            .as_slice()
            .ok_or_else(|| StorageError::Backend("frame is not contiguous".into()))?;
        datasets.images.append(RowData::U16(pixels))?;
        datasets.indices.append(RowData::U64(&[frame.index]))?;
        Ok(())
    }

    fn create(&self, frame: &Frame) -> Result<Datasets> {
        let created = timestamp::now();
        let image_spec = DatasetSpec::new("Image", Dtype::U16, self.config.batch)
            .with_row_shape(vec![frame.height(), frame.width()])
            .with_chunk_rows(1)
            .with_compression(self.config.compression);
        let mut images =
            GrowableDataset::new(self.group.create_dataset(&image_spec)?, self.config.batch)?;
        stamp(&mut images, &created, &self.config.metadata)?;
        images.set_attr("stride", AttrValue::U64(self.config.stride as u64))?;

        let index_spec = DatasetSpec::new("frame_index", Dtype::U64, self.config.batch)
            .with_compression(self.config.compression);
        let mut indices =
            GrowableDataset::new(self.group.create_dataset(&index_spec)?, self.config.batch)?;
        stamp(&mut indices, &created, &[])?;

        debug!(
            group = self.group.path(),
            width = frame.width(),
            height = frame.height(),
            "Created image datasets"
        );
        Ok(Datasets {
            size: frame.size(),
            images,
            indices,
        })
    }

    /// Frames persisted so far.
    pub fn frames_written(&self) -> usize {
        self.datasets
            .as_ref()
            .map_or(0, |d| d.images.rows_written())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Trim and stamp `finished`.
    pub fn finish(&mut self) -> Result<()> {
        self.state.check("Image")?;
        self.state = WriterState::Finished;
        match self.datasets.as_mut() {
            Some(d) => finish_all([&mut d.images, &mut d.indices]),
            None => Ok(()),
        }
    }

    /// Trim without stamping `finished`, keeping `Image` and `frame_index`
    /// the same length.
    pub fn abort(&mut self) {
        if self.state != WriterState::Open {
            return;
        }
        self.state = WriterState::Aborted;
        if let Some(d) = self.datasets.as_mut() {
            abort_aligned(&mut [&mut d.images, &mut d.indices]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn frame(index: u64, value: u16) -> Frame {
        Frame::from_u16(index, 3, 2, vec![value; 6]).unwrap()
    }

    #[test]
    fn test_stride_keeps_true_frame_index() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = ImageWriter::new(
            group,
            ImageWriterConfig {
                stride: 3,
                batch: 2,
                ..Default::default()
            },
        );

        let persisted: Vec<bool> = (0..7)
            .map(|i| writer.write(&frame(100 + i, i as u16)).unwrap())
            .collect();
        assert_eq!(
            persisted,
            vec![true, false, false, true, false, false, true]
        );
        writer.finish().unwrap();

        let images = store.dataset("/acq/Image").unwrap();
        assert_eq!(images.shape(), vec![3, 2, 3]);
        assert_eq!(images.column.as_u16().unwrap()[6], 3);
        assert_eq!(images.attr("stride"), Some(&AttrValue::U64(3)));
        assert!(images.text_attr("creation").is_some());
        assert!(images.text_attr("finished").is_some());

        let indices = store.dataset("/acq/frame_index").unwrap();
        assert_eq!(indices.column.as_u64().unwrap(), &[100, 103, 106]);
        assert_eq!(
            images.text_attr("finished"),
            indices.text_attr("finished")
        );
    }

    #[test]
    fn test_nothing_created_before_first_frame() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = ImageWriter::new(group, ImageWriterConfig::default());
        writer.finish().unwrap();
        assert!(store.dataset("/acq/Image").is_none());
    }

    #[test]
    fn test_write_failure_aborts_writer() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = ImageWriter::new(group, ImageWriterConfig::default());
        writer.write(&frame(0, 1)).unwrap();
        writer.write(&frame(1, 1)).unwrap();

        store.set_fail_writes(true);
        assert!(writer.write(&frame(2, 1)).is_err());
        assert_eq!(writer.state(), WriterState::Aborted);
        store.set_fail_writes(false);
        assert!(matches!(
            writer.write(&frame(3, 1)),
            Err(StorageError::Closed(_))
        ));

        let images = store.dataset("/acq/Image").unwrap();
        assert_eq!(images.rows, 2);
        assert!(images.text_attr("finished").is_none());
    }

    #[test]
    fn test_image_without_index_is_dropped_on_failure() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = ImageWriter::new(group, ImageWriterConfig::default());
        writer.write(&frame(0, 1)).unwrap();

        // pixels land, the frame index does not
        store.fail_writes_after(1);
        assert!(writer.write(&frame(1, 1)).is_err());

        assert_eq!(store.dataset("/acq/Image").unwrap().rows, 1);
        assert_eq!(store.dataset("/acq/frame_index").unwrap().rows, 1);
    }

    #[test]
    fn test_size_change_is_a_persistence_error() {
        let store = MemoryStore::new();
        let group = store.root().create_group("acq").unwrap();
        let mut writer = ImageWriter::new(group, ImageWriterConfig::default());
        writer.write(&frame(0, 1)).unwrap();
        let bigger = Frame::zeros(1, 4, 4);
        assert!(matches!(
            writer.write(&bigger),
            Err(StorageError::FrameSize {
                expected: (3, 2),
                got: (4, 4)
            })
        ));
        assert_eq!(writer.state(), WriterState::Aborted);
    }
}
