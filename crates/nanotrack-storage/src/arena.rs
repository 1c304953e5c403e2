//! Growable dataset arena.
//!
//! A [`GrowableDataset`] tracks three numbers for one on-disk dataset: rows
//! written, rows allocated, and the batch by which the allocation grows. The
//! storage backend only has to implement [`ResizableSink`] (resize along the
//! first axis, write a block of rows, set an attribute), which keeps the
//! bookkeeping testable without HDF5.
//!
//! Lifecycle:
//!
//! 1. The backend creates the dataset with one batch of rows allocated.
//! 2. [`GrowableDataset::append`] grows the allocation by whole batches when
//!    the write cursor would pass it, then writes.
//! 3. [`GrowableDataset::finish`] trims to the rows written and stamps
//!    `finished`. [`GrowableDataset::abort`] and `Drop` trim without the stamp,
//!    so a missing `finished` attribute marks an unclean stop.

use crate::error::{Result, StorageError};
use crate::timestamp;
use tracing::{debug, warn};

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    /// Unsigned 16-bit (camera pixels)
    U16,
    /// Unsigned 64-bit (frame numbers)
    U64,
    /// Signed 64-bit (sample indices)
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

/// A borrowed, typed block of row-major elements.
#[derive(Debug, Clone, Copy)]
pub enum RowData<'a> {
    /// `u16` elements
    U16(&'a [u16]),
    /// `u64` elements
    U64(&'a [u64]),
    /// `i64` elements
    I64(&'a [i64]),
    /// `f32` elements
    F32(&'a [f32]),
    /// `f64` elements
    F64(&'a [f64]),
}

impl RowData<'_> {
    /// Element type of the block.
    pub fn dtype(&self) -> Dtype {
        match self {
            RowData::U16(_) => Dtype::U16,
            RowData::U64(_) => Dtype::U64,
            RowData::I64(_) => Dtype::I64,
            RowData::F32(_) => Dtype::F32,
            RowData::F64(_) => Dtype::F64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            RowData::U16(d) => d.len(),
            RowData::U64(d) => d.len(),
            RowData::I64(d) => d.len(),
            RowData::F32(d) => d.len(),
            RowData::F64(d) => d.len(),
        }
    }

    /// True for a zero-length block.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// UTF-8 string
    Text(String),
    /// 64-bit float
    F64(f64),
    /// Unsigned integer
    U64(u64),
    /// Signed integer
    I64(i64),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::F64(value)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        AttrValue::U64(value)
    }
}

/// How a backend should lay out a new growable dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    /// Dataset name inside its group
    pub name: String,
    /// Element type
    pub dtype: Dtype,
    /// Shape of one row (empty for a 1-D dataset)
    pub row_shape: Vec<usize>,
    /// Rows allocated at creation and added per growth step
    pub batch: usize,
    /// Rows per storage chunk
    pub chunk_rows: usize,
    /// gzip level, `None` for uncompressed
    pub compression: Option<u8>,
}

impl DatasetSpec {
    /// A 1-D dataset growing by `batch`, chunked by `batch`, uncompressed.
    pub fn new(name: impl Into<String>, dtype: Dtype, batch: usize) -> Self {
        let batch = batch.max(1);
        Self {
            name: name.into(),
            dtype,
            row_shape: Vec::new(),
            batch,
            chunk_rows: batch,
            compression: None,
        }
    }

    /// Set the per-row shape.
    pub fn with_row_shape(mut self, row_shape: Vec<usize>) -> Self {
        self.row_shape = row_shape;
        self
    }

    /// Set rows per chunk.
    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    /// Enable gzip at `level`.
    pub fn with_compression(mut self, level: Option<u8>) -> Self {
        self.compression = level.map(|l| l.min(9));
        self
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.row_shape.iter().product()
    }
}

/// Backend seam for a dataset resizable along its first axis.
pub trait ResizableSink: Send {
    /// Dataset name, for diagnostics.
    fn name(&self) -> &str;

    /// Element type fixed at creation.
    fn dtype(&self) -> Dtype;

    /// Elements per row.
    fn row_len(&self) -> usize;

    /// Rows currently allocated.
    fn allocated_rows(&self) -> usize;

    /// Change the allocation to exactly `rows`.
    fn resize(&mut self, rows: usize) -> Result<()>;

    /// Write whole rows starting at row `start`. The rows must be allocated.
    fn write_rows(&mut self, start: usize, data: RowData<'_>) -> Result<()>;

    /// Set a scalar attribute on the dataset.
    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<()>;
}

impl<S: ResizableSink + ?Sized> ResizableSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dtype(&self) -> Dtype {
        (**self).dtype()
    }

    fn row_len(&self) -> usize {
        (**self).row_len()
    }

    fn allocated_rows(&self) -> usize {
        (**self).allocated_rows()
    }

    fn resize(&mut self, rows: usize) -> Result<()> {
        (**self).resize(rows)
    }

    fn write_rows(&mut self, start: usize, data: RowData<'_>) -> Result<()> {
        (**self).write_rows(start, data)
    }

    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        (**self).set_attr(name, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Aborted,
}

/// Row-count / capacity / batch bookkeeping over a [`ResizableSink`].
///
/// Invariant: `rows_written() <= capacity()` at all times, and `capacity()`
/// only ever grows in multiples of the batch until the dataset is closed.
pub struct GrowableDataset<S: ResizableSink = Box<dyn ResizableSink>> {
    sink: S,
    rows: usize,
    capacity: usize,
    batch: usize,
    state: State,
}

impl<S: ResizableSink> GrowableDataset<S> {
    /// Take over a freshly created sink.
    ///
    /// If the backend allocated nothing, one batch is reserved up front.
    pub fn new(mut sink: S, batch: usize) -> Result<Self> {
        let batch = batch.max(1);
        let mut capacity = sink.allocated_rows();
        if capacity == 0 {
            sink.resize(batch)?;
            capacity = batch;
        }
        Ok(Self {
            sink,
            rows: 0,
            capacity,
            batch,
            state: State::Open,
        })
    }

    /// Dataset name.
    pub fn name(&self) -> &str {
        self.sink.name()
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.sink.row_len()
    }

    /// Rows actually written.
    pub fn rows_written(&self) -> usize {
        self.rows
    }

    /// Rows currently allocated.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Growth increment.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// True until finished or aborted.
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Make room for `rows` rows in total, growing by whole batches.
    pub fn ensure_capacity(&mut self, rows: usize) -> Result<()> {
        self.check_open()?;
        if rows <= self.capacity {
            return Ok(());
        }
        let mut target = self.capacity;
        while target < rows {
            target += self.batch;
        }
        self.sink.resize(target)?;
        debug!(
            dataset = self.sink.name(),
            from = self.capacity,
            to = target,
            "Grew dataset"
        );
        self.capacity = target;
        Ok(())
    }

    /// Append whole rows. Returns the number of rows added.
    pub fn append(&mut self, data: RowData<'_>) -> Result<usize> {
        self.check_open()?;
        if data.dtype() != self.sink.dtype() {
            return Err(StorageError::DtypeMismatch {
                dataset: self.sink.name().to_string(),
                expected: self.sink.dtype(),
                got: data.dtype(),
            });
        }
        let row_len = self.sink.row_len().max(1);
        if data.len() % row_len != 0 {
            return Err(StorageError::ShapeMismatch {
                dataset: self.sink.name().to_string(),
                row_len,
                len: data.len(),
            });
        }
        let count = data.len() / row_len;
        if count == 0 {
            return Ok(0);
        }
        self.ensure_capacity(self.rows + count)?;
        self.sink.write_rows(self.rows, data)?;
        self.rows += count;
        Ok(count)
    }

    /// Set a scalar attribute.
    pub fn set_attr(&mut self, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        self.sink.set_attr(name, &value.into())
    }

    /// Trim to the rows written and stamp `finished` with the current time.
    pub fn finish(&mut self) -> Result<()> {
        self.finish_at(&timestamp::now())
    }

    /// Trim to the rows written and stamp `finished` with `stamp`.
    ///
    /// Used when several datasets must share one finish time.
    pub fn finish_at(&mut self, stamp: &str) -> Result<()> {
        self.check_open()?;
        self.trim()?;
        self.state = State::Finished;
        self.sink.set_attr("finished", &AttrValue::Text(stamp.to_string()))
    }

    /// Trim to the rows written without stamping `finished`.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != State::Open {
            return Ok(());
        }
        self.state = State::Aborted;
        self.trim()
    }

    /// Like [`abort`](Self::abort), keeping at most `rows` rows.
    ///
    /// Lets sibling datasets that must stay the same length drop the rows
    /// of a partly failed write.
    pub fn abort_at(&mut self, rows: usize) -> Result<()> {
        if self.state == State::Open {
            self.rows = self.rows.min(rows);
        }
        self.abort()
    }

    fn trim(&mut self) -> Result<()> {
        if self.capacity != self.rows {
            self.sink.resize(self.rows)?;
            self.capacity = self.rows;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.state == State::Open {
            Ok(())
        } else {
            Err(StorageError::Closed(self.sink.name().to_string()))
        }
    }
}

impl<S: ResizableSink> Drop for GrowableDataset<S> {
    fn drop(&mut self) {
        if self.state == State::Open {
            warn!(
                dataset = self.sink.name(),
                rows = self.rows,
                "Dataset dropped without finish, truncating"
            );
            if let Err(e) = self.abort() {
                warn!(dataset = self.sink.name(), error = %e, "Truncate on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Records resize calls and keeps written rows in a flat vector.
    #[derive(Default)]
    struct Recorded {
        resizes: Vec<usize>,
        values: Vec<f64>,
        attrs: HashMap<String, AttrValue>,
    }

    struct VecSink {
        allocated: usize,
        row_len: usize,
        log: Arc<Mutex<Recorded>>,
    }

    impl VecSink {
        fn new(allocated: usize, row_len: usize) -> (Self, Arc<Mutex<Recorded>>) {
            let log = Arc::new(Mutex::new(Recorded::default()));
            log.lock().unwrap().values = vec![0.0; allocated * row_len];
            (
                Self {
                    allocated,
                    row_len,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl ResizableSink for VecSink {
        fn name(&self) -> &str {
            "vec"
        }

        fn dtype(&self) -> Dtype {
            Dtype::F64
        }

        fn row_len(&self) -> usize {
            self.row_len
        }

        fn allocated_rows(&self) -> usize {
            self.allocated
        }

        fn resize(&mut self, rows: usize) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            log.resizes.push(rows);
            log.values.resize(rows * self.row_len, 0.0);
            self.allocated = rows;
            Ok(())
        }

        fn write_rows(&mut self, start: usize, data: RowData<'_>) -> Result<()> {
            let RowData::F64(values) = data else {
                unreachable!("dtype checked by the arena")
            };
            let offset = start * self.row_len;
            assert!(offset + values.len() <= self.allocated * self.row_len);
            self.log.lock().unwrap().values[offset..offset + values.len()]
                .copy_from_slice(values);
            Ok(())
        }

        fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .attrs
                .insert(name.to_string(), value.clone());
            Ok(())
        }
    }

    fn rows(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn test_finish_yields_exact_row_count() {
        let batch = 8;
        for m in [0, 1, batch, 3 * batch + 1] {
            let (sink, log) = VecSink::new(batch, 1);
            let mut ds = GrowableDataset::new(sink, batch).unwrap();
            for v in rows(m) {
                ds.append(RowData::F64(&[v])).unwrap();
                assert!(ds.rows_written() <= ds.capacity());
            }
            ds.finish().unwrap();

            let log = log.lock().unwrap();
            assert_eq!(log.values.len(), m, "m = {}", m);
            assert_eq!(log.values, rows(m));
            assert!(log.attrs.contains_key("finished"));
        }
    }

    #[test]
    fn test_grows_by_whole_batches() {
        let (sink, log) = VecSink::new(4, 1);
        let mut ds = GrowableDataset::new(sink, 4).unwrap();
        ds.append(RowData::F64(&rows(4))).unwrap();
        assert_eq!(ds.capacity(), 4);
        ds.append(RowData::F64(&rows(1))).unwrap();
        assert_eq!(ds.capacity(), 8);
        // One write spanning several batches grows in one resize.
        ds.append(RowData::F64(&rows(9))).unwrap();
        assert_eq!(ds.capacity(), 16);
        assert_eq!(log.lock().unwrap().resizes, vec![8, 16]);
    }

    #[test]
    fn test_empty_sink_gets_one_batch() {
        let (sink, log) = VecSink::new(0, 1);
        let ds = GrowableDataset::new(sink, 16).unwrap();
        assert_eq!(ds.capacity(), 16);
        assert_eq!(log.lock().unwrap().resizes, vec![16]);
    }

    #[test]
    fn test_rejects_partial_rows_and_wrong_dtype() {
        let (sink, _log) = VecSink::new(4, 3);
        let mut ds = GrowableDataset::new(sink, 4).unwrap();
        assert!(matches!(
            ds.append(RowData::F64(&[1.0, 2.0])),
            Err(StorageError::ShapeMismatch { row_len: 3, len: 2, .. })
        ));
        assert!(matches!(
            ds.append(RowData::U16(&[1, 2, 3])),
            Err(StorageError::DtypeMismatch { .. })
        ));
        assert_eq!(ds.append(RowData::F64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])).unwrap(), 2);
        assert_eq!(ds.rows_written(), 2);
    }

    #[test]
    fn test_abort_and_drop_truncate_without_stamp() {
        let (sink, log) = VecSink::new(8, 1);
        let mut ds = GrowableDataset::new(sink, 8).unwrap();
        ds.append(RowData::F64(&rows(3))).unwrap();
        ds.abort().unwrap();
        assert!(!ds.is_open());
        assert!(matches!(
            ds.append(RowData::F64(&[1.0])),
            Err(StorageError::Closed(_))
        ));
        assert_eq!(log.lock().unwrap().values.len(), 3);

        let (sink, log) = VecSink::new(8, 1);
        {
            let mut ds = GrowableDataset::new(sink, 8).unwrap();
            ds.append(RowData::F64(&rows(5))).unwrap();
        }
        let log = log.lock().unwrap();
        assert_eq!(log.values.len(), 5);
        assert!(!log.attrs.contains_key("finished"));
    }

    #[test]
    fn test_finish_twice_is_an_error() {
        let (sink, _log) = VecSink::new(2, 1);
        let mut ds = GrowableDataset::new(sink, 2).unwrap();
        ds.finish().unwrap();
        assert!(matches!(ds.finish(), Err(StorageError::Closed(_))));
    }
}
