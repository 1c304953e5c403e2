//! In-memory storage backend.
//!
//! Mirrors the HDF5 layout (groups, growable datasets, scalar attributes) in
//! plain vectors so writers can be exercised, and read back, without the HDF5
//! library. Also supports failure injection for the persistence error path.

use crate::arena::{AttrValue, DatasetSpec, Dtype, ResizableSink, RowData};
use crate::container::{join, Container, GroupHandle};
use crate::error::{Result, StorageError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Typed element storage of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// `u16` elements
    U16(Vec<u16>),
    /// `u64` elements
    U64(Vec<u64>),
    /// `i64` elements
    I64(Vec<i64>),
    /// `f32` elements
    F32(Vec<f32>),
    /// `f64` elements
    F64(Vec<f64>),
}

impl Column {
    fn zeros(dtype: Dtype, len: usize) -> Self {
        match dtype {
            Dtype::U16 => Column::U16(vec![0; len]),
            Dtype::U64 => Column::U64(vec![0; len]),
            Dtype::I64 => Column::I64(vec![0; len]),
            Dtype::F32 => Column::F32(vec![0.0; len]),
            Dtype::F64 => Column::F64(vec![0.0; len]),
        }
    }

    fn resize(&mut self, len: usize) {
        match self {
            Column::U16(v) => v.resize(len, 0),
            Column::U64(v) => v.resize(len, 0),
            Column::I64(v) => v.resize(len, 0),
            Column::F32(v) => v.resize(len, 0.0),
            Column::F64(v) => v.resize(len, 0.0),
        }
    }

    fn write(&mut self, offset: usize, data: RowData<'_>) -> bool {
        fn put<T: Copy>(dst: &mut [T], offset: usize, src: &[T]) -> bool {
            match dst.get_mut(offset..offset + src.len()) {
                Some(slot) => {
                    slot.copy_from_slice(src);
                    true
                }
                None => false,
            }
        }
        match (self, data) {
            (Column::U16(v), RowData::U16(d)) => put(v, offset, d),
            (Column::U64(v), RowData::U64(d)) => put(v, offset, d),
            (Column::I64(v), RowData::I64(d)) => put(v, offset, d),
            (Column::F32(v), RowData::F32(d)) => put(v, offset, d),
            (Column::F64(v), RowData::F64(d)) => put(v, offset, d),
            _ => false,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Column::U16(v) => v.len(),
            Column::U64(v) => v.len(),
            Column::I64(v) => v.len(),
            Column::F32(v) => v.len(),
            Column::F64(v) => v.len(),
        }
    }

    /// True when no elements are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements as `u16`, if that is the column type.
    pub fn as_u16(&self) -> Option<&[u16]> {
        match self {
            Column::U16(v) => Some(v),
            _ => None,
        }
    }

    /// Elements as `u64`, if that is the column type.
    pub fn as_u64(&self) -> Option<&[u64]> {
        match self {
            Column::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Elements as `i64`, if that is the column type.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Column::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Elements as `f32`, if that is the column type.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Column::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Elements as `f64`, if that is the column type.
    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            Column::F64(v) => Some(v),
            _ => None,
        }
    }
}

/// Copy of a dataset's state, for inspection.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    /// Layout the dataset was created with
    pub spec: DatasetSpec,
    /// Rows allocated (the first-axis extent)
    pub rows: usize,
    /// Element data, `rows * row_len` long
    pub column: Column,
    /// Scalar attributes
    pub attrs: BTreeMap<String, AttrValue>,
}

impl DatasetSnapshot {
    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// String attribute by name.
    pub fn text_attr(&self, name: &str) -> Option<&str> {
        match self.attrs.get(name) {
            Some(AttrValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Full shape, first axis included.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = vec![self.rows];
        shape.extend(&self.spec.row_shape);
        shape
    }
}

#[derive(Debug, Default)]
struct Tree {
    groups: BTreeMap<String, BTreeMap<String, AttrValue>>,
    datasets: BTreeMap<String, DatasetSnapshot>,
    /// Row writes allowed before injected failures start.
    writes_before_failure: Option<usize>,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        self.groups.contains_key(path) || self.datasets.contains_key(path)
    }
}

/// Root of an in-memory storage file. Clones share the same tree.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store holding only the root group.
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.groups.insert("/".to_string(), BTreeMap::new());
        Self {
            tree: Arc::new(Mutex::new(tree)),
        }
    }

    /// Handle to the root group.
    pub fn root(&self) -> GroupHandle {
        Arc::new(MemoryGroup {
            tree: self.tree.clone(),
            path: "/".to_string(),
        })
    }

    /// Snapshot of the dataset at `path`.
    pub fn dataset(&self, path: &str) -> Option<DatasetSnapshot> {
        self.tree.lock().datasets.get(path).cloned()
    }

    /// Attributes of the group at `path`.
    pub fn group_attrs(&self, path: &str) -> Option<BTreeMap<String, AttrValue>> {
        self.tree.lock().groups.get(path).cloned()
    }

    /// True if a group exists at `path`.
    pub fn has_group(&self, path: &str) -> bool {
        self.tree.lock().groups.contains_key(path)
    }

    /// Paths of every dataset in the store.
    pub fn dataset_paths(&self) -> Vec<String> {
        self.tree.lock().datasets.keys().cloned().collect()
    }

    /// Make every subsequent row write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.tree.lock().writes_before_failure = fail.then_some(0);
    }

    /// Let `writes` more row writes succeed, then fail every one after.
    pub fn fail_writes_after(&self, writes: usize) {
        self.tree.lock().writes_before_failure = Some(writes);
    }
}

struct MemoryGroup {
    tree: Arc<Mutex<Tree>>,
    path: String,
}

impl Container for MemoryGroup {
    fn path(&self) -> &str {
        &self.path
    }

    fn create_group(&self, name: &str) -> Result<GroupHandle> {
        let path = join(&self.path, name);
        let mut tree = self.tree.lock();
        if tree.exists(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        tree.groups.insert(path.clone(), BTreeMap::new());
        Ok(Arc::new(MemoryGroup {
            tree: self.tree.clone(),
            path,
        }))
    }

    fn require_group(&self, name: &str) -> Result<GroupHandle> {
        let path = join(&self.path, name);
        let mut tree = self.tree.lock();
        if tree.datasets.contains_key(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        tree.groups.entry(path.clone()).or_default();
        Ok(Arc::new(MemoryGroup {
            tree: self.tree.clone(),
            path,
        }))
    }

    fn group_names(&self) -> Result<Vec<String>> {
        let tree = self.tree.lock();
        let prefix = join(&self.path, "");
        Ok(tree
            .groups
            .keys()
            .filter_map(|p| p.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn create_dataset(&self, spec: &DatasetSpec) -> Result<Box<dyn ResizableSink>> {
        let path = join(&self.path, &spec.name);
        let mut tree = self.tree.lock();
        if tree.exists(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        let row_len = spec.row_len();
        tree.datasets.insert(
            path.clone(),
            DatasetSnapshot {
                spec: spec.clone(),
                rows: spec.batch,
                column: Column::zeros(spec.dtype, spec.batch * row_len),
                attrs: BTreeMap::new(),
            },
        );
        Ok(Box::new(MemoryDataset {
            tree: self.tree.clone(),
            path,
            name: spec.name.clone(),
            dtype: spec.dtype,
            row_len,
            allocated: spec.batch,
        }))
    }

    fn set_attr(&self, name: &str, value: &AttrValue) -> Result<()> {
        let mut tree = self.tree.lock();
        let attrs = tree
            .groups
            .get_mut(&self.path)
            .ok_or_else(|| StorageError::NotFound(self.path.clone()))?;
        attrs.insert(name.to_string(), value.clone());
        Ok(())
    }
}

struct MemoryDataset {
    tree: Arc<Mutex<Tree>>,
    path: String,
    name: String,
    dtype: Dtype,
    row_len: usize,
    allocated: usize,
}

impl MemoryDataset {
    fn with_entry<T>(&self, f: impl FnOnce(&mut DatasetSnapshot) -> Result<T>) -> Result<T> {
        let mut tree = self.tree.lock();
        let entry = tree
            .datasets
            .get_mut(&self.path)
            .ok_or_else(|| StorageError::NotFound(self.path.clone()))?;
        f(entry)
    }
}

impl ResizableSink for MemoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn row_len(&self) -> usize {
        self.row_len
    }

    fn allocated_rows(&self) -> usize {
        self.allocated
    }

    fn resize(&mut self, rows: usize) -> Result<()> {
        let row_len = self.row_len;
        self.with_entry(|entry| {
            entry.rows = rows;
            entry.column.resize(rows * row_len);
            Ok(())
        })?;
        self.allocated = rows;
        Ok(())
    }

    fn write_rows(&mut self, start: usize, data: RowData<'_>) -> Result<()> {
        {
            let mut tree = self.tree.lock();
            match tree.writes_before_failure {
                Some(0) => {
                    return Err(StorageError::Backend(format!(
                        "injected write failure on '{}'",
                        self.path
                    )))
                }
                Some(n) => tree.writes_before_failure = Some(n - 1),
                None => {}
            }
        }
        let offset = start * self.row_len;
        let path = self.path.clone();
        self.with_entry(|entry| {
            if entry.column.write(offset, data) {
                Ok(())
            } else {
                Err(StorageError::Backend(format!(
                    "write of {} elements at row {} outside '{}'",
                    data.len(),
                    start,
                    path
                )))
            }
        })
    }

    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        self.with_entry(|entry| {
            entry.attrs.insert(name.to_string(), value.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::GrowableDataset;

    #[test]
    fn test_group_hierarchy() {
        let store = MemoryStore::new();
        let root = store.root();
        let data = root.require_group("data").unwrap();
        assert_eq!(data.path(), "/data");
        data.create_group("Acquisition_0").unwrap();
        data.create_group("Acquisition_1").unwrap();
        assert!(matches!(
            data.create_group("Acquisition_1"),
            Err(StorageError::AlreadyExists(_))
        ));
        // require_group is idempotent
        root.require_group("data").unwrap();

        assert_eq!(
            data.group_names().unwrap(),
            vec!["Acquisition_0".to_string(), "Acquisition_1".to_string()]
        );
        assert_eq!(root.group_names().unwrap(), vec!["data".to_string()]);
    }

    #[test]
    fn test_dataset_roundtrip_through_arena() {
        let store = MemoryStore::new();
        let group = store.root().create_group("g").unwrap();
        let spec = DatasetSpec::new("Image", Dtype::U16, 2).with_row_shape(vec![2, 2]);
        let sink = group.create_dataset(&spec).unwrap();
        let mut ds = GrowableDataset::new(sink, 2).unwrap();

        for i in 0..3u16 {
            ds.append(RowData::U16(&[i, i, i, i])).unwrap();
        }
        ds.set_attr("creation", "now").unwrap();
        ds.finish().unwrap();

        let snap = store.dataset("/g/Image").unwrap();
        assert_eq!(snap.shape(), vec![3, 2, 2]);
        assert_eq!(
            snap.column.as_u16().unwrap(),
            &[0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]
        );
        assert_eq!(snap.text_attr("creation"), Some("now"));
        assert!(snap.text_attr("finished").is_some());
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryStore::new();
        let spec = DatasetSpec::new("x", Dtype::F32, 4);
        let sink = store.root().create_dataset(&spec).unwrap();
        let mut ds = GrowableDataset::new(sink, 4).unwrap();
        store.set_fail_writes(true);
        assert!(matches!(
            ds.append(RowData::F32(&[1.0])),
            Err(StorageError::Backend(_))
        ));
        store.set_fail_writes(false);
        ds.append(RowData::F32(&[1.0])).unwrap();

        store.fail_writes_after(2);
        ds.append(RowData::F32(&[2.0])).unwrap();
        ds.append(RowData::F32(&[3.0])).unwrap();
        assert!(ds.append(RowData::F32(&[4.0])).is_err());
        assert_eq!(ds.rows_written(), 3);
    }
}
