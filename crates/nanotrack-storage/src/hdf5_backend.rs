//! HDF5 storage backend (requires `storage_hdf5`).
//!
//! Datasets are chunked and unlimited along the first axis; every other axis
//! is fixed at creation from the row shape.

use crate::arena::{AttrValue, DatasetSpec, Dtype, ResizableSink, RowData};
use crate::container::{join, Container, GroupHandle};
use crate::error::{Result, StorageError};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, Extent, Group, Location, SimpleExtents};
use ndarray::{s, ArrayView2, ArrayView3};
use std::str::FromStr;
use std::sync::Arc;

/// An HDF5 group exposed as a [`Container`].
pub struct Hdf5Group {
    group: Group,
    path: String,
}

impl Hdf5Group {
    /// Wrap an open group.
    pub fn new(group: Group) -> Self {
        let path = group.name();
        Self { group, path }
    }
}

impl Container for Hdf5Group {
    fn path(&self) -> &str {
        &self.path
    }

    fn create_group(&self, name: &str) -> Result<GroupHandle> {
        if self.group.link_exists(name) {
            return Err(StorageError::AlreadyExists(join(&self.path, name)));
        }
        Ok(Arc::new(Hdf5Group::new(self.group.create_group(name)?)))
    }

    fn require_group(&self, name: &str) -> Result<GroupHandle> {
        let group = if self.group.link_exists(name) {
            self.group.group(name)?
        } else {
            self.group.create_group(name)?
        };
        Ok(Arc::new(Hdf5Group::new(group)))
    }

    fn group_names(&self) -> Result<Vec<String>> {
        Ok(self
            .group
            .groups()?
            .iter()
            .filter_map(|g| g.name().rsplit('/').next().map(str::to_string))
            .collect())
    }

    fn create_dataset(&self, spec: &DatasetSpec) -> Result<Box<dyn ResizableSink>> {
        if self.group.link_exists(&spec.name) {
            return Err(StorageError::AlreadyExists(join(&self.path, &spec.name)));
        }
        let dataset = match spec.dtype {
            Dtype::U16 => create::<u16>(&self.group, spec)?,
            Dtype::U64 => create::<u64>(&self.group, spec)?,
            Dtype::I64 => create::<i64>(&self.group, spec)?,
            Dtype::F32 => create::<f32>(&self.group, spec)?,
            Dtype::F64 => create::<f64>(&self.group, spec)?,
        };
        Ok(Box::new(Hdf5Dataset {
            dataset,
            name: spec.name.clone(),
            dtype: spec.dtype,
            row_shape: spec.row_shape.clone(),
            allocated: spec.batch,
        }))
    }

    fn set_attr(&self, name: &str, value: &AttrValue) -> Result<()> {
        write_attr(&self.group, name, value)
    }
}

fn create<T: H5Type>(group: &Group, spec: &DatasetSpec) -> Result<Dataset> {
    let mut extents = vec![Extent::resizable(spec.batch)];
    extents.extend(spec.row_shape.iter().map(|&d| Extent::fixed(d)));

    let mut chunk = vec![spec.chunk_rows];
    chunk.extend(spec.row_shape.iter().copied());

    let builder = group
        .new_dataset::<T>()
        .shape(SimpleExtents::new(extents))
        .chunk(chunk);
    let builder = match spec.compression {
        Some(level) => builder.deflate(level),
        None => builder,
    };
    Ok(builder.create(spec.name.as_str())?)
}

fn write_attr(location: &Location, name: &str, value: &AttrValue) -> Result<()> {
    match value {
        AttrValue::Text(text) => {
            let text = VarLenUnicode::from_str(text)
                .map_err(|e| StorageError::Backend(format!("attribute '{}': {}", name, e)))?;
            location
                .new_attr::<VarLenUnicode>()
                .create(name)?
                .write_scalar(&text)?;
        }
        AttrValue::F64(v) => location.new_attr::<f64>().create(name)?.write_scalar(v)?,
        AttrValue::U64(v) => location.new_attr::<u64>().create(name)?.write_scalar(v)?,
        AttrValue::I64(v) => location.new_attr::<i64>().create(name)?.write_scalar(v)?,
    }
    Ok(())
}

struct Hdf5Dataset {
    dataset: Dataset,
    name: String,
    dtype: Dtype,
    row_shape: Vec<usize>,
    allocated: usize,
}

impl Hdf5Dataset {
    fn write_block<T: H5Type>(&self, start: usize, data: &[T]) -> Result<()> {
        let row_len = self.row_len().max(1);
        let rows = data.len() / row_len;
        let end = start + rows;
        let shape_err = |e: ndarray::ShapeError| StorageError::Backend(e.to_string());
        match self.row_shape.as_slice() {
            [] => self.dataset.write_slice(data, start..end)?,
            &[width] => {
                let view = ArrayView2::from_shape((rows, width), data).map_err(shape_err)?;
                self.dataset.write_slice(&view, s![start..end, ..])?
            }
            &[height, width] => {
                let view =
                    ArrayView3::from_shape((rows, height, width), data).map_err(shape_err)?;
                self.dataset.write_slice(&view, s![start..end, .., ..])?
            }
            other => {
                return Err(StorageError::Backend(format!(
                    "unsupported row rank {} for '{}'",
                    other.len(),
                    self.name
                )))
            }
        }
        Ok(())
    }
}

impl ResizableSink for Hdf5Dataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn row_len(&self) -> usize {
        self.row_shape.iter().product()
    }

    fn allocated_rows(&self) -> usize {
        self.allocated
    }

    fn resize(&mut self, rows: usize) -> Result<()> {
        let mut dims = vec![rows];
        dims.extend(&self.row_shape);
        self.dataset.resize(dims)?;
        self.allocated = rows;
        Ok(())
    }

    fn write_rows(&mut self, start: usize, data: RowData<'_>) -> Result<()> {
        match data {
            RowData::U16(d) => self.write_block(start, d),
            RowData::U64(d) => self.write_block(start, d),
            RowData::I64(d) => self.write_block(start, d),
            RowData::F32(d) => self.write_block(start, d),
            RowData::F64(d) => self.write_block(start, d),
        }
    }

    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        write_attr(&self.dataset, name, value)
    }
}
