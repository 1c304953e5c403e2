//! Incremental persistence for nanotrack.
//!
//! Datasets are created lazily, grow in fixed batches and are trimmed to the
//! rows actually written when a writer finishes, so a stopped session always
//! leaves a structurally valid file.
//!
//! # Backends
//!
//! - [`memory::MemoryStore`]: always available, used by tests and dry runs
//! - HDF5 (`storage_hdf5` feature): `hdf5-metno`, chunked datasets with gzip
//!
//! # Example
//!
//! ```rust,ignore
//! use nanotrack_storage::{FileWrangler, ImageWriter, ImageWriterConfig};
//!
//! let mut session = FileWrangler::create("data/led_series")?;
//! let group = session.start_new_acquisition_group()?;
//! let mut images = ImageWriter::new(group, ImageWriterConfig { stride: 10, ..Default::default() });
//! images.write(&frame)?;
//! images.finish()?;
//! session.close()?;
//! ```

pub mod arena;
pub mod container;
pub mod error;
pub mod memory;
pub mod timestamp;
pub mod wrangler;
pub mod writers;

#[cfg(feature = "storage_hdf5")]
pub mod hdf5_backend;

pub use arena::{AttrValue, DatasetSpec, Dtype, GrowableDataset, ResizableSink, RowData};
pub use container::{Container, GroupHandle};
pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use wrangler::FileWrangler;
pub use writers::{
    AnalogWriter, AnalogWriterConfig, ImageWriter, ImageWriterConfig, Metadata, TrackWriter,
    TriggerWriter, WriterState, TRACK_BATCH,
};
