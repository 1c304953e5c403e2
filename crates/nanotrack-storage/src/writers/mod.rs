//! Dataset writers for one acquisition group.
//!
//! Every writer follows the same contract:
//!
//! - datasets are created lazily on the first write, one batch allocated,
//!   stamped with `creation` and any metadata;
//! - writes grow the datasets by whole batches;
//! - [`finish`](ImageWriter::finish) trims to the rows written and stamps
//!   `finished`;
//! - any write error aborts the writer (trim, no `finished`) before it is
//!   returned, and every later call fails with [`StorageError::Closed`].

mod analog;
mod image;
mod tracks;

pub use analog::{AnalogWriter, AnalogWriterConfig, TriggerWriter};
pub use image::{ImageWriter, ImageWriterConfig};
pub use tracks::{TrackWriter, TRACK_BATCH};

use crate::arena::{AttrValue, GrowableDataset};
use crate::error::{Result, StorageError};

/// Extra attributes stamped on a writer's datasets at creation.
pub type Metadata = Vec<(String, AttrValue)>;

/// Lifecycle of a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting writes
    Open,
    /// Finished cleanly, `finished` stamped
    Finished,
    /// Closed after an error or an explicit abort
    Aborted,
}

impl WriterState {
    fn check(self, writer: &str) -> Result<()> {
        match self {
            WriterState::Open => Ok(()),
            _ => Err(StorageError::Closed(writer.to_string())),
        }
    }
}

fn stamp(dataset: &mut GrowableDataset, creation: &str, metadata: &[(String, AttrValue)]) -> Result<()> {
    dataset.set_attr("creation", creation)?;
    for (name, value) in metadata {
        dataset.set_attr(name, value.clone())?;
    }
    Ok(())
}

fn abort_all<'a>(datasets: impl IntoIterator<Item = &'a mut GrowableDataset>) {
    for ds in datasets {
        if let Err(e) = ds.abort() {
            tracing::warn!(dataset = ds.name(), error = %e, "Truncate during abort failed");
        }
    }
}

/// Abort datasets that hold one row per item, cutting all to the shortest.
fn abort_aligned(datasets: &mut [&mut GrowableDataset]) {
    let complete = datasets
        .iter()
        .map(|ds| ds.rows_written())
        .min()
        .unwrap_or(0);
    for ds in datasets.iter_mut() {
        if let Err(e) = ds.abort_at(complete) {
            tracing::warn!(dataset = ds.name(), error = %e, "Truncate during abort failed");
        }
    }
}

fn finish_all<'a>(datasets: impl IntoIterator<Item = &'a mut GrowableDataset>) -> Result<()> {
    let stamp = crate::timestamp::now();
    let mut first_err = None;
    for ds in datasets {
        if let Err(e) = ds.finish_at(&stamp) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}
