//! Storage error type and its conversion into [`DaqError`].

use crate::arena::Dtype;
use nanotrack_core::DaqError;
use thiserror::Error;

/// Errors raised by the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failure inside the HDF5 library.
    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// A buffer of the wrong element type was written.
    #[error("Dataset '{dataset}' stores {expected:?}, got {got:?}")]
    DtypeMismatch {
        /// Dataset name
        dataset: String,
        /// Element type the dataset was created with
        expected: Dtype,
        /// Element type of the rejected buffer
        got: Dtype,
    },

    /// A buffer did not hold a whole number of rows.
    #[error("Dataset '{dataset}' rows hold {row_len} elements, got a buffer of {len}")]
    ShapeMismatch {
        /// Dataset name
        dataset: String,
        /// Elements per row
        row_len: usize,
        /// Length of the rejected buffer
        len: usize,
    },

    /// A frame's `(width, height)` differs from the dataset it is appended to.
    #[error("Frame size {got:?} does not match dataset size {expected:?}")]
    FrameSize {
        /// Size the dataset was created with
        expected: (usize, usize),
        /// Size of the rejected frame
        got: (usize, usize),
    },

    /// The dataset or writer has already been finished or aborted.
    #[error("'{0}' is closed")]
    Closed(String),

    /// A group or dataset with this name exists already.
    #[error("'{0}' already exists")]
    AlreadyExists(String),

    /// No group or dataset at this path.
    #[error("'{0}' not found")]
    NotFound(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend specific failure without a richer type.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result alias for the storage layer.
pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for DaqError {
    fn from(err: StorageError) -> Self {
        DaqError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_persistence_error() {
        let err: DaqError = StorageError::Closed("Image".into()).into();
        assert!(matches!(err, DaqError::Persistence(_)));
        assert_eq!(err.to_string(), "Persistence error: 'Image' is closed");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = StorageError::ShapeMismatch {
            dataset: "DAQ-input".into(),
            row_len: 100,
            len: 99,
        };
        assert_eq!(
            err.to_string(),
            "Dataset 'DAQ-input' rows hold 100 elements, got a buffer of 99"
        );
    }
}
