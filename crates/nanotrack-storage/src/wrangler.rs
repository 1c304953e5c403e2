//! Owner of one acquisition session file.
//!
//! Layout produced:
//!
//! ```text
//! /                       attrs: creation
//! /data/Acquisition_0     attrs: creation
//! /data/Acquisition_1     ...
//! ```

use crate::arena::AttrValue;
use crate::container::GroupHandle;
use crate::error::{Result, StorageError};
use crate::memory::MemoryStore;
use crate::timestamp;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File extension appended when the requested name lacks it.
pub const EXTENSION: &str = "hdf5";

/// Name of the group holding every acquisition group.
pub const DATA_GROUP: &str = "data";

enum Backend {
    Memory(MemoryStore),
    #[cfg(feature = "storage_hdf5")]
    Hdf5(hdf5::File),
}

/// Owns the session file handle and hands out acquisition groups.
pub struct FileWrangler {
    path: PathBuf,
    backend: Option<Backend>,
    root: Option<GroupHandle>,
}

impl FileWrangler {
    /// Create a new HDF5 session file.
    ///
    /// `.hdf5` is appended when missing. If the file exists, a numeric `_N`
    /// suffix is bumped (or `_1` appended) until the name is free, so an
    /// earlier session is never overwritten.
    #[cfg(feature = "storage_hdf5")]
    pub fn create(requested: impl AsRef<Path>) -> Result<Self> {
        let path = unique_path(requested.as_ref());
        let file = hdf5::File::create(&path)?;
        let root: GroupHandle = std::sync::Arc::new(crate::hdf5_backend::Hdf5Group::new(
            file.as_group()?,
        ));
        root.set_attr("creation", &AttrValue::Text(timestamp::now()))?;
        info!(path = %path.display(), "Created session file");
        Ok(Self {
            path,
            backend: Some(Backend::Hdf5(file)),
            root: Some(root),
        })
    }

    /// A session held entirely in memory.
    pub fn in_memory(name: impl AsRef<Path>) -> Result<Self> {
        let store = MemoryStore::new();
        let root = store.root();
        root.set_attr("creation", &AttrValue::Text(timestamp::now()))?;
        Ok(Self {
            path: with_extension(name.as_ref()),
            backend: Some(Backend::Memory(store)),
            root: Some(root),
        })
    }

    /// Path of the session file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory store, when this session is memory backed.
    pub fn memory_store(&self) -> Option<&MemoryStore> {
        match self.backend.as_ref()? {
            Backend::Memory(store) => Some(store),
            #[cfg(feature = "storage_hdf5")]
            Backend::Hdf5(_) => None,
        }
    }

    /// True until [`close`](Self::close) has run.
    pub fn is_open(&self) -> bool {
        self.root.is_some()
    }

    /// Create `/data/Acquisition_N`, N being the number of existing groups.
    pub fn start_new_acquisition_group(&self) -> Result<GroupHandle> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| StorageError::Closed(self.path.display().to_string()))?;
        let data = root.require_group(DATA_GROUP)?;
        let number = data.group_names()?.len();
        let group = data.create_group(&format!("Acquisition_{}", number))?;
        group.set_attr("creation", &AttrValue::Text(timestamp::now()))?;
        info!(group = group.path(), "Started acquisition group");
        Ok(group)
    }

    /// Flush and release the file. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        self.root = None;
        match self.backend.take() {
            None => {
                debug!(path = %self.path.display(), "Session file already closed");
                Ok(())
            }
            Some(Backend::Memory(_)) => Ok(()),
            #[cfg(feature = "storage_hdf5")]
            Some(Backend::Hdf5(file)) => {
                file.flush()?;
                info!(path = %self.path.display(), "Closed session file");
                Ok(())
            }
        }
    }
}

impl Drop for FileWrangler {
    fn drop(&mut self) {
        if self.backend.is_some() {
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), error = %e, "Closing session file on drop failed");
            }
        }
    }
}

/// Append `.hdf5` unless the name already ends with it.
pub fn with_extension(requested: &Path) -> PathBuf {
    match requested.extension() {
        Some(ext) if ext == EXTENSION => requested.to_path_buf(),
        _ => {
            let mut name = requested.as_os_str().to_os_string();
            name.push(".");
            name.push(EXTENSION);
            PathBuf::from(name)
        }
    }
}

/// First free path for `requested`, see [`FileWrangler::create`].
pub fn unique_path(requested: &Path) -> PathBuf {
    let mut path = with_extension(requested);
    while path.exists() {
        path = bump_suffix(&path);
    }
    path
}

fn bump_suffix(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let next = match stem.rsplit_once('_') {
        Some((base, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => {
            match n.parse::<u64>() {
                Ok(n) => format!("{}_{}", base, n + 1),
                Err(_) => format!("{}_1", stem),
            }
        }
        _ => format!("{}_1", stem),
    };
    path.with_file_name(format!("{}.{}", next, EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension(Path::new("run")), PathBuf::from("run.hdf5"));
        assert_eq!(
            with_extension(Path::new("run.hdf5")),
            PathBuf::from("run.hdf5")
        );
        assert_eq!(
            with_extension(Path::new("run.v2")),
            PathBuf::from("run.v2.hdf5")
        );
    }

    #[test]
    fn test_bump_suffix() {
        assert_eq!(
            bump_suffix(Path::new("/tmp/run.hdf5")),
            PathBuf::from("/tmp/run_1.hdf5")
        );
        assert_eq!(
            bump_suffix(Path::new("/tmp/run_1.hdf5")),
            PathBuf::from("/tmp/run_2.hdf5")
        );
        assert_eq!(
            bump_suffix(Path::new("/tmp/led_series_9.hdf5")),
            PathBuf::from("/tmp/led_series_10.hdf5")
        );
        assert_eq!(
            bump_suffix(Path::new("/tmp/run_a.hdf5")),
            PathBuf::from("/tmp/run_a_1.hdf5")
        );
    }

    #[test]
    fn test_unique_path_skips_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("tracks");
        assert_eq!(unique_path(&base), dir.path().join("tracks.hdf5"));

        std::fs::write(dir.path().join("tracks.hdf5"), b"").unwrap();
        std::fs::write(dir.path().join("tracks_1.hdf5"), b"").unwrap();
        assert_eq!(unique_path(&base), dir.path().join("tracks_2.hdf5"));
    }

    #[test]
    fn test_acquisition_groups_are_numbered() {
        let mut wrangler = FileWrangler::in_memory("session").unwrap();
        let store = wrangler.memory_store().unwrap().clone();
        assert!(store.group_attrs("/").unwrap().contains_key("creation"));

        let first = wrangler.start_new_acquisition_group().unwrap();
        let second = wrangler.start_new_acquisition_group().unwrap();
        assert_eq!(first.path(), "/data/Acquisition_0");
        assert_eq!(second.path(), "/data/Acquisition_1");
        assert!(store
            .group_attrs("/data/Acquisition_1")
            .unwrap()
            .contains_key("creation"));

        wrangler.close().unwrap();
        wrangler.close().unwrap();
        assert!(!wrangler.is_open());
        assert!(matches!(
            wrangler.start_new_acquisition_group(),
            Err(StorageError::Closed(_))
        ));
    }
}
