//! Backend-neutral groups: the tree of groups, attributes and resizable
//! datasets a session file is made of.

use crate::arena::{AttrValue, DatasetSpec, ResizableSink};
use crate::error::Result;
use std::sync::Arc;

/// Shared handle to a group in a storage file.
pub type GroupHandle = Arc<dyn Container>;

/// A group-like node in a hierarchical storage file.
///
/// Implemented by the in-memory backend and, behind `storage_hdf5`, by HDF5
/// groups. Writers only see this trait, so the same writer code runs against
/// either backend.
pub trait Container: Send + Sync {
    /// Absolute path of this group, `/` for the root.
    fn path(&self) -> &str;

    /// Create a child group. Fails if it exists.
    fn create_group(&self, name: &str) -> Result<GroupHandle>;

    /// Open a child group, creating it if missing.
    fn require_group(&self, name: &str) -> Result<GroupHandle>;

    /// Names of the direct child groups.
    fn group_names(&self) -> Result<Vec<String>>;

    /// Create a growable dataset with one batch of rows allocated.
    fn create_dataset(&self, spec: &DatasetSpec) -> Result<Box<dyn ResizableSink>>;

    /// Set a scalar attribute on this group.
    fn set_attr(&self, name: &str, value: &AttrValue) -> Result<()>;
}

/// Join a group path and a child name.
pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}
