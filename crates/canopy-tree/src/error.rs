use canopy_store::StoreError;
use thiserror::Error;

/// Errors from [`DataTree::read`](crate::DataTree::read).
///
/// Individual invalid parts are absorbed (dropped with a warning), so a
/// single corrupt peer contribution cannot block synchronization; only
/// store-level failures surface here, because applying a subset of the
/// pending parts is unsafe.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("store error while loading parts: {0}")]
    Store(#[from] StoreError),
}

/// Errors from [`DataTree::save`](crate::DataTree::save).
#[derive(Debug, Error)]
pub enum SaveError {
    /// A save is already outstanding on this tree.
    #[error("a save is already in progress")]
    SaveInProgress,

    /// Publishing the new part failed. No tree state was changed; calling
    /// `save` again retries with the same pending changes.
    #[error("store error while publishing the new part: {0}")]
    Store(StoreError),
}
