use std::collections::HashSet;

use canopy_record::Record;
use canopy_types::{Hash, HashAndKey};

use crate::selector::Selector;

/// Which part currently owns an item's value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PartRef {
    /// The tree's single mutable, not-yet-saved changes part.
    Changes,
    /// A known part, by the content hash of its container.
    Stored(Hash),
}

/// One batch of item values sharing a serialized container object.
///
/// A part starts out *pending* (registered by hash, container not yet
/// fetched), becomes *merged* once its values have been applied to the item
/// tree, and becomes obsolete once every one of its values has been
/// superseded or re-homed (`is_merged` and no members). The one exception
/// is the changes part, which has no hash yet: it collects locally written
/// values until the next save turns it into a stored part.
pub(crate) struct Part {
    pub(crate) hash_and_key: Option<HashAndKey>,
    pub(crate) is_merged: bool,
    /// Serialized byte length of the container; the tie-breaker for
    /// equal-revision merges. Zero until known.
    pub(crate) size: usize,
    /// Selectors whose current value this part owns.
    pub(crate) members: HashSet<Selector>,
    /// Fetched but not yet applied payload, kept across a failed read so
    /// the retry does not fetch again.
    pub(crate) loaded_record: Option<Record>,
}

impl Part {
    /// The mutable changes part.
    pub(crate) fn new_changes() -> Self {
        Self {
            hash_and_key: None,
            is_merged: false,
            size: 0,
            members: HashSet::new(),
            loaded_record: None,
        }
    }

    /// A known but not yet fetched part.
    pub(crate) fn pending(hash_and_key: HashAndKey) -> Self {
        Self {
            hash_and_key: Some(hash_and_key),
            is_merged: false,
            size: 0,
            members: HashSet::new(),
            loaded_record: None,
        }
    }
}
