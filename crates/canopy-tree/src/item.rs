use canopy_record::Record;

use crate::notifier::{BranchListenerRc, ListenerId, ValueListenerRc};
use crate::part::PartRef;
use crate::selector::Selector;

// Notification flags. The value-changed bit stays on the item itself; the
// branch-changed and prune bits propagate to every ancestor.
pub(crate) const NOTIFY_VALUE_PARENT: u8 = 0x01;
pub(crate) const NOTIFY_VALUE_ITEM: u8 = 0x02;
pub(crate) const NOTIFY_VALUE: u8 = NOTIFY_VALUE_PARENT | NOTIFY_VALUE_ITEM;
pub(crate) const NOTIFY_PRUNE: u8 = 0x04;
pub(crate) const NOTIFY_PARENT_MASK: u8 = NOTIFY_VALUE_PARENT | NOTIFY_PRUNE;

/// The lazily-created runtime node behind one selector.
///
/// Items live in the tree's selector-keyed index and are created on demand:
/// when a path is first addressed, or when a merge supplies a value below
/// them. They are destroyed again (pruned) once they hold no value, have no
/// children and no listeners.
///
/// Value state:
/// - `revision == 0`, empty value — never had a value (or it was forgotten);
///   the item exists only as structure and may be pruned.
/// - `revision > 0` — the value was last written at that revision and is
///   owned by exactly one part (`part` is `Some`).
pub(crate) struct Item {
    pub(crate) children: Vec<Selector>,
    pub(crate) value: Record,
    pub(crate) revision: i64,
    pub(crate) part: Option<PartRef>,
    pub(crate) notify_flags: u8,
    pub(crate) notify_children: Vec<Selector>,
    pub(crate) branch_listeners: Vec<(ListenerId, BranchListenerRc)>,
    pub(crate) value_listeners: Vec<(ListenerId, ValueListenerRc)>,
}

impl Item {
    pub(crate) fn new() -> Self {
        Self {
            children: Vec::new(),
            value: Record::new(),
            revision: 0,
            part: None,
            notify_flags: 0,
            notify_children: Vec::new(),
            branch_listeners: Vec::new(),
            value_listeners: Vec::new(),
        }
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.branch_listeners.is_empty() || !self.value_listeners.is_empty()
    }
}
