//! Coalesced change notification.
//!
//! Every value or structure change marks its item and links it (once) into
//! the parent's dirty list, building a sparse forest of dirty items. A
//! single [`DataTree::flush`] call then runs one pass: snapshot that forest
//! depth-first from the root — clearing all marks as part of collection, so
//! nothing is lost or delivered twice — and visit it bottom-up, invoking
//! branch listeners with the value-changed selectors under them, value
//! listeners for items whose own value changed, and finally attempting a
//! prune on every visited item.
//!
//! The owning event loop decides what a "tick" is by choosing when to call
//! `flush`; a burst of writes between two flushes produces exactly one
//! notification per affected listener.

use std::cell::RefCell;
use std::rc::Rc;

use crate::item::{NOTIFY_PRUNE, NOTIFY_VALUE_ITEM, NOTIFY_VALUE_PARENT};
use crate::selector::Selector;
use crate::tree::DataTree;

/// Handle for unregistering a listener.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ListenerId(pub(crate) u64);

pub(crate) type BranchListenerRc = Rc<RefCell<dyn FnMut(&ChangeSet<'_>)>>;
pub(crate) type ValueListenerRc = Rc<RefCell<dyn FnMut()>>;

/// One collected dirty item: its selector, the flags it had accumulated,
/// and the end of its subtree range within the collected list.
pub(crate) struct NotifyEntry {
    pub(crate) selector: Selector,
    pub(crate) flags: u8,
    pub(crate) subtree_end: usize,
}

/// The value-changed leaves below (and including) one notified item,
/// handed to branch listeners. Iteration is lazy over the collected
/// snapshot; nothing is allocated per listener.
pub struct ChangeSet<'a> {
    pub(crate) entries: &'a [NotifyEntry],
}

impl<'a> ChangeSet<'a> {
    /// The selectors whose value changed in this batch.
    pub fn iter(&self) -> impl Iterator<Item = &'a Selector> + 'a {
        self.entries
            .iter()
            .filter(|entry| entry.flags & NOTIFY_VALUE_ITEM != 0)
            .map(|entry| &entry.selector)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl DataTree {
    /// Run one coalesced notification pass.
    ///
    /// No-op when nothing changed since the last flush. Listener callbacks
    /// run synchronously inside this call; changes they cause to captured
    /// state are their own business, and items they keep alive via
    /// listeners are never pruned.
    pub fn flush(&mut self) {
        if self.dirty == 0 {
            return;
        }
        self.dirty = 0;

        let root = self.root().clone();
        let mut entries = Vec::new();
        self.collect(&root, &mut entries);

        // Bottom-up: children were collected after their parents, so the
        // reverse order prunes leaves before the branches above them.
        for index in (0..entries.len()).rev() {
            let flags = entries[index].flags;

            if flags & NOTIFY_VALUE_PARENT != 0 {
                let listeners: Vec<BranchListenerRc> = self
                    .item(&entries[index].selector)
                    .map(|item| item.branch_listeners.iter().map(|(_, l)| Rc::clone(l)).collect())
                    .unwrap_or_default();
                if !listeners.is_empty() {
                    let change_set = ChangeSet {
                        entries: &entries[index..entries[index].subtree_end],
                    };
                    for listener in &listeners {
                        (&mut *listener.borrow_mut())(&change_set);
                    }
                }
            }

            if flags & NOTIFY_VALUE_ITEM != 0 {
                let listeners: Vec<ValueListenerRc> = self
                    .item(&entries[index].selector)
                    .map(|item| item.value_listeners.iter().map(|(_, l)| Rc::clone(l)).collect())
                    .unwrap_or_default();
                for listener in &listeners {
                    (&mut *listener.borrow_mut())();
                }
            }

            if flags & NOTIFY_PRUNE != 0 {
                self.prune_if_possible(&entries[index].selector);
            }
        }
    }

    /// Snapshot the dirty forest depth-first, resetting every mark as it is
    /// collected. Changes arriving after collection wait for the next pass.
    fn collect(&mut self, selector: &Selector, out: &mut Vec<NotifyEntry>) {
        let Some(item) = self.item_mut(selector) else {
            return;
        };
        let flags = item.notify_flags;
        item.notify_flags = 0;
        let dirty_children = std::mem::take(&mut item.notify_children);

        let index = out.len();
        out.push(NotifyEntry {
            selector: selector.clone(),
            flags,
            subtree_end: 0,
        });
        for child in &dirty_children {
            self.collect(child, out);
        }
        out[index].subtree_end = out.len();
    }

    /// Remove the item if nothing keeps it alive: no children, no
    /// listeners, no live value, and no marks set since collection.
    fn prune_if_possible(&mut self, selector: &Selector) {
        let Some(item) = self.item(selector) else {
            return;
        };
        if !item.children.is_empty()
            || item.notify_flags != 0
            || item.has_listeners()
            || item.revision > 0
        {
            return;
        }
        let Some(parent) = selector.parent() else {
            return; // the root is never pruned
        };
        self.remove_item(selector, &parent);
    }
}
