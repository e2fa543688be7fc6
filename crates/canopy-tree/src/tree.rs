use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use canopy_record::Record;
use canopy_store::ObjectStore;
use canopy_types::{encoding, Hash, HashAndKey};

use crate::error::{ReadError, SaveError};
use crate::item::{Item, NOTIFY_PRUNE, NOTIFY_VALUE};
use crate::notifier::{ChangeSet, ListenerId};
use crate::part::{Part, PartRef};
use crate::selector::Selector;

/// Client tag written into every saved part, next to the creation revision.
const CLIENT: &str = concat!("canopy ", env!("CARGO_PKG_VERSION"));

/// Result of a completed [`DataTree::save`]: which object was published,
/// and which previously published objects are now safe to garbage-collect.
#[derive(Clone, Debug)]
pub struct SaveOutcome {
    /// The revision stamped into the new part, or 0 if nothing was written.
    pub revision: i64,
    /// The newly published part, if there were changes to save.
    pub new_part: Option<HashAndKey>,
    /// Parts that no longer own any value and were dropped.
    pub obsolete_parts: Vec<Hash>,
}

/// A private, hierarchically-addressed key/value tree that synchronizes by
/// exchanging immutable, encrypted, content-addressed parts.
///
/// Each leaf carries a [`Record`] value and a revision; concurrent edits
/// resolve per leaf with last-writer-wins. The tree is optimized for rather
/// small data sets (a few thousand entries): all values are held in memory,
/// and listeners are notified of changes in coalesced batches
/// ([`DataTree::flush`]).
///
/// All mutation goes through `&mut self` on one logical owner. The two
/// long-running operations — [`read`](DataTree::read) (fetch and apply
/// pending parts) and [`save`](DataTree::save) (publish local changes) —
/// are async calls against an [`ObjectStore`] and leave the tree untouched
/// when the store fails, so retries are always safe.
pub struct DataTree {
    root: Selector,
    pub(crate) items: HashMap<Selector, Item>,
    pub(crate) parts: HashMap<Hash, Part>,
    pub(crate) changes: Part,
    has_parts_to_merge: bool,
    saving: Rc<Cell<bool>>,
    pub(crate) dirty: usize,
    next_listener_id: u64,
}

impl DataTree {
    pub fn new() -> Self {
        Self {
            root: Selector::root(),
            items: HashMap::new(),
            parts: HashMap::new(),
            changes: Part::new_changes(),
            has_parts_to_merge: false,
            saving: Rc::new(Cell::new(false)),
            dirty: 0,
            next_listener_id: 0,
        }
    }

    /// The root selector of this tree.
    pub fn root(&self) -> &Selector {
        &self.root
    }

    // --- Items ---

    pub(crate) fn item(&self, selector: &Selector) -> Option<&Item> {
        self.items.get(selector)
    }

    pub(crate) fn item_mut(&mut self, selector: &Selector) -> Option<&mut Item> {
        self.items.get_mut(selector)
    }

    pub(crate) fn contains_item(&self, selector: &Selector) -> bool {
        self.items.contains_key(selector)
    }

    pub(crate) fn item_children(&self, selector: &Selector) -> &[Selector] {
        self.items.get(selector).map_or(&[], |item| &item.children)
    }

    /// Materialize the item behind a selector, creating all missing
    /// ancestors. Freshly created items are marked for pruning, so items
    /// that were only addressed (never written) disappear at the next flush.
    pub(crate) fn ensure_item(&mut self, selector: &Selector) {
        if self.items.contains_key(selector) {
            return;
        }
        if let Some(parent) = selector.parent() {
            self.ensure_item(&parent);
            self.items.insert(selector.clone(), Item::new());
            if let Some(parent_item) = self.items.get_mut(&parent) {
                parent_item.children.push(selector.clone());
            }
            self.mark(selector, NOTIFY_PRUNE);
        } else {
            self.items.insert(selector.clone(), Item::new());
        }
    }

    pub(crate) fn remove_item(&mut self, selector: &Selector, parent: &Selector) {
        self.items.remove(selector);
        if let Some(parent_item) = self.items.get_mut(parent) {
            parent_item.children.retain(|child| child != selector);
        }
    }

    /// Mark an item dirty. The value-changed bit stays on the item; the
    /// branch-changed and prune bits propagate to the ancestors. An item
    /// links into its parent's dirty list at most once per flush cycle.
    pub(crate) fn mark(&mut self, selector: &Selector, flags: u8) {
        let mut selector = selector.clone();
        let mut flags = flags;
        loop {
            let Some(item) = self.items.get_mut(&selector) else {
                return;
            };
            if item.notify_flags & flags == flags {
                return;
            }
            let was_clean = item.notify_flags == 0;
            item.notify_flags |= flags;
            if was_clean {
                self.dirty += 1;
                if let Some(parent) = selector.parent() {
                    if let Some(parent_item) = self.items.get_mut(&parent) {
                        parent_item.notify_children.push(selector.clone());
                    }
                }
            }
            let Some(parent) = selector.parent() else {
                return;
            };
            selector = parent;
            flags &= crate::item::NOTIFY_PARENT_MASK;
        }
    }

    // --- Value merge (the single conflict-resolution primitive) ---

    /// Merge a value into the item behind `selector`, on behalf of `part`.
    ///
    /// Last-writer-wins per leaf: a stale revision is rejected, a newer one
    /// accepted. At equal revisions — two copies of the same logical write
    /// arriving through different parts — the copy owned by the strictly
    /// larger part wins, a deterministic tie-break that re-homes the value
    /// without a change notification.
    pub(crate) fn merge_item_value(
        &mut self,
        selector: &Selector,
        part: PartRef,
        revision: i64,
        value: Record,
    ) -> bool {
        if revision <= 0 {
            return false;
        }
        self.ensure_item(selector);
        let (current_revision, current_part) = {
            let item = self.items.get(selector).expect("item just ensured");
            (item.revision, item.part)
        };
        if revision < current_revision {
            return false;
        }
        if revision == current_revision {
            let current_size = current_part.map_or(0, |p| self.part_size(p));
            if self.part_size(part) <= current_size {
                return false;
            }
        }

        if let Some(old_part) = current_part {
            self.part_members(old_part).remove(selector);
        }
        self.part_members(part).insert(selector.clone());
        let item = self.items.get_mut(selector).expect("item just ensured");
        item.part = Some(part);
        item.value = value;
        if revision == current_revision {
            return true;
        }
        item.revision = revision;
        self.mark(selector, NOTIFY_VALUE);
        true
    }

    fn part_size(&self, part: PartRef) -> usize {
        match part {
            PartRef::Changes => self.changes.size,
            PartRef::Stored(hash) => self.parts.get(&hash).map_or(0, |p| p.size),
        }
    }

    fn part_members(&mut self, part: PartRef) -> &mut HashSet<Selector> {
        match part {
            PartRef::Changes => &mut self.changes.members,
            PartRef::Stored(hash) => {
                &mut self
                    .parts
                    .get_mut(&hash)
                    .expect("stored part is registered")
                    .members
            }
        }
    }

    // --- Writing values ---

    /// Set a value at a fresh local revision (wall clock, but always
    /// strictly above the current revision).
    pub fn set(&mut self, selector: &Selector, value: Record) -> bool {
        let revision = now_millis().max(self.revision(selector).saturating_add(1));
        self.merge_item_value(selector, PartRef::Changes, revision, value)
    }

    /// Merge a value at an explicit revision, as a local change. Returns
    /// `false` if the write lost against the current value (or the revision
    /// was not positive).
    pub fn merge(&mut self, selector: &Selector, revision: i64, value: Record) -> bool {
        self.merge_item_value(selector, PartRef::Changes, revision, value)
    }

    /// Merge another selector's value and revision into this one.
    pub fn merge_from(&mut self, selector: &Selector, source: &Selector) -> bool {
        let revision = self.revision(source);
        let value = self.record(source);
        self.merge_item_value(selector, PartRef::Changes, revision, value)
    }

    /// Write an empty value (a tombstone that propagates to other trees).
    pub fn clear(&mut self, selector: &Selector) -> bool {
        self.set(selector, Record::new())
    }

    /// Write an empty value just above the current revision, but only if a
    /// value is currently set. Useful to delete without racing ahead of the
    /// wall clock.
    pub fn clear_in_the_past(&mut self, selector: &Selector) -> bool {
        if !self.is_set(selector) {
            return false;
        }
        let revision = self.revision(selector).saturating_add(1);
        self.merge_item_value(selector, PartRef::Changes, revision, Record::new())
    }

    /// Drop the value and revision locally, without propagating a deletion.
    /// The item itself survives while it has children or listeners.
    pub fn forget(&mut self, selector: &Selector) {
        let Some(item) = self.items.get_mut(selector) else {
            return;
        };
        if item.revision <= 0 {
            return;
        }
        item.revision = 0;
        item.value = Record::new();
        let part = item.part.take();
        if let Some(part) = part {
            self.part_members(part).remove(selector);
        }
        self.mark(selector, NOTIFY_VALUE | NOTIFY_PRUNE);
    }

    /// Forget a whole subtree, leaves first.
    pub fn forget_branch(&mut self, selector: &Selector) {
        for child in self.children(selector) {
            self.forget_branch(&child);
        }
        self.forget(selector);
    }

    // --- Typed value surface ---

    /// Set a single-leaf value: one child carrying `bytes` and `hash`.
    pub fn set_leaf(&mut self, selector: &Selector, bytes: impl Into<Vec<u8>>, hash: Option<Hash>) -> bool {
        let mut value = Record::new();
        value.add(bytes, hash);
        self.set(selector, value)
    }

    pub fn set_bytes(&mut self, selector: &Selector, bytes: impl Into<Vec<u8>>) -> bool {
        self.set_leaf(selector, bytes, None)
    }

    pub fn set_text(&mut self, selector: &Selector, text: &str) -> bool {
        self.set_leaf(selector, text.as_bytes().to_vec(), None)
    }

    pub fn set_boolean(&mut self, selector: &Selector, value: bool) -> bool {
        self.set_leaf(selector, encoding::encode_boolean(value), None)
    }

    pub fn set_integer(&mut self, selector: &Selector, value: i64) -> bool {
        self.set_leaf(selector, encoding::encode_integer(value), None)
    }

    pub fn set_unsigned(&mut self, selector: &Selector, value: u64) -> bool {
        self.set_leaf(selector, encoding::encode_unsigned(value), None)
    }

    pub fn set_hash(&mut self, selector: &Selector, hash: Hash) -> bool {
        self.set_leaf(selector, Vec::new(), Some(hash))
    }

    pub fn set_hash_and_key(&mut self, selector: &Selector, hash_and_key: HashAndKey) -> bool {
        self.set_leaf(selector, hash_and_key.key.to_vec(), Some(hash_and_key.hash))
    }

    // --- Reading values ---

    pub fn revision(&self, selector: &Selector) -> i64 {
        self.items.get(selector).map_or(0, |item| item.revision)
    }

    /// Whether a value is currently set (the value record has children).
    pub fn is_set(&self, selector: &Selector) -> bool {
        self.items
            .get(selector)
            .is_some_and(|item| !item.value.children.is_empty())
    }

    /// The current value record (empty if none).
    pub fn record(&self, selector: &Selector) -> Record {
        self.items
            .get(selector)
            .map_or_else(Record::new, |item| item.value.clone())
    }

    /// The value slot: the value record's first child (empty if none).
    pub fn first_value(&self, selector: &Selector) -> Record {
        self.items
            .get(selector)
            .map_or_else(Record::new, |item| item.value.first_child().clone())
    }

    pub fn bytes_value(&self, selector: &Selector) -> Vec<u8> {
        self.first_value(selector).bytes
    }

    pub fn text_value(&self, selector: &Selector) -> String {
        self.first_value(selector).as_text()
    }

    pub fn boolean_value(&self, selector: &Selector) -> bool {
        self.first_value(selector).as_boolean()
    }

    pub fn integer_value(&self, selector: &Selector) -> i64 {
        self.first_value(selector).as_integer()
    }

    pub fn unsigned_value(&self, selector: &Selector) -> u64 {
        self.first_value(selector).as_unsigned()
    }

    pub fn hash_value(&self, selector: &Selector) -> Option<Hash> {
        self.first_value(selector).hash
    }

    pub fn hash_and_key_value(&self, selector: &Selector) -> Option<HashAndKey> {
        self.first_value(selector).as_hash_and_key()
    }

    /// The currently materialized children of a selector, in creation order.
    pub fn children(&self, selector: &Selector) -> Vec<Selector> {
        self.item_children(selector).to_vec()
    }

    pub fn count_children(&self, selector: &Selector) -> usize {
        self.item_children(selector).len()
    }

    /// The hash of the saved part that owns this selector's value, if the
    /// value has been saved (or merged from a part) already.
    pub fn part_of(&self, selector: &Selector) -> Option<Hash> {
        match self.items.get(selector)?.part? {
            PartRef::Changes => None,
            PartRef::Stored(hash) => Some(hash),
        }
    }

    // --- Listeners ---

    fn next_listener(&mut self) -> ListenerId {
        self.next_listener_id += 1;
        ListenerId(self.next_listener_id)
    }

    /// Watch a subtree. The listener is invoked once per flush whenever any
    /// value below (or at) the selector changed, with the changed leaves.
    pub fn track_branch(
        &mut self,
        selector: &Selector,
        listener: impl FnMut(&ChangeSet<'_>) + 'static,
    ) -> ListenerId {
        self.ensure_item(selector);
        let id = self.next_listener();
        let item = self.items.get_mut(selector).expect("item just ensured");
        item.branch_listeners.push((id, Rc::new(RefCell::new(listener))));
        id
    }

    pub fn untrack_branch(&mut self, selector: &Selector, id: ListenerId) {
        if let Some(item) = self.items.get_mut(selector) {
            item.branch_listeners.retain(|(listener_id, _)| *listener_id != id);
            self.mark(selector, NOTIFY_PRUNE);
        }
    }

    /// Watch a single item's value. The listener is invoked once per flush
    /// whenever the item's own value changed.
    pub fn track_value(&mut self, selector: &Selector, listener: impl FnMut() + 'static) -> ListenerId {
        self.ensure_item(selector);
        let id = self.next_listener();
        let item = self.items.get_mut(selector).expect("item just ensured");
        item.value_listeners.push((id, Rc::new(RefCell::new(listener))));
        id
    }

    pub fn untrack_value(&mut self, selector: &Selector, id: ListenerId) {
        if let Some(item) = self.items.get_mut(selector) {
            item.value_listeners.retain(|(listener_id, _)| *listener_id != id);
            self.mark(selector, NOTIFY_PRUNE);
        }
    }

    // --- Merging parts ---

    /// Register externally supplied parts. Unknown hashes become pending
    /// parts; the next [`read`](DataTree::read) fetches and applies them.
    pub fn merge_parts(&mut self, hashes_and_keys: impl IntoIterator<Item = HashAndKey>) {
        for hash_and_key in hashes_and_keys {
            if self.parts.contains_key(&hash_and_key.hash) {
                continue;
            }
            self.parts.insert(hash_and_key.hash, Part::pending(hash_and_key));
            self.has_parts_to_merge = true;
        }
    }

    pub fn has_parts_to_merge(&self) -> bool {
        self.has_parts_to_merge
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.members.is_empty()
    }

    /// All currently known (pending or merged) part hashes, sorted.
    pub fn known_parts(&self) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = self.parts.keys().copied().collect();
        hashes.sort();
        hashes
    }

    /// Fetch, decrypt and decode every pending part, then merge all of them
    /// into the item tree in one atomic pass.
    ///
    /// Multiple parts jointly describe the current state of a region, so a
    /// partial merge could regress the tree below a revision it had already
    /// observed; on any store failure nothing is applied, the pending flag
    /// is restored, and the whole read fails (fetched payloads stay cached,
    /// making the retry cheap). A part that is missing or does not decode
    /// is dropped permanently instead, and the pass proceeds without it.
    pub async fn read(&mut self, store: &dyn ObjectStore) -> Result<(), ReadError> {
        if !self.has_parts_to_merge {
            return Ok(());
        }
        self.has_parts_to_merge = false;

        let mut pending: Vec<Hash> = self
            .parts
            .iter()
            .filter(|(_, part)| !part.is_merged && part.loaded_record.is_none())
            .map(|(hash, _)| *hash)
            .collect();
        pending.sort();

        let mut store_error = None;
        let mut invalid = Vec::new();
        for hash in pending {
            let Some(hash_and_key) = self.parts.get(&hash).and_then(|part| part.hash_and_key) else {
                continue;
            };
            match store.get(&hash).await {
                Err(error) => {
                    store_error = Some(error);
                }
                Ok(None) => {
                    warn!(part = %hash.short_hex(), "part not found in store, dropping it");
                    invalid.push(hash);
                }
                Ok(Some(mut object)) => {
                    let size = object.byte_len();
                    object.crypt_in_place(&hash_and_key.key);
                    match Record::from_container(&object) {
                        Err(error) => {
                            warn!(part = %hash.short_hex(), %error, "part is not a record, dropping it");
                            invalid.push(hash);
                        }
                        Ok(record) => {
                            let part = self.parts.get_mut(&hash).expect("part still known");
                            part.size = size;
                            part.loaded_record = Some(record);
                        }
                    }
                }
            }
        }
        for hash in invalid {
            self.parts.remove(&hash);
        }
        if let Some(error) = store_error {
            self.has_parts_to_merge = true;
            return Err(ReadError::Store(error));
        }

        let mut loaded: Vec<Hash> = self
            .parts
            .iter()
            .filter(|(_, part)| !part.is_merged && part.loaded_record.is_some())
            .map(|(hash, _)| *hash)
            .collect();
        loaded.sort();

        let root = self.root.clone();
        for hash in loaded {
            let Some(record) = self.parts.get_mut(&hash).and_then(|part| part.loaded_record.take())
            else {
                continue;
            };
            let tree_record = record.child(b"root").clone();
            self.merge_node(hash, &root, &tree_record);
            if let Some(part) = self.parts.get_mut(&hash) {
                part.is_merged = true;
            }
            debug!(part = %hash.short_hex(), "part merged");
        }
        Ok(())
    }

    /// Merge one node of a part's payload: the first child carries the
    /// revision (bytes) and value (children); the remaining children are
    /// the node's subtree. Placeholder nodes (revision 0) merge as no-ops.
    fn merge_node(&mut self, part: Hash, selector: &Selector, record: &Record) {
        if record.children.is_empty() {
            return;
        }
        let value = &record.children[0];
        self.merge_item_value(selector, PartRef::Stored(part), value.as_integer(), value.clone());
        for child in &record.children[1..] {
            self.merge_node(part, &selector.child(child.bytes.clone()), child);
        }
    }

    // --- Saving ---

    /// Publish the pending local changes as a new encrypted part.
    ///
    /// Size-tiered compaction folds every merged part owning fewer members
    /// than twice the running total into the new part, which bounds the
    /// number of live parts to O(log N) while each value is rewritten only
    /// O(log N) times across future saves. The new container is published
    /// to the store *before* any tree state changes, so a failed save
    /// leaves everything as it was and a retry is cheap.
    ///
    /// With no pending changes, the obsolete-part set is still recomputed
    /// and reported, and no object is written.
    pub async fn save(&mut self, store: &dyn ObjectStore) -> Result<SaveOutcome, SaveError> {
        if self.saving.get() {
            return Err(SaveError::SaveInProgress);
        }
        if self.changes.members.is_empty() {
            return Ok(SaveOutcome {
                revision: 0,
                new_part: None,
                obsolete_parts: self.drop_obsolete_parts(),
            });
        }
        self.saving.set(true);
        let _guard = SavingGuard(Rc::clone(&self.saving));

        let revision = now_millis();

        // Fold in every merged part smaller than twice the running total.
        let mut member_count = self.changes.members.len();
        let mut folded: Vec<Hash> = Vec::new();
        loop {
            let mut added = false;
            let mut candidates: Vec<Hash> = self
                .parts
                .iter()
                .filter(|(hash, part)| {
                    part.is_merged && !part.members.is_empty() && !folded.contains(hash)
                })
                .map(|(hash, _)| *hash)
                .collect();
            candidates.sort();
            for hash in candidates {
                let count = self.parts.get(&hash).map_or(0, |part| part.members.len());
                if count == 0 || count >= member_count * 2 {
                    continue;
                }
                member_count += count;
                folded.push(hash);
                added = true;
            }
            if !added {
                break;
            }
        }

        let mut members: HashSet<Selector> = self.changes.members.clone();
        for hash in &folded {
            if let Some(part) = self.parts.get(hash) {
                members.extend(part.members.iter().cloned());
            }
        }

        // Serialize the member union into one record tree keyed by paths.
        let mut record = Record::new();
        record.add_text("created").add_integer(revision);
        record.add_text("client").add_text(CLIENT);
        if let Some(tree_record) = self.save_subtree(&self.root.clone(), &members) {
            record.add_record(tree_record);
        }

        let mut object = record.to_container();
        let key = object.crypt_in_place_random();
        let hash = object.calculate_hash();
        let size = object.byte_len();

        // Publish before touching any tree state, so a failed save leaves
        // everything exactly as it was.
        store.put(&hash, &object).await.map_err(SaveError::Store)?;

        // Commit: re-home the members, register the new part, drop the
        // parts that no longer own anything.
        let hash_and_key = HashAndKey::new(hash, key);
        for selector in &members {
            if let Some(item) = self.items.get_mut(selector) {
                item.part = Some(PartRef::Stored(hash));
            }
        }
        self.changes.members.clear();
        for folded_hash in &folded {
            if let Some(part) = self.parts.get_mut(folded_hash) {
                part.members.clear();
            }
        }
        self.parts.insert(
            hash,
            Part {
                hash_and_key: Some(hash_and_key),
                is_merged: true,
                size,
                members,
                loaded_record: None,
            },
        );
        let obsolete_parts = self.drop_obsolete_parts();
        debug!(
            part = %hash.short_hex(),
            members = member_count,
            obsolete = obsolete_parts.len(),
            "save committed"
        );
        Ok(SaveOutcome {
            revision,
            new_part: Some(hash_and_key),
            obsolete_parts,
        })
    }

    /// Serialize the subtree at `selector` for saving. A node appears if it
    /// is a member of the part being written (first child = revision plus
    /// value children) or lies on the path to one (first child = empty
    /// placeholder). Returns `None` for subtrees with nothing to save.
    fn save_subtree(&self, selector: &Selector, members: &HashSet<Selector>) -> Option<Record> {
        let item = self.items.get(selector)?;
        let child_records: Vec<Record> = item
            .children
            .iter()
            .filter_map(|child| self.save_subtree(child, members))
            .collect();

        let is_member = members.contains(selector);
        if !is_member && child_records.is_empty() && !selector.is_root() {
            return None;
        }

        let label = if selector.is_root() {
            b"root".to_vec()
        } else {
            selector.label().to_vec()
        };
        let mut node = Record::from_bytes(label);
        if is_member {
            let value = node.add_bytes(encoding::encode_integer(item.revision));
            value.add_children(item.value.children.iter().cloned());
        } else {
            node.add_bytes(Vec::new());
        }
        for child_record in child_records {
            node.add_record(child_record);
        }
        Some(node)
    }

    /// Drop and report every part that is merged and owns no value anymore.
    fn drop_obsolete_parts(&mut self) -> Vec<Hash> {
        let mut obsolete: Vec<Hash> = self
            .parts
            .iter()
            .filter(|(_, part)| part.is_merged && part.members.is_empty())
            .map(|(hash, _)| *hash)
            .collect();
        obsolete.sort();
        for hash in &obsolete {
            self.parts.remove(hash);
        }
        if !obsolete.is_empty() {
            debug!(count = obsolete.len(), "obsolete parts dropped");
        }
        obsolete
    }
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DataTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTree")
            .field("items", &self.items.len())
            .field("parts", &self.parts.len())
            .field("changes", &self.changes.members.len())
            .finish()
    }
}

struct SavingGuard(Rc<Cell<bool>>);

impl Drop for SavingGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_store::{InMemoryStore, StoreError, StoreResult};

    fn text_record(text: &str) -> Record {
        let mut record = Record::new();
        record.add_text(text);
        record
    }

    /// Register a merged, empty stored part with a given size, for driving
    /// the tie-break directly.
    fn stored_part(tree: &mut DataTree, seed: u8, size: usize) -> Hash {
        let hash = Hash::of(&[seed]);
        let mut part = Part::pending(HashAndKey::new(hash, [seed; 32]));
        part.is_merged = true;
        part.size = size;
        tree.parts.insert(hash, part);
        hash
    }

    // --- Last-writer-wins ---

    #[test]
    fn merge_rejects_non_positive_revisions() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        assert!(!tree.merge(&a, 0, text_record("x")));
        assert!(!tree.merge(&a, -5, text_record("x")));
        assert_eq!(tree.revision(&a), 0);
    }

    #[test]
    fn merge_is_monotonic() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        assert!(tree.merge(&a, 100, text_record("old")));
        assert!(!tree.merge(&a, 99, text_record("older")));
        assert_eq!(tree.text_value(&a), "old");
        assert!(tree.merge(&a, 101, text_record("new")));
        assert_eq!(tree.text_value(&a), "new");
        assert_eq!(tree.revision(&a), 101);
    }

    #[test]
    fn merge_converges_under_any_order() {
        // Applying the same writes in any order must produce the same
        // final (revision, value).
        let writes = [(100i64, "a"), (200, "b"), (150, "c")];
        let orders = [
            [0usize, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut tree = DataTree::new();
            let a = tree.root().child_text("a");
            for index in order {
                let (revision, text) = writes[index];
                tree.merge(&a, revision, text_record(text));
            }
            assert_eq!(tree.revision(&a), 200, "order {order:?}");
            assert_eq!(tree.text_value(&a), "b", "order {order:?}");
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        assert!(tree.merge(&a, 100, text_record("v")));
        // Same revision from the same (changes) part: equal size, rejected.
        assert!(!tree.merge(&a, 100, text_record("v")));
        assert_eq!(tree.revision(&a), 100);
    }

    #[test]
    fn equal_revision_tie_breaks_on_part_size() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        let small = stored_part(&mut tree, 1, 10);
        let large = stored_part(&mut tree, 2, 20);

        assert!(tree.merge_item_value(&a, PartRef::Stored(small), 100, text_record("copy")));
        // The same write through a strictly larger part re-homes the value.
        assert!(tree.merge_item_value(&a, PartRef::Stored(large), 100, text_record("copy")));
        assert_eq!(tree.part_of(&a), Some(large));
        // The smaller copy arriving afterwards is rejected either way.
        assert!(!tree.merge_item_value(&a, PartRef::Stored(small), 100, text_record("copy")));
        assert_eq!(tree.part_of(&a), Some(large));
        // Membership followed the re-homing.
        assert!(tree.parts[&small].members.is_empty());
        assert!(tree.parts[&large].members.contains(&a));
    }

    #[test]
    fn equal_revision_equal_size_is_rejected() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        let first = stored_part(&mut tree, 1, 10);
        let second = stored_part(&mut tree, 2, 10);

        assert!(tree.merge_item_value(&a, PartRef::Stored(first), 100, text_record("v")));
        assert!(!tree.merge_item_value(&a, PartRef::Stored(second), 100, text_record("v")));
        assert_eq!(tree.part_of(&a), Some(first));
    }

    #[test]
    fn set_always_advances_the_revision() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        tree.merge(&a, i64::MAX - 1, text_record("future"));
        // Even with the revision far ahead of the wall clock, a local set
        // must win.
        assert!(tree.set(&a, text_record("local")));
        assert_eq!(tree.text_value(&a), "local");
        assert_eq!(tree.revision(&a), i64::MAX);
    }

    #[test]
    fn forget_clears_value_and_membership() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        tree.set(&a, text_record("v"));
        assert!(tree.has_changes());

        tree.forget(&a);
        assert_eq!(tree.revision(&a), 0);
        assert!(!tree.is_set(&a));
        assert!(!tree.has_changes());
    }

    #[test]
    fn clear_in_the_past_only_clears_set_values() {
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        assert!(!tree.clear_in_the_past(&a));

        tree.merge(&a, 100, text_record("v"));
        assert!(tree.clear_in_the_past(&a));
        assert!(!tree.is_set(&a));
        assert_eq!(tree.revision(&a), 101);
    }

    #[test]
    fn merge_from_copies_revision_and_value() {
        let mut tree = DataTree::new();
        let source = tree.root().child_text("source");
        let target = tree.root().child_text("target");
        tree.merge(&source, 500, text_record("payload"));

        assert!(tree.merge_from(&target, &source));
        assert_eq!(tree.revision(&target), 500);
        assert_eq!(tree.text_value(&target), "payload");

        // An empty source (revision 0) merges as a no-op.
        let empty = tree.root().child_text("empty");
        assert!(!tree.merge_from(&target, &empty));
    }

    #[test]
    fn typed_values_roundtrip() {
        let mut tree = DataTree::new();
        let root = tree.root().clone();

        tree.set_text(&root.child_text("text"), "hello");
        tree.set_integer(&root.child_text("int"), -42);
        tree.set_unsigned(&root.child_text("uint"), 42);
        tree.set_boolean(&root.child_text("bool"), true);
        let hash = Hash::of(b"linked");
        tree.set_hash(&root.child_text("hash"), hash);
        let hash_and_key = HashAndKey::new(Hash::of(b"enc"), [9u8; 32]);
        tree.set_hash_and_key(&root.child_text("hk"), hash_and_key);

        assert_eq!(tree.text_value(&root.child_text("text")), "hello");
        assert_eq!(tree.integer_value(&root.child_text("int")), -42);
        assert_eq!(tree.unsigned_value(&root.child_text("uint")), 42);
        assert!(tree.boolean_value(&root.child_text("bool")));
        assert_eq!(tree.hash_value(&root.child_text("hash")), Some(hash));
        assert_eq!(tree.hash_and_key_value(&root.child_text("hk")), Some(hash_and_key));
        // Unset selectors read as defaults.
        assert_eq!(tree.text_value(&root.child_text("missing")), "");
        assert_eq!(tree.integer_value(&root.child_text("missing")), 0);
        assert!(!tree.boolean_value(&root.child_text("missing")));
    }

    #[test]
    fn children_are_tracked() {
        let mut tree = DataTree::new();
        let parent = tree.root().child_text("parent");
        tree.set_text(&parent.child_text("x"), "1");
        tree.set_text(&parent.child_text("y"), "2");

        assert_eq!(tree.count_children(&parent), 2);
        let children = tree.children(&parent);
        assert!(children.contains(&parent.child_text("x")));
        assert!(children.contains(&parent.child_text("y")));
    }

    // --- Saving and reading ---

    #[tokio::test]
    async fn save_then_read_into_another_tree() {
        let store = InMemoryStore::new();

        let mut source = DataTree::new();
        let selector = source.root().child_text("a").child_text("b");
        source.merge(&selector, 100, text_record("v1"));
        let outcome = source.save(&store).await.unwrap();
        let hash_and_key = outcome.new_part.expect("a part was written");
        assert!(!source.has_changes());
        assert_eq!(source.part_of(&selector), Some(hash_and_key.hash));

        let mut replica = DataTree::new();
        replica.merge_parts([hash_and_key]);
        assert!(replica.has_parts_to_merge());
        replica.read(&store).await.unwrap();
        assert!(!replica.has_parts_to_merge());

        let replica_selector = replica.root().child_text("a").child_text("b");
        assert_eq!(replica.text_value(&replica_selector), "v1");
        assert_eq!(replica.revision(&replica_selector), 100);
        assert_eq!(replica.part_of(&replica_selector), Some(hash_and_key.hash));
    }

    #[tokio::test]
    async fn saved_objects_are_encrypted() {
        let store = InMemoryStore::new();
        let mut tree = DataTree::new();
        tree.set_text(&tree.root().child_text("secret"), "plaintext marker");
        let outcome = tree.save(&store).await.unwrap();
        let hash_and_key = outcome.new_part.unwrap();

        let object = store.get(&hash_and_key.hash).await.unwrap().unwrap();
        // The stored data section must not decode without the key.
        let as_stored: Vec<u8> = object.data().to_vec();
        assert!(!as_stored.windows(9).any(|w| w == b"plaintext"));

        let mut decrypted = object.clone();
        decrypted.crypt_in_place(&hash_and_key.key);
        let record = Record::from_container(&decrypted).unwrap();
        assert_eq!(
            record.child(b"root").child(b"secret").first_child().text_value(),
            "plaintext marker"
        );
    }

    #[tokio::test]
    async fn save_with_no_changes_writes_nothing() {
        let store = InMemoryStore::new();
        let mut tree = DataTree::new();
        let outcome = tree.save(&store).await.unwrap();
        assert_eq!(outcome.revision, 0);
        assert!(outcome.new_part.is_none());
        assert!(outcome.obsolete_parts.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_while_saving_fails_fast() {
        let store = InMemoryStore::new();
        let mut tree = DataTree::new();
        tree.set_text(&tree.root().child_text("a"), "v");
        tree.saving.set(true);
        let error = tree.save(&store).await.unwrap_err();
        assert!(matches!(error, SaveError::SaveInProgress));
        tree.saving.set(false);
        assert!(tree.save(&store).await.is_ok());
    }

    #[tokio::test]
    async fn overwriting_makes_the_old_part_obsolete() {
        let store = InMemoryStore::new();
        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");

        tree.merge(&a, 100, text_record("v1"));
        let first = tree.save(&store).await.unwrap().new_part.unwrap();

        tree.merge(&a, 200, text_record("v2"));
        let outcome = tree.save(&store).await.unwrap();
        assert_eq!(outcome.obsolete_parts, vec![first.hash]);
        assert_eq!(tree.known_parts().len(), 1);
    }

    #[tokio::test]
    async fn compaction_keeps_the_part_count_logarithmic() {
        let store = InMemoryStore::new();
        let mut tree = DataTree::new();
        let n = 64;
        for i in 0..n {
            let selector = tree.root().child_text("item").child_text(&i.to_string());
            tree.merge(&selector, 1000 + i as i64, text_record("x"));
            tree.save(&store).await.unwrap();
        }
        // 64 single-item saves must leave O(log N) live parts, not O(N).
        assert!(
            tree.known_parts().len() <= 8,
            "expected O(log N) parts, got {}",
            tree.known_parts().len()
        );
        // Every value is still reachable.
        for i in 0..n {
            let selector = tree.root().child_text("item").child_text(&i.to_string());
            assert_eq!(tree.text_value(&selector), "x");
        }
    }

    #[tokio::test]
    async fn read_merges_multiple_parts() {
        let store = InMemoryStore::new();

        let mut source = DataTree::new();
        source.merge(&source.root().child_text("x"), 100, text_record("x1"));
        source.merge(&source.root().child_text("y"), 100, text_record("y1"));
        let part_a = source.save(&store).await.unwrap().new_part.unwrap();
        // A second part that does not fold the first (2 members >= 2 * 1).
        source.merge(&source.root().child_text("z"), 200, text_record("z1"));
        let part_b = source.save(&store).await.unwrap().new_part.unwrap();
        assert_eq!(source.known_parts().len(), 2);

        let mut replica = DataTree::new();
        replica.merge_parts([part_a, part_b]);
        replica.read(&store).await.unwrap();
        assert_eq!(replica.text_value(&replica.root().child_text("x")), "x1");
        assert_eq!(replica.text_value(&replica.root().child_text("y")), "y1");
        assert_eq!(replica.text_value(&replica.root().child_text("z")), "z1");
    }

    #[tokio::test]
    async fn read_with_nothing_pending_is_a_no_op() {
        let store = InMemoryStore::new();
        let mut tree = DataTree::new();
        tree.read(&store).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_parts_are_dropped_permanently() {
        let store = InMemoryStore::new();

        // A well-formed container whose decrypted data is not a valid
        // record: a node declaring 5 payload bytes but carrying 1.
        let key = [3u8; 32];
        let mut bogus = canopy_record::Container::from_parts(&[], vec![0x05, b'a']);
        bogus.crypt_in_place(&key);
        let bogus_hash = bogus.calculate_hash();
        store.put(&bogus_hash, &bogus).await.unwrap();

        let mut tree = DataTree::new();
        tree.merge_parts([HashAndKey::new(bogus_hash, key)]);
        // And one hash that the store has never seen.
        tree.merge_parts([HashAndKey::new(Hash::of(b"never stored"), [0u8; 32])]);

        tree.read(&store).await.unwrap();
        assert!(!tree.has_parts_to_merge());
        assert!(tree.known_parts().is_empty());
    }

    // A store wrapper that fails every `get` for one specific hash.
    struct FailingStore {
        inner: InMemoryStore,
        fail: std::sync::Mutex<Option<Hash>>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for FailingStore {
        async fn get(&self, hash: &Hash) -> StoreResult<Option<canopy_record::Container>> {
            if *self.fail.lock().expect("lock poisoned") == Some(*hash) {
                return Err(StoreError::Io(std::io::Error::other("injected failure")));
            }
            self.inner.get(hash).await
        }

        async fn put(&self, hash: &Hash, object: &canopy_record::Container) -> StoreResult<()> {
            self.inner.put(hash, object).await
        }

        async fn delete(&self, hash: &Hash) -> StoreResult<bool> {
            self.inner.delete(hash).await
        }
    }

    #[tokio::test]
    async fn a_failed_fetch_rolls_the_whole_read_back() {
        let store = FailingStore {
            inner: InMemoryStore::new(),
            fail: std::sync::Mutex::new(None),
        };

        // Two parts that jointly describe the state.
        let mut source = DataTree::new();
        source.merge(&source.root().child_text("x"), 100, text_record("x1"));
        source.merge(&source.root().child_text("y"), 100, text_record("y1"));
        let part_a = source.save(&store).await.unwrap().new_part.unwrap();
        source.merge(&source.root().child_text("z"), 200, text_record("z1"));
        let part_b = source.save(&store).await.unwrap().new_part.unwrap();

        let mut replica = DataTree::new();
        replica.merge_parts([part_a, part_b]);

        // Part B cannot be fetched: nothing may be applied, and the tree
        // must flag the parts as still pending.
        *store.fail.lock().unwrap() = Some(part_b.hash);
        let error = replica.read(&store).await.unwrap_err();
        assert!(matches!(error, ReadError::Store(_)));
        assert!(replica.has_parts_to_merge());
        assert!(!replica.is_set(&replica.root().child_text("x")));
        assert!(!replica.is_set(&replica.root().child_text("z")));

        // Retry after the store recovers: everything lands.
        *store.fail.lock().unwrap() = None;
        replica.read(&store).await.unwrap();
        assert_eq!(replica.text_value(&replica.root().child_text("x")), "x1");
        assert_eq!(replica.text_value(&replica.root().child_text("z")), "z1");
    }

    #[tokio::test]
    async fn a_failed_put_leaves_the_changes_pending() {
        struct RejectingStore;

        #[async_trait::async_trait]
        impl ObjectStore for RejectingStore {
            async fn get(&self, _hash: &Hash) -> StoreResult<Option<canopy_record::Container>> {
                Ok(None)
            }
            async fn put(&self, _hash: &Hash, _object: &canopy_record::Container) -> StoreResult<()> {
                Err(StoreError::Io(std::io::Error::other("store offline")))
            }
            async fn delete(&self, _hash: &Hash) -> StoreResult<bool> {
                Ok(false)
            }
        }

        let mut tree = DataTree::new();
        let a = tree.root().child_text("a");
        tree.merge(&a, 100, text_record("v"));

        let error = tree.save(&RejectingStore).await.unwrap_err();
        assert!(matches!(error, SaveError::Store(_)));
        // Nothing was committed: the change is still pending and a retry
        // against a working store succeeds.
        assert!(tree.has_changes());
        assert!(tree.known_parts().is_empty());

        let store = InMemoryStore::new();
        let outcome = tree.save(&store).await.unwrap();
        assert!(outcome.new_part.is_some());
        assert!(!tree.has_changes());
    }
}
