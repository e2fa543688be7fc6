use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use canopy_record::Container;
use canopy_types::Hash;

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

/// In-memory, HashMap-based object store.
///
/// Intended for tests and embedding. All objects are held in memory behind
/// a `RwLock`; objects are cloned on read and write.
pub struct InMemoryStore {
    objects: RwLock<HashMap<Hash, Container>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> usize {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(Container::byte_len)
            .sum()
    }

    /// Return a sorted list of all object hashes in the store.
    pub fn all_hashes(&self) -> Vec<Hash> {
        let map = self.objects.read().expect("lock poisoned");
        let mut hashes: Vec<Hash> = map.keys().copied().collect();
        hashes.sort();
        hashes
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, hash: &Hash) -> StoreResult<Option<Container>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(hash).cloned())
    }

    async fn put(&self, hash: &Hash, object: &Container) -> StoreResult<()> {
        let actual = object.calculate_hash();
        if actual != *hash {
            return Err(StoreError::HashMismatch { hash: *hash, actual });
        }
        let mut map = self.objects.write().expect("lock poisoned");
        // Idempotent: content-addressing guarantees the same hash always
        // maps to the same bytes.
        map.entry(*hash).or_insert_with(|| object.clone());
        Ok(())
    }

    async fn exists(&self, hash: &Hash) -> StoreResult<bool> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.contains_key(hash))
    }

    async fn delete(&self, hash: &Hash) -> StoreResult<bool> {
        let mut map = self.objects.write().expect("lock poisoned");
        Ok(map.remove(hash).is_some())
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("object_count", &self.len())
            .finish()
    }
}
