use async_trait::async_trait;

use canopy_record::Container;
use canopy_types::Hash;

use crate::error::StoreResult;

/// Content-addressed container store.
///
/// All implementations must satisfy these invariants:
/// - Objects are immutable once written; the hash is the identity of the
///   exact bytes.
/// - `put` is idempotent: storing the same hash twice is a no-op, since the
///   same hash always names the same bytes.
/// - A missing object is `Ok(None)` from `get`, not an error. Errors mean
///   the store itself failed and the operation may be retried.
/// - The store never interprets object contents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object by its content hash.
    async fn get(&self, hash: &Hash) -> StoreResult<Option<Container>>;

    /// Store an object under its content hash.
    ///
    /// Implementations should verify that `hash` matches the container's
    /// bytes and reject mismatches.
    async fn put(&self, hash: &Hash, object: &Container) -> StoreResult<()>;

    /// Check whether an object exists.
    async fn exists(&self, hash: &Hash) -> StoreResult<bool> {
        Ok(self.get(hash).await?.is_some())
    }

    /// Remove an object. Returns `true` if it existed.
    ///
    /// Intended for garbage collection of obsolete parts only; deleting a
    /// referenced object breaks every tree that depends on it.
    async fn delete(&self, hash: &Hash) -> StoreResult<bool>;
}
