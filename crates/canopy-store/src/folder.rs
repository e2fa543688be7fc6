use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use canopy_record::Container;
use canopy_types::Hash;

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

/// Folder-backed object store.
///
/// Objects live under `<root>/objects/<first 2 hex chars>/<remaining 62>`,
/// one file per object, holding the raw container bytes. The store keeps no
/// in-process state; concurrent access is coordinated entirely through the
/// file system, which is safe because objects are immutable and writes go
/// through a rename.
pub struct FolderStore {
    objects_dir: PathBuf,
}

impl FolderStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            objects_dir: root.as_ref().join("objects"),
        }
    }

    /// The file path an object with this hash is stored at.
    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

#[async_trait]
impl ObjectStore for FolderStore {
    async fn get(&self, hash: &Hash) -> StoreResult<Option<Container>> {
        let path = self.object_path(hash);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        };
        let container = Container::from_bytes(bytes).map_err(|err| StoreError::Corrupt {
            hash: *hash,
            reason: err.to_string(),
        })?;
        Ok(Some(container))
    }

    async fn put(&self, hash: &Hash, object: &Container) -> StoreResult<()> {
        let actual = object.calculate_hash();
        if actual != *hash {
            return Err(StoreError::HashMismatch { hash: *hash, actual });
        }

        let path = self.object_path(hash);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let dir = path.parent().expect("object path has a parent");
        tokio::fs::create_dir_all(dir).await?;

        // Write to a temporary name first so readers never see a partial
        // object file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, object.to_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(hash = %hash.short_hex(), bytes = object.byte_len(), "object written");
        Ok(())
    }

    async fn exists(&self, hash: &Hash) -> StoreResult<bool> {
        Ok(tokio::fs::try_exists(self.object_path(hash)).await?)
    }

    async fn delete(&self, hash: &Hash) -> StoreResult<bool> {
        match tokio::fs::remove_file(self.object_path(hash)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

impl std::fmt::Debug for FolderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderStore")
            .field("objects_dir", &self.objects_dir)
            .finish()
    }
}
