use canopy_types::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {hash} does not match its content: stored as {actual}")]
    HashMismatch { hash: Hash, actual: Hash },

    #[error("object {hash} is corrupt: {reason}")]
    Corrupt { hash: Hash, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
