//! Foundation types for Canopy.
//!
//! This crate provides the identity and value-encoding primitives used by
//! every other Canopy crate:
//!
//! - [`Hash`] — 32-byte SHA-256 content identifier
//! - [`HashAndKey`] — reference to an encrypted object: its hash plus the
//!   symmetric key needed to decrypt it
//! - [`encoding`] — the minimal big-endian byte-string conventions for
//!   integers, unsigned integers, and booleans

pub mod encoding;
pub mod error;
pub mod hash;

pub use error::TypeError;
pub use hash::{Hash, HashAndKey};
