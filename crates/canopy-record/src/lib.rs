//! Self-describing binary record trees for Canopy.
//!
//! A [`Record`] is a tree node carrying an opaque byte string, an optional
//! reference to another object (a [`Hash`]), and an ordered sequence of
//! child records. Record trees serialize into [`Container`] objects: a
//! deduplicated hash table ("header") followed by the pre-order encoded
//! node sequence ("data"). A container's identity is the SHA-256 of
//! `header ‖ data`, which makes every serialized record tree
//! content-addressed.
//!
//! The header is never encrypted — it is what lets a store discover an
//! object's dependencies without being able to read it. The data section
//! can be encrypted in place with a single-use symmetric key
//! ([`Container::crypt_in_place`]).
//!
//! [`Hash`]: canopy_types::Hash

pub mod container;
pub mod error;
pub mod reader;
pub mod record;
pub mod writer;

pub use container::Container;
pub use error::{RecordError, RecordResult};
pub use record::Record;
