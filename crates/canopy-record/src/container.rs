use std::fmt;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;

use canopy_types::Hash;

use crate::error::{RecordError, RecordResult};

type Aes256Ctr = Ctr128BE<Aes256>;

/// An immutable, content-addressed container object.
///
/// Byte layout: `u32-BE hash count ‖ hash count × 32-byte hashes ‖ data`.
/// The hash-table prefix is the "header"; it names every object this one
/// depends on and is never encrypted, so stores can walk object graphs
/// without decryption keys. The data section holds one encoded sibling
/// list (see [`crate::writer`]) and may be encrypted in place.
///
/// A container's identity is `SHA-256(header ‖ data)` over whatever bytes
/// the data section currently holds — for an encrypted object, that is the
/// ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct Container {
    header: Vec<u8>,
    data: Vec<u8>,
}

impl Container {
    /// Assemble a container from its hash table and data section.
    pub fn from_parts(hashes: &[Hash], data: Vec<u8>) -> Self {
        let mut header = Vec::with_capacity(4 + hashes.len() * 32);
        header.extend_from_slice(&(hashes.len() as u32).to_be_bytes());
        for hash in hashes {
            header.extend_from_slice(hash.as_bytes());
        }
        Self { header, data }
    }

    /// Split a raw byte buffer into header and data.
    pub fn from_bytes(bytes: Vec<u8>) -> RecordResult<Self> {
        if bytes.len() < 4 {
            return Err(RecordError::ContainerTooShort {
                expected: 4,
                actual: bytes.len(),
            });
        }
        let count = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let data_start = 4u64 + count as u64 * 32;
        if data_start > bytes.len() as u64 {
            return Err(RecordError::HeaderOverrun { count });
        }
        let data_start = data_start as usize;
        let mut header = bytes;
        let data = header.split_off(data_start);
        Ok(Self { header, data })
    }

    /// Number of entries in the hash table.
    pub fn hash_count(&self) -> u32 {
        u32::from_be_bytes([self.header[0], self.header[1], self.header[2], self.header[3]])
    }

    /// The hash at the given table index, if in range.
    pub fn hash_at(&self, index: u32) -> Option<Hash> {
        if index >= self.hash_count() {
            return None;
        }
        let start = 4 + index as usize * 32;
        Hash::from_slice(&self.header[start..start + 32]).ok()
    }

    /// All hashes in the table, in table order.
    pub fn hashes(&self) -> Vec<Hash> {
        (0..self.hash_count()).filter_map(|i| self.hash_at(i)).collect()
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serialized size: header plus data.
    pub fn byte_len(&self) -> usize {
        self.header.len() + self.data.len()
    }

    /// The container's content identity: `SHA-256(header ‖ data)`.
    pub fn calculate_hash(&self) -> Hash {
        Hash::of_parts(&[&self.header, &self.data])
    }

    /// Concatenated header and data bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_len());
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Encrypt or decrypt the data section in place with AES-256-CTR.
    ///
    /// The operation is an involution: applying it twice with the same key
    /// restores the original bytes. The header is left untouched. The
    /// counter starts at zero; keys must be single-use per object.
    pub fn crypt_in_place(&mut self, key: &[u8; 32]) {
        let mut cipher = Aes256Ctr::new(key.into(), &[0u8; 16].into());
        cipher.apply_keystream(&mut self.data);
    }

    /// Encrypt the data section in place with a fresh random key, and
    /// return the key.
    pub fn crypt_in_place_random(&mut self) -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        self.crypt_in_place(&key);
        key
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("hash_count", &self.hash_count())
            .field("data_len", &self.data.len())
            .finish()
    }
}
