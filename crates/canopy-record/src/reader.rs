//! Record tree decoder.
//!
//! The inverse of [`crate::writer`]. Every declared length is checked
//! against the remaining data before it is read; anything that would run
//! past the container's data section is a decode error, never a panic.
//! Hash-table indices must be in range. Duplicated hash-table entries
//! (produced by older writers) are accepted.

use canopy_types::Hash;

use crate::container::Container;
use crate::error::{RecordError, RecordResult};
use crate::record::Record;

pub struct RecordReader<'a> {
    container: &'a Container,
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(container: &'a Container) -> Self {
        Self {
            container,
            data: container.data(),
            pos: 0,
        }
    }

    /// Decode one sibling list, appending each node as a child of `into`.
    pub fn read_children(&mut self, into: &mut Record) -> RecordResult<()> {
        loop {
            let flags = self.read_u8()?;

            let length_code = flags & 0x1f;
            let byte_length: u64 = match length_code {
                30 => 30 + self.read_u8()? as u64,
                31 => self.read_u64()? & 0x7fff_ffff_ffff_ffff,
                literal => literal as u64,
            };
            if byte_length > (self.data.len() - self.pos) as u64 {
                return Err(RecordError::LengthOverrun { length: byte_length });
            }
            let bytes = self.read_bytes(byte_length as usize)?.to_vec();

            let hash = if flags & 0x20 != 0 {
                Some(self.read_hash_reference()?)
            } else {
                None
            };

            let child = into.add(bytes, hash);
            if flags & 0x40 != 0 {
                self.read_children(child)?;
            }
            if flags & 0x80 == 0 {
                return Ok(());
            }
        }
    }

    /// Bytes remaining after the decoded sibling list.
    pub fn trailer(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn read_hash_reference(&mut self) -> RecordResult<Hash> {
        let index = self.read_u32()?;
        self.container
            .hash_at(index)
            .ok_or(RecordError::HashIndexOutOfRange {
                index,
                count: self.container.hash_count(),
            })
    }

    fn read_bytes(&mut self, length: usize) -> RecordResult<&'a [u8]> {
        if self.pos + length > self.data.len() {
            return Err(RecordError::Truncated { offset: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(slice)
    }

    fn read_u8(&mut self) -> RecordResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> RecordResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> RecordResult<u64> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }
}
