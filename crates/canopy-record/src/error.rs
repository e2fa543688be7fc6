use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("container too short: {actual} bytes, header needs at least {expected}")]
    ContainerTooShort { expected: usize, actual: usize },

    #[error("declared hash table ({count} hashes) overruns the container")]
    HeaderOverrun { count: u32 },

    #[error("record data truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("declared node length {length} overruns the record data")]
    LengthOverrun { length: u64 },

    #[error("hash table index {index} out of range (table holds {count})")]
    HashIndexOutOfRange { index: u32, count: u32 },
}

pub type RecordResult<T> = Result<T, RecordError>;
