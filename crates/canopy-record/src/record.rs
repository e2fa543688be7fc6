use std::collections::HashSet;
use std::fmt;

use canopy_types::{encoding, Hash, HashAndKey};

use crate::container::Container;
use crate::error::RecordResult;
use crate::reader::RecordReader;
use crate::writer::RecordWriter;

/// The shared "no such node" record returned by the infallible accessors.
static EMPTY: Record = Record {
    bytes: Vec::new(),
    hash: None,
    children: Vec::new(),
};

/// A self-describing tree node.
///
/// Every node carries an opaque byte string, an optional reference to
/// another object, and an ordered sequence of children. Records are value
/// types: equality is structural and [`Clone`] is a deep copy.
///
/// By convention, a node's first child is its "value slot": the
/// `*_value` accessors read the first child, and a record with no children
/// denotes "no value". A node whose `bytes` hold a 32-byte key together
/// with a `hash` denotes a reference to an encrypted object
/// ([`Record::as_hash_and_key`]).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub bytes: Vec<u8>,
    pub hash: Option<Hash>,
    pub children: Vec<Record>,
}

impl Record {
    /// An empty record: no payload, no hash, no children.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            hash: None,
            children: Vec::new(),
        }
    }

    pub fn with_hash(bytes: impl Into<Vec<u8>>, hash: Option<Hash>) -> Self {
        Self {
            bytes: bytes.into(),
            hash,
            children: Vec::new(),
        }
    }

    /// Decode a container's data section into a record tree.
    ///
    /// The returned record is a synthetic root: its children are the
    /// container's top-level sibling list. An empty data section decodes to
    /// a record with no children.
    pub fn from_container(container: &Container) -> RecordResult<Self> {
        let mut root = Record::new();
        if !container.data().is_empty() {
            RecordReader::new(container).read_children(&mut root)?;
        }
        Ok(root)
    }

    /// Serialize this record's children into a fresh container.
    ///
    /// The node itself acts as the synthetic root and is not encoded. To
    /// encrypt the result, call [`Container::crypt_in_place`] (or
    /// [`Container::crypt_in_place_random`]) before storing it.
    pub fn to_container(&self) -> Container {
        RecordWriter::new(self).into_container()
    }

    // --- Adding children ---

    /// Append a child node and return a mutable reference to it, so that
    /// grandchildren can be chained: `record.add_text("created").add_integer(now)`.
    pub fn add(&mut self, bytes: impl Into<Vec<u8>>, hash: Option<Hash>) -> &mut Record {
        self.children.push(Record::with_hash(bytes, hash));
        self.children.last_mut().expect("just pushed")
    }

    pub fn add_bytes(&mut self, bytes: impl Into<Vec<u8>>) -> &mut Record {
        self.add(bytes, None)
    }

    pub fn add_text(&mut self, text: &str) -> &mut Record {
        self.add(text.as_bytes().to_vec(), None)
    }

    pub fn add_integer(&mut self, value: i64) -> &mut Record {
        self.add(encoding::encode_integer(value), None)
    }

    pub fn add_unsigned(&mut self, value: u64) -> &mut Record {
        self.add(encoding::encode_unsigned(value), None)
    }

    pub fn add_boolean(&mut self, value: bool) -> &mut Record {
        self.add(encoding::encode_boolean(value), None)
    }

    pub fn add_hash(&mut self, hash: Hash) -> &mut Record {
        self.add(Vec::new(), Some(hash))
    }

    pub fn add_hash_and_key(&mut self, hash_and_key: HashAndKey) -> &mut Record {
        self.add(hash_and_key.key.to_vec(), Some(hash_and_key.hash))
    }

    /// Append an existing record as a child.
    pub fn add_record(&mut self, record: Record) -> &mut Record {
        self.children.push(record);
        self.children.last_mut().expect("just pushed")
    }

    pub fn add_children(&mut self, records: impl IntoIterator<Item = Record>) {
        self.children.extend(records);
    }

    // --- Querying ---

    pub fn contains(&self, bytes: &[u8]) -> bool {
        self.children.iter().any(|child| child.bytes == bytes)
    }

    pub fn contains_text(&self, text: &str) -> bool {
        self.contains(text.as_bytes())
    }

    /// The first child with the given payload, if any.
    pub fn find_child(&self, bytes: &[u8]) -> Option<&Record> {
        self.children.iter().find(|child| child.bytes == bytes)
    }

    /// The first child with the given payload, or the empty record.
    pub fn child(&self, bytes: &[u8]) -> &Record {
        self.find_child(bytes).unwrap_or(&EMPTY)
    }

    pub fn child_text(&self, text: &str) -> &Record {
        self.child(text.as_bytes())
    }

    /// The child at the given index, or the empty record.
    pub fn child_at(&self, index: usize) -> &Record {
        self.children.get(index).unwrap_or(&EMPTY)
    }

    /// The value slot: the first child, or the empty record.
    pub fn first_child(&self) -> &Record {
        self.children.first().unwrap_or(&EMPTY)
    }

    // --- Interpreting this node's payload ---

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn as_boolean(&self) -> bool {
        encoding::decode_boolean(&self.bytes)
    }

    pub fn as_integer(&self) -> i64 {
        encoding::decode_integer(&self.bytes)
    }

    pub fn as_unsigned(&self) -> u64 {
        encoding::decode_unsigned(&self.bytes)
    }

    /// Interpret this node as an encrypted-object reference: a 32-byte key
    /// in the payload plus a hash.
    pub fn as_hash_and_key(&self) -> Option<HashAndKey> {
        let hash = self.hash?;
        let key: [u8; 32] = self.bytes.as_slice().try_into().ok()?;
        Some(HashAndKey::new(hash, key))
    }

    // --- Interpreting the value slot (first child) ---

    pub fn bytes_value(&self) -> &[u8] {
        &self.first_child().bytes
    }

    pub fn hash_value(&self) -> Option<Hash> {
        self.first_child().hash
    }

    pub fn text_value(&self) -> String {
        self.first_child().as_text()
    }

    pub fn boolean_value(&self) -> bool {
        self.first_child().as_boolean()
    }

    pub fn integer_value(&self) -> i64 {
        self.first_child().as_integer()
    }

    pub fn unsigned_value(&self) -> u64 {
        self.first_child().as_unsigned()
    }

    pub fn hash_and_key_value(&self) -> Option<HashAndKey> {
        self.first_child().as_hash_and_key()
    }

    // --- Dependent hashes ---

    /// All distinct hashes referenced anywhere in this tree, including this
    /// node's own hash.
    pub fn dependent_hashes(&self) -> HashSet<Hash> {
        let mut hashes = HashSet::new();
        self.collect_hashes(&mut hashes);
        hashes
    }

    fn collect_hashes(&self, hashes: &mut HashSet<Hash>) {
        if let Some(hash) = self.hash {
            hashes.insert(hash);
        }
        for child in &self.children {
            child.collect_hashes(hashes);
        }
    }

    // --- Size ---

    /// Number of nodes in this tree, including this node.
    pub fn count_entries(&self) -> usize {
        1 + self.children.iter().map(Record::count_entries).sum::<usize>()
    }

    /// Exact serialized size of [`Record::to_container`]'s output, in bytes.
    pub fn calculate_size(&self) -> usize {
        let mut hashes = HashSet::new();
        let mut size = 4;
        for child in &self.children {
            size += child.size_contribution(&mut hashes);
        }
        size + hashes.len() * 32
    }

    fn size_contribution(&self, hashes: &mut HashSet<Hash>) -> usize {
        let len = self.bytes.len();
        let mut size = if len < 30 {
            1
        } else if len < 286 {
            2
        } else {
            9
        };
        size += len;
        if let Some(hash) = self.hash {
            hashes.insert(hash);
            size += 4;
        }
        for child in &self.children {
            size += child.size_contribution(hashes);
        }
        size
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_node(record: &Record, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
            let text = match std::str::from_utf8(&record.bytes) {
                Ok(text) if !text.contains('\u{0}') => text.to_owned(),
                _ => format!("0x{}", hex_prefix(&record.bytes)),
            };
            write!(f, "{:indent$}{text}", "", indent = indent)?;
            if let Some(hash) = record.hash {
                write!(f, " # {}", hash.short_hex())?;
            }
            writeln!(f)?;
            for child in &record.children {
                write_node(child, f, indent + 2)?;
            }
            Ok(())
        }

        fn hex_prefix(bytes: &[u8]) -> String {
            let shown: String = bytes.iter().take(32).map(|b| format!("{b:02x}")).collect();
            if bytes.len() > 32 {
                format!("{shown}...")
            } else {
                shown
            }
        }

        writeln!(f, "Record")?;
        for child in &self.children {
            write_node(child, f, 2)?;
        }
        Ok(())
    }
}
