use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use std::sync::Arc;

use crate::range::{Constraint, SelectorRange};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn chain_hash(parent: u64, label: &[u8]) -> u64 {
    let mut hash = parent ^ FNV_OFFSET;
    for &byte in label {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

struct Inner {
    parent: Option<Selector>,
    label: Vec<u8>,
    depth: u32,
    hash: u64,
}

/// An immutable path addressing one node in a [`DataTree`].
///
/// A selector is a sequence of opaque byte-string labels from the tree
/// root. Selectors are cheap to clone (the parent chain is shared) and
/// precompute their depth and a structural hash, so map lookups and
/// equality checks are O(1) in the common case.
///
/// Two selectors are equal iff their label sequences are identical. The
/// ordering sorts a node before its descendants and is used only for
/// deterministic enumeration, never on the wire.
///
/// [`DataTree`]: crate::DataTree
#[derive(Clone)]
pub struct Selector(Arc<Inner>);

impl Selector {
    /// The root selector: no parent, empty label.
    pub fn root() -> Self {
        Self(Arc::new(Inner {
            parent: None,
            label: Vec::new(),
            depth: 0,
            hash: 0,
        }))
    }

    /// The canonical child selector for this path plus one label.
    ///
    /// Repeated calls with equal labels return observationally equal
    /// selectors.
    pub fn child(&self, label: impl Into<Vec<u8>>) -> Self {
        let label = label.into();
        Self(Arc::new(Inner {
            hash: chain_hash(self.0.hash, &label),
            parent: Some(self.clone()),
            depth: self.0.depth + 1,
            label,
        }))
    }

    pub fn child_text(&self, label: &str) -> Self {
        self.child(label.as_bytes().to_vec())
    }

    pub fn parent(&self) -> Option<Selector> {
        self.0.parent.clone()
    }

    pub fn label(&self) -> &[u8] {
        &self.0.label
    }

    pub fn depth(&self) -> u32 {
        self.0.depth
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    /// Whether this selector is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Selector) -> bool {
        let mut current = other.parent();
        while let Some(selector) = current {
            if *self == selector {
                return true;
            }
            current = selector.parent();
        }
        false
    }

    /// The direct child of this selector lying on the path to `descendant`,
    /// if `descendant` is below this selector.
    pub fn child_holding(&self, descendant: &Selector) -> Option<Selector> {
        let mut selector = descendant.clone();
        while selector.depth() > self.depth() + 1 {
            selector = selector.parent()?;
        }
        if selector.depth() == self.depth() + 1 && selector.parent().as_ref() == Some(self) {
            Some(selector)
        } else {
            None
        }
    }

    /// A range matching any direct child of this selector.
    pub fn any(&self) -> SelectorRange {
        SelectorRange::new(self.clone()).any()
    }

    /// A range with one constraint below this selector.
    pub fn some(&self, constraint: Constraint) -> SelectorRange {
        SelectorRange::new(self.clone()).some(constraint)
    }

    /// The labels from the root to this selector.
    pub fn labels(&self) -> Vec<Vec<u8>> {
        let mut labels = Vec::with_capacity(self.0.depth as usize);
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            labels.push(current.label().to_vec());
            current = parent;
        }
        labels.reverse();
        labels
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if self.0.hash != other.0.hash || self.0.depth != other.0.depth {
            return false;
        }
        if self.0.label != other.0.label {
            return false;
        }
        match (&self.0.parent, &other.0.parent) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Selector {}

impl StdHash for Selector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl PartialOrd for Selector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Selector {
    /// Depth-first path order: a node sorts before its descendants, and
    /// siblings sort by label.
    fn cmp(&self, that: &Self) -> Ordering {
        match (&self.0.parent, &that.0.parent) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(self_parent), Some(that_parent)) => {
                if self.0.depth < that.0.depth {
                    return match self.cmp(that_parent) {
                        Ordering::Equal => Ordering::Less,
                        other => other,
                    };
                }
                if self.0.depth > that.0.depth {
                    return match self_parent.cmp(that) {
                        Ordering::Equal => Ordering::Greater,
                        other => other,
                    };
                }
                match self_parent.cmp(that_parent) {
                    Ordering::Equal => self.0.label.cmp(&that.0.label),
                    other => other,
                }
            }
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({self})")
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        for label in self.labels() {
            write!(f, "/{}", String::from_utf8_lossy(&label))?;
        }
        Ok(())
    }
}
