use crate::selector::Selector;
use crate::tree::DataTree;

/// A per-level constraint of a [`SelectorRange`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Constraint {
    /// Matches any label at this level.
    Any,
    /// Matches exactly one label at this level.
    Label(Vec<u8>),
}

impl Constraint {
    fn matches(&self, label: &[u8]) -> bool {
        match self {
            Constraint::Any => true,
            Constraint::Label(expected) => expected == label,
        }
    }
}

/// A declarative path pattern rooted at a fixed selector.
///
/// A range describes a set of selectors by one constraint per level below
/// its base, e.g. `/messages/*/data`:
///
/// ```
/// # use canopy_tree::DataTree;
/// let tree = DataTree::new();
/// let range = tree.root().child(b"messages".to_vec()).any().label(b"data".to_vec());
/// assert_eq!(range.depth(), 3);
/// ```
///
/// A range matches only selectors at exactly its depth: `/messages/*`
/// and `/messages/*/*` are different, non-overlapping ranges. Enumeration
/// ([`SelectorRange::list`]) walks only the live item subtree — never the
/// universe of possible paths — in depth-first order of existing children.
#[derive(Clone, Debug)]
pub struct SelectorRange {
    base: Selector,
    constraints: Vec<Constraint>,
}

impl SelectorRange {
    /// A range with no constraints yet, rooted at `base`. Extend it with
    /// [`any`](SelectorRange::any), [`label`](SelectorRange::label) or
    /// [`some`](SelectorRange::some).
    pub fn new(base: Selector) -> Self {
        Self {
            base,
            constraints: Vec::new(),
        }
    }

    /// Append an any-label level.
    pub fn any(mut self) -> Self {
        self.constraints.push(Constraint::Any);
        self
    }

    /// Append an exact-label level.
    pub fn label(mut self, label: impl Into<Vec<u8>>) -> Self {
        self.constraints.push(Constraint::Label(label.into()));
        self
    }

    pub fn label_text(self, label: &str) -> Self {
        self.label(label.as_bytes().to_vec())
    }

    /// Append an arbitrary constraint level.
    pub fn some(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// The selector the range is rooted at.
    pub fn base(&self) -> &Selector {
        &self.base
    }

    /// The depth of every selector in this range.
    pub fn depth(&self) -> u32 {
        self.base.depth() + self.constraints.len() as u32
    }

    /// Whether the selector is within this range, i.e. sits at the range's
    /// depth, satisfies every level constraint, and descends from the base.
    pub fn contains(&self, selector: &Selector) -> bool {
        if selector.depth() != self.depth() {
            return false;
        }
        let mut current = selector.clone();
        for constraint in self.constraints.iter().rev() {
            if !constraint.matches(current.label()) {
                return false;
            }
            let Some(parent) = current.parent() else {
                return false;
            };
            current = parent;
        }
        current == self.base
    }

    /// The ancestor of `selector` lying within this range, if any.
    pub fn ancestor_of(&self, selector: &Selector) -> Option<Selector> {
        let mut current = selector.clone();
        while current.depth() > self.depth() {
            current = current.parent()?;
        }
        self.contains(&current).then_some(current)
    }

    /// The selectors bound at each constrained level if `selector` is in
    /// the range, base-most first.
    pub fn captures(&self, selector: &Selector) -> Option<Vec<Selector>> {
        if !self.contains(selector) {
            return None;
        }
        let mut captures = Vec::with_capacity(self.constraints.len());
        let mut current = selector.clone();
        for _ in 0..self.constraints.len() {
            captures.push(current.clone());
            current = current.parent()?;
        }
        captures.reverse();
        Some(captures)
    }

    /// All currently materialized selectors matching this range, by walking
    /// the live item subtree. Exact-label levels use a direct lookup;
    /// any-label levels iterate the existing children. The order is the
    /// depth-first order of existing children, not globally sorted.
    pub fn list(&self, tree: &DataTree) -> Vec<Selector> {
        let mut result = Vec::new();
        if tree.contains_item(&self.base) {
            self.traverse(tree, &self.base, 0, &mut result);
        }
        result
    }

    fn traverse(&self, tree: &DataTree, selector: &Selector, level: usize, result: &mut Vec<Selector>) {
        let Some(constraint) = self.constraints.get(level) else {
            result.push(selector.clone());
            return;
        };
        match constraint {
            Constraint::Label(label) => {
                let child = selector.child(label.clone());
                if tree.contains_item(&child) {
                    self.traverse(tree, &child, level + 1, result);
                }
            }
            Constraint::Any => {
                for child in tree.item_children(selector).to_vec() {
                    self.traverse(tree, &child, level + 1, result);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_record::Record;

    fn text_record(text: &str) -> Record {
        let mut record = Record::new();
        record.add_text(text);
        record
    }

    fn message_tree() -> DataTree {
        let mut tree = DataTree::new();
        let messages = tree.root().child_text("messages");
        for id in ["m1", "m2"] {
            tree.set(&messages.child_text(id).child_text("data"), text_record(id));
        }
        tree.set(&messages.child_text("m3").child_text("meta"), text_record("no data"));
        let other = tree.root().child_text("other");
        tree.set(&other, text_record("other"));
        tree
    }

    #[test]
    fn contains_matches_exact_depth_and_labels() {
        let root = Selector::root();
        let range = root.child_text("messages").any().label_text("data");

        let inside = root.child_text("messages").child_text("m1").child_text("data");
        assert!(range.contains(&inside));

        // Wrong leaf label.
        assert!(!range.contains(&root.child_text("messages").child_text("m1").child_text("meta")));
        // Too shallow, too deep.
        assert!(!range.contains(&root.child_text("messages").child_text("m1")));
        assert!(!range.contains(&inside.child_text("extended")));
        // Wrong base.
        assert!(!range.contains(&root.child_text("elsewhere").child_text("m1").child_text("data")));
    }

    #[test]
    fn ancestor_of_climbs_to_the_range_depth() {
        let root = Selector::root();
        let range = root.child_text("messages").any();
        let message = root.child_text("messages").child_text("m1");
        let below = message.child_text("data").child_text("deep");

        assert_eq!(range.ancestor_of(&below), Some(message.clone()));
        assert_eq!(range.ancestor_of(&message), Some(message));
        assert_eq!(range.ancestor_of(&root.child_text("other")), None);
        assert_eq!(range.ancestor_of(&root), None);
    }

    #[test]
    fn captures_bind_each_level() {
        let root = Selector::root();
        let range = root.child_text("messages").any().label_text("data");
        let message = root.child_text("messages").child_text("m1");
        let data = message.child_text("data");

        let captures = range.captures(&data).unwrap();
        assert_eq!(captures, vec![message, data.clone()]);
        assert!(range.captures(&root.child_text("other")).is_none());
    }

    #[test]
    fn list_walks_only_live_items() {
        let tree = message_tree();
        let range = tree.root().child_text("messages").any().label_text("data");

        let mut found = range.list(&tree);
        found.sort();
        let messages = tree.root().child_text("messages");
        assert_eq!(
            found,
            vec![
                messages.child_text("m1").child_text("data"),
                messages.child_text("m2").child_text("data"),
            ]
        );
    }

    #[test]
    fn list_with_missing_base_is_empty() {
        let tree = DataTree::new();
        let range = tree.root().child_text("nowhere").any();
        assert!(range.list(&tree).is_empty());
    }

    #[test]
    fn any_range_is_equivalent_to_children() {
        let tree = message_tree();
        let messages = tree.root().child_text("messages");
        let mut listed = messages.any().list(&tree);
        let mut children = tree.children(&messages);
        listed.sort();
        children.sort();
        assert_eq!(listed, children);
    }
}
