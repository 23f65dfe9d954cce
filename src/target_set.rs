//! A concurrent set of labels with `:all`/`...` expansion, used for
//! visibility lists and for the set of originally requested targets.

use parking_lot::RwLock;

use crate::label::BuildLabel;

/// Holds a flat list of labels (concrete or pseudo) and answers
/// membership queries through the inclusion relation, so a pseudo-label
/// entered once expands to however many concrete targets it covers.
#[derive(Default)]
pub struct TargetSet {
    labels: RwLock<Vec<BuildLabel>>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, label: BuildLabel) {
        let mut labels = self.labels.write();
        if !labels.contains(&label) {
            labels.push(label);
        }
    }

    /// True if any entry in the set includes `label` under the
    /// inclusion relation (a concrete entry includes only itself).
    pub fn contains(&self, label: &BuildLabel) -> bool {
        self.labels.read().iter().any(|entry| entry.includes(label))
    }

    pub fn len(&self) -> usize {
        self.labels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<BuildLabel> {
        self.labels.read().clone()
    }
}
