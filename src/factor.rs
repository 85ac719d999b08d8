use std::sync::Arc;

use hashbrown::HashMap;

use crate::math;
use crate::LabelId;

/// A multiset of label ids, the key of a factor feature.
///
/// Two factors with equal multisets are the same feature regardless of the
/// order labels were inserted in.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Factor(Vec<LabelId>);

impl Factor {
    /// Creates an empty multiset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a label, keeping the backing vector sorted.
    pub fn insert(&mut self, label: LabelId) {
        let pos = self.0.partition_point(|&l| l <= label);
        self.0.insert(pos, label);
    }

    /// Returns the number of labels, counting multiplicity.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the multiset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the multiplicity of a label.
    #[must_use]
    pub fn count(&self, label: LabelId) -> usize {
        self.0.partition_point(|&l| l <= label) - self.0.partition_point(|&l| l < label)
    }

    /// Iterates the labels in ascending order, with multiplicity.
    pub fn iter(&self) -> impl Iterator<Item = LabelId> + '_ {
        self.0.iter().copied()
    }

    /// Returns whether every label of `other` occurs here with at least the
    /// same multiplicity.
    #[must_use]
    pub fn contains_all(&self, other: &Self) -> bool {
        other.0.iter().all(|&l| self.count(l) >= other.count(l))
    }

    /// Returns the labels remaining after removing one occurrence per label
    /// of `other`. The caller must ensure `self.contains_all(other)`.
    #[must_use]
    pub fn minus(&self, other: &Self) -> Vec<LabelId> {
        let mut rest = vec![];
        let mut o = other.0.iter().peekable();
        for &l in &self.0 {
            if o.peek() == Some(&&l) {
                o.next();
            } else {
                rest.push(l);
            }
        }
        rest
    }

    /// Returns the order-independent hash of the multiset.
    #[must_use]
    pub fn feature_hash(&self) -> u64 {
        math::factor_hash(self.iter())
    }
}

impl FromIterator<LabelId> for Factor {
    fn from_iter<I: IntoIterator<Item = LabelId>>(iter: I) -> Self {
        let mut labels: Vec<LabelId> = iter.into_iter().collect();
        labels.sort_unstable();
        Self(labels)
    }
}

/// One level of the factor candidate index.
///
/// A level holds its factors sorted by weight, descending. Once a level
/// exceeds the branch threshold, inserted factors also descend into child
/// levels keyed by one of their labels, up to the maximum depth; a factor
/// with multiplicity m for a label descends under that label through at most
/// m sibling edges, tracked by the per-level visited bag.
#[derive(Default)]
pub(crate) struct FactorLevel {
    entries: Vec<Arc<(f64, Factor)>>,
    next: HashMap<LabelId, FactorLevel>,
}

impl FactorLevel {
    pub(crate) fn insert(
        &mut self,
        entry: &Arc<(f64, Factor)>,
        depth: usize,
        max_depth: usize,
        current_label: Option<LabelId>,
        mut visited: Factor,
        branch_threshold: usize,
    ) {
        self.entries.push(entry.clone());

        if let Some(label) = current_label {
            visited.insert(label);
        }
        let factor = &entry.1;
        if depth < max_depth
            && visited.len() < factor.len()
            && self.entries.len() > branch_threshold
        {
            let mut branched = Factor::new();
            for label in factor.iter() {
                if visited.count(label) + branched.count(label) < factor.count(label) {
                    branched.insert(label);
                    self.next.entry(label).or_default().insert(
                        entry,
                        depth + 1,
                        max_depth,
                        Some(label),
                        visited.clone(),
                        branch_threshold,
                    );
                }
            }
        }
    }

    /// Walks down one child edge per given label while such an edge exists,
    /// then copies out the first `beam` factors of the deepest level reached.
    pub(crate) fn get_factors(&self, giv_labels: &[LabelId], out: &mut Vec<Factor>, beam: usize) {
        if let Some((&first, rest)) = giv_labels.split_first() {
            if let Some(child) = self.next.get(&first) {
                child.get_factors(rest, out, beam);
                return;
            }
        }
        for entry in self.entries.iter().take(beam) {
            out.push(entry.1.clone());
        }
    }

    pub(crate) fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then_with(|| b.1.cmp(&a.1)));
        for child in self.next.values_mut() {
            child.sort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factor(labels: &[LabelId]) -> Factor {
        labels.iter().copied().collect()
    }

    #[test]
    fn test_multiset_counts() {
        let f = factor(&[7, 3, 7, 1]);
        assert_eq!(f.len(), 4);
        assert_eq!(f.count(7), 2);
        assert_eq!(f.count(3), 1);
        assert_eq!(f.count(9), 0);
        assert_eq!(f.iter().collect::<Vec<_>>(), vec![1, 3, 7, 7]);
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let mut a = Factor::new();
        a.insert(5);
        a.insert(2);
        a.insert(5);
        let b = factor(&[5, 5, 2]);
        assert_eq!(a, b);
        assert_eq!(a.feature_hash(), b.feature_hash());
    }

    #[test]
    fn test_contains_all_respects_multiplicity() {
        let f = factor(&[1, 2, 2, 3]);
        assert!(f.contains_all(&factor(&[2, 3])));
        assert!(f.contains_all(&factor(&[2, 2])));
        assert!(!f.contains_all(&factor(&[2, 2, 2])));
        assert!(!f.contains_all(&factor(&[4])));
        assert!(f.contains_all(&Factor::new()));
    }

    #[test]
    fn test_minus_removes_one_occurrence_per_label() {
        let f = factor(&[1, 2, 2, 3]);
        assert_eq!(f.minus(&factor(&[2, 3])), vec![1, 2]);
        assert_eq!(f.minus(&Factor::new()), vec![1, 2, 2, 3]);
        assert_eq!(f.minus(&factor(&[1, 2, 2, 3])), Vec::<LabelId>::new());
    }

    #[test]
    fn test_level_returns_factors_without_branching() {
        let mut level = FactorLevel::default();
        for i in 0..4 {
            let entry = Arc::new((f64::from(i), factor(&[i, i + 1])));
            level.insert(&entry, 0, 2, None, Factor::new(), 16);
        }
        level.sort();
        let mut out = vec![];
        // Fewer entries than the branch threshold: no children, and the
        // walk falls back to the root list even with given labels.
        level.get_factors(&[2], &mut out, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], factor(&[3, 4]));
        assert_eq!(out[1], factor(&[2, 3]));
    }

    #[test]
    fn test_level_branches_past_threshold() {
        let mut level = FactorLevel::default();
        // With a threshold of 1 every factor past the first creates child
        // edges for each of its labels.
        for i in 0..6 {
            let entry = Arc::new((f64::from(i), factor(&[100, i])));
            level.insert(&entry, 0, 2, None, Factor::new(), 1);
        }
        level.sort();
        let mut out = vec![];
        level.get_factors(&[3], &mut out, 10);
        // The child under label 3 holds only factors containing 3.
        assert!(!out.is_empty());
        assert!(out.iter().all(|f| f.count(3) > 0));

        // An unknown given label falls back to the full root list.
        out.clear();
        level.get_factors(&[999], &mut out, 10);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], factor(&[5, 100]));
    }

    #[test]
    fn test_level_beam_truncates() {
        let mut level = FactorLevel::default();
        for i in 0..40 {
            let entry = Arc::new((f64::from(i), factor(&[i, i])));
            level.insert(&entry, 0, 2, None, Factor::new(), 16);
        }
        level.sort();
        let mut out = vec![];
        level.get_factors(&[], &mut out, 5);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], factor(&[39, 39]));
    }

    #[test]
    fn test_duplicate_labels_branch_once_per_occurrence() {
        let mut level = FactorLevel::default();
        let entry = Arc::new((1.0, factor(&[4, 4, 9])));
        let filler: Vec<_> = (0..3)
            .map(|i| Arc::new((0.5, factor(&[i, i + 1, i + 2]))))
            .collect();
        for e in &filler {
            level.insert(e, 0, 2, None, Factor::new(), 1);
        }
        level.insert(&entry, 0, 2, None, Factor::new(), 1);
        // The factor {4, 4, 9} owns a child edge for 4 and one for 9 at the
        // first level; the edge under 4 leads to a level that branches on the
        // second 4.
        let under_4 = level.next.get(&4).unwrap();
        assert!(under_4.entries.iter().any(|e| e.1 == factor(&[4, 4, 9])));
        // The second occurrence of 4 descends through the same edge, so the
        // child level branches on the remaining 4 and on 9.
        assert!(under_4.next.contains_key(&4));
        assert!(under_4.next.contains_key(&9));
    }
}
