//! Set difference between two key collections.

use std::collections::HashSet;
use std::hash::Hash;

/// Keys that appeared and disappeared between an old and a new listing.
///
/// Duplicates in either input collapse under set semantics.
///
/// ```
/// use core_sync::PathDiff;
///
/// let diff = PathDiff::compute(["a.mkv", "b.mkv"], ["b.mkv", "c.mkv", "c.mkv"]);
/// assert!(diff.added.contains("c.mkv"));
/// assert!(diff.removed.contains("a.mkv"));
/// assert_eq!(diff.added.len() + diff.removed.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathDiff<K: Eq + Hash> {
    /// `new − old`
    pub added: HashSet<K>,
    /// `old − new`
    pub removed: HashSet<K>,
}

impl<K: Eq + Hash + Clone> PathDiff<K> {
    pub fn compute<O, N>(old: O, new: N) -> Self
    where
        O: IntoIterator<Item = K>,
        N: IntoIterator<Item = K>,
    {
        let old: HashSet<K> = old.into_iter().collect();
        let new: HashSet<K> = new.into_iter().collect();
        Self {
            added: new.difference(&old).cloned().collect(),
            removed: old.difference(&new).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    #[test]
    fn test_two_new_files() {
        let diff = PathDiff::compute(Vec::<&str>::new(), vec!["x.mkv", "y.mkv"]);
        assert_eq!(diff.added, HashSet::from(["x.mkv", "y.mkv"]));
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_unchanged_listing_is_empty() {
        let diff = PathDiff::compute(vec!["a", "b"], vec!["b", "a"]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_duplicates_collapse() {
        let diff = PathDiff::compute(vec!["a", "a", "b"], vec!["b", "b", "c", "c"]);
        assert_eq!(diff.added, HashSet::from(["c"]));
        assert_eq!(diff.removed, HashSet::from(["a"]));
    }

    proptest! {
        #[test]
        fn prop_diff_laws(old in vec(0u8..32, 0..40), new in vec(0u8..32, 0..40)) {
            let diff = PathDiff::compute(old.clone(), new.clone());
            let old: HashSet<u8> = old.into_iter().collect();
            let new: HashSet<u8> = new.into_iter().collect();

            let lhs: HashSet<u8> = old.union(&diff.added).copied().collect();
            let rhs: HashSet<u8> = new.union(&diff.removed).copied().collect();
            prop_assert_eq!(lhs, rhs);
            prop_assert!(diff.added.is_disjoint(&diff.removed));

            let expected_added: HashSet<u8> = new.difference(&old).copied().collect();
            let expected_removed: HashSet<u8> = old.difference(&new).copied().collect();
            prop_assert_eq!(diff.added, expected_added);
            prop_assert_eq!(diff.removed, expected_removed);
        }
    }
}
