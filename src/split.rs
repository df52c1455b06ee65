//! Bipartitions ("splits") of unrooted trees.
//!
//! # Overview
//! Every inner edge of an unrooted binary tree divides the tips into two
//! groups. A [`SplitSet`] captures all of them, together with the length of
//! the edge inducing each one, so two trees can be compared without touching
//! their topology again.
//!
//! # Tip ids, not labels
//! Splits are indexed by tip id (the tip's CLV index), so two trees can only
//! be compared once their ids agree label by label. [`consistency_check`]
//! verifies that and [`consistency_set`] rewrites the second tree to match
//! the first.
//!
//! # Canonical form
//! {A,B}|{C,D} and {C,D}|{A,B} are the same split. The stored side is always
//! the one that does NOT contain tip 0:
//! ```text
//! tips A=0, B=1, C=2, D=3
//! {A,B} = 0b0011 → tip 0 set → stored as {C,D} = 0b1100
//! {C,D} = 0b1100 → kept
//! ```

use std::collections::{HashMap, HashSet};

use crate::bitset::Bitset;
use crate::error::{Error, Result};
use crate::utree::{NodeId, TraversalOrder, UTree};

/// All non-trivial splits of one tree, canonicalised.
#[derive(Debug, Clone)]
pub struct SplitSet {
    pub splits: HashSet<Bitset>,
    pub lengths: HashMap<Bitset, f64>,
    pub n_tips: usize,
    pub words: usize,
}

impl SplitSet {
    /// Extracts the `n_tips - 3` splits of `tree`.
    ///
    /// # Errors
    /// [`Error::InvalidTree`] if the tree does not have exactly `n_tips`
    /// reachable tips with distinct ids in `0..n_tips`, or is not binary.
    pub fn from_utree<D>(tree: &UTree<D>, n_tips: usize) -> Result<Self> {
        if n_tips < 3 {
            return Err(Error::InvalidTreeSize(format!(
                "a tree needs at least 3 tips, got {n_tips}"
            )));
        }
        if tree.tip_count() != n_tips {
            return Err(Error::InvalidTree(format!(
                "expected {n_tips} tips, tree has {}",
                tree.tip_count()
            )));
        }
        let start = tree
            .tips()
            .next()
            .ok_or_else(|| Error::InvalidTree("tree has no tips".into()))?;

        let words = Bitset::words_for(n_tips);
        let mut seen = Bitset::zeros(words);
        // bitset of tips below each record, filled bottom-up
        let mut below: HashMap<NodeId, Bitset> = HashMap::with_capacity(tree.record_count());
        let mut splits = HashSet::with_capacity(n_tips - 3);
        let mut lengths = HashMap::with_capacity(n_tips - 3);

        for id in tree.traverse(start, TraversalOrder::Postorder) {
            let bits = match tree.children(id) {
                None => {
                    let tip = tree.clv_index(id).unwrap_or(usize::MAX);
                    if tip >= n_tips || seen.contains(tip) {
                        return Err(Error::InvalidTree(format!(
                            "tip {id} has id {tip}, expected a unique id below {n_tips}"
                        )));
                    }
                    seen.set(tip);
                    let mut bits = Bitset::zeros(words);
                    bits.set(tip);
                    bits
                }
                Some((left, right)) => {
                    let mut bits = below.remove(&left).unwrap_or_else(|| Bitset::zeros(words));
                    if let Some(other) = below.remove(&right) {
                        bits.or_assign(&other);
                    }
                    bits
                }
            };

            let count = bits.count_ones();
            if count > 1 && count < n_tips - 1 {
                let mut canonical = bits.clone();
                if canonical.contains(0) {
                    canonical.complement(n_tips);
                }
                lengths.insert(canonical.clone(), tree.length(id).unwrap_or_default());
                splits.insert(canonical);
            }
            below.insert(id, bits);
        }

        if seen.count_ones() != n_tips || splits.len() != n_tips - 3 {
            return Err(Error::InvalidTree(format!(
                "found {} tips and {} splits in a tree of {n_tips} tips",
                seen.count_ones(),
                splits.len()
            )));
        }

        Ok(SplitSet {
            splits,
            lengths,
            n_tips,
            words,
        })
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Splits in ascending bit order.
    pub fn sorted(&self) -> Vec<Bitset> {
        let mut out: Vec<Bitset> = self.splits.iter().cloned().collect();
        out.sort_unstable();
        out
    }
}

/// The `n_tips - 3` canonical splits of `tree`, sorted.
pub fn split_create<D>(tree: &UTree<D>, n_tips: usize) -> Result<Vec<Bitset>> {
    Ok(SplitSet::from_utree(tree, n_tips)?.sorted())
}

/// Number of splits present in exactly one of `s1` and `s2`.
///
/// Splits compare by exact bit equality; order and repeats are irrelevant.
pub fn split_rf_distance(s1: &[Bitset], s2: &[Bitset], n_tips: usize) -> Result<usize> {
    let max = n_tips.saturating_sub(3);
    if s1.len() > max || s2.len() > max {
        return Err(Error::InvalidTreeSize(format!(
            "{} and {} splits given for {n_tips} tips",
            s1.len(),
            s2.len()
        )));
    }
    let left: HashSet<&Bitset> = s1.iter().collect();
    let right: HashSet<&Bitset> = s2.iter().collect();
    Ok(left.symmetric_difference(&right).count())
}

/// Robinson-Foulds distance of two trees over the same tip ids.
///
/// # Errors
/// [`Error::InvalidTree`] if the trees disagree on tip ids; call
/// [`consistency_set`] first for independently built trees.
pub fn rf_distance<D>(t1: &UTree<D>, t2: &UTree<D>, n_tips: usize) -> Result<usize> {
    if !consistency_check(t1, t2)? {
        return Err(Error::InvalidTree(
            "tip ids differ between the two trees".into(),
        ));
    }
    let s1 = split_create(t1, n_tips)?;
    let s2 = split_create(t2, n_tips)?;
    split_rf_distance(&s1, &s2, n_tips)
}

fn tip_ids<D>(tree: &UTree<D>) -> Result<HashMap<&str, usize>> {
    let mut ids = HashMap::with_capacity(tree.tip_count());
    for tip in tree.tips() {
        let label = tree
            .label(tip)
            .ok_or_else(|| Error::InvalidTree(format!("tip {tip} has no label")))?;
        let id = tree
            .clv_index(tip)
            .ok_or_else(|| Error::InvalidTree(format!("unknown tip record {tip}")))?;
        if ids.insert(label, id).is_some() {
            return Err(Error::InvalidTree(format!("duplicate tip label {label}")));
        }
    }
    Ok(ids)
}

fn same_labels(a: &HashMap<&str, usize>, b: &HashMap<&str, usize>) -> Result<()> {
    if a.len() != b.len() || a.keys().any(|label| !b.contains_key(label)) {
        return Err(Error::InvalidTree("trees have different tip sets".into()));
    }
    Ok(())
}

/// Whether every tip label maps to the same id in both trees.
///
/// # Errors
/// [`Error::InvalidTree`] if the tip sets differ or a tip has no label.
pub fn consistency_check<D1, D2>(t1: &UTree<D1>, t2: &UTree<D2>) -> Result<bool> {
    let first = tip_ids(t1)?;
    let second = tip_ids(t2)?;
    same_labels(&first, &second)?;
    Ok(first.iter().all(|(label, id)| second.get(label) == Some(id)))
}

/// Renumbers the tips of `t2` so each label gets its id from `t1`.
///
/// Tip edge pmatrix indices follow the tip ids.
pub fn consistency_set<D1, D2>(t1: &UTree<D1>, t2: &mut UTree<D2>) -> Result<()> {
    let first = tip_ids(t1)?;
    let updates: Vec<(NodeId, usize)> = {
        let second = tip_ids(t2)?;
        same_labels(&first, &second)?;
        t2.tips()
            .filter_map(|tip| Some((tip, *first.get(t2.label(tip)?)?)))
            .collect()
    };
    for (tip, id) in updates {
        t2.set_tip_index(tip, id);
    }
    tracing::trace!(tips = first.len(), "aligned tip ids");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utree::tests::{quartet, random_tree};
    use phylotree::tree::Tree as PhyloTree;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn utree(newick: &str) -> UTree {
        UTree::from_phylotree(&PhyloTree::from_newick(newick).unwrap()).unwrap()
    }

    fn bits(raw: &[usize]) -> Bitset {
        let mut bs = Bitset::zeros(1);
        raw.iter().for_each(|&i| bs.set(i));
        bs
    }

    #[test]
    fn quartet_has_one_split() {
        let tree = quartet();
        let set = SplitSet::from_utree(&tree, 4).unwrap();
        // {A,B} is stored as {C,D}
        assert_eq!(set.sorted(), vec![bits(&[2, 3])]);
        assert_eq!(set.lengths[&bits(&[2, 3])], 0.5);
    }

    /// Five tips, two inner edges.
    ///
    /// ```text
    ///   A           D
    ///    \         /
    ///     x - y - z
    ///    /    |    \
    ///   B     C     E
    /// ```
    #[test]
    fn five_tips_splits() {
        let tree = utree("((A:1,B:1):1,C:1,(D:1,E:1):2);");
        let mut ids = HashMap::new();
        for tip in tree.tips() {
            ids.insert(tree.label(tip).unwrap().to_string(), tree.clv_index(tip).unwrap());
        }
        let mut de = Bitset::zeros(1);
        de.set(ids["D"]);
        de.set(ids["E"]);
        if de.contains(0) {
            de.complement(5);
        }
        let set = SplitSet::from_utree(&tree, 5).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.lengths[&de], 2.0);
    }

    #[test]
    fn rejects_wrong_tip_count_and_ids() {
        let tree = quartet();
        assert!(matches!(split_create(&tree, 5), Err(Error::InvalidTree(_))));
        assert!(matches!(split_create(&tree, 2), Err(Error::InvalidTreeSize(_))));

        let mut broken = quartet();
        broken.set_tip_index(NodeId(3), 7);
        assert!(matches!(split_create(&broken, 4), Err(Error::InvalidTree(_))));
        let mut duplicated = quartet();
        duplicated.set_tip_index(NodeId(3), 1);
        assert!(matches!(split_create(&duplicated, 4), Err(Error::InvalidTree(_))));
    }

    #[test]
    fn rf_on_quartets() {
        let ab_cd = utree("((A,B),(C,D));");
        let mut ac_bd = utree("((A,C),(B,D));");
        consistency_set(&ab_cd, &mut ac_bd).unwrap();
        assert_eq!(rf_distance(&ab_cd, &ab_cd, 4).unwrap(), 0);
        assert_eq!(rf_distance(&ab_cd, &ac_bd, 4).unwrap(), 2);
        assert_eq!(rf_distance(&ac_bd, &ab_cd, 4).unwrap(), 2);
    }

    #[test]
    fn rf_needs_consistent_ids() {
        let t1 = utree("((A,B),(C,D));");
        let mut t2 = utree("((D,C),(B,A));");
        assert!(!consistency_check(&t1, &t2).unwrap());
        let err = rf_distance(&t1, &t2, 4).unwrap_err();
        assert!(err.is_fatal());

        consistency_set(&t1, &mut t2).unwrap();
        assert!(consistency_check(&t1, &t2).unwrap());
        assert_eq!(rf_distance(&t1, &t2, 4).unwrap(), 0);
        // tip edges follow their tip
        for tip in t2.tips() {
            assert_eq!(t2.pmatrix_index(tip), t2.clv_index(tip));
        }
    }

    #[test]
    fn consistency_rejects_different_tip_sets() {
        let t1 = utree("((A,B),(C,D));");
        let mut t2 = utree("((A,B),(C,E));");
        assert!(matches!(consistency_check(&t1, &t2), Err(Error::InvalidTree(_))));
        assert!(matches!(consistency_set(&t1, &mut t2), Err(Error::InvalidTree(_))));
        let t3 = utree("((A,B),(C,(D,E)));");
        assert!(matches!(consistency_check(&t1, &t3), Err(Error::InvalidTree(_))));
    }

    #[test]
    fn split_rf_checks_sizes() {
        let s = vec![bits(&[1, 2]), bits(&[1, 3])];
        assert!(matches!(split_rf_distance(&s, &s, 4), Err(Error::InvalidTreeSize(_))));
        assert_eq!(split_rf_distance(&s, &s, 5).unwrap(), 0);
        assert_eq!(split_rf_distance(&s[..1], &s[1..], 5).unwrap(), 2);
    }

    #[test]
    fn split_rf_ignores_repeats() {
        let s = bits(&[1, 2]);
        let t = bits(&[1, 3]);
        assert_eq!(split_rf_distance(&[s.clone()], &[s.clone(), s.clone()], 5).unwrap(), 0);
        assert_eq!(split_rf_distance(&[t.clone(), t], &[s.clone(), s], 5).unwrap(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn rf_laws(n in 4usize..40, s1 in any::<u64>(), s2 in any::<u64>()) {
            let t1 = random_tree(n, s1);
            let mut t2 = random_tree(n, s2);
            consistency_set(&t1, &mut t2).unwrap();

            let a = split_create(&t1, n).unwrap();
            let b = split_create(&t2, n).unwrap();
            prop_assert_eq!(a.len(), n - 3);
            prop_assert_eq!(split_rf_distance(&a, &a, n).unwrap(), 0);

            let rf = split_rf_distance(&a, &b, n).unwrap();
            prop_assert_eq!(rf, split_rf_distance(&b, &a, n).unwrap());
            prop_assert_eq!(rf % 2, 0);
            prop_assert!(rf <= 2 * (n - 3));
        }
    }
}
