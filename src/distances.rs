//! Tree distance metrics over split sets.
//!
//! Three phylogenetic tree distances are implemented:
//!
//! 1. **Robinson-Foulds (RF)**: number of splits present in only one tree.
//!    Range: [0, 2n-6] where n is the number of tips.
//!
//! 2. **Weighted Robinson-Foulds**: like RF but considers branch lengths.
//!    For shared splits, adds |length_a - length_b|.
//!    For unique splits, adds the full branch length.
//!
//! 3. **Kuhner-Felsenstein (Branch Score)**: squared differences instead,
//!    sqrt(Σ(length_a - length_b)²)
//!
//! Trees are compared as unrooted trees; a bifurcating root is suppressed
//! when a [`PhyloTree`] is converted.

use phylotree::tree::Tree as PhyloTree;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::split::{SplitSet, consistency_set};
use crate::utree::UTree;

/// Converts `trees` to unrooted trees, aligns their tip ids on the first
/// one and extracts their splits.
///
/// # Errors
/// [`Error::InvalidTreeSize`] for an empty input, [`Error::InvalidTree`] if
/// the trees do not share one tip set.
pub fn split_sets<'a>(trees: impl IntoIterator<Item = &'a PhyloTree>) -> Result<Vec<SplitSet>> {
    let mut utrees = trees
        .into_iter()
        .map(UTree::<()>::from_phylotree)
        .collect::<Result<Vec<_>>>()?;
    let (first, rest) = utrees
        .split_first_mut()
        .ok_or_else(|| Error::InvalidTreeSize("no trees to compare".into()))?;
    for tree in rest {
        consistency_set(first, tree)?;
    }
    let n_tips = first.tip_count();
    utrees
        .iter()
        .map(|tree| SplitSet::from_utree(tree, n_tips))
        .collect()
}

fn pair(tree_a: &PhyloTree, tree_b: &PhyloTree) -> Result<(SplitSet, SplitSet)> {
    let mut sets = split_sets([tree_a, tree_b])?.into_iter();
    match (sets.next(), sets.next()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::InvalidTreeSize("expected two trees".into())),
    }
}

/// Compute Robinson-Foulds distance between two trees.
///
/// # Algorithm
/// RF = |A ∪ B| - |A ∩ B| = |A| + |B| - 2|A ∩ B|
///
/// # Example
/// ```text
/// Tree 1:  ((A,B),(C,D))     Split: {A,B}|{C,D}
/// Tree 2:  ((A,C),(B,D))     Split: {A,C}|{B,D}
///
/// RF = 1 + 1 - 2*0 = 2
/// ```
pub fn robinson_foulds(tree_a: &PhyloTree, tree_b: &PhyloTree) -> Result<usize> {
    let (a, b) = pair(tree_a, tree_b)?;
    Ok(rf_from_splits(&a, &b))
}

pub fn rf_from_splits(a: &SplitSet, b: &SplitSet) -> usize {
    let inter = a.splits.intersection(&b.splits).count();
    a.splits.len() + b.splits.len() - 2 * inter
}

pub fn weighted_robinson_foulds(tree_a: &PhyloTree, tree_b: &PhyloTree) -> Result<f64> {
    let (a, b) = pair(tree_a, tree_b)?;
    Ok(weighted_rf_from_splits(&a, &b))
}

pub fn weighted_rf_from_splits(a: &SplitSet, b: &SplitSet) -> f64 {
    let mut distance = 0.0;

    for split in &a.splits {
        let length_a = a.lengths.get(split).unwrap_or(&0.0);
        match b.lengths.get(split) {
            Some(length_b) => distance += (length_a - length_b).abs(),
            None => distance += length_a,
        }
    }

    // splits only in B
    for split in b.splits.difference(&a.splits) {
        distance += b.lengths.get(split).unwrap_or(&0.0);
    }

    distance
}

pub fn kuhner_felsenstein(tree_a: &PhyloTree, tree_b: &PhyloTree) -> Result<f64> {
    let (a, b) = pair(tree_a, tree_b)?;
    Ok(kf_from_splits(&a, &b))
}

pub fn kf_from_splits(a: &SplitSet, b: &SplitSet) -> f64 {
    let mut sum_squared = 0.0;

    for split in &a.splits {
        let length_a = a.lengths.get(split).unwrap_or(&0.0);
        let diff = length_a - b.lengths.get(split).unwrap_or(&0.0);
        sum_squared += diff * diff;
    }

    for split in b.splits.difference(&a.splits) {
        let length_b = b.lengths.get(split).unwrap_or(&0.0);
        sum_squared += length_b * length_b;
    }

    sum_squared.sqrt()
}

/// Applies `metric` to every unordered pair of `sets` in parallel.
///
/// Returns `(i, j, distance)` with `i < j`.
pub fn pairwise<T, F>(sets: &[SplitSet], metric: F) -> Vec<(usize, usize, T)>
where
    T: Send,
    F: Fn(&SplitSet, &SplitSet) -> T + Sync,
{
    let n = sets.len();
    (0..n)
        .into_par_iter()
        .flat_map_iter(|i| (i + 1..n).map(move |j| (i, j)))
        .map(|(i, j)| (i, j, metric(&sets[i], &sets[j])))
        .collect()
}

pub fn pairwise_rf(sets: &[SplitSet]) -> Vec<(usize, usize, usize)> {
    pairwise(sets, rf_from_splits)
}

pub fn pairwise_weighted_rf(sets: &[SplitSet]) -> Vec<(usize, usize, f64)> {
    pairwise(sets, weighted_rf_from_splits)
}

pub fn pairwise_kf(sets: &[SplitSet]) -> Vec<(usize, usize, f64)> {
    pairwise(sets, kf_from_splits)
}

/// Fills a symmetric `n x n` matrix from pairwise triples.
pub fn distance_matrix<T: Copy + Default>(n: usize, pairs: Vec<(usize, usize, T)>) -> Vec<Vec<T>> {
    let mut matrix = vec![vec![T::default(); n]; n];
    for (i, j, dist) in pairs {
        matrix[i][j] = dist;
        matrix[j][i] = dist;
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    // Example trees and distances from
    // https://evolution.genetics.washington.edu/phylip/doc/treedist.html
    const TREEDIST: [&str; 12] = [
        "(A:0.1,(B:0.1,(H:0.1,(D:0.1,(J:0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(D:0.1,((J:0.1,H:0.1):0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(D:0.1,(H:0.1,(J:0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,(G:0.1,((F:0.1,I:0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,(G:0.1,((F:0.1,I:0.1):0.1,(((J:0.1,H:0.1):0.1,D:0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((F:0.1,I:0.1):0.1,(G:0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((F:0.1,I:0.1):0.1,(G:0.1,(((J:0.1,H:0.1):0.1,D:0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((G:0.1,(F:0.1,I:0.1):0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((G:0.1,(F:0.1,I:0.1):0.1):0.1,(((J:0.1,H:0.1):0.1,D:0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,(G:0.1,((F:0.1,I:0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(D:0.1,(H:0.1,(J:0.1,(((G:0.1,E:0.1):0.1,(F:0.1,I:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1):0.1);",
        "(A:0.1,(B:0.1,(E:0.1,((G:0.1,(F:0.1,I:0.1):0.1):0.1,((J:0.1,(H:0.1,D:0.1):0.1):0.1,C:0.1):0.1):0.1):0.1):0.1);",
    ];

    const RF: [[usize; 12]; 12] = [
        [0, 4, 2, 10, 10, 10, 10, 10, 10, 10, 2, 10],
        [4, 0, 2, 10, 8, 10, 8, 10, 8, 10, 2, 10],
        [2, 2, 0, 10, 10, 10, 10, 10, 10, 10, 0, 10],
        [10, 10, 10, 0, 2, 2, 4, 2, 4, 0, 10, 2],
        [10, 8, 10, 2, 0, 4, 2, 4, 2, 2, 10, 4],
        [10, 10, 10, 2, 4, 0, 2, 2, 4, 2, 10, 2],
        [10, 8, 10, 4, 2, 2, 0, 4, 2, 4, 10, 4],
        [10, 10, 10, 2, 4, 2, 4, 0, 2, 2, 10, 0],
        [10, 8, 10, 4, 2, 4, 2, 2, 0, 4, 10, 2],
        [10, 10, 10, 0, 2, 2, 4, 2, 4, 0, 10, 2],
        [2, 2, 0, 10, 10, 10, 10, 10, 10, 10, 0, 10],
        [10, 10, 10, 2, 4, 2, 4, 0, 2, 2, 10, 0],
    ];

    const WEIGHTED_RF: [[f64; 12]; 12] = [
        [0., 0.4, 0.2, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.9999999999999999],
        [0.4, 0., 0.2, 0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.2, 0.9999999999999999],
        [0.2, 0.2, 0., 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.9999999999999999],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.2, 0.2, 0.4, 0.2, 0.4, 0., 0.9999999999999999, 0.2],
        [0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.2, 0., 0.4, 0.2, 0.4, 0.2, 0.2, 0.9999999999999999, 0.4],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.4, 0., 0.2, 0.2, 0.4, 0.2, 0.9999999999999999, 0.2],
        [0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.4, 0.2, 0.2, 0., 0.4, 0.2, 0.4, 0.9999999999999999, 0.4],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.4, 0.2, 0.4, 0., 0.2, 0.2, 0.9999999999999999, 0.],
        [0.9999999999999999, 0.7999999999999999, 0.9999999999999999, 0.4, 0.2, 0.4, 0.2, 0.2, 0., 0.4, 0.9999999999999999, 0.2],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.2, 0.2, 0.4, 0.2, 0.4, 0., 0.9999999999999999, 0.2],
        [0.2, 0.2, 0., 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0., 0.9999999999999999],
        [0.9999999999999999, 0.9999999999999999, 0.9999999999999999, 0.2, 0.4, 0.2, 0.4, 0., 0.2, 0.2, 0.9999999999999999, 0.],
    ];

    const KF: [[f64; 12]; 12] = [
        [0., 0.2, 0.14142135623730953, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.316227766016838],
        [0.2, 0., 0.14142135623730953, 0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.14142135623730953, 0.316227766016838],
        [0.14142135623730953, 0.14142135623730953, 0., 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.316227766016838],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.14142135623730953, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.316227766016838, 0.14142135623730953],
        [0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.14142135623730953, 0., 0.2, 0.14142135623730953, 0.2, 0.14142135623730953, 0.14142135623730953, 0.316227766016838, 0.2],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.2, 0., 0.14142135623730953, 0.14142135623730953, 0.2, 0.14142135623730953, 0.316227766016838, 0.14142135623730953],
        [0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.2, 0.14142135623730953, 0.14142135623730953, 0., 0.2, 0.14142135623730953, 0.2, 0.316227766016838, 0.2],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.14142135623730953, 0.14142135623730953, 0.316227766016838, 0.],
        [0.316227766016838, 0.28284271247461906, 0.316227766016838, 0.2, 0.14142135623730953, 0.2, 0.14142135623730953, 0.14142135623730953, 0., 0.2, 0.316227766016838, 0.14142135623730953],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.14142135623730953, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.316227766016838, 0.14142135623730953],
        [0.14142135623730953, 0.14142135623730953, 0., 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0.316227766016838, 0., 0.316227766016838],
        [0.316227766016838, 0.316227766016838, 0.316227766016838, 0.14142135623730953, 0.2, 0.14142135623730953, 0.2, 0., 0.14142135623730953, 0.14142135623730953, 0.316227766016838, 0.],
    ];

    fn parsed() -> Vec<PhyloTree> {
        TREEDIST
            .iter()
            .map(|newick| PhyloTree::from_newick(newick).unwrap())
            .collect()
    }

    #[test]
    fn robinson_foulds_treedist() {
        let trees = parsed();
        for (i0, i1) in (0..trees.len()).tuple_combinations() {
            assert_eq!(robinson_foulds(&trees[i0], &trees[i1]).unwrap(), RF[i0][i1]);
        }
    }

    #[test]
    fn weighted_robinson_foulds_treedist() {
        let trees = parsed();
        for (i0, i1) in (0..trees.len()).tuple_combinations() {
            let dist = weighted_robinson_foulds(&trees[i0], &trees[i1]).unwrap();
            assert!((dist - WEIGHTED_RF[i0][i1]).abs() <= f64::EPSILON);
        }
    }

    #[test]
    fn kuhner_felsenstein_treedist() {
        let trees = parsed();
        for (i0, i1) in (0..trees.len()).tuple_combinations() {
            assert_eq!(kuhner_felsenstein(&trees[i0], &trees[i1]).unwrap(), KF[i0][i1]);
        }
    }

    #[test]
    fn pairwise_matches_matrix() {
        let sets = split_sets(&parsed()).unwrap();
        let pairs = pairwise_rf(&sets);
        assert_eq!(pairs.len(), 66);
        let matrix = distance_matrix(sets.len(), pairs);
        for (i, row) in matrix.iter().enumerate() {
            assert_eq!(row.as_slice(), RF[i].as_slice());
        }

        for (i, j, dist) in pairwise_kf(&sets) {
            assert_eq!(dist, KF[i][j]);
        }
        for (i, j, dist) in pairwise_weighted_rf(&sets) {
            assert!((dist - WEIGHTED_RF[i][j]).abs() <= f64::EPSILON);
        }
    }

    #[test]
    fn branch_lengths_matter() {
        let a = PhyloTree::from_newick("((A:1,B:1):0.5,(C:1,D:1):0.5);").unwrap();
        let b = PhyloTree::from_newick("((B:1,A:1):2,(D:1,C:1):1);").unwrap();
        assert_eq!(robinson_foulds(&a, &b).unwrap(), 0);
        // the root edge 0.5 + 0.5 against 2 + 1
        assert_eq!(weighted_robinson_foulds(&a, &b).unwrap(), 2.0);
        assert_eq!(kuhner_felsenstein(&a, &b).unwrap(), 2.0);
    }

    #[test]
    fn different_tip_sets_are_rejected() {
        let a = PhyloTree::from_newick("((A,B),(C,D));").unwrap();
        let b = PhyloTree::from_newick("((A,B),(C,E));").unwrap();
        assert!(robinson_foulds(&a, &b).is_err());
        assert!(split_sets(std::iter::empty()).is_err());
    }
}
