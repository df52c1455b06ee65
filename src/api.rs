//! Python binding layer for tree distance calculations.
//!
//! Provides Python functions for computing pairwise tree distances
//! from Newick strings.

use phylotree::tree::Tree as PhyloTree;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::distances::{distance_matrix, pairwise_kf, pairwise_rf, pairwise_weighted_rf, split_sets};
use crate::split::SplitSet;

/// Compute pairwise Robinson-Foulds distances between Newick trees.
///
/// Args:
///     newicks: List of Newick strings over one shared taxon set
///
/// Returns:
///     A 2D list of RF distances
///
/// Raises:
///     ValueError: If fewer than two trees are given, a tree does not parse,
///     or the trees have different leaf sets
#[pyfunction]
#[pyo3(name = "pairwise_rf")]
fn pairwise_rf_matrix(newicks: Vec<String>) -> PyResult<Vec<Vec<usize>>> {
    let sets = load_split_sets(&newicks)?;
    Ok(distance_matrix(sets.len(), pairwise_rf(&sets)))
}

/// Compute pairwise Weighted Robinson-Foulds distances between Newick trees.
///
/// This metric considers branch lengths when comparing trees.
///
/// Args:
///     newicks: List of Newick strings over one shared taxon set
///
/// Returns:
///     A 2D list of weighted RF distances
#[pyfunction]
#[pyo3(name = "pairwise_weighted_rf")]
fn pairwise_weighted_rf_matrix(newicks: Vec<String>) -> PyResult<Vec<Vec<f64>>> {
    let sets = load_split_sets(&newicks)?;
    Ok(distance_matrix(sets.len(), pairwise_weighted_rf(&sets)))
}

/// Compute pairwise Kuhner-Felsenstein (Branch Score) distances between
/// Newick trees.
///
/// This metric uses squared differences of branch lengths: sqrt(Σ(length_a - length_b)²)
///
/// Args:
///     newicks: List of Newick strings over one shared taxon set
///
/// Returns:
///     A 2D list of KF distances
#[pyfunction]
#[pyo3(name = "pairwise_kf")]
fn pairwise_kf_matrix(newicks: Vec<String>) -> PyResult<Vec<Vec<f64>>> {
    let sets = load_split_sets(&newicks)?;
    Ok(distance_matrix(sets.len(), pairwise_kf(&sets)))
}

fn load_split_sets(newicks: &[String]) -> PyResult<Vec<SplitSet>> {
    if newicks.len() < 2 {
        return Err(PyValueError::new_err(
            "Need at least 2 trees to compute pairwise distances",
        ));
    }
    let trees = newicks
        .iter()
        .enumerate()
        .map(|(idx, newick)| {
            PhyloTree::from_newick(newick)
                .map_err(|e| PyValueError::new_err(format!("Tree {idx} does not parse: {e}")))
        })
        .collect::<PyResult<Vec<_>>>()?;
    split_sets(&trees).map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Python module definition
#[pymodule]
fn rust_python_tree_search(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(pairwise_rf_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(pairwise_weighted_rf_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(pairwise_kf_matrix, m)?)?;
    Ok(())
}
