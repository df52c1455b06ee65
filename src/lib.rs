//! Crate root: module orchestration and public re-exports.
//!
//! Modules:
//! - `utree`: unrooted degree-3 trees as a half-edge arena.
//! - `rtree`: rooted binary trees with SPR and rollback.
//! - `rearrange`: SPR / NNI / TBR on unrooted trees, each with an exact rollback.
//! - `split`: bipartitions, tip-id consistency and RF distance.
//! - `distances`: RF / weighted RF / KF over parsed trees, pairwise in parallel.
//! - `treeinfo`: CLV and pmatrix validity cache driving a likelihood `Partition`.
//! - `bitset`: compact bitset representation for splits and validity flags.
//! - `error`: error type and stable numeric codes.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod bitset;
pub mod distances;
pub mod error;
pub mod rearrange;
pub mod rtree;
pub mod split;
pub mod treeinfo;
pub mod utree;

#[cfg(feature = "python")]
pub mod api;

pub use bitset::Bitset;
pub use error::{Error, Result};
pub use rearrange::{Attachment, NniType, RearrangeKind, Rollback};
pub use rtree::{RSprRollback, RTree};
pub use split::{SplitSet, consistency_check, consistency_set, rf_distance, split_create, split_rf_distance};
pub use treeinfo::{
    ActivePartition, BranchLengthLinkage, Operation, Partition, TreeInfo, TreeInfoOptions,
};
pub use utree::{NodeId, TraversalOrder, TreeEdge, UTree};
