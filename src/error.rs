//! Error type shared by every tree operation.
//!
//! Each variant maps to a stable numeric code. Codes live above
//! [`ERROR_BASE`] (`2^10 + 2^11`) and are laid out so that every move kind
//! owns a disjoint bit range:
//!
//! ```text
//! bits 0-2  TBR   3073..=3075   mask 3079
//! bits 3-4  NNI   3080, 3088    mask 3096
//! bits 5-6  SPR   3104, 3136    mask 3168
//! bits 7-9  general tree errors 3200..=3840
//! ```
//!
//! A caller can therefore tell which move family failed with a single mask
//! test, see [`Error::kind`].

use thiserror::Error;

use crate::rearrange::RearrangeKind;
use crate::utree::NodeId;

pub const ERROR_BASE: u32 = 3072;

pub const TBR_LEAF_BISECTION: u32 = 3073;
pub const TBR_OVERLAPPED_NODES: u32 = 3074;
pub const TBR_SAME_SUBTREE: u32 = 3075;
pub const TBR_MASK: u32 = 3079;

pub const NNI_INVALID_MOVE: u32 = 3080;
pub const NNI_LEAF_EDGE: u32 = 3088;
pub const NNI_MASK: u32 = 3096;

pub const SPR_INVALID_NODE: u32 = 3104;
pub const SPR_OVERLAP: u32 = 3136;
pub const SPR_MASK: u32 = 3168;

pub const INTERCHANGE_LEAF: u32 = 3200;
pub const INVALID_REARRANGE: u32 = 3328;
pub const INVALID_TREE_SIZE: u32 = 3456;
pub const INVALID_TREE: u32 = 3584;
pub const ROLLBACK_MISMATCH: u32 = 3712;
pub const INVALID_PARTITION: u32 = 3840;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("cannot bisect at branch {0}: one of its ends is a leaf")]
    TbrLeafBisection(NodeId),

    #[error("reconnection edge at {0} overlaps or touches the bisection edge")]
    TbrOverlappedNodes(NodeId),

    #[error("reconnection edges {0} and {1} lie in the same subtree")]
    TbrSameSubtree(NodeId, NodeId),

    #[error("invalid NNI move at {0}")]
    NniInvalidMove(NodeId),

    #[error("NNI edge at {0} is incident to a leaf")]
    NniLeafEdge(NodeId),

    #[error("invalid SPR prune node {0}")]
    SprInvalidNode(NodeId),

    #[error("regraft edge {regraft} lies inside or next to the subtree pruned at {prune}")]
    SprOverlap { prune: NodeId, regraft: NodeId },

    #[error("node {0} is a leaf, an inner node is required")]
    InterchangeLeaf(NodeId),

    #[error("invalid rearrangement: {0}")]
    InvalidRearrange(String),

    #[error("invalid tree size: {0}")]
    InvalidTreeSize(String),

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("rollback record does not match the current topology: {0}")]
    RollbackMismatch(String),

    #[error("invalid partition index {0}")]
    InvalidPartition(usize),
}

impl Error {
    /// Stable numeric code of this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::TbrLeafBisection(_) => TBR_LEAF_BISECTION,
            Error::TbrOverlappedNodes(_) => TBR_OVERLAPPED_NODES,
            Error::TbrSameSubtree(..) => TBR_SAME_SUBTREE,
            Error::NniInvalidMove(_) => NNI_INVALID_MOVE,
            Error::NniLeafEdge(_) => NNI_LEAF_EDGE,
            Error::SprInvalidNode(_) => SPR_INVALID_NODE,
            Error::SprOverlap { .. } => SPR_OVERLAP,
            Error::InterchangeLeaf(_) => INTERCHANGE_LEAF,
            Error::InvalidRearrange(_) => INVALID_REARRANGE,
            Error::InvalidTreeSize(_) => INVALID_TREE_SIZE,
            Error::InvalidTree(_) => INVALID_TREE,
            Error::RollbackMismatch(_) => ROLLBACK_MISMATCH,
            Error::InvalidPartition(_) => INVALID_PARTITION,
        }
    }

    /// Move family this error belongs to, `None` for general tree errors.
    pub fn kind(&self) -> Option<RearrangeKind> {
        let code = self.code() & !ERROR_BASE;
        [RearrangeKind::Spr, RearrangeKind::Nni, RearrangeKind::Tbr]
            .into_iter()
            .find(|kind| code & kind.error_mask() & !ERROR_BASE != 0)
    }

    /// Fatal errors mean the caller's view of the topology is corrupt and the
    /// search should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RollbackMismatch(_) | Error::InvalidTree(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
