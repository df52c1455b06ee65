//! Topological moves on unrooted trees: SPR, NNI and TBR, with exact undo.
//!
//! Every move validates all of its preconditions before the first link is
//! rewritten, so a rejected move leaves the tree exactly as it was. A
//! successful move returns a [`Rollback`] that restores the previous tree,
//! links, branch lengths and pmatrix indices included.
//!
//! # SPR
//! ```text
//!        L       R                L ------- R
//!         \     /                       r'
//!          n1 n2         ==>            |
//!           p                      n2 - p - n1      (p inserted on r - r')
//!           |                           |
//!        subtree                     subtree
//! ```
//!
//! # NNI
//! ```text
//!   A           C              C           A
//!    \         /                \         /
//!     a1     b1                  a1     b1
//!       e - f          Left ==>    e - f
//!     a2     b2                  a2     b2
//!    /         \                /         \
//!   B           D              B           D
//! ```
//!
//! `Right` swaps `A` with `D` instead.

use crate::error::{Error, NNI_MASK, Result, SPR_MASK, TBR_MASK};
use crate::utree::{NodeId, TraversalOrder, TreeEdge, UTree};

/// Move family, used to classify errors and rollback records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RearrangeKind {
    Spr,
    Nni,
    Tbr,
}

impl RearrangeKind {
    pub fn error_mask(self) -> u32 {
        match self {
            RearrangeKind::Spr => SPR_MASK,
            RearrangeKind::Nni => NNI_MASK,
            RearrangeKind::Tbr => TBR_MASK,
        }
    }
}

/// Which of the two neighbouring subtrees an NNI swaps in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NniType {
    /// Swap `edge.next`'s subtree with `edge.back.next`'s.
    Left,
    /// Swap `edge.next`'s subtree with `edge.back.next.next`'s.
    Right,
}

/// How an inner node sat between two neighbours before it was moved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub left: NodeId,
    pub right: NodeId,
    pub left_bl: f64,
    pub right_bl: f64,
}

/// Undo record of one move. Consumed by [`UTree::rollback`].
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback {
    Spr {
        prune_edge: NodeId,
        prune_bl: f64,
        attachment: Attachment,
        /// The edge the subtree was regrafted on, with its length before.
        regraft: TreeEdge,
    },
    Nni {
        edge: NodeId,
        kind: NniType,
        left_left_bl: f64,
        left_right_bl: f64,
        right_left_bl: f64,
        right_right_bl: f64,
        edge_bl: f64,
        /// Neighbours of `edge`'s two nodes right after the move, in ring
        /// order: left side first, then right.
        neighbours: [NodeId; 4],
    },
    Tbr {
        bisect_edge: NodeId,
        bisect_bl: f64,
        parent_side: Attachment,
        child_side: Attachment,
        parent_reconnect: TreeEdge,
        child_reconnect: TreeEdge,
    },
}

impl Rollback {
    pub fn kind(&self) -> RearrangeKind {
        match self {
            Rollback::Spr { .. } => RearrangeKind::Spr,
            Rollback::Nni { .. } => RearrangeKind::Nni,
            Rollback::Tbr { .. } => RearrangeKind::Tbr,
        }
    }
}

impl<D> UTree<D> {
    fn len_of(&self, id: NodeId) -> f64 {
        self.length(id).unwrap_or_default()
    }

    /// Ring of an inner node together with the two records it hangs from.
    fn attached_ring(&self, node: NodeId) -> Option<([NodeId; 3], NodeId, NodeId)> {
        let ring = self.ring(node)?;
        Some((ring, self.back(ring[1])?, self.back(ring[2])?))
    }

    fn same_node(&self, record: NodeId, target: NodeId) -> bool {
        match self.ring(record) {
            Some(ring) => ring.contains(&target),
            None => record == target,
        }
    }

    /// Whether `target` belongs to a node of the subtree below `root`.
    fn subtree_holds(&self, root: NodeId, target: NodeId) -> bool {
        self.subtree(root, TraversalOrder::Preorder)
            .any(|x| self.same_node(x, target))
    }

    fn prune_unchecked(&mut self, edge: NodeId, left: NodeId, right: NodeId) -> TreeEdge {
        let length = self.len_of(left) + self.len_of(right);
        self.link(left, right, length);
        if let Some([_, n1, n2]) = self.ring(edge) {
            self.unlink(n1);
            self.unlink(n2);
        }
        TreeEdge {
            a: left,
            b: right,
            length,
        }
    }

    fn regraft_unchecked(&mut self, edge: NodeId, target: NodeId, other: NodeId) {
        if let Some([_, n1, n2]) = self.ring(edge) {
            let half = self.len_of(target) / 2.0;
            self.link(target, n1, half);
            self.link(n2, other, half);
        }
    }

    /// Puts `node` back between the neighbours it had before a move.
    fn restore_attachment(&mut self, node: NodeId, attachment: &Attachment, current: &TreeEdge) {
        if let Some([_, n1, n2]) = self.ring(node) {
            self.link(current.a, current.b, current.length);
            self.link(attachment.left, n1, attachment.left_bl);
            self.link(n2, attachment.right, attachment.right_bl);
        }
    }

    /// Detaches the subtree hanging behind `edge.back`.
    ///
    /// The two other neighbours of `edge`'s node are joined by one edge
    /// carrying the sum of their lengths; that spliced edge is returned.
    pub fn prune(&mut self, edge: NodeId) -> Result<TreeEdge> {
        self.check(edge)?;
        if self.is_tip(edge) {
            return Err(Error::InterchangeLeaf(edge));
        }
        let (_, left, right) = self
            .attached_ring(edge)
            .ok_or_else(|| Error::InvalidTree(format!("node at {edge} is already detached")))?;
        Ok(self.prune_unchecked(edge, left, right))
    }

    /// Inserts the detached node of `edge` in the middle of `target`'s edge.
    pub fn regraft(&mut self, edge: NodeId, target: NodeId) -> Result<()> {
        self.check(edge)?;
        self.check(target)?;
        let [_, n1, n2] = self.ring(edge).ok_or(Error::InterchangeLeaf(edge))?;
        if self.back(n1).is_some() || self.back(n2).is_some() {
            return Err(Error::InvalidTree(format!("node at {edge} is not detached")));
        }
        let other = self
            .back(target)
            .ok_or_else(|| Error::InvalidTree(format!("target {target} is detached")))?;
        let inside = match self.back(edge) {
            Some(below) => self.subtree_holds(below, target) || self.subtree_holds(below, other),
            None => false,
        };
        if inside || self.same_node(edge, target) || self.same_node(edge, other) {
            return Err(Error::InvalidRearrange(format!(
                "cannot regraft {edge} inside its own subtree"
            )));
        }
        self.regraft_unchecked(edge, target, other);
        Ok(())
    }

    /// Swaps the subtrees behind `node1` and `node2`. Each subtree keeps its
    /// branch length.
    pub fn interchange(&mut self, node1: NodeId, node2: NodeId) -> Result<()> {
        self.check(node1)?;
        self.check(node2)?;
        for node in [node1, node2] {
            if self.is_tip(node) {
                return Err(Error::InterchangeLeaf(node));
            }
        }
        let (Some(s1), Some(s2)) = (self.back(node1), self.back(node2)) else {
            return Err(Error::InvalidTree("interchange on a detached record".into()));
        };
        if self.same_node(node1, node2)
            || self.subtree_holds(s1, node2)
            || self.subtree_holds(s2, node1)
        {
            return Err(Error::InvalidRearrange(format!(
                "subtrees behind {node1} and {node2} are nested"
            )));
        }
        self.interchange_unchecked(node1, node2);
        Ok(())
    }

    fn interchange_unchecked(&mut self, node1: NodeId, node2: NodeId) {
        if let (Some(s1), Some(s2)) = (self.back(node2), self.back(node1)) {
            let (l1, l2) = (self.len_of(s1), self.len_of(s2));
            self.link(s1, node1, l1);
            self.link(s2, node2, l2);
        }
    }

    /// Prunes the subtree behind `p_edge.back` and regrafts it on `r_edge`.
    ///
    /// # Errors
    /// [`Error::SprInvalidNode`] if `p_edge` is a tip or not attached,
    /// [`Error::SprOverlap`] if `r_edge` lies in the pruned subtree or is one
    /// of the three edges around `p_edge`'s node.
    pub fn spr(&mut self, p_edge: NodeId, r_edge: NodeId) -> Result<Rollback> {
        if !self.contains(r_edge) {
            return Err(Error::SprInvalidNode(r_edge));
        }
        let (local, left, right) = self
            .attached_ring(p_edge)
            .ok_or(Error::SprInvalidNode(p_edge))?;
        let pruned = self.back(p_edge).ok_or(Error::SprInvalidNode(p_edge))?;
        let r_back = self.back(r_edge).ok_or(Error::SprInvalidNode(r_edge))?;

        if local.contains(&r_edge)
            || local.contains(&r_back)
            || self.subtree_holds(pruned, r_edge)
            || self.subtree_holds(pruned, r_back)
        {
            tracing::debug!(prune = %p_edge, regraft = %r_edge, "rejected spr");
            return Err(Error::SprOverlap {
                prune: p_edge,
                regraft: r_edge,
            });
        }

        let rollback = Rollback::Spr {
            prune_edge: p_edge,
            prune_bl: self.len_of(p_edge),
            attachment: Attachment {
                left,
                right,
                left_bl: self.len_of(local[1]),
                right_bl: self.len_of(local[2]),
            },
            regraft: TreeEdge {
                a: r_edge,
                b: r_back,
                length: self.len_of(r_edge),
            },
        };

        self.prune_unchecked(p_edge, left, right);
        self.regraft_unchecked(p_edge, r_edge, r_back);
        tracing::debug!(prune = %p_edge, regraft = %r_edge, "applied spr");
        Ok(rollback)
    }

    /// Swaps one subtree on each side of the inner edge at `edge`.
    ///
    /// # Errors
    /// [`Error::NniInvalidMove`] for unknown or detached records,
    /// [`Error::NniLeafEdge`] if either end of the edge is a tip.
    pub fn nni(&mut self, edge: NodeId, kind: NniType) -> Result<Rollback> {
        if !self.contains(edge) {
            return Err(Error::NniInvalidMove(edge));
        }
        let other = self.back(edge).ok_or(Error::NniInvalidMove(edge))?;
        if self.is_tip(edge) || self.is_tip(other) {
            tracing::debug!(%edge, "rejected nni on leaf edge");
            return Err(Error::NniLeafEdge(edge));
        }
        let ((left, _, _), (right, _, _)) = self
            .attached_ring(edge)
            .zip(self.attached_ring(other))
            .ok_or(Error::NniInvalidMove(edge))?;

        let (left_left_bl, left_right_bl) = (self.len_of(left[1]), self.len_of(left[2]));
        let (right_left_bl, right_right_bl) = (self.len_of(right[1]), self.len_of(right[2]));
        let edge_bl = self.len_of(edge);

        let swap_with = match kind {
            NniType::Left => right[1],
            NniType::Right => right[2],
        };
        self.interchange_unchecked(left[1], swap_with);
        tracing::debug!(%edge, ?kind, "applied nni");
        Ok(Rollback::Nni {
            edge,
            kind,
            left_left_bl,
            left_right_bl,
            right_left_bl,
            right_right_bl,
            edge_bl,
            neighbours: self.nni_neighbours(left, right),
        })
    }

    /// Removes the edge at `edge`, splicing both of its ends.
    ///
    /// Returns the two spliced edges, first on `edge`'s side, then on
    /// `edge.back`'s. The two bisection nodes stay linked to each other.
    pub fn bisect(&mut self, edge: NodeId) -> Result<(TreeEdge, TreeEdge)> {
        self.check(edge)?;
        let other = self
            .back(edge)
            .ok_or_else(|| Error::InvalidTree(format!("record {edge} is detached")))?;
        if self.is_tip(edge) || self.is_tip(other) {
            return Err(Error::TbrLeafBisection(edge));
        }
        let ((_, pl, pr), (_, ql, qr)) = self
            .attached_ring(edge)
            .zip(self.attached_ring(other))
            .ok_or_else(|| Error::InvalidTree(format!("edge {edge} is already bisected")))?;
        let parent_side = self.prune_unchecked(edge, pl, pr);
        let child_side = self.prune_unchecked(other, ql, qr);
        Ok((parent_side, child_side))
    }

    /// Reinserts the two nodes of a bisected edge: `pruned_edge`'s node on
    /// `edge.a`'s edge, its partner on `edge.b`'s edge, and gives the bridge
    /// `edge.length`. Returns the bridge.
    pub fn reconnect(&mut self, edge: TreeEdge, pruned_edge: NodeId) -> Result<TreeEdge> {
        for id in [edge.a, edge.b, pruned_edge] {
            self.check(id)?;
        }
        let partner = self
            .back(pruned_edge)
            .ok_or_else(|| Error::InvalidTree(format!("record {pruned_edge} is detached")))?;
        for node in [pruned_edge, partner] {
            let [_, n1, n2] = self.ring(node).ok_or(Error::TbrLeafBisection(node))?;
            if self.back(n1).is_some() || self.back(n2).is_some() {
                return Err(Error::InvalidTree(format!("node at {node} is not detached")));
            }
        }
        for id in [edge.a, edge.b] {
            if self.same_node(pruned_edge, id) || self.same_node(partner, id) {
                return Err(Error::TbrOverlappedNodes(id));
            }
        }
        let a_back = self.edge(edge.a)?.b;
        let b_back = self.edge(edge.b)?.b;
        if self
            .traverse(edge.a, TraversalOrder::Preorder)
            .any(|x| self.same_node(x, edge.b))
        {
            return Err(Error::TbrSameSubtree(edge.a, edge.b));
        }

        self.regraft_unchecked(pruned_edge, edge.a, a_back);
        self.regraft_unchecked(partner, edge.b, b_back);
        self.set_length(pruned_edge, edge.length)?;
        Ok(TreeEdge {
            a: pruned_edge,
            b: partner,
            length: edge.length,
        })
    }

    /// Bisects the tree at `bisect_edge` and reconnects the two halves
    /// through the edges named by `reconnect.a` and `reconnect.b`, one in
    /// each half, in either order. The new bridge gets `reconnect.length`.
    ///
    /// A reconnection record may name an edge incident to the bisection
    /// edge; it then refers to the edge spliced on that side, and the half
    /// keeps its shape. Doing so on both sides would rebuild the same tree
    /// and is rejected.
    ///
    /// # Errors
    /// [`Error::TbrLeafBisection`] if the bisection edge touches a tip,
    /// [`Error::TbrOverlappedNodes`] if a reconnection edge is the bisection
    /// edge or the move is degenerate, [`Error::TbrSameSubtree`] if both
    /// reconnection edges lie in the same half.
    pub fn tbr(&mut self, bisect_edge: NodeId, reconnect: TreeEdge) -> Result<Rollback> {
        for id in [bisect_edge, reconnect.a, reconnect.b] {
            if !self.contains(id) {
                return Err(Error::InvalidRearrange(format!("unknown record {id}")));
            }
        }
        let p = bisect_edge;
        let q = self
            .back(p)
            .ok_or_else(|| Error::InvalidRearrange(format!("record {p} is detached")))?;
        if self.is_tip(p) || self.is_tip(q) {
            tracing::debug!(bisect = %p, "rejected tbr on leaf edge");
            return Err(Error::TbrLeafBisection(p));
        }
        let ((pring, pl, pr), (qring, ql, qr)) = self
            .attached_ring(p)
            .zip(self.attached_ring(q))
            .ok_or_else(|| Error::InvalidTree(format!("edge {p} is already bisected")))?;

        // Map a record to the edge it names once both ends are spliced.
        let resolve = |x: NodeId| -> Result<(NodeId, NodeId)> {
            let spliced = [pring[1], pring[2], qring[1], qring[2]];
            let x = if spliced.contains(&x) {
                self.back(x).unwrap_or(x)
            } else {
                x
            };
            if x == p || x == q {
                return Err(Error::TbrOverlappedNodes(x));
            }
            let partner = match x {
                x if x == pl => pr,
                x if x == pr => pl,
                x if x == ql => qr,
                x if x == qr => ql,
                x => self
                    .back(x)
                    .ok_or_else(|| Error::InvalidRearrange(format!("record {x} is detached")))?,
            };
            Ok((x, partner))
        };
        let a = resolve(reconnect.a)?;
        let b = resolve(reconnect.b)?;

        let on_parent_side =
            |x: NodeId| self.subtree_holds(pl, x) || self.subtree_holds(pr, x);
        let ((pa, pa_back), (qb, qb_back)) = match (on_parent_side(a.0), on_parent_side(b.0)) {
            (true, false) => (a, b),
            (false, true) => (b, a),
            _ => {
                tracing::debug!(bisect = %p, a = %reconnect.a, b = %reconnect.b, "rejected tbr");
                return Err(Error::TbrSameSubtree(reconnect.a, reconnect.b));
            }
        };
        let parent_spliced = pa == pl || pa == pr;
        let child_spliced = qb == ql || qb == qr;
        if parent_spliced && child_spliced {
            tracing::debug!(bisect = %p, "rejected degenerate tbr");
            return Err(Error::TbrOverlappedNodes(p));
        }

        let parent_side = Attachment {
            left: pl,
            right: pr,
            left_bl: self.len_of(pring[1]),
            right_bl: self.len_of(pring[2]),
        };
        let child_side = Attachment {
            left: ql,
            right: qr,
            left_bl: self.len_of(qring[1]),
            right_bl: self.len_of(qring[2]),
        };
        let reconnect_length = |x: NodeId, spliced: bool, side: &Attachment| {
            if spliced {
                side.left_bl + side.right_bl
            } else {
                self.len_of(x)
            }
        };
        let rollback = Rollback::Tbr {
            bisect_edge: p,
            bisect_bl: self.len_of(p),
            parent_side,
            child_side,
            parent_reconnect: TreeEdge {
                a: pa,
                b: pa_back,
                length: reconnect_length(pa, parent_spliced, &parent_side),
            },
            child_reconnect: TreeEdge {
                a: qb,
                b: qb_back,
                length: reconnect_length(qb, child_spliced, &child_side),
            },
        };

        self.prune_unchecked(p, pl, pr);
        self.prune_unchecked(q, ql, qr);
        self.regraft_unchecked(p, pa, pa_back);
        self.regraft_unchecked(q, qb, qb_back);
        self.set_length(p, reconnect.length)?;
        tracing::debug!(bisect = %p, parent = %pa, child = %qb, "applied tbr");
        Ok(rollback)
    }

    /// Undoes the move described by `record`.
    ///
    /// # Errors
    /// [`Error::RollbackMismatch`] if the tree no longer has the shape the
    /// move left behind. The tree is untouched in that case.
    pub fn rollback(&mut self, record: Rollback) -> Result<()> {
        let kind = record.kind();
        match record {
            Rollback::Spr {
                prune_edge,
                prune_bl,
                attachment,
                regraft,
            } => {
                self.expect_between(prune_edge, &regraft)?;
                self.expect_spliced(&attachment, &regraft)?;
                self.restore_attachment(prune_edge, &attachment, &regraft);
                self.set_length(prune_edge, prune_bl)?;
            }
            Rollback::Nni {
                edge,
                kind,
                left_left_bl,
                left_right_bl,
                right_left_bl,
                right_right_bl,
                edge_bl,
                neighbours,
            } => {
                let rings = self
                    .back(edge)
                    .and_then(|other| self.attached_ring(edge).zip(self.attached_ring(other)));
                let Some(((left, _, _), (right, _, _))) = rings else {
                    return Err(Error::RollbackMismatch(format!(
                        "edge {edge} is no longer an inner edge"
                    )));
                };
                if self.nni_neighbours(left, right) != neighbours {
                    return Err(Error::RollbackMismatch(format!(
                        "neighbours around edge {edge} changed since the nni"
                    )));
                }
                let swap_with = match kind {
                    NniType::Left => right[1],
                    NniType::Right => right[2],
                };
                self.interchange_unchecked(left[1], swap_with);
                self.set_length(left[1], left_left_bl)?;
                self.set_length(left[2], left_right_bl)?;
                self.set_length(right[1], right_left_bl)?;
                self.set_length(right[2], right_right_bl)?;
                self.set_length(edge, edge_bl)?;
            }
            Rollback::Tbr {
                bisect_edge,
                bisect_bl,
                parent_side,
                child_side,
                parent_reconnect,
                child_reconnect,
            } => {
                let partner = self.back(bisect_edge).ok_or_else(|| {
                    Error::RollbackMismatch(format!("record {bisect_edge} is detached"))
                })?;
                self.expect_between(bisect_edge, &parent_reconnect)?;
                self.expect_between(partner, &child_reconnect)?;
                self.expect_spliced(&parent_side, &parent_reconnect)?;
                self.expect_spliced(&child_side, &child_reconnect)?;
                self.restore_attachment(bisect_edge, &parent_side, &parent_reconnect);
                self.restore_attachment(partner, &child_side, &child_reconnect);
                self.set_length(bisect_edge, bisect_bl)?;
            }
        }
        tracing::debug!(?kind, "rolled back move");
        Ok(())
    }

    fn nni_neighbours(&self, left: [NodeId; 3], right: [NodeId; 3]) -> [NodeId; 4] {
        [left[1], left[2], right[1], right[2]].map(|x| self.back(x).unwrap_or(x))
    }

    /// The edge a move spliced must still join the two old neighbours,
    /// unless the moved node was put back on that very edge.
    fn expect_spliced(&self, side: &Attachment, reconnect: &TreeEdge) -> Result<()> {
        let reattached = (reconnect.a, reconnect.b) == (side.left, side.right)
            || (reconnect.a, reconnect.b) == (side.right, side.left);
        if reattached || self.back(side.left) == Some(side.right) {
            Ok(())
        } else {
            Err(Error::RollbackMismatch(format!(
                "spliced edge {} - {} no longer exists",
                side.left, side.right
            )))
        }
    }

    fn expect_between(&self, node: NodeId, edge: &TreeEdge) -> Result<()> {
        match self.attached_ring(node) {
            Some((_, left, right)) if left == edge.a && right == edge.b => Ok(()),
            _ => Err(Error::RollbackMismatch(format!(
                "node at {node} does not sit between {} and {}",
                edge.a, edge.b
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::split_create;
    use crate::utree::tests::{quartet, random_tree};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use proptest::sample::Index;

    fn splits_of(tree: &UTree) -> Vec<crate::Bitset> {
        split_create(tree, tree.tip_count()).unwrap()
    }

    fn bits(raw: &[usize]) -> crate::Bitset {
        let mut bs = crate::Bitset::zeros(1);
        raw.iter().for_each(|&i| bs.set(i));
        bs
    }

    #[test]
    fn nni_left_swaps_a_and_c() {
        let mut tree = quartet();
        let before = tree.clone();

        let record = tree.nni(NodeId(4), NniType::Left).unwrap();
        assert_eq!(tree.back(NodeId(5)), Some(NodeId(2)));
        assert_eq!(tree.back(NodeId(8)), Some(NodeId(0)));
        assert_eq!(tree.length(NodeId(5)), Some(0.3));
        // {B, C} | {A, D}, stored without tip 0
        assert_eq!(splits_of(&tree), vec![bits(&[1, 2])]);

        tree.rollback(record).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn nni_closure() {
        let mut tree = quartet();
        let before = tree.clone();
        tree.nni(NodeId(4), NniType::Left).unwrap();
        tree.nni(NodeId(4), NniType::Right).unwrap();
        assert_ne!(splits_of(&tree), splits_of(&before));
        tree.nni(NodeId(4), NniType::Right).unwrap();
        tree.nni(NodeId(4), NniType::Left).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn nni_rejects_leaf_edge() {
        let mut tree = quartet();
        let before = tree.clone();
        let err = tree.nni(NodeId(5), NniType::Left).unwrap_err();
        assert_eq!(err, Error::NniLeafEdge(NodeId(5)));
        assert_eq!(err.kind(), Some(RearrangeKind::Nni));
        assert!(matches!(
            tree.nni(NodeId(77), NniType::Right),
            Err(Error::NniInvalidMove(_))
        ));
        assert_eq!(tree, before);
    }

    #[test]
    fn spr_moves_a_next_to_c() {
        let mut tree = quartet();
        let before = tree.clone();

        let record = tree.spr(NodeId(5), NodeId(8)).unwrap();
        assert_eq!(tree.back(NodeId(1)), Some(NodeId(7)));
        assert_eq!(tree.length(NodeId(1)), Some(0.7));
        assert_eq!(tree.length(NodeId(2)), Some(0.15));
        // {A, C} | {B, D}
        assert_eq!(splits_of(&tree), vec![bits(&[1, 3])]);

        tree.rollback(record).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn spr_rejections_leave_tree_untouched() {
        let mut tree = quartet();
        let before = tree.clone();

        // inside the pruned subtree
        assert!(matches!(tree.spr(NodeId(5), NodeId(0)), Err(Error::SprOverlap { .. })));
        // adjacent edge
        assert!(matches!(tree.spr(NodeId(5), NodeId(1)), Err(Error::SprOverlap { .. })));
        assert!(matches!(tree.spr(NodeId(5), NodeId(6)), Err(Error::SprOverlap { .. })));
        // tip as prune edge
        let err = tree.spr(NodeId(0), NodeId(8)).unwrap_err();
        assert_eq!(err, Error::SprInvalidNode(NodeId(0)));
        assert_eq!(err.kind(), Some(RearrangeKind::Spr));
        assert_eq!(tree, before);
    }

    #[test]
    fn stale_spr_rollback_is_fatal() {
        let mut tree = quartet();
        let first = tree.spr(NodeId(5), NodeId(8)).unwrap();
        let second = tree.spr(NodeId(5), NodeId(9)).unwrap();
        let snapshot = tree.clone();
        let err = tree.rollback(first).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(tree, snapshot);
        tree.rollback(second).unwrap();
    }

    #[test]
    fn stale_nni_rollback_is_fatal() {
        let mut tree = quartet();
        let first = tree.nni(NodeId(4), NniType::Left).unwrap();
        let second = tree.nni(NodeId(4), NniType::Right).unwrap();
        let snapshot = tree.clone();
        let err = tree.rollback(first.clone()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(tree, snapshot);

        tree.rollback(second).unwrap();
        tree.rollback(first).unwrap();
        assert_eq!(tree, quartet());
    }

    #[test]
    fn prune_then_regraft() {
        let mut tree = quartet();
        let spliced = tree.prune(NodeId(5)).unwrap();
        assert_eq!((spliced.a, spliced.b), (NodeId(1), NodeId(7)));
        assert_eq!(spliced.length, 0.7);
        assert!(matches!(tree.prune(NodeId(5)), Err(Error::InvalidTree(_))));
        assert!(matches!(tree.regraft(NodeId(5), NodeId(0)), Err(Error::InvalidRearrange(_))));
        tree.regraft(NodeId(5), NodeId(9)).unwrap();
        assert_eq!(tree.back(NodeId(6)), Some(NodeId(9)));
        assert_eq!(tree.back(NodeId(4)), Some(NodeId(3)));
        assert!(matches!(tree.prune(NodeId(0)), Err(Error::InterchangeLeaf(_))));
    }

    /// Six tips, three cherries around one centre.
    ///
    /// ```text
    ///   A       C
    ///    X --- Z --- Y
    ///   B      |      D
    ///          W
    ///         E F
    /// ```
    fn cherries() -> UTree {
        let source = phylotree::tree::Tree::from_newick("((A,B),(C,D),(E,F));").unwrap();
        UTree::from_phylotree(&source).unwrap()
    }

    fn tip(tree: &UTree, name: &str) -> NodeId {
        tree.tips().find(|&t| tree.label(t) == Some(name)).unwrap()
    }

    /// Record of the cherry holding `name` that faces the centre.
    fn cherry_up(tree: &UTree, name: &str) -> NodeId {
        let below = tree.back(tip(tree, name)).unwrap();
        tree.ring(below)
            .unwrap()
            .into_iter()
            .find(|&r| tree.is_inner(tree.back(r).unwrap()))
            .unwrap()
    }

    #[test]
    fn tbr_reconnects_both_halves() {
        let mut tree = cherries();
        let before = tree.clone();
        let bisect = cherry_up(&tree, "A");
        let centre = tree.back(bisect).unwrap();
        let c_up = cherry_up(&tree, "C");

        // keep the {A, B} half as it is and move the bridge next to C
        let reconnect = TreeEdge {
            a: tip(&tree, "A"),
            b: tip(&tree, "C"),
            length: 0.42,
        };
        let record = tree.tbr(bisect, reconnect).unwrap();
        assert_eq!(tree.length(bisect), Some(0.42));
        assert_eq!(tree.back(bisect), Some(centre));
        // the old centre now separates {A, B, C} from the rest
        assert_eq!(splits_of(&tree).len(), 3);
        assert_ne!(splits_of(&tree), splits_of(&before));
        assert_eq!(tree.back(c_up).map(|r| tree.same_node(r, centre)), Some(false));

        tree.rollback(record).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn tbr_rejections() {
        let mut tree = cherries();
        let before = tree.clone();
        let bisect = cherry_up(&tree, "A");
        let (a, b, c, e) = (tip(&tree, "A"), tip(&tree, "B"), tip(&tree, "C"), tip(&tree, "E"));
        let edge = |a, b| TreeEdge { a, b, length: 0.1 };

        let err = tree.tbr(a, edge(c, e)).unwrap_err();
        assert_eq!(err, Error::TbrLeafBisection(a));
        assert_eq!(err.kind(), Some(RearrangeKind::Tbr));
        assert!(matches!(
            tree.tbr(bisect, edge(bisect, c)),
            Err(Error::TbrOverlappedNodes(_))
        ));
        assert!(matches!(tree.tbr(bisect, edge(c, e)), Err(Error::TbrSameSubtree(..))));
        assert!(matches!(tree.tbr(bisect, edge(a, b)), Err(Error::TbrSameSubtree(..))));
        // both halves put back where they were
        let centre = tree.back(bisect).unwrap();
        let next_to_centre = tree.back(tree.next(centre).unwrap()).unwrap();
        assert!(matches!(
            tree.tbr(bisect, edge(a, next_to_centre)),
            Err(Error::TbrOverlappedNodes(_))
        ));
        assert_eq!(tree, before);
    }

    #[test]
    fn spr_rollback_after_regraft_on_spliced_edge_is_fatal() {
        let mut tree = cherries();
        let before = tree.clone();
        let first = tree.spr(tree.back(tip(&tree, "A")).unwrap(), tip(&tree, "C")).unwrap();
        let Rollback::Spr { attachment, .. } = first.clone() else {
            unreachable!()
        };
        // E lands on the edge that joined B to the centre
        let second = tree
            .spr(tree.back(tip(&tree, "E")).unwrap(), attachment.left)
            .unwrap();
        let snapshot = tree.clone();
        assert!(tree.rollback(first.clone()).unwrap_err().is_fatal());
        assert_eq!(tree, snapshot);

        tree.rollback(second).unwrap();
        tree.rollback(first).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn tbr_rollback_after_spliced_edge_moved_is_fatal() {
        let mut tree = cherries();
        let before = tree.clone();
        let bisect = cherry_up(&tree, "A");
        let reconnect = TreeEdge {
            a: tip(&tree, "A"),
            b: tip(&tree, "C"),
            length: 0.42,
        };
        let first = tree.tbr(bisect, reconnect).unwrap();
        // pruning E takes apart the edge spliced around the old centre
        let second = tree
            .spr(tree.back(tip(&tree, "E")).unwrap(), tip(&tree, "D"))
            .unwrap();
        let snapshot = tree.clone();
        let err = tree.rollback(first.clone()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(tree, snapshot);

        tree.rollback(second).unwrap();
        tree.rollback(first).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn bisect_and_reconnect() {
        let mut tree = cherries();
        let bisect = cherry_up(&tree, "A");
        let partner = tree.back(bisect).unwrap();
        let (left, right) = tree.bisect(bisect).unwrap();
        let mut ends = [left.a, left.b];
        ends.sort();
        let mut cherry = [tip(&tree, "A"), tip(&tree, "B")];
        cherry.sort();
        assert_eq!(ends, cherry);
        assert!(tree.is_inner(right.a) && tree.is_inner(right.b));

        let c = tip(&tree, "C");
        assert!(matches!(
            tree.reconnect(TreeEdge { a: right.a, b: c, length: 1.0 }, bisect),
            Err(Error::TbrSameSubtree(..))
        ));
        let bridge = tree
            .reconnect(TreeEdge { a: left.a, b: c, length: 1.0 }, bisect)
            .unwrap();
        assert_eq!((bridge.a, bridge.b), (bisect, partner));
        assert_eq!(splits_of(&tree).len(), 3);
    }

    #[test]
    fn interchange_rejects_nested_subtrees() {
        let mut tree = quartet();
        assert!(matches!(tree.interchange(NodeId(5), NodeId(4)), Err(Error::InvalidRearrange(_))));
        assert!(matches!(tree.interchange(NodeId(0), NodeId(8)), Err(Error::InterchangeLeaf(_))));
        tree.interchange(NodeId(5), NodeId(8)).unwrap();
        assert_eq!(tree.back(NodeId(5)), Some(NodeId(2)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn spr_rollback_is_exact(n in 5usize..30, seed in any::<u64>(), p in any::<Index>(), r in any::<Index>()) {
            let mut tree = random_tree(n, seed);
            let before = tree.clone();
            let p = NodeId(p.index(tree.record_count()));
            let r = NodeId(r.index(tree.record_count()));
            match tree.spr(p, r) {
                Ok(record) => {
                    prop_assert_eq!(splits_of(&tree).len(), n - 3);
                    tree.rollback(record).unwrap();
                }
                Err(err) => prop_assert_eq!(err.kind(), Some(RearrangeKind::Spr)),
            }
            prop_assert_eq!(tree, before);
        }

        #[test]
        fn nni_rollback_is_exact(n in 4usize..30, seed in any::<u64>(), e in any::<Index>(), right in any::<bool>()) {
            let mut tree = random_tree(n, seed);
            let before = tree.clone();
            let e = NodeId(e.index(tree.record_count()));
            let kind = if right { NniType::Right } else { NniType::Left };
            if let Ok(record) = tree.nni(e, kind) {
                let rf = crate::split::split_rf_distance(&splits_of(&tree), &splits_of(&before), n).unwrap();
                prop_assert_eq!(rf, 2);
                tree.rollback(record).unwrap();
            }
            prop_assert_eq!(tree, before);
        }

        #[test]
        fn tbr_rollback_is_exact(
            n in 6usize..30,
            seed in any::<u64>(),
            e in any::<Index>(),
            a in any::<Index>(),
            b in any::<Index>(),
        ) {
            let mut tree = random_tree(n, seed);
            let before = tree.clone();
            let count = tree.record_count();
            let e = NodeId(e.index(count));
            let reconnect = TreeEdge {
                a: NodeId(a.index(count)),
                b: NodeId(b.index(count)),
                length: 0.3,
            };
            match tree.tbr(e, reconnect) {
                Ok(record) => {
                    prop_assert_eq!(tree.edges().len(), 2 * n - 3);
                    prop_assert_eq!(splits_of(&tree).len(), n - 3);
                    tree.rollback(record).unwrap();
                }
                Err(err) => prop_assert_eq!(err.kind(), Some(RearrangeKind::Tbr)),
            }
            prop_assert_eq!(tree, before);
        }
    }
}
