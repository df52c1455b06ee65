//! Rooted binary trees and rooted SPR.
//!
//! Nodes live in an arena; every node keeps its parent and up to two
//! children, and the length of the edge to its parent.
//!
//! ```text
//!            root
//!           /    \
//!        par      ...
//!       /   \
//!    node   sibling
//! ```
//!
//! Pruning `node` removes `par` from the tree and lets `sibling` take its
//! place (its length absorbs the parent's). Regrafting inserts `par` back
//! in the middle of any other edge.

use std::collections::HashMap;

use phylotree::tree::Tree as PhyloTree;

use crate::error::{Error, Result};
use crate::utree::{
    DEFAULT_BRANCH_LENGTH, NodeId, TraversalOrder, TreeEdge, Visit, branch_length, phylo_error,
};

#[derive(Debug, Clone, PartialEq)]
struct RNode<D> {
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    length: f64,
    clv_index: usize,
    scaler_index: Option<usize>,
    pmatrix_index: usize,
    label: Option<String>,
    data: Option<D>,
}

/// Rooted binary tree with optional per-node payload `D`.
#[derive(Debug, Clone, PartialEq)]
pub struct RTree<D = ()> {
    nodes: Vec<RNode<D>>,
    root: Option<NodeId>,
}

/// Undo record of one rooted SPR.
#[derive(Debug, Clone, PartialEq)]
pub struct RSprRollback {
    prune: NodeId,
    sibling: NodeId,
    regraft: NodeId,
    parent_bl: f64,
    sibling_bl: f64,
    regraft_bl: f64,
}

impl<D> Default for RTree<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> RTree<D> {
    pub fn new() -> Self {
        RTree {
            nodes: Vec::new(),
            root: None,
        }
    }

    fn add(&mut self, label: Option<String>, clv_index: usize, scaler_index: Option<usize>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(RNode {
            parent: None,
            left: None,
            right: None,
            length: DEFAULT_BRANCH_LENGTH,
            clv_index,
            scaler_index,
            pmatrix_index: clv_index,
            label,
            data: None,
        });
        id
    }

    pub fn add_tip(&mut self, label: impl Into<String>, clv_index: usize) -> NodeId {
        self.add(Some(label.into()), clv_index, None)
    }

    /// Adds an inner node; the first one added becomes the root.
    pub fn add_inner(&mut self, clv_index: usize, scaler_index: Option<usize>) -> NodeId {
        let id = self.add(None, clv_index, scaler_index);
        self.root.get_or_insert(id);
        id
    }

    /// Makes `child` a child of `parent` in its first free slot.
    pub fn connect(&mut self, parent: NodeId, child: NodeId, length: f64) -> Result<()> {
        self.check(parent)?;
        self.check(child)?;
        if self.nodes[child.0].parent.is_some() {
            return Err(Error::InvalidTree(format!("node {child} already has a parent")));
        }
        let p = &mut self.nodes[parent.0];
        if p.left.is_none() {
            p.left = Some(child);
        } else if p.right.is_none() {
            p.right = Some(child);
        } else {
            return Err(Error::InvalidTree(format!("node {parent} already has two children")));
        }
        let c = &mut self.nodes[child.0];
        c.parent = Some(parent);
        c.length = length;
        Ok(())
    }

    fn check(&self, id: NodeId) -> Result<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(Error::InvalidTree(format!("unknown node {id}")))
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tip_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.left.is_none() && n.right.is_none())
            .count()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) -> Result<()> {
        self.check(root)?;
        self.root = Some(root);
        Ok(())
    }

    pub fn is_tip(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.0)
            .is_some_and(|n| n.left.is_none() && n.right.is_none())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0)?.parent
    }

    pub fn children(&self, id: NodeId) -> Option<(NodeId, NodeId)> {
        let node = self.nodes.get(id.0)?;
        Some((node.left?, node.right?))
    }

    /// The other child of `id`'s parent.
    pub fn sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = &self.nodes[self.parent(id)?.0];
        if parent.left == Some(id) {
            parent.right
        } else {
            parent.left
        }
    }

    pub fn length(&self, id: NodeId) -> Option<f64> {
        self.nodes.get(id.0).map(|n| n.length)
    }

    pub fn set_length(&mut self, id: NodeId, length: f64) -> Result<()> {
        self.check(id)?;
        self.nodes[id.0].length = length;
        Ok(())
    }

    pub fn scale_branches(&mut self, factor: f64) {
        self.nodes.iter_mut().for_each(|n| n.length *= factor);
    }

    pub fn label(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id.0)?.label.as_deref()
    }

    pub fn clv_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.get(id.0).map(|n| n.clv_index)
    }

    pub fn scaler_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.get(id.0)?.scaler_index
    }

    pub fn pmatrix_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.get(id.0).map(|n| n.pmatrix_index)
    }

    pub fn data(&self, id: NodeId) -> Option<&D> {
        self.nodes.get(id.0)?.data.as_ref()
    }

    pub fn set_data(&mut self, id: NodeId, data: D) -> Result<()> {
        self.check(id)?;
        self.nodes[id.0].data = Some(data);
        Ok(())
    }

    /// Every parent→child edge.
    pub fn edges(&self) -> Vec<TreeEdge> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| {
                Some(TreeEdge {
                    a: n.parent?,
                    b: NodeId(i),
                    length: n.length,
                })
            })
            .collect()
    }

    pub fn traverse(&self, root: NodeId, order: TraversalOrder) -> RTraversal<'_, D> {
        let stack = if root.0 < self.nodes.len() {
            vec![Visit::Enter(root)]
        } else {
            Vec::new()
        };
        RTraversal {
            tree: self,
            order,
            stack,
        }
    }

    fn in_subtree(&self, root: NodeId, id: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(node) = cur {
            if node == root {
                return true;
            }
            cur = self.parent(node);
        }
        false
    }

    /// Nodes whose distance in edges from `node` lies in `[min, max]`,
    /// walking through children (left first) and then the parent.
    pub fn nodes_at_node_dist(&self, node: NodeId, min: usize, max: usize) -> Result<Vec<NodeId>> {
        self.check(node)?;
        if min > max {
            return Err(Error::InvalidRearrange(format!(
                "distance range {min}..={max} is empty"
            )));
        }
        let mut out = Vec::new();
        self.collect_at_dist(node, None, 0, min, max, &mut out);
        Ok(out)
    }

    fn collect_at_dist(
        &self,
        node: NodeId,
        from: Option<NodeId>,
        depth: usize,
        min: usize,
        max: usize,
        out: &mut Vec<NodeId>,
    ) {
        if depth >= min {
            out.push(node);
        }
        if depth == max {
            return;
        }
        let n = &self.nodes[node.0];
        for neighbour in [n.left, n.right, n.parent].into_iter().flatten() {
            if Some(neighbour) != from {
                self.collect_at_dist(neighbour, Some(node), depth + 1, min, max, out);
            }
        }
    }

    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        let p = &mut self.nodes[parent.0];
        if p.left == Some(old) {
            p.left = Some(new);
        } else if p.right == Some(old) {
            p.right = Some(new);
        }
    }

    /// Detaches the subtree at `node` together with its parent.
    ///
    /// The sibling takes the parent's place and absorbs its branch length;
    /// if the parent was the root, the sibling becomes the new root. Returns
    /// the sibling.
    pub fn prune(&mut self, node: NodeId) -> Result<NodeId> {
        self.check(node)?;
        let parent = self.parent(node).ok_or(Error::SprInvalidNode(node))?;
        let sibling = self
            .sibling(node)
            .ok_or_else(|| Error::InvalidTree(format!("node {parent} has a single child")))?;

        match self.nodes[parent.0].parent {
            Some(grand) => {
                self.replace_child(grand, parent, sibling);
                let absorbed = self.nodes[parent.0].length;
                let s = &mut self.nodes[sibling.0];
                s.parent = Some(grand);
                s.length += absorbed;
            }
            None => {
                self.nodes[sibling.0].parent = None;
                self.root = Some(sibling);
            }
        }

        let p = &mut self.nodes[parent.0];
        p.parent = None;
        if p.left == Some(sibling) {
            p.left = None;
        } else {
            p.right = None;
        }
        Ok(sibling)
    }

    /// Inserts the pruned parent of `node` in the middle of the edge above
    /// `target`.
    pub fn regraft(&mut self, node: NodeId, target: NodeId) -> Result<()> {
        self.check(node)?;
        self.check(target)?;
        let parent = self.parent(node).ok_or(Error::SprInvalidNode(node))?;
        let p = &self.nodes[parent.0];
        if p.parent.is_some() || (p.left.is_some() && p.right.is_some()) || self.root == Some(parent) {
            return Err(Error::InvalidTree(format!("parent of {node} is not detached")));
        }
        if self.in_subtree(node, target) {
            return Err(Error::SprOverlap {
                prune: node,
                regraft: target,
            });
        }

        let half = self.nodes[target.0].length / 2.0;
        match self.nodes[target.0].parent {
            Some(above) => {
                self.replace_child(above, target, parent);
                self.nodes[parent.0].parent = Some(above);
            }
            None => self.root = Some(parent),
        }
        let p = &mut self.nodes[parent.0];
        if p.left.is_none() {
            p.left = Some(target);
        } else {
            p.right = Some(target);
        }
        p.length = half;
        let t = &mut self.nodes[target.0];
        t.parent = Some(parent);
        t.length = half;
        Ok(())
    }

    /// Moves the subtree at `node` onto the edge above `target`.
    ///
    /// # Errors
    /// [`Error::SprInvalidNode`] if `node` is the root, [`Error::SprOverlap`]
    /// if `target` lies in the moved subtree or is `node`'s parent or
    /// sibling. The tree is untouched on error.
    pub fn spr(&mut self, node: NodeId, target: NodeId) -> Result<RSprRollback> {
        self.check(node)?;
        self.check(target)?;
        let parent = self.parent(node).ok_or(Error::SprInvalidNode(node))?;
        let sibling = self.sibling(node).ok_or(Error::SprInvalidNode(node))?;
        if target == parent || target == sibling || self.in_subtree(node, target) {
            tracing::debug!(%node, %target, "rejected rooted spr");
            return Err(Error::SprOverlap {
                prune: node,
                regraft: target,
            });
        }

        let rollback = RSprRollback {
            prune: node,
            sibling,
            regraft: target,
            parent_bl: self.nodes[parent.0].length,
            sibling_bl: self.nodes[sibling.0].length,
            regraft_bl: self.nodes[target.0].length,
        };
        self.prune(node)?;
        self.regraft(node, target)?;
        tracing::debug!(%node, %target, "applied rooted spr");
        Ok(rollback)
    }

    /// Undoes the SPR described by `record`, restoring every length.
    pub fn rollback(&mut self, record: RSprRollback) -> Result<()> {
        self.check(record.prune)?;
        self.check(record.sibling)?;
        self.check(record.regraft)?;
        let parent = self.parent(record.prune);
        if parent.is_none() || self.sibling(record.prune) != Some(record.regraft) {
            return Err(Error::RollbackMismatch(format!(
                "node {} no longer sits next to {}",
                record.prune, record.regraft
            )));
        }

        self.prune(record.prune)?;
        self.regraft(record.prune, record.sibling)?;
        if let Some(parent) = parent {
            self.nodes[parent.0].length = record.parent_bl;
        }
        self.nodes[record.sibling.0].length = record.sibling_bl;
        self.nodes[record.regraft.0].length = record.regraft_bl;
        tracing::debug!(node = %record.prune, "rolled back rooted spr");
        Ok(())
    }

    /// Converts a parsed bifurcating tree.
    ///
    /// Tips get ids `0..n` in the source's leaf order, inner nodes follow in
    /// preorder with scaler `k`. The pmatrix index of an edge is the child's
    /// CLV index.
    pub fn from_phylotree(source: &PhyloTree) -> Result<Self> {
        let leaves = source.get_leaves();
        let mut tree = RTree::new();
        let mut tips = HashMap::with_capacity(leaves.len());
        for (i, leaf) in leaves.iter().enumerate() {
            let name = source
                .get(leaf)
                .map_err(phylo_error)?
                .name
                .clone()
                .ok_or_else(|| Error::InvalidTree(format!("leaf {leaf} has no name")))?;
            tips.insert(*leaf, tree.add_tip(name, i));
        }
        let root = source.get_root().map_err(phylo_error)?;
        let mut inner = 0;
        let top = tree.attach_phylo(source, root, &tips, &mut inner)?;
        tree.root = Some(top);
        Ok(tree)
    }

    fn attach_phylo(
        &mut self,
        source: &PhyloTree,
        id: usize,
        tips: &HashMap<usize, NodeId>,
        inner: &mut usize,
    ) -> Result<NodeId> {
        if let Some(tip) = tips.get(&id) {
            self.nodes[tip.0].length = branch_length(source, id)?;
            return Ok(*tip);
        }
        let node = source.get(&id).map_err(phylo_error)?;
        let [left, right] = node.children.as_slice() else {
            return Err(Error::InvalidTree(format!(
                "inner node {id} has {} children",
                node.children.len()
            )));
        };
        let (left, right) = (*left, *right);
        let me = self.add(None, tips.len() + *inner, Some(*inner));
        *inner += 1;
        self.nodes[me.0].length = branch_length(source, id)?;
        for child in [left, right] {
            let below = self.attach_phylo(source, child, tips, inner)?;
            let length = self.nodes[below.0].length;
            self.connect(me, below, length)?;
        }
        Ok(me)
    }
}

/// Lazy depth-first walk over a rooted tree.
pub struct RTraversal<'a, D> {
    tree: &'a RTree<D>,
    order: TraversalOrder,
    stack: Vec<Visit>,
}

impl<D> Iterator for RTraversal<'_, D> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        while let Some(visit) = self.stack.pop() {
            let id = match visit {
                Visit::Emit(id) => return Some(id),
                Visit::Enter(id) => id,
            };
            let Some((left, right)) = self.tree.children(id) else {
                return Some(id);
            };
            match self.order {
                TraversalOrder::Preorder => {
                    self.stack.push(Visit::Enter(right));
                    self.stack.push(Visit::Enter(left));
                    return Some(id);
                }
                TraversalOrder::Inorder => {
                    self.stack.push(Visit::Enter(right));
                    self.stack.push(Visit::Emit(id));
                    self.stack.push(Visit::Enter(left));
                }
                TraversalOrder::Postorder => {
                    self.stack.push(Visit::Emit(id));
                    self.stack.push(Visit::Enter(right));
                    self.stack.push(Visit::Enter(left));
                }
            }
        }
        None
    }
}
