//! Unrooted binary trees stored as an arena of directed records.
//!
//! # Overview
//! Every tip is a single record, every inner node a ring of three records
//! chained through `next`. Two records facing each other across an edge are
//! linked through `back`. A record therefore doubles as a handle on an edge
//! (itself and its `back`) and on the subtree it looks away from:
//!
//! ```text
//!        A               C
//!         \             /
//!        x1            y1
//!          x0 ------ y0
//!        x2            y2
//!         /             \
//!        B               D
//! ```
//!
//! `x0.back == y0`, `x0.next == x1`, `x1.next == x2`, `x2.next == x0`.
//! The subtree "below" `x0` holds A and B: its children are `x1.back` and
//! `x2.back`.
//!
//! Records are never freed. Rearrangements only rewrite `back` links and
//! lengths, so a [`NodeId`] stays valid for the lifetime of the tree.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Display;

use derive_more::derive::From;
use phylotree::tree::Tree as PhyloTree;
use rand::Rng;

use crate::error::{Error, Result};

/// Branch length used when none is given.
pub const DEFAULT_BRANCH_LENGTH: f64 = 0.1;

/// Index of one record in a tree arena.
#[derive(PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Debug, Hash, From)]
pub struct NodeId(pub usize);

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An edge named by its two endpoints.
///
/// For unrooted trees `a` and `b` are two records facing each other; for
/// rooted trees they are parent and child. A `TreeEdge` is a plain value and
/// is checked against the tree every time it is passed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeEdge {
    pub a: NodeId,
    pub b: NodeId,
    pub length: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    Preorder,
    Inorder,
    Postorder,
}

#[derive(Debug, Clone, PartialEq)]
struct Record {
    node: usize,
    next: Option<NodeId>,
    back: Option<NodeId>,
    length: f64,
    pmatrix_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct NodeData<D> {
    first: NodeId,
    clv_index: usize,
    scaler_index: Option<usize>,
    label: Option<String>,
    data: Option<D>,
}

/// Unrooted tree with optional per-node payload `D`.
#[derive(Debug, Clone, PartialEq)]
pub struct UTree<D = ()> {
    records: Vec<Record>,
    nodes: Vec<NodeData<D>>,
    root: Option<NodeId>,
}

impl<D> Default for UTree<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> UTree<D> {
    pub fn new() -> Self {
        UTree {
            records: Vec::new(),
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Adds a detached tip and returns its record.
    pub fn add_tip(&mut self, label: impl Into<String>, clv_index: usize) -> NodeId {
        let id = NodeId(self.records.len());
        self.records.push(Record {
            node: self.nodes.len(),
            next: None,
            back: None,
            length: DEFAULT_BRANCH_LENGTH,
            pmatrix_index: id.0,
        });
        self.nodes.push(NodeData {
            first: id,
            clv_index,
            scaler_index: None,
            label: Some(label.into()),
            data: None,
        });
        id
    }

    /// Adds a detached inner node (a ring of three records) and returns its
    /// first record. The first inner node added becomes the root handle.
    pub fn add_inner(&mut self, clv_index: usize, scaler_index: Option<usize>) -> NodeId {
        let first = self.records.len();
        let node = self.nodes.len();
        for k in 0..3 {
            self.records.push(Record {
                node,
                next: Some(NodeId(first + (k + 1) % 3)),
                back: None,
                length: DEFAULT_BRANCH_LENGTH,
                pmatrix_index: first + k,
            });
        }
        self.nodes.push(NodeData {
            first: NodeId(first),
            clv_index,
            scaler_index,
            label: None,
            data: None,
        });
        self.root.get_or_insert(NodeId(first));
        NodeId(first)
    }

    /// Links `parent` and `child` across one edge of the given length.
    ///
    /// The child side takes over the parent's pmatrix index.
    pub fn connect(&mut self, parent: NodeId, child: NodeId, length: f64) -> Result<()> {
        self.check(parent)?;
        self.check(child)?;
        self.link(parent, child, length);
        Ok(())
    }

    pub(crate) fn link(&mut self, parent: NodeId, child: NodeId, length: f64) {
        let pmatrix_index = self.rec(parent).pmatrix_index;
        let p = self.rec_mut(parent);
        p.back = Some(child);
        p.length = length;
        let c = self.rec_mut(child);
        c.back = Some(parent);
        c.length = length;
        c.pmatrix_index = pmatrix_index;
    }

    pub(crate) fn unlink(&mut self, id: NodeId) {
        self.rec_mut(id).back = None;
    }

    pub(crate) fn check(&self, id: NodeId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(Error::InvalidTree(format!("unknown record {id}")))
        }
    }

    fn rec(&self, id: NodeId) -> &Record {
        &self.records[id.0]
    }

    fn rec_mut(&mut self, id: NodeId) -> &mut Record {
        &mut self.records[id.0]
    }

    fn node(&self, id: NodeId) -> &NodeData<D> {
        &self.nodes[self.rec(id).node]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.records.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tip_count(&self) -> usize {
        self.records.iter().filter(|r| r.next.is_none()).count()
    }

    pub fn inner_count(&self) -> usize {
        self.nodes.len() - self.tip_count()
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
        self.records.get(id.0).is_some_and(|r| r.next.is_none())
    }

    pub fn is_inner(&self, id: NodeId) -> bool {
        self.records.get(id.0).is_some_and(|r| r.next.is_some())
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.records.get(id.0)?.next
    }

    pub fn back(&self, id: NodeId) -> Option<NodeId> {
        self.records.get(id.0)?.back
    }

    pub fn length(&self, id: NodeId) -> Option<f64> {
        self.records.get(id.0).map(|r| r.length)
    }

    pub fn pmatrix_index(&self, id: NodeId) -> Option<usize> {
        self.records.get(id.0).map(|r| r.pmatrix_index)
    }

    pub fn clv_index(&self, id: NodeId) -> Option<usize> {
        self.contains(id).then(|| self.node(id).clv_index)
    }

    pub fn scaler_index(&self, id: NodeId) -> Option<usize> {
        self.contains(id).then(|| self.node(id).scaler_index).flatten()
    }

    pub fn label(&self, id: NodeId) -> Option<&str> {
        self.contains(id)
            .then(|| self.node(id).label.as_deref())
            .flatten()
    }

    pub fn data(&self, id: NodeId) -> Option<&D> {
        self.contains(id).then(|| self.node(id).data.as_ref()).flatten()
    }

    pub fn set_data(&mut self, id: NodeId, data: D) -> Result<()> {
        self.check(id)?;
        let node = self.rec(id).node;
        self.nodes[node].data = Some(data);
        Ok(())
    }

    pub fn set_label(&mut self, id: NodeId, label: impl Into<String>) -> Result<()> {
        self.check(id)?;
        let node = self.rec(id).node;
        self.nodes[node].label = Some(label.into());
        Ok(())
    }

    /// Sets the length of the edge at `id` on both of its records.
    pub fn set_length(&mut self, id: NodeId, length: f64) -> Result<()> {
        self.check(id)?;
        self.rec_mut(id).length = length;
        if let Some(back) = self.rec(id).back {
            self.rec_mut(back).length = length;
        }
        Ok(())
    }

    /// Multiplies every branch length by `factor`.
    pub fn scale_branches(&mut self, factor: f64) {
        self.records.iter_mut().for_each(|r| r.length *= factor);
    }

    /// Rewrites a tip's id and the pmatrix index of its edge.
    pub(crate) fn set_tip_index(&mut self, tip: NodeId, index: usize) {
        let node = self.rec(tip).node;
        self.nodes[node].clv_index = index;
        self.rec_mut(tip).pmatrix_index = index;
        if let Some(back) = self.rec(tip).back {
            self.rec_mut(back).pmatrix_index = index;
        }
    }

    /// The three records of the inner node holding `id`, starting at `id`.
    pub fn ring(&self, id: NodeId) -> Option<[NodeId; 3]> {
        let n1 = self.next(id)?;
        let n2 = self.next(n1)?;
        Some([id, n1, n2])
    }

    /// The two records the subtree below `id` hangs from, `None` for tips and
    /// for records whose neighbours are detached.
    pub fn children(&self, id: NodeId) -> Option<(NodeId, NodeId)> {
        let [_, n1, n2] = self.ring(id)?;
        Some((self.back(n1)?, self.back(n2)?))
    }

    /// The edge at `id`, if it is attached.
    pub fn edge(&self, id: NodeId) -> Result<TreeEdge> {
        self.check(id)?;
        let b = self
            .back(id)
            .ok_or_else(|| Error::InvalidTree(format!("record {id} is detached")))?;
        Ok(TreeEdge {
            a: id,
            b,
            length: self.rec(id).length,
        })
    }

    /// Every attached edge once, named from its lower-numbered record.
    pub fn edges(&self) -> Vec<TreeEdge> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                let b = r.back?;
                (i < b.0).then_some(TreeEdge {
                    a: NodeId(i),
                    b,
                    length: r.length,
                })
            })
            .collect()
    }

    /// Tip records in arena order.
    pub fn tips(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.next.is_none())
            .map(|(i, _)| NodeId(i))
    }

    /// First record of every inner node in arena order.
    pub fn inner_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .map(|n| n.first)
            .filter(|&first| self.is_inner(first))
    }

    /// Visits the whole tree from the edge at `root`.
    ///
    /// The `root.back` side comes first; in postorder `root` is the last
    /// record produced. Each node is produced once, through the record that
    /// faces `root`.
    pub fn traverse(&self, root: NodeId, order: TraversalOrder) -> Traversal<'_, D> {
        let mut stack = Vec::new();
        if self.contains(root) {
            match (order, self.back(root)) {
                (TraversalOrder::Preorder, Some(back)) => {
                    stack.push(Visit::Enter(back));
                    stack.push(Visit::Enter(root));
                }
                (_, Some(back)) => {
                    stack.push(Visit::Enter(root));
                    stack.push(Visit::Enter(back));
                }
                (_, None) => stack.push(Visit::Enter(root)),
            }
        }
        Traversal {
            tree: self,
            order,
            stack,
        }
    }

    /// Visits only the subtree below `root`.
    pub fn subtree(&self, root: NodeId, order: TraversalOrder) -> Traversal<'_, D> {
        let stack = if self.contains(root) {
            vec![Visit::Enter(root)]
        } else {
            Vec::new()
        };
        Traversal {
            tree: self,
            order,
            stack,
        }
    }

    /// Resets CLV, scaler and pmatrix indices to the canonical layout.
    ///
    /// Tip ids are kept. Inner nodes get CLV `n_tips + k` and scaler `k`,
    /// tip edges take the tip id as pmatrix index and inner edges follow
    /// from `n_tips` upwards.
    pub fn reset_indices(&mut self) {
        let tip_count = self.tip_count();
        let mut inner = 0;
        for k in 0..self.nodes.len() {
            let first = self.nodes[k].first;
            if self.rec(first).next.is_some() {
                self.nodes[k].clv_index = tip_count + inner;
                self.nodes[k].scaler_index = Some(inner);
                inner += 1;
            }
        }

        let mut next_pmatrix = tip_count;
        for i in 0..self.records.len() {
            let id = NodeId(i);
            let Some(back) = self.rec(id).back else {
                continue;
            };
            if back.0 < i {
                continue;
            }
            let index = if self.rec(id).next.is_none() {
                self.node(id).clv_index
            } else if self.rec(back).next.is_none() {
                self.node(back).clv_index
            } else {
                next_pmatrix += 1;
                next_pmatrix - 1
            };
            self.rec_mut(id).pmatrix_index = index;
            self.rec_mut(back).pmatrix_index = index;
        }
    }

    /// Renumbers inner CLV and scaler indices so that a postorder traversal
    /// from `root` needs as few inner CLV buffers as possible.
    ///
    /// A buffer is handed back once the parent reading it has been computed
    /// and is reused by the next node. Returns the number of buffers; inner
    /// CLV indices end up in `n_tips..n_tips + count`. Only valid for full
    /// evaluations in that exact traversal order, since nodes share buffers.
    pub fn set_clv_minimal(&mut self, root: NodeId) -> Result<usize> {
        self.edge(root)?;
        let order: Vec<NodeId> = self
            .traverse(root, TraversalOrder::Postorder)
            .filter(|&x| self.is_inner(x))
            .collect();

        let mut slot_of: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut free: BinaryHeap<Reverse<usize>> = BinaryHeap::new();
        let mut count = 0;
        for x in order {
            let slot = match free.pop() {
                Some(Reverse(slot)) => slot,
                None => {
                    count += 1;
                    count - 1
                }
            };
            let (c1, c2) = self
                .children(x)
                .ok_or_else(|| Error::InvalidTree(format!("node at {x} is detached")))?;
            for child in [c1, c2] {
                if let Some(released) = slot_of[self.rec(child).node].take() {
                    free.push(Reverse(released));
                }
            }
            slot_of[self.rec(x).node] = Some(slot);
        }

        let tip_count = self.tip_count();
        for (node, slot) in slot_of.into_iter().enumerate() {
            if let Some(slot) = slot {
                self.nodes[node].clv_index = tip_count + slot;
                self.nodes[node].scaler_index = Some(slot);
            }
        }
        tracing::debug!(%root, buffers = count, "assigned minimal clv layout");
        Ok(count)
    }

    /// Nodes whose distance in edges from `node` lies in `[min, max]`.
    ///
    /// Each node is reported through the record facing `node`. Nodes are
    /// produced depth first along the `next` ring, a node before everything
    /// behind it.
    pub fn nodes_at_node_dist(&self, node: NodeId, min: usize, max: usize) -> Result<Vec<NodeId>> {
        self.check(node)?;
        check_range(min, max)?;
        let mut out = Vec::new();
        if min == 0 {
            out.push(node);
        }
        if max == 0 {
            return Ok(out);
        }
        let starts = match self.ring(node) {
            Some(ring) => ring.to_vec(),
            None => vec![node],
        };
        for start in starts {
            if let Some(neighbour) = self.back(start) {
                self.collect_at_dist(neighbour, 1, min, max, &mut out);
            }
        }
        Ok(out)
    }

    /// Nodes whose distance from the nearer end of `edge` lies in
    /// `[min, max]`; both ends sit at distance 0.
    pub fn nodes_at_edge_dist(&self, edge: NodeId, min: usize, max: usize) -> Result<Vec<NodeId>> {
        let edge = self.edge(edge)?;
        check_range(min, max)?;
        let mut out = Vec::new();
        self.collect_at_dist(edge.a, 0, min, max, &mut out);
        self.collect_at_dist(edge.b, 0, min, max, &mut out);
        Ok(out)
    }

    fn collect_at_dist(&self, from: NodeId, depth: usize, min: usize, max: usize, out: &mut Vec<NodeId>) {
        if depth >= min {
            out.push(from);
        }
        if depth == max {
            return;
        }
        if let Some((left, right)) = self.children(from) {
            self.collect_at_dist(left, depth + 1, min, max, out);
            self.collect_at_dist(right, depth + 1, min, max, out);
        }
    }

    /// Builds a random unrooted tree over `names`.
    ///
    /// Starts from three tips around one inner node and attaches every
    /// further tip to an edge drawn uniformly from the current tree. Tip `i`
    /// gets id `i`; every branch has [`DEFAULT_BRANCH_LENGTH`].
    pub fn create_random<S, R>(n_taxa: usize, names: &[S], rng: &mut R) -> Result<Self>
    where
        S: AsRef<str>,
        R: Rng,
    {
        if n_taxa < 3 {
            return Err(Error::InvalidTreeSize(format!(
                "a tree needs at least 3 tips, got {n_taxa}"
            )));
        }
        if names.len() != n_taxa {
            return Err(Error::InvalidTreeSize(format!(
                "{} labels for {n_taxa} tips",
                names.len()
            )));
        }

        let mut tree = UTree::new();
        let tips: Vec<NodeId> = names
            .iter()
            .enumerate()
            .map(|(i, name)| tree.add_tip(name.as_ref(), i))
            .collect();

        let center = tree.add_inner(n_taxa, Some(0));
        let ring = [center, NodeId(center.0 + 1), NodeId(center.0 + 2)];
        for (slot, tip) in ring.iter().zip(&tips) {
            tree.link(*slot, *tip, DEFAULT_BRANCH_LENGTH);
        }

        // one record per edge
        let mut edges: Vec<NodeId> = ring.to_vec();
        for &tip in &tips[3..] {
            let x = edges[rng.gen_range(0..edges.len())];
            let Some(y) = tree.back(x) else {
                return Err(Error::InvalidTree(format!("record {x} is detached")));
            };
            let u = tree.add_inner(0, None);
            let (v, w) = (NodeId(u.0 + 1), NodeId(u.0 + 2));
            tree.link(x, v, DEFAULT_BRANCH_LENGTH);
            tree.link(w, y, DEFAULT_BRANCH_LENGTH);
            tree.link(u, tip, DEFAULT_BRANCH_LENGTH);
            edges.push(w);
            edges.push(u);
        }

        tree.reset_indices();
        tracing::debug!(tips = n_taxa, edges = edges.len(), "created random tree");
        Ok(tree)
    }

    /// Converts a parsed tree into an unrooted arena tree.
    ///
    /// Tips are numbered in the source's leaf order. A bifurcating root is
    /// suppressed by merging its two edges; a trifurcating root becomes an
    /// ordinary inner node. Every other inner node must have two children
    /// and every leaf must be named. Missing lengths default to
    /// [`DEFAULT_BRANCH_LENGTH`].
    ///
    /// # Errors
    /// [`Error::InvalidTreeSize`] below three tips, [`Error::InvalidTree`] for
    /// unnamed leaves and multifurcations.
    pub fn from_phylotree(source: &PhyloTree) -> Result<Self> {
        let leaves = source.get_leaves();
        if leaves.len() < 3 {
            return Err(Error::InvalidTreeSize(format!(
                "a tree needs at least 3 tips, got {}",
                leaves.len()
            )));
        }

        let mut tree = UTree::new();
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

        let root_id = source.get_root().map_err(phylo_error)?;
        let root = source.get(&root_id).map_err(phylo_error)?;
        match root.children.as_slice() {
            [left, right] => {
                let a = tree.attach_phylo(source, *left, &tips)?;
                let b = tree.attach_phylo(source, *right, &tips)?;
                let length = branch_length(source, *left)? + branch_length(source, *right)?;
                tree.link(a, b, length);
            }
            [c0, c1, c2] => {
                let center = tree.add_inner(0, None);
                let ring = [center, NodeId(center.0 + 1), NodeId(center.0 + 2)];
                for (slot, child) in ring.into_iter().zip([*c0, *c1, *c2]) {
                    let below = tree.attach_phylo(source, child, &tips)?;
                    tree.link(slot, below, branch_length(source, child)?);
                }
            }
            other => {
                return Err(Error::InvalidTree(format!(
                    "root has {} children",
                    other.len()
                )));
            }
        }

        tree.reset_indices();
        Ok(tree)
    }

    fn attach_phylo(
        &mut self,
        source: &PhyloTree,
        id: usize,
        tips: &HashMap<usize, NodeId>,
    ) -> Result<NodeId> {
        if let Some(tip) = tips.get(&id) {
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
        let up = self.add_inner(0, None);
        for (slot, child) in [(NodeId(up.0 + 1), left), (NodeId(up.0 + 2), right)] {
            let below = self.attach_phylo(source, child, tips)?;
            self.link(slot, below, branch_length(source, child)?);
        }
        Ok(up)
    }
}

fn check_range(min: usize, max: usize) -> Result<()> {
    if min > max {
        return Err(Error::InvalidRearrange(format!(
            "distance range {min}..={max} is empty"
        )));
    }
    Ok(())
}

pub(crate) fn phylo_error(err: phylotree::tree::TreeError) -> Error {
    Error::InvalidTree(err.to_string())
}

pub(crate) fn branch_length(source: &PhyloTree, id: usize) -> Result<f64> {
    Ok(source
        .get(&id)
        .map_err(phylo_error)?
        .parent_edge
        .unwrap_or(DEFAULT_BRANCH_LENGTH))
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Visit {
    Enter(NodeId),
    Emit(NodeId),
}

/// Lazy depth-first walk over an unrooted tree.
///
/// Produced by [`UTree::traverse`] and [`UTree::subtree`]; call either again
/// to restart.
pub struct Traversal<'a, D> {
    tree: &'a UTree<D>,
    order: TraversalOrder,
    stack: Vec<Visit>,
}

impl<D> Iterator for Traversal<'_, D> {
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
