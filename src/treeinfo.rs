//! Likelihood-state cache over one unrooted tree and several data partitions.
//!
//! [`TreeInfo`] never rewires the tree. Per partition it remembers which CLVs
//! (by record id) and which pmatrices (by pmatrix index) are current, and
//! drives a [`Partition`] to recompute exactly the stale ones.
//!
//! Invalidation never propagates: after changing an edge the caller marks
//! every CLV between that edge and the root, or calls
//! [`TreeInfo::invalidate_all`] after a topology change.

use bon::Builder;
use tracing::instrument;

use crate::bitset::Bitset;
use crate::error::{Error, Result};
use crate::utree::{NodeId, TraversalOrder, UTree};

/// One CLV update: the parent CLV is computed from two children through
/// their pmatrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub parent_clv: usize,
    pub parent_scaler: Option<usize>,
    pub child1_clv: usize,
    pub child1_scaler: Option<usize>,
    pub child1_matrix: usize,
    pub child2_clv: usize,
    pub child2_scaler: Option<usize>,
    pub child2_matrix: usize,
}

/// The numeric side of one data partition.
///
/// Implementors own the CLV, scaler and pmatrix buffers; [`TreeInfo`] only
/// decides what to recompute.
pub trait Partition {
    /// Recomputes pmatrix `matrix_indices[k]` for length `branch_lengths[k]`.
    fn update_prob_matrices(
        &mut self,
        params: &[usize],
        matrix_indices: &[usize],
        branch_lengths: &[f64],
    );

    /// Applies `operations` in order.
    fn update_partials(&mut self, operations: &[Operation]);

    /// Log-likelihood of the edge between two CLVs.
    fn compute_edge_loglikelihood(
        &self,
        parent_clv: usize,
        parent_scaler: Option<usize>,
        child_clv: usize,
        child_scaler: Option<usize>,
        matrix_index: usize,
        params: &[usize],
    ) -> f64;

    fn set_alpha(&mut self, _alpha: f64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchLengthLinkage {
    /// One length per edge, stored in the tree and shared by all partitions.
    #[default]
    Linked,
    /// Every partition keeps its own length table.
    Unlinked,
}

/// Partitions that bulk operations apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePartition {
    All,
    Single(usize),
}

#[derive(Debug, Clone, Builder)]
pub struct TreeInfoOptions {
    pub tip_count: usize,
    pub partition_count: usize,
    #[builder(default = BranchLengthLinkage::Linked)]
    pub brlen_linkage: BranchLengthLinkage,
}

#[derive(Debug)]
struct Slot<P> {
    partition: P,
    alpha: f64,
    param_indices: Vec<usize>,
    symmetries: Option<Vec<i32>>,
    /// Indexed by pmatrix index; empty with linked branch lengths.
    branch_lengths: Vec<f64>,
    clv_valid: Bitset,
    pmatrix_valid: Bitset,
}

#[derive(Debug)]
pub struct TreeInfo<P: Partition> {
    tip_count: usize,
    linkage: BranchLengthLinkage,
    slots: Vec<Option<Slot<P>>>,
    active: ActivePartition,
    root: NodeId,
    counter: usize,
    record_count: usize,
    pmatrix_count: usize,

    travbuffer: Vec<NodeId>,
    matrix_indices: Vec<usize>,
    branch_buffer: Vec<f64>,
    operations: Vec<Operation>,
}

impl<P: Partition> TreeInfo<P> {
    /// Creates an empty cache for `tree`. The root is the tree's root handle.
    ///
    /// # Errors
    /// [`Error::InvalidTreeSize`] if `tip_count` does not match the tree,
    /// [`Error::InvalidPartition`] for zero partitions, [`Error::InvalidTree`]
    /// if the tree has no inner root.
    pub fn new<D>(tree: &UTree<D>, options: TreeInfoOptions) -> Result<Self> {
        if options.tip_count != tree.tip_count() {
            return Err(Error::InvalidTreeSize(format!(
                "{} tips requested, tree has {}",
                options.tip_count,
                tree.tip_count()
            )));
        }
        if options.partition_count == 0 {
            return Err(Error::InvalidPartition(0));
        }
        let root = tree
            .root()
            .filter(|&r| tree.is_inner(r))
            .ok_or_else(|| Error::InvalidTree("tree has no inner root".into()))?;
        let pmatrix_count = tree
            .edges()
            .iter()
            .filter_map(|e| tree.pmatrix_index(e.a))
            .max()
            .map_or(0, |max| max + 1);

        Ok(TreeInfo {
            tip_count: options.tip_count,
            linkage: options.brlen_linkage,
            slots: (0..options.partition_count).map(|_| None).collect(),
            active: ActivePartition::All,
            root,
            counter: 0,
            record_count: tree.record_count(),
            pmatrix_count,
            travbuffer: Vec::with_capacity(tree.record_count()),
            matrix_indices: Vec::with_capacity(pmatrix_count),
            branch_buffer: Vec::with_capacity(pmatrix_count),
            operations: Vec::with_capacity(tree.inner_count()),
        })
    }

    /// Attaches `partition` to slot `index`. Every CLV and pmatrix of the
    /// slot starts out stale.
    pub fn init_partition<D>(
        &mut self,
        index: usize,
        mut partition: P,
        alpha: f64,
        param_indices: Vec<usize>,
        symmetries: Option<Vec<i32>>,
        tree: &UTree<D>,
    ) -> Result<()> {
        self.check_tree(tree)?;
        if index >= self.slots.len() {
            return Err(Error::InvalidPartition(index));
        }
        let branch_lengths = match self.linkage {
            BranchLengthLinkage::Linked => Vec::new(),
            BranchLengthLinkage::Unlinked => {
                let mut table = vec![0.0; self.pmatrix_count];
                for (pm, length) in self.edge_matrices(tree)? {
                    table[pm] = length;
                }
                table
            }
        };
        partition.set_alpha(alpha);
        self.slots[index] = Some(Slot {
            partition,
            alpha,
            param_indices,
            symmetries,
            branch_lengths,
            clv_valid: Bitset::zeros(Bitset::words_for(self.record_count)),
            pmatrix_valid: Bitset::zeros(Bitset::words_for(self.pmatrix_count)),
        });
        tracing::debug!(index, alpha, "initialised partition");
        Ok(())
    }

    /// Detaches and returns the partition in slot `index`.
    pub fn remove_partition(&mut self, index: usize) -> Result<P> {
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .map(|slot| slot.partition)
            .ok_or(Error::InvalidPartition(index))
    }

    pub fn set_active_partition(&mut self, active: ActivePartition) -> Result<()> {
        if let ActivePartition::Single(index) = active {
            if index >= self.slots.len() {
                return Err(Error::InvalidPartition(index));
            }
        }
        self.active = active;
        Ok(())
    }

    pub fn active_partition(&self) -> ActivePartition {
        self.active
    }

    pub fn set_root<D>(&mut self, tree: &UTree<D>, root: NodeId) -> Result<()> {
        self.check_tree(tree)?;
        tree.edge(root)?;
        if tree.is_tip(root) {
            return Err(Error::InterchangeLeaf(root));
        }
        self.root = root;
        Ok(())
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn tip_count(&self) -> usize {
        self.tip_count
    }

    pub fn partition_count(&self) -> usize {
        self.slots.len()
    }

    pub fn partition(&self, index: usize) -> Option<&P> {
        self.slot(index).map(|s| &s.partition)
    }

    pub fn partition_mut(&mut self, index: usize) -> Option<&mut P> {
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .map(|s| &mut s.partition)
    }

    pub fn alpha(&self, index: usize) -> Option<f64> {
        self.slot(index).map(|s| s.alpha)
    }

    pub fn param_indices(&self, index: usize) -> Option<&[usize]> {
        self.slot(index).map(|s| s.param_indices.as_slice())
    }

    pub fn symmetries(&self, index: usize) -> Option<&[i32]> {
        self.slot(index).and_then(|s| s.symmetries.as_deref())
    }

    /// Private length table of slot `index`, `None` when lengths are linked.
    pub fn branch_lengths(&self, index: usize) -> Option<&[f64]> {
        match self.linkage {
            BranchLengthLinkage::Linked => None,
            BranchLengthLinkage::Unlinked => self.slot(index).map(|s| s.branch_lengths.as_slice()),
        }
    }

    pub fn clv_valid(&self, index: usize, record: NodeId) -> bool {
        self.slot(index)
            .is_some_and(|s| s.clv_valid.contains(record.0))
    }

    pub fn pmatrix_valid(&self, index: usize, matrix: usize) -> bool {
        self.slot(index)
            .is_some_and(|s| s.pmatrix_valid.contains(matrix))
    }

    /// Number of CLV updates issued so far.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn reset_counter(&mut self) {
        self.counter = 0;
    }

    /// Sets the length of the edge at `edge`.
    ///
    /// Linked lengths are written to the tree and the edge goes stale in
    /// every partition. Unlinked lengths are written to the table of each
    /// active partition, and only those go stale. Either way the four CLVs
    /// reading the edge's pmatrix are invalidated with it.
    pub fn set_branch_length<D>(
        &mut self,
        tree: &mut UTree<D>,
        edge: NodeId,
        length: f64,
    ) -> Result<()> {
        self.check_tree(tree)?;
        let pm = self.matrix_of(tree, edge)?;
        let back = tree.edge(edge)?.b;
        let consumers: Vec<NodeId> = [edge, back]
            .into_iter()
            .filter_map(|x| tree.ring(x))
            .flat_map(|[_, n1, n2]| [n1, n2])
            .collect();

        let scope = match self.linkage {
            BranchLengthLinkage::Linked => {
                tree.set_length(edge, length)?;
                (0..self.slots.len()).collect()
            }
            BranchLengthLinkage::Unlinked => {
                let scope = self.active_slots();
                for &i in &scope {
                    if let Some(slot) = self.slots[i].as_mut() {
                        slot.branch_lengths[pm] = length;
                    }
                }
                scope
            }
        };
        for i in scope {
            if let Some(slot) = self.slots[i].as_mut() {
                slot.pmatrix_valid.clear(pm);
                consumers.iter().for_each(|r| slot.clv_valid.clear(r.0));
            }
        }
        tracing::debug!(%edge, length, linkage = ?self.linkage, "set branch length");
        Ok(())
    }

    /// Changes the rate heterogeneity of slot `index`; all of its state goes
    /// stale.
    pub fn set_alpha(&mut self, index: usize, alpha: f64) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidPartition(index))?;
        slot.alpha = alpha;
        slot.partition.set_alpha(alpha);
        slot.clv_valid.clear_all();
        slot.pmatrix_valid.clear_all();
        tracing::debug!(index, alpha, "set alpha");
        Ok(())
    }

    pub fn invalidate_pmatrix<D>(&mut self, tree: &UTree<D>, edge: NodeId) -> Result<()> {
        self.check_tree(tree)?;
        let pm = self.matrix_of(tree, edge)?;
        for i in self.active_slots() {
            if let Some(slot) = self.slots[i].as_mut() {
                slot.pmatrix_valid.clear(pm);
            }
        }
        Ok(())
    }

    pub fn invalidate_clv(&mut self, record: NodeId) -> Result<()> {
        if record.0 >= self.record_count {
            return Err(Error::InvalidTree(format!("unknown record {record}")));
        }
        for i in self.active_slots() {
            if let Some(slot) = self.slots[i].as_mut() {
                slot.clv_valid.clear(record.0);
            }
        }
        Ok(())
    }

    pub fn invalidate_all(&mut self) {
        for i in self.active_slots() {
            if let Some(slot) = self.slots[i].as_mut() {
                slot.clv_valid.clear_all();
                slot.pmatrix_valid.clear_all();
            }
        }
        tracing::debug!(active = ?self.active, "invalidated all");
    }

    /// Recomputes the stale pmatrices of the active partitions, or all of
    /// them with `update_all`. Returns how many were computed.
    pub fn update_prob_matrices<D>(&mut self, tree: &UTree<D>, update_all: bool) -> Result<usize> {
        self.check_tree(tree)?;
        let matrices = self.edge_matrices(tree)?;
        let mut indices = std::mem::take(&mut self.matrix_indices);
        let mut lengths = std::mem::take(&mut self.branch_buffer);
        let mut updated = 0;

        for i in self.active_slots() {
            let Some(slot) = self.slots[i].as_mut() else {
                continue;
            };
            indices.clear();
            lengths.clear();
            for &(pm, tree_length) in &matrices {
                if update_all || !slot.pmatrix_valid.contains(pm) {
                    indices.push(pm);
                    lengths.push(match self.linkage {
                        BranchLengthLinkage::Linked => tree_length,
                        BranchLengthLinkage::Unlinked => slot.branch_lengths[pm],
                    });
                }
            }
            if !indices.is_empty() {
                slot.partition
                    .update_prob_matrices(&slot.param_indices, &indices, &lengths);
            }
            indices.iter().for_each(|&pm| slot.pmatrix_valid.set(pm));
            updated += indices.len();
        }

        self.matrix_indices = indices;
        self.branch_buffer = lengths;
        tracing::trace!(updated, update_all, "updated pmatrices");
        Ok(updated)
    }

    /// Recomputes the stale CLVs among `travbuffer`, in that order.
    ///
    /// The order must put children before their parents. Returns the number
    /// of CLVs computed.
    pub fn validate_clvs<D>(&mut self, tree: &UTree<D>, travbuffer: &[NodeId]) -> Result<usize> {
        self.check_tree(tree)?;
        if let Some(bad) = travbuffer.iter().find(|id| !tree.contains(**id)) {
            return Err(Error::InvalidTree(format!("unknown record {bad}")));
        }
        let mut computed = 0;
        for i in self.active_slots() {
            computed += self.update_clvs(tree, i, travbuffer, false)?;
        }
        Ok(computed)
    }

    /// Log-likelihood of the tree at the root edge, summed over the active
    /// partitions.
    ///
    /// Incremental evaluation only descends into stale CLVs and refreshes
    /// stale pmatrices. Otherwise every pmatrix and CLV is recomputed.
    #[instrument(level = "debug", skip(self, tree), err)]
    pub fn compute_loglh<D>(&mut self, tree: &UTree<D>, incremental: bool) -> Result<f64> {
        self.check_tree(tree)?;
        let root = self.root;
        let root_edge = tree.edge(root)?;
        let root_pm = self.matrix_of(tree, root)?;
        self.update_prob_matrices(tree, !incremental)?;

        let mut total = 0.0;
        for i in self.active_slots() {
            let mut trav = std::mem::take(&mut self.travbuffer);
            trav.clear();
            if let Some(slot) = self.slots[i].as_ref() {
                if incremental {
                    stale_postorder(tree, root, &slot.clv_valid, &mut trav);
                } else {
                    trav.extend(
                        tree.traverse(root, TraversalOrder::Postorder)
                            .filter(|&x| tree.is_inner(x)),
                    );
                }
            }
            let result = self.update_clvs(tree, i, &trav, !incremental);
            self.travbuffer = trav;
            result?;

            if let Some(slot) = self.slots[i].as_ref() {
                let loglh = edge_loglh(
                    &slot.partition,
                    tree,
                    root_edge.a,
                    root_edge.b,
                    root_pm,
                    &slot.param_indices,
                )?;
                tracing::trace!(partition = i, loglh, "partition log-likelihood");
                total += loglh;
            }
        }
        Ok(total)
    }

    fn update_clvs<D>(
        &mut self,
        tree: &UTree<D>,
        index: usize,
        records: &[NodeId],
        force: bool,
    ) -> Result<usize> {
        let Some(slot) = self.slots[index].as_mut() else {
            return Ok(0);
        };
        let pending = records
            .iter()
            .filter(|&&x| tree.is_inner(x) && (force || !slot.clv_valid.contains(x.0)))
            .map(|&x| operation(tree, x).map(|op| (x, op)))
            .collect::<Result<Vec<_>>>()?;
        if pending.is_empty() {
            return Ok(0);
        }

        self.operations.clear();
        self.operations.extend(pending.iter().map(|(_, op)| *op));
        slot.partition.update_partials(&self.operations);

        for (x, _) in &pending {
            slot.clv_valid.set(x.0);
            // the three records of a node share one CLV buffer
            if let Some([_, n1, n2]) = tree.ring(*x) {
                slot.clv_valid.clear(n1.0);
                slot.clv_valid.clear(n2.0);
            }
        }
        self.counter += pending.len();
        tracing::trace!(partition = index, updated = pending.len(), "updated clvs");
        Ok(pending.len())
    }

    fn slot(&self, index: usize) -> Option<&Slot<P>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn active_slots(&self) -> Vec<usize> {
        match self.active {
            ActivePartition::All => (0..self.slots.len())
                .filter(|&i| self.slots[i].is_some())
                .collect(),
            ActivePartition::Single(i) => self.slot(i).map(|_| i).into_iter().collect(),
        }
    }

    fn check_tree<D>(&self, tree: &UTree<D>) -> Result<()> {
        if tree.record_count() != self.record_count {
            return Err(Error::InvalidTree(format!(
                "tree has {} records, cache was built for {}",
                tree.record_count(),
                self.record_count
            )));
        }
        Ok(())
    }

    fn matrix_of<D>(&self, tree: &UTree<D>, edge: NodeId) -> Result<usize> {
        tree.edge(edge)?;
        tree.pmatrix_index(edge)
            .filter(|&pm| pm < self.pmatrix_count)
            .ok_or_else(|| Error::InvalidTree(format!("edge {edge} has no valid pmatrix index")))
    }

    /// `(pmatrix index, tree length)` of every edge.
    fn edge_matrices<D>(&self, tree: &UTree<D>) -> Result<Vec<(usize, f64)>> {
        tree.edges()
            .iter()
            .map(|e| Ok((self.matrix_of(tree, e.a)?, e.length)))
            .collect()
    }
}

fn operation<D>(tree: &UTree<D>, parent: NodeId) -> Result<Operation> {
    let (c1, c2) = tree
        .children(parent)
        .ok_or_else(|| Error::InvalidTree(format!("node at {parent} is detached")))?;
    Ok(Operation {
        parent_clv: clv_of(tree, parent)?,
        parent_scaler: tree.scaler_index(parent),
        child1_clv: clv_of(tree, c1)?,
        child1_scaler: tree.scaler_index(c1),
        child1_matrix: pmatrix_of(tree, c1)?,
        child2_clv: clv_of(tree, c2)?,
        child2_scaler: tree.scaler_index(c2),
        child2_matrix: pmatrix_of(tree, c2)?,
    })
}

fn clv_of<D>(tree: &UTree<D>, id: NodeId) -> Result<usize> {
    tree.clv_index(id)
        .ok_or_else(|| Error::InvalidTree(format!("unknown record {id}")))
}

fn pmatrix_of<D>(tree: &UTree<D>, id: NodeId) -> Result<usize> {
    tree.pmatrix_index(id)
        .ok_or_else(|| Error::InvalidTree(format!("unknown record {id}")))
}

fn edge_loglh<P: Partition, D>(
    partition: &P,
    tree: &UTree<D>,
    a: NodeId,
    b: NodeId,
    matrix: usize,
    params: &[usize],
) -> Result<f64> {
    Ok(partition.compute_edge_loglikelihood(
        clv_of(tree, a)?,
        tree.scaler_index(a),
        clv_of(tree, b)?,
        tree.scaler_index(b),
        matrix,
        params,
    ))
}

/// Inner records below the edge at `root` whose CLV is stale, children
/// first. Valid CLVs are not descended into.
fn stale_postorder<D>(tree: &UTree<D>, root: NodeId, valid: &Bitset, out: &mut Vec<NodeId>) {
    let mut stack = vec![(root, false)];
    if let Some(back) = tree.back(root) {
        stack.push((back, false));
    }
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            out.push(id);
            continue;
        }
        if valid.contains(id.0) {
            continue;
        }
        if let Some((left, right)) = tree.children(id) {
            stack.push((id, true));
            stack.push((right, false));
            stack.push((left, false));
        }
    }
}

/// Log-likelihood of `tree` for a single partition at the edge `root`,
/// without any caching.
pub fn compute_lk<P: Partition, D>(
    partition: &mut P,
    tree: &UTree<D>,
    root: NodeId,
    params: &[usize],
    update_pmatrices: bool,
    update_partials: bool,
) -> Result<f64> {
    let root_edge = tree.edge(root)?;
    if update_pmatrices {
        let (indices, lengths): (Vec<usize>, Vec<f64>) = tree
            .edges()
            .iter()
            .filter_map(|e| Some((tree.pmatrix_index(e.a)?, e.length)))
            .unzip();
        partition.update_prob_matrices(params, &indices, &lengths);
    }
    if update_partials {
        let operations = tree
            .traverse(root, TraversalOrder::Postorder)
            .filter(|&x| tree.is_inner(x))
            .map(|x| operation(tree, x))
            .collect::<Result<Vec<_>>>()?;
        partition.update_partials(&operations);
    }
    let matrix = pmatrix_of(tree, root)?;
    edge_loglh(partition, tree, root_edge.a, root_edge.b, matrix, params)
}
