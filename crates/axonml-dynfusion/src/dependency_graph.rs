//! Dependency Graph - Bipartite Tensor/Operator Graph
//!
//! The graph structure shared by every stage of the fusion pipeline. Tensor
//! nodes and operator nodes alternate: an operator reads input tensors and
//! writes output tensors, a tensor is written by producers and read by
//! consumers.
//!
//! # Key Features
//! - Acyclicity verified on every operator insertion
//! - Deterministic Kahn topological sort
//! - Merge points: an external id can be bound to an internal tensor so
//!   graphs built by different stages agree on tensor identity
//!
//! Looking up an id that was never allocated is a caller bug and panics.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::id::{IdAllocator, OperatorId, TensorId};

// =============================================================================
// Merge Points
// =============================================================================

/// Injective table from external tensor ids to the tensor ids of one graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergePoints {
    map: BTreeMap<TensorId, TensorId>,
}

impl MergePoints {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Internal tensor bound to `external`, if any.
    pub fn get(&self, external: TensorId) -> Option<TensorId> {
        self.map.get(&external).copied()
    }

    /// Returns whether `external` is bound.
    pub fn contains(&self, external: TensorId) -> bool {
        self.map.contains_key(&external)
    }

    /// Binds `external` to `internal`, replacing any previous binding.
    pub fn bind(&mut self, external: TensorId, internal: TensorId) {
        self.map.insert(external, internal);
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates `(external, internal)` pairs in external id order.
    pub fn iter(&self) -> impl Iterator<Item = (TensorId, TensorId)> + '_ {
        self.map.iter().map(|(&k, &v)| (k, v))
    }

    /// Chains two tables: `external -> self -> next`.
    pub fn compose(&self, next: &MergePoints) -> MergePoints {
        let map = self
            .map
            .iter()
            .filter_map(|(&external, &mid)| next.get(mid).map(|internal| (external, internal)))
            .collect();
        MergePoints { map }
    }
}

// =============================================================================
// Operator Pack
// =============================================================================

/// One entry of a topological sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpPack {
    /// The operator.
    pub op: OperatorId,
    /// Its input tensors, in link order.
    pub inputs: Vec<TensorId>,
    /// Its output tensors, in link order.
    pub outputs: Vec<TensorId>,
}

// =============================================================================
// Dependency Graph
// =============================================================================

/// Bipartite directed graph of tensors and operators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    #[serde(skip)]
    tensor_ids: IdAllocator,
    #[serde(skip)]
    operator_ids: IdAllocator,
    /// Operator to its input tensors.
    adj_src_tensors: BTreeMap<OperatorId, Vec<TensorId>>,
    /// Operator to its output tensors.
    adj_dst_tensors: BTreeMap<OperatorId, Vec<TensorId>>,
    /// Tensor to the operators producing it.
    adj_src_ops: BTreeMap<TensorId, Vec<OperatorId>>,
    /// Tensor to the operators consuming it.
    adj_dst_ops: BTreeMap<TensorId, Vec<OperatorId>>,
    merge_points: MergePoints,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Tensors
    // -------------------------------------------------------------------------

    /// Adds a tensor.
    ///
    /// With a merge point that is already bound the bound tensor is returned
    /// and nothing is allocated, so repeated calls are idempotent.
    pub fn add_tensor(&mut self, merge_point: Option<TensorId>) -> TensorId {
        if let Some(external) = merge_point {
            if let Some(existing) = self.merge_points.get(external) {
                return existing;
            }
            let id = self.insert_new_tensor();
            self.merge_points.bind(external, id);
            id
        } else {
            self.insert_new_tensor()
        }
    }

    /// Inserts a tensor with a caller-chosen id. Used by graphs that mirror the
    /// ids of another graph. Inserting an existing id is a no-op.
    pub fn insert_tensor(&mut self, id: TensorId) {
        self.tensor_ids.reserve(id.0);
        self.adj_src_ops.entry(id).or_default();
        self.adj_dst_ops.entry(id).or_default();
    }

    fn insert_new_tensor(&mut self) -> TensorId {
        let id = TensorId(self.tensor_ids.alloc());
        self.adj_src_ops.insert(id, Vec::new());
        self.adj_dst_ops.insert(id, Vec::new());
        id
    }

    /// Removes a tensor and every edge touching it. Merge points bound to it
    /// are left dangling.
    pub fn remove_tensor(&mut self, tensor: TensorId) {
        assert!(self.tensor_exists(tensor), "unknown tensor {tensor}");
        for op in self.adj_src_ops.remove(&tensor).unwrap_or_default() {
            if let Some(outputs) = self.adj_dst_tensors.get_mut(&op) {
                outputs.retain(|&t| t != tensor);
            }
        }
        for op in self.adj_dst_ops.remove(&tensor).unwrap_or_default() {
            if let Some(inputs) = self.adj_src_tensors.get_mut(&op) {
                inputs.retain(|&t| t != tensor);
            }
        }
    }

    /// Rebinds an existing merge point to `tensor`.
    pub fn update_merge_point(&mut self, tensor: TensorId, merge_point: TensorId) -> Result<()> {
        if !self.merge_points.contains(merge_point) {
            return Err(Error::UnknownMergePoint {
                merge_point: merge_point.raw(),
            });
        }
        self.merge_points.bind(merge_point, tensor);
        Ok(())
    }

    /// The merge point table of this graph.
    pub fn merge_points(&self) -> &MergePoints {
        &self.merge_points
    }

    // -------------------------------------------------------------------------
    // Operators
    // -------------------------------------------------------------------------

    /// Adds an operator reading `inputs` and writing `outputs`.
    ///
    /// The whole graph is re-sorted afterwards. If that finds a cycle the
    /// error is returned but the new edges stay in place: the graph must be
    /// discarded by the caller.
    pub fn add_operator(&mut self, inputs: &[TensorId], outputs: &[TensorId]) -> Result<OperatorId> {
        self.check_links(inputs, outputs)?;
        let op = OperatorId(self.operator_ids.alloc());
        self.link_operator(op, inputs, outputs);
        self.topological_sort()?;
        Ok(op)
    }

    /// Adds an operator with a caller-chosen id, inserting any tensor that is
    /// not yet part of the graph. Used by graphs that mirror another graph.
    pub fn add_operator_with_id(
        &mut self,
        inputs: &[TensorId],
        outputs: &[TensorId],
        op: OperatorId,
    ) -> Result<()> {
        if self.operator_exists(op) {
            return Err(Error::InvalidLink {
                message: format!("operator {op} already exists"),
            });
        }
        for &tensor in inputs.iter().chain(outputs) {
            self.insert_tensor(tensor);
        }
        self.check_links(inputs, outputs)?;
        self.operator_ids.reserve(op.0);
        self.link_operator(op, inputs, outputs);
        self.topological_sort()?;
        Ok(())
    }

    fn check_links(&self, inputs: &[TensorId], outputs: &[TensorId]) -> Result<()> {
        for &tensor in inputs.iter().chain(outputs) {
            if !self.tensor_exists(tensor) {
                return Err(Error::InvalidLink {
                    message: format!("tensor {tensor} does not exist"),
                });
            }
        }
        if let Some(both) = inputs.iter().find(|t| outputs.contains(t)) {
            return Err(Error::InvalidLink {
                message: format!("tensor {both} cannot be both an input and an output of one operator"),
            });
        }
        let mut seen = FxHashSet::default();
        if let Some(dup) = inputs.iter().chain(outputs).find(|t| !seen.insert(**t)) {
            return Err(Error::InvalidLink {
                message: format!("tensor {dup} is linked twice"),
            });
        }
        for &tensor in outputs {
            self.check_single_producer(tensor)?;
        }
        Ok(())
    }

    /// A tensor has at most one producer.
    fn check_single_producer(&self, tensor: TensorId) -> Result<()> {
        match self.src_ops_from_tensor(tensor).first() {
            Some(producer) => Err(Error::InvalidLink {
                message: format!("tensor {tensor} is already produced by {producer}"),
            }),
            None => Ok(()),
        }
    }

    fn link_operator(&mut self, op: OperatorId, inputs: &[TensorId], outputs: &[TensorId]) {
        self.adj_src_tensors.insert(op, Vec::new());
        self.adj_dst_tensors.insert(op, Vec::new());
        for &tensor in inputs {
            self.push_input(op, tensor);
        }
        for &tensor in outputs {
            self.push_output(op, tensor);
        }
    }

    fn push_input(&mut self, op: OperatorId, tensor: TensorId) {
        self.adj_src_tensors.entry(op).or_default().push(tensor);
        self.adj_dst_ops.entry(tensor).or_default().push(op);
    }

    fn push_output(&mut self, op: OperatorId, tensor: TensorId) {
        self.adj_dst_tensors.entry(op).or_default().push(tensor);
        self.adj_src_ops.entry(tensor).or_default().push(op);
    }

    /// Links `tensor` as a new input of an existing operator.
    pub fn link_input(&mut self, op: OperatorId, tensor: TensorId) -> Result<()> {
        assert!(self.operator_exists(op), "unknown operator {op}");
        if !self.tensor_exists(tensor) {
            return Err(Error::InvalidLink {
                message: format!("tensor {tensor} does not exist"),
            });
        }
        if self.are_connected(op, tensor) {
            return Err(Error::InvalidLink {
                message: format!("tensor {tensor} is already linked to {op}"),
            });
        }
        self.push_input(op, tensor);
        Ok(())
    }

    /// Links `tensor` as a new output of an existing operator.
    pub fn link_output(&mut self, op: OperatorId, tensor: TensorId) -> Result<()> {
        assert!(self.operator_exists(op), "unknown operator {op}");
        if !self.tensor_exists(tensor) {
            return Err(Error::InvalidLink {
                message: format!("tensor {tensor} does not exist"),
            });
        }
        if self.are_connected(op, tensor) {
            return Err(Error::InvalidLink {
                message: format!("tensor {tensor} is already linked to {op}"),
            });
        }
        self.check_single_producer(tensor)?;
        self.push_output(op, tensor);
        Ok(())
    }

    /// Removes the edge between `op` and its output `tensor`.
    pub fn unlink_output(&mut self, op: OperatorId, tensor: TensorId) {
        if let Some(outputs) = self.adj_dst_tensors.get_mut(&op) {
            outputs.retain(|&t| t != tensor);
        }
        if let Some(producers) = self.adj_src_ops.get_mut(&tensor) {
            producers.retain(|&o| o != op);
        }
    }

    /// Removes an operator and its edges. Tensors left without any producer
    /// or consumer are removed as well.
    pub fn remove_operator(&mut self, op: OperatorId) {
        assert!(self.operator_exists(op), "unknown operator {op}");
        let inputs = self.adj_src_tensors.remove(&op).unwrap_or_default();
        let outputs = self.adj_dst_tensors.remove(&op).unwrap_or_default();

        for tensor in &inputs {
            if let Some(consumers) = self.adj_dst_ops.get_mut(tensor) {
                consumers.retain(|&o| o != op);
            }
        }
        for tensor in &outputs {
            if let Some(producers) = self.adj_src_ops.get_mut(tensor) {
                producers.retain(|&o| o != op);
            }
        }
        for tensor in inputs.into_iter().chain(outputs) {
            if self.src_ops_from_tensor(tensor).is_empty() && self.dst_ops_from_tensor(tensor).is_empty() {
                self.adj_src_ops.remove(&tensor);
                self.adj_dst_ops.remove(&tensor);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Traversal
    // -------------------------------------------------------------------------

    /// Sorts operators so that every operator follows all of its producers.
    ///
    /// Kahn's algorithm. Operators with no producer are seeded in ascending id
    /// order; afterwards successors are enqueued FIFO in the order their edges
    /// were linked. A cycle leaves operators unsorted and is reported as
    /// [`Error::CycleDetected`].
    pub fn topological_sort(&self) -> Result<Vec<OpPack>> {
        let mut in_degree: BTreeMap<OperatorId, usize> = BTreeMap::new();
        let mut queue: VecDeque<OperatorId> = VecDeque::new();

        for (&op, inputs) in &self.adj_src_tensors {
            let degree = inputs
                .iter()
                .map(|t| self.src_ops_from_tensor(*t).len())
                .sum::<usize>();
            in_degree.insert(op, degree);
            if degree == 0 {
                queue.push_back(op);
            }
        }

        let mut sorted = Vec::with_capacity(in_degree.len());
        while let Some(op) = queue.pop_front() {
            sorted.push(OpPack {
                op,
                inputs: self.src_tensors(op).to_vec(),
                outputs: self.dst_tensors(op).to_vec(),
            });
            for tensor in self.dst_tensors(op) {
                for next in self.dst_ops_from_tensor(*tensor) {
                    if let Some(degree) = in_degree.get_mut(next) {
                        if *degree > 0 {
                            *degree -= 1;
                            if *degree == 0 {
                                queue.push_back(*next);
                            }
                        }
                    }
                }
            }
        }

        if sorted.len() != self.number_of_ops() {
            return Err(Error::CycleDetected {
                sorted: sorted.len(),
                total: self.number_of_ops(),
            });
        }
        Ok(sorted)
    }

    /// Returns whether a chain of edges leads from `tensor` to `op`.
    pub fn path_exists_from_tensor_to_op(&self, tensor: TensorId, op: OperatorId) -> bool {
        let mut visited = FxHashSet::default();
        let mut stack: Vec<OperatorId> = self.dst_ops_from_tensor(tensor).to_vec();
        while let Some(current) = stack.pop() {
            if current == op {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for t in self.dst_tensors(current) {
                stack.extend_from_slice(self.dst_ops_from_tensor(*t));
            }
        }
        false
    }

    /// Returns whether a chain of edges leads from `from` to `to`. An operator
    /// always reaches itself.
    pub fn path_exists_from_op_to_op(&self, from: OperatorId, to: OperatorId) -> bool {
        if from == to {
            return true;
        }
        self.dst_tensors(from)
            .iter()
            .any(|t| self.path_exists_from_tensor_to_op(*t, to))
    }

    // -------------------------------------------------------------------------
    // Per-node queries
    // -------------------------------------------------------------------------

    /// Input tensors of `op`.
    pub fn src_tensors(&self, op: OperatorId) -> &[TensorId] {
        &self.adj_src_tensors[&op]
    }

    /// Output tensors of `op`.
    pub fn dst_tensors(&self, op: OperatorId) -> &[TensorId] {
        &self.adj_dst_tensors[&op]
    }

    /// Operators producing `tensor`.
    pub fn src_ops_from_tensor(&self, tensor: TensorId) -> &[OperatorId] {
        &self.adj_src_ops[&tensor]
    }

    /// Operators consuming `tensor`.
    pub fn dst_ops_from_tensor(&self, tensor: TensorId) -> &[OperatorId] {
        &self.adj_dst_ops[&tensor]
    }

    /// Operators producing any input of `op`, without duplicates.
    pub fn src_ops(&self, op: OperatorId) -> Vec<OperatorId> {
        let mut ops = Vec::new();
        for tensor in self.src_tensors(op) {
            for &producer in self.src_ops_from_tensor(*tensor) {
                if !ops.contains(&producer) {
                    ops.push(producer);
                }
            }
        }
        ops
    }

    /// Operators consuming any output of `op`, without duplicates.
    pub fn dst_ops(&self, op: OperatorId) -> Vec<OperatorId> {
        let mut ops = Vec::new();
        for tensor in self.dst_tensors(op) {
            for &consumer in self.dst_ops_from_tensor(*tensor) {
                if !ops.contains(&consumer) {
                    ops.push(consumer);
                }
            }
        }
        ops
    }

    /// Returns whether `tensor` is an input or an output of `op`.
    pub fn are_connected(&self, op: OperatorId, tensor: TensorId) -> bool {
        self.src_tensors(op).contains(&tensor) || self.dst_tensors(op).contains(&tensor)
    }

    /// Returns whether the tensor exists.
    pub fn tensor_exists(&self, tensor: TensorId) -> bool {
        self.adj_src_ops.contains_key(&tensor)
    }

    /// Returns whether the operator exists.
    pub fn operator_exists(&self, op: OperatorId) -> bool {
        self.adj_src_tensors.contains_key(&op)
    }

    // -------------------------------------------------------------------------
    // Whole-graph queries
    // -------------------------------------------------------------------------

    /// All operators, ascending.
    pub fn all_ops(&self) -> Vec<OperatorId> {
        self.adj_src_tensors.keys().copied().collect()
    }

    /// All tensors, ascending.
    pub fn all_tensors(&self) -> Vec<TensorId> {
        self.adj_src_ops.keys().copied().collect()
    }

    /// Number of operators.
    pub fn number_of_ops(&self) -> usize {
        self.adj_src_tensors.len()
    }

    /// Number of tensors.
    pub fn number_of_tensors(&self) -> usize {
        self.adj_src_ops.len()
    }

    /// Tensors without a producer.
    pub fn global_src_tensors(&self) -> Vec<TensorId> {
        self.adj_src_ops
            .iter()
            .filter(|(_, producers)| producers.is_empty())
            .map(|(&t, _)| t)
            .collect()
    }

    /// Tensors without a consumer.
    pub fn global_dst_tensors(&self) -> Vec<TensorId> {
        self.adj_dst_ops
            .iter()
            .filter(|(_, consumers)| consumers.is_empty())
            .map(|(&t, _)| t)
            .collect()
    }

    /// Tensors with both a producer and a consumer.
    pub fn intermediate_tensors(&self) -> Vec<TensorId> {
        self.adj_src_ops
            .iter()
            .filter(|(t, producers)| !producers.is_empty() && !self.adj_dst_ops[*t].is_empty())
            .map(|(&t, _)| t)
            .collect()
    }

    /// Operators whose inputs are not produced by any operator.
    pub fn root_ops(&self) -> Vec<OperatorId> {
        self.adj_src_tensors
            .keys()
            .copied()
            .filter(|&op| self.src_ops(op).is_empty())
            .collect()
    }

    /// Operators whose outputs are not consumed by any operator.
    pub fn leaf_ops(&self) -> Vec<OperatorId> {
        self.adj_dst_tensors
            .keys()
            .copied()
            .filter(|&op| self.dst_ops(op).is_empty())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
