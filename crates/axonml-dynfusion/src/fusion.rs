//! Kernel Fusion - Greedy Merging of Kernel Groups
//!
//! The kernel graph is partitioned into fusion groups, one kernel each at
//! first. Groups connected by a tensor are merged pairwise while the merge
//! keeps the group graph acyclic, keeps a single complex kernel at the root
//! of each group, and keeps every kernel of a group on the same stage and
//! execution space.
//!
//! Group ids reuse the id of the kernel that started the group, and the
//! group graph's tensors are kernel tensor ids.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::config::FusionConfig;
use crate::dependency_graph::DependencyGraph;
use crate::error::{Error, Result};
use crate::id::{OperatorId, TensorId};
use crate::kernel::ClKernel;
use crate::kernel_graph::ClKernelGraph;
use crate::operator_graph::Complexity;

// =============================================================================
// Fusion Group
// =============================================================================

/// A connected set of kernels emitted as a single kernel.
#[derive(Debug, Clone)]
pub(crate) struct ClKernelFusionGroup {
    id: OperatorId,
    graph: DependencyGraph,
}

impl ClKernelFusionGroup {
    fn new(id: OperatorId) -> Self {
        Self {
            id,
            graph: DependencyGraph::new(),
        }
    }

    fn add_kernel(&mut self, kernel_graph: &ClKernelGraph, kernel: OperatorId) -> Result<()> {
        let deps = kernel_graph.graph();
        self.graph
            .add_operator_with_id(deps.src_tensors(kernel), deps.dst_tensors(kernel), kernel)
    }

    /// Kernels in the group's own topological order.
    pub(crate) fn kernels(&self) -> Result<Vec<OperatorId>> {
        Ok(self.graph.topological_sort()?.into_iter().map(|p| p.op).collect())
    }

    /// The anchor kernel: the one that started the group. Merges always keep
    /// the producer group, so it stays the root.
    pub(crate) fn root_kernel(&self) -> OperatorId {
        self.id
    }

    pub(crate) fn number_of_kernels(&self) -> usize {
        self.graph.number_of_ops()
    }
}

// =============================================================================
// Fused Kernel Graph
// =============================================================================

/// The kernel graph partitioned into fusion groups.
#[derive(Debug, Clone)]
pub(crate) struct ClFusedKernelGraph<'a> {
    original: &'a ClKernelGraph,
    fg_dependency: DependencyGraph,
    groups: BTreeMap<OperatorId, ClKernelFusionGroup>,
}

impl<'a> ClFusedKernelGraph<'a> {
    /// One group per kernel, inserted in kernel topological order.
    pub(crate) fn init(kernel_graph: &'a ClKernelGraph) -> Result<Self> {
        let mut fused = Self {
            original: kernel_graph,
            fg_dependency: DependencyGraph::new(),
            groups: BTreeMap::new(),
        };
        for pack in kernel_graph.graph().topological_sort()? {
            let mut group = ClKernelFusionGroup::new(pack.op);
            group.add_kernel(kernel_graph, pack.op)?;
            fused
                .fg_dependency
                .add_operator_with_id(&pack.inputs, &pack.outputs, pack.op)?;
            fused.groups.insert(pack.op, group);
        }
        Ok(fused)
    }

    /// Groups in dependency order.
    pub(crate) fn sorted_groups(&self) -> Result<Vec<&ClKernelFusionGroup>> {
        Ok(self
            .fg_dependency
            .topological_sort()?
            .into_iter()
            .filter_map(|pack| self.groups.get(&pack.op))
            .collect())
    }

    /// Kernel tensors read by a group from outside of it.
    pub(crate) fn group_src_tensors(&self, group: &ClKernelFusionGroup) -> &[TensorId] {
        self.fg_dependency.src_tensors(group.id)
    }

    /// Kernel tensors a group must write to memory.
    pub(crate) fn group_dst_tensors(&self, group: &ClKernelFusionGroup) -> &[TensorId] {
        self.fg_dependency.dst_tensors(group.id)
    }

    pub(crate) fn kernel(&self, id: OperatorId) -> &'a ClKernel {
        self.original.kernel(id)
    }

    pub(crate) fn number_of_groups(&self) -> usize {
        self.groups.len()
    }

    fn group(&self, id: OperatorId) -> Result<&ClKernelFusionGroup> {
        self.groups
            .get(&id)
            .ok_or_else(|| Error::internal(format!("unknown fusion group {id}")))
    }

    /// Orders two adjacent groups as (producer, consumer).
    fn orient(&self, g0: OperatorId, g1: OperatorId) -> Result<(OperatorId, OperatorId)> {
        if self.fg_dependency.dst_ops(g0).contains(&g1) {
            Ok((g0, g1))
        } else if self.fg_dependency.dst_ops(g1).contains(&g0) {
            Ok((g1, g0))
        } else {
            Err(Error::fusion(format!("groups {g0} and {g1} are not directly connected")))
        }
    }

    /// Checks whether two groups can be merged.
    pub(crate) fn can_fuse(&self, g0: OperatorId, g1: OperatorId, config: &FusionConfig) -> Result<()> {
        let (src_id, dst_id) = self.orient(g0, g1)?;
        let src = self.group(src_id)?;
        let dst = self.group(dst_id)?;

        // Another path from the producer to the consumer would end up both
        // before and after the merged group.
        for &tensor in self.fg_dependency.dst_tensors(src_id) {
            for &consumer in self.fg_dependency.dst_ops_from_tensor(tensor) {
                if consumer != dst_id && self.fg_dependency.path_exists_from_op_to_op(consumer, dst_id) {
                    return Err(Error::fusion(format!(
                        "fusing {src_id} and {dst_id} would create a cycle through {consumer}"
                    )));
                }
            }
        }

        let dst_root = self.kernel(dst.root_kernel());
        if dst_root.complexity() != Complexity::Simple {
            return Err(Error::fusion(format!(
                "group {dst_id} is anchored by complex kernel {}",
                dst_root.id
            )));
        }

        let src_root_id = src.root_kernel();
        let src_root = self.kernel(src_root_id);
        let stage = src_root.config.stage;
        let expected = &self.original.tensor(src_root.kind.dst()).info.shape;
        for kernel_id in src.kernels()?.into_iter().chain(dst.kernels()?) {
            let kernel = self.kernel(kernel_id);
            if kernel.config.stage != stage {
                return Err(Error::fusion(format!("kernel {kernel_id} runs in a different stage")));
            }
            if kernel_id != src_root_id {
                let shape = &self.original.tensor(kernel.kind.dst()).info.shape;
                if shape != expected {
                    return Err(Error::fusion(format!(
                        "kernel {kernel_id} writes {shape}, group root writes {expected}"
                    )));
                }
            }
        }

        if let Some(max) = config.max_kernels_per_group {
            let merged = src.number_of_kernels() + dst.number_of_kernels();
            if merged > max {
                return Err(Error::fusion(format!(
                    "merged group would hold {merged} kernels, limit is {max}"
                )));
            }
        }
        Ok(())
    }

    /// Merges two adjacent groups into the producer group.
    pub(crate) fn fuse(&mut self, g0: OperatorId, g1: OperatorId) -> Result<()> {
        let (src_id, dst_id) = self.orient(g0, g1)?;
        let dst = self
            .groups
            .remove(&dst_id)
            .ok_or_else(|| Error::internal(format!("unknown fusion group {dst_id}")))?;

        let dst_inputs = self.fg_dependency.src_tensors(dst_id).to_vec();
        let dst_outputs = self.fg_dependency.dst_tensors(dst_id).to_vec();
        let intermediates: Vec<TensorId> = self
            .fg_dependency
            .dst_tensors(src_id)
            .iter()
            .copied()
            .filter(|t| dst_inputs.contains(t))
            .collect();

        let original = self.original;
        let src = self
            .groups
            .get_mut(&src_id)
            .ok_or_else(|| Error::internal(format!("unknown fusion group {src_id}")))?;
        for kernel in dst.kernels()? {
            src.add_kernel(original, kernel)?;
        }

        self.fg_dependency.remove_operator(dst_id);
        for tensor in dst_inputs.into_iter().filter(|t| !intermediates.contains(t)) {
            self.fg_dependency.insert_tensor(tensor);
            if !self.fg_dependency.are_connected(src_id, tensor) {
                self.fg_dependency.link_input(src_id, tensor)?;
            }
        }
        for tensor in dst_outputs {
            self.fg_dependency.insert_tensor(tensor);
            self.fg_dependency.link_output(src_id, tensor)?;
        }
        for tensor in intermediates {
            if self.fg_dependency.dst_ops_from_tensor(tensor).is_empty() {
                self.fg_dependency.unlink_output(src_id, tensor);
                self.fg_dependency.remove_tensor(tensor);
            } else {
                trace!(tensor = %tensor, "intermediate kept as group output");
            }
        }

        debug!(src = %src_id, dst = %dst_id, "fused kernel groups");
        Ok(())
    }

    /// Greedily fuses groups until no legal pair remains. Returns the number
    /// of fusions performed.
    pub(crate) fn fuse_all(&mut self, config: &FusionConfig) -> Result<usize> {
        if !config.enabled {
            return Ok(0);
        }
        let mut fusions = 0;
        'outer: while self.groups.len() > 1 {
            let order: Vec<OperatorId> = self.fg_dependency.topological_sort()?.into_iter().map(|p| p.op).collect();
            for (i, &g0) in order.iter().enumerate() {
                for &g1 in &order[i + 1..] {
                    match self.can_fuse(g0, g1, config) {
                        Ok(()) => {
                            self.fuse(g0, g1)?;
                            fusions += 1;
                            continue 'outer;
                        }
                        Err(e) => trace!(g0 = %g0, g1 = %g1, reason = %e, "cannot fuse"),
                    }
                }
            }
            break;
        }
        Ok(fusions)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkloadContext;
    use crate::heuristics::ConvolutionMethod;
    use crate::operator_graph::{Conv2dDescriptor, OperatorGraph};
    use crate::tensor::TensorInfo;

    fn lower(graph: &OperatorGraph) -> ClKernelGraph {
        ClKernelGraph::lower(graph, &WorkloadContext::default()).unwrap()
    }

    fn conv_add_div(method: ConvolutionMethod) -> OperatorGraph {
        let mut graph = OperatorGraph::new();
        let input = graph.add_tensor(TensorInfo::f32([1, 12, 12, 384]));
        let weights = graph.add_tensor(TensorInfo::f32([1, 1, 384, 16]));
        let bias = graph.add_tensor(TensorInfo::f32([16]));
        let acc = graph.add_tensor(TensorInfo::empty());
        let addend = graph.add_tensor(TensorInfo::f32([1, 12, 12, 16]));
        let sum = graph.add_tensor(TensorInfo::empty());
        let divend = graph.add_tensor(TensorInfo::f32([1, 12, 12, 16]));
        let dst = graph.add_tensor(TensorInfo::empty());
        let conv = graph
            .add_op_conv2d(Conv2dDescriptor::default(), input, weights, Some(bias), acc)
            .unwrap();
        graph.force_conv2d_method(conv, method).unwrap();
        graph.add_op_elementwise_add(acc, addend, sum).unwrap();
        graph
            .add_op_elementwise(
                crate::operator_graph::ElementwiseDescriptor {
                    op: crate::operator_graph::ArithmeticOperation::Div,
                },
                sum,
                divend,
                dst,
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_chain_fuses_into_one_group() {
        let graph = conv_add_div(ConvolutionMethod::Direct);
        let kg = lower(&graph);
        let mut fused = ClFusedKernelGraph::init(&kg).unwrap();
        assert_eq!(fused.number_of_groups(), 3);

        assert_eq!(fused.fuse_all(&FusionConfig::default()).unwrap(), 2);
        assert_eq!(fused.number_of_groups(), 1);

        let group = fused.sorted_groups().unwrap()[0];
        assert_eq!(group.number_of_kernels(), 3);
        // conv inputs + addend + divend in, final result out.
        assert_eq!(fused.group_src_tensors(group).len(), 5);
        assert_eq!(fused.group_dst_tensors(group).len(), 1);
    }

    #[test]
    fn test_prepare_stage_stays_separate() {
        let graph = conv_add_div(ConvolutionMethod::Gemm);
        let kg = lower(&graph);
        let mut fused = ClFusedKernelGraph::init(&kg).unwrap();
        fused.fuse_all(&FusionConfig::default()).unwrap();
        assert_eq!(fused.number_of_groups(), 2);

        let groups = fused.sorted_groups().unwrap();
        let first = fused.kernel(groups[0].root_kernel());
        assert_eq!(first.config.stage, crate::kernel::UnitWorkloadStage::Prepare);
        assert_eq!(groups[1].number_of_kernels(), 3);
    }

    #[test]
    fn test_complex_consumer_cannot_be_fused() {
        let graph = conv_add_div(ConvolutionMethod::Gemm);
        let kg = lower(&graph);
        let fused = ClFusedKernelGraph::init(&kg).unwrap();
        let order: Vec<OperatorId> = fused.sorted_groups().unwrap().iter().map(|g| g.id).collect();
        // reshape -> gemm: the consumer is complex.
        let err = fused.can_fuse(order[0], order[1], &FusionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::FusionIllegal { .. }));
        // reshape and the add are not adjacent.
        assert!(fused.can_fuse(order[0], order[2], &FusionConfig::default()).is_err());
    }

    #[test]
    fn test_disabled_and_limited_fusion() {
        let graph = conv_add_div(ConvolutionMethod::Direct);
        let kg = lower(&graph);

        let mut fused = ClFusedKernelGraph::init(&kg).unwrap();
        assert_eq!(fused.fuse_all(&FusionConfig::disabled()).unwrap(), 0);
        assert_eq!(fused.number_of_groups(), 3);

        let mut limited = ClFusedKernelGraph::init(&kg).unwrap();
        limited
            .fuse_all(&FusionConfig::new().max_kernels_per_group(2))
            .unwrap();
        assert_eq!(limited.number_of_groups(), 2);
    }

    #[test]
    fn test_shared_intermediate_stays_an_output() {
        // s feeds both later adds: the first fusion keeps it as a group
        // output, the second one drops it.
        let mut graph = OperatorGraph::new();
        let a = graph.add_tensor(TensorInfo::f32([2, 4]));
        let b = graph.add_tensor(TensorInfo::f32([2, 4]));
        let s = graph.add_tensor(TensorInfo::empty());
        let c = graph.add_tensor(TensorInfo::f32([2, 4]));
        let d0 = graph.add_tensor(TensorInfo::empty());
        let d1 = graph.add_tensor(TensorInfo::empty());
        graph.add_op_elementwise_add(a, b, s).unwrap();
        graph.add_op_elementwise_add(s, c, d0).unwrap();
        graph.add_op_elementwise_add(s, d0, d1).unwrap();

        let kg = lower(&graph);
        let mut fused = ClFusedKernelGraph::init(&kg).unwrap();
        fused.fuse_all(&FusionConfig::default()).unwrap();
        assert_eq!(fused.number_of_groups(), 1);
        let group = fused.sorted_groups().unwrap()[0];
        assert_eq!(fused.group_dst_tensors(group).len(), 1);
        assert_eq!(fused.group_src_tensors(group).len(), 3);
    }
}
