//! Kernel Graph - Lowering Operators to Kernels
//!
//! Each operator of an [`OperatorGraph`] becomes one or more [`ClKernel`]s.
//! Kernel tensors are created through merge points keyed by the operator
//! tensor ids, so a tensor shared by several operators maps to a single
//! kernel tensor.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::config::WorkloadContext;
use crate::dependency_graph::DependencyGraph;
use crate::error::Result;
use crate::heuristics::{select_conv_method, ConvolutionMethod};
use crate::id::{OperatorId, TensorId};
use crate::kernel::{conv_tile, eltwise_tile, ClKernel, ClKernelConfig, ClKernelKind, TileDescriptor};
use crate::operator_graph::{OperatorContent, OperatorGraph, WeightsGeometry};
use crate::tensor::{Shape, Size2D, TensorInfo};

// =============================================================================
// Memory Descriptors
// =============================================================================

/// Ownership class of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemoryType {
    /// Source or destination of the whole operator graph; provided by the user.
    Core,
    /// Internal to the workload; allocated by the runtime.
    Auxiliary,
}

/// How long an auxiliary tensor must stay alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum AuxMemoryLifetime {
    /// Only for the duration of one run.
    #[default]
    Temporary,
    /// Across runs, written once in the prepare stage.
    Persistent,
    /// Only during the prepare stage.
    Prepare,
}

/// Allocation request of an auxiliary tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AuxMemoryInfo {
    /// Lifetime.
    pub lifetime: AuxMemoryLifetime,
    /// Size in bytes.
    pub size: usize,
    /// Alignment in bytes.
    pub alignment: usize,
}

impl AuxMemoryInfo {
    /// Default alignment in bytes.
    pub const DEFAULT_ALIGNMENT: usize = 64;

    /// Creates a request with the default alignment.
    pub fn new(lifetime: AuxMemoryLifetime, size: usize) -> Self {
        Self {
            lifetime,
            size,
            alignment: Self::DEFAULT_ALIGNMENT,
        }
    }
}

impl Default for AuxMemoryInfo {
    fn default() -> Self {
        Self::new(AuxMemoryLifetime::Temporary, 0)
    }
}

/// A tensor of the kernel graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ClKernelTensor {
    /// Kernel tensor id.
    pub id: TensorId,
    /// Shape, data type and layout.
    pub info: TensorInfo,
    /// Ownership class.
    pub memory_type: MemoryType,
    /// Allocation request; meaningful for auxiliary tensors only.
    pub memory_info: AuxMemoryInfo,
}

// =============================================================================
// Kernel Graph
// =============================================================================

#[derive(Debug, Clone, Default)]
pub(crate) struct ClKernelGraph {
    graph: DependencyGraph,
    kernels: BTreeMap<OperatorId, ClKernel>,
    tensors: BTreeMap<TensorId, ClKernelTensor>,
}

impl ClKernelGraph {
    /// Lowers every operator of `op_graph`, in topological order.
    pub(crate) fn lower(op_graph: &OperatorGraph, ctx: &WorkloadContext) -> Result<Self> {
        let mut kg = Self::default();
        let deps = op_graph.dependency_graph();
        let global_src = deps.global_src_tensors();
        let global_dst = deps.global_dst_tensors();

        let tensor = |kg: &mut Self, op_tensor: TensorId| {
            let info = op_graph.info(op_tensor).clone();
            if global_src.contains(&op_tensor) || global_dst.contains(&op_tensor) {
                kg.add_kernel_tensor(info, MemoryType::Core, AuxMemoryInfo::default(), Some(op_tensor))
            } else {
                let memory_info = AuxMemoryInfo::new(AuxMemoryLifetime::Temporary, info.total_size());
                kg.add_kernel_tensor(info, MemoryType::Auxiliary, memory_info, Some(op_tensor))
            }
        };

        for pack in deps.topological_sort()? {
            match op_graph.operator(pack.op) {
                OperatorContent::Conv2d {
                    desc,
                    input,
                    weights,
                    bias,
                    dst,
                    forced_method,
                } => {
                    let src_info = op_graph.info(*input);
                    let weights_info = op_graph.info(*weights);
                    let dst_info = op_graph.info(*dst);
                    let method = forced_method.unwrap_or_else(|| {
                        select_conv_method(src_info, weights_info, dst_info, desc, ctx.target())
                    });
                    debug!(op = %pack.op, method = %method, forced = forced_method.is_some(), "selected convolution method");

                    let src = tensor(&mut kg, *input);
                    let w = tensor(&mut kg, *weights);
                    let b = bias.map(|b| tensor(&mut kg, b));
                    let d = tensor(&mut kg, *dst);
                    let tile = conv_tile(dst_info);

                    match method {
                        ConvolutionMethod::Direct => {
                            let kind = ClKernelKind::DirectConv2d {
                                desc: *desc,
                                src,
                                weights: w,
                                bias: b,
                                dst: d,
                            };
                            kg.add_kernel(ClKernelConfig::run(tile), kind)?;
                        }
                        ConvolutionMethod::Gemm => {
                            let geometry = WeightsGeometry::of(weights_info, src_info.data_layout);
                            let reshaped_info = TensorInfo::new(
                                Shape::new(&[geometry.ofm, geometry.reduction_size()]),
                                weights_info.data_type,
                                weights_info.data_layout,
                            );
                            let reshaped_size = reshaped_info.total_size();
                            let reshaped = kg.add_kernel_tensor(
                                reshaped_info,
                                MemoryType::Auxiliary,
                                AuxMemoryInfo::new(AuxMemoryLifetime::Persistent, reshaped_size),
                                None,
                            );
                            let reshape_tile = TileDescriptor {
                                tile_dims: Size2D::new(1, 1),
                                boundaries: Size2D::new(geometry.reduction_size(), geometry.ofm),
                                ..TileDescriptor::default()
                            };
                            kg.add_kernel(
                                ClKernelConfig::prepare(reshape_tile),
                                ClKernelKind::ReshapeWeights {
                                    src: w,
                                    dst: reshaped,
                                    geometry,
                                },
                            )?;
                            kg.add_kernel(
                                ClKernelConfig::run(tile),
                                ClKernelKind::GemmConv2d {
                                    desc: *desc,
                                    src,
                                    weights: reshaped,
                                    bias: b,
                                    dst: d,
                                    geometry,
                                },
                            )?;
                        }
                    }
                }
                OperatorContent::Elementwise { desc, lhs, rhs, dst } => {
                    let l = tensor(&mut kg, *lhs);
                    let r = tensor(&mut kg, *rhs);
                    let d = tensor(&mut kg, *dst);
                    let tile = eltwise_tile(op_graph.info(*dst));
                    let kind = ClKernelKind::Elementwise {
                        desc: *desc,
                        lhs: l,
                        rhs: r,
                        dst: d,
                    };
                    kg.add_kernel(ClKernelConfig::run(tile), kind)?;
                }
            }
        }

        debug!(
            kernels = kg.kernels.len(),
            tensors = kg.tensors.len(),
            "lowered operator graph"
        );
        Ok(kg)
    }

    fn add_kernel_tensor(
        &mut self,
        info: TensorInfo,
        memory_type: MemoryType,
        memory_info: AuxMemoryInfo,
        merge_point: Option<TensorId>,
    ) -> TensorId {
        let id = self.graph.add_tensor(merge_point);
        self.tensors.entry(id).or_insert(ClKernelTensor {
            id,
            info,
            memory_type,
            memory_info,
        });
        id
    }

    /// Validates and links a kernel.
    fn add_kernel(&mut self, config: ClKernelConfig, kind: ClKernelKind) -> Result<OperatorId> {
        let probe = ClKernel {
            id: OperatorId::new(crate::id::EMPTY_ID),
            config,
            kind,
        };
        probe.validate(|t| &self.tensors[&t].info)?;

        let id = self.graph.add_operator(&probe.kind.inputs(), &[probe.kind.dst()])?;
        debug!(kernel = %id, name = %probe.kind.name(), stage = ?config.stage, "added kernel");
        self.kernels.insert(id, ClKernel { id, ..probe });
        Ok(id)
    }

    pub(crate) fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub(crate) fn kernel(&self, id: OperatorId) -> &ClKernel {
        &self.kernels[&id]
    }

    pub(crate) fn tensor(&self, id: TensorId) -> &ClKernelTensor {
        &self.tensors[&id]
    }

    pub(crate) fn number_of_kernels(&self) -> usize {
        self.kernels.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
