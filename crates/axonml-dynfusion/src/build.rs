//! Build - Operator Graph to Workload
//!
//! The single entry point of the engine. [`build`] runs validation, kernel
//! lowering, fusion and code generation in sequence and stops at the first
//! failure, which is also recorded as the workload status.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::blueprint::ClKernelBlueprint;
use crate::config::WorkloadContext;
use crate::error::{Error, Result};
use crate::fusion::ClFusedKernelGraph;
use crate::id::TensorId;
use crate::kernel::ClKernelKind;
use crate::kernel_graph::ClKernelGraph;
use crate::operator_graph::OperatorGraph;
use crate::workload::ClWorkload;

// =============================================================================
// Entry Point
// =============================================================================

/// Builds `workload` from `op_graph`.
///
/// The workload is reset first. On failure it is left partially built and
/// `workload.status` holds the returned error.
///
/// # Example
/// ```
/// use axonml_dynfusion::{build, ClWorkload, OperatorGraph, TensorInfo, WorkloadContext};
///
/// let mut graph = OperatorGraph::new();
/// let lhs = graph.add_tensor(TensorInfo::f32([7, 9, 5]));
/// let rhs = graph.add_tensor(TensorInfo::f32([7, 1, 1]));
/// let dst = graph.add_tensor(TensorInfo::empty());
/// graph.add_op_elementwise_add(lhs, rhs, dst).unwrap();
///
/// let mut workload = ClWorkload::new();
/// build(&mut workload, &graph, &WorkloadContext::default()).unwrap();
/// assert_eq!(workload.unit_workloads.len(), 1);
/// assert_eq!(workload.op_tensor_id_lut.len(), 3);
/// ```
pub fn build(workload: &mut ClWorkload, op_graph: &OperatorGraph, ctx: &WorkloadContext) -> Result<()> {
    *workload = ClWorkload::new();
    workload.context = *ctx;

    let result = build_workload(workload, op_graph, ctx);
    if let Err(err) = &result {
        warn!(error = %err, "workload build failed");
        workload.status = Some(err.clone());
    }
    result
}

fn build_workload(workload: &mut ClWorkload, op_graph: &OperatorGraph, ctx: &WorkloadContext) -> Result<()> {
    op_graph.validate()?;

    let kernel_graph = ClKernelGraph::lower(op_graph, ctx)?;
    let mut fused = ClFusedKernelGraph::init(&kernel_graph)?;
    let fusions = fused.fuse_all(&ctx.fusion)?;
    debug!(
        kernels = kernel_graph.number_of_kernels(),
        groups = fused.number_of_groups(),
        fusions,
        "fused kernel graph"
    );

    generate(workload, &fused, &kernel_graph, ctx)?;
    build_op_tensor_id_lut(workload, op_graph, &kernel_graph)?;

    debug!(stats = %workload.stats(), "built workload");
    Ok(())
}

// =============================================================================
// Code Generation
// =============================================================================

/// Emits one unit workload per fusion group, in group order.
fn generate(
    workload: &mut ClWorkload,
    fused: &ClFusedKernelGraph<'_>,
    kernel_graph: &ClKernelGraph,
    ctx: &WorkloadContext,
) -> Result<()> {
    for group in fused.sorted_groups()? {
        let mut bp = ClKernelBlueprint::new();
        let tensor = |bp: &mut ClKernelBlueprint, t: TensorId| bp.add_tensor(kernel_graph.tensor(t).info.clone(), Some(t));

        for kernel_id in group.kernels()? {
            match &fused.kernel(kernel_id).kind {
                ClKernelKind::DirectConv2d {
                    desc,
                    src,
                    weights,
                    bias,
                    dst,
                } => {
                    let src = tensor(&mut bp, *src);
                    let weights = tensor(&mut bp, *weights);
                    let bias = bias.map(|b| tensor(&mut bp, b));
                    let dst = tensor(&mut bp, *dst);
                    bp.add_kcomp_direct_conv2d(*desc, src, weights, bias, dst)?;
                }
                ClKernelKind::GemmConv2d {
                    desc,
                    src,
                    weights,
                    bias,
                    dst,
                    geometry,
                } => {
                    let src = tensor(&mut bp, *src);
                    let weights = tensor(&mut bp, *weights);
                    let bias = bias.map(|b| tensor(&mut bp, b));
                    let dst = tensor(&mut bp, *dst);
                    bp.add_kcomp_gemm_conv2d(*desc, src, weights, bias, dst, *geometry)?;
                }
                ClKernelKind::ReshapeWeights { src, dst, geometry } => {
                    let src = tensor(&mut bp, *src);
                    let dst = tensor(&mut bp, *dst);
                    bp.add_kcomp_reshape_weights(src, dst, *geometry)?;
                }
                ClKernelKind::Elementwise { desc, lhs, rhs, dst } => {
                    let lhs = tensor(&mut bp, *lhs);
                    let rhs = tensor(&mut bp, *rhs);
                    let dst = tensor(&mut bp, *dst);
                    bp.add_kcomp_eltwise_op(desc.op, lhs, rhs, dst)?;
                }
            }
        }

        let root = fused.kernel(group.root_kernel());
        bp.set_tile_info(root.config.tile_desc);

        for &dst in fused.group_dst_tensors(group) {
            let info = kernel_graph.tensor(dst).info.clone();
            let tile = bp.add_tensor(info.clone(), Some(dst));
            let stored = bp.add_tensor(info, None);
            bp.update_merge_point(stored, dst)?;
            bp.add_kcomp_store(root.config.store_type, tile, stored)?;
        }

        let code = bp.build(ctx)?;

        let group_src = fused.group_src_tensors(group);
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut bindings = BTreeMap::new();
        for arg in &code.arguments {
            let kernel_tensor = bp
                .merge_point_of(TensorId::new(arg.arg_id))
                .ok_or_else(|| Error::codegen(format!("argument {} is not bound to a kernel tensor", arg.arg_id)))?;
            let kt = kernel_graph.tensor(kernel_tensor);
            let id = workload.add_workload_tensor(kt.info.clone(), kt.memory_type, kt.memory_info, *arg, kernel_tensor);
            bindings.insert(arg.arg_id, id);
            if group_src.contains(&kernel_tensor) {
                inputs.push(id);
            } else {
                outputs.push(id);
            }
        }

        let stage = root.config.stage;
        let name = code.name.clone();
        let unit = workload.add_unit_workload(stage, code, &inputs, &outputs, bindings)?;
        debug!(
            unit = %unit,
            kernel = %name,
            stage = ?stage,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "generated unit workload"
        );
    }
    Ok(())
}

/// Maps every core workload tensor back to its operator tensor:
/// operator tensor, then kernel tensor, then workload tensor.
fn build_op_tensor_id_lut(workload: &mut ClWorkload, op_graph: &OperatorGraph, kernel_graph: &ClKernelGraph) -> Result<()> {
    let deps = op_graph.dependency_graph();
    let chain = kernel_graph.graph().merge_points().compose(workload.merge_points());

    let globals = deps.global_src_tensors().into_iter().chain(deps.global_dst_tensors());
    for op_tensor in globals {
        if deps.src_ops_from_tensor(op_tensor).is_empty() && deps.dst_ops_from_tensor(op_tensor).is_empty() {
            continue;
        }
        let workload_tensor = chain
            .get(op_tensor)
            .ok_or_else(|| Error::internal(format!("operator tensor {op_tensor} has no workload tensor")))?;
        workload.op_tensor_id_lut.insert(workload_tensor, op_tensor);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
