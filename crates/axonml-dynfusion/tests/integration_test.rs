//! End-to-end integration tests for the dynamic fusion engine.
//!
//! These tests build workloads from operator graphs, execute them on the
//! reference runtime and compare against naive computations.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use std::collections::BTreeSet;
use std::sync::Arc;

use axonml_dynfusion::{
    bind_tensors, build, ArithmeticOperation, AuxTensorData, ClWorkload, CompositeOperator, ConvolutionMethod,
    Conv2dDescriptor, CpuTensor, DataLayout, DataType, ElementwiseDescriptor, Error, FusionConfig, GpuTarget,
    KernelCache, MemoryType, OpTensor, OpTensorBinding, OperatorGraph, TensorId, TensorInfo, TensorPackMap, UnitWorkloadStage,
    WorkloadContext,
};

// =============================================================================
// Test Helpers
// =============================================================================

struct ConvAddDiv {
    graph: OperatorGraph,
    input: OpTensor,
    weights: OpTensor,
    bias: OpTensor,
    addend: OpTensor,
    divend: OpTensor,
    dst: OpTensor,
}

/// conv2d(1x1, 384 -> 16) + bias, then `+ addend`, then `/ divend`.
fn conv_add_div(method: Option<ConvolutionMethod>) -> ConvAddDiv {
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
    if let Some(method) = method {
        graph.force_conv2d_method(conv, method).unwrap();
    }
    graph.add_op_elementwise_add(acc, addend, sum).unwrap();
    graph
        .add_op_elementwise(ElementwiseDescriptor { op: ArithmeticOperation::Div }, sum, divend, dst)
        .unwrap();

    ConvAddDiv {
        graph,
        input,
        weights,
        bias,
        addend,
        divend,
        dst,
    }
}

fn deterministic(info: TensorInfo, scale: f32, modulo: usize, offset: f32) -> CpuTensor {
    CpuTensor::from_fn(info, |i| ((i % modulo) as f32 + offset) * scale)
}

/// Binds, prepares and runs `workload`.
fn execute(workload: &ClWorkload, op_tensors: &mut OpTensorBinding) {
    execute_with_cache(workload, op_tensors, Arc::new(KernelCache::default()));
}

/// Like [`execute`], with a kernel cache shared between operators.
fn execute_with_cache(workload: &ClWorkload, op_tensors: &mut OpTensorBinding, cache: Arc<KernelCache>) {
    let mut aux = AuxTensorData::new();
    let mut prepare = TensorPackMap::new();
    let mut run = TensorPackMap::new();
    bind_tensors(&mut aux, &mut prepare, &mut run, workload, op_tensors).unwrap();

    let mut op = CompositeOperator::with_cache(cache);
    op.configure(workload).unwrap();
    op.prepare(&prepare, &mut aux, op_tensors).unwrap();
    op.run(&run, &mut aux, op_tensors).unwrap();
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tolerance = 1e-4 * e.abs().max(1.0);
        assert!((a - e).abs() <= tolerance, "element {i}: got {a}, expected {e}");
    }
}

fn run_conv_add_div(method: Option<ConvolutionMethod>) -> ClWorkload {
    let g = conv_add_div(method);
    let mut workload = ClWorkload::new();
    build(&mut workload, &g.graph, &WorkloadContext::default()).unwrap();
    assert!(workload.unit_workloads.len() < 3);

    let input = deterministic(TensorInfo::f32([1, 12, 12, 384]), 0.01, 7, -3.0);
    let weights = deterministic(TensorInfo::f32([1, 1, 384, 16]), 0.02, 5, -2.0);
    let bias = deterministic(TensorInfo::f32([16]), 0.1, 16, 0.0);
    let addend = deterministic(TensorInfo::f32([1, 12, 12, 16]), 1.0, 3, 1.0);
    let divend = deterministic(TensorInfo::f32([1, 12, 12, 16]), 1.0, 4, 1.0);

    // Naive reference: 1x1 convolution is a per-pixel matrix product.
    let mut expected = vec![0.0f32; 144 * 16];
    for p in 0..144 {
        for oc in 0..16 {
            let mut acc = bias.data[oc];
            for ic in 0..384 {
                acc += input.data[p * 384 + ic] * weights.data[ic * 16 + oc];
            }
            let i = p * 16 + oc;
            expected[i] = (acc + addend.data[i]) / divend.data[i];
        }
    }

    let mut op_tensors = OpTensorBinding::new();
    op_tensors.insert(g.input.id(), input);
    op_tensors.insert(g.weights.id(), weights);
    op_tensors.insert(g.bias.id(), bias);
    op_tensors.insert(g.addend.id(), addend);
    op_tensors.insert(g.divend.id(), divend);
    op_tensors.insert(g.dst.id(), CpuTensor::zeros(TensorInfo::f32([1, 12, 12, 16])));

    execute(&workload, &mut op_tensors);
    assert_close(&op_tensors[&g.dst.id()].data, &expected);
    workload
}

// =============================================================================
// End-to-End Scenarios
// =============================================================================

#[test]
fn test_e2e_conv_add_div_direct() {
    let workload = run_conv_add_div(Some(ConvolutionMethod::Direct));
    assert_eq!(workload.unit_workloads.len(), 1);
    let unit = workload.unit_workloads.values().next().unwrap();
    assert_eq!(unit.code.name, "direct_conv2d___eltwise_add___eltwise_div");
    assert_eq!(workload.stats().aux_tensors, 0);
}

#[test]
fn test_e2e_conv_add_div_gemm() {
    let workload = run_conv_add_div(Some(ConvolutionMethod::Gemm));
    assert_eq!(workload.unit_workloads.len(), 2);
    let stages: Vec<UnitWorkloadStage> = workload.unit_workloads.values().map(|u| u.stage).collect();
    assert_eq!(stages, vec![UnitWorkloadStage::Prepare, UnitWorkloadStage::Run]);
}

#[test]
fn test_e2e_conv_add_div_heuristic() {
    // 1x1 conv with many input channels stays on GEMM for G76.
    let workload = run_conv_add_div(None);
    assert_eq!(workload.stats().prepare_units, 1);
}

#[test]
fn test_e2e_broadcast_add() {
    let mut graph = OperatorGraph::new();
    let lhs = graph.add_tensor(TensorInfo::f32([7, 9, 5]));
    let rhs = graph.add_tensor(TensorInfo::f32([7, 1, 1]));
    let dst = graph.add_tensor(TensorInfo::empty());
    graph.add_op_elementwise_add(lhs, rhs, dst).unwrap();
    assert_eq!(graph.tensor_info(dst).shape.dims(), &[7, 9, 5]);

    let mut workload = ClWorkload::new();
    build(&mut workload, &graph, &WorkloadContext::default()).unwrap();
    assert_eq!(workload.unit_workloads.len(), 1);

    let lhs_data = deterministic(TensorInfo::f32([7, 9, 5]), 0.5, 11, 0.0);
    let rhs_data = deterministic(TensorInfo::f32([7, 1, 1]), 100.0, 7, 1.0);
    let expected: Vec<f32> = (0..7 * 9 * 5)
        .map(|i| lhs_data.data[i] + rhs_data.data[i / 45])
        .collect();

    let mut op_tensors = OpTensorBinding::new();
    op_tensors.insert(lhs.id(), lhs_data);
    op_tensors.insert(rhs.id(), rhs_data);
    op_tensors.insert(dst.id(), CpuTensor::zeros(TensorInfo::f32([7, 9, 5])));
    execute(&workload, &mut op_tensors);

    assert_close(&op_tensors[&dst.id()].data, &expected);
}

/// `lhs + rhs` over a `[2, 2]` execution space, unfused.
fn broadcast_add(rhs_shape: [usize; 2]) -> (ClWorkload, OpTensor, OpTensor, OpTensor) {
    let mut graph = OperatorGraph::new();
    let lhs = graph.add_tensor(TensorInfo::f32([2, 2]));
    let rhs = graph.add_tensor(TensorInfo::f32(rhs_shape));
    let dst = graph.add_tensor(TensorInfo::empty());
    graph.add_op_elementwise_add(lhs, rhs, dst).unwrap();

    let mut workload = ClWorkload::new();
    build(&mut workload, &graph, &WorkloadContext::default()).unwrap();
    (workload, lhs, rhs, dst)
}

#[test]
fn test_same_kernel_with_different_broadcasts_in_one_workload() {
    // (a[2,2] + b[2,1]) + d[1,2]: two eltwise_add units with equal dst shape.
    let mut graph = OperatorGraph::new();
    let a = graph.add_tensor(TensorInfo::f32([2, 2]));
    let b = graph.add_tensor(TensorInfo::f32([2, 1]));
    let sum = graph.add_tensor(TensorInfo::empty());
    let d = graph.add_tensor(TensorInfo::f32([1, 2]));
    let dst = graph.add_tensor(TensorInfo::empty());
    graph.add_op_elementwise_add(a, b, sum).unwrap();
    graph.add_op_elementwise_add(sum, d, dst).unwrap();

    let ctx = WorkloadContext::default().fusion(FusionConfig::disabled());
    let mut workload = ClWorkload::new();
    build(&mut workload, &graph, &ctx).unwrap();
    let units: Vec<_> = workload.unit_workloads.values().collect();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].code.name, units[1].code.name);
    assert_ne!(KernelCache::key(&units[0].code), KernelCache::key(&units[1].code));

    let mut op_tensors = OpTensorBinding::new();
    op_tensors.insert(a.id(), CpuTensor::zeros(TensorInfo::f32([2, 2])));
    op_tensors.insert(b.id(), CpuTensor::new(TensorInfo::f32([2, 1]), vec![10.0, 20.0]).unwrap());
    op_tensors.insert(d.id(), CpuTensor::new(TensorInfo::f32([1, 2]), vec![1.0, 2.0]).unwrap());
    op_tensors.insert(dst.id(), CpuTensor::zeros(TensorInfo::f32([2, 2])));

    let cache = Arc::new(KernelCache::default());
    execute_with_cache(&workload, &mut op_tensors, Arc::clone(&cache));
    assert_eq!(cache.len(), 2);
    assert_close(&op_tensors[&dst.id()].data, &[11.0, 12.0, 21.0, 22.0]);
}

#[test]
fn test_shared_cache_across_workloads_with_different_broadcasts() {
    let cache = Arc::new(KernelCache::default());
    let lhs_data = CpuTensor::new(TensorInfo::f32([2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();

    let (column, lhs, rhs, dst) = broadcast_add([2, 1]);
    let mut op_tensors = OpTensorBinding::new();
    op_tensors.insert(lhs.id(), lhs_data.clone());
    op_tensors.insert(rhs.id(), CpuTensor::new(TensorInfo::f32([2, 1]), vec![10.0, 20.0]).unwrap());
    op_tensors.insert(dst.id(), CpuTensor::zeros(TensorInfo::f32([2, 2])));
    execute_with_cache(&column, &mut op_tensors, Arc::clone(&cache));
    assert_close(&op_tensors[&dst.id()].data, &[11.0, 12.0, 23.0, 24.0]);

    let (row, lhs, rhs, dst) = broadcast_add([1, 2]);
    let mut op_tensors = OpTensorBinding::new();
    op_tensors.insert(lhs.id(), lhs_data);
    op_tensors.insert(rhs.id(), CpuTensor::new(TensorInfo::f32([1, 2]), vec![10.0, 20.0]).unwrap());
    op_tensors.insert(dst.id(), CpuTensor::zeros(TensorInfo::f32([2, 2])));
    execute_with_cache(&row, &mut op_tensors, Arc::clone(&cache));
    assert_close(&op_tensors[&dst.id()].data, &[11.0, 22.0, 13.0, 24.0]);

    assert_eq!(cache.len(), 2);
}

#[test]
fn test_unfused_matches_fused() {
    let g = conv_add_div(Some(ConvolutionMethod::Direct));
    let ctx = WorkloadContext::new(GpuTarget::G76).fusion(FusionConfig::disabled());
    let mut workload = ClWorkload::new();
    build(&mut workload, &g.graph, &ctx).unwrap();
    assert_eq!(workload.unit_workloads.len(), 3);
    assert_eq!(workload.stats().aux_tensors, 2);

    let mut op_tensors = OpTensorBinding::new();
    op_tensors.insert(g.input.id(), CpuTensor::filled(TensorInfo::f32([1, 12, 12, 384]), 0.5));
    op_tensors.insert(g.weights.id(), CpuTensor::filled(TensorInfo::f32([1, 1, 384, 16]), 0.25));
    op_tensors.insert(g.bias.id(), CpuTensor::filled(TensorInfo::f32([16]), 2.0));
    op_tensors.insert(g.addend.id(), CpuTensor::filled(TensorInfo::f32([1, 12, 12, 16]), 1.0));
    op_tensors.insert(g.divend.id(), CpuTensor::filled(TensorInfo::f32([1, 12, 12, 16]), 2.0));
    op_tensors.insert(g.dst.id(), CpuTensor::zeros(TensorInfo::f32([1, 12, 12, 16])));
    execute(&workload, &mut op_tensors);

    // (384 * 0.125 + 2 + 1) / 2
    assert_close(&op_tensors[&g.dst.id()].data, &vec![25.5; 144 * 16]);
}

// =============================================================================
// Observable Tensors
// =============================================================================

#[test]
fn test_lut_covers_graph_sources_and_destinations() {
    for method in [ConvolutionMethod::Direct, ConvolutionMethod::Gemm] {
        let g = conv_add_div(Some(method));
        let mut workload = ClWorkload::new();
        build(&mut workload, &g.graph, &WorkloadContext::default()).unwrap();

        let expected: BTreeSet<TensorId> = [g.input, g.weights, g.bias, g.addend, g.divend, g.dst]
            .iter()
            .map(|t| t.id())
            .collect();
        let actual: BTreeSet<TensorId> = workload.op_tensor_id_lut.values().copied().collect();
        assert_eq!(actual, expected);

        for workload_tensor in workload.op_tensor_id_lut.keys() {
            assert_eq!(workload.tensors[workload_tensor].memory_type, MemoryType::Core);
        }
    }
}

#[test]
fn test_validate_is_idempotent() {
    let g = conv_add_div(None);
    assert!(g.graph.validate().is_ok());
    assert!(g.graph.validate().is_ok());

    let mut first = ClWorkload::new();
    let mut second = ClWorkload::new();
    build(&mut first, &g.graph, &WorkloadContext::default()).unwrap();
    build(&mut second, &g.graph, &WorkloadContext::default()).unwrap();
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}

// =============================================================================
// Invalid Graphs
// =============================================================================

fn assert_build_fails(graph: &OperatorGraph) -> Error {
    let mut workload = ClWorkload::new();
    let err = build(&mut workload, graph, &WorkloadContext::default()).unwrap_err();
    assert_eq!(workload.status(), Err(err.clone()));
    err
}

#[test]
fn test_invalid_unsupported_data_type() {
    let mut graph = OperatorGraph::new();
    let info = TensorInfo::new([1, 4, 4, 8], DataType::Qasymm8, DataLayout::Nhwc);
    let input = graph.add_tensor(info.clone());
    let weights = graph.add_tensor(TensorInfo::new([1, 1, 8, 8], DataType::Qasymm8, DataLayout::Nhwc));
    let dst = graph.add_tensor(TensorInfo::empty());
    let _ = graph.add_op_conv2d(Conv2dDescriptor::default(), input, weights, None, dst);
    assert_build_fails(&graph);
}

#[test]
fn test_invalid_nchw_layout() {
    let mut graph = OperatorGraph::new();
    let input = graph.add_tensor(TensorInfo::new([1, 8, 4, 4], DataType::F32, DataLayout::Nchw));
    let weights = graph.add_tensor(TensorInfo::new([8, 8, 1, 1], DataType::F32, DataLayout::Nchw));
    let dst = graph.add_tensor(TensorInfo::empty());
    let _ = graph.add_op_conv2d(Conv2dDescriptor::default(), input, weights, None, dst);
    assert_build_fails(&graph);
}

#[test]
fn test_invalid_two_complex_operators() {
    let mut graph = OperatorGraph::new();
    let input = graph.add_tensor(TensorInfo::f32([1, 4, 4, 8]));
    let weights = graph.add_tensor(TensorInfo::f32([1, 1, 8, 8]));
    let mid = graph.add_tensor(TensorInfo::empty());
    let dst = graph.add_tensor(TensorInfo::empty());
    graph
        .add_op_conv2d(Conv2dDescriptor::default(), input, weights, None, mid)
        .unwrap();
    let err = graph
        .add_op_conv2d(Conv2dDescriptor::default(), mid, weights, None, dst)
        .unwrap_err();
    assert_eq!(err, Error::MultipleComplexOperators);
    assert_eq!(assert_build_fails(&graph), Error::MultipleComplexOperators);
}

#[test]
fn test_invalid_enlarged_execution_space() {
    let mut graph = OperatorGraph::new();
    let lhs = graph.add_tensor(TensorInfo::f32([7, 1, 5]));
    let rhs = graph.add_tensor(TensorInfo::f32([7, 1, 5]));
    let mid = graph.add_tensor(TensorInfo::empty());
    let wide = graph.add_tensor(TensorInfo::f32([7, 9, 5]));
    let dst = graph.add_tensor(TensorInfo::empty());
    graph.add_op_elementwise_add(lhs, rhs, mid).unwrap();
    let _ = graph.add_op_elementwise_add(mid, wide, dst);
    assert!(matches!(assert_build_fails(&graph), Error::ExecutionSpaceChanged { .. }));
}

#[test]
fn test_invalid_complex_and_simple_roots() {
    let mut graph = OperatorGraph::new();
    let input = graph.add_tensor(TensorInfo::f32([1, 4, 4, 8]));
    let weights = graph.add_tensor(TensorInfo::f32([1, 1, 8, 8]));
    let acc = graph.add_tensor(TensorInfo::empty());
    let lhs = graph.add_tensor(TensorInfo::f32([1, 4, 4, 8]));
    let rhs = graph.add_tensor(TensorInfo::f32([1, 4, 4, 8]));
    let other = graph.add_tensor(TensorInfo::empty());
    graph
        .add_op_conv2d(Conv2dDescriptor::default(), input, weights, None, acc)
        .unwrap();
    let _ = graph.add_op_elementwise_add(lhs, rhs, other);
    assert!(matches!(assert_build_fails(&graph), Error::MultipleRoots { .. }));
}

#[test]
fn test_invalid_loop() {
    let mut graph = OperatorGraph::new();
    let a = graph.add_tensor(TensorInfo::f32([4, 4]));
    let b = graph.add_tensor(TensorInfo::f32([4, 4]));
    let c = graph.add_tensor(TensorInfo::empty());
    graph.add_op_elementwise_add(a, b, c).unwrap();
    let err = graph.add_op_elementwise_add(c, b, a).unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));
    assert_eq!(assert_build_fails(&graph), err);
}

#[test]
fn test_unsupported_runtime_type_is_rejected() {
    let mut graph = OperatorGraph::new();
    let info = TensorInfo::new([4, 4], DataType::S32, DataLayout::Nhwc);
    let lhs = graph.add_tensor(info.clone());
    let rhs = graph.add_tensor(info);
    let dst = graph.add_tensor(TensorInfo::empty());
    graph.add_op_elementwise_add(lhs, rhs, dst).unwrap();

    let mut workload = ClWorkload::new();
    build(&mut workload, &graph, &WorkloadContext::default()).unwrap();
    let err = CompositeOperator::new().configure(&workload).unwrap_err();
    assert!(matches!(err, Error::NotImplemented { .. }));
}
