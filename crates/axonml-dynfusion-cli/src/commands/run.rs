//! Run - Reference Execution Command
//!
//! Builds a graph, binds deterministic inputs and executes the workload on
//! the CPU reference runtime, then prints statistics of every output.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::time::Instant;

use axonml_dynfusion::{
    bind_tensors, AuxTensorData, ClWorkload, CompositeOperator, CpuTensor, OpTensorBinding, TensorId,
    TensorPackMap,
};
use tracing::debug;

use super::{build_workload, print_header, print_kv, print_success};
use crate::cli::RunArgs;
use crate::config::LoadedGraph;
use crate::error::{CliError, CliResult};

// =============================================================================
// Execute Command
// =============================================================================

/// Execute the `run` command
pub fn execute(args: RunArgs) -> CliResult<()> {
    if args.iterations == 0 {
        return Err(CliError::InvalidArgument("iterations must be at least 1".to_string()));
    }

    let (loaded, workload) = build_workload(&args.graph)?;
    let mut op_tensors = bind_inputs(&loaded, &workload, args.seed)?;

    let mut operator = CompositeOperator::new();
    operator.configure(&workload)?;

    let mut aux = AuxTensorData::new();
    let mut prepare_packs = TensorPackMap::new();
    let mut run_packs = TensorPackMap::new();
    bind_tensors(&mut aux, &mut prepare_packs, &mut run_packs, &workload, &op_tensors)?;

    let start = Instant::now();
    operator.prepare(&prepare_packs, &mut aux, &mut op_tensors)?;
    let prepare_time = start.elapsed();

    let start = Instant::now();
    for iteration in 0..args.iterations {
        debug!(iteration, "running workload");
        operator.run(&run_packs, &mut aux, &mut op_tensors)?;
    }
    let run_time = start.elapsed() / args.iterations as u32;

    print_success(&format!(
        "Executed {} unit workloads on the reference runtime",
        operator.number_of_units()
    ));
    print_kv("Prepare", &format!("{prepare_time:.2?}"));
    print_kv("Run (mean)", &format!("{run_time:.2?}"));
    print_kv("Auxiliary memory", &format!("{} bytes", aux.total_bytes()));

    print_header("Outputs");
    for (id, tensor) in &op_tensors {
        if !loaded.outputs.contains(id) {
            continue;
        }
        let stats = OutputStats::of(&tensor.data);
        print_kv(
            loaded.name_of(*id).unwrap_or("?"),
            &format!(
                "shape {} min {:.6} max {:.6} mean {:.6} sum {:.6}",
                tensor.info.shape, stats.min, stats.max, stats.mean, stats.sum
            ),
        );
    }
    Ok(())
}

// =============================================================================
// Input Generation
// =============================================================================

/// Allocate every graph tensor the workload reads or writes. Outputs start
/// zeroed, everything else gets seeded values in [-1, 1).
fn bind_inputs(loaded: &LoadedGraph, workload: &ClWorkload, seed: u64) -> CliResult<OpTensorBinding> {
    let mut bindings = OpTensorBinding::new();
    for &id in workload.op_tensor_id_lut.values() {
        let handle = loaded
            .handle(id)
            .ok_or_else(|| CliError::Config(format!("Workload refers to undeclared tensor {id}")))?;
        let info = loaded.graph.tensor_info(handle).clone();
        let tensor = if loaded.outputs.contains(&id) {
            CpuTensor::zeros(info)
        } else {
            CpuTensor::from_fn(info, |i| seeded_value(seed, id, i))
        };
        bindings.insert(id, tensor);
    }
    Ok(bindings)
}

/// SplitMix64 of the seed, tensor id and element index, mapped to [-1, 1)
fn seeded_value(seed: u64, tensor: TensorId, index: usize) -> f32 {
    let mut z = seed
        .wrapping_add((tensor.raw() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add((index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    ((z >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct OutputStats {
    min: f32,
    max: f32,
    mean: f32,
    sum: f32,
}

impl OutputStats {
    fn of(data: &[f32]) -> Self {
        if data.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                sum: 0.0,
            };
        }
        let sum: f32 = data.iter().sum();
        Self {
            min: data.iter().copied().fold(f32::INFINITY, f32::min),
            max: data.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            mean: sum / data.len() as f32,
            sum,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
