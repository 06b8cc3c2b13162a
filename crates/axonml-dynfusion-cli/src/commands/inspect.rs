//! Inspect - Workload Inspection Command
//!
//! Displays the unit workloads and tensors of a built graph.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use axonml_dynfusion::{ClUnitWorkload, ClWorkload, MemoryType};
use colored::Colorize;

use super::{build_workload, print_header, print_kv};
use crate::cli::InspectArgs;
use crate::config::LoadedGraph;
use crate::error::CliResult;

// =============================================================================
// Execute Command
// =============================================================================

/// Execute the `inspect` command
pub fn execute(args: InspectArgs) -> CliResult<()> {
    let (loaded, workload) = build_workload(&args.graph)?;

    print_header("Workload");
    print_kv("Graph", &args.graph.graph.display().to_string());
    print_kv("Target", &workload.context.target().to_string());
    print_kv("Operators", &loaded.graph.number_of_ops().to_string());
    print_kv("Summary", &workload.stats().to_string());

    print_header("Unit Workloads");
    for unit in workload.unit_workloads.values() {
        print_unit(unit, args.detailed);
    }

    print_header("Tensors");
    print_tensors(&workload, &loaded);
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn print_unit(unit: &ClUnitWorkload, detailed: bool) {
    println!(
        "  {} {} {}",
        unit.id.to_string().cyan().bold(),
        format!("[{:?}]", unit.stage).yellow(),
        unit.code.name
    );
    let window = &unit.code.window;
    print_kv(
        "  window",
        &format!(
            "{} x {} x {}",
            window.x.num_iterations(),
            window.y.num_iterations(),
            window.z.num_iterations()
        ),
    );
    print_kv("  inputs", &join_ids(&unit.inputs));
    print_kv("  outputs", &join_ids(&unit.outputs));

    if detailed {
        print_kv("  config", &unit.code.config_id);
        for option in &unit.code.build_options {
            println!("      {option}");
        }
        for (arg_id, tensor) in &unit.bindings {
            print_kv(&format!("  arg {arg_id}"), &tensor.to_string());
        }
    }
}

fn print_tensors(workload: &ClWorkload, loaded: &LoadedGraph) {
    for tensor in workload.tensors.values() {
        let kind = match tensor.memory_type {
            MemoryType::Core => {
                let op_tensor = workload.op_tensor_id_lut.get(&tensor.id);
                let name = op_tensor.and_then(|id| loaded.name_of(*id)).unwrap_or("?");
                format!("core ({name})")
            }
            MemoryType::Auxiliary => format!("auxiliary, {} bytes", tensor.info.total_size()),
        };
        print_kv(
            &tensor.id.to_string(),
            &format!("{} {} {}", tensor.info.shape, tensor.info.data_type.name(), kind),
        );
    }
}

fn join_ids<T: ToString>(ids: &[T]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
