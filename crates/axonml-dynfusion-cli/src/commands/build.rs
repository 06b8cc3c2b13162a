//! Build - Kernel Generation Command
//!
//! Builds a graph description and emits the generated kernel sources, or the
//! whole workload as JSON.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt::Write as _;

use axonml_dynfusion::{ClUnitWorkload, ClWorkload};

use super::{build_workload, print_success};
use crate::cli::BuildArgs;
use crate::error::CliResult;

// =============================================================================
// Execute Command
// =============================================================================

/// Execute the `build` command
pub fn execute(args: BuildArgs) -> CliResult<()> {
    let (_, workload) = build_workload(&args.graph)?;

    let output = if args.json {
        workload.to_json()?
    } else {
        render_sources(&workload)
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, output)?;
            print_success(&format!(
                "Wrote {} unit workloads to {}",
                workload.unit_workloads.len(),
                path.display()
            ));
        }
        None => print!("{output}"),
    }
    Ok(())
}

// =============================================================================
// Rendering
// =============================================================================

/// Concatenate the kernel sources of every unit workload, in id order
fn render_sources(workload: &ClWorkload) -> String {
    let mut out = String::new();
    for unit in workload.unit_workloads.values() {
        render_unit(&mut out, unit);
    }
    out
}

fn render_unit(out: &mut String, unit: &ClUnitWorkload) {
    let _ = writeln!(out, "// unit {} ({:?}): {}", unit.id, unit.stage, unit.code.name);
    let _ = writeln!(out, "// config: {}", unit.code.config_id);
    let options: Vec<&str> = unit.code.build_options.iter().map(String::as_str).collect();
    let _ = writeln!(out, "// options: {}", options.join(" "));
    out.push_str(&unit.code.code);
    if !unit.code.code.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
}

// =============================================================================
// Tests
// =============================================================================
