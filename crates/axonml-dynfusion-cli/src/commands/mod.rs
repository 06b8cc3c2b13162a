//! Commands - CLI Command Implementations
//!
//! Implementations of the dynfusion commands and the helpers they share.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

pub mod build;
pub mod inspect;
pub mod run;

use axonml_dynfusion::ClWorkload;
use colored::Colorize;
use tracing::info;

use crate::cli::GraphArgs;
use crate::config::{load_graph, LoadedGraph};
use crate::error::CliResult;

// =============================================================================
// Workload Construction
// =============================================================================

/// Load the graph named by `args` and build its workload
pub fn build_workload(args: &GraphArgs) -> CliResult<(LoadedGraph, ClWorkload)> {
    let (config, loaded) = load_graph(args)?;
    let ctx = config.context(args);
    let mut workload = ClWorkload::new();
    axonml_dynfusion::build(&mut workload, &loaded.graph, &ctx)?;
    info!(
        graph = %args.graph.display(),
        target = %ctx.target(),
        units = workload.unit_workloads.len(),
        "built workload"
    );
    Ok((loaded, workload))
}

// =============================================================================
// Output Formatting
// =============================================================================

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a header
pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
    println!();
}

/// Print a key-value pair
pub fn print_kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}
