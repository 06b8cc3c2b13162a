//! CLI - Command Line Argument Definitions
//!
//! Defines the argument structure of the dynfusion tool using clap.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::path::PathBuf;

use axonml_dynfusion::GpuTarget;
use clap::{Args, Parser, Subcommand};

// =============================================================================
// Main CLI Structure
// =============================================================================

/// Dynfusion - fuse operator graphs into GPU kernel workloads
#[derive(Parser, Debug)]
#[command(name = "dynfusion")]
#[command(author = "AutomataNexus Development Team")]
#[command(version)]
#[command(about = "Fuse operator graphs into GPU kernel workloads", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a graph and emit its kernel sources or the JSON workload
    Build(BuildArgs),

    /// Summarize the unit workloads of a graph
    Inspect(InspectArgs),

    /// Execute a graph on the reference CPU runtime
    Run(RunArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

/// Arguments selecting a graph and the build context
#[derive(Args, Debug, Clone)]
pub struct GraphArgs {
    /// Path to the graph description (TOML)
    pub graph: PathBuf,

    /// GPU target, overrides the one in the graph description
    #[arg(short, long)]
    pub target: Option<GpuTarget>,

    /// Keep one kernel per unit workload
    #[arg(long)]
    pub no_fusion: bool,

    /// Upper bound on kernels fused into one unit workload
    #[arg(long)]
    pub max_group: Option<usize>,
}

// =============================================================================
// Command Arguments
// =============================================================================

/// Arguments for the `build` command
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Graph selection
    #[command(flatten)]
    pub graph: GraphArgs,

    /// Emit the workload as JSON instead of kernel sources
    #[arg(long)]
    pub json: bool,

    /// Write the output to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the `inspect` command
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Graph selection
    #[command(flatten)]
    pub graph: GraphArgs,

    /// Also list build options and kernel arguments
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for the `run` command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Graph selection
    #[command(flatten)]
    pub graph: GraphArgs,

    /// Seed of the generated input values
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Number of run-stage invocations
    #[arg(short = 'n', long, default_value = "1")]
    pub iterations: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build_args() {
        let cli = Cli::parse_from(["dynfusion", "build", "graph.toml", "--target", "g71", "--json"]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.graph.target, Some(GpuTarget::G71));
                assert!(args.json);
                assert!(args.output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::parse_from(["dynfusion", "-v", "run", "graph.toml"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.seed, 42);
                assert_eq!(args.iterations, 1);
                assert!(!args.graph.no_fusion);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
