//! Config - Graph Description Files
//!
//! Parses TOML graph descriptions and turns them into operator graphs.
//!
//! ```toml
//! target = "g76"
//!
//! [fusion]
//! enabled = true
//!
//! [[tensors]]
//! name = "input"
//! shape = [1, 12, 12, 384]
//!
//! [[tensors]]
//! name = "acc"
//!
//! [[operators]]
//! type = "conv2d"
//! input = "input"
//! weights = "weights"
//! dst = "acc"
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use axonml_dynfusion::{
    ArithmeticOperation, Conv2dDescriptor, ConvolutionMethod, DataLayout, DataType, ElementwiseDescriptor,
    FusionConfig, GpuTarget, OpTensor, OperatorGraph, Padding2D, TensorId, TensorInfo, WorkloadContext,
};
use serde::{Deserialize, Serialize};

use crate::cli::GraphArgs;
use crate::error::{CliError, CliResult};

// =============================================================================
// Graph Description
// =============================================================================

/// Graph description (graph.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// GPU target the kernels are generated for
    #[serde(default)]
    pub target: GpuTarget,

    /// Fusion settings
    #[serde(default)]
    pub fusion: FusionSection,

    /// Tensors, in creation order
    #[serde(default)]
    pub tensors: Vec<TensorSpec>,

    /// Operators, in insertion order
    #[serde(default)]
    pub operators: Vec<OperatorSpec>,
}

/// Fusion settings of a graph description
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionSection {
    /// Run the fusion pass
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upper bound on kernels per fused group
    #[serde(default)]
    pub max_kernels_per_group: Option<usize>,
}

impl Default for FusionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_kernels_per_group: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A named tensor. Tensors without a shape are inferred by their producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Unique name
    pub name: String,

    /// Dimensions, outermost first
    #[serde(default)]
    pub shape: Vec<usize>,

    /// Element type
    #[serde(default)]
    pub dtype: DataType,

    /// Memory layout
    #[serde(default)]
    pub layout: DataLayout,
}

/// An operator referring to tensors by name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperatorSpec {
    /// 2D convolution
    Conv2d {
        /// Input activations
        input: String,
        /// Weights, HWIO
        weights: String,
        /// Optional bias
        #[serde(default)]
        bias: Option<String>,
        /// Output
        dst: String,
        /// Padding as [top, right, bottom, left]
        #[serde(default)]
        pad: [usize; 4],
        /// Stride as [x, y]
        #[serde(default = "unit_pair")]
        stride: [usize; 2],
        /// Dilation as [x, y]
        #[serde(default = "unit_pair")]
        dilation: [usize; 2],
        /// Force an implementation instead of the heuristic
        #[serde(default)]
        method: Option<ConvolutionMethod>,
    },
    /// Elementwise binary operation
    Elementwise {
        /// Arithmetic kind
        op: ArithmeticOperation,
        /// Left operand
        lhs: String,
        /// Right operand
        rhs: String,
        /// Output
        dst: String,
    },
}

fn unit_pair() -> [usize; 2] {
    [1, 1]
}

impl GraphConfig {
    /// Load a graph description from a file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse a graph description from TOML text
    pub fn parse(content: &str) -> CliResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.check_names()?;
        Ok(config)
    }

    /// Build context, with command line overrides applied
    pub fn context(&self, args: &GraphArgs) -> WorkloadContext {
        let mut fusion = if self.fusion.enabled && !args.no_fusion {
            FusionConfig::new()
        } else {
            FusionConfig::disabled()
        };
        if let Some(max) = args.max_group.or(self.fusion.max_kernels_per_group) {
            fusion = fusion.max_kernels_per_group(max);
        }
        WorkloadContext::new(args.target.unwrap_or(self.target)).fusion(fusion)
    }

    /// Create the operator graph. Operator errors are left in the graph
    /// status so that `build` reports them.
    pub fn to_graph(&self) -> CliResult<LoadedGraph> {
        let mut graph = OperatorGraph::new();
        let mut tensors = BTreeMap::new();
        for spec in &self.tensors {
            let info = TensorInfo::new(spec.shape.as_slice(), spec.dtype, spec.layout);
            tensors.insert(spec.name.clone(), graph.add_tensor(info));
        }

        let lookup = |name: &str| -> CliResult<OpTensor> {
            tensors
                .get(name)
                .copied()
                .ok_or_else(|| CliError::Config(format!("Unknown tensor '{name}'")))
        };

        let mut outputs = BTreeSet::new();
        for spec in &self.operators {
            match spec {
                OperatorSpec::Conv2d {
                    input,
                    weights,
                    bias,
                    dst,
                    pad,
                    stride,
                    dilation,
                    method,
                } => {
                    let desc = Conv2dDescriptor::default()
                        .pad(Padding2D::new(pad[0], pad[1], pad[2], pad[3]))
                        .stride(stride[0], stride[1])
                        .dilation(dilation[0], dilation[1]);
                    let bias = bias.as_deref().map(lookup).transpose()?;
                    let dst = lookup(dst)?;
                    outputs.insert(dst.id());
                    if let Ok(op) = graph.add_op_conv2d(desc, lookup(input)?, lookup(weights)?, bias, dst) {
                        if let Some(method) = method {
                            graph.force_conv2d_method(op, *method)?;
                        }
                    }
                }
                OperatorSpec::Elementwise { op, lhs, rhs, dst } => {
                    let dst = lookup(dst)?;
                    outputs.insert(dst.id());
                    let _ = graph.add_op_elementwise(ElementwiseDescriptor { op: *op }, lookup(lhs)?, lookup(rhs)?, dst);
                }
            }
        }

        Ok(LoadedGraph {
            graph,
            tensors,
            outputs,
        })
    }

    fn check_names(&self) -> CliResult<()> {
        let mut seen = BTreeSet::new();
        for tensor in &self.tensors {
            if !seen.insert(tensor.name.as_str()) {
                return Err(CliError::Config(format!("Duplicate tensor '{}'", tensor.name)));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Loaded Graph
// =============================================================================

/// An operator graph with the names of its tensors
pub struct LoadedGraph {
    /// The graph
    pub graph: OperatorGraph,
    /// Tensor handles by name
    pub tensors: BTreeMap<String, OpTensor>,
    /// Tensors written by some operator
    pub outputs: BTreeSet<TensorId>,
}

impl LoadedGraph {
    /// Name of a tensor, if it was declared
    pub fn name_of(&self, id: TensorId) -> Option<&str> {
        self.tensors
            .iter()
            .find(|(_, tensor)| tensor.id() == id)
            .map(|(name, _)| name.as_str())
    }

    /// Handle of a tensor id
    pub fn handle(&self, id: TensorId) -> Option<OpTensor> {
        self.tensors.values().copied().find(|tensor| tensor.id() == id)
    }
}

/// Load a graph description and create its operator graph
pub fn load_graph(args: &GraphArgs) -> CliResult<(GraphConfig, LoadedGraph)> {
    if !args.graph.exists() {
        return Err(CliError::InvalidArgument(format!(
            "Graph file not found: {}",
            args.graph.display()
        )));
    }
    let config = GraphConfig::load(&args.graph)?;
    let loaded = config.to_graph()?;
    Ok((config, loaded))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const GRAPH: &str = r#"
target = "g71"

[[tensors]]
name = "input"
shape = [1, 8, 8, 4]

[[tensors]]
name = "weights"
shape = [3, 3, 4, 2]

[[tensors]]
name = "acc"

[[tensors]]
name = "addend"
shape = [1, 8, 8, 2]

[[tensors]]
name = "dst"

[[operators]]
type = "conv2d"
input = "input"
weights = "weights"
dst = "acc"
pad = [1, 1, 1, 1]
method = "gemm"

[[operators]]
type = "elementwise"
op = "add"
lhs = "acc"
rhs = "addend"
dst = "dst"
"#;

    fn args(path: PathBuf) -> GraphArgs {
        GraphArgs {
            graph: path,
            target: None,
            no_fusion: false,
            max_group: None,
        }
    }

    #[test]
    fn test_parse_graph_config() {
        let config = GraphConfig::parse(GRAPH).unwrap();
        assert_eq!(config.target, GpuTarget::G71);
        assert!(config.fusion.enabled);
        assert_eq!(config.tensors.len(), 5);
        assert_eq!(config.tensors[0].dtype, DataType::F32);
        assert_eq!(config.tensors[2].shape, Vec::<usize>::new());
        match &config.operators[0] {
            OperatorSpec::Conv2d {
                stride, method, pad, ..
            } => {
                assert_eq!(*stride, [1, 1]);
                assert_eq!(*pad, [1, 1, 1, 1]);
                assert_eq!(*method, Some(ConvolutionMethod::Gemm));
            }
            other => panic!("unexpected operator {other:?}"),
        }
    }

    #[test]
    fn test_load_and_build_graph() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.toml");
        std::fs::write(&path, GRAPH).unwrap();

        let (_, loaded) = load_graph(&args(path)).unwrap();
        assert_eq!(loaded.graph.number_of_ops(), 2);
        assert!(loaded.graph.validate().is_ok());

        let acc = loaded.tensors["acc"];
        assert_eq!(loaded.graph.tensor_info(acc).shape.dims(), &[1, 8, 8, 2]);
        assert_eq!(loaded.name_of(acc.id()), Some("acc"));
        assert_eq!(loaded.outputs.len(), 2);
    }

    #[test]
    fn test_context_overrides() {
        let config = GraphConfig::parse(GRAPH).unwrap();
        let mut graph_args = args(PathBuf::from("graph.toml"));
        assert_eq!(config.context(&graph_args).target(), GpuTarget::G71);

        graph_args.target = Some(GpuTarget::G77);
        graph_args.no_fusion = true;
        let ctx = config.context(&graph_args);
        assert_eq!(ctx.target(), GpuTarget::G77);
        assert!(!ctx.fusion.enabled);
    }

    #[test]
    fn test_unknown_tensor_rejected() {
        let text = r#"
[[tensors]]
name = "a"
shape = [4]

[[operators]]
type = "elementwise"
op = "mul"
lhs = "a"
rhs = "b"
dst = "a"
"#;
        let config = GraphConfig::parse(text).unwrap();
        assert!(matches!(config.to_graph(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_duplicate_tensor_rejected() {
        let text = r#"
[[tensors]]
name = "a"

[[tensors]]
name = "a"
"#;
        assert!(matches!(GraphConfig::parse(text), Err(CliError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = load_graph(&args(dir.path().join("missing.toml")));
        assert!(matches!(result, Err(CliError::InvalidArgument(_))));
    }
}
