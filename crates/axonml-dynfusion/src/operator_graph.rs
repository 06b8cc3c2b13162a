//! Operator Graph - User-Facing Graph of Tensor Operators
//!
//! A typed façade over [`DependencyGraph`]: tensor nodes carry a
//! [`TensorInfo`], operator nodes carry an [`OperatorContent`]. Inserting an
//! operator infers empty output infos and checks the graph-level rules:
//!
//! - a complex operator (convolution) may only be the first operator;
//! - every operator output has the shape of the root output (one execution
//!   space per graph);
//! - roots never mix a complex operator with other operators.
//!
//! The first violation is returned to the caller and also kept as the
//! graph's status, reported by [`OperatorGraph::validate`].
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dependency_graph::DependencyGraph;
use crate::error::{Error, Result};
use crate::heuristics::ConvolutionMethod;
use crate::id::{OperatorId, TensorId};
use crate::tensor::{DataLayout, Padding2D, Shape, Size2D, TensorInfo};

// =============================================================================
// Handles
// =============================================================================

/// Handle to a tensor of an [`OperatorGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpTensor {
    id: TensorId,
}

impl OpTensor {
    /// Tensor id inside the operator graph.
    pub fn id(self) -> TensorId {
        self.id
    }
}

/// Handle to an operator of an [`OperatorGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Operator {
    id: OperatorId,
}

impl Operator {
    /// Operator id inside the operator graph.
    pub fn id(self) -> OperatorId {
        self.id
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Whether an operator or kernel can anchor a fusion group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Complexity {
    /// Anchors a group; at most one per group and always its root.
    Complex,
    /// Can only be folded into an existing group.
    Simple,
}

/// 2D convolution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dDescriptor {
    /// Spatial padding.
    #[serde(default)]
    pub pad: Padding2D,
    /// Spatial stride.
    #[serde(default = "unit_size")]
    pub stride: Size2D,
    /// Spatial dilation.
    #[serde(default = "unit_size")]
    pub dilation: Size2D,
}

fn unit_size() -> Size2D {
    Size2D::new(1, 1)
}

impl Default for Conv2dDescriptor {
    fn default() -> Self {
        Self {
            pad: Padding2D::default(),
            stride: unit_size(),
            dilation: unit_size(),
        }
    }
}

impl Conv2dDescriptor {
    /// Builder: set padding.
    pub fn pad(mut self, pad: Padding2D) -> Self {
        self.pad = pad;
        self
    }

    /// Builder: set stride.
    pub fn stride(mut self, x: usize, y: usize) -> Self {
        self.stride = Size2D::new(x, y);
        self
    }

    /// Builder: set dilation.
    pub fn dilation(mut self, x: usize, y: usize) -> Self {
        self.dilation = Size2D::new(x, y);
        self
    }

    /// Output shape of a convolution of `src` by `weights`.
    pub fn output_shape(&self, src: &TensorInfo, weights: &TensorInfo) -> Result<Shape> {
        if self.stride.x == 0 || self.stride.y == 0 {
            return Err(Error::InvalidDescriptor {
                message: "convolution stride must be non-zero".to_string(),
            });
        }
        if self.dilation.x == 0 || self.dilation.y == 0 {
            return Err(Error::InvalidDescriptor {
                message: "convolution dilation must be non-zero".to_string(),
            });
        }
        if src.shape.ndim() < 3 || weights.shape.ndim() != 4 {
            return Err(Error::InvalidDescriptor {
                message: format!(
                    "convolution expects an input of rank >= 3 and rank-4 weights, got {} and {}",
                    src.shape, weights.shape
                ),
            });
        }

        let wg = WeightsGeometry::of(weights, src.data_layout);
        let out_w = conv_output_dim(src.width(), wg.kernel_w, self.pad.left + self.pad.right, self.stride.x, self.dilation.x)?;
        let out_h = conv_output_dim(src.height(), wg.kernel_h, self.pad.top + self.pad.bottom, self.stride.y, self.dilation.y)?;

        let layout = src.data_layout;
        let mut dims = src.shape.dims().to_vec();
        let rank = dims.len();
        dims[rank - 1 - layout.width_from_back()] = out_w;
        dims[rank - 1 - layout.height_from_back()] = out_h;
        dims[rank - 1 - layout.channel_from_back()] = wg.ofm;
        Ok(Shape::from(dims))
    }
}

fn conv_output_dim(input: usize, kernel: usize, pad: usize, stride: usize, dilation: usize) -> Result<usize> {
    let effective = dilation * (kernel.max(1) - 1) + 1;
    let padded = input + pad;
    if padded < effective {
        return Err(Error::InvalidDescriptor {
            message: format!("kernel extent {effective} exceeds padded input {padded}"),
        });
    }
    Ok((padded - effective) / stride + 1)
}

/// Kernel geometry read from a weights tensor.
///
/// NHWC graphs use HWIO weights `[KH, KW, IFM, OFM]`; NCHW graphs use OIHW
/// weights `[OFM, IFM, KH, KW]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WeightsGeometry {
    /// Kernel height.
    pub kernel_h: usize,
    /// Kernel width.
    pub kernel_w: usize,
    /// Input feature maps.
    pub ifm: usize,
    /// Output feature maps.
    pub ofm: usize,
}

impl WeightsGeometry {
    /// Reads the geometry of `weights` for activations in `layout`.
    pub fn of(weights: &TensorInfo, layout: DataLayout) -> Self {
        let s = &weights.shape;
        match layout {
            DataLayout::Nhwc => Self {
                kernel_h: s.from_back(3),
                kernel_w: s.from_back(2),
                ifm: s.from_back(1),
                ofm: s.from_back(0),
            },
            DataLayout::Nchw => Self {
                ofm: s.from_back(3),
                ifm: s.from_back(2),
                kernel_h: s.from_back(1),
                kernel_w: s.from_back(0),
            },
        }
    }

    /// Number of multiply-accumulates per output element.
    pub fn reduction_size(&self) -> usize {
        self.kernel_h * self.kernel_w * self.ifm
    }
}

/// Elementwise arithmetic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithmeticOperation {
    /// `lhs + rhs`
    Add,
    /// `lhs - rhs`
    Sub,
    /// `lhs * rhs`
    Mul,
    /// `lhs / rhs`
    Div,
    /// `max(lhs, rhs)`
    Max,
    /// `min(lhs, rhs)`
    Min,
}

impl ArithmeticOperation {
    /// Short lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    /// Applies the operation to two scalars.
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Max => lhs.max(rhs),
            Self::Min => lhs.min(rhs),
        }
    }
}

impl fmt::Display for ArithmeticOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Elementwise binary operator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementwiseDescriptor {
    /// The arithmetic performed.
    pub op: ArithmeticOperation,
}

impl ElementwiseDescriptor {
    /// Descriptor of an addition.
    pub fn add() -> Self {
        Self {
            op: ArithmeticOperation::Add,
        }
    }
}

// =============================================================================
// Graph Content
// =============================================================================

/// Payload of an operator node.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorContent {
    /// 2D convolution, optionally with bias.
    Conv2d {
        /// Convolution parameters.
        desc: Conv2dDescriptor,
        /// Activations.
        input: TensorId,
        /// Weights.
        weights: TensorId,
        /// Optional bias.
        bias: Option<TensorId>,
        /// Result.
        dst: TensorId,
        /// Method chosen by the caller instead of the heuristic.
        forced_method: Option<ConvolutionMethod>,
    },
    /// Elementwise binary operation with broadcasting.
    Elementwise {
        /// Operation parameters.
        desc: ElementwiseDescriptor,
        /// Left operand.
        lhs: TensorId,
        /// Right operand.
        rhs: TensorId,
        /// Result.
        dst: TensorId,
    },
}

impl OperatorContent {
    /// Complexity class of the operator.
    pub fn complexity(&self) -> Complexity {
        match self {
            Self::Conv2d { .. } => Complexity::Complex,
            Self::Elementwise { .. } => Complexity::Simple,
        }
    }

    /// The operator's output tensor.
    pub fn dst(&self) -> TensorId {
        match self {
            Self::Conv2d { dst, .. } | Self::Elementwise { dst, .. } => *dst,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "conv2d",
            Self::Elementwise { desc, .. } => desc.op.name(),
        }
    }
}

// =============================================================================
// Operator Graph
// =============================================================================

/// Declarative graph of tensor operators.
#[derive(Debug, Clone, Default)]
pub struct OperatorGraph {
    graph: DependencyGraph,
    tensors: BTreeMap<TensorId, TensorInfo>,
    operators: BTreeMap<OperatorId, OperatorContent>,
    status: Option<Error>,
}

impl OperatorGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tensor. Pass [`TensorInfo::empty`] for outputs to be inferred.
    pub fn add_tensor(&mut self, info: TensorInfo) -> OpTensor {
        let id = self.graph.add_tensor(None);
        self.tensors.insert(id, info);
        OpTensor { id }
    }

    /// Current info of a tensor, including inferred shapes.
    pub fn tensor_info(&self, tensor: OpTensor) -> &TensorInfo {
        &self.tensors[&tensor.id]
    }

    /// Adds a 2D convolution. It must be the first operator of the graph.
    pub fn add_op_conv2d(
        &mut self,
        desc: Conv2dDescriptor,
        input: OpTensor,
        weights: OpTensor,
        bias: Option<OpTensor>,
        dst: OpTensor,
    ) -> Result<Operator> {
        self.check_status()?;
        if !self.operators.is_empty() {
            return self.fail(Error::MultipleComplexOperators);
        }

        let mut inputs = vec![input.id, weights.id];
        inputs.extend(bias.map(|b| b.id));
        let content = OperatorContent::Conv2d {
            desc,
            input: input.id,
            weights: weights.id,
            bias: bias.map(|b| b.id),
            dst: dst.id,
            forced_method: None,
        };
        let op = self.insert_operator(&inputs, dst, content)?;

        if self.tensors[&dst.id].is_empty() {
            let shape = match desc.output_shape(&self.tensors[&input.id], &self.tensors[&weights.id]) {
                Ok(shape) => shape,
                Err(e) => return self.fail(e),
            };
            let src_info = self.tensors[&input.id].clone();
            if let Some(info) = self.tensors.get_mut(&dst.id) {
                info.auto_init_if_empty(&src_info, shape);
            }
        }

        self.finish_operator(op)
    }

    /// Adds an elementwise addition.
    pub fn add_op_elementwise_add(&mut self, lhs: OpTensor, rhs: OpTensor, dst: OpTensor) -> Result<Operator> {
        self.add_op_elementwise(ElementwiseDescriptor::add(), lhs, rhs, dst)
    }

    /// Adds an elementwise binary operation with broadcasting.
    pub fn add_op_elementwise(
        &mut self,
        desc: ElementwiseDescriptor,
        lhs: OpTensor,
        rhs: OpTensor,
        dst: OpTensor,
    ) -> Result<Operator> {
        self.check_status()?;
        let content = OperatorContent::Elementwise {
            desc,
            lhs: lhs.id,
            rhs: rhs.id,
            dst: dst.id,
        };
        let op = self.insert_operator(&[lhs.id, rhs.id], dst, content)?;

        if self.tensors[&dst.id].is_empty() {
            let lhs_info = self.tensors[&lhs.id].clone();
            let rhs_shape = &self.tensors[&rhs.id].shape;
            let Some(shape) = lhs_info.shape.broadcast_shape(rhs_shape) else {
                let err = Error::BroadcastError {
                    shape1: lhs_info.shape.dims().to_vec(),
                    shape2: rhs_shape.dims().to_vec(),
                };
                return self.fail(err);
            };
            if let Some(info) = self.tensors.get_mut(&dst.id) {
                info.auto_init_if_empty(&lhs_info, shape);
            }
        }

        self.finish_operator(op)
    }

    /// Forces the implementation of a convolution, bypassing the heuristic.
    pub fn force_conv2d_method(&mut self, op: Operator, method: ConvolutionMethod) -> Result<()> {
        match self.operators.get_mut(&op.id) {
            Some(OperatorContent::Conv2d { forced_method, .. }) => {
                *forced_method = Some(method);
                Ok(())
            }
            _ => Err(Error::InvalidDescriptor {
                message: format!("{} is not a convolution", op.id),
            }),
        }
    }

    /// Returns the first error met while building the graph.
    pub fn validate(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn check_status(&self) -> Result<()> {
        self.validate()
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        if self.status.is_none() {
            self.status = Some(err.clone());
        }
        Err(err)
    }

    fn insert_operator(&mut self, inputs: &[TensorId], dst: OpTensor, content: OperatorContent) -> Result<OperatorId> {
        match self.graph.add_operator(inputs, &[dst.id]) {
            Ok(op) => {
                debug!(op = %op, kind = content.name(), "added operator");
                self.operators.insert(op, content);
                Ok(op)
            }
            Err(e) => self.fail(e),
        }
    }

    fn finish_operator(&mut self, op: OperatorId) -> Result<Operator> {
        let dst_shape = self.tensors[&self.operators[&op].dst()].shape.clone();
        if let Err(e) = self.check_execution_space(&dst_shape) {
            return self.fail(e);
        }
        if let Err(e) = self.check_roots() {
            return self.fail(e);
        }
        Ok(Operator { id: op })
    }

    fn check_execution_space(&self, dst_shape: &Shape) -> Result<()> {
        for root in self.graph.root_ops() {
            let root_dst = &self.tensors[&self.operators[&root].dst()];
            if root_dst.is_empty() {
                continue;
            }
            if &root_dst.shape != dst_shape {
                return Err(Error::ExecutionSpaceChanged {
                    expected: root_dst.shape.dims().to_vec(),
                    actual: dst_shape.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    fn check_roots(&self) -> Result<()> {
        let roots = self.graph.root_ops();
        let complex = roots
            .iter()
            .filter(|op| self.operators[*op].complexity() == Complexity::Complex)
            .count();
        let simple = roots.len() - complex;
        if complex > 1 || (complex == 1 && simple > 0) {
            return Err(Error::MultipleRoots { complex, simple });
        }
        Ok(())
    }

    pub(crate) fn dependency_graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub(crate) fn operator(&self, op: OperatorId) -> &OperatorContent {
        &self.operators[&op]
    }

    pub(crate) fn info(&self, tensor: TensorId) -> &TensorInfo {
        &self.tensors[&tensor]
    }

    /// Number of operators.
    pub fn number_of_ops(&self) -> usize {
        self.operators.len()
    }

    /// Number of tensors.
    pub fn number_of_tensors(&self) -> usize {
        self.tensors.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
