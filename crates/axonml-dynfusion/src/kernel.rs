//! Kernels - Concrete Kernel Nodes and Their Contracts
//!
//! A [`ClKernel`] is one concrete GPU kernel produced by lowering an
//! operator. Every kind validates its tensor contract and carries a
//! [`ClKernelConfig`] describing when it runs and how it tiles its output.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use serde::Serialize;

use crate::error::{Error, Result};
use crate::id::{OperatorId, TensorId};
use crate::operator_graph::{Complexity, Conv2dDescriptor, ElementwiseDescriptor, WeightsGeometry};
use crate::tensor::{DataLayout, DataType, Shape, Size2D, TensorInfo};

// =============================================================================
// Configuration
// =============================================================================

/// When a unit workload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum UnitWorkloadStage {
    /// Once, before the first run.
    Prepare,
    /// On every run.
    Run,
}

/// Which corner of the execution space absorbs partial tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ClippingStrategy {
    /// Partial tiles at the first column and row.
    #[default]
    TopLeft,
    /// Partial tiles at the last column and the first row.
    TopRight,
    /// Partial tiles at the first column and the last row.
    BottomLeft,
    /// Partial tiles at the last column and row.
    BottomRight,
}

/// Output tiling of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct TileDescriptor {
    /// Elements per work item along x and y.
    pub tile_dims: Size2D,
    /// Extent of the space being tiled.
    pub boundaries: Size2D,
    /// Placement of partial tiles.
    pub clipping: ClippingStrategy,
}

impl TileDescriptor {
    /// Returns whether no tile has been set.
    pub fn is_empty(&self) -> bool {
        self.tile_dims.area() == 0
    }
}

/// Store macro used for a fused kernel's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum StoreType {
    /// Boundary-aware block store.
    StoreBlockBoundaryAware,
    /// Vector store selecting the partial width at the boundary.
    StoreVectorSelect,
    /// Tile store with indirect rows and width selection.
    #[default]
    TStoreIndirectWidthSelect,
}

/// Per-kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClKernelConfig {
    /// Stage the kernel runs in.
    pub stage: UnitWorkloadStage,
    /// Output tiling.
    pub tile_desc: TileDescriptor,
    /// Store strategy for the kernel outputs.
    pub store_type: StoreType,
}

impl ClKernelConfig {
    /// Run-stage config with the default store.
    pub fn run(tile_desc: TileDescriptor) -> Self {
        Self {
            stage: UnitWorkloadStage::Run,
            tile_desc,
            store_type: StoreType::default(),
        }
    }

    /// Prepare-stage config with the default store.
    pub fn prepare(tile_desc: TileDescriptor) -> Self {
        Self {
            stage: UnitWorkloadStage::Prepare,
            ..Self::run(tile_desc)
        }
    }
}

/// Largest power-of-two vector size not above `dim0`, starting from `vec_size`.
pub fn adjust_vec_size(mut vec_size: usize, dim0: usize) -> usize {
    while vec_size > dim0.max(1) && vec_size > 1 {
        vec_size /= 2;
    }
    vec_size.max(1)
}

/// Tile of a convolution writing `dst` (NHWC): channels along x, the
/// flattened plane along y.
pub fn conv_tile(dst: &TensorInfo) -> TileDescriptor {
    let ofm = dst.channels();
    let n0 = ofm.min(4);
    let m0 = if ofm > 16 {
        if dst.data_type == DataType::F32 {
            2
        } else {
            4
        }
    } else {
        1
    };
    TileDescriptor {
        tile_dims: Size2D::new(n0, m0),
        boundaries: Size2D::new(ofm, dst.width() * dst.height()),
        clipping: ClippingStrategy::TopLeft,
    }
}

/// Tile of an elementwise kernel writing `dst`: a vector along the
/// innermost dimension.
pub fn eltwise_tile(dst: &TensorInfo) -> TileDescriptor {
    let dim0 = dst.shape.from_back(0);
    let vec = adjust_vec_size(16 / dst.element_size().max(1), dim0);
    TileDescriptor {
        tile_dims: Size2D::new(vec, 1),
        boundaries: Size2D::new(dim0, dst.shape.from_back(1)),
        clipping: ClippingStrategy::TopLeft,
    }
}

// =============================================================================
// Execution Window
// =============================================================================

/// One dimension of an execution window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WindowDimension {
    /// First coordinate.
    pub start: usize,
    /// One past the last coordinate.
    pub end: usize,
    /// Distance between work items.
    pub step: usize,
}

impl WindowDimension {
    /// Number of work items along this dimension.
    pub fn num_iterations(&self) -> usize {
        if self.step == 0 {
            return 0;
        }
        (self.end.saturating_sub(self.start) + self.step - 1) / self.step
    }
}

/// 3D execution window of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    /// Innermost dimension.
    pub x: WindowDimension,
    /// Middle dimension.
    pub y: WindowDimension,
    /// Outer dimension, collapsed.
    pub z: WindowDimension,
}

impl Window {
    /// Window covering a tile's boundaries in tile steps, `depth` deep.
    pub fn from_tile(tile: &TileDescriptor, depth: usize) -> Self {
        let dim = |extent: usize, step: usize| {
            let step = step.max(1);
            WindowDimension {
                start: 0,
                end: extent.div_ceil(step) * step,
                step,
            }
        };
        Self {
            x: dim(tile.boundaries.x, tile.tile_dims.x),
            y: dim(tile.boundaries.y, tile.tile_dims.y),
            z: dim(depth, 1),
        }
    }

    /// Number of work items.
    pub fn num_iterations(&self) -> usize {
        self.x.num_iterations() * self.y.num_iterations() * self.z.num_iterations()
    }
}

// =============================================================================
// Kernel
// =============================================================================

/// Closed set of kernel kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ClKernelKind {
    /// Direct 2D convolution.
    DirectConv2d {
        /// Convolution parameters.
        desc: Conv2dDescriptor,
        /// Activations.
        src: TensorId,
        /// HWIO weights.
        weights: TensorId,
        /// Optional bias.
        bias: Option<TensorId>,
        /// Result.
        dst: TensorId,
    },
    /// Convolution as a GEMM over reshaped weights.
    GemmConv2d {
        /// Convolution parameters.
        desc: Conv2dDescriptor,
        /// Activations.
        src: TensorId,
        /// Weights reshaped to `[OFM, KH*KW*IFM]`.
        weights: TensorId,
        /// Optional bias.
        bias: Option<TensorId>,
        /// Result.
        dst: TensorId,
        /// Geometry of the original weights.
        geometry: WeightsGeometry,
    },
    /// Weight transposition run once in the prepare stage.
    ReshapeWeights {
        /// Original weights.
        src: TensorId,
        /// Reshaped weights.
        dst: TensorId,
        /// Geometry of the original weights.
        geometry: WeightsGeometry,
    },
    /// Elementwise binary operation.
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

impl ClKernelKind {
    /// Complexity class.
    pub fn complexity(&self) -> Complexity {
        match self {
            Self::Elementwise { .. } => Complexity::Simple,
            _ => Complexity::Complex,
        }
    }

    /// Kernel name.
    pub fn name(&self) -> String {
        match self {
            Self::DirectConv2d { .. } => "direct_conv2d".to_string(),
            Self::GemmConv2d { .. } => "gemm_conv2d".to_string(),
            Self::ReshapeWeights { .. } => "reshape_weights".to_string(),
            Self::Elementwise { desc, .. } => format!("eltwise_{}", desc.op),
        }
    }

    /// Input tensors in argument order.
    pub fn inputs(&self) -> Vec<TensorId> {
        match self {
            Self::DirectConv2d { src, weights, bias, .. } | Self::GemmConv2d { src, weights, bias, .. } => {
                let mut v = vec![*src, *weights];
                v.extend(*bias);
                v
            }
            Self::ReshapeWeights { src, .. } => vec![*src],
            Self::Elementwise { lhs, rhs, .. } => vec![*lhs, *rhs],
        }
    }

    /// The output tensor.
    pub fn dst(&self) -> TensorId {
        match self {
            Self::DirectConv2d { dst, .. }
            | Self::GemmConv2d { dst, .. }
            | Self::ReshapeWeights { dst, .. }
            | Self::Elementwise { dst, .. } => *dst,
        }
    }
}

/// A kernel node of the kernel graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ClKernel {
    /// Kernel id in the kernel graph.
    pub id: OperatorId,
    /// Stage, tiling and store strategy.
    pub config: ClKernelConfig,
    /// What the kernel computes.
    pub kind: ClKernelKind,
}

impl ClKernel {
    /// Complexity class.
    pub fn complexity(&self) -> Complexity {
        self.kind.complexity()
    }

    /// Checks the kernel's tensor contract.
    pub fn validate<'a>(&self, info: impl Fn(TensorId) -> &'a TensorInfo) -> Result<()> {
        match &self.kind {
            ClKernelKind::DirectConv2d {
                desc,
                src,
                weights,
                bias,
                dst,
            } => validate_direct_conv2d(info(*src), info(*weights), bias.map(&info), info(*dst), desc),
            ClKernelKind::GemmConv2d {
                desc,
                src,
                weights,
                bias,
                dst,
                geometry,
            } => validate_gemm_conv2d(info(*src), info(*weights), geometry, bias.map(&info), info(*dst), desc),
            ClKernelKind::ReshapeWeights { src, dst, geometry } => {
                validate_reshape_weights(info(*src), geometry, info(*dst))
            }
            ClKernelKind::Elementwise { lhs, rhs, dst, .. } => validate_elementwise(info(*lhs), info(*rhs), info(*dst)),
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

fn check_same_type_and_layout(kernel: &str, reference: &TensorInfo, others: &[&TensorInfo]) -> Result<()> {
    for other in others.iter().filter(|o| !o.is_empty()) {
        if other.data_type != reference.data_type {
            return Err(Error::kernel(kernel, "all tensors must share one data type"));
        }
        if other.data_layout != reference.data_layout {
            return Err(Error::kernel(kernel, "all tensors must share one data layout"));
        }
    }
    Ok(())
}

fn check_float(kernel: &str, info: &TensorInfo) -> Result<()> {
    if !info.data_type.is_float() {
        return Err(Error::UnsupportedDataType {
            data_type: info.data_type,
            kernel: kernel.to_string(),
        });
    }
    Ok(())
}

fn check_nhwc(kernel: &str, info: &TensorInfo) -> Result<()> {
    if info.data_layout != DataLayout::Nhwc {
        return Err(Error::UnsupportedDataLayout {
            layout: info.data_layout,
            kernel: kernel.to_string(),
        });
    }
    Ok(())
}

fn check_bias(kernel: &str, bias: Option<&TensorInfo>, src: &TensorInfo, ofm: usize) -> Result<()> {
    if let Some(bias) = bias {
        if bias.data_type != src.data_type {
            return Err(Error::kernel(kernel, "bias must match the input data type"));
        }
        if bias.shape.ndim() != 1 || bias.shape.numel() != ofm {
            return Err(Error::kernel(
                kernel,
                format!("bias must be 1D with {ofm} elements, got {}", bias.shape),
            ));
        }
    }
    Ok(())
}

fn check_conv_dst(desc: &Conv2dDescriptor, src: &TensorInfo, weights: &TensorInfo, dst: &TensorInfo) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    let expected = desc.output_shape(src, weights)?;
    if expected != dst.shape {
        return Err(Error::shape_mismatch(expected.dims(), dst.shape.dims()));
    }
    Ok(())
}

/// Tensor contract of the direct convolution kernel.
pub fn validate_direct_conv2d(
    src: &TensorInfo,
    weights: &TensorInfo,
    bias: Option<&TensorInfo>,
    dst: &TensorInfo,
    desc: &Conv2dDescriptor,
) -> Result<()> {
    const KERNEL: &str = "direct_conv2d";
    check_float(KERNEL, src)?;
    check_nhwc(KERNEL, src)?;
    check_same_type_and_layout(KERNEL, src, &[weights, dst])?;

    if weights.shape.ndim() > 4 {
        return Err(Error::kernel(KERNEL, "weights can have at most 4 dimensions"));
    }
    let wg = WeightsGeometry::of(weights, src.data_layout);
    if wg.ifm != src.channels() {
        return Err(Error::kernel(
            KERNEL,
            format!("weights expect {} input channels, input has {}", wg.ifm, src.channels()),
        ));
    }
    if desc.dilation != Size2D::new(1, 1) {
        return Err(Error::kernel(KERNEL, "dilation is not supported"));
    }
    check_bias(KERNEL, bias, src, wg.ofm)?;
    check_conv_dst(desc, src, weights, dst)
}

/// Tensor contract of the GEMM convolution kernel. `weights` is the
/// reshaped tensor, `geometry` describes the original weights.
pub fn validate_gemm_conv2d(
    src: &TensorInfo,
    weights: &TensorInfo,
    geometry: &WeightsGeometry,
    bias: Option<&TensorInfo>,
    dst: &TensorInfo,
    desc: &Conv2dDescriptor,
) -> Result<()> {
    const KERNEL: &str = "gemm_conv2d";
    check_float(KERNEL, src)?;
    check_nhwc(KERNEL, src)?;
    check_same_type_and_layout(KERNEL, src, &[weights, dst])?;

    let expected = Shape::new(&[geometry.ofm, geometry.reduction_size()]);
    if weights.shape != expected {
        return Err(Error::shape_mismatch(expected.dims(), weights.shape.dims()));
    }
    if geometry.ifm != src.channels() {
        return Err(Error::kernel(
            KERNEL,
            format!("weights expect {} input channels, input has {}", geometry.ifm, src.channels()),
        ));
    }
    check_bias(KERNEL, bias, src, geometry.ofm)?;

    if !dst.is_empty() {
        let original = TensorInfo::new(
            [geometry.kernel_h, geometry.kernel_w, geometry.ifm, geometry.ofm],
            src.data_type,
            src.data_layout,
        );
        check_conv_dst(desc, src, &original, dst)?;
    }
    Ok(())
}

/// Tensor contract of the weight reshape kernel.
pub fn validate_reshape_weights(src: &TensorInfo, geometry: &WeightsGeometry, dst: &TensorInfo) -> Result<()> {
    const KERNEL: &str = "reshape_weights";
    check_float(KERNEL, src)?;
    check_same_type_and_layout(KERNEL, src, &[dst])?;
    if src.shape.ndim() != 4 {
        return Err(Error::kernel(KERNEL, format!("weights must be 4D, got {}", src.shape)));
    }
    let expected = Shape::new(&[geometry.ofm, geometry.reduction_size()]);
    if !dst.is_empty() && dst.shape != expected {
        return Err(Error::shape_mismatch(expected.dims(), dst.shape.dims()));
    }
    Ok(())
}

/// Tensor contract of the elementwise kernel.
pub fn validate_elementwise(lhs: &TensorInfo, rhs: &TensorInfo, dst: &TensorInfo) -> Result<()> {
    const KERNEL: &str = "eltwise";
    if lhs.is_empty() || rhs.is_empty() {
        return Err(Error::kernel(KERNEL, "operands must be initialised"));
    }
    if !matches!(
        lhs.data_type,
        DataType::F32 | DataType::F16 | DataType::S32 | DataType::S16 | DataType::U8
    ) {
        return Err(Error::UnsupportedDataType {
            data_type: lhs.data_type,
            kernel: KERNEL.to_string(),
        });
    }
    check_nhwc(KERNEL, lhs)?;
    check_same_type_and_layout(KERNEL, lhs, &[rhs, dst])?;

    let Some(out) = lhs.shape.broadcast_shape(&rhs.shape) else {
        return Err(Error::BroadcastError {
            shape1: lhs.shape.dims().to_vec(),
            shape2: rhs.shape.dims().to_vec(),
        });
    };
    if !dst.is_empty() && dst.shape != out {
        return Err(Error::shape_mismatch(out.dims(), dst.shape.dims()));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
