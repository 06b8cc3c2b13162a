//! Kernel Code
//!
//! The compiled form of one fusion group: OpenCL source plus everything a
//! runtime needs to enqueue it, and the component program executed by the
//! reference runtime.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeSet;

use serde::Serialize;

use crate::kernel::Window;
use crate::operator_graph::{ArithmeticOperation, Conv2dDescriptor, WeightsGeometry};
use crate::tensor::TensorInfo;

// =============================================================================
// Arguments
// =============================================================================

/// How a tensor argument is declared in the kernel signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TensorArgType {
    /// 1D buffer.
    Vector,
    /// 2D buffer.
    Image,
    /// 2D buffer with a z stride.
    Image3D,
    /// 3D buffer.
    Tensor3D,
    /// 4D buffer.
    Tensor4D,
    /// 4D tensor object backed by a buffer.
    Tensor4DtBuffer,
    /// 4D tensor object backed by an image.
    Tensor4DtImage,
}

impl TensorArgType {
    /// Declaration of an argument called `name`.
    pub fn declaration(self, name: &str) -> String {
        match self {
            Self::Vector => format!("VECTOR_DECLARATION({name})"),
            Self::Image => format!("IMAGE_DECLARATION({name})"),
            Self::Image3D => format!("IMAGE_DECLARATION({name}),\n    uint {name}_stride_z"),
            Self::Tensor3D => format!("TENSOR3D_DECLARATION({name})"),
            Self::Tensor4D => format!("TENSOR4D_DECLARATION({name})"),
            Self::Tensor4DtBuffer => format!("TENSOR4D_T({name}, BUFFER)"),
            Self::Tensor4DtImage => format!("TENSOR4D_T({name}, IMAGE)"),
        }
    }
}

/// Runtime description of one kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClKernelArgDescriptor {
    /// Argument id, unique within one kernel.
    pub arg_id: i32,
    /// Declaration kind.
    pub tensor_arg_type: TensorArgType,
    /// Whether the argument advances along the window's z dimension.
    pub slide_along_dimz: bool,
}

// =============================================================================
// Component Program
// =============================================================================

/// Where a program tensor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Slot {
    /// A kernel argument, by argument id.
    Argument(i32),
    /// A kernel-local tile, by index into [`KernelProgram::locals`].
    Local(usize),
}

/// A tensor operand of a program step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProgramTensor {
    /// Storage.
    pub slot: Slot,
    /// Shape, data type and layout.
    pub info: TensorInfo,
}

/// One component of a fused kernel. Field names follow the kernel kinds.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ProgramStep {
    /// Direct convolution over HWIO weights.
    DirectConv2d {
        desc: Conv2dDescriptor,
        src: ProgramTensor,
        weights: ProgramTensor,
        bias: Option<ProgramTensor>,
        dst: ProgramTensor,
    },
    /// Convolution over `[OFM, KH*KW*IFM]` weights.
    GemmConv2d {
        desc: Conv2dDescriptor,
        src: ProgramTensor,
        weights: ProgramTensor,
        bias: Option<ProgramTensor>,
        dst: ProgramTensor,
        geometry: WeightsGeometry,
    },
    /// HWIO to `[OFM, KH*KW*IFM]`.
    ReshapeWeights {
        src: ProgramTensor,
        dst: ProgramTensor,
        geometry: WeightsGeometry,
    },
    /// Broadcasting binary operation.
    Elementwise {
        op: ArithmeticOperation,
        lhs: ProgramTensor,
        rhs: ProgramTensor,
        dst: ProgramTensor,
    },
    /// Tile to memory.
    Store { src: ProgramTensor, dst: ProgramTensor },
}

/// Components of a kernel in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct KernelProgram {
    /// Steps in order.
    pub steps: Vec<ProgramStep>,
    /// Infos of the kernel-local tiles.
    pub locals: Vec<TensorInfo>,
}

// =============================================================================
// Kernel Code
// =============================================================================

/// A compiled fused kernel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClKernelCode {
    /// Kernel function name.
    pub name: String,
    /// OpenCL source.
    pub code: String,
    /// Identifier of the configuration, used for tuning and caching.
    pub config_id: String,
    /// `-D` flags for the OpenCL compiler.
    pub build_options: BTreeSet<String>,
    /// Execution window.
    pub window: Window,
    /// Arguments in declaration order.
    pub arguments: Vec<ClKernelArgDescriptor>,
    /// Component program.
    pub program: KernelProgram,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declarations() {
        assert_eq!(TensorArgType::Vector.declaration("bias_2"), "VECTOR_DECLARATION(bias_2)");
        assert_eq!(TensorArgType::Tensor4DtBuffer.declaration("src_0"), "TENSOR4D_T(src_0, BUFFER)");
        assert!(TensorArgType::Image3D.declaration("w").ends_with("uint w_stride_z"));
    }
}
