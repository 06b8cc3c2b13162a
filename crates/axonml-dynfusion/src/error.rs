//! Error Types - Dynamic Fusion Error Handling
//!
//! A single error type shared by every stage of the fusion pipeline: graph
//! construction, lowering, fusion, code generation and the reference runtime.
//!
//! # Key Features
//! - Structural graph errors (cycles, roots, execution space)
//! - Kernel contract errors (shapes, data types, layouts)
//! - Fusion legality and code generation errors
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use thiserror::Error;

use crate::tensor::{DataLayout, DataType};

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for dynamic fusion operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The graph contains a cycle.
    #[error("Cycles or loops are not allowed: sorted {sorted} of {total} operators")]
    CycleDetected {
        /// Number of operators emitted before the sort stalled.
        sorted: usize,
        /// Number of operators in the graph.
        total: usize,
    },

    /// An edge could not be linked.
    #[error("Invalid link: {message}")]
    InvalidLink {
        /// Why the edge was rejected.
        message: String,
    },

    /// A merge point was referenced before being recorded.
    #[error("Merge point {merge_point} does not exist")]
    UnknownMergePoint {
        /// The unknown external id.
        merge_point: i32,
    },

    /// A complex operator was added to a non-empty graph.
    #[error("Cannot add multiple complex operators")]
    MultipleComplexOperators,

    /// The graph has an illegal set of root operators.
    #[error("Multiple roots are not allowed: {complex} complex and {simple} simple root operators")]
    MultipleRoots {
        /// Number of complex roots.
        complex: usize,
        /// Number of simple roots.
        simple: usize,
    },

    /// An operator output does not match the execution space of the roots.
    #[error("Cannot change execution space: root produces {expected:?}, operator produces {actual:?}")]
    ExecutionSpaceChanged {
        /// Shape of the root output.
        expected: Vec<usize>,
        /// Shape of the new operator output.
        actual: Vec<usize>,
    },

    /// Shape mismatch between tensors.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        actual: Vec<usize>,
    },

    /// Broadcasting failed between shapes.
    #[error("Cannot broadcast shapes {shape1:?} and {shape2:?}")]
    BroadcastError {
        /// The first shape.
        shape1: Vec<usize>,
        /// The second shape.
        shape2: Vec<usize>,
    },

    /// Data type not supported by a kernel.
    #[error("Unsupported data type {data_type:?} for {kernel}")]
    UnsupportedDataType {
        /// Offending data type.
        data_type: DataType,
        /// Kernel that rejected it.
        kernel: String,
    },

    /// Data layout not supported by a kernel.
    #[error("Unsupported data layout {layout:?} for {kernel}")]
    UnsupportedDataLayout {
        /// Offending layout.
        layout: DataLayout,
        /// Kernel that rejected it.
        kernel: String,
    },

    /// Operator descriptor is malformed.
    #[error("Invalid descriptor: {message}")]
    InvalidDescriptor {
        /// Description of the problem.
        message: String,
    },

    /// A kernel rejected its tensor contract.
    #[error("Kernel validation failed for {kernel}: {message}")]
    KernelValidation {
        /// Kernel that failed.
        kernel: String,
        /// Reason.
        message: String,
    },

    /// Two fusion groups cannot be fused.
    #[error("Invalid fusion: {message}")]
    FusionIllegal {
        /// Which invariant was violated.
        message: String,
    },

    /// Kernel code generation failed.
    #[error("Code generation error: {message}")]
    Codegen {
        /// Description of the failure.
        message: String,
    },

    /// A requested feature is not implemented.
    #[error("Not implemented: {message}")]
    NotImplemented {
        /// What is missing.
        message: String,
    },

    /// No tensor was bound for an operator tensor.
    #[error("Cannot find binding for operator tensor {tensor}")]
    MissingBinding {
        /// Operator-graph tensor id.
        tensor: i32,
    },

    /// Reference runtime error.
    #[error("Runtime error: {message}")]
    Runtime {
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

// =============================================================================
// Result Type
// =============================================================================

/// A specialized Result type for dynamic fusion operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Helper Functions
// =============================================================================

impl Error {
    /// Creates a new shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates a new kernel validation error.
    #[must_use]
    pub fn kernel(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::KernelValidation {
            kernel: kernel.into(),
            message: message.into(),
        }
    }

    /// Creates a new fusion legality error.
    #[must_use]
    pub fn fusion(message: impl Into<String>) -> Self {
        Self::FusionIllegal {
            message: message.into(),
        }
    }

    /// Creates a new code generation error.
    #[must_use]
    pub fn codegen(message: impl Into<String>) -> Self {
        Self::Codegen {
            message: message.into(),
        }
    }

    /// Creates a new runtime error.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for errors raised by graph structure checks.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::InvalidLink { .. }
                | Self::UnknownMergePoint { .. }
                | Self::MultipleComplexOperators
                | Self::MultipleRoots { .. }
                | Self::ExecutionSpaceChanged { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::shape_mismatch(&[1, 12, 12, 16], &[1, 12, 12, 8]);
        assert!(err.to_string().contains("Shape mismatch"));

        let err = Error::CycleDetected {
            sorted: 0,
            total: 2,
        };
        assert!(err.to_string().contains("0 of 2"));
    }

    #[test]
    fn test_structural_classification() {
        assert!(Error::MultipleComplexOperators.is_structural());
        assert!(!Error::fusion("not adjacent").is_structural());
        assert_eq!(Error::codegen("x"), Error::codegen("x"));
    }
}
