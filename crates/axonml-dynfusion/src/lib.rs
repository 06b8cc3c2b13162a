//! Axonml Dynfusion - Dynamic Kernel Fusion Engine
//!
//! Lowers a declarative graph of tensor operators into a minimal set of GPU
//! kernels. Adjacent operators are fused into single kernels wherever the
//! fusion keeps the graph acyclic, a single complex operator at the root of
//! each kernel, one stage per kernel and one execution space per kernel.
//!
//! The pipeline runs through three internal representations:
//!
//! - **Kernel graph**: every operator becomes one or more concrete kernels
//! - **Fused kernel graph**: kernels partitioned into fusion groups
//! - **Workload**: one compiled kernel per group, plus its tensors
//!
//! # Example
//! ```
//! use axonml_dynfusion::{build, ClWorkload, Conv2dDescriptor, OperatorGraph, TensorInfo, WorkloadContext};
//!
//! let mut graph = OperatorGraph::new();
//! let input = graph.add_tensor(TensorInfo::f32([1, 12, 12, 384]));
//! let weights = graph.add_tensor(TensorInfo::f32([1, 1, 384, 16]));
//! let acc = graph.add_tensor(TensorInfo::empty());
//! let addend = graph.add_tensor(TensorInfo::f32([1, 12, 12, 16]));
//! let dst = graph.add_tensor(TensorInfo::empty());
//! graph.add_op_conv2d(Conv2dDescriptor::default(), input, weights, None, acc).unwrap();
//! graph.add_op_elementwise_add(acc, addend, dst).unwrap();
//!
//! let mut workload = ClWorkload::new();
//! build(&mut workload, &graph, &WorkloadContext::default()).unwrap();
//! println!("{}", workload.stats());
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod blueprint;
pub mod build;
pub mod config;
pub mod dependency_graph;
pub mod error;
pub mod heuristics;
pub mod id;
pub mod kernel;
pub mod operator_graph;
pub mod runtime;
pub mod tensor;
pub mod workload;

mod fusion;
mod kernel_graph;

pub use blueprint::{ClKernelArgDescriptor, ClKernelBlueprint, ClKernelCode, TensorArgType};
pub use build::build;
pub use config::{FusionConfig, GpuInfo, GpuTarget, WorkloadContext};
pub use dependency_graph::{DependencyGraph, MergePoints, OpPack};
pub use error::{Error, Result};
pub use heuristics::{select_conv_method, ConvolutionMethod};
pub use id::{IdAllocator, OperatorId, TensorId, EMPTY_ID};
pub use kernel::{StoreType, TileDescriptor, UnitWorkloadStage, Window};
pub use kernel_graph::{AuxMemoryInfo, AuxMemoryLifetime, MemoryType};
pub use operator_graph::{
    ArithmeticOperation, Complexity, Conv2dDescriptor, ElementwiseDescriptor, OpTensor, Operator, OperatorGraph,
};
pub use runtime::{
    bind_tensors, AuxTensorData, CompositeOperator, CpuTensor, KernelCache, OpTensorBinding, TensorPack,
    TensorPackMap, TensorRef,
};
pub use tensor::{DataLayout, DataType, Padding2D, Shape, Size2D, TensorInfo};
pub use workload::{ClUnitWorkload, ClWorkload, ClWorkloadTensor, UnitWorkloadId, WorkloadStats};
