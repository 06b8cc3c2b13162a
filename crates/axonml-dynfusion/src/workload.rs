//! Workload - The Schedulable Result of a Build
//!
//! A [`ClWorkload`] lists the compiled unit workloads in execution order and
//! every tensor they touch. Core tensors are provided by the caller and are
//! mapped back to the operator graph through `op_tensor_id_lut`; auxiliary
//! tensors are allocated by the runtime according to their memory info.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::blueprint::{ClKernelArgDescriptor, ClKernelCode};
use crate::config::WorkloadContext;
use crate::dependency_graph::{DependencyGraph, MergePoints};
use crate::error::{Error, Result};
use crate::id::{OperatorId, TensorId};
use crate::kernel::UnitWorkloadStage;
use crate::kernel_graph::{AuxMemoryInfo, AuxMemoryLifetime, MemoryType};
use crate::tensor::TensorInfo;

/// Identifier of a unit workload.
pub type UnitWorkloadId = OperatorId;

// =============================================================================
// Workload Tensors and Units
// =============================================================================

/// A tensor read or written by a unit workload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClWorkloadTensor {
    /// Workload tensor id.
    pub id: TensorId,
    /// Shape, data type and layout.
    pub info: TensorInfo,
    /// Ownership class.
    pub memory_type: MemoryType,
    /// Allocation request; meaningful for auxiliary tensors only.
    pub memory_info: AuxMemoryInfo,
    /// Argument descriptor of the first kernel that uses the tensor.
    pub kernel_arg: ClKernelArgDescriptor,
}

/// One compiled kernel plus what it reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClUnitWorkload {
    /// Unit id; ascending ids are execution order.
    pub id: UnitWorkloadId,
    /// Stage the kernel runs in.
    pub stage: UnitWorkloadStage,
    /// Compiled kernel.
    pub code: ClKernelCode,
    /// Workload tensors read.
    pub inputs: Vec<TensorId>,
    /// Workload tensors written.
    pub outputs: Vec<TensorId>,
    /// Kernel argument id to workload tensor.
    pub bindings: BTreeMap<i32, TensorId>,
}

// =============================================================================
// Workload
// =============================================================================

/// The result of [`crate::build`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClWorkload {
    /// Build context.
    pub context: WorkloadContext,
    /// First failure of the build, if any.
    #[serde(skip)]
    pub status: Option<Error>,
    #[serde(skip)]
    graph: DependencyGraph,
    /// Unit workloads by id.
    pub unit_workloads: BTreeMap<UnitWorkloadId, ClUnitWorkload>,
    /// Workload tensors by id.
    pub tensors: BTreeMap<TensorId, ClWorkloadTensor>,
    /// Workload tensor id to operator-graph tensor id, for every core tensor.
    pub op_tensor_id_lut: BTreeMap<TensorId, TensorId>,
}

impl ClWorkload {
    /// Creates an empty workload.
    pub fn new() -> Self {
        Self::default()
    }

    /// `Ok` when the build succeeded.
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Returns whether the build succeeded.
    pub fn is_valid(&self) -> bool {
        self.status.is_none()
    }

    /// Registers a tensor, keyed by the kernel tensor it stands for.
    /// Registering the same kernel tensor again returns the existing id.
    pub fn add_workload_tensor(
        &mut self,
        info: TensorInfo,
        memory_type: MemoryType,
        memory_info: AuxMemoryInfo,
        kernel_arg: ClKernelArgDescriptor,
        merge_point: TensorId,
    ) -> TensorId {
        let id = self.graph.add_tensor(Some(merge_point));
        self.tensors.entry(id).or_insert(ClWorkloadTensor {
            id,
            info,
            memory_type,
            memory_info,
            kernel_arg,
        });
        id
    }

    /// Records a unit workload.
    pub fn add_unit_workload(
        &mut self,
        stage: UnitWorkloadStage,
        code: ClKernelCode,
        inputs: &[TensorId],
        outputs: &[TensorId],
        bindings: BTreeMap<i32, TensorId>,
    ) -> Result<UnitWorkloadId> {
        let id = self.graph.add_operator(inputs, outputs)?;
        self.unit_workloads.insert(
            id,
            ClUnitWorkload {
                id,
                stage,
                code,
                inputs: inputs.to_vec(),
                outputs: outputs.to_vec(),
                bindings,
            },
        );
        Ok(id)
    }

    /// Units of `stage` in execution order.
    pub fn units(&self, stage: UnitWorkloadStage) -> impl Iterator<Item = &ClUnitWorkload> + '_ {
        self.unit_workloads.values().filter(move |u| u.stage == stage)
    }

    /// Kernel tensor id to workload tensor id.
    pub(crate) fn merge_points(&self) -> &MergePoints {
        self.graph.merge_points()
    }

    /// Summary counters.
    pub fn stats(&self) -> WorkloadStats {
        let mut stats = WorkloadStats {
            unit_workloads: self.unit_workloads.len(),
            ..WorkloadStats::default()
        };
        for unit in self.unit_workloads.values() {
            match unit.stage {
                UnitWorkloadStage::Prepare => stats.prepare_units += 1,
                UnitWorkloadStage::Run => stats.run_units += 1,
            }
        }
        for tensor in self.tensors.values() {
            match tensor.memory_type {
                MemoryType::Core => stats.core_tensors += 1,
                MemoryType::Auxiliary => {
                    stats.aux_tensors += 1;
                    stats.aux_bytes += tensor.memory_info.size;
                    if tensor.memory_info.lifetime == AuxMemoryLifetime::Persistent {
                        stats.persistent_bytes += tensor.memory_info.size;
                    }
                }
            }
        }
        stats
    }

    /// Pretty JSON of the workload.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters describing a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadStats {
    /// Number of unit workloads.
    pub unit_workloads: usize,
    /// Units in the prepare stage.
    pub prepare_units: usize,
    /// Units in the run stage.
    pub run_units: usize,
    /// Caller-provided tensors.
    pub core_tensors: usize,
    /// Runtime-allocated tensors.
    pub aux_tensors: usize,
    /// Bytes of every auxiliary tensor.
    pub aux_bytes: usize,
    /// Bytes that stay allocated across runs.
    pub persistent_bytes: usize,
}

impl fmt::Display for WorkloadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unit workloads ({} prepare, {} run), {} core tensors, {} aux tensors ({} bytes, {} persistent)",
            self.unit_workloads,
            self.prepare_units,
            self.run_units,
            self.core_tensors,
            self.aux_tensors,
            self.aux_bytes,
            self.persistent_bytes
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{KernelProgram, TensorArgType};
    use crate::kernel::Window;

    fn arg(id: i32) -> ClKernelArgDescriptor {
        ClKernelArgDescriptor {
            arg_id: id,
            tensor_arg_type: TensorArgType::Tensor4DtBuffer,
            slide_along_dimz: true,
        }
    }

    fn code() -> ClKernelCode {
        ClKernelCode {
            name: "k".to_string(),
            code: String::new(),
            config_id: "k".to_string(),
            build_options: Default::default(),
            window: Window::from_tile(&Default::default(), 1),
            arguments: Vec::new(),
            program: KernelProgram::default(),
        }
    }

    #[test]
    fn test_workload_tensor_identity() {
        let mut wl = ClWorkload::new();
        let info = TensorInfo::f32([4]);
        let a = wl.add_workload_tensor(info.clone(), MemoryType::Core, AuxMemoryInfo::default(), arg(0), TensorId::new(7));
        let b = wl.add_workload_tensor(info, MemoryType::Core, AuxMemoryInfo::default(), arg(3), TensorId::new(7));
        assert_eq!(a, b);
        assert_eq!(wl.tensors[&a].kernel_arg.arg_id, 0);
        assert_eq!(wl.merge_points().get(TensorId::new(7)), Some(a));
    }

    #[test]
    fn test_stats() {
        let mut wl = ClWorkload::new();
        let w = wl.add_workload_tensor(
            TensorInfo::f32([2, 2]),
            MemoryType::Core,
            AuxMemoryInfo::default(),
            arg(0),
            TensorId::new(0),
        );
        let r = wl.add_workload_tensor(
            TensorInfo::f32([2, 2]),
            MemoryType::Auxiliary,
            AuxMemoryInfo::new(AuxMemoryLifetime::Persistent, 16),
            arg(1),
            TensorId::new(1),
        );
        let o = wl.add_workload_tensor(
            TensorInfo::f32([2, 2]),
            MemoryType::Core,
            AuxMemoryInfo::default(),
            arg(2),
            TensorId::new(2),
        );
        wl.add_unit_workload(UnitWorkloadStage::Prepare, code(), &[w], &[r], BTreeMap::new())
            .unwrap();
        wl.add_unit_workload(UnitWorkloadStage::Run, code(), &[r], &[o], BTreeMap::new())
            .unwrap();

        let stats = wl.stats();
        assert_eq!(stats.unit_workloads, 2);
        assert_eq!((stats.prepare_units, stats.run_units), (1, 1));
        assert_eq!((stats.core_tensors, stats.aux_tensors), (2, 1));
        assert_eq!(stats.persistent_bytes, 16);
        assert_eq!(wl.units(UnitWorkloadStage::Run).count(), 1);
        assert!(stats.to_string().starts_with("2 unit workloads"));
    }

    #[test]
    fn test_status_and_json() {
        let mut wl = ClWorkload::new();
        assert!(wl.status().is_ok());
        let json = wl.to_json().unwrap();
        assert!(json.contains("\"unit_workloads\""));
        assert!(!json.contains("status"));

        wl.status = Some(Error::MultipleComplexOperators);
        assert_eq!(wl.status(), Err(Error::MultipleComplexOperators));
        assert!(!wl.is_valid());
    }
}
