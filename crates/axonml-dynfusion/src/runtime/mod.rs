//! Runtime - Reference Execution of Workloads
//!
//! A CPU runtime for [`ClWorkload`]s. The caller binds its tensors with
//! [`bind_tensors`], which also allocates every auxiliary tensor, then drives
//! a [`CompositeOperator`]: `configure` once, `prepare` once and `run` as
//! often as needed. Each unit workload is executed by interpreting the
//! component program of its kernel.
//!
//! Only `F32` workloads can be executed.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

mod cache;
mod executor;

pub use cache::{CacheStats, KernelCache};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::blueprint::ClKernelCode;
use crate::error::{Error, Result};
use crate::id::TensorId;
use crate::kernel::UnitWorkloadStage;
use crate::kernel_graph::{AuxMemoryInfo, MemoryType};
use crate::tensor::{DataType, TensorInfo};
use crate::workload::{ClWorkload, UnitWorkloadId};

// =============================================================================
// Tensors
// =============================================================================

/// A dense `f32` tensor in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    /// Shape, data type and layout.
    pub info: TensorInfo,
    /// Elements.
    pub data: Vec<f32>,
}

impl CpuTensor {
    /// Wraps `data`, which must hold exactly the elements of `info`.
    pub fn new(info: TensorInfo, data: Vec<f32>) -> Result<Self> {
        let numel = info.shape.numel();
        if data.len() != numel {
            return Err(Error::shape_mismatch(&[numel], &[data.len()]));
        }
        Ok(Self { info, data })
    }

    /// A zero-filled tensor.
    pub fn zeros(info: TensorInfo) -> Self {
        Self::filled(info, 0.0)
    }

    /// A tensor with every element set to `value`.
    pub fn filled(info: TensorInfo, value: f32) -> Self {
        let data = vec![value; info.shape.numel()];
        Self { info, data }
    }

    /// A tensor whose elements are `f(linear index)`.
    pub fn from_fn(info: TensorInfo, f: impl Fn(usize) -> f32) -> Self {
        let data = (0..info.shape.numel()).map(f).collect();
        Self { info, data }
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// Caller tensors keyed by operator-graph tensor id.
pub type OpTensorBinding = BTreeMap<TensorId, CpuTensor>;

/// Auxiliary tensors owned by the runtime, keyed by workload tensor id.
#[derive(Debug, Clone, Default)]
pub struct AuxTensorData {
    tensors: BTreeMap<TensorId, CpuTensor>,
    memory: BTreeMap<TensorId, AuxMemoryInfo>,
}

impl AuxTensorData {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the tensor once; later calls for the same id are no-ops.
    pub fn add_aux_tensor(&mut self, id: TensorId, info: &TensorInfo, memory_info: AuxMemoryInfo) {
        self.tensors
            .entry(id)
            .or_insert_with(|| CpuTensor::zeros(info.clone()));
        self.memory.entry(id).or_insert(memory_info);
    }

    /// An allocated tensor.
    pub fn get(&self, id: TensorId) -> Option<&CpuTensor> {
        self.tensors.get(&id)
    }

    /// An allocated tensor, mutably.
    pub fn get_mut(&mut self, id: TensorId) -> Option<&mut CpuTensor> {
        self.tensors.get_mut(&id)
    }

    /// Allocation request of a tensor.
    pub fn memory_info(&self, id: TensorId) -> Option<&AuxMemoryInfo> {
        self.memory.get(&id)
    }

    /// Number of allocated tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Returns whether nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Requested bytes of every allocated tensor.
    pub fn total_bytes(&self) -> usize {
        self.memory.values().map(|m| m.size).sum()
    }
}

// =============================================================================
// Tensor Packs
// =============================================================================

/// Where a kernel argument's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRef {
    /// A caller tensor, by operator-graph tensor id.
    Core(TensorId),
    /// A runtime tensor, by workload tensor id.
    Aux(TensorId),
}

/// Tensors of one unit workload, by kernel argument id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorPack {
    tensors: BTreeMap<i32, TensorRef>,
}

impl TensorPack {
    /// Creates an empty pack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds argument `arg_id`.
    pub fn add_tensor(&mut self, arg_id: i32, tensor: TensorRef) {
        self.tensors.insert(arg_id, tensor);
    }

    /// The tensor bound to `arg_id`.
    pub fn get(&self, arg_id: i32) -> Option<TensorRef> {
        self.tensors.get(&arg_id).copied()
    }

    /// Number of bound arguments.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Returns whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Packs by unit workload.
pub type TensorPackMap = BTreeMap<UnitWorkloadId, TensorPack>;

/// Builds the tensor packs of every unit workload.
///
/// Core tensors are looked up in `op_tensors` through the workload's
/// `op_tensor_id_lut`; auxiliary tensors are allocated in `aux`.
pub fn bind_tensors(
    aux: &mut AuxTensorData,
    prepare_packs: &mut TensorPackMap,
    run_packs: &mut TensorPackMap,
    workload: &ClWorkload,
    op_tensors: &OpTensorBinding,
) -> Result<()> {
    workload.status()?;
    for unit in workload.unit_workloads.values() {
        let mut pack = TensorPack::new();
        for (&arg_id, &workload_tensor) in &unit.bindings {
            let tensor = workload
                .tensors
                .get(&workload_tensor)
                .ok_or_else(|| Error::internal(format!("unknown workload tensor {workload_tensor}")))?;
            let tensor_ref = match tensor.memory_type {
                MemoryType::Core => {
                    let op_tensor = workload
                        .op_tensor_id_lut
                        .get(&workload_tensor)
                        .copied()
                        .ok_or_else(|| Error::internal(format!("core tensor {workload_tensor} missing from lut")))?;
                    let bound = op_tensors.get(&op_tensor).ok_or(Error::MissingBinding {
                        tensor: op_tensor.raw(),
                    })?;
                    if bound.info.shape != tensor.info.shape {
                        return Err(Error::shape_mismatch(tensor.info.shape.dims(), bound.info.shape.dims()));
                    }
                    TensorRef::Core(op_tensor)
                }
                MemoryType::Auxiliary => {
                    aux.add_aux_tensor(workload_tensor, &tensor.info, tensor.memory_info);
                    TensorRef::Aux(workload_tensor)
                }
            };
            pack.add_tensor(arg_id, tensor_ref);
        }
        trace!(unit = %unit.id, arguments = pack.len(), "bound tensors");
        match unit.stage {
            UnitWorkloadStage::Prepare => prepare_packs.insert(unit.id, pack),
            UnitWorkloadStage::Run => run_packs.insert(unit.id, pack),
        };
    }
    Ok(())
}

// =============================================================================
// Composite Operator
// =============================================================================

struct ConfiguredUnit {
    id: UnitWorkloadId,
    stage: UnitWorkloadStage,
    code: Arc<ClKernelCode>,
}

/// Executes a workload's unit workloads in order.
pub struct CompositeOperator {
    cache: Arc<KernelCache>,
    units: Vec<ConfiguredUnit>,
    prepared: bool,
}

impl CompositeOperator {
    /// Creates an operator with its own kernel cache.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(KernelCache::default()))
    }

    /// Creates an operator sharing `cache`.
    pub fn with_cache(cache: Arc<KernelCache>) -> Self {
        Self {
            cache,
            units: Vec::new(),
            prepared: false,
        }
    }

    /// Checks that `workload` can be executed and loads its kernels.
    pub fn configure(&mut self, workload: &ClWorkload) -> Result<()> {
        workload.status()?;
        if let Some(tensor) = workload.tensors.values().find(|t| t.info.data_type != DataType::F32) {
            return Err(Error::NotImplemented {
                message: format!(
                    "reference runtime executes f32 only, tensor {} is {}",
                    tensor.id,
                    tensor.info.data_type.name()
                ),
            });
        }

        self.units = workload
            .unit_workloads
            .values()
            .map(|unit| ConfiguredUnit {
                id: unit.id,
                stage: unit.stage,
                code: self.cache.get_or_insert(&unit.code),
            })
            .collect();
        self.prepared = false;
        debug!(units = self.units.len(), cached = self.cache.len(), "configured composite operator");
        Ok(())
    }

    /// Runs the prepare-stage units. Later calls do nothing.
    pub fn prepare(
        &mut self,
        packs: &TensorPackMap,
        aux: &mut AuxTensorData,
        op_tensors: &mut OpTensorBinding,
    ) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        self.dispatch(UnitWorkloadStage::Prepare, packs, aux, op_tensors)?;
        self.prepared = true;
        Ok(())
    }

    /// Runs the run-stage units.
    pub fn run(&self, packs: &TensorPackMap, aux: &mut AuxTensorData, op_tensors: &mut OpTensorBinding) -> Result<()> {
        if !self.prepared && self.units.iter().any(|u| u.stage == UnitWorkloadStage::Prepare) {
            return Err(Error::runtime("prepare must run before the first run"));
        }
        self.dispatch(UnitWorkloadStage::Run, packs, aux, op_tensors)
    }

    /// Number of configured unit workloads.
    pub fn number_of_units(&self) -> usize {
        self.units.len()
    }

    /// The shared kernel cache.
    pub fn cache(&self) -> &Arc<KernelCache> {
        &self.cache
    }

    fn dispatch(
        &self,
        stage: UnitWorkloadStage,
        packs: &TensorPackMap,
        aux: &mut AuxTensorData,
        op_tensors: &mut OpTensorBinding,
    ) -> Result<()> {
        for unit in self.units.iter().filter(|u| u.stage == stage) {
            let pack = packs
                .get(&unit.id)
                .ok_or_else(|| Error::runtime(format!("no tensor pack for unit workload {}", unit.id)))?;
            debug!(unit = %unit.id, kernel = %unit.code.name, stage = ?stage, "dispatching unit workload");
            executor::execute(&unit.code, pack, aux, op_tensors)?;
        }
        Ok(())
    }
}

impl Default for CompositeOperator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::build;
    use crate::config::WorkloadContext;
    use crate::operator_graph::OperatorGraph;

    fn add_graph() -> (OperatorGraph, [TensorId; 3]) {
        let mut graph = OperatorGraph::new();
        let lhs = graph.add_tensor(TensorInfo::f32([2, 3]));
        let rhs = graph.add_tensor(TensorInfo::f32([2, 1]));
        let dst = graph.add_tensor(TensorInfo::empty());
        graph.add_op_elementwise_add(lhs, rhs, dst).unwrap();
        (graph, [lhs.id(), rhs.id(), dst.id()])
    }

    #[test]
    fn test_cpu_tensor_len_checked() {
        assert!(CpuTensor::new(TensorInfo::f32([2, 2]), vec![0.0; 3]).is_err());
        assert_eq!(CpuTensor::from_fn(TensorInfo::f32([3]), |i| i as f32).data, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_missing_binding() {
        let (graph, [lhs, _, dst]) = add_graph();
        let mut workload = ClWorkload::new();
        build(&mut workload, &graph, &WorkloadContext::default()).unwrap();

        let mut op_tensors = OpTensorBinding::new();
        op_tensors.insert(lhs, CpuTensor::zeros(TensorInfo::f32([2, 3])));
        op_tensors.insert(dst, CpuTensor::zeros(TensorInfo::f32([2, 3])));

        let mut aux = AuxTensorData::new();
        let (mut prepare, mut run) = (TensorPackMap::new(), TensorPackMap::new());
        let err = bind_tensors(&mut aux, &mut prepare, &mut run, &workload, &op_tensors).unwrap_err();
        assert!(matches!(err, Error::MissingBinding { .. }));
    }

    #[test]
    fn test_run_broadcast_add() {
        let (graph, [lhs, rhs, dst]) = add_graph();
        let mut workload = ClWorkload::new();
        build(&mut workload, &graph, &WorkloadContext::default()).unwrap();

        let mut op_tensors = OpTensorBinding::new();
        op_tensors.insert(lhs, CpuTensor::from_fn(TensorInfo::f32([2, 3]), |i| i as f32));
        op_tensors.insert(rhs, CpuTensor::new(TensorInfo::f32([2, 1]), vec![10.0, 20.0]).unwrap());
        op_tensors.insert(dst, CpuTensor::zeros(TensorInfo::f32([2, 3])));

        let mut aux = AuxTensorData::new();
        let (mut prepare, mut run) = (TensorPackMap::new(), TensorPackMap::new());
        bind_tensors(&mut aux, &mut prepare, &mut run, &workload, &op_tensors).unwrap();
        assert!(prepare.is_empty());
        assert!(aux.is_empty());

        let mut op = CompositeOperator::new();
        op.configure(&workload).unwrap();
        op.prepare(&prepare, &mut aux, &mut op_tensors).unwrap();
        op.run(&run, &mut aux, &mut op_tensors).unwrap();
        assert_eq!(op_tensors[&dst].data, vec![10.0, 11.0, 12.0, 23.0, 24.0, 25.0]);
    }

    #[test]
    fn test_shape_mismatch_on_bind() {
        let (graph, [lhs, rhs, dst]) = add_graph();
        let mut workload = ClWorkload::new();
        build(&mut workload, &graph, &WorkloadContext::default()).unwrap();

        let mut op_tensors = OpTensorBinding::new();
        op_tensors.insert(lhs, CpuTensor::zeros(TensorInfo::f32([3, 2])));
        op_tensors.insert(rhs, CpuTensor::zeros(TensorInfo::f32([2, 1])));
        op_tensors.insert(dst, CpuTensor::zeros(TensorInfo::f32([2, 3])));

        let mut aux = AuxTensorData::new();
        let (mut prepare, mut run) = (TensorPackMap::new(), TensorPackMap::new());
        let err = bind_tensors(&mut aux, &mut prepare, &mut run, &workload, &op_tensors).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
