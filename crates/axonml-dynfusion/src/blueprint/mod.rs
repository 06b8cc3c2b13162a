//! Kernel Blueprint - Source Emission for One Fusion Group
//!
//! A [`ClKernelBlueprint`] collects the components of one fusion group in a
//! small dependency graph of its own. Blueprint tensors are tied to kernel
//! tensors through merge points. Compiling the blueprint with
//! [`ClKernelBlueprint::build`] produces a [`ClKernelCode`]: tensors at the
//! border of the blueprint graph become kernel arguments, every other tensor
//! stays a tile inside the kernel body.
//!
//! # Example
//! ```
//! use axonml_dynfusion::blueprint::ClKernelBlueprint;
//! use axonml_dynfusion::{ArithmeticOperation, StoreType, TensorInfo, WorkloadContext};
//!
//! let mut bp = ClKernelBlueprint::new();
//! let info = TensorInfo::f32([7, 9, 5]);
//! let lhs = bp.add_tensor(info.clone(), None);
//! let rhs = bp.add_tensor(info.clone(), None);
//! let acc = bp.add_tensor(info.clone(), None);
//! let out = bp.add_tensor(info, None);
//! bp.add_kcomp_eltwise_op(ArithmeticOperation::Add, lhs, rhs, acc).unwrap();
//! bp.add_kcomp_store(StoreType::default(), acc, out).unwrap();
//!
//! let code = bp.build(&WorkloadContext::default()).unwrap();
//! assert_eq!(code.name, "eltwise_add");
//! assert_eq!(code.arguments.len(), 3);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

pub mod code;
mod components;
mod template;

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::config::WorkloadContext;
use crate::dependency_graph::DependencyGraph;
use crate::error::{Error, Result};
use crate::id::{OperatorId, TensorId};
use crate::kernel::{StoreType, TileDescriptor, Window};
use crate::operator_graph::{ArithmeticOperation, Conv2dDescriptor, WeightsGeometry};
use crate::tensor::TensorInfo;

pub use code::{
    ClKernelArgDescriptor, ClKernelCode, KernelProgram, ProgramStep, ProgramTensor, Slot, TensorArgType,
};

use components::{Component, ComponentType, LinkIo};
use template::{global_section, kernel_signature, SharedVarGroup, SharedVarTable};

// =============================================================================
// Blueprint
// =============================================================================

/// Components and tensors of one kernel under construction.
#[derive(Debug, Clone, Default)]
pub struct ClKernelBlueprint {
    graph: DependencyGraph,
    tensors: BTreeMap<TensorId, TensorInfo>,
    components: BTreeMap<OperatorId, Component>,
    num_complex: usize,
    tile: TileDescriptor,
}

impl ClKernelBlueprint {
    /// Creates an empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tensor, or returns the one already bound to `merge_point`.
    pub fn add_tensor(&mut self, info: TensorInfo, merge_point: Option<TensorId>) -> TensorId {
        let id = self.graph.add_tensor(merge_point);
        self.tensors.entry(id).or_insert(info);
        id
    }

    /// Rebinds `merge_point` to `tensor`.
    pub fn update_merge_point(&mut self, tensor: TensorId, merge_point: TensorId) -> Result<()> {
        self.graph.update_merge_point(tensor, merge_point)
    }

    /// The merge point `tensor` is bound to, if any.
    pub fn merge_point_of(&self, tensor: TensorId) -> Option<TensorId> {
        self.graph
            .merge_points()
            .iter()
            .find(|(_, internal)| *internal == tensor)
            .map(|(external, _)| external)
    }

    /// Info of a blueprint tensor.
    pub fn tensor_info(&self, tensor: TensorId) -> Option<&TensorInfo> {
        self.tensors.get(&tensor)
    }

    /// Sets the output tiling of the kernel.
    pub fn set_tile_info(&mut self, tile: TileDescriptor) {
        self.tile = tile;
    }

    /// Number of components added so far.
    pub fn number_of_components(&self) -> usize {
        self.components.len()
    }

    // -------------------------------------------------------------------------
    // Components
    // -------------------------------------------------------------------------

    /// Adds a direct convolution.
    pub fn add_kcomp_direct_conv2d(
        &mut self,
        desc: Conv2dDescriptor,
        src: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        dst: TensorId,
    ) -> Result<OperatorId> {
        self.add_component(Component::DirectConv2d {
            desc,
            src,
            weights,
            bias,
            dst,
        })
    }

    /// Adds a convolution over reshaped `[OFM, KH*KW*IFM]` weights.
    pub fn add_kcomp_gemm_conv2d(
        &mut self,
        desc: Conv2dDescriptor,
        src: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        dst: TensorId,
        geometry: WeightsGeometry,
    ) -> Result<OperatorId> {
        self.add_component(Component::GemmConv2d {
            desc,
            src,
            weights,
            bias,
            dst,
            geometry,
        })
    }

    /// Adds the weights reshape of a GEMM convolution.
    pub fn add_kcomp_reshape_weights(
        &mut self,
        src: TensorId,
        dst: TensorId,
        geometry: WeightsGeometry,
    ) -> Result<OperatorId> {
        self.add_component(Component::ReshapeWeights { src, dst, geometry })
    }

    /// Adds a broadcasting elementwise operation.
    pub fn add_kcomp_eltwise_op(
        &mut self,
        op: ArithmeticOperation,
        lhs: TensorId,
        rhs: TensorId,
        dst: TensorId,
    ) -> Result<OperatorId> {
        self.add_component(Component::Eltwise { op, lhs, rhs, dst })
    }

    /// Adds a store of tile `src` into the memory of `dst`.
    pub fn add_kcomp_store(&mut self, store_type: StoreType, src: TensorId, dst: TensorId) -> Result<OperatorId> {
        self.add_component(Component::Store { store_type, src, dst })
    }

    fn add_component(&mut self, component: Component) -> Result<OperatorId> {
        if component.component_type() == ComponentType::Complex {
            if self.num_complex > 0 {
                return Err(Error::codegen(format!(
                    "cannot add {}: a kernel holds at most one complex component",
                    component.name()
                )));
            }
            self.num_complex += 1;
        }

        let mut inputs: Vec<TensorId> = Vec::new();
        let mut outputs: Vec<TensorId> = Vec::new();
        for link in component.links() {
            if !self.tensors.contains_key(&link.tensor) {
                return Err(Error::codegen(format!(
                    "{} links unknown blueprint tensor {}",
                    component.name(),
                    link.tensor
                )));
            }
            let side = match link.io {
                LinkIo::Input => &mut inputs,
                LinkIo::Output => &mut outputs,
            };
            if !side.contains(&link.tensor) {
                side.push(link.tensor);
            }
        }

        let id = self.graph.add_operator(&inputs, &outputs)?;
        trace!(component = %id, name = %component.name(), "added component");
        self.components.insert(id, component);
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Build
    // -------------------------------------------------------------------------

    /// Compiles the blueprint into kernel code.
    pub fn build(&self, ctx: &WorkloadContext) -> Result<ClKernelCode> {
        let order: Vec<(OperatorId, &Component)> = self
            .graph
            .topological_sort()?
            .into_iter()
            .filter_map(|pack| self.components.get(&pack.op).map(|c| (pack.op, c)))
            .collect();
        if order.is_empty() {
            return Err(Error::codegen("blueprint has no components"));
        }

        let tensors = &self.tensors;
        let info = |t: TensorId| &tensors[&t];
        let global_src = self.graph.global_src_tensors();
        let global_dst = self.graph.global_dst_tensors();

        // Variables and their runtime slots, in component order.
        let mut vtable = SharedVarTable::default();
        let mut slots: BTreeMap<TensorId, Slot> = BTreeMap::new();
        let mut locals: Vec<TensorInfo> = Vec::new();
        for (_, component) in &order {
            for link in component.links() {
                if slots.contains_key(&link.tensor) {
                    continue;
                }
                let is_argument = global_src.contains(&link.tensor) || global_dst.contains(&link.tensor);
                let (group, slot) = if is_argument {
                    (SharedVarGroup::Argument, Slot::Argument(link.tensor.raw()))
                } else {
                    locals.push(info(link.tensor).clone());
                    (SharedVarGroup::Automatic, Slot::Local(locals.len() - 1))
                };
                vtable.add(link.tensor, group, link.name, link.arg_type);
                slots.insert(link.tensor, slot);
            }
        }

        let root = order
            .iter()
            .find(|(_, c)| c.component_type() == ComponentType::Complex)
            .unwrap_or(&order[0])
            .1;
        let root_dst = info(root.dst());

        let name = order
            .iter()
            .filter(|(_, c)| c.component_type() != ComponentType::Store)
            .map(|(_, c)| c.name())
            .collect::<Vec<_>>()
            .join("___");
        let name = if name.is_empty() { "store".to_string() } else { name };

        // Source
        let mut headers: Vec<&str> = Vec::new();
        for (_, component) in &order {
            for header in component.headers() {
                if !headers.contains(header) {
                    headers.push(header);
                }
            }
        }
        let mut code = String::new();
        for header in headers {
            code.push_str(&format!("#include \"{header}\"\n"));
        }
        code.push_str(&kernel_signature(&name, &vtable));
        code.push_str("\n{\n");
        code.push_str(&global_section(&self.tile));
        for (id, component) in &order {
            code.push_str(&component.code(*id, &vtable)?);
        }
        code.push_str("}\n");

        // Build options
        let mut build_options: BTreeSet<String> = BTreeSet::new();
        for (_, component) in &order {
            build_options.extend(component.build_options(info));
        }
        let (n0, m0) = if self.tile.is_empty() {
            (1, 1)
        } else {
            (self.tile.tile_dims.x, self.tile.tile_dims.y)
        };
        build_options.insert(format!("-DN0={n0}"));
        build_options.insert(format!("-DM0={m0}"));
        build_options.insert(format!("-DPARTIAL_N0={}", self.tile.boundaries.x % n0));
        build_options.insert(format!("-DPARTIAL_STORE_N0={}", self.tile.boundaries.x % n0));
        build_options.insert(format!("-DPARTIAL_STORE_M0={}", self.tile.boundaries.y % m0));
        build_options.insert(format!("-DGPU_ARCH_{}", ctx.target().name().to_ascii_uppercase()));

        let arguments = vtable
            .arguments()
            .map(|(tensor, var)| ClKernelArgDescriptor {
                arg_id: tensor.raw(),
                tensor_arg_type: var.arg_type,
                slide_along_dimz: true,
            })
            .collect();

        let operand = |t: TensorId| ProgramTensor {
            slot: slots[&t],
            info: info(t).clone(),
        };
        let steps = order.iter().map(|(_, c)| c.program_step(operand)).collect();

        Ok(ClKernelCode {
            name,
            code,
            config_id: root.config_id(root_dst),
            build_options,
            window: Window::from_tile(&self.tile, root.window_depth(root_dst)),
            arguments,
            program: KernelProgram { steps, locals },
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::eltwise_tile;

    fn conv_blueprint() -> (ClKernelBlueprint, [TensorId; 7]) {
        let mut bp = ClKernelBlueprint::new();
        let src = bp.add_tensor(TensorInfo::f32([1, 12, 12, 384]), Some(TensorId::new(0)));
        let wei = bp.add_tensor(TensorInfo::f32([1, 1, 384, 16]), Some(TensorId::new(1)));
        let acc = bp.add_tensor(TensorInfo::f32([1, 12, 12, 16]), Some(TensorId::new(2)));
        let addend = bp.add_tensor(TensorInfo::f32([1, 12, 12, 16]), Some(TensorId::new(3)));
        let sum = bp.add_tensor(TensorInfo::f32([1, 12, 12, 16]), Some(TensorId::new(4)));
        bp.add_kcomp_direct_conv2d(Conv2dDescriptor::default(), src, wei, None, acc)
            .unwrap();
        bp.add_kcomp_eltwise_op(ArithmeticOperation::Add, acc, addend, sum)
            .unwrap();
        let stored = bp.add_tensor(TensorInfo::f32([1, 12, 12, 16]), None);
        bp.update_merge_point(stored, TensorId::new(4)).unwrap();
        bp.add_kcomp_store(StoreType::default(), sum, stored).unwrap();
        (bp, [src, wei, acc, addend, sum, stored, TensorId::new(4)])
    }

    #[test]
    fn test_fused_kernel_arguments_and_tiles() {
        let (mut bp, [src, wei, acc, addend, sum, stored, _]) = conv_blueprint();
        bp.set_tile_info(crate::kernel::conv_tile(&TensorInfo::f32([1, 12, 12, 16])));
        let code = bp.build(&WorkloadContext::default()).unwrap();

        assert_eq!(code.name, "direct_conv2d___eltwise_add");
        let args: Vec<i32> = code.arguments.iter().map(|a| a.arg_id).collect();
        assert_eq!(args, vec![src.raw(), wei.raw(), addend.raw(), stored.raw()]);
        assert_eq!(code.program.locals.len(), 2);
        assert_eq!(code.program.steps.len(), 3);
        assert!(!args.contains(&acc.raw()));
        assert!(!args.contains(&sum.raw()));

        assert!(code.code.starts_with("#include \"helpers.h\"\n#include \"tile_helpers.h\"\n"));
        assert!(code.code.contains("__kernel void direct_conv2d___eltwise_add("));
        assert!(code.build_options.contains("-DN0=4"));
        assert!(code.build_options.contains("-D_ISRC_CHANNELS=384"));
        assert_eq!(code.config_id, "direct_conv2d_f32_1_12_12_16_1_1");
        assert_eq!(code.window.z.end, 1);
    }

    #[test]
    fn test_store_rebinds_merge_point() {
        let (bp, [_, _, _, _, sum, stored, merge]) = conv_blueprint();
        assert_eq!(bp.merge_point_of(stored), Some(merge));
        assert_eq!(bp.merge_point_of(sum), None);
    }

    #[test]
    fn test_second_complex_component_rejected() {
        let (mut bp, [src, wei, ..]) = conv_blueprint();
        let other = bp.add_tensor(TensorInfo::f32([1, 12, 12, 16]), None);
        let err = bp
            .add_kcomp_direct_conv2d(Conv2dDescriptor::default(), src, wei, None, other)
            .unwrap_err();
        assert!(matches!(err, Error::Codegen { .. }));
    }

    #[test]
    fn test_empty_blueprint_fails_to_build() {
        let bp = ClKernelBlueprint::new();
        assert!(matches!(bp.build(&WorkloadContext::default()), Err(Error::Codegen { .. })));
    }

    #[test]
    fn test_broadcast_eltwise_kernel() {
        let mut bp = ClKernelBlueprint::new();
        let out_info = TensorInfo::f32([7, 9, 5]);
        let lhs = bp.add_tensor(out_info.clone(), None);
        let rhs = bp.add_tensor(TensorInfo::f32([7, 1, 1]), None);
        let acc = bp.add_tensor(out_info.clone(), None);
        let out = bp.add_tensor(out_info.clone(), None);
        bp.add_kcomp_eltwise_op(ArithmeticOperation::Add, lhs, rhs, acc).unwrap();
        bp.add_kcomp_store(StoreType::StoreVectorSelect, acc, out).unwrap();
        bp.set_tile_info(eltwise_tile(&out_info));

        let code = bp.build(&WorkloadContext::default()).unwrap();
        assert!(code.code.contains("STORE_VECTOR_SELECT"));
        assert!(code.build_options.contains("-DN0=4"));
        assert!(code.build_options.contains("-DPARTIAL_N0=1"));
        assert_eq!(code.window.num_iterations(), 2 * 9 * 7);
    }
}
