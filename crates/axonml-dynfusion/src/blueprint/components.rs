//! Kernel Components
//!
//! The building blocks of a fused kernel. Each component declares the
//! tensors it links, the source code it contributes, its build options and
//! the program step the reference runtime executes for it.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use crate::blueprint::code::{ProgramStep, ProgramTensor, TensorArgType};
use crate::blueprint::template::{replace_tags, SharedVarGroup, SharedVarTable, TagLut};
use crate::error::{Error, Result};
use crate::id::{OperatorId, TensorId};
use crate::kernel::StoreType;
use crate::operator_graph::{ArithmeticOperation, Conv2dDescriptor, WeightsGeometry};
use crate::tensor::TensorInfo;

// =============================================================================
// Links
// =============================================================================

/// Direction of a component link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkIo {
    Input,
    Output,
}

/// A tensor used by a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) tensor: TensorId,
    pub(crate) io: LinkIo,
    /// Template tag and variable base name.
    pub(crate) name: &'static str,
    pub(crate) arg_type: TensorArgType,
}

impl Link {
    fn input(tensor: TensorId, name: &'static str, arg_type: TensorArgType) -> Self {
        Self {
            tensor,
            io: LinkIo::Input,
            name,
            arg_type,
        }
    }

    fn output(tensor: TensorId, name: &'static str) -> Self {
        Self {
            tensor,
            io: LinkIo::Output,
            name,
            arg_type: TensorArgType::Tensor4DtBuffer,
        }
    }
}

/// Role of a component in a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComponentType {
    Complex,
    Simple,
    Store,
}

// =============================================================================
// Components
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Component {
    DirectConv2d {
        desc: Conv2dDescriptor,
        src: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        dst: TensorId,
    },
    GemmConv2d {
        desc: Conv2dDescriptor,
        src: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        dst: TensorId,
        geometry: WeightsGeometry,
    },
    ReshapeWeights {
        src: TensorId,
        dst: TensorId,
        geometry: WeightsGeometry,
    },
    Eltwise {
        op: ArithmeticOperation,
        lhs: TensorId,
        rhs: TensorId,
        dst: TensorId,
    },
    Store {
        store_type: StoreType,
        src: TensorId,
        dst: TensorId,
    },
}

impl Component {
    pub(crate) fn component_type(&self) -> ComponentType {
        match self {
            Self::DirectConv2d { .. } | Self::GemmConv2d { .. } | Self::ReshapeWeights { .. } => ComponentType::Complex,
            Self::Eltwise { .. } => ComponentType::Simple,
            Self::Store { .. } => ComponentType::Store,
        }
    }

    pub(crate) fn name(&self) -> String {
        match self {
            Self::DirectConv2d { .. } => "direct_conv2d".to_string(),
            Self::GemmConv2d { .. } => "gemm_conv2d".to_string(),
            Self::ReshapeWeights { .. } => "reshape_weights".to_string(),
            Self::Eltwise { op, .. } => format!("eltwise_{op}"),
            Self::Store { .. } => "store".to_string(),
        }
    }

    pub(crate) fn dst(&self) -> TensorId {
        match self {
            Self::DirectConv2d { dst, .. }
            | Self::GemmConv2d { dst, .. }
            | Self::ReshapeWeights { dst, .. }
            | Self::Eltwise { dst, .. }
            | Self::Store { dst, .. } => *dst,
        }
    }

    /// Linked tensors, inputs first.
    pub(crate) fn links(&self) -> Vec<Link> {
        match self {
            Self::DirectConv2d {
                src, weights, bias, dst, ..
            }
            | Self::GemmConv2d {
                src, weights, bias, dst, ..
            } => {
                let weights_type = if matches!(self, Self::GemmConv2d { .. }) {
                    TensorArgType::Image
                } else {
                    TensorArgType::Tensor4DtBuffer
                };
                let mut links = vec![
                    Link::input(*src, "src", TensorArgType::Tensor4DtBuffer),
                    Link::input(*weights, "weights", weights_type),
                ];
                links.extend(bias.map(|b| Link::input(b, "bias", TensorArgType::Vector)));
                links.push(Link::output(*dst, "dst"));
                links
            }
            Self::ReshapeWeights { src, dst, .. } => vec![
                Link::input(*src, "src", TensorArgType::Tensor4D),
                Link::output(*dst, "dst"),
            ],
            Self::Eltwise { lhs, rhs, dst, .. } => vec![
                Link::input(*lhs, "lhs", TensorArgType::Tensor4DtBuffer),
                Link::input(*rhs, "rhs", TensorArgType::Tensor4DtBuffer),
                Link::output(*dst, "dst"),
            ],
            Self::Store { src, dst, .. } => vec![
                Link::input(*src, "src", TensorArgType::Tensor4DtBuffer),
                Link::output(*dst, "dst"),
            ],
        }
    }

    pub(crate) fn headers(&self) -> &'static [&'static str] {
        match self {
            Self::Store { .. } => &["helpers.h"],
            _ => &["helpers.h", "tile_helpers.h"],
        }
    }

    // -------------------------------------------------------------------------
    // Source
    // -------------------------------------------------------------------------

    /// Instantiates the component's template with the names of `vtable`.
    pub(crate) fn code(&self, id: OperatorId, vtable: &SharedVarTable) -> Result<String> {
        let mut tags = TagLut::default();
        for link in self.links() {
            let var = vtable
                .get(link.tensor)
                .ok_or_else(|| Error::codegen(format!("tensor {} has no variable", link.tensor)))?;
            tags.insert(link.name, var.uniq_name.clone());
        }
        tags.insert("meta_kernel_id", id.raw().to_string());

        let template = match self {
            Self::DirectConv2d { bias, dst, .. } | Self::GemmConv2d { bias, dst, .. } => {
                let bias_add = match bias {
                    Some(b) => bias_add_code(var_name(vtable, *b)?, var_name(vtable, *dst)?),
                    None => String::new(),
                };
                tags.insert("bias_add", bias_add);
                if matches!(self, Self::DirectConv2d { .. }) {
                    DIRECT_CONV2D_TEMPLATE
                } else {
                    GEMM_CONV2D_TEMPLATE
                }
            }
            Self::ReshapeWeights { .. } => RESHAPE_WEIGHTS_TEMPLATE,
            Self::Eltwise { op, lhs, rhs, .. } => {
                let mut load = String::new();
                for (tag, tensor) in [("lhs_tile", *lhs), ("rhs_tile", *rhs)] {
                    let var = vtable
                        .get(tensor)
                        .ok_or_else(|| Error::codegen(format!("tensor {tensor} has no variable")))?;
                    if var.group == SharedVarGroup::Argument {
                        let tile = format!("{}_tile", var.uniq_name);
                        load.push_str(&format!(
                            "        TILE(DATA_TYPE, M0, N0, {tile});\n        \
                             T_LOAD(DATA_TYPE, M0, N0, BUFFER, {name}, g_x * N0, g_y, 1, {name}_stride_y, {tile});\n",
                            name = var.uniq_name
                        ));
                        tags.insert(tag, tile);
                    } else {
                        tags.insert(tag, var.uniq_name.clone());
                    }
                }
                tags.insert("load", load);
                tags.insert("op", op.name().to_ascii_uppercase());
                ELTWISE_TEMPLATE
            }
            Self::Store { store_type, .. } => match store_type {
                StoreType::TStoreIndirectWidthSelect => STORE_INDIRECT_WIDTH_SELECT_TEMPLATE,
                StoreType::StoreBlockBoundaryAware => STORE_BLOCK_BOUNDARY_AWARE_TEMPLATE,
                StoreType::StoreVectorSelect => STORE_VECTOR_SELECT_TEMPLATE,
            },
        };

        replace_tags(template, &tags)
    }

    /// `-D` flags contributed by the component.
    pub(crate) fn build_options<'a>(&self, info: impl Fn(TensorId) -> &'a TensorInfo) -> Vec<String> {
        match self {
            Self::DirectConv2d {
                desc, src, weights, dst, ..
            } => {
                let src = info(*src);
                let dst = info(*dst);
                let wg = WeightsGeometry::of(info(*weights), src.data_layout);
                conv_options(desc, src, dst, &wg)
            }
            Self::GemmConv2d {
                desc, src, dst, geometry, ..
            } => {
                let mut options = conv_options(desc, info(*src), info(*dst), geometry);
                options.push(format!("-D_IREDUCTION={}", geometry.reduction_size()));
                options
            }
            Self::ReshapeWeights { src, geometry, .. } => vec![
                format!("-DDATA_TYPE={}", info(*src).data_type.cl_type()),
                format!("-D_ISRC_CHANNELS={}", geometry.ifm),
                format!("-D_IDST_CHANNELS={}", geometry.ofm),
                format!("-D_IWEI_WIDTH={}", geometry.kernel_w),
                format!("-D_IREDUCTION={}", geometry.reduction_size()),
            ],
            Self::Eltwise { lhs, rhs, dst, .. } => vec![
                format!("-DDATA_TYPE={}", info(*dst).data_type.cl_type()),
                format!("-D_ILHS_SHAPE={}", shape_option(info(*lhs))),
                format!("-D_IRHS_SHAPE={}", shape_option(info(*rhs))),
            ],
            Self::Store { .. } => Vec::new(),
        }
    }

    /// Depth of the execution window when this component is the root.
    pub(crate) fn window_depth(&self, dst: &TensorInfo) -> usize {
        match self {
            Self::DirectConv2d { .. } | Self::GemmConv2d { .. } => dst.shape.collapsed_from_back(3),
            Self::ReshapeWeights { .. } => 1,
            Self::Eltwise { .. } | Self::Store { .. } => dst.shape.collapsed_from_back(2),
        }
    }

    pub(crate) fn config_id(&self, dst: &TensorInfo) -> String {
        let mut id = format!("{}_{}", self.name(), dst.data_type.name());
        for dim in dst.shape.dims() {
            id.push_str(&format!("_{dim}"));
        }
        if let Self::DirectConv2d { desc, .. } | Self::GemmConv2d { desc, .. } = self {
            id.push_str(&format!("_{}_{}", desc.stride.x, desc.stride.y));
        }
        id
    }

    // -------------------------------------------------------------------------
    // Program
    // -------------------------------------------------------------------------

    /// The step executed by the reference runtime.
    pub(crate) fn program_step(&self, operand: impl Fn(TensorId) -> ProgramTensor) -> ProgramStep {
        match self {
            Self::DirectConv2d {
                desc,
                src,
                weights,
                bias,
                dst,
            } => ProgramStep::DirectConv2d {
                desc: *desc,
                src: operand(*src),
                weights: operand(*weights),
                bias: bias.map(&operand),
                dst: operand(*dst),
            },
            Self::GemmConv2d {
                desc,
                src,
                weights,
                bias,
                dst,
                geometry,
            } => ProgramStep::GemmConv2d {
                desc: *desc,
                src: operand(*src),
                weights: operand(*weights),
                bias: bias.map(&operand),
                dst: operand(*dst),
                geometry: *geometry,
            },
            Self::ReshapeWeights { src, dst, geometry } => ProgramStep::ReshapeWeights {
                src: operand(*src),
                dst: operand(*dst),
                geometry: *geometry,
            },
            Self::Eltwise { op, lhs, rhs, dst } => ProgramStep::Elementwise {
                op: *op,
                lhs: operand(*lhs),
                rhs: operand(*rhs),
                dst: operand(*dst),
            },
            Self::Store { src, dst, .. } => ProgramStep::Store {
                src: operand(*src),
                dst: operand(*dst),
            },
        }
    }
}

fn var_name(vtable: &SharedVarTable, tensor: TensorId) -> Result<&str> {
    vtable
        .get(tensor)
        .map(|v| v.uniq_name.as_str())
        .ok_or_else(|| Error::codegen(format!("tensor {tensor} has no variable")))
}

fn bias_add_code(bias: &str, dst: &str) -> String {
    format!(
        "\n        TILE(DATA_TYPE, 1, N0, bias0);\n        \
         T_LOAD(DATA_TYPE, 1, N0, BUFFER, {bias}, cout, 0, 1, 0, bias0);\n        \
         T_ELTWISE_BROADCAST_ADD_X(ACC_DATA_TYPE, M0, N0, {dst}, bias0, {dst});\n"
    )
}

/// Dimensions joined with `x`, outermost first.
fn shape_option(info: &TensorInfo) -> String {
    info.shape.dims().iter().map(ToString::to_string).collect::<Vec<_>>().join("x")
}

fn conv_options(desc: &Conv2dDescriptor, src: &TensorInfo, dst: &TensorInfo, wg: &WeightsGeometry) -> Vec<String> {
    let k0 = crate::kernel::adjust_vec_size(16 / src.element_size().max(1), src.channels());
    vec![
        format!("-DDATA_TYPE={}", src.data_type.cl_type()),
        format!("-DACC_DATA_TYPE={}", src.data_type.cl_type()),
        "-DZERO_VALUE=0".to_string(),
        format!("-DK0={k0}"),
        format!("-D_ISRC_WIDTH={}", src.width()),
        format!("-D_ISRC_HEIGHT={}", src.height()),
        format!("-D_ISRC_CHANNELS={}", src.channels()),
        format!("-D_IDST_WIDTH={}", dst.width()),
        format!("-D_IDST_HEIGHT={}", dst.height()),
        format!("-D_IDST_CHANNELS={}", dst.channels()),
        format!("-D_IWEI_WIDTH={}", wg.kernel_w),
        format!("-D_IWEI_HEIGHT={}", wg.kernel_h),
        format!("-D_ISTRIDE_X={}", desc.stride.x),
        format!("-D_ISTRIDE_Y={}", desc.stride.y),
        format!("-D_IPAD_LEFT={}", desc.pad.left),
        format!("-D_IPAD_TOP={}", desc.pad.top),
    ]
}

// =============================================================================
// Templates
// =============================================================================

const DIRECT_CONV2D_TEMPLATE: &str = r#"
    //------------------ START KERNEL {{meta_kernel_id}} ---------------------
    // IN_0(src)            {{src}}
    // IN_1(wei)            {{weights}}
    // OUT(dst, accum)      {{dst}}

    TILE(ACC_DATA_TYPE, M0, N0, {{dst}});
    {
        const int cout = GET_SPATIAL_IDX(0, N0, PARTIAL_N0);
        const int mout = GET_SPATIAL_IDX(1, M0, 0);
        const int bout = GET_SPATIAL_IDX(2, 1, 0);

        TILE(int, M0, 1, xi);
        TILE(int, M0, 1, yi);

        LOOP_UNROLLING(int, i, 0, 1, M0,
        {
            xi[i].v = ((mout + i) % _IDST_WIDTH) * _ISTRIDE_X - _IPAD_LEFT;
            yi[i].v = ((mout + i) / _IDST_WIDTH) * _ISTRIDE_Y - _IPAD_TOP;
        })

        LOOP_UNROLLING(int, i, 0, 1, M0,
        {
            {{dst}}[i].v = 0;
        })

        for(int i = 0; i < (_IWEI_WIDTH * _IWEI_HEIGHT); ++i)
        {
            int xk = i % _IWEI_WIDTH;
            int yk = i / _IWEI_WIDTH;

            TILE(int, M0, 1, my);
            LOOP_UNROLLING(int, m, 0, 1, M0,
            {
                int x_s = xi[m].v + xk;
                int y_s = yi[m].v + yk;
                my[m].v = x_s + y_s * _ISRC_WIDTH + bout * (int)(_ISRC_WIDTH * _ISRC_HEIGHT);
                my[m].v = select(-1, my[m].v, ((x_s >= 0) && (x_s < _ISRC_WIDTH) && (y_s >= 0) && (y_s < _ISRC_HEIGHT)));
            })

            for(int ck = 0; ck < _ISRC_CHANNELS; ck += K0)
            {
                TILE(DATA_TYPE, M0, K0, a);
                TILE(DATA_TYPE, N0, K0, b);

                LOOP_UNROLLING(int, m, 0, 1, M0, { a[m].v = ZERO_VALUE; })
                LOOP_UNROLLING(int, n, 0, 1, N0, { b[n].v = ZERO_VALUE; })

                T_LOAD2D_INDIRECT(DATA_TYPE, M0, K0, BUFFER, {{src}}, ck, {{src}}_stride_y, my, a);
                T_LOAD(DATA_TYPE, N0, K0, BUFFER, {{weights}}, ck, cout * _IWEI_WIDTH * _IWEI_HEIGHT + i, 1, {{weights}}_stride_y, b);

                T_MMUL(DATA_TYPE, DATA_TYPE, ACC_DATA_TYPE, M0, N0, K0, NT, T, a, b, {{dst}});
            }
        }
{{bias_add}}    }
    //------------------ END KERNEL {{meta_kernel_id}} ---------------------
"#;

const GEMM_CONV2D_TEMPLATE: &str = r#"
    //------------------ START KERNEL {{meta_kernel_id}} ---------------------
    // IN_0(src)            {{src}}
    // IN_1(wei)            {{weights}}
    // OUT(dst, accum)      {{dst}}

    TILE(ACC_DATA_TYPE, M0, N0, {{dst}});
    {
        const int cout = GET_SPATIAL_IDX(0, N0, PARTIAL_N0);
        const int mout = GET_SPATIAL_IDX(1, M0, 0);
        const int bout = GET_SPATIAL_IDX(2, 1, 0);

        LOOP_UNROLLING(int, i, 0, 1, M0,
        {
            {{dst}}[i].v = 0;
        })

        for(int k = 0; k < _IREDUCTION; ++k)
        {
            const int ck = k % _ISRC_CHANNELS;
            const int xk = (k / _ISRC_CHANNELS) % _IWEI_WIDTH;
            const int yk = k / (_ISRC_CHANNELS * _IWEI_WIDTH);

            TILE(int, M0, 1, my);
            LOOP_UNROLLING(int, m, 0, 1, M0,
            {
                int x_s = ((mout + m) % _IDST_WIDTH) * _ISTRIDE_X - _IPAD_LEFT + xk;
                int y_s = ((mout + m) / _IDST_WIDTH) * _ISTRIDE_Y - _IPAD_TOP + yk;
                my[m].v = x_s + y_s * _ISRC_WIDTH + bout * (int)(_ISRC_WIDTH * _ISRC_HEIGHT);
                my[m].v = select(-1, my[m].v, ((x_s >= 0) && (x_s < _ISRC_WIDTH) && (y_s >= 0) && (y_s < _ISRC_HEIGHT)));
            })

            TILE(DATA_TYPE, M0, 1, a);
            TILE(DATA_TYPE, N0, 1, b);
            T_LOAD2D_INDIRECT(DATA_TYPE, M0, 1, BUFFER, {{src}}, ck, {{src}}_stride_y, my, a);
            T_LOAD(DATA_TYPE, N0, 1, BUFFER, {{weights}}, k, cout, 1, {{weights}}_stride_y, b);

            T_MMUL(DATA_TYPE, DATA_TYPE, ACC_DATA_TYPE, M0, N0, 1, NT, T, a, b, {{dst}});
        }
{{bias_add}}    }
    //------------------ END KERNEL {{meta_kernel_id}} ---------------------
"#;

const RESHAPE_WEIGHTS_TEMPLATE: &str = r#"
    //------------------ START KERNEL {{meta_kernel_id}} RESHAPE_WEIGHTS ---------------------
    // IN_0(wei)            {{src}}
    // OUT(dst)             {{dst}}

    TILE(DATA_TYPE, 1, 1, {{dst}});
    {
        const int k    = g_x;
        const int cout = g_y;
        {{dst}}[0].v = *((__global DATA_TYPE *)({{src}}_ptr + {{src}}_offset_first_element_in_bytes + (k * _IDST_CHANNELS + cout) * sizeof(DATA_TYPE)));
    }
    //------------------ END KERNEL {{meta_kernel_id}} RESHAPE_WEIGHTS ---------------------
"#;

const ELTWISE_TEMPLATE: &str = r#"
    //------------------ START KERNEL {{meta_kernel_id}} ELTWISE_{{op}} ---------------------
    // IN_0(lhs)            {{lhs}}
    // IN_1(rhs)            {{rhs}}
    // OUT(dst, accum)      {{dst}}

    TILE(DATA_TYPE, M0, N0, {{dst}});
    {
{{load}}        T_ELTWISE_BROADCAST_{{op}}_X(DATA_TYPE, M0, N0, {{lhs_tile}}, {{rhs_tile}}, {{dst}});
    }
    //------------------ END KERNEL {{meta_kernel_id}} ELTWISE_{{op}} ---------------------
"#;

const STORE_INDIRECT_WIDTH_SELECT_TEMPLATE: &str = r#"
    //------------------ START KERNEL {{meta_kernel_id}} STORE ---------------------
    {
        TILE(uint, M0, 1, dst_indirect_y);

        LOOP_UNROLLING(int, i, 0, 1, M0,
        {
            dst_indirect_y[i].v = (uint)min(g_y * M0 + i, (uint)({{dst}}_w * {{dst}}_h) - 1);
            dst_indirect_y[i].v += g_z * (uint)({{dst}}_w * {{dst}}_h);
        })

        bool x_cond = PARTIAL_N0 != 0 && g_cond_x;

        T_STORE_INDIRECT_WIDTH_SELECT(DATA_TYPE, M0, N0, PARTIAL_N0, BUFFER, {{dst}}, g_x * N0, {{dst}}_stride_y, x_cond, {{src}}, dst_indirect_y);
    }
    //------------------ END KERNEL {{meta_kernel_id}} STORE ---------------------
"#;

const STORE_BLOCK_BOUNDARY_AWARE_TEMPLATE: &str = r#"
    //------------------ START KERNEL {{meta_kernel_id}} STORE ---------------------
    {
        __global uchar *dst_addr = {{dst}}_ptr + {{dst}}_offset_first_element_in_bytes + (g_x * (uint)N0 * sizeof(DATA_TYPE)) + (g_y * (uint)M0 * {{dst}}_stride_y);
        STORE_BLOCK_BOUNDARY_AWARE(M0, N0, DATA_TYPE, {{src}}, dst_addr, {{dst}}_stride_y, g_zout, PARTIAL_STORE_M0, PARTIAL_STORE_N0, g_cond_y, g_cond_x);
    }
    //------------------ END KERNEL {{meta_kernel_id}} STORE ---------------------
"#;

const STORE_VECTOR_SELECT_TEMPLATE: &str = r#"
    //------------------ START KERNEL {{meta_kernel_id}} STORE ---------------------
    {
        __global uchar *dst_addr = {{dst}}_ptr + {{dst}}_offset_first_element_in_bytes + (g_x * (uint)N0 * sizeof(DATA_TYPE)) + (g_y * {{dst}}_stride_y);
        STORE_VECTOR_SELECT({{src}}, DATA_TYPE, dst_addr, N0, PARTIAL_N0, g_cond_x);
    }
    //------------------ END KERNEL {{meta_kernel_id}} STORE ---------------------
"#;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vtable_for(component: &Component) -> SharedVarTable {
        let mut vtable = SharedVarTable::default();
        for link in component.links() {
            let group = if link.io == LinkIo::Output {
                SharedVarGroup::Automatic
            } else {
                SharedVarGroup::Argument
            };
            vtable.add(link.tensor, group, link.name, link.arg_type);
        }
        vtable
    }

    #[test]
    fn test_eltwise_code_loads_arguments() {
        let component = Component::Eltwise {
            op: ArithmeticOperation::Add,
            lhs: TensorId::new(0),
            rhs: TensorId::new(1),
            dst: TensorId::new(2),
        };
        let code = component.code(OperatorId::new(3), &vtable_for(&component)).unwrap();
        assert!(code.contains("START KERNEL 3 ELTWISE_ADD"));
        assert!(code.contains("T_LOAD(DATA_TYPE, M0, N0, BUFFER, lhs_0"));
        assert!(code.contains("T_ELTWISE_BROADCAST_ADD_X(DATA_TYPE, M0, N0, lhs_0_tile, rhs_1_tile, dst_2)"));
        assert!(!code.contains("{{"));
    }

    #[test]
    fn test_conv_code_with_bias() {
        let component = Component::DirectConv2d {
            desc: Conv2dDescriptor::default(),
            src: TensorId::new(0),
            weights: TensorId::new(1),
            bias: Some(TensorId::new(2)),
            dst: TensorId::new(3),
        };
        let code = component.code(OperatorId::new(0), &vtable_for(&component)).unwrap();
        assert!(code.contains("T_LOAD(DATA_TYPE, 1, N0, BUFFER, bias_2"));
        assert!(code.contains("TILE(ACC_DATA_TYPE, M0, N0, dst_3)"));

        let links = component.links();
        assert_eq!(links.len(), 4);
        assert_eq!(links[2].arg_type, TensorArgType::Vector);
    }

    #[test]
    fn test_missing_variable_is_codegen_error() {
        let component = Component::Store {
            store_type: StoreType::default(),
            src: TensorId::new(0),
            dst: TensorId::new(1),
        };
        let err = component.code(OperatorId::new(0), &SharedVarTable::default()).unwrap_err();
        assert!(matches!(err, Error::Codegen { .. }));
    }

    #[test]
    fn test_config_id() {
        let component = Component::Eltwise {
            op: ArithmeticOperation::Div,
            lhs: TensorId::new(0),
            rhs: TensorId::new(1),
            dst: TensorId::new(2),
        };
        assert_eq!(component.config_id(&TensorInfo::f32([7, 9, 5])), "eltwise_div_f32_7_9_5");
        assert_eq!(component.window_depth(&TensorInfo::f32([7, 9, 5])), 7);
    }

    #[test]
    fn test_eltwise_options_record_operand_shapes() {
        let component = Component::Eltwise {
            op: ArithmeticOperation::Add,
            lhs: TensorId::new(0),
            rhs: TensorId::new(1),
            dst: TensorId::new(2),
        };
        let column = [TensorInfo::f32([2, 2]), TensorInfo::f32([2, 1]), TensorInfo::f32([2, 2])];
        let row = [TensorInfo::f32([2, 2]), TensorInfo::f32([1, 2]), TensorInfo::f32([2, 2])];

        let column_options = component.build_options(|t| &column[t.raw() as usize]);
        let row_options = component.build_options(|t| &row[t.raw() as usize]);
        assert!(column_options.contains(&"-D_IRHS_SHAPE=2x1".to_string()));
        assert!(row_options.contains(&"-D_IRHS_SHAPE=1x2".to_string()));
        assert_ne!(column_options, row_options);
    }
}
