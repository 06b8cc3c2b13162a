//! Kernel Executor
//!
//! Interprets the component program of a compiled kernel on the CPU. Each
//! step computes its whole destination at once; large destinations are
//! computed in parallel with rayon.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use rayon::prelude::*;

use crate::blueprint::{ClKernelCode, ProgramStep, ProgramTensor, Slot};
use crate::error::{Error, Result};
use crate::operator_graph::{ArithmeticOperation, Conv2dDescriptor, WeightsGeometry};
use crate::runtime::{AuxTensorData, OpTensorBinding, TensorPack, TensorRef};
use crate::tensor::{broadcast_linear_index, unravel_index, TensorInfo};

/// Minimum number of output elements computed in parallel.
const PARALLEL_THRESHOLD: usize = 4096;

// =============================================================================
// Environment
// =============================================================================

/// Storage visible to one kernel execution.
struct ExecEnv<'a> {
    pack: &'a TensorPack,
    aux: &'a mut AuxTensorData,
    core: &'a mut OpTensorBinding,
    locals: Vec<Vec<f32>>,
}

impl ExecEnv<'_> {
    fn read(&self, tensor: &ProgramTensor) -> Result<&[f32]> {
        let data = match tensor.slot {
            Slot::Local(index) => self
                .locals
                .get(index)
                .map(Vec::as_slice)
                .ok_or_else(|| Error::runtime(format!("local tile {index} does not exist")))?,
            Slot::Argument(arg) => match self.argument(arg)? {
                TensorRef::Core(id) => self
                    .core
                    .get(&id)
                    .map(|t| t.data.as_slice())
                    .ok_or(Error::MissingBinding { tensor: id.raw() })?,
                TensorRef::Aux(id) => self
                    .aux
                    .get(id)
                    .map(|t| t.data.as_slice())
                    .ok_or_else(|| Error::runtime(format!("auxiliary tensor {id} is not allocated")))?,
            },
        };
        if data.len() != tensor.info.shape.numel() {
            return Err(Error::shape_mismatch(tensor.info.shape.dims(), &[data.len()]));
        }
        Ok(data)
    }

    fn write(&mut self, tensor: &ProgramTensor, values: Vec<f32>) -> Result<()> {
        let slot = match tensor.slot {
            Slot::Local(index) => self
                .locals
                .get_mut(index)
                .ok_or_else(|| Error::runtime(format!("local tile {index} does not exist")))?,
            Slot::Argument(arg) => match self.argument(arg)? {
                TensorRef::Core(id) => &mut self
                    .core
                    .get_mut(&id)
                    .ok_or(Error::MissingBinding { tensor: id.raw() })?
                    .data,
                TensorRef::Aux(id) => &mut self
                    .aux
                    .get_mut(id)
                    .ok_or_else(|| Error::runtime(format!("auxiliary tensor {id} is not allocated")))?
                    .data,
            },
        };
        if slot.len() != values.len() {
            return Err(Error::shape_mismatch(&[slot.len()], &[values.len()]));
        }
        *slot = values;
        Ok(())
    }

    fn argument(&self, arg: i32) -> Result<TensorRef> {
        self.pack
            .get(arg)
            .ok_or_else(|| Error::runtime(format!("kernel argument {arg} is not bound")))
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Runs every step of `code` against the tensors of `pack`.
pub(crate) fn execute(
    code: &ClKernelCode,
    pack: &TensorPack,
    aux: &mut AuxTensorData,
    core: &mut OpTensorBinding,
) -> Result<()> {
    let locals = code
        .program
        .locals
        .iter()
        .map(|info| vec![0.0; info.shape.numel()])
        .collect();
    let mut env = ExecEnv {
        pack,
        aux,
        core,
        locals,
    };

    for step in &code.program.steps {
        let (dst, values) = match step {
            ProgramStep::DirectConv2d {
                desc,
                src,
                weights,
                bias,
                dst,
            } => {
                let geometry = WeightsGeometry::of(&weights.info, src.info.data_layout);
                let w = env.read(weights)?;
                // HWIO
                let weight = |k: usize, oc: usize| w[k * geometry.ofm + oc];
                let values = conv2d(desc, &src.info, env.read(src)?, &geometry, weight, read_bias(&env, bias)?, &dst.info);
                (dst, values)
            }
            ProgramStep::GemmConv2d {
                desc,
                src,
                weights,
                bias,
                dst,
                geometry,
            } => {
                let w = env.read(weights)?;
                let k_total = geometry.reduction_size();
                let weight = |k: usize, oc: usize| w[oc * k_total + k];
                let values = conv2d(desc, &src.info, env.read(src)?, geometry, weight, read_bias(&env, bias)?, &dst.info);
                (dst, values)
            }
            ProgramStep::ReshapeWeights { src, dst, geometry } => {
                let w = env.read(src)?;
                let k_total = geometry.reduction_size();
                let ofm = geometry.ofm;
                let values = fill(k_total * ofm, |i| {
                    let (oc, k) = (i / k_total, i % k_total);
                    w[k * ofm + oc]
                });
                (dst, values)
            }
            ProgramStep::Elementwise { op, lhs, rhs, dst } => {
                let values = elementwise(*op, &lhs.info, env.read(lhs)?, &rhs.info, env.read(rhs)?, &dst.info);
                (dst, values)
            }
            ProgramStep::Store { src, dst } => (dst, env.read(src)?.to_vec()),
        };
        env.write(dst, values)?;
    }
    Ok(())
}

fn read_bias<'e>(env: &'e ExecEnv<'_>, bias: &Option<ProgramTensor>) -> Result<Option<&'e [f32]>> {
    bias.as_ref().map(|b| env.read(b)).transpose()
}

/// Computes `len` values from their linear index.
fn fill(len: usize, f: impl Fn(usize) -> f32 + Sync + Send) -> Vec<f32> {
    let mut out = vec![0.0f32; len];
    if len >= PARALLEL_THRESHOLD {
        out.par_iter_mut().enumerate().for_each(|(i, v)| *v = f(i));
    } else {
        for (i, v) in out.iter_mut().enumerate() {
            *v = f(i);
        }
    }
    out
}

/// NHWC convolution. `weight(k, oc)` reads the weight of reduction index
/// `k = (ky * KW + kx) * IFM + ic` for output channel `oc`.
fn conv2d(
    desc: &Conv2dDescriptor,
    src_info: &TensorInfo,
    src: &[f32],
    geometry: &WeightsGeometry,
    weight: impl Fn(usize, usize) -> f32 + Sync + Send,
    bias: Option<&[f32]>,
    dst_info: &TensorInfo,
) -> Vec<f32> {
    let (in_h, in_w, in_c) = (src_info.height(), src_info.width(), src_info.channels());
    let (out_h, out_w, out_c) = (dst_info.height(), dst_info.width(), dst_info.channels());

    fill(dst_info.shape.numel(), |i| {
        let oc = i % out_c;
        let ox = (i / out_c) % out_w;
        let oy = (i / (out_c * out_w)) % out_h;
        let n = i / (out_c * out_w * out_h);

        let mut acc = bias.map_or(0.0, |b| b[oc]);
        for ky in 0..geometry.kernel_h {
            let iy = (oy * desc.stride.y + ky * desc.dilation.y) as isize - desc.pad.top as isize;
            if iy < 0 || iy >= in_h as isize {
                continue;
            }
            for kx in 0..geometry.kernel_w {
                let ix = (ox * desc.stride.x + kx * desc.dilation.x) as isize - desc.pad.left as isize;
                if ix < 0 || ix >= in_w as isize {
                    continue;
                }
                let base = ((n * in_h + iy as usize) * in_w + ix as usize) * in_c;
                let k_base = (ky * geometry.kernel_w + kx) * geometry.ifm;
                for ic in 0..geometry.ifm {
                    acc += src[base + ic] * weight(k_base + ic, oc);
                }
            }
        }
        acc
    })
}

fn elementwise(
    op: ArithmeticOperation,
    lhs_info: &TensorInfo,
    lhs: &[f32],
    rhs_info: &TensorInfo,
    rhs: &[f32],
    dst_info: &TensorInfo,
) -> Vec<f32> {
    let out_dims = dst_info.shape.dims();
    let lhs_dims = lhs_info.shape.dims();
    let rhs_dims = rhs_info.shape.dims();
    fill(dst_info.shape.numel(), |i| {
        let index = unravel_index(i, out_dims);
        let a = lhs[broadcast_linear_index(&index, lhs_dims)];
        let b = rhs[broadcast_linear_index(&index, rhs_dims)];
        op.apply(a, b)
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Padding2D;

    #[test]
    fn test_conv2d_padding() {
        // 3x3 ones over a 3x3 ones image with padding 1 counts the taps.
        let src_info = TensorInfo::f32([1, 3, 3, 1]);
        let dst_info = TensorInfo::f32([1, 3, 3, 1]);
        let geometry = WeightsGeometry {
            kernel_h: 3,
            kernel_w: 3,
            ifm: 1,
            ofm: 1,
        };
        let desc = Conv2dDescriptor::default().pad(Padding2D::uniform(1));
        let out = conv2d(&desc, &src_info, &[1.0; 9], &geometry, |_, _| 1.0, None, &dst_info);
        assert_eq!(out, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_conv2d_bias_and_channels() {
        let src_info = TensorInfo::f32([1, 1, 1, 2]);
        let dst_info = TensorInfo::f32([1, 1, 1, 3]);
        let geometry = WeightsGeometry {
            kernel_h: 1,
            kernel_w: 1,
            ifm: 2,
            ofm: 3,
        };
        // HWIO [1, 1, 2, 3]
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = conv2d(
            &Conv2dDescriptor::default(),
            &src_info,
            &[1.0, 10.0],
            &geometry,
            |k, oc| w[k * 3 + oc],
            Some(&[0.5, 0.5, 0.5]),
            &dst_info,
        );
        assert_eq!(out, vec![41.5, 52.5, 63.5]);
    }

    #[test]
    fn test_elementwise_broadcast() {
        let lhs_info = TensorInfo::f32([2, 3]);
        let rhs_info = TensorInfo::f32([2, 1]);
        let out = elementwise(
            ArithmeticOperation::Sub,
            &lhs_info,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            &rhs_info,
            &[1.0, 4.0],
            &lhs_info,
        );
        assert_eq!(out, vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_fill_parallel_matches_sequential() {
        let big = fill(PARALLEL_THRESHOLD * 2, |i| i as f32);
        assert_eq!(big[PARALLEL_THRESHOLD + 3], (PARALLEL_THRESHOLD + 3) as f32);
    }
}
