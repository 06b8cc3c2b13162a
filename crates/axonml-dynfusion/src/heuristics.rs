//! Convolution Method Selection
//!
//! Picks between the direct and the GEMM-based convolution kernels. A table
//! of well-known network layers is consulted first, then a cascade of rules
//! tuned per GPU family.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::GpuTarget;
use crate::kernel::validate_direct_conv2d;
use crate::operator_graph::{Conv2dDescriptor, WeightsGeometry};
use crate::tensor::{DataLayout, Padding2D, Size2D, TensorInfo};

/// Implementation strategy of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvolutionMethod {
    /// One kernel reading the weights as they are.
    Direct,
    /// Weights reshaped once in the prepare stage, then a GEMM-like kernel.
    Gemm,
}

impl fmt::Display for ConvolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Gemm => f.write_str("gemm"),
        }
    }
}

// =============================================================================
// Known Configurations
// =============================================================================

struct KnownConfig {
    input: Size2D,
    kernel: Size2D,
    /// (IFM, OFM)
    feature_maps: Size2D,
    pad: Padding2D,
    stride: Size2D,
    layout: DataLayout,
    method: ConvolutionMethod,
}

const KNOWN_CONFIGS: [KnownConfig; 6] = [
    // Alexnet
    KnownConfig {
        input: Size2D::new(27, 27),
        kernel: Size2D::new(5, 5),
        feature_maps: Size2D::new(48, 128),
        pad: Padding2D::uniform(2),
        stride: Size2D::new(1, 1),
        layout: DataLayout::Nchw,
        method: ConvolutionMethod::Direct,
    },
    // VGG16 / VGG19
    KnownConfig {
        input: Size2D::new(224, 224),
        kernel: Size2D::new(3, 3),
        feature_maps: Size2D::new(3, 64),
        pad: Padding2D::uniform(1),
        stride: Size2D::new(1, 1),
        layout: DataLayout::Nchw,
        method: ConvolutionMethod::Direct,
    },
    // Mobilenet 224
    KnownConfig {
        input: Size2D::new(224, 224),
        kernel: Size2D::new(3, 3),
        feature_maps: Size2D::new(3, 32),
        pad: Padding2D::new(0, 1, 1, 0),
        stride: Size2D::new(2, 2),
        layout: DataLayout::Nchw,
        method: ConvolutionMethod::Gemm,
    },
    // Mobilenet 160
    KnownConfig {
        input: Size2D::new(160, 160),
        kernel: Size2D::new(3, 3),
        feature_maps: Size2D::new(3, 24),
        pad: Padding2D::new(0, 1, 1, 0),
        stride: Size2D::new(2, 2),
        layout: DataLayout::Nchw,
        method: ConvolutionMethod::Gemm,
    },
    // Mobilenet 224
    KnownConfig {
        input: Size2D::new(224, 224),
        kernel: Size2D::new(3, 3),
        feature_maps: Size2D::new(3, 32),
        pad: Padding2D::new(0, 1, 1, 0),
        stride: Size2D::new(2, 2),
        layout: DataLayout::Nhwc,
        method: ConvolutionMethod::Gemm,
    },
    // Mobilenet 160
    KnownConfig {
        input: Size2D::new(160, 160),
        kernel: Size2D::new(3, 3),
        feature_maps: Size2D::new(3, 24),
        pad: Padding2D::new(0, 1, 1, 0),
        stride: Size2D::new(2, 2),
        layout: DataLayout::Nhwc,
        method: ConvolutionMethod::Gemm,
    },
];

impl KnownConfig {
    fn matches(&self, src: &TensorInfo, wg: &WeightsGeometry, desc: &Conv2dDescriptor) -> bool {
        self.input == Size2D::new(src.width(), src.height())
            && self.kernel == Size2D::new(wg.kernel_w, wg.kernel_h)
            && self.feature_maps == Size2D::new(wg.ifm, wg.ofm)
            && self.pad == desc.pad
            && self.stride == desc.stride
            && self.layout == src.data_layout
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Chooses the convolution implementation for `target`.
pub fn select_conv_method(
    src: &TensorInfo,
    weights: &TensorInfo,
    dst: &TensorInfo,
    desc: &Conv2dDescriptor,
    target: GpuTarget,
) -> ConvolutionMethod {
    let wg = WeightsGeometry::of(weights, src.data_layout);

    if let Some(known) = KNOWN_CONFIGS.iter().find(|c| c.matches(src, &wg, desc)) {
        return known.method;
    }

    if desc.dilation != Size2D::new(1, 1) {
        return ConvolutionMethod::Gemm;
    }
    if src.data_layout != DataLayout::Nhwc {
        return ConvolutionMethod::Gemm;
    }

    let direct_valid = validate_direct_conv2d(src, weights, None, dst, desc).is_ok();

    // SRGAN
    if src.height() > 720 && dst.height() > 720 && wg.kernel_h == 9 && desc.pad.top < 3 && direct_valid {
        return ConvolutionMethod::Direct;
    }

    if src.data_type.is_float() && direct_valid {
        let threshold = target.direct_conv_kernel_threshold();
        let large_kernel = wg.kernel_w >= threshold && wg.kernel_h >= threshold;
        let ifm_ge_16 = src.channels() >= 16;
        let ofm = dst.channels();

        let prefer_direct = if target.is_legacy() {
            large_kernel && ifm_ge_16 && src.channels() > ofm
        } else {
            let workload = (dst.channels() * dst.width() * dst.height()) / 16;
            (large_kernel && workload >= 8192 && ifm_ge_16) || (ofm <= 8 && ifm_ge_16)
        };
        if prefer_direct {
            return ConvolutionMethod::Direct;
        }
    }

    ConvolutionMethod::Gemm
}

// =============================================================================
// Tests
// =============================================================================
