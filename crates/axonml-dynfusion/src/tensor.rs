//! Tensor Descriptors - Shapes, Data Types and Layouts
//!
//! Metadata describing the tensors flowing through an operator graph. Shapes
//! are stored outermost dimension first (row-major), so an NHWC activation of
//! one 12x12 image with 384 channels is `[1, 12, 12, 384]`.
//!
//! # Key Features
//! - Small-vector shape representation (up to 6 dimensions on the stack)
//! - Broadcasting following `NumPy` rules
//! - Layout-aware dimension accessors
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

// =============================================================================
// Shape
// =============================================================================

/// Dimensions of a tensor, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(SmallVec<[usize; 6]>);

impl Shape {
    /// Creates a new shape.
    pub fn new(dims: &[usize]) -> Self {
        Self(SmallVec::from_slice(dims))
    }

    /// Returns the dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Returns the total number of elements. Zero for a shape without dimensions.
    pub fn numel(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.iter().product()
        }
    }

    /// Returns whether the shape describes no elements.
    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// Returns the dimension `n` positions from the innermost one, or 1 when
    /// the shape has fewer dimensions.
    pub fn from_back(&self, n: usize) -> usize {
        if n < self.0.len() {
            self.0[self.0.len() - 1 - n]
        } else {
            1
        }
    }

    /// Checks if shapes are broadcast compatible.
    pub fn broadcast_compatible(&self, other: &Self) -> bool {
        let max_ndim = self.ndim().max(other.ndim());
        (0..max_ndim).all(|i| {
            let d1 = self.from_back(i);
            let d2 = other.from_back(i);
            d1 == d2 || d1 == 1 || d2 == 1
        })
    }

    /// Computes the broadcast shape.
    pub fn broadcast_shape(&self, other: &Self) -> Option<Self> {
        if self.is_empty() || other.is_empty() || !self.broadcast_compatible(other) {
            return None;
        }

        let max_ndim = self.ndim().max(other.ndim());
        let mut result: SmallVec<[usize; 6]> = (0..max_ndim)
            .map(|i| self.from_back(i).max(other.from_back(i)))
            .collect();
        result.reverse();
        Some(Self(result))
    }

    /// Row-major strides, in elements.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 6]> {
        let mut strides: SmallVec<[usize; 6]> = SmallVec::with_capacity(self.ndim());
        let mut stride = 1usize;
        for &dim in self.0.iter().rev() {
            strides.push(stride);
            stride *= dim;
        }
        strides.reverse();
        strides
    }

    /// Product of every dimension except the `n` innermost ones.
    pub fn collapsed_from_back(&self, n: usize) -> usize {
        if self.0.len() <= n {
            1
        } else {
            self.0[..self.0.len() - n].iter().product()
        }
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(SmallVec::from_vec(dims))
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(&dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", dims.join("x"))
    }
}

/// Converts a linear row-major index to multi-dimensional indices.
pub fn unravel_index(mut linear: usize, shape: &[usize]) -> SmallVec<[usize; 6]> {
    let mut indices: SmallVec<[usize; 6]> = SmallVec::from_elem(0, shape.len());
    for (i, &dim) in shape.iter().enumerate().rev() {
        indices[i] = linear % dim;
        linear /= dim;
    }
    indices
}

/// Maps an index into a broadcast output back to the linear index of an
/// operand with shape `operand`. Both are aligned from the right and size-1
/// operand dimensions always read element 0.
pub fn broadcast_linear_index(out_index: &[usize], operand: &[usize]) -> usize {
    let offset = out_index.len() - operand.len();
    let mut linear = 0usize;
    for (axis, &dim) in operand.iter().enumerate() {
        let idx = if dim == 1 { 0 } else { out_index[offset + axis] };
        linear = linear * dim + idx;
    }
    linear
}

// =============================================================================
// Data Type
// =============================================================================

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit floating point.
    #[default]
    F32,
    /// 16-bit floating point.
    F16,
    /// 32-bit signed integer.
    S32,
    /// 16-bit signed integer.
    S16,
    /// 8-bit unsigned integer.
    U8,
    /// 8-bit asymmetric quantized.
    Qasymm8,
}

impl DataType {
    /// Size in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::S32 => 4,
            Self::F16 | Self::S16 => 2,
            Self::U8 | Self::Qasymm8 => 1,
        }
    }

    /// Returns whether this is a floating point type.
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16)
    }

    /// Name used in generated kernel source.
    pub fn cl_type(self) -> &'static str {
        match self {
            Self::F32 => "float",
            Self::F16 => "half",
            Self::S32 => "int",
            Self::S16 => "short",
            Self::U8 | Self::Qasymm8 => "uchar",
        }
    }

    /// Lowercase name used in configuration ids.
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::S32 => "s32",
            Self::S16 => "s16",
            Self::U8 => "u8",
            Self::Qasymm8 => "qasymm8",
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(Self::F32),
            "f16" | "float16" => Ok(Self::F16),
            "s32" | "i32" => Ok(Self::S32),
            "s16" | "i16" => Ok(Self::S16),
            "u8" => Ok(Self::U8),
            "qasymm8" => Ok(Self::Qasymm8),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

// =============================================================================
// Data Layout
// =============================================================================

/// Memory layout of 4D activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLayout {
    /// Batch, height, width, channels.
    #[default]
    Nhwc,
    /// Batch, channels, height, width.
    Nchw,
}

impl DataLayout {
    /// Position of the width dimension counted from the innermost one.
    pub fn width_from_back(self) -> usize {
        match self {
            Self::Nhwc => 1,
            Self::Nchw => 0,
        }
    }

    /// Position of the height dimension counted from the innermost one.
    pub fn height_from_back(self) -> usize {
        match self {
            Self::Nhwc => 2,
            Self::Nchw => 1,
        }
    }

    /// Position of the channel dimension counted from the innermost one.
    pub fn channel_from_back(self) -> usize {
        match self {
            Self::Nhwc => 0,
            Self::Nchw => 2,
        }
    }
}

// =============================================================================
// Tensor Info
// =============================================================================

/// Shape, element type and layout of a tensor.
///
/// An info whose shape holds no elements is "empty": operators infer it from
/// their inputs when the tensor is used as an output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Dimensions, outermost first.
    pub shape: Shape,
    /// Element type.
    pub data_type: DataType,
    /// Memory layout.
    pub data_layout: DataLayout,
}

impl TensorInfo {
    /// Creates a tensor info.
    pub fn new(shape: impl Into<Shape>, data_type: DataType, data_layout: DataLayout) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            data_layout,
        }
    }

    /// Creates an F32 NHWC tensor info.
    pub fn f32(shape: impl Into<Shape>) -> Self {
        Self::new(shape, DataType::F32, DataLayout::Nhwc)
    }

    /// Creates an empty info to be filled in by shape inference.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns whether the info still needs to be inferred.
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Element size in bytes.
    pub fn element_size(&self) -> usize {
        self.data_type.size_bytes()
    }

    /// Total size of the tensor in bytes.
    pub fn total_size(&self) -> usize {
        self.shape.numel() * self.element_size()
    }

    /// Width of the tensor according to its layout.
    pub fn width(&self) -> usize {
        self.shape.from_back(self.data_layout.width_from_back())
    }

    /// Height of the tensor according to its layout.
    pub fn height(&self) -> usize {
        self.shape.from_back(self.data_layout.height_from_back())
    }

    /// Channels of the tensor according to its layout.
    pub fn channels(&self) -> usize {
        self.shape.from_back(self.data_layout.channel_from_back())
    }

    /// Fills this info from `src` with a new shape if it is still empty.
    /// Returns whether anything was written.
    pub fn auto_init_if_empty(&mut self, src: &TensorInfo, shape: Shape) -> bool {
        if !self.is_empty() {
            return false;
        }
        self.shape = shape;
        self.data_type = src.data_type;
        self.data_layout = src.data_layout;
        true
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// A pair of sizes along x (width) and y (height).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size2D {
    /// Size along x.
    pub x: usize,
    /// Size along y.
    pub y: usize,
}

impl Size2D {
    /// Creates a new size.
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Product of both sizes.
    pub fn area(self) -> usize {
        self.x * self.y
    }
}

/// Padding around the spatial dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Padding2D {
    /// Rows added above.
    pub top: usize,
    /// Columns added on the right.
    pub right: usize,
    /// Rows added below.
    pub bottom: usize,
    /// Columns added on the left.
    pub left: usize,
}

impl Padding2D {
    /// Creates a padding.
    pub const fn new(top: usize, right: usize, bottom: usize, left: usize) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// Same padding on every side.
    pub const fn uniform(pad: usize) -> Self {
        Self::new(pad, pad, pad, pad)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_basics() {
        let shape = Shape::new(&[1, 12, 12, 384]);
        assert_eq!(shape.ndim(), 4);
        assert_eq!(shape.numel(), 12 * 12 * 384);
        assert_eq!(shape.from_back(0), 384);
        assert_eq!(shape.from_back(5), 1);
        assert_eq!(shape.collapsed_from_back(3), 1);
        assert_eq!(shape.contiguous_strides().as_slice(), &[55296, 4608, 384, 1]);
        assert!(Shape::default().is_empty());
        assert_eq!(shape.to_string(), "1x12x12x384");
    }

    #[test]
    fn test_broadcast_shape() {
        let a = Shape::new(&[7, 9, 5]);
        let b = Shape::new(&[7, 1, 1]);
        assert_eq!(a.broadcast_shape(&b), Some(Shape::new(&[7, 9, 5])));

        let c = Shape::new(&[5]);
        assert_eq!(a.broadcast_shape(&c), Some(Shape::new(&[7, 9, 5])));

        let d = Shape::new(&[7, 2, 5]);
        assert!(a.broadcast_shape(&d).is_none());
    }

    #[test]
    fn test_broadcast_linear_index() {
        let out = [3usize, 4, 2];
        assert_eq!(broadcast_linear_index(&out, &[7, 1, 1]), 3);
        assert_eq!(broadcast_linear_index(&out, &[5]), 2);
        assert_eq!(broadcast_linear_index(&out, &[7, 9, 5]), 3 * 45 + 4 * 5 + 2);
        assert_eq!(unravel_index(3 * 45 + 4 * 5 + 2, &[7, 9, 5]).as_slice(), &out);
    }

    #[test]
    fn test_layout_accessors() {
        let nhwc = TensorInfo::f32([1, 6, 8, 3]);
        assert_eq!((nhwc.height(), nhwc.width(), nhwc.channels()), (6, 8, 3));

        let nchw = TensorInfo::new([1, 3, 6, 8], DataType::F32, DataLayout::Nchw);
        assert_eq!((nchw.height(), nchw.width(), nchw.channels()), (6, 8, 3));
        assert_eq!(nchw.total_size(), 3 * 6 * 8 * 4);
    }

    #[test]
    fn test_auto_init() {
        let src = TensorInfo::new([2, 2], DataType::F16, DataLayout::Nhwc);
        let mut dst = TensorInfo::empty();
        assert!(dst.auto_init_if_empty(&src, Shape::new(&[4, 4])));
        assert_eq!(dst.data_type, DataType::F16);
        assert!(!dst.auto_init_if_empty(&src, Shape::new(&[1])));
        assert_eq!(dst.shape, Shape::new(&[4, 4]));
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("F32".parse::<DataType>(), Ok(DataType::F32));
        assert!("f64".parse::<DataType>().is_err());
    }
}
