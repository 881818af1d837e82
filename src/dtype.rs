//! Element data types.

use core::fmt;

/// Data type of a tensor's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DataType {
    /// Signed 8-bit integer.
    Int8 = 0,
    /// Signed 32-bit integer.
    Int32 = 1,
    /// Signed 64-bit integer.
    Int64 = 2,
    /// IEEE-754 single precision.
    Float32 = 3,
    /// IEEE-754 double precision.
    Float64 = 4,
}

impl DataType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::Int8 => 1,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Whether this is a floating point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Whether this is an integer type usable as an index.
    #[must_use]
    pub const fn is_index(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    /// Lower-case name, e.g. `"float32"`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust types that can live in a tensor.
///
/// `Pod` lets blob storage be viewed as `&[T]` without copying.
pub trait Element: bytemuck::Pod + PartialOrd + Send + Sync + 'static {
    /// The runtime tag matching `Self`.
    const DATA_TYPE: DataType;
}

impl Element for i8 {
    const DATA_TYPE: DataType = DataType::Int8;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::Int32;
}

impl Element for i64 {
    const DATA_TYPE: DataType = DataType::Int64;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float32;
}

impl Element for f64 {
    const DATA_TYPE: DataType = DataType::Float64;
}

/// Floating point elements that numeric kernels are generic over.
pub trait FloatElement: Element + num_traits::Float + core::iter::Sum {}

impl FloatElement for f32 {}
impl FloatElement for f64 {}

/// Integer elements used as class labels or indices.
pub trait IndexElement: Element + num_traits::PrimInt {}

impl IndexElement for i32 {}
impl IndexElement for i64 {}
