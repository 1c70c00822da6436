//! Concrete runtime values bound to symbolic graph values.

use std::fmt;

use smallvec::SmallVec;

use crate::ir::{DType, Literal};

/// Device class a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    /// Shape-only placeholder with no storage.
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: i32,
}

impl Device {
    pub const CPU: Device = Device {
        kind: DeviceKind::Cpu,
        index: -1,
    };
    pub const META: Device = Device {
        kind: DeviceKind::Meta,
        index: -1,
    };

    pub fn cuda(index: i32) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            index,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => f.write_str("cpu"),
            DeviceKind::Meta => f.write_str("meta"),
            DeviceKind::Cuda => write!(f, "cuda:{}", self.index),
        }
    }
}

pub type Dims = SmallVec<[i64; 6]>;

/// Builds row-major contiguous strides, or `None` on overflow.
pub fn contiguous_strides(sizes: &[i64]) -> Option<Dims> {
    let mut strides: Dims = SmallVec::from_elem(0, sizes.len());
    let mut stride = 1i64;
    for axis in (0..sizes.len()).rev() {
        strides[axis] = stride;
        stride = stride.checked_mul(sizes[axis].max(1))?;
    }
    Some(strides)
}

/// Metadata-only handle of a runtime tensor argument.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArg {
    pub dtype: DType,
    pub sizes: Dims,
    pub strides: Dims,
    pub device: Device,
    /// `false` for an undefined (null) tensor handle.
    pub defined: bool,
}

impl TensorArg {
    pub fn new(dtype: DType, sizes: &[i64], strides: &[i64], device: Device) -> Self {
        Self {
            dtype,
            sizes: sizes.iter().copied().collect(),
            strides: strides.iter().copied().collect(),
            device,
            defined: true,
        }
    }

    /// Contiguous tensor on the given device.
    pub fn contiguous(dtype: DType, sizes: &[i64], device: Device) -> Self {
        let strides =
            contiguous_strides(sizes).unwrap_or_else(|| SmallVec::from_elem(0, sizes.len()));
        Self::new(dtype, sizes, &strides, device)
    }

    /// Contiguous tensor on CUDA device 0.
    pub fn cuda(dtype: DType, sizes: &[i64]) -> Self {
        Self::contiguous(dtype, sizes, Device::cuda(0))
    }

    pub fn meta(dtype: DType, sizes: &[i64]) -> Self {
        Self::contiguous(dtype, sizes, Device::META)
    }

    /// Rank-zero host scalar tensor.
    pub fn cpu_scalar(dtype: DType) -> Self {
        Self::new(dtype, &[], &[], Device::CPU)
    }

    /// Null tensor handle. It has no dimensions, so it only matches rank-zero values.
    pub fn undefined(dtype: DType) -> Self {
        Self {
            defined: false,
            ..Self::new(dtype, &[], &[], Device::cuda(0))
        }
    }

    pub fn with_strides(mut self, strides: &[i64]) -> Self {
        self.strides = strides.iter().copied().collect();
        self
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn size(&self, axis: usize) -> Option<i64> {
        self.sizes.get(axis).copied()
    }

    pub fn stride(&self, axis: usize) -> Option<i64> {
        self.strides.get(axis).copied()
    }

    /// Element count, or `None` when it overflows `i64`.
    pub fn numel(&self) -> Option<i64> {
        self.sizes
            .iter()
            .try_fold(1i64, |acc, size| acc.checked_mul(*size))
    }

    pub fn is_cuda(&self) -> bool {
        self.device.kind == DeviceKind::Cuda
    }

    pub fn is_meta(&self) -> bool {
        self.device.kind == DeviceKind::Meta
    }

    pub fn is_cpu(&self) -> bool {
        self.device.kind == DeviceKind::Cpu
    }

    /// Rank-zero single-element tensor on the host.
    pub fn is_cpu_scalar(&self) -> bool {
        self.is_cpu() && self.rank() == 0 && self.numel() == Some(1)
    }

    pub fn is_meta_scalar(&self) -> bool {
        self.is_meta() && self.rank() == 0 && self.numel() == Some(1)
    }

    /// Shape and dtype agree; placement and strides are not compared.
    pub fn same_shape_as(&self, other: &TensorArg) -> bool {
        self.dtype.storage_dtype() == other.dtype.storage_dtype() && self.sizes == other.sizes
    }
}

impl fmt::Display for TensorArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.defined {
            return write!(f, "undefined tensor<{}>", self.dtype);
        }
        write!(
            f,
            "tensor<{}>{:?} strides {:?} on {}",
            self.dtype,
            self.sizes.as_slice(),
            self.strides.as_slice(),
            self.device
        )
    }
}

/// Runtime value bound to, or evaluated for, a graph value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConcreteValue {
    /// No value known.
    #[default]
    Absent,
    Int(i64),
    Float(f64),
    Bool(bool),
    Tensor(TensorArg),
}

impl ConcreteValue {
    pub fn has_value(&self) -> bool {
        !matches!(self, ConcreteValue::Absent)
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, ConcreteValue::Tensor(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConcreteValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConcreteValue::Float(value) => Some(*value),
            ConcreteValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConcreteValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorArg> {
        match self {
            ConcreteValue::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Short kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ConcreteValue::Absent => "absent",
            ConcreteValue::Int(_) => "int",
            ConcreteValue::Float(_) => "float",
            ConcreteValue::Bool(_) => "bool",
            ConcreteValue::Tensor(_) => "tensor",
        }
    }

    /// Whether a scalar can be bound to a value of the declared dtype.
    pub fn is_compatible_with(&self, dtype: DType) -> bool {
        match self {
            ConcreteValue::Int(_) => dtype.is_integer(),
            ConcreteValue::Float(_) => dtype.is_float() || dtype.is_complex(),
            ConcreteValue::Bool(_) => dtype.is_bool(),
            ConcreteValue::Absent | ConcreteValue::Tensor(_) => false,
        }
    }

    /// Value equality used for binding consistency checks.
    ///
    /// Integers and floats compare numerically, NaN equals NaN, tensors compare by shape and dtype.
    pub fn same_as(&self, other: &ConcreteValue) -> bool {
        match (self, other) {
            (ConcreteValue::Absent, ConcreteValue::Absent) => true,
            (ConcreteValue::Int(a), ConcreteValue::Int(b)) => a == b,
            (ConcreteValue::Bool(a), ConcreteValue::Bool(b)) => a == b,
            (ConcreteValue::Float(a), ConcreteValue::Float(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            (ConcreteValue::Int(a), ConcreteValue::Float(b))
            | (ConcreteValue::Float(b), ConcreteValue::Int(a)) => (*a as f64) == *b,
            (ConcreteValue::Tensor(a), ConcreteValue::Tensor(b)) => a.same_shape_as(b),
            _ => false,
        }
    }

    pub fn matches_literal(&self, literal: Literal) -> bool {
        self.same_as(&ConcreteValue::from(literal))
    }
}

impl From<Literal> for ConcreteValue {
    fn from(literal: Literal) -> Self {
        match literal {
            Literal::Bool(value) => ConcreteValue::Bool(value),
            Literal::Int(value) => ConcreteValue::Int(value),
            Literal::Float(value) => ConcreteValue::Float(value),
        }
    }
}

impl From<i64> for ConcreteValue {
    fn from(value: i64) -> Self {
        ConcreteValue::Int(value)
    }
}

impl From<f64> for ConcreteValue {
    fn from(value: f64) -> Self {
        ConcreteValue::Float(value)
    }
}

impl From<bool> for ConcreteValue {
    fn from(value: bool) -> Self {
        ConcreteValue::Bool(value)
    }
}

impl From<TensorArg> for ConcreteValue {
    fn from(value: TensorArg) -> Self {
        ConcreteValue::Tensor(value)
    }
}

impl fmt::Display for ConcreteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcreteValue::Absent => f.write_str("<absent>"),
            ConcreteValue::Int(value) => write!(f, "{value}"),
            ConcreteValue::Float(value) => write!(f, "{value:?}"),
            ConcreteValue::Bool(value) => write!(f, "{value}"),
            ConcreteValue::Tensor(tensor) => write!(f, "{tensor}"),
        }
    }
}
