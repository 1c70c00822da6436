//! Concrete values and the pure expression semantics that produce them.

pub mod concrete;
pub mod ops;

pub use concrete::{contiguous_strides, ConcreteValue, Device, DeviceKind, Dims, TensorArg};
pub use ops::{eval_binary, eval_unary, ExprError, ExprOutputs};
