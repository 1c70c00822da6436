//! Pure evaluation of expression nodes over concrete inputs.

use smallvec::{smallvec, SmallVec};
use thiserror::Error;

use crate::ir::{BinaryOp, DType, Expr, ExprOp, Graph, UnaryOp};

use super::concrete::{contiguous_strides, ConcreteValue, Dims, TensorArg};

pub type ExprOutputs = SmallVec<[ConcreteValue; 2]>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("{op}: integer division by zero")]
    DivisionByZero { op: &'static str },
    #[error("{op}: integer overflow")]
    Overflow { op: &'static str },
    #[error("{op}: unsupported operands ({detail})")]
    OperandType { op: &'static str, detail: String },
    #[error("{op}: expected {expected} inputs, got {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{op}: axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange {
        op: &'static str,
        axis: usize,
        rank: usize,
    },
    #[error("{op}: operand ranks differ ({expected} vs {actual})")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{op}: incompatible sizes {lhs} and {rhs} at axis {axis}")]
    SizeMismatch {
        op: &'static str,
        axis: usize,
        lhs: i64,
        rhs: i64,
    },
}

fn operand_error(op: &'static str, inputs: &[&ConcreteValue]) -> ExprError {
    let kinds: Vec<&str> = inputs.iter().map(|value| value.kind_name()).collect();
    ExprError::OperandType {
        op,
        detail: kinds.join(", "),
    }
}

fn check_arity(
    op: &'static str,
    inputs: &[ConcreteValue],
    expected: usize,
) -> Result<(), ExprError> {
    if inputs.len() != expected {
        return Err(ExprError::Arity {
            op,
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

fn truthy(op: &'static str, value: &ConcreteValue) -> Result<bool, ExprError> {
    match value {
        ConcreteValue::Bool(value) => Ok(*value),
        ConcreteValue::Int(value) => Ok(*value != 0),
        other => Err(operand_error(op, &[other])),
    }
}

/// Truncating integer quotient rounded toward positive infinity.
fn ceil_div_i64(lhs: i64, rhs: i64) -> Option<i64> {
    let quotient = lhs.checked_div(rhs)?;
    let rounds_up = lhs % rhs != 0 && ((lhs > 0) == (rhs > 0));
    if rounds_up {
        quotient.checked_add(1)
    } else {
        Some(quotient)
    }
}

pub fn eval_unary(op: UnaryOp, input: &ConcreteValue) -> Result<ConcreteValue, ExprError> {
    let name = ExprOp::Unary(op).name();
    match (op, input) {
        (UnaryOp::Neg, ConcreteValue::Int(value)) => value
            .checked_neg()
            .map(ConcreteValue::Int)
            .ok_or(ExprError::Overflow { op: name }),
        (UnaryOp::Neg, ConcreteValue::Float(value)) => Ok(ConcreteValue::Float(-value)),
        (UnaryOp::Abs, ConcreteValue::Int(value)) => value
            .checked_abs()
            .map(ConcreteValue::Int)
            .ok_or(ExprError::Overflow { op: name }),
        (UnaryOp::Abs, ConcreteValue::Float(value)) => Ok(ConcreteValue::Float(value.abs())),
        (UnaryOp::Not, ConcreteValue::Bool(value)) => Ok(ConcreteValue::Bool(!value)),
        (UnaryOp::Not, ConcreteValue::Int(value)) => Ok(ConcreteValue::Int(!value)),
        (UnaryOp::Cast(dtype), value) => cast(dtype, value),
        (_, other) => Err(operand_error(name, &[other])),
    }
}

fn cast(dtype: DType, value: &ConcreteValue) -> Result<ConcreteValue, ExprError> {
    let op = "cast";
    if dtype.is_bool() {
        return truthy(op, value).map(ConcreteValue::Bool);
    }
    if dtype.is_integer() {
        return match value {
            ConcreteValue::Int(value) => Ok(ConcreteValue::Int(*value)),
            ConcreteValue::Bool(value) => Ok(ConcreteValue::Int(i64::from(*value))),
            ConcreteValue::Float(value) if value.is_finite() => {
                Ok(ConcreteValue::Int(value.trunc() as i64))
            }
            other => Err(operand_error(op, &[other])),
        };
    }
    if dtype.is_float() || dtype.is_complex() {
        return match value {
            ConcreteValue::Bool(value) => Ok(ConcreteValue::Float(f64::from(u8::from(*value)))),
            other => other
                .as_float()
                .map(ConcreteValue::Float)
                .ok_or_else(|| operand_error(op, &[other])),
        };
    }
    Err(operand_error(op, &[value]))
}

fn int_binary(op: BinaryOp, lhs: i64, rhs: i64) -> Result<ConcreteValue, ExprError> {
    let name = op.as_str();
    let overflow = ExprError::Overflow { op: name };
    let by_zero = ExprError::DivisionByZero { op: name };
    let value = match op {
        BinaryOp::Add => lhs.checked_add(rhs).ok_or(overflow)?,
        BinaryOp::Sub => lhs.checked_sub(rhs).ok_or(overflow)?,
        BinaryOp::Mul => lhs.checked_mul(rhs).ok_or(overflow)?,
        BinaryOp::Div | BinaryOp::CeilDiv | BinaryOp::Mod if rhs == 0 => return Err(by_zero),
        BinaryOp::Div => lhs.checked_div(rhs).ok_or(overflow)?,
        BinaryOp::CeilDiv => ceil_div_i64(lhs, rhs).ok_or(overflow)?,
        BinaryOp::Mod => lhs.checked_rem(rhs).ok_or(overflow)?,
        BinaryOp::Max => lhs.max(rhs),
        BinaryOp::Min => lhs.min(rhs),
        BinaryOp::Eq => return Ok(ConcreteValue::Bool(lhs == rhs)),
        BinaryOp::Lt => return Ok(ConcreteValue::Bool(lhs < rhs)),
        BinaryOp::Le => return Ok(ConcreteValue::Bool(lhs <= rhs)),
        BinaryOp::And => return Ok(ConcreteValue::Bool(lhs != 0 && rhs != 0)),
        BinaryOp::Or => return Ok(ConcreteValue::Bool(lhs != 0 || rhs != 0)),
    };
    Ok(ConcreteValue::Int(value))
}

fn float_binary(op: BinaryOp, lhs: f64, rhs: f64) -> ConcreteValue {
    match op {
        BinaryOp::Add => ConcreteValue::Float(lhs + rhs),
        BinaryOp::Sub => ConcreteValue::Float(lhs - rhs),
        BinaryOp::Mul => ConcreteValue::Float(lhs * rhs),
        BinaryOp::Div => ConcreteValue::Float(lhs / rhs),
        BinaryOp::CeilDiv => ConcreteValue::Float((lhs / rhs).ceil()),
        BinaryOp::Mod => ConcreteValue::Float(lhs % rhs),
        BinaryOp::Max => ConcreteValue::Float(lhs.max(rhs)),
        BinaryOp::Min => ConcreteValue::Float(lhs.min(rhs)),
        BinaryOp::Eq => ConcreteValue::Bool(lhs == rhs),
        BinaryOp::Lt => ConcreteValue::Bool(lhs < rhs),
        BinaryOp::Le => ConcreteValue::Bool(lhs <= rhs),
        BinaryOp::And => ConcreteValue::Bool(lhs != 0.0 && rhs != 0.0),
        BinaryOp::Or => ConcreteValue::Bool(lhs != 0.0 || rhs != 0.0),
    }
}

pub fn eval_binary(
    op: BinaryOp,
    lhs: &ConcreteValue,
    rhs: &ConcreteValue,
) -> Result<ConcreteValue, ExprError> {
    match (lhs, rhs) {
        (ConcreteValue::Int(a), ConcreteValue::Int(b)) => int_binary(op, *a, *b),
        (ConcreteValue::Bool(a), ConcreteValue::Bool(b)) => match op {
            BinaryOp::And => Ok(ConcreteValue::Bool(*a && *b)),
            BinaryOp::Or => Ok(ConcreteValue::Bool(*a || *b)),
            BinaryOp::Eq => Ok(ConcreteValue::Bool(a == b)),
            _ => Err(operand_error(op.as_str(), &[lhs, rhs])),
        },
        (ConcreteValue::Float(_), ConcreteValue::Float(_) | ConcreteValue::Int(_))
        | (ConcreteValue::Int(_), ConcreteValue::Float(_)) => {
            match (lhs.as_float(), rhs.as_float()) {
                (Some(a), Some(b)) => Ok(float_binary(op, a, b)),
                _ => Err(operand_error(op.as_str(), &[lhs, rhs])),
            }
        }
        _ => Err(operand_error(op.as_str(), &[lhs, rhs])),
    }
}

fn tensor_operand<'a>(
    op: &'static str,
    value: &'a ConcreteValue,
) -> Result<&'a TensorArg, ExprError> {
    value.as_tensor().ok_or_else(|| operand_error(op, &[value]))
}

fn metadata_tensor(like: &TensorArg, dtype: DType, sizes: Dims) -> TensorArg {
    let strides = contiguous_strides(&sizes).unwrap_or_else(|| SmallVec::from_elem(0, sizes.len()));
    TensorArg {
        dtype: dtype.storage_dtype(),
        sizes,
        strides,
        device: like.device,
        defined: like.defined,
    }
}

fn pointwise_sizes(op: &'static str, inputs: &[&TensorArg]) -> Result<Dims, ExprError> {
    let rank = inputs[0].rank();
    let mut sizes: Dims = SmallVec::from_elem(1, rank);
    for tensor in inputs {
        if tensor.rank() != rank {
            return Err(ExprError::RankMismatch {
                op,
                expected: rank,
                actual: tensor.rank(),
            });
        }
        for (axis, size) in tensor.sizes.iter().enumerate() {
            match (sizes[axis], *size) {
                (_, 1) => {}
                (1, size) => sizes[axis] = size,
                (current, size) if current == size => {}
                (current, size) => {
                    return Err(ExprError::SizeMismatch {
                        op,
                        axis,
                        lhs: current,
                        rhs: size,
                    })
                }
            }
        }
    }
    Ok(sizes)
}

fn eval_tensor_op(
    op: &ExprOp,
    out_dtype: DType,
    inputs: &[ConcreteValue],
) -> Result<ConcreteValue, ExprError> {
    let name = op.name();
    let first = inputs.first().ok_or(ExprError::Arity {
        op: name,
        expected: 1,
        actual: 0,
    })?;
    let first = tensor_operand(name, first)?;
    let result = match op {
        ExprOp::Set => metadata_tensor(first, out_dtype, first.sizes.clone()),
        ExprOp::Pointwise => {
            let tensors = inputs
                .iter()
                .map(|value| tensor_operand(name, value))
                .collect::<Result<Vec<_>, _>>()?;
            let sizes = pointwise_sizes(name, &tensors)?;
            metadata_tensor(first, out_dtype, sizes)
        }
        ExprOp::Broadcast { is_new } => {
            let mut remaining = first.sizes.iter();
            let sizes = is_new
                .iter()
                .map(|new| if *new { 1 } else { remaining.next().copied().unwrap_or(1) })
                .collect();
            metadata_tensor(first, out_dtype, sizes)
        }
        ExprOp::Transpose { perm } => {
            let mut sizes = Dims::new();
            let mut strides = Dims::new();
            for axis in perm {
                let (Some(size), Some(stride)) = (first.size(*axis), first.stride(*axis)) else {
                    return Err(ExprError::AxisOutOfRange {
                        op: name,
                        axis: *axis,
                        rank: first.rank(),
                    });
                };
                sizes.push(size);
                strides.push(stride);
            }
            TensorArg {
                sizes,
                strides,
                ..first.clone()
            }
        }
        ExprOp::Reduction { axes } => {
            if let Some(axis) = axes.iter().find(|axis| **axis >= first.rank()) {
                return Err(ExprError::AxisOutOfRange {
                    op: name,
                    axis: *axis,
                    rank: first.rank(),
                });
            }
            let sizes = first
                .sizes
                .iter()
                .enumerate()
                .filter(|(axis, _)| !axes.contains(axis))
                .map(|(_, size)| *size)
                .collect();
            metadata_tensor(first, out_dtype, sizes)
        }
        _ => return Err(operand_error(name, &[&inputs[0]])),
    };
    Ok(ConcreteValue::Tensor(result))
}

impl Expr {
    /// Computes every output of this expression from concrete inputs.
    ///
    /// Tensor ops produce metadata-only results: sizes follow the op's shape rule and strides are
    /// contiguous.
    pub fn evaluate(
        &self,
        graph: &Graph,
        inputs: &[ConcreteValue],
    ) -> Result<ExprOutputs, ExprError> {
        let name = self.op.name();
        let outputs = match &self.op {
            ExprOp::Unary(op) => {
                check_arity(name, inputs, 1)?;
                smallvec![eval_unary(*op, &inputs[0])?]
            }
            ExprOp::Binary(op) => {
                check_arity(name, inputs, 2)?;
                smallvec![eval_binary(*op, &inputs[0], &inputs[1])?]
            }
            ExprOp::Where => {
                check_arity(name, inputs, 3)?;
                let pick = if truthy(name, &inputs[0])? {
                    &inputs[1]
                } else {
                    &inputs[2]
                };
                smallvec![pick.clone()]
            }
            ExprOp::DivMod => {
                check_arity(name, inputs, 2)?;
                smallvec![
                    eval_binary(BinaryOp::Div, &inputs[0], &inputs[1])?,
                    eval_binary(BinaryOp::Mod, &inputs[0], &inputs[1])?
                ]
            }
            ExprOp::TensorSize { axis } | ExprOp::TensorStride { axis } => {
                check_arity(name, inputs, 1)?;
                let tensor = tensor_operand(name, &inputs[0])?;
                let value = match self.op {
                    ExprOp::TensorSize { .. } => tensor.size(*axis),
                    _ => tensor.stride(*axis),
                };
                let value = value.ok_or(ExprError::AxisOutOfRange {
                    op: name,
                    axis: *axis,
                    rank: tensor.rank(),
                })?;
                smallvec![ConcreteValue::Int(value)]
            }
            op => {
                let out_dtype = self
                    .outputs
                    .first()
                    .map(|out| graph.value(*out).dtype)
                    .unwrap_or(DType::F32);
                smallvec![eval_tensor_op(op, out_dtype, inputs)?]
            }
        };
        Ok(outputs)
    }
}
