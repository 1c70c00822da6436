use thiserror::Error;

use crate::ir::ParallelType;
use crate::runtime::ExprError;

/// Who is at fault for an [`EvalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller supplied bindings that contradict the graph; retry with different inputs.
    User,
    /// The graph or evaluator state is inconsistent; indicates a compiler bug.
    Internal,
}

/// Failure of a bind, evaluate, propagate or clone call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("cannot bind {value} to an undefined value")]
    UndefinedBinding { value: String },
    #[error("tried to bind constant {value} as {actual}")]
    ConstantMismatch { value: String, actual: String },
    #[error("expected {value} to be bound to a {expected}, but got a {actual}")]
    KindMismatch {
        value: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("expected {value} to be bound to a tensor of rank {expected}, but got a tensor of rank {actual}")]
    RankMismatch {
        value: String,
        expected: usize,
        actual: usize,
    },
    #[error("expected {value} to be bound to a tensor of dtype {expected}, but got a tensor of dtype {actual}")]
    DTypeMismatch {
        value: String,
        expected: String,
        actual: String,
    },
    #[error("expected {value} to be bound to a {expected} tensor, but got {actual}")]
    DeviceMismatch {
        value: String,
        expected: &'static str,
        actual: String,
    },
    #[error("scalar {actual} is not compatible with dtype {expected} of {value}")]
    ScalarTypeMismatch {
        value: String,
        expected: String,
        actual: String,
    },
    #[error("tried to bind {value} (which evaluated to {evaluated}) as {actual}")]
    InconsistentBinding {
        value: String,
        evaluated: String,
        actual: String,
    },
    #[error("iter domain {axis} of {tensor} has an expanded extent but the tensor has size {size} and stride {stride}")]
    ExpandedStrideMismatch {
        tensor: String,
        axis: usize,
        size: i64,
        stride: i64,
    },
    #[error("iter domain {axis} of {tensor} is sharded and must have size 1, but the tensor has size {size}")]
    ShardedSizeMismatch {
        tensor: String,
        axis: usize,
        size: i64,
    },
    #[error("{0} is not a launch dimension")]
    NotAThreadType(ParallelType),
    #[error("failed to evaluate {value}: {source}")]
    Evaluation {
        value: String,
        #[source]
        source: ExprError,
    },
    #[error("internal error: conflicting sizes {first}, {second} within one exact domain class")]
    ConflictingSizes { first: i64, second: i64 },
    #[error("internal error: extent {value} evaluated to non-integer {actual}")]
    NonIntegerExtent { value: String, actual: String },
    #[error("internal error: {tensor} has an empty or missing device mesh but iter domain {axis} is device parallel")]
    EmptyDeviceMesh { tensor: String, axis: usize },
    #[error("internal error: cannot clone an evaluator with bound precomputed values")]
    CloneWithPrecomputed,
    #[error("internal error: clone map has no entry for bound value {value}")]
    UnmappedClone { value: String },
    #[error("internal error: constant {value} stored in the evaluation context")]
    ConstantInEnvironment { value: String },
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::ConflictingSizes { .. }
            | EvalError::NonIntegerExtent { .. }
            | EvalError::EmptyDeviceMesh { .. }
            | EvalError::CloneWithPrecomputed
            | EvalError::UnmappedClone { .. }
            | EvalError::ConstantInEnvironment { .. } => ErrorKind::Internal,
            _ => ErrorKind::User,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}

/// Convenience alias for results returned by the evaluator.
pub type EvalResult<T> = Result<T, EvalError>;
