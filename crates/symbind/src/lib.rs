mod env;
pub mod eval;
pub mod ir;
pub mod profiling;
pub mod runtime;

pub use eval::{
    ErrorKind, EvalError, EvalResult, EvaluatorConfig, ExpressionEvaluator, PrecomputedTable,
    PrecomputedValues,
};
pub use ir::{DType, ExactDomainMap, Graph, ParallelType, ValueId};
pub use runtime::{ConcreteValue, TensorArg};
