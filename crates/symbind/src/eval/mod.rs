//! Binding, lazy evaluation and exact-map propagation.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod precomputed;

pub use config::EvaluatorConfig;
pub use error::{ErrorKind, EvalError, EvalResult};
pub use evaluator::ExpressionEvaluator;
pub use precomputed::{PrecomputedTable, PrecomputedValues};
