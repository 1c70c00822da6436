//! Read-only dataflow IR consumed by the evaluator.

pub mod exact_map;
pub mod graph;
pub mod types;

pub use exact_map::ExactDomainMap;
pub use graph::{Graph, GraphError, IrCloneMap};
pub use types::{
    BinaryOp, DType, DeviceMesh, Expr, ExprId, ExprOp, IterDomain, IterDomainId, Literal,
    ParallelType, TensorDesc, UnaryOp, ValueId, ValueKind, ValueNode,
};
