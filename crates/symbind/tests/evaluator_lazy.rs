use anyhow::Result;
use symbind::ir::{BinaryOp, DType, Graph, Literal, ParallelType, UnaryOp};
use symbind::runtime::{ConcreteValue, ExprError, TensorArg};
use symbind::{ErrorKind, EvalError, ExpressionEvaluator};

#[test]
fn unbound_inputs_evaluate_to_absent() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let b = graph.scalar(DType::Index);
    let sum = graph.add(a, b)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    assert_eq!(ee.evaluate(sum)?, ConcreteValue::Absent);

    ee.bind(a, 3i64)?;
    assert_eq!(ee.evaluate(sum)?, ConcreteValue::Absent);
    assert!(ee.known_value(sum).is_none());
    Ok(())
}

#[test]
fn derived_values_are_computed_and_memoized() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let b = graph.scalar(DType::Index);
    let product = graph.mul(a, b)?;
    let tiles = graph.ceil_div(a, b)?;
    let total = graph.add(product, tiles)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(a, 6i64)?;
    ee.bind(b, 4i64)?;

    assert_eq!(ee.evaluate(total)?, ConcreteValue::Int(26));
    assert_eq!(ee.known_value(product), Some(&ConcreteValue::Int(24)));
    assert_eq!(ee.known_value(tiles), Some(&ConcreteValue::Int(2)));
    assert_eq!(ee.evaluate(total)?, ConcreteValue::Int(26));
    Ok(())
}

#[test]
fn multi_output_expressions_memoize_every_output() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let b = graph.scalar(DType::Index);
    let (quotient, remainder) = graph.div_mod(a, b)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(a, 17i64)?;
    ee.bind(b, 5i64)?;
    assert_eq!(ee.evaluate(quotient)?, ConcreteValue::Int(3));
    assert_eq!(ee.known_value(remainder), Some(&ConcreteValue::Int(2)));
    Ok(())
}

#[test]
fn detached_evaluation_leaves_the_environment_alone() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let two = graph.constant(Literal::Int(2));
    let doubled = graph.mul(a, two)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(a, 21i64)?;
    assert_eq!(ee.evaluate_detached(doubled)?, ConcreteValue::Int(42));
    assert!(ee.known_value(doubled).is_none());
    assert_eq!(ee.bound_values().count(), 1);
    Ok(())
}

#[test]
fn scalar_ops_follow_their_semantics() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let b = graph.scalar(DType::Index);
    let less = graph.binary(BinaryOp::Lt, a, b)?;
    let smaller = graph.where_(less, a, b)?;
    let negated = graph.unary(UnaryOp::Neg, smaller)?;
    let x = graph.scalar(DType::F64);
    let scaled = graph.mul(x, b)?;
    let truncated = graph.unary(UnaryOp::Cast(DType::Si64), scaled)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(a, 3i64)?;
    ee.bind(b, 7i64)?;
    ee.bind(x, 0.5f64)?;

    assert_eq!(ee.evaluate(less)?, ConcreteValue::Bool(true));
    assert_eq!(ee.evaluate(negated)?, ConcreteValue::Int(-3));
    assert_eq!(ee.evaluate(scaled)?, ConcreteValue::Float(3.5));
    assert_eq!(ee.evaluate(truncated)?, ConcreteValue::Int(3));
    Ok(())
}

#[test]
fn tensor_metadata_queries_read_bound_tensors() -> Result<()> {
    let mut graph = Graph::new();
    let tv = graph.symbolic_tensor(DType::F32, 2);
    let cols = graph.tensor_size(tv, 1)?;
    let row_stride = graph.tensor_stride(tv, 0)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    assert_eq!(ee.evaluate(cols)?, ConcreteValue::Absent);
    ee.bind(tv, TensorArg::cuda(DType::F32, &[4, 8]))?;
    assert_eq!(ee.evaluate(cols)?, ConcreteValue::Int(8));
    assert_eq!(ee.evaluate(row_stride)?, ConcreteValue::Int(8));
    Ok(())
}

#[test]
fn tensor_ops_evaluate_to_metadata_tensors() -> Result<()> {
    let mut graph = Graph::new();
    let tv = graph.symbolic_tensor(DType::F32, 2);
    let swapped = graph.transpose(tv, &[1, 0])?;
    let summed = graph.reduction(swapped, &[1])?;
    let width = graph.tensor_size(summed, 0)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(tv, TensorArg::cuda(DType::F32, &[4, 8]))?;

    let ConcreteValue::Tensor(result) = ee.evaluate(swapped)? else {
        panic!("transpose should evaluate to a tensor");
    };
    assert_eq!(result.sizes.as_slice(), &[8, 4]);
    assert_eq!(result.strides.as_slice(), &[1, 8]);
    assert_eq!(ee.evaluate(width)?, ConcreteValue::Int(8));
    Ok(())
}

#[test]
fn division_by_zero_is_an_evaluation_error() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let b = graph.scalar(DType::Index);
    let quotient = graph.binary(BinaryOp::Div, a, b)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(a, 1i64)?;
    ee.bind(b, 0i64)?;
    let err = ee
        .evaluate(quotient)
        .expect_err("integer division by zero should fail");
    assert_eq!(
        err,
        EvalError::Evaluation {
            value: graph.describe(quotient),
            source: ExprError::DivisionByZero { op: "div" },
        }
    );
    assert_eq!(err.kind(), ErrorKind::User);
    Ok(())
}

#[test]
fn launch_dimensions_are_read_by_name() -> Result<()> {
    let mut graph = Graph::new();
    let tid = graph.launch_scalar(ParallelType::TIDx)?;
    let two = graph.constant(Literal::Int(2));
    let doubled = graph.mul(tid, two)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    assert_eq!(ee.evaluate_parallel(ParallelType::TIDx), ConcreteValue::Absent);

    ee.bind_parallel(ParallelType::TIDx, 128i64)?;
    assert_eq!(ee.evaluate_parallel(ParallelType::TIDx), ConcreteValue::Int(128));
    assert_eq!(ee.evaluate_parallel(ParallelType::BIDx), ConcreteValue::Absent);
    assert_eq!(ee.evaluate(doubled)?, ConcreteValue::Int(256));
    Ok(())
}

#[test]
fn only_thread_types_have_launch_dimensions() {
    let graph = Graph::new();
    let mut ee = ExpressionEvaluator::new(&graph);
    for parallel in [ParallelType::Serial, ParallelType::DIDx] {
        let err = ee
            .bind_parallel(parallel, 1i64)
            .expect_err("non-thread parallel type should be rejected");
        assert_eq!(err, EvalError::NotAThreadType(parallel));
    }
    assert_eq!(ee.evaluate_parallel(ParallelType::DIDx), ConcreteValue::Absent);
}
