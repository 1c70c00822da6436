use anyhow::Result;
use symbind::ir::{
    DType, ExactDomainMap, Graph, IterDomain, IterDomainId, Literal, TensorDesc, ValueId,
};
use symbind::runtime::{ConcreteValue, TensorArg};
use symbind::{EvalError, ExpressionEvaluator};

fn domain(graph: &Graph, tensor: ValueId) -> Vec<IterDomainId> {
    graph
        .value(tensor)
        .tensor()
        .map(|desc| desc.domain.clone())
        .unwrap_or_default()
}

fn extent(graph: &Graph, tensor: ValueId, axis: usize) -> ValueId {
    graph.iter_domain(domain(graph, tensor)[axis]).extent
}

#[test]
fn propagation_closes_exact_classes() -> Result<()> {
    let mut graph = Graph::new();
    let input = graph.symbolic_tensor(DType::F32, 2);
    let copy = graph.set(input)?;
    let swapped = graph.transpose(copy, &[1, 0])?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(input, TensorArg::cuda(DType::F32, &[4, 8]))?;
    assert_eq!(ee.evaluate(extent(&graph, copy, 0))?, ConcreteValue::Absent);

    let bound = ee.propagate_bound_values_through_exact_maps(None)?;
    assert_eq!(bound, 4);
    assert_eq!(ee.evaluate(extent(&graph, copy, 0))?, ConcreteValue::Int(4));
    assert_eq!(ee.evaluate(extent(&graph, copy, 1))?, ConcreteValue::Int(8));
    assert_eq!(ee.evaluate(extent(&graph, swapped, 0))?, ConcreteValue::Int(8));
    assert_eq!(ee.evaluate(extent(&graph, swapped, 1))?, ConcreteValue::Int(4));

    assert_eq!(ee.propagate_bound_values_through_exact_maps(None)?, 0);
    Ok(())
}

#[test]
fn propagation_without_known_sizes_binds_nothing() -> Result<()> {
    let mut graph = Graph::new();
    let input = graph.symbolic_tensor(DType::F32, 2);
    graph.set(input)?;

    let mut ee = ExpressionEvaluator::new(&graph);
    assert_eq!(ee.propagate_bound_values_through_exact_maps(None)?, 0);
    assert_eq!(ee.bound_values().count(), 0);
    Ok(())
}

#[test]
fn propagation_accepts_a_prebuilt_map() -> Result<()> {
    let mut graph = Graph::new();
    let lhs = graph.symbolic_tensor(DType::F32, 1);
    let rhs = graph.symbolic_tensor(DType::F32, 1);
    let out = graph.pointwise(&[lhs, rhs])?;
    let map = ExactDomainMap::build(&graph);

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(lhs, TensorArg::cuda(DType::F32, &[6]))?;
    assert_eq!(ee.propagate_bound_values_through_exact_maps(Some(&map))?, 2);
    assert_eq!(ee.evaluate(extent(&graph, rhs, 0))?, ConcreteValue::Int(6));
    assert_eq!(ee.evaluate(extent(&graph, out, 0))?, ConcreteValue::Int(6));
    Ok(())
}

#[test]
fn conflicting_sizes_are_an_internal_error() -> Result<()> {
    let mut graph = Graph::new();
    let lhs = graph.symbolic_tensor(DType::F32, 1);
    let rhs = graph.symbolic_tensor(DType::F32, 1);
    graph.pointwise(&[lhs, rhs])?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(lhs, TensorArg::cuda(DType::F32, &[4]))?;
    ee.bind(rhs, TensorArg::cuda(DType::F32, &[5]))?;
    let err = ee
        .propagate_bound_values_through_exact_maps(None)
        .expect_err("4 and 5 are exactly mapped");
    assert_eq!(err, EvalError::ConflictingSizes { first: 4, second: 5 });
    assert!(err.is_internal());
    let message = err.to_string();
    assert!(message.contains('4') && message.contains('5'), "{message}");
    Ok(())
}

#[test]
fn non_integer_extent_is_an_internal_error() -> Result<()> {
    let mut graph = Graph::new();
    let width = graph.scalar(DType::F64);
    let dim = graph.add_iter_domain(IterDomain::iteration(width))?;
    graph.tensor(DType::F32, TensorDesc::new(vec![dim]))?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(width, 2.5f64)?;
    let err = ee
        .propagate_bound_values_through_exact_maps(None)
        .expect_err("2.5 is not an extent");
    assert!(matches!(err, EvalError::NonIntegerExtent { .. }));
    assert!(err.is_internal());
    Ok(())
}

#[test]
fn broadcast_domains_only_map_to_broadcast_domains() -> Result<()> {
    let mut graph = Graph::new();
    let rows = graph.symbolic_iter_domain();
    let one = graph.constant(Literal::Int(1));
    let bcast = graph.add_iter_domain(IterDomain::broadcast(one))?;
    let partial = graph.tensor(DType::F32, TensorDesc::new(vec![rows, bcast]))?;
    let full = graph.symbolic_tensor(DType::F32, 2);
    let out = graph.pointwise(&[partial, full])?;
    let out_domain = domain(&graph, out);
    let full_domain = domain(&graph, full);

    let map = ExactDomainMap::build(&graph);
    assert!(map.are_mapped(rows, out_domain[0]));
    assert!(map.are_mapped(full_domain[0], rows));
    assert!(map.are_mapped(full_domain[1], out_domain[1]));
    assert!(!map.are_mapped(bcast, out_domain[1]));
    Ok(())
}

#[test]
fn broadcast_maps_kept_dimensions_only() -> Result<()> {
    let mut graph = Graph::new();
    let input = graph.symbolic_tensor(DType::F32, 1);
    let expanded = graph.broadcast(input, &[true, false])?;
    let input_domain = domain(&graph, input);
    let out_domain = domain(&graph, expanded);

    let map = ExactDomainMap::build(&graph);
    assert!(map.are_mapped(input_domain[0], out_domain[1]));
    assert!(!map.are_mapped(input_domain[0], out_domain[0]));
    assert_eq!(map.set_of(out_domain[0]).map(<[_]>::len), Some(1));

    let total: usize = map.disjoint_sets().map(<[_]>::len).sum();
    assert_eq!(total, graph.num_iter_domains());
    Ok(())
}

#[test]
fn reduction_keeps_positional_mapping() -> Result<()> {
    let mut graph = Graph::new();
    let input = graph.symbolic_tensor(DType::F32, 2);
    let summed = graph.reduction(input, &[1])?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(input, TensorArg::cuda(DType::F32, &[3, 7]))?;
    ee.propagate_bound_values_through_exact_maps(None)?;
    assert_eq!(ee.evaluate(extent(&graph, summed, 0))?, ConcreteValue::Int(3));
    assert_eq!(ee.evaluate(extent(&graph, summed, 1))?, ConcreteValue::Int(7));
    Ok(())
}
