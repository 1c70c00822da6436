use anyhow::Result;
use symbind::ir::{DType, Graph, Literal, ParallelType, ValueId};
use symbind::runtime::{ConcreteValue, TensorArg};
use symbind::{EvalError, ExpressionEvaluator, PrecomputedTable, PrecomputedValues};

fn extent(graph: &Graph, tensor: ValueId, axis: usize) -> ValueId {
    let desc = graph
        .value(tensor)
        .tensor()
        .unwrap_or_else(|| panic!("{} is not a tensor", graph.describe(tensor)));
    graph.iter_domain(desc.domain[axis]).extent
}

#[test]
fn valid_precomputed_values_take_priority() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let b = graph.scalar(DType::Index);
    let sum = graph.add(a, b)?;

    let mut table = PrecomputedValues::new(&graph);
    table.bind_value(a, 10i64);
    table.bind_value(b, 20i64);
    table.evaluate()?;
    assert!(table.has_valid_values());

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.attach_precomputed(&table);
    ee.bind(a, 1i64)?;
    ee.bind(b, 2i64)?;
    assert_eq!(ee.evaluate(sum)?, ConcreteValue::Int(30));
    assert_eq!(ee.known_value(a), Some(&ConcreteValue::Int(1)));

    ee.detach_precomputed();
    assert_eq!(ee.evaluate(sum)?, ConcreteValue::Int(3));
    Ok(())
}

#[test]
fn stale_tables_are_not_consulted() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let one = graph.constant(Literal::Int(1));
    let next = graph.add(a, one)?;

    let mut table = PrecomputedValues::new(&graph);
    table.bind_value(a, 100i64);
    assert!(!table.has_valid_values());

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.attach_precomputed(&table);
    ee.bind(a, 4i64)?;
    assert_eq!(ee.evaluate(next)?, ConcreteValue::Int(5));
    Ok(())
}

#[test]
fn table_binds_program_inputs_by_position() -> Result<()> {
    let mut graph = Graph::new();
    let tv = graph.symbolic_tensor(DType::F32, 2);
    let scale = graph.scalar(DType::Index);
    graph.add_input(tv)?;
    graph.add_input(scale)?;
    let rows = extent(&graph, tv, 0);
    let scaled = graph.mul(rows, scale)?;

    let mut table = PrecomputedValues::new(&graph);
    table.bind_inputs(&[
        ConcreteValue::from(TensorArg::cuda(DType::F32, &[4, 8])),
        ConcreteValue::from(3i64),
    ])?;
    table.evaluate()?;

    assert_eq!(table.get_maybe_value_for(rows), Some(ConcreteValue::Int(4)));
    assert_eq!(table.get_maybe_value_for(scaled), Some(ConcreteValue::Int(12)));
    Ok(())
}

#[test]
fn launch_bindings_go_to_the_attached_table() -> Result<()> {
    let mut graph = Graph::new();
    let tid = graph.launch_scalar(ParallelType::TIDx)?;
    let two = graph.constant(Literal::Int(2));
    let doubled = graph.mul(tid, two)?;

    let mut table = PrecomputedValues::new(&graph);
    table.evaluate()?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.attach_precomputed(&table);
    ee.bind_parallel(ParallelType::TIDx, 32i64)?;
    assert!(table.has_valid_values());
    assert!(ee.known_named_scalar("blockDim.x").is_none());
    assert_eq!(ee.evaluate_parallel(ParallelType::TIDx), ConcreteValue::Int(32));
    assert_eq!(ee.evaluate(tid)?, ConcreteValue::Int(32));
    assert_eq!(ee.evaluate(doubled)?, ConcreteValue::Int(64));
    Ok(())
}

#[test]
fn launch_bindings_keep_the_fast_path_alive() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let two = graph.constant(Literal::Int(2));
    let doubled = graph.mul(a, two)?;
    let tid = graph.launch_scalar(ParallelType::TIDx)?;
    let offset = graph.add(doubled, tid)?;

    let mut table = PrecomputedValues::new(&graph);
    table.bind_value(a, 21i64);
    table.evaluate()?;

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.attach_precomputed(&table);
    assert_eq!(ee.evaluate(doubled)?, ConcreteValue::Int(42));
    assert_eq!(ee.evaluate(offset)?, ConcreteValue::Absent);

    ee.bind_parallel(ParallelType::TIDx, 32i64)?;
    assert!(table.has_valid_values());
    assert_eq!(ee.evaluate(doubled)?, ConcreteValue::Int(42));
    assert_eq!(ee.evaluate(tid)?, ConcreteValue::Int(32));
    assert_eq!(ee.evaluate(offset)?, ConcreteValue::Int(74));

    ee.bind_parallel(ParallelType::TIDx, 8i64)?;
    assert_eq!(table.get_maybe_value_for(offset), Some(ConcreteValue::Int(50)));
    Ok(())
}

#[test]
fn launch_bindings_wait_for_an_unevaluated_table() -> Result<()> {
    let mut graph = Graph::new();
    let tid = graph.launch_scalar(ParallelType::TIDy)?;

    let mut table = PrecomputedValues::new(&graph);
    {
        let mut ee = ExpressionEvaluator::new(&graph);
        ee.attach_precomputed(&table);
        ee.bind_parallel(ParallelType::TIDy, 4i64)?;
        assert!(!table.has_valid_values());
        assert_eq!(ee.evaluate(tid)?, ConcreteValue::Absent);
    }

    table.evaluate()?;
    assert_eq!(table.get_maybe_value_for(tid), Some(ConcreteValue::Int(4)));
    Ok(())
}

#[test]
fn cloning_with_a_table_attached_is_refused() -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.scalar(DType::Index);
    let table = PrecomputedValues::new(&graph);
    let (cloned, map) = graph.clone_graph();

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(a, 1i64)?;
    ee.attach_precomputed(&table);
    let err = ee
        .clone_with(&cloned, &map)
        .err()
        .unwrap_or_else(|| panic!("clone should be refused while a table is attached"));
    assert_eq!(err, EvalError::CloneWithPrecomputed);
    assert!(err.is_internal());
    Ok(())
}

#[test]
fn clones_remap_bindings_and_stay_independent() -> Result<()> {
    let mut graph = Graph::new();
    let tv = graph.symbolic_tensor(DType::F32, 2);
    let extra = graph.scalar(DType::Index);

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(tv, TensorArg::cuda(DType::F32, &[4, 8]))?;
    ee.bind_parallel(ParallelType::BIDx, 16i64)?;

    let mut dest = Graph::new();
    dest.scalar(DType::Index);
    let map = graph.clone_into(&mut dest);
    let mut cloned = ee.clone_with(&dest, &map)?;

    let rows = extent(&graph, tv, 0);
    let cloned_rows = map.value(rows).unwrap_or_else(|| panic!("rows extent was not cloned"));
    assert_ne!(rows, cloned_rows);
    assert_eq!(cloned.evaluate(cloned_rows)?, ConcreteValue::Int(4));
    assert_eq!(cloned.evaluate_parallel(ParallelType::BIDx), ConcreteValue::Int(16));

    let cloned_extra = map.value(extra).unwrap_or_else(|| panic!("scalar was not cloned"));
    cloned.bind(cloned_extra, 5i64)?;
    assert!(!ee.is_bound(extra));
    assert_eq!(cloned.bound_values().count(), ee.bound_values().count() + 1);
    Ok(())
}

#[test]
fn dump_lists_values_names_and_the_table() -> Result<()> {
    let mut graph = Graph::new();
    let tv = graph.symbolic_tensor(DType::F32, 2);
    let table = PrecomputedValues::new(&graph);

    let mut ee = ExpressionEvaluator::new(&graph);
    ee.bind(tv, TensorArg::cuda(DType::F32, &[4, 8]))?;
    ee.bind_named("blockDim.x", 128i64)?;

    let text = ee.dump()?;
    assert!(text.contains("Evaluation context"), "{text}");
    assert!(text.contains("i0 = 4 ; Scalar(index)"), "{text}");
    assert!(text.contains("i1 = 8 ; Scalar(index)"), "{text}");
    assert!(text.contains("T2 = tensor<f32>[4, 8]"), "{text}");
    assert!(text.contains("TensorView(f32, rank 2)"), "{text}");
    assert!(text.contains("blockDim.x = 128 ;"), "{text}");
    assert!(text.find("i0 =") < text.find("i1 ="), "{text}");
    assert!(!text.contains("PrecomputedValues"), "{text}");

    ee.attach_precomputed(&table);
    let text = ee.dump()?;
    assert!(text.contains("Pre-computed Values\nPrecomputedValues (valid: false)"), "{text}");
    ee.print();
    Ok(())
}

#[test]
fn graphs_survive_a_json_round_trip() -> Result<()> {
    let mut graph = Graph::new();
    let tv = graph.symbolic_tensor(DType::Bf16, 3);
    graph.add_input(tv)?;
    let out = graph.transpose(tv, &[2, 0, 1])?;
    graph.add_output(out)?;

    let text = graph.to_json_string()?;
    let restored = Graph::from_json_str(&text)?;
    assert_eq!(restored, graph);

    let mut ee = ExpressionEvaluator::new(&restored);
    ee.bind(tv, TensorArg::cuda(DType::Bf16, &[2, 3, 4]))?;
    let ConcreteValue::Tensor(result) = ee.evaluate(out)? else {
        panic!("transpose should evaluate to a tensor");
    };
    assert_eq!(result.sizes.as_slice(), &[4, 2, 3]);
    Ok(())
}
