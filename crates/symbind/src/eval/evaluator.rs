//! Binding environment and lazy evaluator over a [`Graph`].
//!
//! Callers bind concrete values to program inputs, then ask for any derived quantity. Tensor
//! bindings are validated against the declared rank, dtype and placement and then expanded into
//! one extent binding per logical dimension. Derived values are computed on demand by walking
//! definitions depth-first and are memoized into the environment.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::ir::{
    DType, ExactDomainMap, Graph, IrCloneMap, ParallelType, ValueId, ValueKind, ValueNode,
};
use crate::profiling::eval_scope;
use crate::runtime::{ConcreteValue, TensorArg};

use super::config::EvaluatorConfig;
use super::error::{EvalError, EvalResult};
use super::precomputed::PrecomputedTable;

/// Writes produced by one top-level bind call; committed only once the whole call validates.
#[derive(Debug, Default)]
struct PendingBindings {
    values: HashMap<ValueId, ConcreteValue>,
    named: HashMap<String, ConcreteValue>,
}

/// Read view of the environment used while resolving a value. Newly computed outputs land in
/// `scratch` so that evaluation never needs mutable access to the environment itself.
struct Resolver<'a, 'g> {
    graph: &'g Graph,
    precomputed: Option<&'g dyn PrecomputedTable>,
    known_values: &'a HashMap<ValueId, ConcreteValue>,
    known_named: &'a HashMap<String, ConcreteValue>,
    pending: Option<&'a PendingBindings>,
    scratch: HashMap<ValueId, ConcreteValue>,
}

impl Resolver<'_, '_> {
    fn lookup(&self, value: ValueId, node: &ValueNode) -> Option<ConcreteValue> {
        if let Some(literal) = node.literal {
            return Some(literal.into());
        }
        if let Some(name) = node.named_scalar() {
            let named = self
                .pending
                .and_then(|pending| pending.named.get(name))
                .or_else(|| self.known_named.get(name));
            if let Some(found) = named {
                return Some(found.clone());
            }
        }
        self.pending
            .and_then(|pending| pending.values.get(&value))
            .or_else(|| self.known_values.get(&value))
            .or_else(|| self.scratch.get(&value))
            .cloned()
    }

    fn evaluate(&mut self, value: ValueId) -> EvalResult<ConcreteValue> {
        if let Some(table) = self.precomputed.filter(|table| table.has_valid_values()) {
            if let Some(hit) = table
                .get_maybe_value_for(value)
                .filter(ConcreteValue::has_value)
            {
                return Ok(hit);
            }
        }

        let node = self.graph.value(value);
        if let Some(found) = self.lookup(value, node) {
            return Ok(found);
        }
        let Some(definition) = node.definition else {
            return Ok(ConcreteValue::Absent);
        };

        let _prof_guard = eval_scope("ExpressionEvaluator::evaluate");
        let expr = self.graph.expr(definition);
        let mut inputs: SmallVec<[ConcreteValue; 4]> = SmallVec::with_capacity(expr.inputs.len());
        for input in &expr.inputs {
            let resolved = self.evaluate(*input)?;
            if !resolved.has_value() {
                trace!(
                    value = %self.graph.describe(value),
                    missing = %self.graph.describe(*input),
                    "input unresolved"
                );
                return Ok(ConcreteValue::Absent);
            }
            inputs.push(resolved);
        }

        let outputs = expr
            .evaluate(self.graph, &inputs)
            .map_err(|source| EvalError::Evaluation {
                value: self.graph.describe(value),
                source,
            })?;
        for (output, concrete) in expr.outputs.iter().zip(outputs) {
            self.scratch.insert(*output, concrete);
        }
        Ok(self.scratch.get(&value).cloned().unwrap_or_default())
    }
}

/// Binding environment plus lazy evaluator for one graph.
pub struct ExpressionEvaluator<'g> {
    graph: &'g Graph,
    config: EvaluatorConfig,
    known_values: HashMap<ValueId, ConcreteValue>,
    known_named_scalars: HashMap<String, ConcreteValue>,
    precomputed: Option<&'g dyn PrecomputedTable>,
}

impl<'g> ExpressionEvaluator<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self::with_config(graph, EvaluatorConfig::default())
    }

    pub fn with_config(graph: &'g Graph, config: EvaluatorConfig) -> Self {
        Self {
            graph,
            config,
            known_values: HashMap::new(),
            known_named_scalars: HashMap::new(),
            precomputed: None,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn config(&self) -> EvaluatorConfig {
        self.config
    }

    /// Consults `table` before every other lookup while it reports valid values.
    pub fn attach_precomputed(&mut self, table: &'g dyn PrecomputedTable) {
        self.precomputed = Some(table);
    }

    pub fn detach_precomputed(&mut self) {
        self.precomputed = None;
    }

    pub fn has_precomputed(&self) -> bool {
        self.precomputed.is_some()
    }

    /// Value stored for `value` in the environment; never consults definitions.
    pub fn known_value(&self, value: ValueId) -> Option<&ConcreteValue> {
        self.known_values.get(&value)
    }

    pub fn known_named_scalar(&self, name: &str) -> Option<&ConcreteValue> {
        self.known_named_scalars.get(name)
    }

    pub fn is_bound(&self, value: ValueId) -> bool {
        if let Some(name) = self.graph.try_value(value).and_then(ValueNode::named_scalar) {
            return self.known_named_scalars.contains_key(name);
        }
        self.known_values.contains_key(&value)
    }

    /// Identity-keyed entries, including memoized intermediates.
    pub fn bound_values(&self) -> impl Iterator<Item = (ValueId, &ConcreteValue)> + '_ {
        self.known_values.iter().map(|(value, concrete)| (*value, concrete))
    }

    fn resolver<'a>(&'a self, pending: Option<&'a PendingBindings>) -> Resolver<'a, 'g> {
        Resolver {
            graph: self.graph,
            precomputed: self.precomputed,
            known_values: &self.known_values,
            known_named: &self.known_named_scalars,
            pending,
            scratch: HashMap::new(),
        }
    }

    /// Binds `value`, re-evaluating it for consistency when the config asks for it.
    pub fn bind(&mut self, value: ValueId, concrete: impl Into<ConcreteValue>) -> EvalResult<()> {
        let validate = self.config.validate_bindings;
        self.bind_with(value, concrete, validate)
    }

    pub fn bind_with(
        &mut self,
        value: ValueId,
        concrete: impl Into<ConcreteValue>,
        validate: bool,
    ) -> EvalResult<()> {
        let _prof_guard = eval_scope("ExpressionEvaluator::bind");
        let mut pending = PendingBindings::default();
        self.stage_binding(value, concrete.into(), validate, &mut pending)?;
        debug!(
            value = %self.graph.describe(value),
            values = pending.values.len(),
            named = pending.named.len(),
            "binding committed"
        );
        self.known_values.extend(pending.values);
        self.known_named_scalars.extend(pending.named);
        Ok(())
    }

    /// Binds a named scalar by name, replacing any earlier value.
    pub fn bind_named(&mut self, name: &str, concrete: impl Into<ConcreteValue>) -> EvalResult<()> {
        let concrete = concrete.into();
        if !concrete.has_value() {
            return Err(EvalError::UndefinedBinding {
                value: name.to_string(),
            });
        }
        self.known_named_scalars.insert(name.to_string(), concrete);
        Ok(())
    }

    /// Binds a launch dimension. Goes to the precomputed table when one is attached.
    pub fn bind_parallel(
        &mut self,
        parallel: ParallelType,
        concrete: impl Into<ConcreteValue>,
    ) -> EvalResult<()> {
        let Some(name) = parallel.launch_name() else {
            return Err(EvalError::NotAThreadType(parallel));
        };
        match self.precomputed {
            Some(table) => table.bind_concrete_parallel_type_value(parallel, concrete.into()),
            None => self.bind_named(name, concrete),
        }
    }

    fn stage_binding(
        &self,
        value: ValueId,
        concrete: ConcreteValue,
        validate: bool,
        pending: &mut PendingBindings,
    ) -> EvalResult<()> {
        let node = self.graph.value(value);
        if !concrete.has_value() {
            return Err(EvalError::UndefinedBinding {
                value: self.graph.describe_for_error(value),
            });
        }
        if let Some(literal) = node.literal {
            if !concrete.matches_literal(literal) {
                return Err(EvalError::ConstantMismatch {
                    value: literal.to_string(),
                    actual: concrete.to_string(),
                });
            }
            return Ok(());
        }

        self.validate_structure(value, node, &concrete)?;

        // Named scalars are replaced on rebind rather than checked.
        if validate && node.named_scalar().is_none() && self.dependencies_satisfied(value, pending)
        {
            let evaluated = self.resolver(Some(&*pending)).evaluate(value)?;
            if evaluated.has_value() && !evaluated.same_as(&concrete) {
                return Err(EvalError::InconsistentBinding {
                    value: self.graph.describe_for_error(value),
                    evaluated: evaluated.to_string(),
                    actual: concrete.to_string(),
                });
            }
        }

        // Undefined handles are rank zero, so this binds every extent a tensor has.
        if let ConcreteValue::Tensor(tensor) = &concrete {
            self.stage_extents(value, tensor, validate, pending)?;
        }

        match &node.kind {
            ValueKind::NamedScalar { name } => {
                pending.named.insert(name.clone(), concrete);
            }
            _ => {
                pending.values.insert(value, concrete);
            }
        }
        Ok(())
    }

    /// Binds each logical dimension's extent from the tensor's reported sizes.
    ///
    /// Broadcast dimensions are checked before device-parallel ones.
    fn stage_extents(
        &self,
        value: ValueId,
        tensor: &TensorArg,
        validate: bool,
        pending: &mut PendingBindings,
    ) -> EvalResult<()> {
        let Some(desc) = self.graph.value(value).tensor() else {
            return Ok(());
        };
        let domain = self.graph.no_reduction_domain(value).unwrap_or_default();
        for (axis, id) in domain.iter().enumerate() {
            let dim = self.graph.iter_domain(*id);
            let size = tensor.size(axis).unwrap_or(0);
            if dim.is_broadcast {
                self.stage_binding(dim.extent, ConcreteValue::Int(1), validate, pending)?;
                if let Some(expanded) = dim.expanded_extent {
                    let stride = tensor.stride(axis).unwrap_or(0);
                    if size != 1 && stride != 0 {
                        return Err(EvalError::ExpandedStrideMismatch {
                            tensor: self.graph.describe_for_error(value),
                            axis,
                            size,
                            stride,
                        });
                    }
                    self.stage_binding(expanded, ConcreteValue::Int(size), validate, pending)?;
                }
            } else if let Some(mesh_axis) = dim.parallel.mesh_axis() {
                if size != 1 {
                    return Err(EvalError::ShardedSizeMismatch {
                        tensor: self.graph.describe_for_error(value),
                        axis,
                        size,
                    });
                }
                let extent = desc
                    .mesh
                    .as_ref()
                    .and_then(|mesh| mesh.extent(mesh_axis))
                    .ok_or_else(|| EvalError::EmptyDeviceMesh {
                        tensor: self.graph.describe_for_error(value),
                        axis,
                    })?;
                self.stage_binding(
                    dim.extent,
                    ConcreteValue::Int(extent as i64),
                    validate,
                    pending,
                )?;
            } else {
                self.stage_binding(dim.extent, ConcreteValue::Int(size), validate, pending)?;
            }
        }
        Ok(())
    }

    fn validate_structure(
        &self,
        value: ValueId,
        node: &ValueNode,
        concrete: &ConcreteValue,
    ) -> EvalResult<()> {
        let name = || self.graph.describe_for_error(value);
        match (&node.kind, concrete) {
            (ValueKind::Tensor(desc), ConcreteValue::Tensor(tensor)) => {
                let expected = self
                    .graph
                    .no_reduction_domain(value)
                    .map_or(0, |domain| domain.len());
                if tensor.rank() != expected {
                    return Err(EvalError::RankMismatch {
                        value: name(),
                        expected,
                        actual: tensor.rank(),
                    });
                }
                let dtype_ok = node.dtype == tensor.dtype
                    || (node.dtype == DType::Index && tensor.dtype.is_integer());
                if !dtype_ok {
                    return Err(EvalError::DTypeMismatch {
                        value: name(),
                        expected: node.dtype.to_string(),
                        actual: tensor.dtype.to_string(),
                    });
                }
                if desc.cpu_scalar {
                    if !(tensor.is_cpu_scalar() || tensor.is_meta_scalar()) {
                        return Err(EvalError::DeviceMismatch {
                            value: name(),
                            expected: "CPU or meta scalar",
                            actual: match tensor.numel() {
                                Some(numel) => format!(
                                    "a tensor on device {} with {numel} elements",
                                    tensor.device
                                ),
                                None => format!(
                                    "a tensor on device {} with {:?} elements",
                                    tensor.device, tensor.sizes
                                ),
                            },
                        });
                    }
                } else if tensor.defined && !(tensor.is_cuda() || tensor.is_meta()) {
                    return Err(EvalError::DeviceMismatch {
                        value: name(),
                        expected: "CUDA or meta",
                        actual: format!("a tensor on device {}", tensor.device),
                    });
                }
                Ok(())
            }
            (ValueKind::Tensor(_), other) => Err(EvalError::KindMismatch {
                value: name(),
                expected: "tensor",
                actual: other.kind_name(),
            }),
            (_, ConcreteValue::Tensor(_)) => Err(EvalError::KindMismatch {
                value: name(),
                expected: "scalar",
                actual: "tensor",
            }),
            (_, scalar) => {
                if scalar.is_compatible_with(node.dtype) {
                    Ok(())
                } else {
                    Err(EvalError::ScalarTypeMismatch {
                        value: name(),
                        expected: node.dtype.to_string(),
                        actual: format!("{} {}", scalar.kind_name(), scalar),
                    })
                }
            }
        }
    }

    fn is_known(&self, value: ValueId, node: &ValueNode, pending: &PendingBindings) -> bool {
        match node.named_scalar() {
            Some(name) => {
                pending.named.contains_key(name) || self.known_named_scalars.contains_key(name)
            }
            None => pending.values.contains_key(&value) || self.known_values.contains_key(&value),
        }
    }

    /// Whether every leaf `value` depends on is known, so re-evaluating it is meaningful.
    fn dependencies_satisfied(&self, value: ValueId, pending: &PendingBindings) -> bool {
        let mut stack = vec![value];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let node = self.graph.value(current);
            if node.is_const() || self.is_known(current, node, pending) {
                continue;
            }
            match node.definition {
                Some(definition) => {
                    stack.extend(self.graph.expr(definition).inputs.iter().copied())
                }
                None => return false,
            }
        }
        true
    }

    /// Resolves `value`, memoizing every computed intermediate into the environment.
    ///
    /// Returns [`ConcreteValue::Absent`] when some input is unknown.
    pub fn evaluate(&mut self, value: ValueId) -> EvalResult<ConcreteValue> {
        let mut resolver = self.resolver(None);
        let result = resolver.evaluate(value);
        let scratch = resolver.scratch;
        self.known_values.extend(scratch);
        result
    }

    /// Resolves `value` without touching the environment.
    pub fn evaluate_detached(&self, value: ValueId) -> EvalResult<ConcreteValue> {
        self.resolver(None).evaluate(value)
    }

    /// Launch extent bound for `parallel`, looked up by its launch name.
    ///
    /// Falls back to a valid attached table, which is where launch bindings go while one is
    /// attached.
    pub fn evaluate_parallel(&self, parallel: ParallelType) -> ConcreteValue {
        let Some(name) = parallel.launch_name() else {
            return ConcreteValue::Absent;
        };
        if let Some(found) = self.known_named_scalars.get(name) {
            return found.clone();
        }
        self.precomputed
            .filter(|table| table.has_valid_values())
            .and_then(|table| {
                self.graph
                    .value_ids()
                    .find(|id| self.graph.value(*id).named_scalar() == Some(name))
                    .and_then(|id| table.get_maybe_value_for(id))
            })
            .unwrap_or_default()
    }

    /// Binds unknown extents that are exactly mapped to a known one and returns how many.
    ///
    /// Builds the exact map from the graph when `exact_map` is `None`.
    pub fn propagate_bound_values_through_exact_maps(
        &mut self,
        exact_map: Option<&ExactDomainMap>,
    ) -> EvalResult<usize> {
        let _prof_guard = eval_scope("ExpressionEvaluator::propagate");
        let built;
        let exact_map = match exact_map {
            Some(map) => map,
            None => {
                built = ExactDomainMap::build(self.graph);
                &built
            }
        };

        let mut bound = 0;
        for set in exact_map.disjoint_sets() {
            let mut known_size: Option<i64> = None;
            let mut unknown: SmallVec<[ValueId; 4]> = SmallVec::new();
            for id in set {
                let extent = self.graph.iter_domain(*id).extent;
                match self.evaluate(extent)? {
                    ConcreteValue::Absent => {
                        if !unknown.contains(&extent) {
                            unknown.push(extent);
                        }
                    }
                    ConcreteValue::Int(size) => match known_size {
                        Some(first) if first != size => {
                            return Err(EvalError::ConflictingSizes {
                                first,
                                second: size,
                            });
                        }
                        Some(_) => {}
                        None => known_size = Some(size),
                    },
                    other => {
                        return Err(EvalError::NonIntegerExtent {
                            value: self.graph.describe(extent),
                            actual: other.to_string(),
                        });
                    }
                }
            }

            let Some(size) = known_size else {
                continue;
            };
            for extent in unknown {
                trace!(extent = %self.graph.describe(extent), size, "propagating extent");
                self.bind(extent, size)?;
                bound += 1;
            }
        }

        debug!(bound, "exact-map propagation finished");
        if self.config.dump_after_propagation {
            self.print();
        }
        Ok(bound)
    }

    /// Copies the environment onto a clone of the graph, remapping identities through `map`.
    pub fn clone_with<'h>(
        &self,
        graph: &'h Graph,
        map: &IrCloneMap,
    ) -> EvalResult<ExpressionEvaluator<'h>> {
        if self.precomputed.is_some() {
            return Err(EvalError::CloneWithPrecomputed);
        }
        let mut known_values = HashMap::with_capacity(self.known_values.len());
        for (value, concrete) in &self.known_values {
            let cloned = map.value(*value).ok_or_else(|| EvalError::UnmappedClone {
                value: self.graph.describe(*value),
            })?;
            known_values.insert(cloned, concrete.clone());
        }
        Ok(ExpressionEvaluator {
            graph,
            config: self.config,
            known_values,
            known_named_scalars: self.known_named_scalars.clone(),
            precomputed: None,
        })
    }

    /// Renders the environment sorted by value id, then named scalars sorted by name.
    pub fn dump(&self) -> EvalResult<String> {
        let mut values: Vec<(&ValueId, &ConcreteValue)> = self.known_values.iter().collect();
        values.sort_by_key(|(value, _)| **value);
        let mut named: Vec<(&String, &ConcreteValue)> = self.known_named_scalars.iter().collect();
        named.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let mut out = String::from("\nEvaluation context\n--------------------\n");
        for (value, concrete) in values {
            if self.graph.value(*value).is_const() {
                return Err(EvalError::ConstantInEnvironment {
                    value: self.graph.describe(*value),
                });
            }
            let _ = writeln!(
                out,
                "{} = {} ; {}",
                self.graph.describe(*value),
                concrete,
                self.graph.describe_type(*value)
            );
        }
        for (name, concrete) in named {
            let _ = writeln!(out, "{name} = {concrete} ;");
        }
        out.push_str("\nPre-computed Values\n");
        if let Some(table) = self.precomputed {
            out.push_str(&table.dump());
        }
        out.push_str("--------------------\n");
        Ok(out)
    }

    /// Emits [`dump`](Self::dump) at debug level.
    pub fn print(&self) {
        match self.dump() {
            Ok(text) => debug!("{text}"),
            Err(err) => error!(%err, "evaluation context is inconsistent"),
        }
    }
}
