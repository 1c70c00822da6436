//! Precomputed lookup tables consulted before the lazy evaluator.
//!
//! A table is filled once per launch from the program inputs and then answers identity lookups
//! without walking the graph. The evaluator only reads from it; launch dimensions are the one
//! write path and go through interior mutability so a table can be shared by reference. A launch
//! binding on a valid table re-resolves it in place, so the fast path survives it.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::ir::{Graph, ParallelType, ValueId};
use crate::runtime::ConcreteValue;

use super::config::EvaluatorConfig;
use super::error::EvalResult;
use super::evaluator::ExpressionEvaluator;

/// Fast-path contract the evaluator consumes.
pub trait PrecomputedTable {
    /// `false` until the table has been evaluated, and again after a mutable rebind.
    fn has_valid_values(&self) -> bool;

    fn get_maybe_value_for(&self, value: ValueId) -> Option<ConcreteValue>;

    /// Binds the launch extent of a thread parallel type. A valid table stays valid.
    fn bind_concrete_parallel_type_value(
        &self,
        parallel: ParallelType,
        value: ConcreteValue,
    ) -> EvalResult<()>;

    fn dump(&self) -> String;
}

/// Identity-keyed table over one graph.
///
/// `seeds` holds what was bound directly; `values` is everything resolved from them.
pub struct PrecomputedValues<'g> {
    graph: &'g Graph,
    seeds: RefCell<BTreeMap<ValueId, ConcreteValue>>,
    values: RefCell<BTreeMap<ValueId, ConcreteValue>>,
    valid: Cell<bool>,
}

impl<'g> PrecomputedValues<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            seeds: RefCell::new(BTreeMap::new()),
            values: RefCell::new(BTreeMap::new()),
            valid: Cell::new(false),
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Binds the program inputs by position, expanding tensors into their extents.
    ///
    /// Positions past `args.len()` stay unbound. Invalidates the table.
    pub fn bind_inputs(&mut self, args: &[ConcreteValue]) -> EvalResult<()> {
        let mut evaluator =
            ExpressionEvaluator::with_config(self.graph, EvaluatorConfig::default());
        for (input, arg) in self.graph.inputs().iter().zip(args) {
            evaluator.bind(*input, arg.clone())?;
        }
        let seeds = self.seeds.get_mut();
        for (value, concrete) in evaluator.bound_values() {
            seeds.insert(value, concrete.clone());
        }
        for id in self.graph.value_ids() {
            if let Some(name) = self.graph.value(id).named_scalar() {
                if let Some(concrete) = evaluator.known_named_scalar(name) {
                    seeds.insert(id, concrete.clone());
                }
            }
        }
        self.valid.set(false);
        Ok(())
    }

    pub fn bind_value(&mut self, value: ValueId, concrete: impl Into<ConcreteValue>) {
        self.seeds.get_mut().insert(value, concrete.into());
        self.valid.set(false);
    }

    /// Resolves every value reachable from the bound ones and marks the table valid.
    pub fn evaluate(&mut self) -> EvalResult<()> {
        let resolved = self.resolve()?;
        *self.values.get_mut() = resolved;
        self.valid.set(true);
        Ok(())
    }

    fn resolve(&self) -> EvalResult<BTreeMap<ValueId, ConcreteValue>> {
        let config = EvaluatorConfig::default().with_validation(false);
        let mut evaluator = ExpressionEvaluator::with_config(self.graph, config);
        for (value, concrete) in self.seeds.borrow().iter() {
            match self.graph.value(*value).named_scalar() {
                Some(name) => evaluator.bind_named(name, concrete.clone())?,
                None => evaluator.bind_with(*value, concrete.clone(), false)?,
            }
        }

        let mut resolved = BTreeMap::new();
        for id in self.graph.value_ids() {
            if self.graph.value(id).is_const() {
                continue;
            }
            let concrete = evaluator.evaluate(id)?;
            if concrete.has_value() {
                resolved.insert(id, concrete);
            }
        }
        debug!(values = resolved.len(), "precomputed table resolved");
        Ok(resolved)
    }

    pub fn invalidate(&mut self) {
        self.valid.set(false);
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }
}

impl PrecomputedTable for PrecomputedValues<'_> {
    fn has_valid_values(&self) -> bool {
        self.valid.get()
    }

    fn get_maybe_value_for(&self, value: ValueId) -> Option<ConcreteValue> {
        self.values.borrow().get(&value).cloned()
    }

    fn bind_concrete_parallel_type_value(
        &self,
        parallel: ParallelType,
        value: ConcreteValue,
    ) -> EvalResult<()> {
        let Some(name) = parallel.launch_name() else {
            return Ok(());
        };
        {
            let mut seeds = self.seeds.borrow_mut();
            for id in self.graph.value_ids() {
                if self.graph.value(id).named_scalar() == Some(name) {
                    seeds.insert(id, value.clone());
                }
            }
        }
        if self.valid.get() {
            let resolved = self.resolve()?;
            *self.values.borrow_mut() = resolved;
        }
        Ok(())
    }

    fn dump(&self) -> String {
        let mut out = format!("PrecomputedValues (valid: {})\n", self.valid.get());
        for (value, concrete) in self.values.borrow().iter() {
            let _ = writeln!(out, "  {} = {}", self.graph.describe(*value), concrete);
        }
        out
    }
}
