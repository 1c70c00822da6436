//! Arena-backed dataflow graph of scalar and tensor values.
//!
//! Values, expressions and iteration domains live in flat vectors and are addressed by
//! `ValueId`, `ExprId` and `IterDomainId`. Builders only accept handles that already exist,
//! so expression order is always a valid topological order.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

use super::types::{
    BinaryOp, DType, Expr, ExprId, ExprOp, IterDomain, IterDomainId, Literal, ParallelType,
    TensorDesc, UnaryOp, ValueId, ValueKind, ValueNode,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("value {0:?} does not belong to this graph")]
    UnknownValue(ValueId),
    #[error("iter domain {0:?} does not belong to this graph")]
    UnknownIterDomain(IterDomainId),
    #[error("{op} expects a tensor operand, got {value}")]
    NotATensor { op: &'static str, value: String },
    #[error("{op} expects a scalar operand, got {value}")]
    NotAScalar { op: &'static str, value: String },
    #[error("{op} expects rank {expected}, got rank {actual}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{op} axis {axis} is out of range for rank {rank}")]
    InvalidAxis {
        op: &'static str,
        axis: usize,
        rank: usize,
    },
    #[error("transpose permutation {perm:?} is not a permutation of rank {rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },
    #[error("expanded extent requires a broadcast iter domain")]
    ExpandedWithoutBroadcast,
    #[error("{0} is not a launch dimension")]
    NotAThreadType(ParallelType),
    #[error("{op} requires at least one input")]
    EmptyInputs { op: &'static str },
}

#[derive(Debug, Error)]
pub enum GraphSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity remapping produced by [`Graph::clone_into`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrCloneMap {
    values: Vec<ValueId>,
    exprs: Vec<ExprId>,
    iter_domains: Vec<IterDomainId>,
}

impl IrCloneMap {
    pub fn value(&self, original: ValueId) -> Option<ValueId> {
        self.values.get(original.0 as usize).copied()
    }

    pub fn expr(&self, original: ExprId) -> Option<ExprId> {
        self.exprs.get(original.0 as usize).copied()
    }

    pub fn iter_domain(&self, original: IterDomainId) -> Option<IterDomainId> {
        self.iter_domains.get(original.0 as usize).copied()
    }
}

/// Read-only graph consumed by the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    values: Vec<ValueNode>,
    exprs: Vec<Expr>,
    iter_domains: Vec<IterDomain>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node for `id`.
    ///
    /// Panics when `id` was produced by another graph, like slice indexing does.
    pub fn value(&self, id: ValueId) -> &ValueNode {
        &self.values[id.0 as usize]
    }

    pub fn try_value(&self, id: ValueId) -> Option<&ValueNode> {
        self.values.get(id.0 as usize)
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn iter_domain(&self, id: IterDomainId) -> &IterDomain {
        &self.iter_domains[id.0 as usize]
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn num_iter_domains(&self) -> usize {
        self.iter_domains.len()
    }

    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        (0..self.values.len()).map(|index| ValueId(index as u32))
    }

    /// Expressions in creation order, which is topological.
    pub fn exprs(&self) -> impl Iterator<Item = (ExprId, &Expr)> + '_ {
        self.exprs
            .iter()
            .enumerate()
            .map(|(index, expr)| (ExprId(index as u32), expr))
    }

    pub fn iter_domain_ids(&self) -> impl Iterator<Item = IterDomainId> + '_ {
        (0..self.iter_domains.len()).map(|index| IterDomainId(index as u32))
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Position of `value` among the program inputs, if it is one.
    pub fn input_position(&self, value: ValueId) -> Option<usize> {
        self.inputs.iter().position(|input| *input == value)
    }

    /// Logical domain of a tensor value with reduction dimensions removed.
    pub fn no_reduction_domain(&self, value: ValueId) -> Option<SmallVec<[IterDomainId; 6]>> {
        let desc = self.try_value(value)?.tensor()?;
        Some(
            desc.domain
                .iter()
                .copied()
                .filter(|id| !self.iter_domain(*id).is_reduction)
                .collect(),
        )
    }

    /// Short printable name: literal for constants, name for named scalars, `T<n>` for tensors.
    pub fn describe(&self, id: ValueId) -> String {
        let Some(node) = self.try_value(id) else {
            return format!("<foreign {}>", id.0);
        };
        if let Some(literal) = node.literal {
            return literal.to_string();
        }
        match &node.kind {
            ValueKind::NamedScalar { name } => name.clone(),
            ValueKind::Tensor(_) => format!("T{}", id.0),
            ValueKind::Scalar => {
                let prefix = if node.dtype.is_bool() {
                    'b'
                } else if node.dtype.is_float() || node.dtype.is_complex() {
                    'd'
                } else {
                    'i'
                };
                format!("{prefix}{}", id.0)
            }
        }
    }

    /// Name used in diagnostics; program inputs carry their input position.
    pub fn describe_for_error(&self, id: ValueId) -> String {
        match self.input_position(id) {
            Some(position) => format!("{} (program input #{position})", self.describe(id)),
            None => self.describe(id),
        }
    }

    pub fn describe_type(&self, id: ValueId) -> String {
        let Some(node) = self.try_value(id) else {
            return "<foreign>".to_string();
        };
        match &node.kind {
            ValueKind::Scalar => format!("Scalar({})", node.dtype),
            ValueKind::NamedScalar { .. } => format!("NamedScalar({})", node.dtype),
            ValueKind::Tensor(desc) => {
                format!("TensorView({}, rank {})", node.dtype, desc.domain.len())
            }
        }
    }

    fn push_value(&mut self, node: ValueNode) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(node);
        id
    }

    fn check_value(&self, id: ValueId) -> Result<&ValueNode, GraphError> {
        self.try_value(id).ok_or(GraphError::UnknownValue(id))
    }

    fn check_scalar(&self, op: &'static str, id: ValueId) -> Result<DType, GraphError> {
        let node = self.check_value(id)?;
        if node.is_tensor() {
            return Err(GraphError::NotAScalar {
                op,
                value: self.describe(id),
            });
        }
        Ok(node.dtype)
    }

    fn check_tensor(&self, op: &'static str, id: ValueId) -> Result<&TensorDesc, GraphError> {
        self.check_value(id)?
            .tensor()
            .ok_or_else(|| GraphError::NotATensor {
                op,
                value: self.describe(id),
            })
    }

    /// Free scalar symbol.
    pub fn scalar(&mut self, dtype: DType) -> ValueId {
        self.push_value(ValueNode {
            dtype,
            kind: ValueKind::Scalar,
            literal: None,
            definition: None,
        })
    }

    pub fn constant(&mut self, literal: Literal) -> ValueId {
        self.constant_typed(literal, literal.default_dtype())
    }

    pub fn constant_typed(&mut self, literal: Literal, dtype: DType) -> ValueId {
        self.push_value(ValueNode {
            dtype,
            kind: ValueKind::Scalar,
            literal: Some(literal),
            definition: None,
        })
    }

    pub fn named_scalar(&mut self, name: impl Into<String>, dtype: DType) -> ValueId {
        self.push_value(ValueNode {
            dtype,
            kind: ValueKind::NamedScalar { name: name.into() },
            literal: None,
            definition: None,
        })
    }

    /// Named scalar for a launch dimension (`blockDim.x` for `TIDx`, ...).
    pub fn launch_scalar(&mut self, parallel: ParallelType) -> Result<ValueId, GraphError> {
        let name = parallel
            .launch_name()
            .ok_or(GraphError::NotAThreadType(parallel))?;
        Ok(self.named_scalar(name, DType::Index))
    }

    pub fn add_iter_domain(&mut self, domain: IterDomain) -> Result<IterDomainId, GraphError> {
        self.check_scalar("iter_domain", domain.extent)?;
        if let Some(expanded) = domain.expanded_extent {
            self.check_scalar("iter_domain", expanded)?;
            if !domain.is_broadcast {
                return Err(GraphError::ExpandedWithoutBroadcast);
            }
        }
        let id = IterDomainId(self.iter_domains.len() as u32);
        self.iter_domains.push(domain);
        Ok(id)
    }

    /// Iteration domain with a fresh symbolic extent.
    pub fn symbolic_iter_domain(&mut self) -> IterDomainId {
        let extent = self.scalar(DType::Index);
        let id = IterDomainId(self.iter_domains.len() as u32);
        self.iter_domains.push(IterDomain::iteration(extent));
        id
    }

    pub fn tensor(&mut self, dtype: DType, desc: TensorDesc) -> Result<ValueId, GraphError> {
        for id in &desc.domain {
            if id.0 as usize >= self.iter_domains.len() {
                return Err(GraphError::UnknownIterDomain(*id));
            }
        }
        Ok(self.push_value(ValueNode {
            dtype,
            kind: ValueKind::Tensor(desc),
            literal: None,
            definition: None,
        }))
    }

    /// Tensor whose every dimension has a fresh symbolic extent.
    pub fn symbolic_tensor(&mut self, dtype: DType, rank: usize) -> ValueId {
        let domain: Vec<IterDomainId> = (0..rank).map(|_| self.symbolic_iter_domain()).collect();
        self.push_value(ValueNode {
            dtype,
            kind: ValueKind::Tensor(TensorDesc::new(domain)),
            literal: None,
            definition: None,
        })
    }

    pub fn add_input(&mut self, value: ValueId) -> Result<(), GraphError> {
        self.check_value(value)?;
        if !self.inputs.contains(&value) {
            self.inputs.push(value);
        }
        Ok(())
    }

    pub fn add_output(&mut self, value: ValueId) -> Result<(), GraphError> {
        self.check_value(value)?;
        if !self.outputs.contains(&value) {
            self.outputs.push(value);
        }
        Ok(())
    }

    fn push_expr(
        &mut self,
        op: ExprOp,
        inputs: SmallVec<[ValueId; 4]>,
        outputs: SmallVec<[ValueNode; 2]>,
    ) -> SmallVec<[ValueId; 2]> {
        let expr_id = ExprId(self.exprs.len() as u32);
        let outputs: SmallVec<[ValueId; 2]> = outputs
            .into_iter()
            .map(|mut node| {
                node.definition = Some(expr_id);
                self.push_value(node)
            })
            .collect();
        self.exprs.push(Expr {
            op,
            inputs,
            outputs: outputs.clone(),
        });
        outputs
    }

    fn derived_scalar(dtype: DType) -> ValueNode {
        ValueNode {
            dtype,
            kind: ValueKind::Scalar,
            literal: None,
            definition: None,
        }
    }

    pub fn unary(&mut self, op: UnaryOp, input: ValueId) -> Result<ValueId, GraphError> {
        let dtype = self.check_scalar("unary", input)?;
        let dtype = match op {
            UnaryOp::Cast(target) => target,
            UnaryOp::Not if dtype.is_bool() => DType::I1,
            _ => dtype,
        };
        let outputs = self.push_expr(
            ExprOp::Unary(op),
            smallvec![input],
            smallvec![Self::derived_scalar(dtype)],
        );
        Ok(outputs[0])
    }

    pub fn binary(
        &mut self,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<ValueId, GraphError> {
        let lhs_dtype = self.check_scalar(op.as_str(), lhs)?;
        let rhs_dtype = self.check_scalar(op.as_str(), rhs)?;
        let dtype = if op.is_predicate() {
            DType::I1
        } else if !lhs_dtype.is_float() && rhs_dtype.is_float() {
            rhs_dtype
        } else {
            lhs_dtype
        };
        let outputs = self.push_expr(
            ExprOp::Binary(op),
            smallvec![lhs, rhs],
            smallvec![Self::derived_scalar(dtype)],
        );
        Ok(outputs[0])
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, GraphError> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, GraphError> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn ceil_div(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, GraphError> {
        self.binary(BinaryOp::CeilDiv, lhs, rhs)
    }

    pub fn where_(
        &mut self,
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    ) -> Result<ValueId, GraphError> {
        self.check_scalar("where", cond)?;
        let dtype = self.check_scalar("where", on_true)?;
        self.check_scalar("where", on_false)?;
        let outputs = self.push_expr(
            ExprOp::Where,
            smallvec![cond, on_true, on_false],
            smallvec![Self::derived_scalar(dtype)],
        );
        Ok(outputs[0])
    }

    /// Quotient and remainder from a single two-output expression.
    pub fn div_mod(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<(ValueId, ValueId), GraphError> {
        let dtype = self.check_scalar("div_mod", lhs)?;
        self.check_scalar("div_mod", rhs)?;
        let outputs = self.push_expr(
            ExprOp::DivMod,
            smallvec![lhs, rhs],
            smallvec![Self::derived_scalar(dtype), Self::derived_scalar(dtype)],
        );
        Ok((outputs[0], outputs[1]))
    }

    fn tensor_metadata_query(
        &mut self,
        op: ExprOp,
        tensor: ValueId,
        axis: usize,
    ) -> Result<ValueId, GraphError> {
        let name = op.name();
        let rank = self
            .no_reduction_domain(tensor)
            .ok_or_else(|| GraphError::NotATensor {
                op: name,
                value: self.describe(tensor),
            })?
            .len();
        if axis >= rank {
            return Err(GraphError::InvalidAxis { op: name, axis, rank });
        }
        let outputs = self.push_expr(
            op,
            smallvec![tensor],
            smallvec![Self::derived_scalar(DType::Index)],
        );
        Ok(outputs[0])
    }

    /// Runtime size of `tensor` along `axis`.
    pub fn tensor_size(&mut self, tensor: ValueId, axis: usize) -> Result<ValueId, GraphError> {
        self.tensor_metadata_query(ExprOp::TensorSize { axis }, tensor, axis)
    }

    pub fn tensor_stride(&mut self, tensor: ValueId, axis: usize) -> Result<ValueId, GraphError> {
        self.tensor_metadata_query(ExprOp::TensorStride { axis }, tensor, axis)
    }

    /// Fresh output dimension mirroring `source` with an unbound extent.
    fn derived_iter_domain(&mut self, source: IterDomainId, reduction: bool) -> IterDomainId {
        let source = self.iter_domain(source).clone();
        let domain = if source.is_broadcast && !reduction {
            let one = self.constant(Literal::Int(1));
            match source.expanded_extent {
                Some(_) => {
                    let expanded = self.scalar(DType::Index);
                    IterDomain::expanded(one, expanded)
                }
                None => IterDomain::broadcast(one),
            }
        } else {
            let extent = self.scalar(DType::Index);
            IterDomain {
                is_reduction: reduction,
                ..IterDomain::iteration(extent)
            }
        };
        let id = IterDomainId(self.iter_domains.len() as u32);
        self.iter_domains.push(domain.parallelize(source.parallel));
        id
    }

    fn tensor_output(&self, dtype: DType, domain: Vec<IterDomainId>, like: ValueId) -> ValueNode {
        let mesh = self.value(like).tensor().and_then(|desc| desc.mesh.clone());
        ValueNode {
            dtype,
            kind: ValueKind::Tensor(TensorDesc {
                domain,
                mesh,
                cpu_scalar: false,
            }),
            literal: None,
            definition: None,
        }
    }

    pub fn set(&mut self, input: ValueId) -> Result<ValueId, GraphError> {
        self.check_tensor("set", input)?;
        let dtype = self.value(input).dtype;
        let source = self.no_reduction_domain(input).unwrap_or_default();
        let domain = source
            .iter()
            .map(|id| self.derived_iter_domain(*id, false))
            .collect();
        let node = self.tensor_output(dtype, domain, input);
        Ok(self.push_expr(ExprOp::Set, smallvec![input], smallvec![node])[0])
    }

    pub fn pointwise(&mut self, inputs: &[ValueId]) -> Result<ValueId, GraphError> {
        let first = *inputs
            .first()
            .ok_or(GraphError::EmptyInputs { op: "pointwise" })?;
        self.check_tensor("pointwise", first)?;
        let dtype = self.value(first).dtype;
        self.pointwise_typed(dtype, inputs)
    }

    /// Elementwise op over same-rank tensors; broadcast dims align positionally.
    pub fn pointwise_typed(
        &mut self,
        dtype: DType,
        inputs: &[ValueId],
    ) -> Result<ValueId, GraphError> {
        let first = *inputs
            .first()
            .ok_or(GraphError::EmptyInputs { op: "pointwise" })?;
        let mut domains = Vec::with_capacity(inputs.len());
        for input in inputs {
            self.check_tensor("pointwise", *input)?;
            domains.push(self.no_reduction_domain(*input).unwrap_or_default());
        }
        let rank = domains[0].len();
        for domain in &domains[1..] {
            if domain.len() != rank {
                return Err(GraphError::RankMismatch {
                    op: "pointwise",
                    expected: rank,
                    actual: domain.len(),
                });
            }
        }
        let mut out_domain = Vec::with_capacity(rank);
        for axis in 0..rank {
            let source = domains
                .iter()
                .map(|domain| domain[axis])
                .find(|id| !self.iter_domain(*id).is_broadcast)
                .unwrap_or(domains[0][axis]);
            out_domain.push(self.derived_iter_domain(source, false));
        }
        let node = self.tensor_output(dtype, out_domain, first);
        Ok(self.push_expr(ExprOp::Pointwise, inputs.iter().copied().collect(), smallvec![node])[0])
    }

    /// Inserts new broadcast dimensions where `is_new` is set.
    pub fn broadcast(&mut self, input: ValueId, is_new: &[bool]) -> Result<ValueId, GraphError> {
        self.check_tensor("broadcast", input)?;
        let source = self.no_reduction_domain(input).unwrap_or_default();
        let kept = is_new.iter().filter(|new| !**new).count();
        if kept != source.len() {
            return Err(GraphError::RankMismatch {
                op: "broadcast",
                expected: source.len(),
                actual: kept,
            });
        }
        let mut remaining = source.iter();
        let mut domain = Vec::with_capacity(is_new.len());
        for new in is_new {
            if *new {
                let one = self.constant(Literal::Int(1));
                let id = IterDomainId(self.iter_domains.len() as u32);
                self.iter_domains.push(IterDomain::broadcast(one));
                domain.push(id);
            } else if let Some(id) = remaining.next() {
                domain.push(self.derived_iter_domain(*id, false));
            }
        }
        let dtype = self.value(input).dtype;
        let node = self.tensor_output(dtype, domain, input);
        let op = ExprOp::Broadcast {
            is_new: is_new.to_vec(),
        };
        Ok(self.push_expr(op, smallvec![input], smallvec![node])[0])
    }

    /// Output dimension `i` is input dimension `perm[i]`.
    pub fn transpose(&mut self, input: ValueId, perm: &[usize]) -> Result<ValueId, GraphError> {
        self.check_tensor("transpose", input)?;
        let source = self.no_reduction_domain(input).unwrap_or_default();
        let unique: HashSet<usize> = perm.iter().copied().collect();
        if perm.len() != source.len()
            || unique.len() != perm.len()
            || perm.iter().any(|axis| *axis >= source.len())
        {
            return Err(GraphError::InvalidPermutation {
                perm: perm.to_vec(),
                rank: source.len(),
            });
        }
        let domain = perm
            .iter()
            .map(|axis| self.derived_iter_domain(source[*axis], false))
            .collect();
        let dtype = self.value(input).dtype;
        let node = self.tensor_output(dtype, domain, input);
        let op = ExprOp::Transpose {
            perm: perm.to_vec(),
        };
        Ok(self.push_expr(op, smallvec![input], smallvec![node])[0])
    }

    /// Reduces over `axes`; the output keeps them as reduction dimensions.
    pub fn reduction(&mut self, input: ValueId, axes: &[usize]) -> Result<ValueId, GraphError> {
        self.check_tensor("reduction", input)?;
        let source = self.no_reduction_domain(input).unwrap_or_default();
        for axis in axes {
            if *axis >= source.len() {
                return Err(GraphError::InvalidAxis {
                    op: "reduction",
                    axis: *axis,
                    rank: source.len(),
                });
            }
        }
        let domain = source
            .iter()
            .enumerate()
            .map(|(axis, id)| self.derived_iter_domain(*id, axes.contains(&axis)))
            .collect();
        let dtype = self.value(input).dtype;
        let node = self.tensor_output(dtype, domain, input);
        let mut axes = axes.to_vec();
        axes.sort_unstable();
        axes.dedup();
        Ok(self.push_expr(ExprOp::Reduction { axes }, smallvec![input], smallvec![node])[0])
    }

    /// Appends a structural copy of this graph to `dest` and returns the identity remapping.
    pub fn clone_into(&self, dest: &mut Graph) -> IrCloneMap {
        let value_base = dest.values.len() as u32;
        let expr_base = dest.exprs.len() as u32;
        let domain_base = dest.iter_domains.len() as u32;
        let value = |id: ValueId| ValueId(id.0 + value_base);
        let domain = |id: IterDomainId| IterDomainId(id.0 + domain_base);

        dest.iter_domains
            .extend(self.iter_domains.iter().map(|id| IterDomain {
                extent: value(id.extent),
                expanded_extent: id.expanded_extent.map(value),
                ..id.clone()
            }));
        dest.values.extend(self.values.iter().map(|node| {
            let kind = match &node.kind {
                ValueKind::Tensor(desc) => ValueKind::Tensor(TensorDesc {
                    domain: desc.domain.iter().copied().map(domain).collect(),
                    ..desc.clone()
                }),
                other => other.clone(),
            };
            ValueNode {
                kind,
                definition: node.definition.map(|expr| ExprId(expr.0 + expr_base)),
                ..node.clone()
            }
        }));
        dest.exprs.extend(self.exprs.iter().map(|expr| Expr {
            op: expr.op.clone(),
            inputs: expr.inputs.iter().copied().map(value).collect(),
            outputs: expr.outputs.iter().copied().map(value).collect(),
        }));
        for input in &self.inputs {
            dest.inputs.push(value(*input));
        }
        for output in &self.outputs {
            dest.outputs.push(value(*output));
        }

        IrCloneMap {
            values: self.value_ids().map(value).collect(),
            exprs: (0..self.exprs.len() as u32)
                .map(|index| ExprId(index + expr_base))
                .collect(),
            iter_domains: self.iter_domain_ids().map(domain).collect(),
        }
    }

    /// Clones into a fresh graph.
    pub fn clone_graph(&self) -> (Graph, IrCloneMap) {
        let mut dest = Graph::new();
        let map = self.clone_into(&mut dest);
        (dest, map)
    }

    pub fn to_json_string(&self) -> Result<String, GraphSerdeError> {
        serde_json::to_string_pretty(self).map_err(GraphSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, GraphSerdeError> {
        serde_json::from_str(src).map_err(GraphSerdeError::from)
    }
}
