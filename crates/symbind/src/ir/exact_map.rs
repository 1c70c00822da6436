//! Exact equivalence classes over iteration domains.
//!
//! Two domains are exactly mapped when the graph's tensor expressions force them to have the
//! same extent. Broadcast domains are never mapped to non-broadcast domains, since a resolved
//! broadcast legitimately changes the extent.

use std::collections::BTreeMap;

use super::graph::Graph;
use super::types::{ExprOp, IterDomainId};

/// Union-find over dense indices with path halving and union by size.
#[derive(Debug, Clone)]
pub struct DisjointSets {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSets {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            size: vec![1; len],
        }
    }

    pub fn find(&mut self, mut index: usize) -> usize {
        while self.parent[index] != index {
            self.parent[index] = self.parent[self.parent[index]];
            index = self.parent[index];
        }
        index
    }

    /// Returns `true` when the two elements were in different sets.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut a, mut b) = (self.find(a), self.find(b));
        if a == b {
            return false;
        }
        if self.size[a] < self.size[b] {
            std::mem::swap(&mut a, &mut b);
        }
        self.parent[b] = a;
        self.size[a] += self.size[b];
        true
    }
}

/// Partition of every iteration domain of a graph into exact equivalence classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactDomainMap {
    sets: Vec<Vec<IterDomainId>>,
    set_of: Vec<usize>,
}

impl ExactDomainMap {
    /// Computes the exact map from the graph's tensor expressions.
    pub fn build(graph: &Graph) -> Self {
        let mut sets = DisjointSets::new(graph.num_iter_domains());
        let map = |sets: &mut DisjointSets, a: IterDomainId, b: IterDomainId| {
            let (lhs, rhs) = (graph.iter_domain(a), graph.iter_domain(b));
            if lhs.is_broadcast == rhs.is_broadcast {
                sets.union(a.0 as usize, b.0 as usize);
            }
        };

        for (_, expr) in graph.exprs() {
            if !expr.op.is_tensor_op() {
                continue;
            }
            let Some(output) = expr
                .outputs
                .first()
                .and_then(|out| graph.value(*out).tensor())
            else {
                continue;
            };
            let out_domain = &output.domain;
            for input in &expr.inputs {
                let Some(in_domain) = graph.no_reduction_domain(*input) else {
                    continue;
                };
                match &expr.op {
                    ExprOp::Set | ExprOp::Pointwise | ExprOp::Reduction { .. } => {
                        for (a, b) in in_domain.iter().zip(out_domain.iter()) {
                            map(&mut sets, *a, *b);
                        }
                    }
                    ExprOp::Transpose { perm } => {
                        for (out_axis, in_axis) in perm.iter().enumerate() {
                            if let (Some(a), Some(b)) =
                                (in_domain.get(*in_axis), out_domain.get(out_axis))
                            {
                                map(&mut sets, *a, *b);
                            }
                        }
                    }
                    ExprOp::Broadcast { is_new } => {
                        let kept = out_domain
                            .iter()
                            .zip(is_new.iter())
                            .filter(|(_, new)| !**new)
                            .map(|(id, _)| *id);
                        for (a, b) in in_domain.iter().copied().zip(kept) {
                            map(&mut sets, a, b);
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<IterDomainId>> = BTreeMap::new();
        for id in graph.iter_domain_ids() {
            let root = sets.find(id.0 as usize);
            groups.entry(root).or_default().push(id);
        }
        let mut set_of = vec![0; graph.num_iter_domains()];
        let sets: Vec<Vec<IterDomainId>> = groups.into_values().collect();
        for (index, members) in sets.iter().enumerate() {
            for id in members {
                set_of[id.0 as usize] = index;
            }
        }
        Self { sets, set_of }
    }

    /// Disjoint sets in a deterministic order; every domain appears in exactly one.
    pub fn disjoint_sets(&self) -> impl Iterator<Item = &[IterDomainId]> + '_ {
        self.sets.iter().map(Vec::as_slice)
    }

    pub fn set_of(&self, id: IterDomainId) -> Option<&[IterDomainId]> {
        let index = *self.set_of.get(id.0 as usize)?;
        self.sets.get(index).map(Vec::as_slice)
    }

    pub fn are_mapped(&self, a: IterDomainId, b: IterDomainId) -> bool {
        match (self.set_of.get(a.0 as usize), self.set_of.get(b.0 as usize)) {
            (Some(lhs), Some(rhs)) => lhs == rhs,
            _ => false,
        }
    }
}
