//! # Equality Inference
//!
//! A closure over a set of predicates that derives implied equalities and
//! rewrites conjuncts into a target variable scope.
//!
//! Deterministic equality conjuncts (`a = b`) are folded into equivalence
//! classes with a union-find pass. The classes then answer two questions for
//! the pushdown machinery:
//!
//! - **Rewriting**: can this conjunct be expressed using only variables that
//!   satisfy a scope predicate? Sub-expressions are replaced by in-scope
//!   members of their equivalence class, outside-in, so `r_v > 5` rewrites to
//!   `l_v > 5` when `l_v = r_v` is known.
//! - **Partitioned re-emission**: the equalities a scope boundary consumes
//!   must be re-emitted on the correct side of that boundary. For a scope S,
//!   each class yields *scope* equalities (both sides inside S), *scope
//!   complement* equalities (both sides outside S), and *scope straddling*
//!   equalities connecting the two canonical representatives.
//!
//! The canonical representative of a class is its simplest member (fewest
//! expression nodes, ties broken structurally), so constants win over
//! variables and variables win over compound expressions.

use crate::catalog::Metadata;
use crate::determinism::DeterminismEvaluator;
use crate::expr::{extract_conjuncts, extract_unique, BinaryOp, Expr};
use crate::types::Variable;
use std::collections::HashMap;

/// Predicate over variables defining a rewrite target scope.
pub type VariableScope<'s> = &'s dyn Fn(&Variable) -> bool;

/// Equalities of one inference, split relative to a variable scope.
#[derive(Debug, Clone, Default)]
pub struct EqualityPartition {
    /// Equalities between expressions entirely inside the scope.
    pub scope_equalities: Vec<Expr>,
    /// Equalities between expressions entirely outside the scope.
    pub scope_complement_equalities: Vec<Expr>,
    /// Equalities connecting the scope to its complement.
    pub scope_straddling_equalities: Vec<Expr>,
}

/// Builder collecting inference candidates from predicates.
pub struct EqualityInferenceBuilder<'a> {
    metadata: &'a dyn Metadata,
    equalities: Vec<(Expr, Expr)>,
}

impl<'a> EqualityInferenceBuilder<'a> {
    pub fn new(metadata: &'a dyn Metadata) -> Self {
        Self {
            metadata,
            equalities: Vec::new(),
        }
    }

    /// Whether a conjunct contributes to the equivalence classes: a
    /// deterministic equality between two distinct expressions.
    pub fn is_inference_candidate(&self, expr: &Expr) -> bool {
        let Expr::BinaryOp {
            op: BinaryOp::Eq,
            left,
            right,
        } = expr
        else {
            return false;
        };
        if left == right {
            return false;
        }
        DeterminismEvaluator::new(self.metadata).is_deterministic(expr)
    }

    /// The conjuncts of a predicate that do not feed the inference and must
    /// be handled individually by the caller.
    pub fn non_inferrable_conjuncts(&self, expr: &Expr) -> Vec<Expr> {
        extract_conjuncts(expr)
            .into_iter()
            .filter(|c| !self.is_inference_candidate(c))
            .collect()
    }

    /// Absorb the inference candidates of a predicate.
    pub fn add_equality_inference(mut self, expr: &Expr) -> Self {
        for conjunct in extract_conjuncts(expr) {
            if self.is_inference_candidate(&conjunct) {
                if let Expr::BinaryOp { left, right, .. } = conjunct {
                    self.equalities.push((*left, *right));
                }
            }
        }
        self
    }

    /// Absorb several predicates at once.
    pub fn add_all<'e, I>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = &'e Expr>,
    {
        for expr in exprs {
            self = self.add_equality_inference(expr);
        }
        self
    }

    pub fn build(self) -> EqualityInference<'a> {
        // Union-find over the collected equality endpoints.
        let mut index_of: HashMap<Expr, usize> = HashMap::new();
        let mut parent: Vec<usize> = Vec::new();

        fn find(parent: &mut Vec<usize>, mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let id_for = |expr: &Expr, parent: &mut Vec<usize>, index_of: &mut HashMap<Expr, usize>| {
            if let Some(&i) = index_of.get(expr) {
                return i;
            }
            let i = parent.len();
            parent.push(i);
            index_of.insert(expr.clone(), i);
            i
        };

        for (left, right) in &self.equalities {
            let l = id_for(left, &mut parent, &mut index_of);
            let r = id_for(right, &mut parent, &mut index_of);
            let (lr, rr) = (find(&mut parent, l), find(&mut parent, r));
            if lr != rr {
                parent[rr] = lr;
            }
        }

        // Materialize classes sorted canonical-first.
        let mut members_by_root: HashMap<usize, Vec<Expr>> = HashMap::new();
        let mut ordered: Vec<(Expr, usize)> = index_of.into_iter().collect();
        ordered.sort_by(|a, b| canonical_ordering(&a.0, &b.0));
        for (expr, i) in ordered {
            let root = find(&mut parent, i);
            members_by_root.entry(root).or_default().push(expr);
        }

        let mut equality_sets: Vec<Vec<Expr>> = members_by_root.into_values().collect();
        equality_sets.sort_by(|a, b| canonical_ordering(&a[0], &b[0]));

        let mut class_by_expr = HashMap::new();
        for (class, members) in equality_sets.iter().enumerate() {
            for member in members {
                class_by_expr.insert(member.clone(), class);
            }
        }
        tracing::trace!(
            "Built equality inference with {} equivalence classes",
            equality_sets.len()
        );

        EqualityInference {
            metadata: self.metadata,
            equality_sets,
            class_by_expr,
        }
    }
}

/// Canonical ordering of class members: fewest nodes first, then structural.
fn canonical_ordering(a: &Expr, b: &Expr) -> std::cmp::Ordering {
    a.node_count()
        .cmp(&b.node_count())
        .then_with(|| format!("{a:?}").cmp(&format!("{b:?}")))
}

/// Derived equivalence classes over expressions.
pub struct EqualityInference<'a> {
    metadata: &'a dyn Metadata,
    equality_sets: Vec<Vec<Expr>>,
    class_by_expr: HashMap<Expr, usize>,
}

impl<'a> EqualityInference<'a> {
    pub fn builder(metadata: &'a dyn Metadata) -> EqualityInferenceBuilder<'a> {
        EqualityInferenceBuilder::new(metadata)
    }

    /// Rewrite a deterministic conjunct so that all of its variables satisfy
    /// the scope, or `None` if the equalities do not permit it.
    pub fn rewrite_expression(&self, expr: &Expr, scope: VariableScope<'_>) -> Option<Expr> {
        if !DeterminismEvaluator::new(self.metadata).is_deterministic(expr) {
            return None;
        }
        self.rewrite_internal(expr, scope)
    }

    /// Rewrite without the determinism gate. Callers use this where the
    /// target position evaluates each source row exactly once.
    pub fn rewrite_expression_allow_nondeterministic(
        &self,
        expr: &Expr,
        scope: VariableScope<'_>,
    ) -> Option<Expr> {
        self.rewrite_internal(expr, scope)
    }

    fn rewrite_internal(&self, expr: &Expr, scope: VariableScope<'_>) -> Option<Expr> {
        if in_scope(expr, scope) {
            return Some(expr.clone());
        }
        // Replace the whole expression by an in-scope member of its class.
        if let Some(&class) = self.class_by_expr.get(expr) {
            if let Some(replacement) = self.equality_sets[class]
                .iter()
                .find(|member| in_scope(member, scope))
            {
                return Some(replacement.clone());
            }
        }
        // Otherwise rewrite every sub-expression.
        match expr {
            Expr::Variable(_) | Expr::Literal(_) => None,
            Expr::BinaryOp { op, left, right } => Some(Expr::binary(
                *op,
                self.rewrite_internal(left, scope)?,
                self.rewrite_internal(right, scope)?,
            )),
            Expr::UnaryOp { op, operand } => {
                Some(Expr::unary(*op, self.rewrite_internal(operand, scope)?))
            }
            Expr::Function { name, args } => {
                let rewritten: Option<Vec<Expr>> = args
                    .iter()
                    .map(|a| self.rewrite_internal(a, scope))
                    .collect();
                Some(Expr::Function {
                    name: name.clone(),
                    args: rewritten?,
                })
            }
            Expr::And(exprs) => {
                let rewritten: Option<Vec<Expr>> = exprs
                    .iter()
                    .map(|e| self.rewrite_internal(e, scope))
                    .collect();
                Some(Expr::And(rewritten?))
            }
            Expr::Or(exprs) => {
                let rewritten: Option<Vec<Expr>> = exprs
                    .iter()
                    .map(|e| self.rewrite_internal(e, scope))
                    .collect();
                Some(Expr::Or(rewritten?))
            }
        }
    }

    /// Re-emit the equalities of every class, split relative to the scope.
    ///
    /// Expressions without variables belong to both the scope and its
    /// complement, which lets a constant binding (`x = 3`) surface on both
    /// sides of a boundary that separates `x` from its equals.
    pub fn generate_equalities_partitioned_by(&self, scope: VariableScope<'_>) -> EqualityPartition {
        let mut partition = EqualityPartition::default();
        for class in &self.equality_sets {
            let mut scope_members: Vec<&Expr> = Vec::new();
            let mut complement_members: Vec<&Expr> = Vec::new();
            let mut straddling_members: Vec<&Expr> = Vec::new();
            for member in class {
                let variables = extract_unique(member);
                let all_in = variables.iter().all(|v| scope(v));
                let all_out = variables.iter().all(|v| !scope(v));
                if all_in {
                    scope_members.push(member);
                }
                if all_out {
                    complement_members.push(member);
                }
                if !all_in && !all_out {
                    straddling_members.push(member);
                }
            }

            let scope_canonical = scope_members.first().copied();
            let complement_canonical = complement_members.first().copied();

            if let Some(canonical) = scope_canonical {
                for member in scope_members.iter().skip(1) {
                    partition
                        .scope_equalities
                        .push(Expr::equals(canonical.clone(), (*member).clone()));
                }
            }
            if let Some(canonical) = complement_canonical {
                for member in complement_members.iter().skip(1) {
                    partition
                        .scope_complement_equalities
                        .push(Expr::equals(canonical.clone(), (*member).clone()));
                }
            }

            let connecting = scope_canonical.or(complement_canonical);
            if let Some(connecting) = connecting {
                for member in &straddling_members {
                    partition
                        .scope_straddling_equalities
                        .push(Expr::equals(connecting.clone(), (*member).clone()));
                }
                if let (Some(in_scope), Some(out_of_scope)) =
                    (scope_canonical, complement_canonical)
                {
                    if in_scope != out_of_scope {
                        partition
                            .scope_straddling_equalities
                            .push(Expr::equals(in_scope.clone(), out_of_scope.clone()));
                    }
                }
            }
        }
        partition
    }
}

fn in_scope(expr: &Expr, scope: VariableScope<'_>) -> bool {
    extract_unique(expr).iter().all(|v| scope(v))
}
