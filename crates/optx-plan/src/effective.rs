//! # Effective Predicate Extraction
//!
//! Conservatively summarizes, for an arbitrary subtree, a predicate that is
//! guaranteed to hold on every row the subtree produces. The summary is a
//! logical consequence of the subtree (never an over-approximation), so a
//! caller may assume it, and TRUE is always a sound answer.
//!
//! The join pushdown kernel feeds these summaries into equality inference to
//! migrate constraints from one join input to the other (e.g., a filter on
//! the build side implies, through the join equality, a filter on the probe
//! side).

use crate::catalog::Metadata;
use crate::determinism::DeterminismEvaluator;
use crate::dynamic_filters::extract_dynamic_filters;
use crate::equality::EqualityInference;
use crate::expr::{combine_conjuncts, extract_conjuncts, extract_unique, rename_variables, Expr};
use crate::plan::{JoinType, PlanNode};
use crate::types::Variable;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Extracts the predicate guaranteed on a subtree's output.
pub struct EffectivePredicateExtractor<'a> {
    metadata: &'a dyn Metadata,
    use_table_properties: bool,
}

impl<'a> EffectivePredicateExtractor<'a> {
    pub fn new(metadata: &'a dyn Metadata, use_table_properties: bool) -> Self {
        Self {
            metadata,
            use_table_properties,
        }
    }

    pub fn extract(&self, node: &PlanNode) -> Expr {
        let determinism = DeterminismEvaluator::new(self.metadata);
        match node {
            PlanNode::TableScan(n) => {
                let mut conjuncts = Vec::new();
                if self.use_table_properties {
                    if let Some(constraint) = self.metadata.table_constraint(&n.table) {
                        conjuncts.push(determinism.filter_deterministic_conjuncts(&constraint));
                    }
                }
                if let Some(predicate) = &n.predicate {
                    conjuncts.push(
                        determinism.filter_deterministic_conjuncts(&static_conjuncts(predicate)),
                    );
                }
                let outputs: BTreeSet<Variable> = n.outputs.iter().cloned().collect();
                restrict_to_scope(combine_conjuncts(conjuncts), &outputs)
            }
            PlanNode::Filter(n) => {
                let underlying = self.extract(&n.source);
                // Dynamic filter placeholders only narrow a probe side at
                // runtime; they assert nothing the planner may rely on.
                combine_conjuncts([
                    underlying,
                    determinism.filter_deterministic_conjuncts(&static_conjuncts(&n.predicate)),
                ])
            }
            PlanNode::Project(n) => {
                let underlying = self.extract(&n.source);
                // Equalities between the outputs and their deterministic
                // defining expressions let child facts be re-expressed over
                // the projected columns.
                let mut equalities = Vec::new();
                for (output, expr) in n.assignments.iter() {
                    let is_identity = matches!(expr, Expr::Variable(v) if v == output);
                    if !is_identity && determinism.is_deterministic(expr) {
                        equalities.push(Expr::equals(Expr::Variable(output.clone()), expr.clone()));
                    }
                }
                let scope: BTreeSet<Variable> = n.assignments.outputs().into_iter().collect();
                equalities.push(underlying);
                self.pull_expression_through_variables(&combine_conjuncts(equalities), &scope)
            }
            PlanNode::Join(n) => {
                let outputs: BTreeSet<Variable> = n.outputs.iter().cloned().collect();
                match n.join_type {
                    JoinType::Inner => {
                        let mut conjuncts = vec![self.extract(&n.left), self.extract(&n.right)];
                        conjuncts.extend(n.criteria.iter().map(|clause| {
                            Expr::equals(
                                Expr::Variable(clause.left.clone()),
                                Expr::Variable(clause.right.clone()),
                            )
                        }));
                        if let Some(filter) = &n.filter {
                            conjuncts.push(determinism.filter_deterministic_conjuncts(filter));
                        }
                        self.pull_expression_through_variables(
                            &combine_conjuncts(conjuncts),
                            &outputs,
                        )
                    }
                    // Null padding invalidates facts about the padded side.
                    JoinType::Left => {
                        self.pull_expression_through_variables(&self.extract(&n.left), &outputs)
                    }
                    JoinType::Right => {
                        self.pull_expression_through_variables(&self.extract(&n.right), &outputs)
                    }
                    JoinType::Full => Expr::true_literal(),
                }
            }
            PlanNode::SemiJoin(n) => self.extract(&n.source),
            PlanNode::Aggregation(n) => {
                // A global grouping set emits a row whose grouping keys are
                // absent, so no child fact survives it.
                if n.grouping_sets.has_empty_grouping_set() {
                    return Expr::true_literal();
                }
                let scope: BTreeSet<Variable> =
                    n.grouping_sets.grouping_keys.iter().cloned().collect();
                self.pull_expression_through_variables(&self.extract(&n.source), &scope)
            }
            PlanNode::Union(n) => {
                let mappings: Vec<BTreeMap<Variable, Variable>> = (0..n.sources.len())
                    .map(|i| {
                        n.variable_mapping
                            .iter()
                            .map(|(output, inputs)| (inputs[i].clone(), output.clone()))
                            .collect()
                    })
                    .collect();
                self.intersect_source_predicates(&n.sources, &mappings)
            }
            PlanNode::Exchange(n) => {
                let mappings: Vec<BTreeMap<Variable, Variable>> = (0..n.sources.len())
                    .map(|i| {
                        n.inputs[i]
                            .iter()
                            .cloned()
                            .zip(n.outputs.iter().cloned())
                            .collect()
                    })
                    .collect();
                self.intersect_source_predicates(&n.sources, &mappings)
            }
            PlanNode::Window(n) => self.extract(&n.source),
            PlanNode::MarkDistinct(n) => self.extract(&n.source),
            PlanNode::Unnest(n) => {
                let scope: BTreeSet<Variable> = n.replicate_variables.iter().cloned().collect();
                restrict_to_scope(self.extract(&n.source), &scope)
            }
            PlanNode::AssignUniqueId(n) => self.extract(&n.source),
            PlanNode::Sort(n) => self.extract(&n.source),
            PlanNode::Sample(n) => self.extract(&n.source),
            // Row expansion across grouping sets invalidates per-column facts
            // except over common columns; stay conservative.
            PlanNode::GroupId(_) => Expr::true_literal(),
            // No per-source fact survives a spatial join's partitioning; stay conservative.
            PlanNode::SpatialJoin(_) => Expr::true_literal(),
            PlanNode::CteScan(n) => {
                let outputs: BTreeSet<Variable> = n.outputs.iter().cloned().collect();
                restrict_to_scope(self.extract(&n.source), &outputs)
            }
        }
    }

    /// Re-express a predicate over a target variable scope: rewrite each
    /// non-equality conjunct through the equality inference and re-emit the
    /// scope-internal equalities.
    fn pull_expression_through_variables(
        &self,
        expr: &Expr,
        scope_variables: &BTreeSet<Variable>,
    ) -> Expr {
        let inference = EqualityInference::builder(self.metadata)
            .add_equality_inference(expr)
            .build();
        let scope = |v: &Variable| scope_variables.contains(v);

        let mut effective = Vec::new();
        for conjunct in EqualityInference::builder(self.metadata).non_inferrable_conjuncts(expr) {
            if let Some(rewritten) = inference.rewrite_expression(&conjunct, &scope) {
                effective.push(rewritten);
            }
        }
        effective.extend(
            inference
                .generate_equalities_partitioned_by(&scope)
                .scope_equalities,
        );
        combine_conjuncts(effective)
    }

    /// Conjuncts guaranteed by every source, expressed over the node's
    /// outputs via the per-source variable mappings.
    fn intersect_source_predicates(
        &self,
        sources: &[std::sync::Arc<PlanNode>],
        mappings: &[BTreeMap<Variable, Variable>],
    ) -> Expr {
        let mut common: Option<Vec<Expr>> = None;
        for (source, mapping) in sources.iter().zip(mappings) {
            let mapped = rename_variables(mapping, &self.extract(source));
            let conjuncts = extract_conjuncts(&mapped);
            common = Some(match common {
                None => conjuncts,
                Some(previous) => {
                    let retained: HashSet<Expr> = conjuncts.into_iter().collect();
                    previous
                        .into_iter()
                        .filter(|c| retained.contains(c))
                        .collect()
                }
            });
        }
        combine_conjuncts(common.unwrap_or_default())
    }
}

/// The predicate with its dynamic filter placeholders removed.
fn static_conjuncts(expr: &Expr) -> Expr {
    combine_conjuncts(extract_dynamic_filters(expr).static_conjuncts)
}

/// Keep only the conjuncts whose variables are contained in the scope.
fn restrict_to_scope(expr: Expr, scope: &BTreeSet<Variable>) -> Expr {
    combine_conjuncts(
        extract_conjuncts(&expr)
            .into_iter()
            .filter(|conjunct| extract_unique(conjunct).iter().all(|v| scope.contains(v))),
    )
}
