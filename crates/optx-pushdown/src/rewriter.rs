//! # Predicate Pushdown Rewriter
//!
//! A top-down, context-propagating rewrite of the plan tree. The context is
//! the *inherited predicate*: the conjunction of every ancestor-level
//! conjunct not yet consumed, starting from TRUE at the root.
//!
//! At each node the rewriter decides which subset of the inherited predicate
//! can be delegated to each child (possibly rewriting it through the node's
//! algebra), recurses with the new pending predicates, and reconstructs the
//! node, wrapping it in a residual filter for conjuncts that could not cross.
//! A conjunct is never silently dropped: it is pushed into a descendant,
//! incorporated into a node-intrinsic predicate, or re-emitted above the
//! node.
//!
//! Nodes are immutable; rewritten children are compared by `Arc::ptr_eq` so
//! an untouched subtree keeps its identity and a no-op rewrite returns the
//! original node. This module holds the per-operator rules for every
//! operator except joins (see `join`) and semi joins (see `semi_join`).

use crate::dynamic_filters::extract_dynamic_filters;
use optx_plan::allocator::{PlanNodeIdAllocator, VariableAllocator};
use optx_plan::catalog::Metadata;
use optx_plan::determinism::DeterminismEvaluator;
use optx_plan::effective::EffectivePredicateExtractor;
use optx_plan::equality::EqualityInference;
use optx_plan::error::{OptimizerError, Result};
use optx_plan::expr::{
    combine_conjuncts, contains_call, extract_all, extract_conjuncts, extract_unique,
    inline_variables, rename_variables, Expr, TRY_FUNCTION_NAME,
};
use optx_plan::plan::{
    AggregationNode, ExchangeNode, FilterNode, GroupIdNode, MarkDistinctNode, PlanNode,
    ProjectNode, UnionNode, UnnestNode, WindowNode,
};
use optx_plan::session::Session;
use optx_plan::simplify::{ExpressionEquivalence, ExpressionOptimizer};
use optx_plan::types::Variable;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub(crate) struct Rewriter<'a> {
    pub(crate) metadata: &'a dyn Metadata,
    pub(crate) session: &'a Session,
    pub(crate) variable_allocator: &'a mut VariableAllocator,
    pub(crate) id_allocator: &'a mut PlanNodeIdAllocator,
    pub(crate) effective_predicates: EffectivePredicateExtractor<'a>,
    pub(crate) determinism: DeterminismEvaluator<'a>,
    pub(crate) optimizer: ExpressionOptimizer,
    pub(crate) equivalence: ExpressionEquivalence,
    pub(crate) dynamic_filtering: bool,
}

impl Rewriter<'_> {
    /// Rewrite a subtree under an inherited predicate.
    pub(crate) fn rewrite(&mut self, node: &Arc<PlanNode>, inherited: Expr) -> Result<Arc<PlanNode>> {
        match node.as_ref() {
            PlanNode::Filter(n) => self.visit_filter(node, n, inherited),
            PlanNode::Project(n) => self.visit_project(node, n, inherited),
            PlanNode::Window(n) => self.visit_window(node, n, inherited),
            PlanNode::MarkDistinct(n) => self.visit_mark_distinct(node, n, inherited),
            PlanNode::GroupId(n) => self.visit_group_id(node, n, inherited),
            PlanNode::Aggregation(n) => self.visit_aggregation(node, n, inherited),
            PlanNode::Unnest(n) => self.visit_unnest(node, n, inherited),
            PlanNode::Union(n) => self.visit_union(node, n, inherited),
            PlanNode::Exchange(n) => self.visit_exchange(node, n, inherited),
            PlanNode::Join(n) => self.visit_join(node, n, inherited),
            PlanNode::SpatialJoin(n) => self.visit_spatial_join(node, n, inherited),
            PlanNode::SemiJoin(n) => self.visit_semi_join(node, n, inherited),
            PlanNode::TableScan(_) => self.visit_table_scan(node, inherited),
            PlanNode::CteScan(_) => self.visit_cte_scan(node, inherited),
            PlanNode::AssignUniqueId(n) => {
                let id_variable = n.id_variable.clone();
                if extract_unique(&inherited).contains(&id_variable) {
                    return Err(OptimizerError::ScopeViolation(format!(
                        "inherited predicate references generated unique id column {id_variable}"
                    )));
                }
                self.default_rewrite(node, inherited)
            }
            // Order- and cardinality-preserving operators are transparent.
            PlanNode::Sort(_) | PlanNode::Sample(_) => self.default_rewrite(node, inherited),
        }
    }

    /// The rule applied when an operator fully blocks pushdown: recurse with
    /// TRUE and keep the whole inherited predicate in a filter above.
    pub(crate) fn visit_default(
        &mut self,
        node: &Arc<PlanNode>,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let rewritten = self.default_rewrite(node, Expr::true_literal())?;
        Ok(self.add_filter_above(rewritten, inherited))
    }

    /// Rewrite every child under the same pending predicate and replace the
    /// children, keeping the node's identity. Returns the original node when
    /// no child changed.
    pub(crate) fn default_rewrite(
        &mut self,
        node: &Arc<PlanNode>,
        pending: Expr,
    ) -> Result<Arc<PlanNode>> {
        let sources: Vec<Arc<PlanNode>> = node.sources().into_iter().cloned().collect();
        let mut new_sources = Vec::with_capacity(sources.len());
        let mut modified = false;
        for source in &sources {
            let rewritten = self.rewrite(source, pending.clone())?;
            if !Arc::ptr_eq(&rewritten, source) {
                modified = true;
            }
            new_sources.push(rewritten);
        }
        if modified {
            Ok(Arc::new(node.replace_sources(&new_sources)))
        } else {
            Ok(node.clone())
        }
    }

    /// Wrap in a new filter unless the residual predicate is TRUE.
    pub(crate) fn add_filter_above(&mut self, source: Arc<PlanNode>, predicate: Expr) -> Arc<PlanNode> {
        if predicate.is_true() {
            return source;
        }
        Arc::new(PlanNode::Filter(FilterNode {
            id: self.id_allocator.next_id(),
            source,
            predicate,
        }))
    }

    pub(crate) fn non_inferrable_conjuncts(&self, expr: &Expr) -> Vec<Expr> {
        EqualityInference::builder(self.metadata).non_inferrable_conjuncts(expr)
    }

    fn visit_filter(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &FilterNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let combined = combine_conjuncts([node.predicate.clone(), inherited]);
        let rewritten_plan = self.rewrite(&node.source, combined)?;

        // Preserve the original node when the rewrite reproduced it.
        if let PlanNode::Filter(rewritten) = rewritten_plan.as_ref() {
            if Arc::ptr_eq(&rewritten.source, &node.source)
                && self.equivalence.are_equivalent(&rewritten.predicate, &node.predicate)
            {
                return Ok(node_arc.clone());
            }
        }
        Ok(rewritten_plan)
    }

    fn visit_project(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &ProjectNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let deterministic_outputs: BTreeSet<Variable> = node
            .assignments
            .iter()
            .filter(|(_, expr)| self.determinism.is_deterministic(expr))
            .map(|(v, _)| v.clone())
            .collect();

        // Conjuncts may cross the projection only if every variable they
        // read is produced by a deterministic assignment.
        let (deterministic_conjuncts, residual_conjuncts): (Vec<Expr>, Vec<Expr>) =
            extract_conjuncts(&inherited).into_iter().partition(|c| {
                extract_unique(c)
                    .iter()
                    .all(|v| deterministic_outputs.contains(v))
            });

        let (inlining_targets, non_inlining): (Vec<Expr>, Vec<Expr>) = deterministic_conjuncts
            .into_iter()
            .partition(|c| self.is_inlining_candidate(c, node));

        let assignments = node.assignments.as_map();
        let inlined = inlining_targets
            .into_iter()
            .map(|c| inline_variables(&assignments, &c));

        let rewritten = self.default_rewrite(node_arc, combine_conjuncts(inlined))?;

        let mut above = non_inlining;
        above.extend(residual_conjuncts);
        Ok(self.add_filter_above(rewritten, combine_conjuncts(above)))
    }

    /// Inlining candidates are conjuncts whose projected variables each occur
    /// at most once, or are defined by constants, so that substitution cannot
    /// duplicate expensive or effectful expressions. TRY calls suppress
    /// evaluation errors and are never relocated.
    fn is_inlining_candidate(&self, expr: &Expr, node: &ProjectNode) -> bool {
        if contains_call(expr, TRY_FUNCTION_NAME) {
            return false;
        }
        let outputs: BTreeSet<Variable> = node.assignments.outputs().into_iter().collect();
        let mut dependencies: HashMap<Variable, usize> = HashMap::new();
        for variable in extract_all(expr) {
            if outputs.contains(&variable) {
                *dependencies.entry(variable).or_insert(0) += 1;
            }
        }
        dependencies.iter().all(|(variable, count)| {
            *count == 1 || matches!(node.assignments.get(variable), Some(Expr::Literal(_)))
        })
    }

    fn visit_window(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &WindowNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        // A conjunct that is a deterministic function of the partitioning
        // variables is constant within each window partition and cannot
        // change any frame it is evaluated in.
        let partition_variables: BTreeSet<Variable> = node.partition_by.iter().cloned().collect();
        let (pushable, residual): (Vec<Expr>, Vec<Expr>) =
            extract_conjuncts(&inherited).into_iter().partition(|c| {
                self.determinism.is_deterministic(c)
                    && extract_unique(c).iter().all(|v| partition_variables.contains(v))
            });

        let rewritten = self.default_rewrite(node_arc, combine_conjuncts(pushable))?;
        Ok(self.add_filter_above(rewritten, combine_conjuncts(residual)))
    }

    fn visit_mark_distinct(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &MarkDistinctNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let distinct_variables: BTreeSet<Variable> =
            node.distinct_variables.iter().cloned().collect();
        let (pushable, residual): (Vec<Expr>, Vec<Expr>) = extract_conjuncts(&inherited)
            .into_iter()
            .partition(|c| extract_unique(c).iter().all(|v| distinct_variables.contains(v)));

        let rewritten = self.default_rewrite(node_arc, combine_conjuncts(pushable))?;
        Ok(self.add_filter_above(rewritten, combine_conjuncts(residual)))
    }

    fn visit_group_id(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &GroupIdNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        // Only columns present in every grouping set keep their value on
        // every expanded row.
        let common: BTreeSet<Variable> = node.common_grouping_columns().into_iter().collect();
        let mapping: BTreeMap<Variable, Variable> = node
            .grouping_columns
            .iter()
            .filter(|(output, _)| common.contains(output))
            .map(|(output, input)| (output.clone(), input.clone()))
            .collect();

        let (pushable, residual): (Vec<Expr>, Vec<Expr>) = extract_conjuncts(&inherited)
            .into_iter()
            .partition(|c| extract_unique(c).iter().all(|v| mapping.contains_key(v)));

        let translated = rename_variables(&mapping, &combine_conjuncts(pushable));
        let rewritten = self.default_rewrite(node_arc, translated)?;
        Ok(self.add_filter_above(rewritten, combine_conjuncts(residual)))
    }

    fn visit_aggregation(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &AggregationNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        if node.grouping_sets.has_empty_grouping_set() {
            // A global grouping set produces a row with no grouping-key
            // values, so no inherited conjunct may run below the aggregation.
            return self.visit_default(node_arc, inherited);
        }

        let inference = EqualityInference::builder(self.metadata)
            .add_equality_inference(&inherited)
            .build();

        let mut pushdown_conjuncts = Vec::new();
        let mut post_aggregation_conjuncts = Vec::new();

        post_aggregation_conjuncts.extend(
            extract_conjuncts(&inherited)
                .into_iter()
                .filter(|c| !self.determinism.is_deterministic(c)),
        );
        let deterministic_inherited = self.determinism.filter_deterministic_conjuncts(&inherited);

        let grouping_keys: BTreeSet<Variable> =
            node.grouping_sets.grouping_keys.iter().cloned().collect();
        let in_grouping_scope = |v: &Variable| grouping_keys.contains(v);

        for conjunct in self.non_inferrable_conjuncts(&deterministic_inherited) {
            if let Some(group_id) = &node.group_id_variable {
                // The aggregation synthesizes group-id values for rows of the
                // global grouping set; conditions on it must run afterwards.
                if extract_unique(&conjunct).contains(group_id) {
                    post_aggregation_conjuncts.push(conjunct);
                    continue;
                }
            }
            match inference.rewrite_expression(&conjunct, &in_grouping_scope) {
                Some(rewritten) => pushdown_conjuncts.push(rewritten),
                None => post_aggregation_conjuncts.push(conjunct),
            }
        }

        let partition = inference.generate_equalities_partitioned_by(&in_grouping_scope);
        pushdown_conjuncts.extend(partition.scope_equalities);
        post_aggregation_conjuncts.extend(partition.scope_complement_equalities);
        post_aggregation_conjuncts.extend(partition.scope_straddling_equalities);

        let rewritten_source = self.rewrite(&node.source, combine_conjuncts(pushdown_conjuncts))?;
        let output = if Arc::ptr_eq(&rewritten_source, &node.source) {
            node_arc.clone()
        } else {
            Arc::new(PlanNode::Aggregation(AggregationNode {
                source: rewritten_source,
                ..node.clone()
            }))
        };
        Ok(self.add_filter_above(output, combine_conjuncts(post_aggregation_conjuncts)))
    }

    fn visit_unnest(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &UnnestNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let inference = EqualityInference::builder(self.metadata)
            .add_equality_inference(&inherited)
            .build();

        let mut pushdown_conjuncts = Vec::new();
        let mut post_unnest_conjuncts = Vec::new();

        post_unnest_conjuncts.extend(
            extract_conjuncts(&inherited)
                .into_iter()
                .filter(|c| !self.determinism.is_deterministic(c)),
        );
        let deterministic_inherited = self.determinism.filter_deterministic_conjuncts(&inherited);

        let replicated: BTreeSet<Variable> = node.replicate_variables.iter().cloned().collect();
        let in_replicated_scope = |v: &Variable| replicated.contains(v);

        for conjunct in self.non_inferrable_conjuncts(&deterministic_inherited) {
            match inference.rewrite_expression(&conjunct, &in_replicated_scope) {
                Some(rewritten) => pushdown_conjuncts.push(rewritten),
                None => post_unnest_conjuncts.push(conjunct),
            }
        }

        let partition = inference.generate_equalities_partitioned_by(&in_replicated_scope);
        pushdown_conjuncts.extend(partition.scope_equalities);
        post_unnest_conjuncts.extend(partition.scope_complement_equalities);
        post_unnest_conjuncts.extend(partition.scope_straddling_equalities);

        let rewritten_source = self.rewrite(&node.source, combine_conjuncts(pushdown_conjuncts))?;
        let output = if Arc::ptr_eq(&rewritten_source, &node.source) {
            node_arc.clone()
        } else {
            Arc::new(PlanNode::Unnest(UnnestNode {
                source: rewritten_source,
                ..node.clone()
            }))
        };
        Ok(self.add_filter_above(output, combine_conjuncts(post_unnest_conjuncts)))
    }

    fn visit_union(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &UnionNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let mut modified = false;
        let mut new_sources = Vec::with_capacity(node.sources.len());
        for (index, source) in node.sources.iter().enumerate() {
            let source_predicate =
                inline_variables(&node.source_variable_map(index), &inherited);
            let rewritten = self.rewrite(source, source_predicate)?;
            if !Arc::ptr_eq(&rewritten, source) {
                modified = true;
            }
            new_sources.push(rewritten);
        }

        if modified {
            Ok(Arc::new(PlanNode::Union(UnionNode {
                sources: new_sources,
                ..node.clone()
            })))
        } else {
            Ok(node_arc.clone())
        }
    }

    fn visit_exchange(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &ExchangeNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let mut modified = false;
        let mut new_sources = Vec::with_capacity(node.sources.len());
        for (index, source) in node.sources.iter().enumerate() {
            let source_predicate =
                inline_variables(&node.source_variable_map(index), &inherited);
            let rewritten = self.rewrite(source, source_predicate)?;
            if !Arc::ptr_eq(&rewritten, source) {
                modified = true;
            }
            new_sources.push(rewritten);
        }

        if modified {
            Ok(Arc::new(PlanNode::Exchange(ExchangeNode {
                sources: new_sources,
                ..node.clone()
            })))
        } else {
            Ok(node_arc.clone())
        }
    }

    fn visit_table_scan(
        &mut self,
        node_arc: &Arc<PlanNode>,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let predicate = self.optimizer.optimize(&inherited);
        if predicate.is_true() {
            return Ok(node_arc.clone());
        }
        // Downstream connector rules fold this filter into the scan.
        Ok(Arc::new(PlanNode::Filter(FilterNode {
            id: self.id_allocator.next_id(),
            source: node_arc.clone(),
            predicate,
        })))
    }

    fn visit_cte_scan(&mut self, node_arc: &Arc<PlanNode>, inherited: Expr) -> Result<Arc<PlanNode>> {
        // A pending predicate made up purely of dynamic filters follows the
        // data through the materialized CTE; anything else stays above.
        if self.dynamic_filtering && extract_dynamic_filters(&inherited).static_conjuncts.is_empty()
        {
            self.default_rewrite(node_arc, inherited)
        } else {
            self.visit_default(node_arc, inherited)
        }
    }
}
