//! # Join Pushdown Kernel
//!
//! The join rules do the heaviest predicate surgery in the pass:
//!
//! 1. **Outer-to-inner normalization.** A deterministic inherited conjunct
//!    *null-rejects* a join side if binding that side's variables to NULL
//!    makes the conjunct NULL or FALSE. Such a conjunct discards every
//!    null-padded row the outer join would produce, so the join narrows to
//!    an equivalent inner (or one-sided outer) join before any pushdown.
//! 2. **Decomposition.** The inherited predicate, both sides' effective
//!    predicates, and the join predicate are split into per-side, join-level,
//!    and post-join fragments through equality inference.
//! 3. **Equi-clause extraction.** Deterministic equalities between the two
//!    sides of the rewritten join predicate become hashable equi-clauses,
//!    allocating fresh variables and identity-extending projections for
//!    compound sides; the remainder becomes the residual join filter.
//! 4. **Dynamic filters.** See the `dynamic_filters` module.
//!
//! The spatial join rule is a simplified parallel: only inner and left types
//! exist, the (mandatory) predicate never produces equi-clauses or dynamic
//! filters, and it must not collapse to FALSE.

use crate::dynamic_filters::create_dynamic_filters;
use crate::rewriter::Rewriter;
use optx_plan::equality::EqualityInference;
use optx_plan::error::{OptimizerError, Result};
use optx_plan::expr::{
    combine, combine_conjuncts, extract_conjuncts, extract_unique, BinaryOp, Expr,
};
use optx_plan::plan::{
    Assignments, DistributionType, EquiJoinClause, JoinNode, JoinType, PlanNode, ProjectNode,
    SpatialJoinNode, SpatialJoinType,
};
use optx_plan::types::{ScalarValue, Variable};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// The four predicate fragments of an inner-join decomposition.
struct InnerJoinPushDownResult {
    left_predicate: Expr,
    right_predicate: Expr,
    join_predicate: Expr,
    post_join_predicate: Expr,
}

/// The four predicate fragments of a one-sided outer-join decomposition.
/// The *outer* side is the null-padding survivor (left for LEFT joins).
struct OuterJoinPushDownResult {
    outer_join_predicate: Expr,
    inner_join_predicate: Expr,
    join_predicate: Expr,
    post_join_predicate: Expr,
}

impl Rewriter<'_> {
    pub(crate) fn visit_join(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &JoinNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let normalized = self.try_normalize_outer_to_inner(node, &inherited);
        let current: &JoinNode = normalized.as_ref().unwrap_or(node);

        let left_effective = self.effective_predicates.extract(&current.left);
        let right_effective = self.effective_predicates.extract(&current.right);
        let join_predicate = extract_join_predicate(current);

        let left_variables: BTreeSet<Variable> =
            current.left.output_variables().into_iter().collect();
        let right_variables: BTreeSet<Variable> =
            current.right.output_variables().into_iter().collect();

        let (left_predicate, right_predicate, mut post_join_predicate, new_join_predicate) =
            match current.join_type {
                JoinType::Inner => {
                    let result = self.process_inner_join(
                        &inherited,
                        &left_effective,
                        &right_effective,
                        &join_predicate,
                        &left_variables,
                    )?;
                    (
                        result.left_predicate,
                        result.right_predicate,
                        result.post_join_predicate,
                        result.join_predicate,
                    )
                }
                JoinType::Left => {
                    let result = self.process_limited_outer_join(
                        &inherited,
                        &left_effective,
                        &right_effective,
                        &join_predicate,
                        &left_variables,
                    )?;
                    (
                        result.outer_join_predicate,
                        result.inner_join_predicate,
                        result.post_join_predicate,
                        result.join_predicate,
                    )
                }
                JoinType::Right => {
                    let result = self.process_limited_outer_join(
                        &inherited,
                        &right_effective,
                        &left_effective,
                        &join_predicate,
                        &right_variables,
                    )?;
                    (
                        result.inner_join_predicate,
                        result.outer_join_predicate,
                        result.post_join_predicate,
                        result.join_predicate,
                    )
                }
                JoinType::Full => (
                    Expr::true_literal(),
                    Expr::true_literal(),
                    inherited.clone(),
                    join_predicate.clone(),
                ),
            };

        let mut new_join_predicate = self.optimizer.optimize(&new_join_predicate);
        if new_join_predicate.is_false() {
            // The executor cannot evaluate a bare FALSE join predicate;
            // substitute a provably false comparison it can.
            trace!("Join {} predicate reduced to FALSE", current.id);
            new_join_predicate = Expr::equals(
                Expr::Literal(ScalarValue::Int64(0)),
                Expr::Literal(ScalarValue::Int64(1)),
            );
        }

        // Identity projections for all existing variables, extended below
        // with assignments for synthesized equi-clause expressions.
        let mut left_projections = Assignments::identity(current.left.output_variables());
        let mut right_projections = Assignments::identity(current.right.output_variables());

        let mut equi_clauses = Vec::new();
        let mut join_filter_conjuncts = Vec::new();
        for conjunct in extract_conjuncts(&new_join_predicate) {
            if self.is_join_equality(&conjunct, &left_variables) {
                let Expr::BinaryOp { left, right, .. } = &conjunct else {
                    return Err(OptimizerError::MalformedExpression(format!(
                        "join equality is not a binary comparison: {conjunct}"
                    )));
                };
                let aligned = extract_unique(left)
                    .iter()
                    .all(|v| left_variables.contains(v));
                let (left_expression, right_expression) = if aligned {
                    (left.as_ref(), right.as_ref())
                } else {
                    (right.as_ref(), left.as_ref())
                };

                let left_variable = self.variable_for_expression(left_expression);
                if !left_variables.contains(&left_variable) {
                    left_projections.put(left_variable.clone(), left_expression.clone());
                }
                let right_variable = self.variable_for_expression(right_expression);
                if !right_variables.contains(&right_variable) {
                    right_projections.put(right_variable.clone(), right_expression.clone());
                }

                equi_clauses.push(EquiJoinClause::new(left_variable, right_variable));
            } else {
                join_filter_conjuncts.push(conjunct);
            }
        }

        let mut new_join_filter = Some(combine_conjuncts(join_filter_conjuncts))
            .filter(|filter| !filter.is_true());

        let dynamic_filters_enabled =
            self.dynamic_filtering && self.session.enable_dynamic_filtering;
        let dynamic_filters_result = create_dynamic_filters(
            current,
            &equi_clauses,
            new_join_filter.as_ref(),
            dynamic_filters_enabled,
            self.id_allocator,
        );
        let left_predicate = combine(
            left_predicate,
            combine_conjuncts(dynamic_filters_result.predicates.clone()),
        );
        let dynamic_filters = dynamic_filters_result.dynamic_filters;

        let equi_clauses_unmodified = {
            let new_set: BTreeSet<&EquiJoinClause> = equi_clauses.iter().collect();
            let old_set: BTreeSet<&EquiJoinClause> = current.criteria.iter().collect();
            new_set == old_set
        };

        // When the clause set changed, pushdown must run through the
        // extending projections so synthesized inputs exist below the join.
        let (left_source, right_source) = if equi_clauses_unmodified {
            (
                self.rewrite(&current.left, left_predicate)?,
                self.rewrite(&current.right, right_predicate)?,
            )
        } else {
            let left_project = Arc::new(PlanNode::Project(ProjectNode {
                id: self.id_allocator.next_id(),
                source: current.left.clone(),
                assignments: left_projections.clone(),
            }));
            let right_project = Arc::new(PlanNode::Project(ProjectNode {
                id: self.id_allocator.next_id(),
                source: current.right.clone(),
                assignments: right_projections.clone(),
            }));
            (
                self.rewrite(&left_project, left_predicate)?,
                self.rewrite(&right_project, right_predicate)?,
            )
        };

        // Without an equi-clause there is no hash join to evaluate the
        // filter in; plan a nested-loops join followed by a filter instead.
        if current.join_type == JoinType::Inner && equi_clauses.is_empty() {
            if let Some(filter) = new_join_filter.take() {
                post_join_predicate = combine(post_join_predicate, filter);
            }
        }

        let filters_equivalent = match (&new_join_filter, &current.filter) {
            (None, None) => true,
            (Some(new), Some(old)) => self.equivalence.are_equivalent(new, old),
            _ => false,
        };

        let unchanged = Arc::ptr_eq(&left_source, &current.left)
            && Arc::ptr_eq(&right_source, &current.right)
            && filters_equivalent
            && dynamic_filters == current.dynamic_filters
            && equi_clauses_unmodified;

        let mut output: Arc<PlanNode> = if unchanged {
            match normalized {
                None => node_arc.clone(),
                Some(converted) => Arc::new(PlanNode::Join(converted)),
            }
        } else {
            let left_source = Arc::new(PlanNode::Project(ProjectNode {
                id: self.id_allocator.next_id(),
                source: left_source,
                assignments: left_projections,
            }));
            let right_source = Arc::new(PlanNode::Project(ProjectNode {
                id: self.id_allocator.next_id(),
                source: right_source,
                assignments: right_projections,
            }));

            // An explicit distribution choice survives pushdown unless the
            // rewritten join's shape leaves only one legal option.
            let mut distribution = current.distribution;
            if distribution.is_some() {
                if current.join_type.must_partition() {
                    distribution = Some(DistributionType::Partitioned);
                }
                if current.join_type.must_replicate(&equi_clauses) {
                    distribution = Some(DistributionType::Replicated);
                }
            }

            let mut outputs = left_source.output_variables();
            outputs.extend(right_source.output_variables());

            Arc::new(PlanNode::Join(JoinNode {
                id: current.id,
                join_type: current.join_type,
                left: left_source,
                right: right_source,
                criteria: equi_clauses,
                outputs,
                filter: new_join_filter,
                distribution,
                spillable: current.spillable,
                dynamic_filters,
            }))
        };

        output = self.add_filter_above(output, post_join_predicate);

        if node.outputs != output.output_variables() {
            output = Arc::new(PlanNode::Project(ProjectNode {
                id: self.id_allocator.next_id(),
                source: output,
                assignments: Assignments::identity(node.outputs.clone()),
            }));
        }

        Ok(output)
    }

    pub(crate) fn visit_spatial_join(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &SpatialJoinNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let right_variables: BTreeSet<Variable> =
            node.right.output_variables().into_iter().collect();

        let mut current = node.clone();
        if node.join_type == SpatialJoinType::Left
            && self.can_convert_outer_to_inner(&right_variables, &inherited)
        {
            trace!("Converted left spatial join {} to inner", node.id);
            current.join_type = SpatialJoinType::Inner;
        }

        let left_effective = self.effective_predicates.extract(&current.left);
        let right_effective = self.effective_predicates.extract(&current.right);
        let join_predicate = current.filter.clone();

        let left_variables: BTreeSet<Variable> =
            current.left.output_variables().into_iter().collect();

        let (left_predicate, right_predicate, post_join_predicate, new_join_predicate) =
            match current.join_type {
                SpatialJoinType::Inner => {
                    let result = self.process_inner_join(
                        &inherited,
                        &left_effective,
                        &right_effective,
                        &join_predicate,
                        &left_variables,
                    )?;
                    (
                        result.left_predicate,
                        result.right_predicate,
                        result.post_join_predicate,
                        result.join_predicate,
                    )
                }
                SpatialJoinType::Left => {
                    let result = self.process_limited_outer_join(
                        &inherited,
                        &left_effective,
                        &right_effective,
                        &join_predicate,
                        &left_variables,
                    )?;
                    (
                        result.outer_join_predicate,
                        result.inner_join_predicate,
                        result.post_join_predicate,
                        result.join_predicate,
                    )
                }
            };

        let new_join_predicate = self.optimizer.optimize(&new_join_predicate);
        if new_join_predicate.is_false() {
            return Err(OptimizerError::MalformedExpression(format!(
                "spatial join {} predicate reduced to FALSE",
                current.id
            )));
        }

        let left_source = self.rewrite(&current.left, left_predicate)?;
        let right_source = self.rewrite(&current.right, right_predicate)?;

        let changed = !Arc::ptr_eq(&left_source, &current.left)
            || !Arc::ptr_eq(&right_source, &current.right)
            || !self.equivalence.are_equivalent(&new_join_predicate, &join_predicate);

        let output: Arc<PlanNode> = if changed {
            let left_source = Arc::new(PlanNode::Project(ProjectNode {
                id: self.id_allocator.next_id(),
                source: left_source,
                assignments: Assignments::identity(current.left.output_variables()),
            }));
            let right_source = Arc::new(PlanNode::Project(ProjectNode {
                id: self.id_allocator.next_id(),
                source: right_source,
                assignments: Assignments::identity(current.right.output_variables()),
            }));
            Arc::new(PlanNode::SpatialJoin(SpatialJoinNode {
                left: left_source,
                right: right_source,
                filter: new_join_predicate,
                ..current
            }))
        } else if current.join_type != node.join_type {
            Arc::new(PlanNode::SpatialJoin(current))
        } else {
            node_arc.clone()
        };

        Ok(self.add_filter_above(output, post_join_predicate))
    }

    /// Decompose predicates around an inner join.
    ///
    /// Non-deterministic conjuncts of the inherited and join predicates stay
    /// on the join itself. Everything else is tried against the left scope,
    /// the right scope, or kept on the join; effective predicates migrate to
    /// the opposite side where the equalities allow; consumed equalities are
    /// re-emitted on the side (or at the join) they belong to.
    fn process_inner_join(
        &self,
        inherited: &Expr,
        left_effective: &Expr,
        right_effective: &Expr,
        join_predicate: &Expr,
        left_variables: &BTreeSet<Variable>,
    ) -> Result<InnerJoinPushDownResult> {
        if !extract_unique(left_effective)
            .iter()
            .all(|v| left_variables.contains(v))
        {
            return Err(OptimizerError::ScopeViolation(format!(
                "left effective predicate references non-left variables: {left_effective}"
            )));
        }
        if extract_unique(right_effective)
            .iter()
            .any(|v| left_variables.contains(v))
        {
            return Err(OptimizerError::ScopeViolation(format!(
                "right effective predicate references left variables: {right_effective}"
            )));
        }

        let mut left_pushdown_conjuncts = Vec::new();
        let mut right_pushdown_conjuncts = Vec::new();
        let mut join_conjuncts = Vec::new();

        join_conjuncts.extend(
            extract_conjuncts(inherited)
                .into_iter()
                .filter(|c| !self.determinism.is_deterministic(c)),
        );
        let inherited = self.determinism.filter_deterministic_conjuncts(inherited);

        join_conjuncts.extend(
            extract_conjuncts(join_predicate)
                .into_iter()
                .filter(|c| !self.determinism.is_deterministic(c)),
        );
        let join_predicate = self.determinism.filter_deterministic_conjuncts(join_predicate);

        let left_effective = self.determinism.filter_deterministic_conjuncts(left_effective);
        let right_effective = self
            .determinism
            .filter_deterministic_conjuncts(right_effective);

        let all_inference = EqualityInference::builder(self.metadata)
            .add_all([&inherited, &left_effective, &right_effective, &join_predicate])
            .build();
        let all_inference_without_left = EqualityInference::builder(self.metadata)
            .add_all([&inherited, &right_effective, &join_predicate])
            .build();
        let all_inference_without_right = EqualityInference::builder(self.metadata)
            .add_all([&inherited, &left_effective, &join_predicate])
            .build();

        let in_left = |v: &Variable| left_variables.contains(v);
        let not_left = |v: &Variable| !left_variables.contains(v);

        for conjunct in self.non_inferrable_conjuncts(&inherited) {
            let left_rewritten = all_inference.rewrite_expression(&conjunct, &in_left);
            if let Some(rewritten) = &left_rewritten {
                left_pushdown_conjuncts.push(rewritten.clone());
            }
            let right_rewritten = all_inference.rewrite_expression(&conjunct, &not_left);
            if let Some(rewritten) = &right_rewritten {
                right_pushdown_conjuncts.push(rewritten.clone());
            }
            // Keep on the join only if neither side could absorb it.
            if left_rewritten.is_none() && right_rewritten.is_none() {
                join_conjuncts.push(conjunct);
            }
        }

        for conjunct in self.non_inferrable_conjuncts(&right_effective) {
            if let Some(rewritten) = all_inference.rewrite_expression(&conjunct, &in_left) {
                left_pushdown_conjuncts.push(rewritten);
            }
        }
        for conjunct in self.non_inferrable_conjuncts(&left_effective) {
            if let Some(rewritten) = all_inference.rewrite_expression(&conjunct, &not_left) {
                right_pushdown_conjuncts.push(rewritten);
            }
        }

        for conjunct in self.non_inferrable_conjuncts(&join_predicate) {
            let left_rewritten = all_inference.rewrite_expression(&conjunct, &in_left);
            if let Some(rewritten) = &left_rewritten {
                left_pushdown_conjuncts.push(rewritten.clone());
            }
            let right_rewritten = all_inference.rewrite_expression(&conjunct, &not_left);
            if let Some(rewritten) = &right_rewritten {
                right_pushdown_conjuncts.push(rewritten.clone());
            }
            if left_rewritten.is_none() && right_rewritten.is_none() {
                join_conjuncts.push(conjunct);
            }
        }

        left_pushdown_conjuncts.extend(
            all_inference_without_left
                .generate_equalities_partitioned_by(&in_left)
                .scope_equalities,
        );
        right_pushdown_conjuncts.extend(
            all_inference_without_right
                .generate_equalities_partitioned_by(&not_left)
                .scope_equalities,
        );
        join_conjuncts.extend(
            all_inference
                .generate_equalities_partitioned_by(&in_left)
                .scope_straddling_equalities,
        );

        Ok(InnerJoinPushDownResult {
            left_predicate: combine_conjuncts(left_pushdown_conjuncts),
            right_predicate: combine_conjuncts(right_pushdown_conjuncts),
            join_predicate: combine_conjuncts(join_conjuncts),
            post_join_predicate: Expr::true_literal(),
        })
    }

    /// Decompose predicates around a one-sided outer join. `outer_variables`
    /// is the output of the preserved side; the other side is null-padded.
    ///
    /// Inherited conjuncts may reach the inner side only through an outer
    /// rewrite (pushing a raw inner-side condition below the join would
    /// delete null-padded rows the join must keep); outer effective and join
    /// predicates may migrate into the inner side freely.
    fn process_limited_outer_join(
        &self,
        inherited: &Expr,
        outer_effective: &Expr,
        inner_effective: &Expr,
        join_predicate: &Expr,
        outer_variables: &BTreeSet<Variable>,
    ) -> Result<OuterJoinPushDownResult> {
        if !extract_unique(outer_effective)
            .iter()
            .all(|v| outer_variables.contains(v))
        {
            return Err(OptimizerError::ScopeViolation(format!(
                "outer effective predicate references non-outer variables: {outer_effective}"
            )));
        }
        if extract_unique(inner_effective)
            .iter()
            .any(|v| outer_variables.contains(v))
        {
            return Err(OptimizerError::ScopeViolation(format!(
                "inner effective predicate references outer variables: {inner_effective}"
            )));
        }

        let mut outer_pushdown_conjuncts = Vec::new();
        let mut inner_pushdown_conjuncts = Vec::new();
        let mut post_join_conjuncts = Vec::new();
        let mut join_conjuncts = Vec::new();

        post_join_conjuncts.extend(
            extract_conjuncts(inherited)
                .into_iter()
                .filter(|c| !self.determinism.is_deterministic(c)),
        );
        let inherited = self.determinism.filter_deterministic_conjuncts(inherited);

        let outer_effective = self.determinism.filter_deterministic_conjuncts(outer_effective);
        let inner_effective = self.determinism.filter_deterministic_conjuncts(inner_effective);

        join_conjuncts.extend(
            extract_conjuncts(join_predicate)
                .into_iter()
                .filter(|c| !self.determinism.is_deterministic(c)),
        );
        let join_predicate = self.determinism.filter_deterministic_conjuncts(join_predicate);

        let inherited_inference = EqualityInference::builder(self.metadata)
            .add_all([&inherited])
            .build();
        let outer_inference = EqualityInference::builder(self.metadata)
            .add_all([&inherited, &outer_effective])
            .build();

        let in_outer = |v: &Variable| outer_variables.contains(v);
        let not_outer = |v: &Variable| !outer_variables.contains(v);

        let equality_partition = inherited_inference.generate_equalities_partitioned_by(&in_outer);
        let outer_only_inherited_equalities =
            combine_conjuncts(equality_partition.scope_equalities.clone());
        let potential_null_variable_inference =
            EqualityInference::builder(self.metadata)
                .add_all([
                    &outer_only_inherited_equalities,
                    &outer_effective,
                    &inner_effective,
                    &join_predicate,
                ])
                .build();

        for conjunct in self.non_inferrable_conjuncts(&inherited) {
            if let Some(outer_rewritten) = outer_inference.rewrite_expression(&conjunct, &in_outer)
            {
                outer_pushdown_conjuncts.push(outer_rewritten.clone());

                // A conjunct reaches the inner side only via its outer form.
                if let Some(inner_rewritten) = potential_null_variable_inference
                    .rewrite_expression(&outer_rewritten, &not_outer)
                {
                    inner_pushdown_conjuncts.push(inner_rewritten);
                }
            } else {
                post_join_conjuncts.push(conjunct);
            }
        }

        outer_pushdown_conjuncts.extend(equality_partition.scope_equalities);
        post_join_conjuncts.extend(equality_partition.scope_complement_equalities);
        post_join_conjuncts.extend(equality_partition.scope_straddling_equalities);

        for conjunct in self.non_inferrable_conjuncts(&outer_effective) {
            if let Some(rewritten) =
                potential_null_variable_inference.rewrite_expression(&conjunct, &not_outer)
            {
                inner_pushdown_conjuncts.push(rewritten);
            }
        }

        for conjunct in self.non_inferrable_conjuncts(&join_predicate) {
            if let Some(rewritten) =
                potential_null_variable_inference.rewrite_expression(&conjunct, &not_outer)
            {
                inner_pushdown_conjuncts.push(rewritten);
            } else {
                join_conjuncts.push(conjunct);
            }
        }

        let inference_without_inner_inferred =
            EqualityInference::builder(self.metadata)
                .add_all([
                    &outer_only_inherited_equalities,
                    &outer_effective,
                    &join_predicate,
                ])
                .build();
        inner_pushdown_conjuncts.extend(
            inference_without_inner_inferred
                .generate_equalities_partitioned_by(&not_outer)
                .scope_equalities,
        );

        let join_equality_partition = EqualityInference::builder(self.metadata)
            .add_all([&join_predicate])
            .build()
            .generate_equalities_partitioned_by(&not_outer);
        inner_pushdown_conjuncts.extend(join_equality_partition.scope_equalities);
        join_conjuncts.extend(join_equality_partition.scope_complement_equalities);
        join_conjuncts.extend(join_equality_partition.scope_straddling_equalities);

        Ok(OuterJoinPushDownResult {
            outer_join_predicate: combine_conjuncts(outer_pushdown_conjuncts),
            inner_join_predicate: combine_conjuncts(inner_pushdown_conjuncts),
            join_predicate: combine_conjuncts(join_conjuncts),
            post_join_predicate: combine_conjuncts(post_join_conjuncts),
        })
    }

    /// Narrow an outer join when the inherited predicate null-rejects the
    /// null-padded side(s). Returns `None` when the join keeps its type.
    fn try_normalize_outer_to_inner(
        &self,
        node: &JoinNode,
        inherited: &Expr,
    ) -> Option<JoinNode> {
        if node.join_type == JoinType::Inner {
            return None;
        }

        let left_variables: BTreeSet<Variable> = node.left.output_variables().into_iter().collect();
        let right_variables: BTreeSet<Variable> =
            node.right.output_variables().into_iter().collect();

        let new_type = match node.join_type {
            JoinType::Full => {
                let drops_left_padding = self.can_convert_outer_to_inner(&left_variables, inherited);
                let drops_right_padding =
                    self.can_convert_outer_to_inner(&right_variables, inherited);
                match (drops_left_padding, drops_right_padding) {
                    (true, true) => JoinType::Inner,
                    (true, false) => JoinType::Left,
                    (false, true) => JoinType::Right,
                    (false, false) => return None,
                }
            }
            JoinType::Left if self.can_convert_outer_to_inner(&right_variables, inherited) => {
                JoinType::Inner
            }
            JoinType::Right if self.can_convert_outer_to_inner(&left_variables, inherited) => {
                JoinType::Inner
            }
            _ => return None,
        };

        trace!(
            "Normalized {:?} join {} to {:?}",
            node.join_type,
            node.id,
            new_type
        );
        Some(JoinNode {
            join_type: new_type,
            ..node.clone()
        })
    }

    /// A single deterministic conjunct evaluating to NULL or FALSE under
    /// all-NULL bindings for the padded side removes every effect of the
    /// outer join.
    pub(crate) fn can_convert_outer_to_inner(
        &self,
        padded_side_variables: &BTreeSet<Variable>,
        inherited: &Expr,
    ) -> bool {
        extract_conjuncts(inherited).iter().any(|conjunct| {
            if !self.determinism.is_deterministic(conjunct) {
                return false;
            }
            let response = self
                .optimizer
                .null_input_response(padded_side_variables, conjunct);
            response.is_null_literal() || response.is_false()
        })
    }

    /// Whether a conjunct is a hashable equality: deterministic, comparing
    /// one non-trivial expression per side in either orientation.
    fn is_join_equality(&self, conjunct: &Expr, left_variables: &BTreeSet<Variable>) -> bool {
        if !self.determinism.is_deterministic(conjunct) {
            return false;
        }
        let Expr::BinaryOp {
            op: BinaryOp::Eq,
            left,
            right,
        } = conjunct
        else {
            return false;
        };
        let left_side = extract_unique(left);
        let right_side = extract_unique(right);
        if left_side.is_empty() || right_side.is_empty() {
            return false;
        }
        let all_in = |vars: &BTreeSet<Variable>| vars.iter().all(|v| left_variables.contains(v));
        let none_in = |vars: &BTreeSet<Variable>| vars.iter().all(|v| !left_variables.contains(v));
        (all_in(&left_side) && none_in(&right_side)) || (all_in(&right_side) && none_in(&left_side))
    }

    /// The variable carrying an equi-clause side: the expression itself when
    /// it is already a variable, otherwise a fresh one to be projected.
    fn variable_for_expression(&mut self, expr: &Expr) -> Variable {
        if let Expr::Variable(v) = expr {
            return v.clone();
        }
        self.variable_allocator.new_variable("expr", expr.data_type())
    }
}

/// The combined predicate a join enforces: its equi-clauses as equalities
/// plus its residual filter.
fn extract_join_predicate(node: &JoinNode) -> Expr {
    let mut conjuncts: Vec<Expr> = node
        .criteria
        .iter()
        .map(|clause| {
            Expr::equals(
                Expr::Variable(clause.left.clone()),
                Expr::Variable(clause.right.clone()),
            )
        })
        .collect();
    if let Some(filter) = &node.filter {
        conjuncts.push(filter.clone());
    }
    combine_conjuncts(conjuncts)
}
