//! # Semi Join Pushdown
//!
//! A semi join extends each source row with a boolean marker recording
//! whether its join variable appears in the filtering source. Two rules
//! apply, depending on whether the inherited predicate reads the marker:
//!
//! - **Non-filtering** (marker unused): conjuncts move to the source side
//!   when they can be expressed over it, including non-deterministic ones,
//!   because each source row is reflected exactly once in the output. The
//!   filtering source is left untouched.
//! - **Filtering** (marker read as a condition): effective predicates
//!   transfer between the two sides through the join equality, but
//!   non-deterministic conjuncts never reach the filtering side, whose rows
//!   are logically re-evaluated for every source row.
//!
//! The filtering rule also installs a source-side dynamic filter keyed on
//! the source join variable when dynamic filtering is on and the node does
//! not carry one yet.

use crate::dynamic_filters::dynamic_filter_expression;
use crate::rewriter::Rewriter;
use optx_plan::equality::EqualityInference;
use optx_plan::error::Result;
use optx_plan::expr::{combine_conjuncts, extract_conjuncts, Expr};
use optx_plan::plan::{PlanNode, SemiJoinNode};
use optx_plan::types::Variable;
use std::collections::BTreeSet;
use std::sync::Arc;

impl Rewriter<'_> {
    pub(crate) fn visit_semi_join(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &SemiJoinNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let marker = Expr::Variable(node.semi_join_output.clone());
        if extract_conjuncts(&inherited).contains(&marker) {
            self.visit_filtering_semi_join(node_arc, node, inherited)
        } else {
            self.visit_non_filtering_semi_join(node_arc, node, inherited)
        }
    }

    fn visit_non_filtering_semi_join(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &SemiJoinNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let rewritten_filtering_source =
            self.default_rewrite(&node.filtering_source, Expr::true_literal())?;

        let inference = EqualityInference::builder(self.metadata)
            .add_equality_inference(&inherited)
            .build();

        let source_variables: BTreeSet<Variable> =
            node.source.output_variables().into_iter().collect();
        let in_source_scope = |v: &Variable| source_variables.contains(v);

        let mut source_conjuncts = Vec::new();
        let mut post_join_conjuncts = Vec::new();

        for conjunct in self.non_inferrable_conjuncts(&inherited) {
            // Each source row appears exactly once in the output, so even
            // non-deterministic conjuncts may move to the source side.
            match inference.rewrite_expression_allow_nondeterministic(&conjunct, &in_source_scope) {
                Some(rewritten) => source_conjuncts.push(rewritten),
                None => post_join_conjuncts.push(conjunct),
            }
        }

        let partition = inference.generate_equalities_partitioned_by(&in_source_scope);
        source_conjuncts.extend(partition.scope_equalities);
        post_join_conjuncts.extend(partition.scope_complement_equalities);
        post_join_conjuncts.extend(partition.scope_straddling_equalities);

        let rewritten_source = self.rewrite(&node.source, combine_conjuncts(source_conjuncts))?;

        let output = if Arc::ptr_eq(&rewritten_source, &node.source)
            && Arc::ptr_eq(&rewritten_filtering_source, &node.filtering_source)
        {
            node_arc.clone()
        } else {
            Arc::new(PlanNode::SemiJoin(SemiJoinNode {
                source: rewritten_source,
                filtering_source: rewritten_filtering_source,
                dynamic_filter_id: None,
                ..node.clone()
            }))
        };
        Ok(self.add_filter_above(output, combine_conjuncts(post_join_conjuncts)))
    }

    fn visit_filtering_semi_join(
        &mut self,
        node_arc: &Arc<PlanNode>,
        node: &SemiJoinNode,
        inherited: Expr,
    ) -> Result<Arc<PlanNode>> {
        let deterministic_inherited = self.determinism.filter_deterministic_conjuncts(&inherited);
        let source_effective = self
            .determinism
            .filter_deterministic_conjuncts(&self.effective_predicates.extract(&node.source));
        let filtering_source_effective = self.determinism.filter_deterministic_conjuncts(
            &self.effective_predicates.extract(&node.filtering_source),
        );
        let join_expression = Expr::equals(
            Expr::Variable(node.source_join_variable.clone()),
            Expr::Variable(node.filtering_source_join_variable.clone()),
        );

        let source_variables: BTreeSet<Variable> =
            node.source.output_variables().into_iter().collect();
        let filtering_source_variables: BTreeSet<Variable> =
            node.filtering_source.output_variables().into_iter().collect();
        let in_source_scope = |v: &Variable| source_variables.contains(v);
        let in_filtering_scope = |v: &Variable| filtering_source_variables.contains(v);

        let all_inference = EqualityInference::builder(self.metadata)
            .add_all([
                &deterministic_inherited,
                &source_effective,
                &filtering_source_effective,
                &join_expression,
            ])
            .build();
        let all_inference_without_source = EqualityInference::builder(self.metadata)
            .add_all([
                &deterministic_inherited,
                &filtering_source_effective,
                &join_expression,
            ])
            .build();
        let all_inference_without_filtering_source = EqualityInference::builder(self.metadata)
            .add_all([&deterministic_inherited, &source_effective, &join_expression])
            .build();

        let mut source_conjuncts = Vec::new();
        let mut filtering_source_conjuncts = Vec::new();
        let mut post_join_conjuncts = Vec::new();

        for conjunct in self.non_inferrable_conjuncts(&inherited) {
            match all_inference.rewrite_expression_allow_nondeterministic(&conjunct, &in_source_scope)
            {
                Some(rewritten) => source_conjuncts.push(rewritten),
                None => post_join_conjuncts.push(conjunct),
            }
        }

        // The filtering side re-evaluates its rows per source row, so only
        // deterministic conjuncts may move there.
        for conjunct in self.non_inferrable_conjuncts(&deterministic_inherited) {
            if let Some(rewritten) =
                all_inference.rewrite_expression(&conjunct, &in_filtering_scope)
            {
                filtering_source_conjuncts.push(rewritten);
            }
        }

        // Transfer effective predicates across the join equality.
        for conjunct in self.non_inferrable_conjuncts(&filtering_source_effective) {
            if let Some(rewritten) = all_inference.rewrite_expression(&conjunct, &in_source_scope) {
                source_conjuncts.push(rewritten);
            }
        }
        for conjunct in self.non_inferrable_conjuncts(&source_effective) {
            if let Some(rewritten) =
                all_inference.rewrite_expression(&conjunct, &in_filtering_scope)
            {
                filtering_source_conjuncts.push(rewritten);
            }
        }

        source_conjuncts.extend(
            all_inference_without_source
                .generate_equalities_partitioned_by(&in_source_scope)
                .scope_equalities,
        );
        filtering_source_conjuncts.extend(
            all_inference_without_filtering_source
                .generate_equalities_partitioned_by(&in_filtering_scope)
                .scope_equalities,
        );

        let mut dynamic_filter_id = node.dynamic_filter_id.clone();
        if dynamic_filter_id.is_none()
            && self.session.enable_dynamic_filtering
            && self.dynamic_filtering
        {
            let id = self.id_allocator.next_id().to_string();
            source_conjuncts.push(dynamic_filter_expression(
                &id,
                node.source_join_variable.clone(),
                None,
            ));
            dynamic_filter_id = Some(id);
        }

        let rewritten_source = self.rewrite(&node.source, combine_conjuncts(source_conjuncts))?;
        let rewritten_filtering_source = self.rewrite(
            &node.filtering_source,
            combine_conjuncts(filtering_source_conjuncts),
        )?;

        let output = if Arc::ptr_eq(&rewritten_source, &node.source)
            && Arc::ptr_eq(&rewritten_filtering_source, &node.filtering_source)
            && dynamic_filter_id == node.dynamic_filter_id
        {
            node_arc.clone()
        } else {
            Arc::new(PlanNode::SemiJoin(SemiJoinNode {
                source: rewritten_source,
                filtering_source: rewritten_filtering_source,
                dynamic_filter_id,
                ..node.clone()
            }))
        };
        Ok(self.add_filter_above(output, combine_conjuncts(post_join_conjuncts)))
    }
}
