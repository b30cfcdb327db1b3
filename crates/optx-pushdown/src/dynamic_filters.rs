//! # Dynamic Filter Synthesis
//!
//! Synthesizes the dynamic filters of one join from its equi-clauses and
//! residual filter (the placeholder vocabulary itself lives in
//! `optx_plan::dynamic_filters` and is re-exported here). Synthesis applies
//! to inner and right joins only, the types whose right side becomes a
//! hash-join build side:
//!
//! - one filter per equi-clause, keyed by a fresh id from the
//!   plan-node-id allocator, and
//! - one filter per residual range comparison between a probe-side and a
//!   build-side BIGINT variable, carrying the comparison so the executor can
//!   prune by min/max. The comparison is flipped when the probe variable
//!   sits on its right-hand side, and a probe or build variable already
//!   claimed by an earlier range filter of the same join is skipped.

pub use optx_plan::dynamic_filters::{
    dynamic_filter_comparison, dynamic_filter_expression, dynamic_filter_id,
    dynamic_filter_probe, extract_dynamic_filters, is_dynamic_filter, DynamicFilters,
    DYNAMIC_FILTER_FUNCTION_NAME,
};

use optx_plan::allocator::PlanNodeIdAllocator;
use optx_plan::expr::{extract_conjuncts, flip_comparison, BinaryOp, Expr};
use optx_plan::plan::{EquiJoinClause, JoinNode, JoinType};
use optx_plan::types::{DataType, Variable};
use std::collections::{BTreeMap, BTreeSet};

/// Dynamic filters synthesized for one join: the join-side registration map
/// and the probe-side predicates to push into the probe input.
#[derive(Debug, Default)]
pub(crate) struct DynamicFiltersResult {
    pub(crate) dynamic_filters: BTreeMap<String, Variable>,
    pub(crate) predicates: Vec<Expr>,
}

/// Synthesize dynamic filters for a join. `enabled` is the conjunction of
/// the session flag and the pass flag; ids come from the plan-node-id
/// allocator so they are unique per plan.
pub(crate) fn create_dynamic_filters(
    node: &JoinNode,
    equi_clauses: &[EquiJoinClause],
    join_filter: Option<&Expr>,
    enabled: bool,
    ids: &mut PlanNodeIdAllocator,
) -> DynamicFiltersResult {
    let mut result = DynamicFiltersResult::default();
    if !enabled || !matches!(node.join_type, JoinType::Inner | JoinType::Right) {
        return result;
    }

    for clause in equi_clauses {
        let id = ids.next_id().to_string();
        result
            .predicates
            .push(dynamic_filter_expression(&id, clause.left.clone(), None));
        result.dynamic_filters.insert(id, clause.right.clone());
    }

    let Some(join_filter) = join_filter else {
        return result;
    };

    let left_outputs: BTreeSet<Variable> = node.left.output_variables().into_iter().collect();
    let right_outputs: BTreeSet<Variable> = node.right.output_variables().into_iter().collect();
    let mut claimed: BTreeSet<Variable> = BTreeSet::new();

    for conjunct in extract_conjuncts(join_filter) {
        let Expr::BinaryOp { op, left, right } = &conjunct else {
            continue;
        };
        if !matches!(op, BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq) {
            continue;
        }
        let (Expr::Variable(left_var), Expr::Variable(right_var)) =
            (left.as_ref(), right.as_ref())
        else {
            continue;
        };
        // Range pruning is only wired up for BIGINT in the executor.
        if left_var.data_type != DataType::Bigint || right_var.data_type != DataType::Bigint {
            continue;
        }

        let (probe, build, comparison) =
            if left_outputs.contains(left_var) && right_outputs.contains(right_var) {
                (left_var.clone(), right_var.clone(), conjunct.clone())
            } else if right_outputs.contains(left_var) && left_outputs.contains(right_var) {
                let Some(flipped) = flip_comparison(*op) else {
                    continue;
                };
                (
                    right_var.clone(),
                    left_var.clone(),
                    Expr::binary(
                        flipped,
                        Expr::Variable(right_var.clone()),
                        Expr::Variable(left_var.clone()),
                    ),
                )
            } else {
                continue;
            };

        if claimed.contains(&probe) || claimed.contains(&build) {
            continue;
        }
        claimed.insert(probe.clone());
        claimed.insert(build.clone());

        let id = ids.next_id().to_string();
        result
            .predicates
            .push(dynamic_filter_expression(&id, probe, Some(comparison)));
        result.dynamic_filters.insert(id, build);
    }
    result
}
