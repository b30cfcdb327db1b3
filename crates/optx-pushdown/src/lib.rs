//! # optx-pushdown: Predicate Pushdown Pass
//!
//! Rewrites a logical plan so that each filter predicate is evaluated as
//! close as possible to the data source it constrains, subject to the
//! relational semantics of the operators it crosses. This reduces
//! intermediate cardinalities and enables index and partition pruning
//! downstream.
//!
//! ## How it works
//!
//! The pass is a single top-down rewrite driven by one inherited value, the
//! *pending predicate*, which starts as TRUE at the root. At each node it
//! decides which pending conjuncts may be delegated to each child (possibly
//! rewritten through the node's algebra), recurses, and reconstructs the
//! node, keeping what could not cross in a residual filter. The module
//! split mirrors the rule groups:
//!
//! - **`rewriter`**: the traversal and the per-operator rules for filters,
//!   projections, windows, aggregations, set operations, and the other
//!   unary operators.
//! - **`join`**: outer-to-inner normalization, the inner/outer join
//!   decomposition kernels, equi-clause extraction, and the spatial join
//!   rule.
//! - **`semi_join`**: the filtering and non-filtering semi join rules.
//! - **`dynamic_filters`**: planning-time dynamic filter placeholders and
//!   their synthesis at hash-join probe sites.
//!
//! ## What it does not do
//!
//! The pass runs once, bottoms out at table scans, and preserves the
//! cost-relevant decisions made elsewhere: it never reorders join inputs,
//! never changes aggregate functions, and adjusts a join's distribution
//! type only when the rewritten shape leaves a single legal option.

pub mod dynamic_filters;
mod join;
mod rewriter;
mod semi_join;

use optx_plan::allocator::{PlanNodeIdAllocator, VariableAllocator};
use optx_plan::catalog::Metadata;
use optx_plan::determinism::DeterminismEvaluator;
use optx_plan::effective::EffectivePredicateExtractor;
use optx_plan::error::Result;
use optx_plan::expr::Expr;
use optx_plan::optimizer::PlanOptimizer;
use optx_plan::plan::PlanNode;
use optx_plan::session::{Session, WarningCollector};
use optx_plan::simplify::{ExpressionEquivalence, ExpressionOptimizer};
use rewriter::Rewriter;
use std::sync::Arc;
use tracing::debug;

/// The predicate pushdown optimizer pass.
///
/// `use_table_properties` lets the effective-predicate extractor surface
/// connector-declared table constraints; `dynamic_filtering` enables dynamic
/// filter synthesis (further gated per query by the session flag).
pub struct PredicatePushDown {
    metadata: Arc<dyn Metadata>,
    use_table_properties: bool,
    dynamic_filtering: bool,
}

impl PredicatePushDown {
    pub fn new(
        metadata: Arc<dyn Metadata>,
        use_table_properties: bool,
        dynamic_filtering: bool,
    ) -> Self {
        Self {
            metadata,
            use_table_properties,
            dynamic_filtering,
        }
    }
}

impl PlanOptimizer for PredicatePushDown {
    fn optimize(
        &self,
        plan: Arc<PlanNode>,
        session: &Session,
        variable_allocator: &mut VariableAllocator,
        id_allocator: &mut PlanNodeIdAllocator,
        _warnings: &mut WarningCollector,
    ) -> Result<Arc<PlanNode>> {
        debug!("Running predicate pushdown for query {}", session.query_id);
        let metadata = self.metadata.as_ref();
        let mut rewriter = Rewriter {
            metadata,
            session,
            variable_allocator,
            id_allocator,
            effective_predicates: EffectivePredicateExtractor::new(
                metadata,
                self.use_table_properties,
            ),
            determinism: DeterminismEvaluator::new(metadata),
            optimizer: ExpressionOptimizer::new(),
            equivalence: ExpressionEquivalence::new(),
            dynamic_filtering: self.dynamic_filtering,
        };
        rewriter.rewrite(&plan, Expr::true_literal())
    }
}
