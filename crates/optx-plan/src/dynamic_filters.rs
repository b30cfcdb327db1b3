//! # Dynamic Filter Placeholders
//!
//! A dynamic filter is a runtime-constructed predicate shipped from the
//! build side of a hash join to the probe side, pruning probe rows before
//! they are fetched. At planning time a dynamic filter is an opaque
//! placeholder: a call carrying a filter id, the probe-side variable, and
//! optionally the range comparison the executor may prune with. The join
//! that produces the values registers the same id against its build-side
//! variable.
//!
//! Placeholders are ordinary expressions so they travel through the plan
//! like any other conjunct, but several components must recognize them:
//! pushdown synthesizes and routes them, while summaries of what holds on a
//! subtree's output must ignore them (a dynamic filter only ever narrows a
//! probe side; it asserts nothing the planner may rely on).
//!
//! Ids are opaque strings; consumers must match them by role, not value.

use crate::expr::{extract_conjuncts, Expr};
use crate::types::{ScalarValue, Variable};

/// Name of the planning-time dynamic filter placeholder function.
pub const DYNAMIC_FILTER_FUNCTION_NAME: &str = "$internal$dynamic_filter";

/// Build the probe-side placeholder predicate for one dynamic filter.
pub fn dynamic_filter_expression(id: &str, probe: Variable, comparison: Option<Expr>) -> Expr {
    let mut args = vec![
        Expr::Literal(ScalarValue::Utf8(id.to_string())),
        Expr::Variable(probe),
    ];
    if let Some(comparison) = comparison {
        args.push(comparison);
    }
    Expr::call(DYNAMIC_FILTER_FUNCTION_NAME, args)
}

/// Whether a conjunct is a dynamic filter placeholder.
pub fn is_dynamic_filter(expr: &Expr) -> bool {
    matches!(expr, Expr::Function { name, .. } if name == DYNAMIC_FILTER_FUNCTION_NAME)
}

/// The id carried by a dynamic filter placeholder.
pub fn dynamic_filter_id(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Function { name, args } if name == DYNAMIC_FILTER_FUNCTION_NAME => match args.first()
        {
            Some(Expr::Literal(ScalarValue::Utf8(id))) => Some(id),
            _ => None,
        },
        _ => None,
    }
}

/// The probe-side variable of a dynamic filter placeholder.
pub fn dynamic_filter_probe(expr: &Expr) -> Option<&Variable> {
    match expr {
        Expr::Function { name, args } if name == DYNAMIC_FILTER_FUNCTION_NAME => {
            match args.get(1) {
                Some(Expr::Variable(v)) => Some(v),
                _ => None,
            }
        }
        _ => None,
    }
}

/// The optional range comparison carried by a dynamic filter placeholder.
pub fn dynamic_filter_comparison(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::Function { name, args } if name == DYNAMIC_FILTER_FUNCTION_NAME => args.get(2),
        _ => None,
    }
}

/// A predicate's conjuncts split into dynamic filter placeholders and
/// everything else.
#[derive(Debug, Clone, Default)]
pub struct DynamicFilters {
    pub dynamic_conjuncts: Vec<Expr>,
    pub static_conjuncts: Vec<Expr>,
}

/// Partition the conjuncts of a predicate by dynamic-filter-ness. TRUE (the
/// empty conjunction) yields a single static TRUE conjunct.
pub fn extract_dynamic_filters(expr: &Expr) -> DynamicFilters {
    let mut result = DynamicFilters::default();
    for conjunct in extract_conjuncts(expr) {
        if is_dynamic_filter(&conjunct) {
            result.dynamic_conjuncts.push(conjunct);
        } else {
            result.static_conjuncts.push(conjunct);
        }
    }
    result
}
