//! # Determinism Evaluation
//!
//! A deterministic expression depends only on its inputs: no randomness, no
//! clock, no session state. Determinism gates most predicate movement: a
//! non-deterministic conjunct may only cross an operator that reflects each
//! source row at most once in its output, because relocating it otherwise
//! changes how many times it is evaluated.

use crate::catalog::Metadata;
use crate::expr::{combine_conjuncts, extract_conjuncts, Expr};

/// Answers determinism questions by consulting function metadata.
pub struct DeterminismEvaluator<'a> {
    metadata: &'a dyn Metadata,
}

impl<'a> DeterminismEvaluator<'a> {
    pub fn new(metadata: &'a dyn Metadata) -> Self {
        Self { metadata }
    }

    /// Whether every call in the expression is a deterministic function.
    /// Operators, literals, and variable references are always deterministic.
    pub fn is_deterministic(&self, expr: &Expr) -> bool {
        if let Expr::Function { name, .. } = expr {
            if !self.metadata.is_function_deterministic(name) {
                return false;
            }
        }
        expr.children().iter().all(|c| self.is_deterministic(c))
    }

    /// Drop the non-deterministic conjuncts of a predicate.
    pub fn filter_deterministic_conjuncts(&self, expr: &Expr) -> Expr {
        combine_conjuncts(
            extract_conjuncts(expr)
                .into_iter()
                .filter(|c| self.is_deterministic(c)),
        )
    }
}
