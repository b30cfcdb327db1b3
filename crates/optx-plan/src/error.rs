//! # Optimizer Errors
//!
//! Every error raised by an optimizer pass is a programming-contract
//! violation: an invariant breach in the plan handed to the pass, not a
//! user-visible query error. Malformed SQL and unresolved references are
//! rejected by earlier planning phases and never reach the optimizers, so
//! errors here are fatal diagnostics and are never recovered from.

use thiserror::Error;

/// Contract violations detected while rewriting a plan.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// An expression's free variables exceed the declared scope at its
    /// position in the plan (e.g., an outer-side effective predicate that
    /// mentions inner-side variables, or a predicate over a generated
    /// unique-id column).
    #[error("expression out of scope: {0}")]
    ScopeViolation(String),
    /// An expression does not have the shape its position requires (e.g., a
    /// join clause that is not a binary equality, or a spatial join
    /// predicate that simplified to FALSE).
    #[error("malformed expression: {0}")]
    MalformedExpression(String),
}

pub type Result<T, E = OptimizerError> = std::result::Result<T, E>;
