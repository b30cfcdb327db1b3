//! # Expression Simplification and Equivalence
//!
//! Bottom-up constant folding over the scalar algebra with SQL three-valued
//! logic: comparisons and arithmetic over NULL produce NULL, a FALSE conjunct
//! collapses a conjunction even in the presence of NULL, and `IS [NOT] NULL`
//! folds on any literal operand.
//!
//! Folding has two consumers in the optimizer passes:
//! - simplifying predicates before they are attached to plan nodes, and
//! - evaluating an expression's response to binding a set of variables to
//!   NULL, which drives outer-join-to-inner-join normalization.
//!
//! Function calls are never evaluated here; their arguments are folded but
//! the call itself is preserved.
//!
//! [`ExpressionEquivalence`] layers a canonical form on top of folding so
//! that structurally different spellings of the same predicate (operand
//! order, conjunct order) compare equal.

use crate::expr::{flip_comparison, BinaryOp, Expr, UnaryOp};
use crate::types::ScalarValue;
use std::collections::BTreeMap;

/// Folds constant sub-expressions.
///
/// Folding is purely algebraic: no function catalog is consulted because
/// calls are never evaluated, only their arguments.
#[derive(Debug, Default)]
pub struct ExpressionOptimizer;

impl ExpressionOptimizer {
    pub fn new() -> Self {
        Self
    }

    /// Fold the expression as far as the algebra allows.
    pub fn optimize(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::Variable(_) | Expr::Literal(_) => expr.clone(),
            Expr::And(exprs) => self.fold_and(exprs),
            Expr::Or(exprs) => self.fold_or(exprs),
            Expr::BinaryOp { op, left, right } => {
                let left = self.optimize(left);
                let right = self.optimize(right);
                fold_binary(*op, left, right)
            }
            Expr::UnaryOp { op, operand } => {
                let operand = self.optimize(operand);
                fold_unary(*op, operand)
            }
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|a| self.optimize(a)).collect(),
            },
        }
    }

    /// Evaluate the expression's response to binding the given variables to
    /// NULL. The caller inspects the result for NULL or FALSE to decide
    /// null-rejection.
    pub fn null_input_response(
        &self,
        null_variables: &std::collections::BTreeSet<crate::types::Variable>,
        expr: &Expr,
    ) -> Expr {
        let mapping: BTreeMap<crate::types::Variable, Expr> = null_variables
            .iter()
            .map(|v| (v.clone(), Expr::null_literal()))
            .collect();
        self.optimize(&crate::expr::inline_variables(&mapping, expr))
    }

    fn fold_and(&self, exprs: &[Expr]) -> Expr {
        let mut residual: Vec<Expr> = Vec::new();
        let mut has_null = false;
        for e in exprs {
            let folded = self.optimize(e);
            let parts = match folded {
                Expr::And(inner) => inner,
                other => vec![other],
            };
            for part in parts {
                if part.is_false() {
                    return Expr::false_literal();
                }
                if part.is_true() {
                    continue;
                }
                if part.is_null_literal() {
                    has_null = true;
                    continue;
                }
                residual.push(part);
            }
        }
        if residual.is_empty() {
            return if has_null {
                Expr::null_literal()
            } else {
                Expr::true_literal()
            };
        }
        if has_null {
            residual.push(Expr::null_literal());
        }
        if residual.len() == 1 {
            residual.into_iter().next().unwrap()
        } else {
            Expr::And(residual)
        }
    }

    fn fold_or(&self, exprs: &[Expr]) -> Expr {
        let mut residual: Vec<Expr> = Vec::new();
        let mut has_null = false;
        for e in exprs {
            let folded = self.optimize(e);
            let parts = match folded {
                Expr::Or(inner) => inner,
                other => vec![other],
            };
            for part in parts {
                if part.is_true() {
                    return Expr::true_literal();
                }
                if part.is_false() {
                    continue;
                }
                if part.is_null_literal() {
                    has_null = true;
                    continue;
                }
                residual.push(part);
            }
        }
        if residual.is_empty() {
            return if has_null {
                Expr::null_literal()
            } else {
                Expr::false_literal()
            };
        }
        if has_null {
            residual.push(Expr::null_literal());
        }
        if residual.len() == 1 {
            residual.into_iter().next().unwrap()
        } else {
            Expr::Or(residual)
        }
    }
}

fn fold_binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let (lv, rv) = match (&left, &right) {
        (Expr::Literal(l), Expr::Literal(r)) => (l.clone(), r.clone()),
        _ => return Expr::binary(op, left, right),
    };

    // Comparisons and arithmetic over NULL are NULL.
    if lv.is_null() || rv.is_null() {
        return Expr::null_literal();
    }

    if op.is_comparison() {
        let ordering = match (&lv, &rv) {
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => Some(a.cmp(b)),
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => Some(a.cmp(b)),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => Some(a.cmp(b)),
            (ScalarValue::Date(a), ScalarValue::Date(b)) => Some(a.cmp(b)),
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        };
        let Some(ordering) = ordering else {
            return Expr::binary(op, left, right);
        };
        let result = match op {
            BinaryOp::Eq => ordering.is_eq(),
            BinaryOp::NotEq => !ordering.is_eq(),
            BinaryOp::Lt => ordering.is_lt(),
            BinaryOp::LtEq => ordering.is_le(),
            BinaryOp::Gt => ordering.is_gt(),
            BinaryOp::GtEq => ordering.is_ge(),
            _ => unreachable!(),
        };
        return Expr::Literal(ScalarValue::Bool(result));
    }

    match (&lv, &rv) {
        (ScalarValue::Int64(a), ScalarValue::Int64(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(*b),
                BinaryOp::Sub => a.checked_sub(*b),
                BinaryOp::Mul => a.checked_mul(*b),
                // Division by zero is a runtime error; leave it in place.
                BinaryOp::Div => a.checked_div(*b),
                _ => None,
            };
            match result {
                Some(v) => Expr::Literal(ScalarValue::Int64(v)),
                None => Expr::binary(op, left, right),
            }
        }
        (ScalarValue::Float64(a), ScalarValue::Float64(b)) => {
            let result = match op {
                BinaryOp::Add => a.0 + b.0,
                BinaryOp::Sub => a.0 - b.0,
                BinaryOp::Mul => a.0 * b.0,
                BinaryOp::Div => a.0 / b.0,
                _ => return Expr::binary(op, left, right),
            };
            Expr::Literal(ScalarValue::Float64(result.into()))
        }
        _ => Expr::binary(op, left, right),
    }
}

fn fold_unary(op: UnaryOp, operand: Expr) -> Expr {
    let value = match &operand {
        Expr::Literal(v) => v.clone(),
        _ => return Expr::unary(op, operand),
    };
    match op {
        UnaryOp::Not => match value {
            ScalarValue::Null => Expr::null_literal(),
            ScalarValue::Bool(b) => Expr::Literal(ScalarValue::Bool(!b)),
            _ => Expr::unary(op, operand),
        },
        UnaryOp::Neg => match value {
            ScalarValue::Null => Expr::null_literal(),
            ScalarValue::Int64(v) => match v.checked_neg() {
                Some(v) => Expr::Literal(ScalarValue::Int64(v)),
                None => Expr::unary(op, operand),
            },
            ScalarValue::Float64(v) => Expr::Literal(ScalarValue::Float64((-v.0).into())),
            _ => Expr::unary(op, operand),
        },
        UnaryOp::IsNull => Expr::Literal(ScalarValue::Bool(value.is_null())),
        UnaryOp::IsNotNull => Expr::Literal(ScalarValue::Bool(!value.is_null())),
    }
}

/// Structural equivalence after folding and canonical ordering.
#[derive(Debug, Default)]
pub struct ExpressionEquivalence {
    optimizer: ExpressionOptimizer,
}

impl ExpressionEquivalence {
    pub fn new() -> Self {
        Self {
            optimizer: ExpressionOptimizer::new(),
        }
    }

    pub fn are_equivalent(&self, left: &Expr, right: &Expr) -> bool {
        canonicalize(&self.optimizer.optimize(left)) == canonicalize(&self.optimizer.optimize(right))
    }
}

/// Order-insensitive canonical form: commutative operands and AND/OR operand
/// lists are sorted by a stable key, and inequalities are oriented by the
/// same key.
fn canonicalize(expr: &Expr) -> Expr {
    match expr {
        Expr::Variable(_) | Expr::Literal(_) => expr.clone(),
        Expr::BinaryOp { op, left, right } => {
            let left = canonicalize(left);
            let right = canonicalize(right);
            match op {
                BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Add | BinaryOp::Mul => {
                    if sort_key(&right) < sort_key(&left) {
                        Expr::binary(*op, right, left)
                    } else {
                        Expr::binary(*op, left, right)
                    }
                }
                BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                    if sort_key(&right) < sort_key(&left) {
                        let flipped = flip_comparison(*op).unwrap_or(*op);
                        Expr::binary(flipped, right, left)
                    } else {
                        Expr::binary(*op, left, right)
                    }
                }
                _ => Expr::binary(*op, left, right),
            }
        }
        Expr::UnaryOp { op, operand } => Expr::unary(*op, canonicalize(operand)),
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(canonicalize).collect(),
        },
        Expr::And(exprs) => {
            let mut parts: Vec<Expr> = exprs.iter().map(canonicalize).collect();
            parts.sort_by_key(sort_key);
            parts.dedup();
            if parts.len() == 1 {
                parts.remove(0)
            } else {
                Expr::And(parts)
            }
        }
        Expr::Or(exprs) => {
            let mut parts: Vec<Expr> = exprs.iter().map(canonicalize).collect();
            parts.sort_by_key(sort_key);
            parts.dedup();
            if parts.len() == 1 {
                parts.remove(0)
            } else {
                Expr::Or(parts)
            }
        }
    }
}

fn sort_key(expr: &Expr) -> String {
    format!("{expr:?}")
}
