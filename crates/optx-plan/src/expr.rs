//! # Scalar Expression Algebra
//!
//! Scalar expressions represent computations on individual rows: column
//! references, literal values, arithmetic operations, comparisons, boolean
//! logic, and function calls. They appear inside predicates, projections,
//! join conditions, and sort keys.
//!
//! ## Conjunction canonical form
//!
//! Boolean conjunctions are stored as flat `And` lists rather than nested
//! binary trees. Predicate pushdown operates on the *conjuncts* of a
//! predicate (its top-level AND operands), so the algebra provides
//! `extract_conjuncts` / `combine_conjuncts` as the canonical split/join
//! pair. TRUE is the unit of conjunction: combining an empty sequence yields
//! the TRUE literal, and TRUE conjuncts are dropped on combination.
//!
//! ## Free variables and substitution
//!
//! `extract_unique` / `extract_all` enumerate the variables an expression
//! depends on; `inline_variables` substitutes variables by expressions.
//! Together they carry predicates across operators that rename or compute
//! their outputs (projections, unions, exchanges, group-id nodes).

use crate::types::{DataType, ScalarValue, Variable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Name of the TRY function. Conjuncts containing TRY calls have
/// exception-suppression semantics and must not be relocated through
/// projections.
pub const TRY_FUNCTION_NAME: &str = "try";

/// Scalar expressions used in predicates, projections, join conditions, etc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a column of the input row.
    Variable(Variable),
    /// Constant literal value.
    Literal(ScalarValue),
    /// Binary operation (e.g., `a + b`, `x = y`, `price > 100`).
    BinaryOp {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation (e.g., `NOT flag`, `-value`, `x IS NULL`).
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    /// Named function call (e.g., `upper(name)`, `abs(value)`).
    Function { name: String, args: Vec<Expr> },
    /// Conjunction (AND) of multiple predicates. Stored as a flat list to
    /// simplify predicate decomposition and pushdown.
    And(Vec<Expr>),
    /// Disjunction (OR) of multiple predicates.
    Or(Vec<Expr>),
}

/// Binary operators for comparison and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Whether this operator is a comparison returning a boolean.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

/// Unary operators for boolean logic and null checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

impl Expr {
    pub fn variable(v: Variable) -> Expr {
        Expr::Variable(v)
    }

    pub fn literal(value: ScalarValue) -> Expr {
        Expr::Literal(value)
    }

    pub fn true_literal() -> Expr {
        Expr::Literal(ScalarValue::Bool(true))
    }

    pub fn false_literal() -> Expr {
        Expr::Literal(ScalarValue::Bool(false))
    }

    pub fn null_literal() -> Expr {
        Expr::Literal(ScalarValue::Null)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equals(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Expr::Literal(ScalarValue::Bool(true)))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Expr::Literal(ScalarValue::Bool(false)))
    }

    pub fn is_null_literal(&self) -> bool {
        matches!(self, Expr::Literal(ScalarValue::Null))
    }

    /// Derive the output type of this expression from its leaves.
    ///
    /// Comparisons and boolean connectives are `Boolean`; arithmetic takes
    /// the type of its left operand. Calls to unknown functions are `Unknown`
    /// since no function signature catalog is consulted here.
    pub fn data_type(&self) -> DataType {
        match self {
            Expr::Variable(v) => v.data_type,
            Expr::Literal(value) => value.data_type(),
            Expr::BinaryOp { op, left, .. } => {
                if op.is_comparison() {
                    DataType::Boolean
                } else {
                    left.data_type()
                }
            }
            Expr::UnaryOp { op, operand } => match op {
                UnaryOp::Not | UnaryOp::IsNull | UnaryOp::IsNotNull => DataType::Boolean,
                UnaryOp::Neg => operand.data_type(),
            },
            Expr::Function { .. } => DataType::Unknown,
            Expr::And(_) | Expr::Or(_) => DataType::Boolean,
        }
    }

    /// Immediate sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Variable(_) | Expr::Literal(_) => vec![],
            Expr::BinaryOp { left, right, .. } => vec![left, right],
            Expr::UnaryOp { operand, .. } => vec![operand],
            Expr::Function { args, .. } => args.iter().collect(),
            Expr::And(exprs) | Expr::Or(exprs) => exprs.iter().collect(),
        }
    }

    /// Number of nodes in this expression tree.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Variable(v) => write!(f, "{v}"),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::BinaryOp { op, left, right } => {
                let symbol = match op {
                    BinaryOp::Eq => "=",
                    BinaryOp::NotEq => "<>",
                    BinaryOp::Lt => "<",
                    BinaryOp::LtEq => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::GtEq => ">=",
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                };
                write!(f, "({left} {symbol} {right})")
            }
            Expr::UnaryOp { op, operand } => match op {
                UnaryOp::Not => write!(f, "(NOT {operand})"),
                UnaryOp::Neg => write!(f, "(-{operand})"),
                UnaryOp::IsNull => write!(f, "({operand} IS NULL)"),
                UnaryOp::IsNotNull => write!(f, "({operand} IS NOT NULL)"),
            },
            Expr::Function { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::And(exprs) => {
                write!(f, "(")?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " AND ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Expr::Or(exprs) => {
                write!(f, "(")?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " OR ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Flatten AND-chains into the list of top-level conjuncts.
///
/// A non-conjunction expression is its own single conjunct, so
/// `extract_conjuncts(TRUE)` is `[TRUE]`.
pub fn extract_conjuncts(expr: &Expr) -> Vec<Expr> {
    fn collect(expr: &Expr, out: &mut Vec<Expr>) {
        match expr {
            Expr::And(exprs) => {
                for e in exprs {
                    collect(e, out);
                }
            }
            other => out.push(other.clone()),
        }
    }
    let mut out = Vec::new();
    collect(expr, &mut out);
    out
}

/// Combine conjuncts into a single predicate.
///
/// TRUE conjuncts are dropped, duplicates are removed, and a FALSE conjunct
/// short-circuits the whole conjunction. The empty sequence combines to TRUE.
pub fn combine_conjuncts<I>(conjuncts: I) -> Expr
where
    I: IntoIterator<Item = Expr>,
{
    let mut seen: HashSet<Expr> = HashSet::new();
    let mut flattened: Vec<Expr> = Vec::new();
    for conjunct in conjuncts {
        for part in extract_conjuncts(&conjunct) {
            if part.is_false() {
                return Expr::false_literal();
            }
            if part.is_true() {
                continue;
            }
            if seen.insert(part.clone()) {
                flattened.push(part);
            }
        }
    }
    match flattened.len() {
        0 => Expr::true_literal(),
        1 => flattened.into_iter().next().unwrap(),
        _ => Expr::And(flattened),
    }
}

/// Combine two predicates (binary convenience over [`combine_conjuncts`]).
pub fn combine(left: Expr, right: Expr) -> Expr {
    combine_conjuncts([left, right])
}

/// Unique free variables of an expression.
pub fn extract_unique(expr: &Expr) -> BTreeSet<Variable> {
    extract_all(expr).into_iter().collect()
}

/// All free-variable occurrences of an expression, with repetition.
pub fn extract_all(expr: &Expr) -> Vec<Variable> {
    fn collect(expr: &Expr, out: &mut Vec<Variable>) {
        if let Expr::Variable(v) = expr {
            out.push(v.clone());
        }
        for child in expr.children() {
            collect(child, out);
        }
    }
    let mut out = Vec::new();
    collect(expr, &mut out);
    out
}

/// Substitute variables by expressions. Variables absent from the mapping are
/// left untouched.
pub fn inline_variables(mapping: &BTreeMap<Variable, Expr>, expr: &Expr) -> Expr {
    match expr {
        Expr::Variable(v) => mapping.get(v).cloned().unwrap_or_else(|| expr.clone()),
        Expr::Literal(_) => expr.clone(),
        Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
            op: *op,
            left: Box::new(inline_variables(mapping, left)),
            right: Box::new(inline_variables(mapping, right)),
        },
        Expr::UnaryOp { op, operand } => Expr::UnaryOp {
            op: *op,
            operand: Box::new(inline_variables(mapping, operand)),
        },
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(|a| inline_variables(mapping, a)).collect(),
        },
        Expr::And(exprs) => Expr::And(exprs.iter().map(|e| inline_variables(mapping, e)).collect()),
        Expr::Or(exprs) => Expr::Or(exprs.iter().map(|e| inline_variables(mapping, e)).collect()),
    }
}

/// Substitute variables by variables (common case of [`inline_variables`]).
pub fn rename_variables(mapping: &BTreeMap<Variable, Variable>, expr: &Expr) -> Expr {
    let as_exprs: BTreeMap<Variable, Expr> = mapping
        .iter()
        .map(|(from, to)| (from.clone(), Expr::Variable(to.clone())))
        .collect();
    inline_variables(&as_exprs, expr)
}

/// Mirror a comparison operator so that `a op b` becomes `b op' a`.
/// Non-comparison operators have no mirror.
pub fn flip_comparison(op: BinaryOp) -> Option<BinaryOp> {
    match op {
        BinaryOp::Eq => Some(BinaryOp::Eq),
        BinaryOp::NotEq => Some(BinaryOp::NotEq),
        BinaryOp::Lt => Some(BinaryOp::Gt),
        BinaryOp::LtEq => Some(BinaryOp::GtEq),
        BinaryOp::Gt => Some(BinaryOp::Lt),
        BinaryOp::GtEq => Some(BinaryOp::LtEq),
        _ => None,
    }
}

/// Whether a call to the given function appears anywhere in the expression.
pub fn contains_call(expr: &Expr, function_name: &str) -> bool {
    if let Expr::Function { name, .. } = expr {
        if name == function_name {
            return true;
        }
    }
    expr.children().iter().any(|c| contains_call(c, function_name))
}
