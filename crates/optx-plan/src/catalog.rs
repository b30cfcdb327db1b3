//! # Metadata Interface
//!
//! The metadata catalog provides the optimizer passes with read-only schema
//! information: table column definitions, declared per-table constraints, and
//! function properties.
//!
//! ## Trait Design
//!
//! The `Metadata` trait is intentionally minimal and behind a trait object
//! (`dyn Metadata`) so that different backends can provide metadata. In
//! production, the catalog would be backed by Presto's `ConnectorMetadata`.
//! For testing and development, `InMemoryMetadata` provides a simple
//! HashMap-based implementation that can be populated programmatically.
//!
//! ## Table constraints
//!
//! A table constraint is a predicate over the table's columns that the
//! connector guarantees for every row it produces (e.g., a partition-key
//! restriction enforced by the table layout). The effective-predicate
//! extractor surfaces these constraints when table properties are enabled.
//!
//! ## Function properties
//!
//! Determinism is a function-level property: `random()` produces a different
//! value per call, while `abs(x)` depends only on its argument. The built-in
//! registry covers the standard non-deterministic names; backends can extend
//! the set.

use crate::expr::Expr;
use crate::types::{TableRef, Variable};
use std::collections::{HashMap, HashSet};

/// Metadata provides schema and function information.
pub trait Metadata: Send + Sync {
    fn table_columns(&self, table: &TableRef) -> Option<Vec<Variable>>;

    /// Predicate guaranteed by the connector on every row of the table, if
    /// one is declared.
    fn table_constraint(&self, table: &TableRef) -> Option<Expr>;

    fn is_function_deterministic(&self, name: &str) -> bool;
}

/// Function names that are non-deterministic in every backend.
const BUILTIN_NONDETERMINISTIC: &[&str] = &[
    "random",
    "rand",
    "shuffle",
    "uuid",
    "now",
    "current_timestamp",
];

/// In-memory metadata catalog for testing and development.
///
/// Tables are keyed by their fully-qualified name (`schema.table`). This
/// catalog is populated programmatically and does not persist across
/// restarts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetadata {
    /// Column definitions keyed by "schema.table".
    table_columns: HashMap<String, Vec<Variable>>,
    /// Declared constraints keyed by "schema.table".
    table_constraints: HashMap<String, Expr>,
    /// Non-deterministic function names beyond the built-in set.
    nondeterministic_functions: HashSet<String>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: &TableRef, columns: Vec<Variable>) {
        self.table_columns.insert(table.to_string(), columns);
    }

    pub fn add_table_constraint(&mut self, table: &TableRef, constraint: Expr) {
        self.table_constraints.insert(table.to_string(), constraint);
    }

    pub fn add_nondeterministic_function(&mut self, name: impl Into<String>) {
        self.nondeterministic_functions.insert(name.into());
    }
}

impl Metadata for InMemoryMetadata {
    fn table_columns(&self, table: &TableRef) -> Option<Vec<Variable>> {
        self.table_columns.get(&table.to_string()).cloned()
    }

    fn table_constraint(&self, table: &TableRef) -> Option<Expr> {
        self.table_constraints.get(&table.to_string()).cloned()
    }

    fn is_function_deterministic(&self, name: &str) -> bool {
        !BUILTIN_NONDETERMINISTIC.contains(&name)
            && !self.nondeterministic_functions.contains(name)
    }
}
