//! # optx-plan: Plan Representation for the Presto Rust Optimizer
//!
//! This crate defines the data structures and expression-level services that
//! optimizer passes are built on. It is the foundation shared by every pass
//! crate.
//!
//! ## Module Overview
//!
//! - **`types`**: Scalar data types, constant values, typed variables, and
//!   table references.
//! - **`expr`**: The scalar expression algebra with the conjunct engine
//!   (split/combine AND-conjunctions), free-variable extraction, and
//!   variable inlining.
//! - **`plan`**: The plan tree -- a tagged sum of relational operator nodes
//!   with structural sharing via `Arc`.
//! - **`determinism`**: The determinism oracle over expressions, backed by
//!   function metadata.
//! - **`dynamic_filters`**: Planning-time dynamic filter placeholders,
//!   recognized by pushdown and by output-predicate summaries.
//! - **`simplify`**: Constant folding with SQL three-valued logic, and
//!   expression equivalence after folding.
//! - **`equality`**: Equality inference -- equivalence classes over equality
//!   conjuncts, scope-targeted rewriting, and partitioned re-emission.
//! - **`effective`**: The effective-predicate extractor summarizing what must
//!   hold on a subtree's output.
//! - **`catalog`**: The read-only metadata interface (tables, constraints,
//!   function properties).
//! - **`allocator`**: Monotonic plan-node-id and variable allocators.
//! - **`session`**: Per-query configuration and the warning collector.
//! - **`optimizer`**: The `PlanOptimizer` trait implemented by pass crates.
//! - **`error`**: Contract-violation diagnostics shared by all passes.

pub mod allocator;
pub mod catalog;
pub mod determinism;
pub mod dynamic_filters;
pub mod effective;
pub mod equality;
pub mod error;
pub mod expr;
pub mod optimizer;
pub mod plan;
pub mod session;
pub mod simplify;
pub mod types;
