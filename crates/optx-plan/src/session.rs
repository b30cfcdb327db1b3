//! # Session and Planner Diagnostics
//!
//! The session carries per-query configuration read by the optimizer passes.
//! Passes never consult global state: the session, the allocators, and the
//! warning collector are threaded explicitly through every entry point.

/// Per-query configuration visible to the optimizer.
#[derive(Debug, Clone)]
pub struct Session {
    pub query_id: String,
    /// Feature flag: synthesize dynamic filters at hash-join probe sites.
    pub enable_dynamic_filtering: bool,
}

impl Session {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            enable_dynamic_filtering: false,
        }
    }

    pub fn with_dynamic_filtering(mut self, enabled: bool) -> Self {
        self.enable_dynamic_filtering = enabled;
        self
    }
}

/// A non-fatal diagnostic produced during planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerWarning {
    pub message: String,
}

/// Accumulates planner warnings across optimizer passes.
#[derive(Debug, Default)]
pub struct WarningCollector {
    warnings: Vec<PlannerWarning>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: impl Into<String>) {
        self.warnings.push(PlannerWarning {
            message: message.into(),
        });
    }

    pub fn warnings(&self) -> &[PlannerWarning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}
