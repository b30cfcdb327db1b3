//! # Identifier Allocators
//!
//! Monotonic counters for plan node ids and synthesized variables. These are
//! the only mutable collaborators of an optimizer pass, so they are passed as
//! explicit `&mut` parameters and must be serialized per plan.

use crate::plan::PlanNodeId;
use crate::types::{DataType, Variable};

/// Allocates fresh plan node identifiers.
#[derive(Debug, Default)]
pub struct PlanNodeIdAllocator {
    next: u64,
}

impl PlanNodeIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering above ids already present in an existing plan.
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> PlanNodeId {
        let id = PlanNodeId(self.next);
        self.next += 1;
        id
    }
}

/// Allocates fresh, uniquely named variables.
#[derive(Debug, Default)]
pub struct VariableAllocator {
    next: u64,
}

impl VariableAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new variable named after `base`, guaranteed not to collide with any
    /// other allocation from this allocator.
    pub fn new_variable(&mut self, base: &str, data_type: DataType) -> Variable {
        let name = format!("{}_{}", base, self.next);
        self.next += 1;
        Variable::new(name, data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique_and_monotonic() {
        let mut ids = PlanNodeIdAllocator::new();
        assert_ne!(ids.next_id(), ids.next_id());

        let mut variables = VariableAllocator::new();
        let a = variables.new_variable("expr", DataType::Bigint);
        let b = variables.new_variable("expr", DataType::Bigint);
        assert_ne!(a.name, b.name);
    }
}
