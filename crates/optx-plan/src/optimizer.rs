//! # Optimizer Pass Interface
//!
//! An optimizer pass consumes an immutable plan and returns a semantically
//! equivalent plan, sharing unchanged subtrees with the input. Passes thread
//! their collaborators explicitly: the session for configuration, the
//! allocators for fresh identities, and the warning collector for non-fatal
//! diagnostics. There is no hidden global state.

use crate::allocator::{PlanNodeIdAllocator, VariableAllocator};
use crate::error::Result;
use crate::plan::PlanNode;
use crate::session::{Session, WarningCollector};
use std::sync::Arc;

/// A plan-to-plan rewrite.
pub trait PlanOptimizer {
    fn optimize(
        &self,
        plan: Arc<PlanNode>,
        session: &Session,
        variable_allocator: &mut VariableAllocator,
        id_allocator: &mut PlanNodeIdAllocator,
        warnings: &mut WarningCollector,
    ) -> Result<Arc<PlanNode>>;
}
