//! Planning and execution.
//!
//! The resolver orders the graph, the diff engine compares it against the
//! recorded state to produce a [`Plan`], and the executor applies the plan
//! with retries and rollback.

mod diff;
mod executor;
mod plan;
mod resolver;

pub use diff::DiffEngine;
pub use executor::{
    ActionReport, ActionStatus, ApplyReport, CancelHandle, CancelSignal, InconsistentResource,
    PlanExecutor, cancel_pair,
};
pub use plan::{Action, ActionKind, AttributeChange, Plan, PlanSummary, PlannedValue, Step};
pub use resolver::{DependencyResolver, ExecutionOrder, topological_order};
