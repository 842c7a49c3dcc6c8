//! Plan types.
//!
//! A plan is an ordered, immutable list of actions produced by the diff
//! engine and consumed by the executor. Non-delete actions come first in
//! dependency order, then deletes in reverse dependency order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::model::{Attributes, OutputDef};
use crate::state::{ResourceRecord, RunOperation};

/// A complete plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Whether this plan converges or destroys.
    pub operation: RunOperation,
    /// Actions in execution order.
    pub actions: Vec<Action>,
    /// Stack outputs to resolve after apply.
    pub outputs: Vec<OutputDef>,
}

/// What happens to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// New resource.
    Create,
    /// In-place change.
    Update,
    /// New object replaces the old one.
    Replace,
    /// Resource is removed.
    Delete,
    /// Nothing to do.
    NoOp,
}

/// One provider-facing step of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Create a new object and commit its record.
    Create,
    /// Update the prior object in place and commit its record.
    Update,
    /// Delete the prior object and remove its record.
    Delete,
    /// Delete the prior object after its replacement was committed.
    DeletePrior,
}

/// A planned attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum PlannedValue {
    /// Value known at plan time.
    Known(Value),
    /// Depends on an output that does not exist yet.
    Unknown,
}

/// A changed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Recorded value, if any.
    pub before: Option<Value>,
    /// Planned value, if the attribute is still declared.
    pub after: Option<PlannedValue>,
    /// Whether this change forces replacement.
    pub forces_replacement: bool,
}

/// A planned action on one resource.
#[derive(Debug, Clone)]
pub struct Action {
    /// Logical identifier.
    pub id: String,
    /// Type tag.
    pub resource_type: String,
    /// What happens.
    pub kind: ActionKind,
    /// Provider steps, in order.
    pub steps: Vec<Step>,
    /// Declared attributes; resolved by the executor when dispatched.
    pub declared: Attributes,
    /// Attribute values as known at plan time.
    pub planned: BTreeMap<String, PlannedValue>,
    /// Planned fingerprint, when every value is known.
    pub fingerprint: Option<String>,
    /// What was last applied, for update, replace and delete.
    pub prior: Option<ResourceRecord>,
    /// Changed attributes.
    pub changes: Vec<AttributeChange>,
    /// Actions in this plan that must be applied first.
    pub depends_on: Vec<String>,
    /// Resource dependencies to record in state.
    pub dependencies: Vec<String>,
    /// Human-readable reason.
    pub reason: String,
}

/// Action counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// In-place updates.
    pub update: usize,
    /// Replacements.
    pub replace: usize,
    /// Deletes.
    pub delete: usize,
    /// Unchanged resources.
    pub no_op: usize,
}

impl ActionKind {
    /// Steps for this kind of action.
    #[must_use]
    pub fn steps(self, create_before_destroy: bool) -> Vec<Step> {
        match self {
            Self::Create => vec![Step::Create],
            Self::Update => vec![Step::Update],
            Self::Replace if create_before_destroy => vec![Step::Create, Step::DeletePrior],
            Self::Replace => vec![Step::Delete, Step::Create],
            Self::Delete => vec![Step::Delete],
            Self::NoOp => Vec::new(),
        }
    }

    /// Symbol used in plan output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(operation: RunOperation) -> Self {
        Self {
            created_at: Utc::now(),
            operation,
            actions: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Returns true if any action changes infrastructure.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.kind != ActionKind::NoOp)
    }

    /// Looks up the action for a resource.
    #[must_use]
    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Returns the action kinds in plan order.
    #[must_use]
    pub fn kinds(&self) -> Vec<(&str, ActionKind)> {
        self.actions.iter().map(|a| (a.id.as_str(), a.kind)).collect()
    }

    /// Counts actions by kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::Create => summary.create += 1,
                ActionKind::Update => summary.update += 1,
                ActionKind::Replace => summary.replace += 1,
                ActionKind::Delete => summary.delete += 1,
                ActionKind::NoOp => summary.no_op += 1,
            }
        }
        summary
    }

    /// Returns the ids of every resource the plan changes.
    #[must_use]
    pub fn changed_ids(&self) -> Vec<String> {
        self.actions
            .iter()
            .filter(|a| a.kind != ActionKind::NoOp)
            .map(|a| a.id.clone())
            .collect()
    }
}

impl Action {
    /// Physical id of the prior object, if any.
    #[must_use]
    pub fn prior_physical_id(&self) -> Option<&str> {
        self.prior.as_ref().map(|p| p.physical_id.as_str())
    }

    /// Returns true if some planned value is known only after apply.
    #[must_use]
    pub fn has_unknowns(&self) -> bool {
        self.planned.values().any(|v| *v == PlannedValue::Unknown)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_op
        )
    }
}
