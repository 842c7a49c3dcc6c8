//! Diff engine for comparing the deployment graph against recorded state.
//!
//! Planning is pure: it reads the graph, the ordering and a snapshot and
//! produces a [`Plan`]. A resource is unchanged iff its fingerprint equals
//! the recorded one. References to resources that are themselves created or
//! replaced in the same plan are unknown until apply and always count as a
//! change.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use super::plan::{Action, ActionKind, AttributeChange, Plan, PlannedValue, Step};
use super::resolver::{ExecutionOrder, topological_order};
use crate::catalog::{AdapterRegistry, Mutability, TypeSchema};
use crate::error::{GraphError, ValidationError};
use crate::model::{
    Attributes, DeploymentGraph, Fingerprinter, Reference, ResolvedAttributes, Resource,
};
use crate::state::{RunOperation, StateSnapshot};

/// Engine for computing plans.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    registry: &'a AdapterRegistry,
    fingerprinter: Fingerprinter,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine over the given catalog.
    #[must_use]
    pub const fn new(registry: &'a AdapterRegistry) -> Self {
        Self {
            registry,
            fingerprinter: Fingerprinter::new(),
        }
    }

    /// Validates every resource and output against the catalog.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` for the first resource whose type is not
    /// registered, otherwise `Validation` carrying every problem found.
    pub fn validate(&self, graph: &DeploymentGraph) -> Result<(), GraphError> {
        let mut errors = Vec::new();

        for resource in graph.resources() {
            let Some(adapter) = self.registry.get(&resource.resource_type) else {
                return Err(GraphError::UnknownType {
                    resource: resource.id.clone(),
                    resource_type: resource.resource_type.clone(),
                });
            };

            if let Err(e) = adapter.validate(&resource.id, &resource.attributes) {
                errors.push(e);
            }
            for value in resource.attributes.values() {
                for reference in value.references() {
                    self.check_reference(graph, &resource.id, reference, &mut errors);
                }
            }
        }

        for output in graph.outputs() {
            let owner = format!("outputs.{}", output.name);
            for reference in output.value.references() {
                self.check_reference(graph, &owner, reference, &mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Validation { errors })
        }
    }

    fn check_reference(
        &self,
        graph: &DeploymentGraph,
        owner: &str,
        reference: &Reference,
        errors: &mut Vec<ValidationError>,
    ) {
        let Some(target) = graph.get(&reference.resource) else {
            errors.push(ValidationError::new(
                owner,
                format!("references unknown resource '{}'", reference.resource),
            ));
            return;
        };

        if let Some(adapter) = self.registry.get(&target.resource_type) {
            let outputs = &adapter.schema().outputs;
            if !outputs.iter().any(|o| *o == reference.output) {
                errors.push(ValidationError::new(
                    owner,
                    format!(
                        "{} ({}) has no output '{}'; available: {}",
                        target.id,
                        target.resource_type,
                        reference.output,
                        outputs.join(", ")
                    ),
                ));
            }
        }
    }

    /// Computes the plan that converges `snapshot` towards `graph`.
    ///
    /// # Errors
    ///
    /// Returns validation errors, or `Cycle` if the recorded dependencies of
    /// resources to delete are cyclic.
    pub fn plan(
        &self,
        graph: &DeploymentGraph,
        order: &ExecutionOrder,
        snapshot: &StateSnapshot,
    ) -> Result<Plan, GraphError> {
        self.validate(graph)?;

        let mut plan = Plan::new(RunOperation::Apply);
        let mut kinds: HashMap<String, ActionKind> = HashMap::new();
        let mut destroyed_first: BTreeSet<String> = BTreeSet::new();

        for id in order.ids() {
            let Some(resource) = graph.get(id) else {
                continue;
            };
            let dependencies = order.dependencies_of(id);
            let mut action = self.diff_resource(resource, dependencies, snapshot, &kinds)?;

            // The old object must be gone before its dependency's old object.
            if action.kind == ActionKind::Replace {
                if dependencies.iter().any(|d| destroyed_first.contains(d)) {
                    action.steps = ActionKind::Replace.steps(false);
                }
                if action.steps.first() == Some(&Step::Delete) {
                    destroyed_first.insert(id.clone());
                }
            }

            debug!("{} {}: {}", action.kind, action.id, action.reason);
            kinds.insert(id.clone(), action.kind);
            plan.actions.push(action);
        }

        let orphans: Vec<&String> = snapshot
            .resources
            .keys()
            .filter(|id| !graph.contains(id))
            .collect();
        plan.actions
            .extend(self.deletions(snapshot, &orphans, "no longer declared")?);
        plan.outputs = graph.outputs().to_vec();

        debug!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Computes a plan that deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` for records of unregistered types, or `Cycle` if
    /// the recorded dependencies are cyclic.
    pub fn plan_destroy(&self, snapshot: &StateSnapshot) -> Result<Plan, GraphError> {
        let ids: Vec<&String> = snapshot.resources.keys().collect();
        let mut plan = Plan::new(RunOperation::Destroy);
        plan.actions = self.deletions(snapshot, &ids, "destroy requested")?;
        Ok(plan)
    }

    fn schema(&self, resource: &str, resource_type: &str) -> Result<&TypeSchema, GraphError> {
        self.registry
            .get(resource_type)
            .map(|adapter| adapter.schema())
            .ok_or_else(|| GraphError::UnknownType {
                resource: resource.to_string(),
                resource_type: resource_type.to_string(),
            })
    }

    fn diff_resource(
        &self,
        resource: &Resource,
        dependencies: &[String],
        snapshot: &StateSnapshot,
        kinds: &HashMap<String, ActionKind>,
    ) -> Result<Action, GraphError> {
        let schema = self.schema(&resource.id, &resource.resource_type)?;

        // Outputs of resources that keep their object are known from state.
        let lookup = |r: &Reference| -> Option<Value> {
            match kinds.get(&r.resource) {
                Some(ActionKind::NoOp | ActionKind::Update) => {
                    snapshot.get(&r.resource)?.output(&r.output).cloned()
                }
                _ => None,
            }
        };

        let planned: BTreeMap<String, PlannedValue> = resource
            .attributes
            .iter()
            .map(|(name, value)| {
                let planned = value
                    .resolve(&lookup)
                    .map_or(PlannedValue::Unknown, PlannedValue::Known);
                (name.clone(), planned)
            })
            .collect();

        let resolved: Option<ResolvedAttributes> = planned
            .iter()
            .map(|(name, value)| match value {
                PlannedValue::Known(v) => Some((name.clone(), v.clone())),
                PlannedValue::Unknown => None,
            })
            .collect();
        let fingerprint = resolved
            .as_ref()
            .map(|attrs| self.fingerprinter.fingerprint(&resource.resource_type, attrs));

        let prior = snapshot.get(&resource.id);
        let (kind, changes, reason) = match prior {
            None => (
                ActionKind::Create,
                attribute_changes(schema, &planned, None),
                String::from("new resource"),
            ),
            Some(record) if record.resource_type != resource.resource_type => (
                ActionKind::Replace,
                attribute_changes(schema, &planned, Some(&record.attributes)),
                format!(
                    "type changed from {} to {}",
                    record.resource_type, resource.resource_type
                ),
            ),
            Some(record) => {
                let unchanged = fingerprint
                    .as_deref()
                    .is_some_and(|fp| Fingerprinter::matches(fp, &record.fingerprint));
                if unchanged {
                    (ActionKind::NoOp, Vec::new(), String::from("unchanged"))
                } else {
                    let changes = attribute_changes(schema, &planned, Some(&record.attributes));
                    let forced: Vec<&str> = changes
                        .iter()
                        .filter(|c| c.forces_replacement)
                        .map(|c| c.name.as_str())
                        .collect();
                    let (kind, reason) = if !forced.is_empty() {
                        (
                            ActionKind::Replace,
                            format!("forces replacement: {}", forced.join(", ")),
                        )
                    } else if changes.is_empty() {
                        (
                            ActionKind::Update,
                            String::from("fingerprint differs from recorded state"),
                        )
                    } else {
                        let names: Vec<&str> = changes.iter().map(|c| c.name.as_str()).collect();
                        (ActionKind::Update, format!("changed: {}", names.join(", ")))
                    };
                    (kind, changes, reason)
                }
            }
        };

        Ok(Action {
            id: resource.id.clone(),
            resource_type: resource.resource_type.clone(),
            kind,
            steps: kind.steps(schema.create_before_destroy),
            declared: resource.attributes.clone(),
            planned,
            fingerprint,
            prior: prior.cloned(),
            changes,
            depends_on: dependencies.to_vec(),
            dependencies: dependencies.to_vec(),
            reason,
        })
    }

    /// Delete actions for `ids`, dependents before their dependencies.
    fn deletions(
        &self,
        snapshot: &StateSnapshot,
        ids: &[&String],
        reason: &str,
    ) -> Result<Vec<Action>, GraphError> {
        let nodes: Vec<(String, Vec<String>)> = ids
            .iter()
            .filter_map(|id| {
                snapshot
                    .get(id)
                    .map(|record| ((*id).clone(), record.dependencies.clone()))
            })
            .collect();

        let mut order = topological_order(&nodes)?;
        order.reverse();

        let mut actions = Vec::with_capacity(order.len());
        for id in order {
            let Some(record) = snapshot.get(&id) else {
                continue;
            };
            self.schema(&id, &record.resource_type)?;

            let dependents: Vec<String> = nodes
                .iter()
                .filter(|(_, deps)| deps.contains(&id))
                .map(|(dependent, _)| dependent.clone())
                .collect();

            actions.push(Action {
                resource_type: record.resource_type.clone(),
                kind: ActionKind::Delete,
                steps: vec![Step::Delete],
                declared: Attributes::new(),
                planned: BTreeMap::new(),
                fingerprint: None,
                prior: Some(record.clone()),
                changes: Vec::new(),
                depends_on: dependents,
                dependencies: record.dependencies.clone(),
                reason: reason.to_string(),
                id,
            });
        }
        Ok(actions)
    }
}

/// Attributes whose planned value differs from the recorded one.
///
/// Unknown values always differ. Without a record every declared attribute
/// is listed and nothing forces replacement.
fn attribute_changes(
    schema: &TypeSchema,
    planned: &BTreeMap<String, PlannedValue>,
    recorded: Option<&ResolvedAttributes>,
) -> Vec<AttributeChange> {
    let empty = ResolvedAttributes::new();
    let before_map = recorded.unwrap_or(&empty);
    let names: BTreeSet<&String> = planned.keys().chain(before_map.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let before = before_map.get(name);
            let after = planned.get(name);
            let changed = match (before, after) {
                (Some(old), Some(PlannedValue::Known(new))) => old != new,
                (None, None) => false,
                _ => true,
            };
            changed.then(|| AttributeChange {
                name: name.clone(),
                before: before.cloned(),
                after: after.cloned(),
                forces_replacement: recorded.is_some()
                    && schema.mutability(name) == Mutability::ReplaceOnly,
            })
        })
        .collect()
}
