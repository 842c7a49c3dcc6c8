//! Plan executor for applying plans.
//!
//! Actions are dispatched in plan order. With `parallelism > 1`, independent
//! actions run concurrently, but an action only starts once every action it
//! depends on is applied, and deletes wait for every non-delete. Old objects
//! of destroy-before-create replacements are torn down first, dependents
//! before their dependencies. Each completed step is journaled before its
//! state commit so a failed or cancelled run can be reverted step by step.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::plan::{Action, ActionKind, Plan, Step};
use crate::catalog::{AdapterRegistry, ApplyOutcome, ResourceAdapter};
use crate::config::{ExecutionConfig, RollbackPolicy};
use crate::error::{AdapterError, KeelError, Result};
use crate::model::{Fingerprinter, OutputDef, Reference, ResolvedAttributes};
use crate::state::{ResourceRecord, RunOperation, StateSnapshot, StateStore};

/// Lifecycle of one action during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Not dispatched yet.
    Pending,
    /// Adapter calls in progress.
    Applying,
    /// Every step succeeded and was committed.
    Applied,
    /// A step failed.
    Failed,
    /// Applied, then reverted.
    RolledBack,
    /// Reverting failed; the resource may be inconsistent.
    RollbackFailed,
    /// Never dispatched.
    Skipped,
}

/// Outcome of one action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    /// Logical identifier.
    pub id: String,
    /// Planned action kind.
    pub kind: ActionKind,
    /// Final status.
    pub status: ActionStatus,
    /// Physical id after the run, if any.
    pub physical_id: Option<String>,
    /// Failure message.
    pub error: Option<String>,
    /// Rollback failure message.
    pub rollback_error: Option<String>,
}

/// A resource a failed rollback left in an unknown state.
#[derive(Debug, Clone, Serialize)]
pub struct InconsistentResource {
    /// Logical identifier.
    pub id: String,
    /// Physical object involved.
    pub physical_id: Option<String>,
    /// Why the revert failed.
    pub reason: String,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Kind of run.
    pub operation: RunOperation,
    /// Per-action outcome, in plan order.
    pub actions: Vec<ActionReport>,
    /// Resolved stack outputs.
    pub outputs: BTreeMap<String, Value>,
    /// Outputs that could not be resolved.
    pub pending_outputs: Vec<String>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Whether a rollback ran.
    pub rolled_back: bool,
    /// Resources left inconsistent by a failed rollback.
    pub inconsistent: Vec<InconsistentResource>,
}

/// Requests cancellation of a running execution.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

/// Observes cancellation requests.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

/// Creates a connected cancel handle and signal.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelSignal { receiver })
}

impl CancelHandle {
    /// Requests cancellation; idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl CancelSignal {
    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes when cancellation is requested.
    ///
    /// Never completes if the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        let requested = self.receiver.wait_for(|c| *c).await.is_ok();
        if !requested {
            std::future::pending::<()>().await;
        }
    }
}

/// One completed provider step, kept for rollback.
#[derive(Debug, Clone)]
enum JournalEntry {
    /// A new object was created. `restores` is the record to put back when
    /// the creation is reverted.
    Created {
        id: String,
        record: ResourceRecord,
        restores: Option<ResourceRecord>,
    },
    Updated {
        id: String,
        prior: ResourceRecord,
    },
    Deleted {
        id: String,
        prior: ResourceRecord,
    },
    /// The replaced object was deleted; its record was already superseded.
    DeletedPrior {
        id: String,
        prior: ResourceRecord,
    },
}

impl JournalEntry {
    fn id(&self) -> &str {
        match self {
            Self::Created { id, .. }
            | Self::Updated { id, .. }
            | Self::Deleted { id, .. }
            | Self::DeletedPrior { id, .. } => id,
        }
    }

    fn physical_id(&self) -> &str {
        match self {
            Self::Created { record, .. } => &record.physical_id,
            Self::Updated { prior, .. }
            | Self::Deleted { prior, .. }
            | Self::DeletedPrior { prior, .. } => &prior.physical_id,
        }
    }

    fn describe(&self) -> String {
        let verb = match self {
            Self::Created { .. } => "create",
            Self::Updated { .. } => "update",
            Self::Deleted { .. } | Self::DeletedPrior { .. } => "delete",
        };
        format!("{verb} of {} ({})", self.id(), self.physical_id())
    }
}

struct ActionRun {
    index: usize,
    entries: Vec<JournalEntry>,
    result: Result<Option<ResourceRecord>>,
}

/// Executor for plans.
pub struct PlanExecutor<'a> {
    registry: &'a AdapterRegistry,
    store: &'a dyn StateStore,
    settings: &'a ExecutionConfig,
    cancel: Option<CancelSignal>,
    fingerprinter: Fingerprinter,
}

impl fmt::Debug for PlanExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("backend", &self.store.backend_type())
            .field("settings", self.settings)
            .finish_non_exhaustive()
    }
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub const fn new(
        registry: &'a AdapterRegistry,
        store: &'a dyn StateStore,
        settings: &'a ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
            cancel: None,
            fingerprinter: Fingerprinter::new(),
        }
    }

    /// Stops dispatching when `signal` fires.
    #[must_use]
    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Executes a plan computed against `snapshot`.
    ///
    /// Action failures do not make this return an error; they are reported
    /// in the [`ApplyReport`] after rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if the final state cannot be read or the stack
    /// outputs cannot be saved.
    pub async fn execute(&self, plan: &Plan, snapshot: &StateSnapshot) -> Result<ApplyReport> {
        info!(
            "Executing {} plan with {} actions ({})",
            plan.operation,
            plan.actions.len(),
            plan.summary()
        );

        let count = plan.actions.len();
        let positions: HashMap<&str, usize> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.as_str(), i))
            .collect();
        let mut statuses = vec![ActionStatus::Pending; count];
        let mut reports: Vec<ActionReport> = plan.actions.iter().map(ActionReport::pending).collect();

        let mut live: HashMap<String, BTreeMap<String, Value>> = snapshot
            .resources
            .iter()
            .map(|(id, record)| (id.clone(), record.outputs.clone()))
            .collect();
        let mut announced: HashSet<String> = HashSet::new();
        let mut journal: Vec<(usize, JournalEntry)> = Vec::new();

        let mut in_flight = FuturesUnordered::new();
        let mut cancel = self.cancel.clone();
        let parallelism = self.settings.parallelism.max(1);
        let mut halted = false;
        let mut cancelled = false;

        let mut torn_down: HashSet<usize> = HashSet::new();
        for index in (0..count).rev() {
            let action = &plan.actions[index];
            if action.kind != ActionKind::Replace || action.steps.first() != Some(&Step::Delete) {
                continue;
            }
            if cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
                warn!("Cancellation requested, stopping teardown");
                halted = true;
                cancelled = true;
                break;
            }

            let mut entries = Vec::new();
            let result = self
                .run_step(Step::Delete, action, &ResolvedAttributes::new(), &mut entries, &mut None)
                .await;
            journal.extend(entries.into_iter().map(|entry| (index, entry)));
            if let Err(e) = result {
                error!("Failed to tear down {}: {e}", action.id);
                statuses[index] = ActionStatus::Failed;
                reports[index].error = Some(e.to_string());
                halted = true;
                break;
            }
            live.remove(&action.id);
            torn_down.insert(index);
        }

        loop {
            if !halted && cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
                warn!("Cancellation requested, stopping dispatch");
                halted = true;
                cancelled = true;
            }

            if !halted {
                for index in 0..count {
                    if in_flight.len() >= parallelism {
                        break;
                    }
                    if statuses[index] != ActionStatus::Pending
                        || !is_ready(plan, index, &statuses, &positions)
                    {
                        continue;
                    }

                    let action = &plan.actions[index];
                    if action.kind == ActionKind::NoOp {
                        statuses[index] = ActionStatus::Applied;
                        reports[index].physical_id = action.prior_physical_id().map(String::from);
                        continue;
                    }

                    match resolve_attributes(action, &live) {
                        Ok(attributes) => {
                            let steps = if torn_down.contains(&index) {
                                &action.steps[1..]
                            } else {
                                &action.steps[..]
                            };
                            statuses[index] = ActionStatus::Applying;
                            in_flight.push(self.run_action(index, action, steps, attributes));
                        }
                        Err(reference) => {
                            let err = AdapterError::permanent(format!(
                                "unresolved reference ${{{reference}}}"
                            ))
                            .for_resource(&action.id);
                            error!("{err}");
                            statuses[index] = ActionStatus::Failed;
                            reports[index].error = Some(err.to_string());
                            halted = true;
                            break;
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let next = match cancel.as_mut().filter(|_| !halted) {
                Some(signal) => tokio::select! {
                    run = in_flight.next() => run,
                    () = signal.cancelled() => {
                        warn!("Cancellation requested, waiting for in-flight actions");
                        halted = true;
                        cancelled = true;
                        continue;
                    }
                },
                None => in_flight.next().await,
            };
            let Some(ActionRun {
                index,
                entries,
                result,
            }) = next
            else {
                break;
            };

            let action = &plan.actions[index];
            journal.extend(entries.into_iter().map(|entry| (index, entry)));

            match result {
                Ok(record) => {
                    statuses[index] = ActionStatus::Applied;
                    reports[index].physical_id = record
                        .as_ref()
                        .map(|r| r.physical_id.clone())
                        .or_else(|| action.prior_physical_id().map(String::from));
                    match record {
                        Some(record) => {
                            live.insert(action.id.clone(), record.outputs);
                        }
                        None => {
                            live.remove(&action.id);
                        }
                    }
                    announce_outputs(&plan.outputs, &live, &mut announced);
                }
                Err(e) => {
                    error!("Failed to {} {}: {e}", action.kind, action.id);
                    statuses[index] = ActionStatus::Failed;
                    reports[index].error = Some(e.to_string());
                    halted = true;
                }
            }
        }

        let failed = statuses.contains(&ActionStatus::Failed);
        let mut inconsistent = Vec::new();
        let mut rolled_back = false;

        if (failed || cancelled) && !journal.is_empty() {
            match self.settings.rollback {
                RollbackPolicy::Cascade => {
                    self.rollback(journal, &mut statuses, &mut reports, &mut inconsistent)
                        .await;
                    rolled_back = true;
                }
                RollbackPolicy::None => {
                    warn!(
                        "Rollback disabled, {} applied step(s) stay committed",
                        journal.len()
                    );
                }
            }
        }

        for (status, report) in statuses.iter_mut().zip(reports.iter_mut()) {
            if *status == ActionStatus::Pending {
                *status = ActionStatus::Skipped;
            }
            report.status = *status;
        }

        let current = self.store.load().await?;
        let (outputs, pending_outputs) = resolve_outputs(&plan.outputs, &current);
        for name in &pending_outputs {
            warn!("Output '{name}' could not be resolved");
        }
        self.store.save_outputs(outputs.clone()).await?;

        let report = ApplyReport {
            operation: plan.operation,
            actions: reports,
            outputs,
            pending_outputs,
            cancelled,
            rolled_back,
            inconsistent,
        };

        if report.success() {
            info!("{} completed successfully", plan.operation);
        } else {
            error!(
                "{} failed ({} failed, {} rolled back, {} inconsistent)",
                plan.operation,
                report.count(ActionStatus::Failed),
                report.count(ActionStatus::RolledBack),
                report.inconsistent.len()
            );
        }

        Ok(report)
    }

    async fn run_action(
        &self,
        index: usize,
        action: &Action,
        steps: &[Step],
        attributes: ResolvedAttributes,
    ) -> ActionRun {
        info!("{} {}: {}", action.kind, action.id, action.reason);

        let mut entries = Vec::new();
        let mut record = None;
        for step in steps {
            if let Err(e) = self
                .run_step(*step, action, &attributes, &mut entries, &mut record)
                .await
            {
                return ActionRun {
                    index,
                    entries,
                    result: Err(e),
                };
            }
        }

        ActionRun {
            index,
            entries,
            result: Ok(record),
        }
    }

    async fn run_step(
        &self,
        step: Step,
        action: &Action,
        attributes: &ResolvedAttributes,
        entries: &mut Vec<JournalEntry>,
        current: &mut Option<ResourceRecord>,
    ) -> Result<()> {
        let id = action.id.as_str();
        debug!("{id}: {step:?}");

        match step {
            Step::Create => {
                let outcome = self
                    .apply_object(id, &action.resource_type, None, attributes)
                    .await?;
                let record = self.new_record(action, attributes, outcome);
                info!("Created {id} ({})", record.physical_id);

                let restores = if action.steps.contains(&Step::DeletePrior) {
                    action.prior.clone()
                } else {
                    None
                };
                entries.push(JournalEntry::Created {
                    id: id.to_string(),
                    record: record.clone(),
                    restores,
                });
                self.store.commit(id, record.clone()).await?;
                *current = Some(record);
            }
            Step::Update => {
                let prior = prior_of(action)?;
                let outcome = self
                    .apply_object(id, &action.resource_type, Some(&prior.physical_id), attributes)
                    .await?;
                let record = self.new_record(action, attributes, outcome);
                info!("Updated {id} ({})", record.physical_id);

                entries.push(JournalEntry::Updated {
                    id: id.to_string(),
                    prior: prior.clone(),
                });
                self.store.commit(id, record.clone()).await?;
                *current = Some(record);
            }
            Step::Delete => {
                let prior = prior_of(action)?;
                self.delete_object(id, prior).await?;
                info!("Deleted {id} ({})", prior.physical_id);

                entries.push(JournalEntry::Deleted {
                    id: id.to_string(),
                    prior: prior.clone(),
                });
                self.store.remove(id).await?;
                *current = None;
            }
            Step::DeletePrior => {
                let prior = prior_of(action)?;
                self.delete_object(id, prior).await?;
                info!("Deleted replaced object of {id} ({})", prior.physical_id);

                entries.push(JournalEntry::DeletedPrior {
                    id: id.to_string(),
                    prior: prior.clone(),
                });
            }
        }

        Ok(())
    }

    async fn rollback(
        &self,
        journal: Vec<(usize, JournalEntry)>,
        statuses: &mut [ActionStatus],
        reports: &mut [ActionReport],
        inconsistent: &mut Vec<InconsistentResource>,
    ) {
        warn!("Rolling back {} applied step(s)", journal.len());

        let mut restored: HashMap<String, ResourceRecord> = HashMap::new();
        let mut touched: Vec<usize> = Vec::new();
        let mut broken: HashSet<usize> = HashSet::new();

        for (index, entry) in journal.into_iter().rev() {
            match self.revert(&entry, &mut restored).await {
                Ok(()) => info!("Reverted {}", entry.describe()),
                Err(e) => {
                    error!("Failed to revert {}: {e}", entry.describe());
                    reports[index].rollback_error = Some(e.to_string());
                    inconsistent.push(InconsistentResource {
                        id: entry.id().to_string(),
                        physical_id: Some(entry.physical_id().to_string()),
                        reason: e.to_string(),
                    });
                    broken.insert(index);
                }
            }
            if !touched.contains(&index) {
                touched.push(index);
            }
        }

        for index in touched {
            statuses[index] = if broken.contains(&index) {
                ActionStatus::RollbackFailed
            } else if matches!(statuses[index], ActionStatus::Applied | ActionStatus::Pending) {
                // Pending here means only the teardown ran.
                ActionStatus::RolledBack
            } else {
                statuses[index]
            };
        }
    }

    async fn revert(
        &self,
        entry: &JournalEntry,
        restored: &mut HashMap<String, ResourceRecord>,
    ) -> Result<()> {
        match entry {
            JournalEntry::Created {
                id,
                record,
                restores,
            } => {
                self.delete_object(id, record).await?;
                match restores {
                    Some(prior) => {
                        let record = restored.remove(id).unwrap_or_else(|| prior.clone());
                        self.store.commit(id, record).await
                    }
                    None => self.store.remove(id).await,
                }
            }
            JournalEntry::Updated { id, prior } => {
                let outcome = self
                    .apply_object(id, &prior.resource_type, Some(&prior.physical_id), &prior.attributes)
                    .await?;
                self.store.commit(id, restore_record(prior, outcome)).await
            }
            JournalEntry::Deleted { id, prior } => {
                let outcome = self
                    .apply_object(id, &prior.resource_type, None, &prior.attributes)
                    .await?;
                self.store.commit(id, restore_record(prior, outcome)).await
            }
            JournalEntry::DeletedPrior { id, prior } => {
                let outcome = self
                    .apply_object(id, &prior.resource_type, None, &prior.attributes)
                    .await?;
                restored.insert(id.clone(), restore_record(prior, outcome));
                Ok(())
            }
        }
    }

    fn adapter(&self, id: &str, resource_type: &str) -> Result<&'a dyn ResourceAdapter> {
        self.registry
            .get(resource_type)
            .map(AsRef::as_ref)
            .ok_or_else(|| {
                AdapterError::permanent(format!("no adapter registered for type '{resource_type}'"))
                    .for_resource(id)
                    .into()
            })
    }

    async fn apply_object(
        &self,
        id: &str,
        resource_type: &str,
        physical_id: Option<&str>,
        attributes: &ResolvedAttributes,
    ) -> Result<ApplyOutcome> {
        let adapter = self.adapter(id, resource_type)?;
        let what = if physical_id.is_some() { "update" } else { "create" };
        let outcome = self
            .with_retry(id, what, move || adapter.apply(physical_id, attributes))
            .await?;
        Ok(outcome)
    }

    /// Deletes an object; an object that is already gone counts as deleted.
    async fn delete_object(&self, id: &str, record: &ResourceRecord) -> Result<()> {
        let adapter = self.adapter(id, &record.resource_type)?;
        let physical_id = record.physical_id.as_str();

        match self
            .with_retry(id, "delete", move || adapter.delete(physical_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!("{id}: {physical_id} was already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `op` under the action timeout, retrying transient failures with
    /// exponential backoff up to `max_attempts` total attempts.
    async fn with_retry<T, F, Fut>(
        &self,
        resource: &str,
        what: &str,
        mut op: F,
    ) -> std::result::Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AdapterError>>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let timeout = Duration::from_secs(self.settings.action_timeout_secs);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::transient(format!(
                    "{what} timed out after {}s",
                    timeout.as_secs()
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.settings.backoff_ms(attempt);
                    warn!(
                        "{resource}: {what} failed (attempt {attempt}/{max_attempts}), retrying in {delay}ms: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.for_resource(resource)),
            }
        }
    }

    fn new_record(
        &self,
        action: &Action,
        attributes: &ResolvedAttributes,
        outcome: ApplyOutcome,
    ) -> ResourceRecord {
        ResourceRecord {
            resource_type: action.resource_type.clone(),
            fingerprint: self
                .fingerprinter
                .fingerprint(&action.resource_type, attributes),
            attributes: attributes.clone(),
            physical_id: outcome.physical_id,
            outputs: outcome.outputs,
            dependencies: action.dependencies.clone(),
            applied_at: Utc::now(),
        }
    }
}

fn prior_of(action: &Action) -> Result<&ResourceRecord> {
    action
        .prior
        .as_ref()
        .ok_or_else(|| KeelError::internal(format!("{} has no recorded state", action.id)))
}

fn restore_record(prior: &ResourceRecord, outcome: ApplyOutcome) -> ResourceRecord {
    ResourceRecord {
        physical_id: outcome.physical_id,
        outputs: outcome.outputs,
        applied_at: Utc::now(),
        ..prior.clone()
    }
}

/// An action is ready once its dependencies are applied; deletes also wait
/// for every non-delete action.
fn is_ready(
    plan: &Plan,
    index: usize,
    statuses: &[ActionStatus],
    positions: &HashMap<&str, usize>,
) -> bool {
    let action = &plan.actions[index];
    let dependencies_applied = action.depends_on.iter().all(|dep| {
        positions
            .get(dep.as_str())
            .is_none_or(|&i| statuses[i] == ActionStatus::Applied)
    });
    if action.kind != ActionKind::Delete {
        return dependencies_applied;
    }

    dependencies_applied
        && plan
            .actions
            .iter()
            .zip(statuses)
            .all(|(a, s)| a.kind == ActionKind::Delete || *s == ActionStatus::Applied)
}

fn resolve_attributes(
    action: &Action,
    live: &HashMap<String, BTreeMap<String, Value>>,
) -> std::result::Result<ResolvedAttributes, Reference> {
    let lookup = |r: &Reference| live.get(&r.resource)?.get(&r.output).cloned();
    action
        .declared
        .iter()
        .map(|(name, value)| value.resolve(&lookup).map(|v| (name.clone(), v)))
        .collect()
}

fn announce_outputs(
    defs: &[OutputDef],
    live: &HashMap<String, BTreeMap<String, Value>>,
    announced: &mut HashSet<String>,
) {
    let lookup = |r: &Reference| live.get(&r.resource)?.get(&r.output).cloned();
    for def in defs {
        if announced.contains(&def.name) {
            continue;
        }
        if let Ok(value) = def.value.resolve(&lookup) {
            debug!("Output {} = {value}", def.name);
            announced.insert(def.name.clone());
        }
    }
}

/// Resolves stack outputs against committed state.
fn resolve_outputs(
    defs: &[OutputDef],
    snapshot: &StateSnapshot,
) -> (BTreeMap<String, Value>, Vec<String>) {
    let lookup = |r: &Reference| snapshot.get(&r.resource)?.output(&r.output).cloned();
    let mut outputs = BTreeMap::new();
    let mut pending = Vec::new();

    for def in defs {
        match def.value.resolve(&lookup) {
            Ok(value) => {
                outputs.insert(def.name.clone(), value);
            }
            Err(_) => pending.push(def.name.clone()),
        }
    }
    (outputs, pending)
}

impl ActionReport {
    fn pending(action: &Action) -> Self {
        Self {
            id: action.id.clone(),
            kind: action.kind,
            status: ActionStatus::Pending,
            physical_id: None,
            error: None,
            rollback_error: None,
        }
    }
}

impl ApplyReport {
    /// Returns true if every action applied and nothing was cancelled.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.cancelled
            && self.inconsistent.is_empty()
            && self
                .actions
                .iter()
                .all(|a| a.status == ActionStatus::Applied)
    }

    /// Process exit code: 0 on success, 3 if rollback left resources
    /// inconsistent, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if !self.inconsistent.is_empty() {
            3
        } else if self.success() {
            0
        } else {
            1
        }
    }

    /// Number of actions with `status`.
    #[must_use]
    pub fn count(&self, status: ActionStatus) -> usize {
        self.actions.iter().filter(|a| a.status == status).count()
    }

    /// Looks up the report for a resource.
    #[must_use]
    pub fn action(&self, id: &str) -> Option<&ActionReport> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Ids of resources the run changed or attempted to change.
    #[must_use]
    pub fn touched(&self) -> Vec<String> {
        self.actions
            .iter()
            .filter(|a| a.kind != ActionKind::NoOp && a.status != ActionStatus::Skipped)
            .map(|a| a.id.clone())
            .collect()
    }

    /// First failure message, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        if self.cancelled {
            return Some("cancelled");
        }
        self.actions.iter().find_map(|a| a.error.as_deref())
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RolledBack => "rolled back",
            Self::RollbackFailed => "rollback failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{FakeCloud, Op};
    use crate::model::{AttributeValue, DeploymentGraph, Resource};
    use crate::planner::{DependencyResolver, DiffEngine};
    use crate::state::MemoryStateStore;
    use serde_json::json;

    fn corpweb() -> DeploymentGraph {
        DeploymentGraph::new(
            vec![
                Resource::new("vpc", "network")
                    .with_attribute("cidr", AttributeValue::literal("10.0.0.0/16")),
                Resource::new("web_sg", "security_group")
                    .with_attribute("network", AttributeValue::reference("vpc", "id")),
                Resource::new("web1", "instance")
                    .with_attribute("network", AttributeValue::reference("vpc", "id"))
                    .with_attribute("image", AttributeValue::literal("ubuntu-24.04"))
                    .with_attribute("instance_type", AttributeValue::literal("t3.small"))
                    .depends_on("web_sg"),
            ],
            vec![OutputDef {
                name: String::from("network_id"),
                value: AttributeValue::reference("vpc", "id"),
                description: None,
            }],
        )
        .unwrap()
    }

    fn settings() -> ExecutionConfig {
        ExecutionConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 10,
            ..ExecutionConfig::default()
        }
    }

    fn with_attribute(graph: &DeploymentGraph, id: &str, name: &str, value: Value) -> DeploymentGraph {
        let resources = graph
            .resources()
            .iter()
            .cloned()
            .map(|r| {
                if r.id == id {
                    r.with_attribute(name, AttributeValue::literal(value.clone()))
                } else {
                    r
                }
            })
            .collect();
        DeploymentGraph::new(resources, graph.outputs().to_vec()).unwrap()
    }

    async fn plan(cloud: &FakeCloud, store: &MemoryStateStore, graph: &DeploymentGraph) -> Plan {
        let registry = cloud.registry();
        let order = DependencyResolver::new().resolve(graph).unwrap();
        let snapshot = store.load().await.unwrap();
        DiffEngine::new(&registry).plan(graph, &order, &snapshot).unwrap()
    }

    async fn run(
        cloud: &FakeCloud,
        store: &MemoryStateStore,
        plan: &Plan,
        settings: &ExecutionConfig,
    ) -> ApplyReport {
        let registry = cloud.registry();
        let snapshot = store.load().await.unwrap();
        PlanExecutor::new(&registry, store, settings)
            .execute(plan, &snapshot)
            .await
            .unwrap()
    }

    async fn apply(cloud: &FakeCloud, store: &MemoryStateStore, graph: &DeploymentGraph) -> ApplyReport {
        let plan = plan(cloud, store, graph).await;
        run(cloud, store, &plan, &settings()).await
    }

    fn statuses(report: &ApplyReport) -> Vec<(&str, ActionStatus)> {
        report
            .actions
            .iter()
            .map(|a| (a.id.as_str(), a.status))
            .collect()
    }

    #[tokio::test]
    async fn test_apply_creates_in_dependency_order() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");

        let report = apply(&cloud, &store, &corpweb()).await;
        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            cloud.log(),
            [
                "create network network-1",
                "create security_group security_group-2",
                "create instance instance-3",
            ]
        );

        let state = store.load().await.unwrap();
        assert_eq!(state.resources.len(), 3);
        let web1 = state.get("web1").unwrap();
        assert_eq!(web1.physical_id, "instance-3");
        assert_eq!(web1.attributes["network"], json!("network-1"));
        assert_eq!(web1.dependencies, ["web_sg", "vpc"]);
        assert_eq!(state.outputs["network_id"], json!("network-1"));
        assert_eq!(report.outputs["network_id"], json!("network-1"));

        let again = plan(&cloud, &store, &corpweb()).await;
        assert!(!again.has_changes());
        assert_eq!(again.summary().no_op, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_rolls_back_in_reverse() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.fail(Op::Create, "instance", 1, AdapterError::permanent("quota exceeded"));

        let report = apply(&cloud, &store, &corpweb()).await;
        assert_eq!(
            statuses(&report),
            [
                ("vpc", ActionStatus::RolledBack),
                ("web_sg", ActionStatus::RolledBack),
                ("web1", ActionStatus::Failed),
            ]
        );
        assert!(report.rolled_back);
        assert_eq!(report.exit_code(), 1);
        assert!(report.action("web1").unwrap().error.as_deref().unwrap().contains("quota exceeded"));
        assert_eq!(
            cloud.log()[3..],
            [
                "delete security_group security_group-2",
                "delete network network-1",
            ]
        );
        assert_eq!(cloud.live_count(), 0);

        let state = store.load().await.unwrap();
        assert!(state.is_empty());
        assert!(state.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_disabled_keeps_applied_resources() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.fail(Op::Create, "instance", 1, AdapterError::permanent("quota exceeded"));

        let plan = plan(&cloud, &store, &corpweb()).await;
        let settings = ExecutionConfig {
            rollback: RollbackPolicy::None,
            ..settings()
        };
        let report = run(&cloud, &store, &plan, &settings).await;

        assert_eq!(
            statuses(&report),
            [
                ("vpc", ActionStatus::Applied),
                ("web_sg", ActionStatus::Applied),
                ("web1", ActionStatus::Failed),
            ]
        );
        assert!(!report.rolled_back);
        assert_eq!(report.exit_code(), 1);

        let state = store.load().await.unwrap();
        assert!(state.get("vpc").is_some());
        assert!(state.get("web_sg").is_some());
        assert!(state.get("web1").is_none());
        assert_eq!(report.outputs["network_id"], json!("network-1"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.fail(Op::Create, "network", 2, AdapterError::transient("503 Service Unavailable"));

        let report = apply(&cloud, &store, &corpweb()).await;
        assert!(report.success());
        let failures = cloud.log().iter().filter(|l| *l == "failed network").count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.fail(Op::Create, "network", 10, AdapterError::transient("429 Too Many Requests"));

        let report = apply(&cloud, &store, &corpweb()).await;
        assert_eq!(
            statuses(&report),
            [
                ("vpc", ActionStatus::Failed),
                ("web_sg", ActionStatus::Skipped),
                ("web1", ActionStatus::Skipped),
            ]
        );
        assert_eq!(cloud.log(), ["failed network"; 3]);
        assert!(!report.rolled_back);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.fail(Op::Create, "network", 10, AdapterError::permanent("invalid cidr"));

        let report = apply(&cloud, &store, &corpweb()).await;
        assert_eq!(report.count(ActionStatus::Failed), 1);
        assert_eq!(cloud.log(), ["failed network"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.delay("network", Duration::from_secs(5));

        let plan = plan(&cloud, &store, &corpweb()).await;
        let settings = ExecutionConfig {
            action_timeout_secs: 1,
            max_attempts: 2,
            ..settings()
        };
        let report = run(&cloud, &store, &plan, &settings).await;

        let vpc = report.action("vpc").unwrap();
        assert_eq!(vpc.status, ActionStatus::Failed);
        assert!(vpc.error.as_deref().unwrap().contains("timed out"));
        assert!(cloud.log().is_empty());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_resource_is_deleted_last() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        apply(&cloud, &store, &graph).await;

        let smaller = DeploymentGraph::new(graph.resources()[..2].to_vec(), vec![]).unwrap();
        let plan = plan(&cloud, &store, &smaller).await;
        assert_eq!(
            plan.kinds(),
            [
                ("vpc", ActionKind::NoOp),
                ("web_sg", ActionKind::NoOp),
                ("web1", ActionKind::Delete),
            ]
        );

        let report = run(&cloud, &store, &plan, &settings()).await;
        assert!(report.success());
        assert_eq!(cloud.log().last().unwrap(), "delete instance instance-3");
        assert!(store.load().await.unwrap().get("web1").is_none());
        assert!(report.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_replace_creates_before_destroying() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        apply(&cloud, &store, &corpweb()).await;

        let changed = with_attribute(&corpweb(), "web1", "image", json!("debian-13"));
        let replace = plan(&cloud, &store, &changed).await;
        assert_eq!(replace.action("web1").unwrap().steps, [Step::Create, Step::DeletePrior]);
        let report = run(&cloud, &store, &replace, &settings()).await;

        assert!(report.success());
        assert_eq!(
            cloud.log()[3..],
            ["create instance instance-4", "delete instance instance-3"]
        );
        let state = store.load().await.unwrap();
        assert_eq!(state.get("web1").unwrap().physical_id, "instance-4");
        assert_eq!(cloud.live("instance"), ["instance-4"]);

        let again = plan(&cloud, &store, &changed).await;
        assert!(!again.has_changes());
    }

    #[tokio::test]
    async fn test_failed_replacement_restores_prior_objects() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        apply(&cloud, &store, &corpweb()).await;

        // New cidr replaces the network, and with it every dependent.
        let changed = with_attribute(&corpweb(), "vpc", "cidr", json!("10.1.0.0/16"));
        cloud.fail(Op::Create, "instance", 1, AdapterError::permanent("quota exceeded"));
        let plan = plan(&cloud, &store, &changed).await;
        let report = run(&cloud, &store, &plan, &settings()).await;

        assert_eq!(
            statuses(&report),
            [
                ("vpc", ActionStatus::RolledBack),
                ("web_sg", ActionStatus::RolledBack),
                ("web1", ActionStatus::Failed),
            ]
        );
        assert_eq!(
            cloud.log()[3..],
            [
                "delete instance instance-3",
                "delete security_group security_group-2",
                "delete network network-1",
                "create network network-4",
                "create security_group security_group-5",
                "failed instance",
                "delete security_group security_group-5",
                "delete network network-4",
                "create network network-6",
                "create security_group security_group-7",
                "create instance instance-8",
            ]
        );

        let state = store.load().await.unwrap();
        assert_eq!(state.get("vpc").unwrap().physical_id, "network-6");
        assert_eq!(state.get("vpc").unwrap().attributes["cidr"], json!("10.0.0.0/16"));
        assert_eq!(state.get("web_sg").unwrap().physical_id, "security_group-7");
        assert_eq!(state.get("web1").unwrap().physical_id, "instance-8");
        assert_eq!(cloud.live_count(), 3);
    }

    #[tokio::test]
    async fn test_replaced_network_outlives_its_dependents() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        apply(&cloud, &store, &corpweb()).await;

        let changed = with_attribute(&corpweb(), "vpc", "cidr", json!("10.1.0.0/16"));
        let report = apply(&cloud, &store, &changed).await;

        assert!(report.success());
        assert_eq!(
            cloud.log()[3..],
            [
                "delete instance instance-3",
                "delete security_group security_group-2",
                "delete network network-1",
                "create network network-4",
                "create security_group security_group-5",
                "create instance instance-6",
            ]
        );
        assert_eq!(report.action("web1").unwrap().physical_id.as_deref(), Some("instance-6"));
        assert_eq!(cloud.live_count(), 3);

        let state = store.load().await.unwrap();
        assert_eq!(state.get("web1").unwrap().attributes["network"], json!("network-4"));
    }

    #[tokio::test]
    async fn test_failed_teardown_restores_removed_dependents() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        apply(&cloud, &store, &corpweb()).await;

        let changed = with_attribute(&corpweb(), "vpc", "cidr", json!("10.1.0.0/16"));
        cloud.fail(Op::Delete, "network", 1, AdapterError::permanent("network in use"));
        let report = apply(&cloud, &store, &changed).await;

        assert_eq!(
            statuses(&report),
            [
                ("vpc", ActionStatus::Failed),
                ("web_sg", ActionStatus::RolledBack),
                ("web1", ActionStatus::RolledBack),
            ]
        );
        assert_eq!(
            cloud.log()[3..],
            [
                "delete instance instance-3",
                "delete security_group security_group-2",
                "create security_group security_group-4",
                "create instance instance-5",
            ]
        );
        assert_eq!(cloud.live("network"), ["network-1"]);
        assert_eq!(cloud.live_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_update_is_reverted() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        let mut graph = corpweb();
        graph = with_attribute(&graph, "web_sg", "description", json!("web"));
        apply(&cloud, &store, &graph).await;

        let changed = with_attribute(&graph, "web_sg", "description", json!("web tier"));
        let changed = with_attribute(&changed, "web1", "instance_type", json!("t3.large"));
        cloud.fail(Op::Update, "instance", 1, AdapterError::permanent("conflict"));
        let plan = plan(&cloud, &store, &changed).await;
        let report = run(&cloud, &store, &plan, &settings()).await;

        assert_eq!(report.action("web_sg").unwrap().status, ActionStatus::RolledBack);
        let state = store.load().await.unwrap();
        let sg = state.get("web_sg").unwrap();
        assert_eq!(sg.attributes["description"], json!("web"));
        assert_eq!(
            cloud.attributes(&sg.physical_id).unwrap()["description"],
            json!("web")
        );
    }

    #[tokio::test]
    async fn test_rollback_failure_is_reported() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.fail(Op::Create, "instance", 1, AdapterError::permanent("quota exceeded"));
        cloud.fail(Op::Delete, "security_group", 10, AdapterError::permanent("in use"));

        let report = apply(&cloud, &store, &corpweb()).await;
        assert_eq!(report.action("web_sg").unwrap().status, ActionStatus::RollbackFailed);
        assert_eq!(report.action("vpc").unwrap().status, ActionStatus::RolledBack);
        assert_eq!(report.exit_code(), 3);
        assert_eq!(report.inconsistent.len(), 1);
        assert_eq!(report.inconsistent[0].id, "web_sg");
        assert_eq!(
            report.inconsistent[0].physical_id.as_deref(),
            Some("security_group-2")
        );
        assert!(store.load().await.unwrap().get("web_sg").is_some());
    }

    #[tokio::test]
    async fn test_destroy_deletes_dependents_first() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        apply(&cloud, &store, &corpweb()).await;

        let registry = cloud.registry();
        let snapshot = store.load().await.unwrap();
        let plan = DiffEngine::new(&registry).plan_destroy(&snapshot).unwrap();
        let report = run(&cloud, &store, &plan, &settings()).await;

        assert!(report.success());
        assert_eq!(
            cloud.log()[3..],
            [
                "delete instance instance-3",
                "delete security_group security_group-2",
                "delete network network-1",
            ]
        );
        let state = store.load().await.unwrap();
        assert!(state.is_empty());
        assert!(state.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        apply(&cloud, &store, &corpweb()).await;
        cloud.fail(Op::Delete, "instance", 1, AdapterError::not_found("404 Not Found"));

        let registry = cloud.registry();
        let snapshot = store.load().await.unwrap();
        let plan = DiffEngine::new(&registry).plan_destroy(&snapshot).unwrap();
        let report = run(&cloud, &store, &plan, &settings()).await;

        assert!(report.success());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_skips_everything() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        let plan = plan(&cloud, &store, &corpweb()).await;

        let (handle, signal) = cancel_pair();
        handle.cancel();
        let registry = cloud.registry();
        let settings = settings();
        let snapshot = store.load().await.unwrap();
        let report = PlanExecutor::new(&registry, &store, &settings)
            .with_cancel(signal)
            .execute(&plan, &snapshot)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.count(ActionStatus::Skipped), 3);
        assert_eq!(report.exit_code(), 1);
        assert!(cloud.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_in_flight_then_rolls_back() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.delay("network", Duration::from_secs(10));
        let plan = plan(&cloud, &store, &corpweb()).await;

        let (handle, signal) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });

        let registry = cloud.registry();
        let settings = settings();
        let snapshot = store.load().await.unwrap();
        let report = PlanExecutor::new(&registry, &store, &settings)
            .with_cancel(signal)
            .execute(&plan, &snapshot)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(
            statuses(&report),
            [
                ("vpc", ActionStatus::RolledBack),
                ("web_sg", ActionStatus::Skipped),
                ("web1", ActionStatus::Skipped),
            ]
        );
        assert_eq!(
            cloud.log(),
            ["create network network-1", "delete network network-1"]
        );
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_runs_independent_actions_together() {
        let cloud = FakeCloud::new();
        let store = MemoryStateStore::new("corpweb", "dev");
        cloud.delay("network", Duration::from_secs(10));
        let graph = DeploymentGraph::new(
            vec![
                Resource::new("vpc_a", "network")
                    .with_attribute("cidr", AttributeValue::literal("10.0.0.0/16")),
                Resource::new("vpc_b", "network")
                    .with_attribute("cidr", AttributeValue::literal("10.1.0.0/16")),
                Resource::new("sg_a", "security_group")
                    .with_attribute("network", AttributeValue::reference("vpc_a", "id")),
            ],
            vec![],
        )
        .unwrap();
        let plan = plan(&cloud, &store, &graph).await;
        let settings = ExecutionConfig {
            parallelism: 4,
            ..settings()
        };

        let started = tokio::time::Instant::now();
        let report = run(&cloud, &store, &plan, &settings).await;

        assert!(report.success());
        assert!(started.elapsed() < Duration::from_secs(15));
        let log = cloud.log();
        assert_eq!(log.len(), 3);
        assert!(log[2].starts_with("create security_group"));
        let state = store.load().await.unwrap();
        let network = &state.get("sg_a").unwrap().attributes["network"];
        assert_eq!(*network, json!(state.get("vpc_a").unwrap().physical_id));
    }
}
