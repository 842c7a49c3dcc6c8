//! Run orchestration.
//!
//! Ties the resolver, diff engine, executor and state store together for one
//! deployment. `apply` and `destroy` hold the deployment lock from before
//! state is loaded until the run is recorded, and release it on every path.
//! While the run is in flight the lock is refreshed every
//! [`LOCK_REFRESH_INTERVAL`] so long applies never outlive it.

use serde::Serialize;
use std::convert::Infallible;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::catalog::AdapterRegistry;
use crate::config::ExecutionConfig;
use crate::error::Result;
use crate::model::DeploymentGraph;
use crate::planner::{
    ActionKind, ApplyReport, AttributeChange, CancelSignal, DependencyResolver, DiffEngine, Plan,
    PlanExecutor,
};
use crate::state::{
    LOCK_REFRESH_INTERVAL, RunHistoryEntry, StateSnapshot, StateStore, generate_holder_id,
};

/// Runs plans for one deployment.
pub struct Engine<'a> {
    graph: &'a DeploymentGraph,
    registry: &'a AdapterRegistry,
    store: &'a dyn StateStore,
    settings: &'a ExecutionConfig,
    cancel: Option<CancelSignal>,
}

/// Result of `apply` or `destroy`.
#[derive(Debug)]
pub struct RunResult {
    /// The plan that was computed.
    pub plan: Plan,
    /// Execution report; `None` when the plan was not approved.
    pub report: Option<ApplyReport>,
}

/// A resource whose recorded state no longer matches the deployment file.
#[derive(Debug, Clone, Serialize)]
pub struct DriftedResource {
    /// Logical identifier.
    pub id: String,
    /// Action a plan would take.
    pub action: ActionKind,
    /// Why.
    pub reason: String,
    /// Changed attributes.
    pub changes: Vec<AttributeChange>,
}

/// Drift between the deployment file and recorded state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Drifted resources, in plan order.
    pub resources: Vec<DriftedResource>,
    /// Number of resources in sync.
    pub in_sync: usize,
}

impl<'a> Engine<'a> {
    /// Creates an engine.
    #[must_use]
    pub const fn new(
        graph: &'a DeploymentGraph,
        registry: &'a AdapterRegistry,
        store: &'a dyn StateStore,
        settings: &'a ExecutionConfig,
    ) -> Self {
        Self {
            graph,
            registry,
            store,
            settings,
            cancel: None,
        }
    }

    /// Forwards `signal` to the executor.
    #[must_use]
    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Computes the converging plan against the current state.
    ///
    /// Does not take the lock.
    ///
    /// # Errors
    ///
    /// Returns graph errors (cycle, unknown reference or type, validation)
    /// or state errors.
    pub async fn plan(&self) -> Result<Plan> {
        let snapshot = self.store.load().await?;
        self.plan_against(&snapshot)
    }

    fn plan_against(&self, snapshot: &StateSnapshot) -> Result<Plan> {
        let order = DependencyResolver::new().resolve(self.graph)?;
        let plan = DiffEngine::new(self.registry).plan(self.graph, &order, snapshot)?;
        Ok(plan)
    }

    /// Plans and, if `approve` accepts the plan, executes it.
    ///
    /// # Errors
    ///
    /// Returns planning and state errors, including a lock held by another
    /// process. Failed actions are reported in the [`ApplyReport`].
    pub async fn apply<F>(&self, approve: F) -> Result<RunResult>
    where
        F: FnOnce(&Plan) -> bool,
    {
        self.locked(|snapshot| self.plan_against(snapshot), approve)
            .await
    }

    /// Plans the deletion of every recorded resource and, if approved,
    /// executes it.
    ///
    /// # Errors
    ///
    /// Returns planning and state errors, including a lock held by another
    /// process.
    pub async fn destroy<F>(&self, approve: F) -> Result<RunResult>
    where
        F: FnOnce(&Plan) -> bool,
    {
        self.locked(
            |snapshot| Ok(DiffEngine::new(self.registry).plan_destroy(snapshot)?),
            approve,
        )
        .await
    }

    /// Reports resources whose planned action is not a no-op.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Engine::plan`].
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let plan = self.plan().await?;
        let mut report = DriftReport::default();

        for action in plan.actions {
            if action.kind == ActionKind::NoOp {
                report.in_sync += 1;
            } else {
                report.resources.push(DriftedResource {
                    id: action.id,
                    action: action.kind,
                    reason: action.reason,
                    changes: action.changes,
                });
            }
        }

        debug!(
            "Drift check: {} drifted, {} in sync",
            report.resources.len(),
            report.in_sync
        );
        Ok(report)
    }

    async fn locked<P, F>(&self, make_plan: P, approve: F) -> Result<RunResult>
    where
        P: FnOnce(&StateSnapshot) -> Result<Plan>,
        F: FnOnce(&Plan) -> bool,
    {
        let holder = generate_holder_id();
        let lock = self.store.acquire_lock(&holder).await?;
        debug!("Acquired lock {} as {holder}", lock.lock_id);

        let result = tokio::select! {
            result = self.run(make_plan, approve) => result,
            never = self.keep_lock_alive(&lock.lock_id) => match never {},
        };

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release lock {}: {e}", lock.lock_id);
        }
        result
    }

    /// Refreshes the lock until dropped.
    async fn keep_lock_alive(&self, lock_id: &str) -> Infallible {
        let mut ticks = tokio::time::interval_at(
            Instant::now() + LOCK_REFRESH_INTERVAL,
            LOCK_REFRESH_INTERVAL,
        );
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            match self.store.refresh_lock(lock_id).await {
                Ok(lock) => debug!("Refreshed lock {lock_id} until {}", lock.expires_at),
                Err(e) => warn!("Failed to refresh lock {lock_id}: {e}"),
            }
        }
    }

    async fn run<P, F>(&self, make_plan: P, approve: F) -> Result<RunResult>
    where
        P: FnOnce(&StateSnapshot) -> Result<Plan>,
        F: FnOnce(&Plan) -> bool,
    {
        let snapshot = self.store.load().await?;
        let plan = make_plan(&snapshot)?;

        if plan.has_changes() && !approve(&plan) {
            info!("Plan not approved, nothing applied");
            return Ok(RunResult { plan, report: None });
        }

        let mut executor = PlanExecutor::new(self.registry, self.store, self.settings);
        if let Some(signal) = &self.cancel {
            executor = executor.with_cancel(signal.clone());
        }
        let report = executor.execute(&plan, &snapshot).await?;

        if plan.has_changes() {
            let entry = RunHistoryEntry::new(
                plan.operation,
                report.touched(),
                report.success(),
                report.first_error().map(String::from),
            );
            self.store.record_run(entry).await?;
        }

        Ok(RunResult {
            plan,
            report: Some(report),
        })
    }
}

impl DriftReport {
    /// Returns true if any resource drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{FakeCloud, Op};
    use crate::error::{AdapterError, GraphError, KeelError, StateError};
    use crate::model::{AttributeValue, Resource};
    use crate::planner::ActionStatus;
    use crate::state::{MemoryStateStore, RunOperation};
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
                    .with_attribute("instance_type", AttributeValue::literal("t3.small")),
            ],
            vec![],
        )
        .unwrap()
    }

    fn settings() -> ExecutionConfig {
        ExecutionConfig {
            base_backoff_ms: 1,
            ..ExecutionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_apply_records_history_and_releases_lock() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        let settings = settings();
        let engine = Engine::new(&graph, &registry, &store, &settings);

        let result = engine.apply(|_| true).await.unwrap();
        assert_eq!(result.report.unwrap().exit_code(), 0);
        assert!(!store.is_locked().await.unwrap());

        let state = store.load().await.unwrap();
        let run = state.last_run().unwrap();
        assert_eq!(run.operation, RunOperation::Apply);
        assert!(run.success);
        assert_eq!(run.resources, ["vpc", "web_sg", "web1"]);

        // Converged: nothing to approve, nothing recorded.
        let again = engine.apply(|_| panic!("no changes to approve")).await.unwrap();
        assert!(!again.plan.has_changes());
        assert_eq!(store.load().await.unwrap().history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_apply_keeps_lock_past_expiry() {
        let cloud = FakeCloud::new();
        cloud.delay("network", std::time::Duration::from_secs(400));
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        let settings = settings();
        let engine = Engine::new(&graph, &registry, &store, &settings);

        let observe = async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let first = store.get_lock_info().await.unwrap().unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(349)).await;
            let second = store.get_lock_info().await.unwrap().unwrap();
            let contender = store.acquire_lock("laptop").await;
            (first, second, contender)
        };
        let (result, (first, second, contender)) = tokio::join!(engine.apply(|_| true), observe);

        assert_eq!(result.unwrap().report.unwrap().exit_code(), 0);
        assert_eq!(first.lock_id, second.lock_id);
        assert!(second.expires_at > first.expires_at);
        assert!(matches!(
            contender,
            Err(KeelError::State(StateError::LockedByOther { .. }))
        ));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_declined_plan_applies_nothing() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        let settings = settings();

        let result = Engine::new(&graph, &registry, &store, &settings)
            .apply(|plan| {
                assert_eq!(plan.summary().create, 3);
                false
            })
            .await
            .unwrap();

        assert!(result.report.is_none());
        assert!(cloud.log().is_empty());
        assert!(!store.exists().await.unwrap());
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_apply_is_recorded() {
        let cloud = FakeCloud::new();
        cloud.fail(Op::Create, "instance", 1, AdapterError::permanent("quota exceeded"));
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        let settings = settings();

        let result = Engine::new(&graph, &registry, &store, &settings)
            .apply(|_| true)
            .await
            .unwrap();
        let report = result.report.unwrap();
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.action("vpc").unwrap().status, ActionStatus::RolledBack);

        let state = store.load().await.unwrap();
        assert!(state.is_empty());
        let run = state.last_run().unwrap();
        assert!(!run.success);
        assert!(run.error.as_deref().unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_planning_error_releases_lock() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = DeploymentGraph::new(
            vec![
                Resource::new("a", "network")
                    .with_attribute("cidr", AttributeValue::literal("10.0.0.0/16"))
                    .depends_on("b"),
                Resource::new("b", "network")
                    .with_attribute("cidr", AttributeValue::literal("10.1.0.0/16"))
                    .depends_on("a"),
            ],
            vec![],
        )
        .unwrap();
        let settings = settings();

        let err = Engine::new(&graph, &registry, &store, &settings)
            .apply(|_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Graph(GraphError::Cycle { .. })));
        assert!(err.is_planning_error());
        assert!(!store.is_locked().await.unwrap());
        assert!(cloud.log().is_empty());
    }

    #[tokio::test]
    async fn test_apply_refuses_when_locked() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        let settings = settings();
        store.acquire_lock("someone-else").await.unwrap();

        let err = Engine::new(&graph, &registry, &store, &settings)
            .apply(|_| true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KeelError::State(StateError::LockedByOther { ref holder, .. }) if holder == "someone-else"
        ));
        assert!(cloud.log().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_empties_state() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        let settings = settings();
        let engine = Engine::new(&graph, &registry, &store, &settings);
        engine.apply(|_| true).await.unwrap();

        let result = engine.destroy(|plan| plan.summary().delete == 3).await.unwrap();
        assert!(result.report.unwrap().success());
        assert_eq!(cloud.live_count(), 0);

        let state = store.load().await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.last_run().unwrap().operation, RunOperation::Destroy);
    }

    #[tokio::test]
    async fn test_drift_lists_changed_resources() {
        let cloud = FakeCloud::new();
        let registry = cloud.registry();
        let store = MemoryStateStore::new("corpweb", "dev");
        let graph = corpweb();
        let settings = settings();
        Engine::new(&graph, &registry, &store, &settings)
            .apply(|_| true)
            .await
            .unwrap();

        let changed = DeploymentGraph::new(
            graph
                .resources()
                .iter()
                .cloned()
                .map(|r| {
                    if r.id == "web1" {
                        r.with_attribute("instance_type", AttributeValue::literal(json!("t3.large")))
                    } else {
                        r
                    }
                })
                .collect(),
            vec![],
        )
        .unwrap();

        let drift = Engine::new(&changed, &registry, &store, &settings)
            .check_drift()
            .await
            .unwrap();
        assert!(drift.has_drift());
        assert_eq!(drift.in_sync, 2);
        assert_eq!(drift.resources[0].id, "web1");
        assert_eq!(drift.resources[0].action, ActionKind::Update);
        assert_eq!(drift.resources[0].changes[0].name, "instance_type");
    }
}
