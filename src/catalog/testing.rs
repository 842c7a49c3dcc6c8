//! In-process fake provider for executor and engine tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::adapter::{ApplyOutcome, ResourceAdapter};
use super::kinds::ResourceKind;
use super::registry::AdapterRegistry;
use super::schema::TypeSchema;
use crate::error::AdapterError;
use crate::model::ResolvedAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
}

#[derive(Debug)]
struct FailRule {
    op: Op,
    type_name: String,
    remaining: usize,
    error: AdapterError,
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: u64,
    objects: BTreeMap<String, (String, ResolvedAttributes)>,
    log: Vec<String>,
    rules: Vec<FailRule>,
    delays: BTreeMap<String, Duration>,
}

/// Shared fake cloud; every adapter built from it records into one log.
#[derive(Debug, Default, Clone)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind backed by this cloud.
    pub fn registry(&self) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for kind in ResourceKind::ALL {
            registry.register(Arc::new(FakeAdapter {
                schema: kind.schema(),
                cloud: self.clone(),
            }));
        }
        registry
    }

    /// Fails the next `times` calls of `op` on `type_name` with `error`.
    pub fn fail(&self, op: Op, type_name: &str, times: usize, error: AdapterError) {
        self.state.lock().unwrap().rules.push(FailRule {
            op,
            type_name: type_name.to_string(),
            remaining: times,
            error,
        });
    }

    /// Delays every call on `type_name`.
    pub fn delay(&self, type_name: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(type_name.to_string(), delay);
    }

    /// Physical ids of live objects of `type_name`.
    pub fn live(&self, type_name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(_, (t, _))| t == type_name)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Attributes of a live object.
    pub fn attributes(&self, physical_id: &str) -> Option<ResolvedAttributes> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(physical_id)
            .map(|(_, a)| a.clone())
    }

    /// Every call made, e.g. `create network network-1`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    fn take_failure(&self, op: Op, type_name: &str) -> Option<AdapterError> {
        let mut state = self.state.lock().unwrap();
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.op == op && r.type_name == type_name && r.remaining > 0)?;
        rule.remaining -= 1;
        Some(rule.error.clone())
    }

    fn delay_for(&self, type_name: &str) -> Option<Duration> {
        self.state.lock().unwrap().delays.get(type_name).copied()
    }
}

#[derive(Debug)]
struct FakeAdapter {
    schema: TypeSchema,
    cloud: FakeCloud,
}

#[async_trait]
impl ResourceAdapter for FakeAdapter {
    fn schema(&self) -> &TypeSchema {
        &self.schema
    }

    async fn apply(
        &self,
        physical_id: Option<&str>,
        attributes: &ResolvedAttributes,
    ) -> Result<ApplyOutcome, AdapterError> {
        let type_name = self.schema.type_name.clone();
        if let Some(delay) = self.cloud.delay_for(&type_name) {
            tokio::time::sleep(delay).await;
        }

        let op = if physical_id.is_some() { Op::Update } else { Op::Create };
        if let Some(err) = self.cloud.take_failure(op, &type_name) {
            self.cloud
                .state
                .lock()
                .unwrap()
                .log
                .push(format!("failed {type_name}"));
            return Err(err);
        }

        let mut state = self.cloud.state.lock().unwrap();
        let id = match physical_id {
            Some(id) => {
                if !state.objects.contains_key(id) {
                    return Err(AdapterError::not_found(format!("{id} does not exist")));
                }
                state.log.push(format!("update {type_name} {id}"));
                id.to_string()
            }
            None => {
                state.next_id += 1;
                let id = format!("{type_name}-{}", state.next_id);
                state.log.push(format!("create {type_name} {id}"));
                id
            }
        };
        state
            .objects
            .insert(id.clone(), (type_name.clone(), attributes.clone()));

        let mut outputs = BTreeMap::new();
        if type_name == "load_balancer" {
            outputs.insert(
                String::from("dns_name"),
                serde_json::Value::String(format!("{id}.lb.example.net")),
            );
        }
        Ok(ApplyOutcome::new(id, outputs))
    }

    async fn delete(&self, physical_id: &str) -> Result<(), AdapterError> {
        let type_name = self.schema.type_name.clone();
        if let Some(delay) = self.cloud.delay_for(&type_name) {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.cloud.take_failure(Op::Delete, &type_name) {
            return Err(err);
        }

        let mut state = self.cloud.state.lock().unwrap();
        if state.objects.remove(physical_id).is_none() {
            return Err(AdapterError::not_found(format!("{physical_id} does not exist")));
        }
        state.log.push(format!("delete {type_name} {physical_id}"));
        Ok(())
    }
}
