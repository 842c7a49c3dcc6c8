//! Lookup table from type tag to adapter.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::adapter::ResourceAdapter;
use super::kinds::{ProviderAdapter, ResourceKind};
use crate::provider::ProviderClient;

/// Registry of resource adapters keyed by type name.
#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ResourceAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in kind.
    ///
    /// Without a client the registry can still validate and plan.
    #[must_use]
    pub fn builtin(client: Option<&ProviderClient>) -> Self {
        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            registry.register(Arc::new(ProviderAdapter::new(kind, client.cloned())));
        }
        registry
    }

    /// Registers an adapter, replacing any adapter for the same type.
    pub fn register(&mut self, adapter: Arc<dyn ResourceAdapter>) {
        let name = adapter.type_name().to_string();
        debug!("Registering adapter for type '{name}'");
        self.adapters.insert(name, adapter);
    }

    /// Looks up the adapter for a type.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn ResourceAdapter>> {
        self.adapters.get(type_name)
    }

    /// Returns true if a type is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.adapters.contains_key(type_name)
    }

    /// Returns the registered type names, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = AdapterRegistry::builtin(None);
        assert_eq!(
            registry.types(),
            vec!["instance", "load_balancer", "network", "security_group", "target_group"]
        );
        assert!(registry.contains("network"));
        assert!(registry.get("dns_record").is_none());
        assert_eq!(registry.get("instance").unwrap().type_name(), "instance");
    }
}
