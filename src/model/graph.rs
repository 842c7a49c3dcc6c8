//! The deployment graph: resources, their bindings and stack outputs.
//!
//! Building a graph is pure; nothing here talks to a provider or a store.

use std::collections::HashMap;

use crate::config::DeploymentFile;
use crate::error::{ConfigError, GraphError, Result};

use super::value::{AttributeValue, Attributes};

/// A desired resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Logical identifier, unique within the deployment.
    pub id: String,
    /// Type tag from the catalog.
    pub resource_type: String,
    /// Declared attributes.
    pub attributes: Attributes,
    /// Explicit dependencies.
    pub depends_on: Vec<String>,
}

/// A named stack output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDef {
    /// Output name.
    pub name: String,
    /// Expression to resolve after apply.
    pub value: AttributeValue,
    /// Human-readable description.
    pub description: Option<String>,
}

/// All resources and outputs of one deployment, in input order.
#[derive(Debug, Clone, Default)]
pub struct DeploymentGraph {
    resources: Vec<Resource>,
    outputs: Vec<OutputDef>,
    index: HashMap<String, usize>,
}

impl Resource {
    /// Creates a resource with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Returns every resource this one depends on.
    ///
    /// Explicit dependencies come first, then referenced resources in
    /// attribute order; duplicates are dropped.
    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();

        for dep in &self.depends_on {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }

        for value in self.attributes.values() {
            for reference in value.references() {
                if reference.resource != self.id && !deps.contains(&reference.resource) {
                    deps.push(reference.resource.clone());
                }
            }
        }

        deps
    }

    /// Returns true if an attribute references this resource itself.
    #[must_use]
    pub fn references_self(&self) -> bool {
        self.attributes
            .values()
            .flat_map(AttributeValue::references)
            .any(|r| r.resource == self.id)
    }
}

impl DeploymentGraph {
    /// Builds a graph from resources and outputs.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if two resources share an identifier.
    pub fn new(resources: Vec<Resource>, outputs: Vec<OutputDef>) -> std::result::Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(resources.len());

        for (i, resource) in resources.iter().enumerate() {
            if index.insert(resource.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateId {
                    id: resource.id.clone(),
                });
            }
        }

        Ok(Self {
            resources,
            outputs,
            index,
        })
    }

    /// Builds a graph from a parsed deployment file.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed expressions or duplicate identifiers.
    pub fn from_config(file: &DeploymentFile) -> Result<Self> {
        let mut resources = Vec::with_capacity(file.resources.len());

        for declared in &file.resources {
            let mut resource = Resource::new(&declared.id, &declared.resource_type);
            resource.depends_on.clone_from(&declared.depends_on);

            for (name, raw) in &declared.attributes {
                let value = AttributeValue::parse(raw).map_err(|message| {
                    ConfigError::InvalidExpression {
                        resource: format!("{}.{name}", declared.id),
                        message,
                    }
                })?;
                resource.attributes.insert(name.clone(), value);
            }

            resources.push(resource);
        }

        let mut outputs = Vec::with_capacity(file.outputs.len());
        for (name, declared) in &file.outputs {
            let value = AttributeValue::parse(&declared.value).map_err(|message| {
                ConfigError::InvalidExpression {
                    resource: format!("outputs.{name}"),
                    message,
                }
            })?;
            outputs.push(OutputDef {
                name: name.clone(),
                value,
                description: declared.description.clone(),
            });
        }

        Ok(Self::new(resources, outputs)?)
    }

    /// Returns the resources in input order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Returns the stack outputs.
    #[must_use]
    pub fn outputs(&self) -> &[OutputDef] {
        &self.outputs
    }

    /// Looks up a resource by logical identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    /// Returns true if the graph declares `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::KeelError;

    #[test]
    fn test_dependencies_merge_explicit_and_references() {
        let resource = Resource::new("web1", "instance")
            .with_attribute("network", AttributeValue::reference("vpc", "id"))
            .with_attribute(
                "security_groups",
                AttributeValue::List(vec![AttributeValue::reference("web_sg", "id")]),
            )
            .depends_on("vpc");

        assert_eq!(resource.dependencies(), vec!["vpc", "web_sg"]);
        assert!(!resource.references_self());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = DeploymentGraph::new(
            vec![Resource::new("vpc", "network"), Resource::new("vpc", "network")],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateId { id } if id == "vpc"));
    }

    #[test]
    fn test_from_config() {
        let file = ConfigParser::new()
            .parse_yaml(
                r#"
deployment: { name: corpweb }
resources:
  - id: vpc
    type: network
    attributes: { cidr: 10.0.0.0/18 }
  - id: lb
    type: load_balancer
    attributes: { network: "${vpc.id}" }
outputs:
  url:
    value: "http://${lb.dns_name}"
"#,
                None,
            )
            .unwrap();

        let graph = DeploymentGraph::from_config(&file).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get("lb").unwrap().dependencies(), vec!["vpc"]);
        assert_eq!(graph.outputs()[0].value.references().len(), 1);
    }

    #[test]
    fn test_from_config_bad_expression() {
        let file = ConfigParser::new()
            .parse_yaml(
                r#"
deployment: { name: corpweb }
resources:
  - id: lb
    type: load_balancer
    attributes: { network: "${vpc}" }
"#,
                None,
            )
            .unwrap();

        let err = DeploymentGraph::from_config(&file).unwrap_err();
        assert!(matches!(
            err,
            KeelError::Config(ConfigError::InvalidExpression { ref resource, .. })
                if resource == "lb.network"
        ));
    }
}
