//! Built-in resource kinds.
//!
//! Each kind declares its metadata and a few structural checks; the provider
//! owns the real semantics. All kinds share one adapter implementation that
//! forwards to the provider API.

use async_trait::async_trait;
use serde_json::Value;

use super::adapter::{ApplyOutcome, ResourceAdapter};
use super::schema::TypeSchema;
use crate::error::{AdapterError, ValidationError};
use crate::model::{Attributes, ResolvedAttributes};
use crate::provider::ProviderClient;

/// Protocols accepted by listeners and target groups.
const PROTOCOLS: &[&str] = &["HTTP", "HTTPS", "TCP"];

/// Built-in resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Virtual network with subnets.
    Network,
    /// Firewall rules attached to a network.
    SecurityGroup,
    /// Load balancer fronting target groups.
    LoadBalancer,
    /// Set of instances receiving balanced traffic.
    TargetGroup,
    /// Compute instance.
    Instance,
}

impl ResourceKind {
    /// Every built-in kind.
    pub const ALL: [Self; 5] = [
        Self::Network,
        Self::SecurityGroup,
        Self::LoadBalancer,
        Self::TargetGroup,
        Self::Instance,
    ];

    /// Returns the type tag.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::SecurityGroup => "security_group",
            Self::LoadBalancer => "load_balancer",
            Self::TargetGroup => "target_group",
            Self::Instance => "instance",
        }
    }

    /// Parses a type tag.
    #[must_use]
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_name() == name)
    }

    /// Returns the static metadata for this kind.
    #[must_use]
    pub fn schema(self) -> TypeSchema {
        let schema = TypeSchema::new(self.type_name());
        match self {
            Self::Network => schema
                .required(&["cidr"])
                .replace_only(&["cidr", "subnets"])
                .outputs(&["id", "subnet_ids"]),
            Self::SecurityGroup => schema
                .required(&["network"])
                .replace_only(&["network"])
                .outputs(&["id"]),
            Self::LoadBalancer => schema
                .required(&["network"])
                .replace_only(&["network", "internet_facing"])
                .outputs(&["id", "dns_name", "arn"])
                .create_before_destroy(true),
            Self::TargetGroup => schema
                .required(&["network", "port", "protocol"])
                .replace_only(&["network", "port", "protocol"])
                .outputs(&["id", "arn"])
                .create_before_destroy(true),
            Self::Instance => schema
                .required(&["network", "image", "instance_type"])
                .replace_only(&["network", "image", "key_name", "user_data", "subnet_type"])
                .outputs(&["id", "private_ip", "public_ip"])
                .create_before_destroy(true),
        }
    }

    /// Kind-specific checks on literal attribute values.
    ///
    /// Values that are references are not known yet and are skipped.
    fn check_attributes(self, attributes: &Attributes) -> Result<(), String> {
        let literal = |name: &str| attributes.get(name).and_then(|v| v.as_literal());

        match self {
            Self::Network => {
                if let Some(subnets) = literal("subnets") {
                    for subnet in as_items(subnets, "subnets")? {
                        if let Some(mask) = subnet.get("cidr_mask") {
                            check_range(mask, "subnets[].cidr_mask", 16, 28)?;
                        }
                    }
                }
            }
            Self::SecurityGroup => {
                if let Some(ingress) = literal("ingress") {
                    for rule in as_items(ingress, "ingress")? {
                        let port = rule
                            .get("port")
                            .ok_or_else(|| String::from("ingress rule is missing 'port'"))?;
                        check_range(port, "ingress[].port", 1, 65_535)?;
                        if rule.get("source").is_none() {
                            return Err(String::from("ingress rule is missing 'source'"));
                        }
                    }
                }
            }
            Self::LoadBalancer => {
                if let Some(value) = literal("internet_facing") {
                    if !value.is_boolean() {
                        return Err(String::from("internet_facing must be a boolean"));
                    }
                }
            }
            Self::TargetGroup => {
                if let Some(port) = literal("port") {
                    check_range(port, "port", 1, 65_535)?;
                }
                if let Some(protocol) = literal("protocol") {
                    check_protocol(protocol)?;
                }
            }
            Self::Instance => {}
        }

        Ok(())
    }
}

fn as_items<'a>(value: &'a Value, name: &str) -> Result<&'a Vec<Value>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("{name} must be a list"))
}

fn check_range(value: &Value, name: &str, min: u64, max: u64) -> Result<(), String> {
    match value.as_u64() {
        Some(n) if (min..=max).contains(&n) => Ok(()),
        _ => Err(format!("{name} must be an integer in {min}..={max}, got {value}")),
    }
}

fn check_protocol(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some(p) if PROTOCOLS.contains(&p) => Ok(()),
        _ => Err(format!(
            "protocol must be one of {}, got {value}",
            PROTOCOLS.join("/")
        )),
    }
}

/// Adapter for a built-in kind backed by the provider API.
#[derive(Debug)]
pub struct ProviderAdapter {
    kind: ResourceKind,
    schema: TypeSchema,
    client: Option<ProviderClient>,
}

impl ProviderAdapter {
    /// Creates an adapter; without a client, `apply` and `delete` fail.
    #[must_use]
    pub fn new(kind: ResourceKind, client: Option<ProviderClient>) -> Self {
        Self {
            kind,
            schema: kind.schema(),
            client,
        }
    }

    fn client(&self) -> Result<&ProviderClient, AdapterError> {
        self.client.as_ref().ok_or_else(|| {
            AdapterError::permanent(format!(
                "no provider endpoint configured for {} (set provider.endpoint or {})",
                self.kind.type_name(),
                crate::config::PROVIDER_ENDPOINT_VAR
            ))
        })
    }
}

#[async_trait]
impl ResourceAdapter for ProviderAdapter {
    fn schema(&self) -> &TypeSchema {
        &self.schema
    }

    fn validate(&self, resource: &str, attributes: &Attributes) -> Result<(), ValidationError> {
        self.schema.check_required(resource, attributes)?;
        self.kind
            .check_attributes(attributes)
            .map_err(|message| ValidationError::new(resource, message))
    }

    async fn apply(
        &self,
        physical_id: Option<&str>,
        attributes: &ResolvedAttributes,
    ) -> Result<ApplyOutcome, AdapterError> {
        let client = self.client()?;
        let type_name = self.kind.type_name();

        let resource = match physical_id {
            None => client.create(type_name, attributes).await?,
            Some(id) => client.update(type_name, id, attributes).await?,
        };

        Ok(ApplyOutcome::new(resource.id, resource.outputs))
    }

    async fn delete(&self, physical_id: &str) -> Result<(), AdapterError> {
        self.client()?.delete(self.kind.type_name(), physical_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeValue;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn attrs(pairs: &[(&str, AttributeValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_type_names_round_trip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_type_name(kind.type_name()), Some(kind));
            assert_eq!(kind.schema().type_name, kind.type_name());
        }
        assert_eq!(ResourceKind::from_type_name("dns_record"), None);
    }

    #[test]
    fn test_replacement_metadata() {
        assert!(!ResourceKind::Network.schema().create_before_destroy);
        assert!(ResourceKind::Instance.schema().create_before_destroy);
        assert!(ResourceKind::Instance.schema().requires_replacement(&["image"]));
        assert!(!ResourceKind::Instance.schema().requires_replacement(&["tags"]));
    }

    #[test]
    fn test_security_group_rules() {
        let adapter = ProviderAdapter::new(ResourceKind::SecurityGroup, None);
        let good = attrs(&[
            ("network", AttributeValue::reference("vpc", "id")),
            (
                "ingress",
                AttributeValue::literal(json!([
                    {"port": 22, "source": "0.0.0.0/0"},
                    {"port": 80, "source": "0.0.0.0/0"}
                ])),
            ),
        ]);
        assert!(adapter.validate("web_sg", &good).is_ok());

        let bad = attrs(&[
            ("network", AttributeValue::reference("vpc", "id")),
            ("ingress", AttributeValue::literal(json!([{"port": 70000, "source": "x"}]))),
        ]);
        let err = adapter.validate("web_sg", &bad).unwrap_err();
        assert_eq!(err.resource, "web_sg");
        assert!(err.message.contains("ingress[].port"));

        let no_source = attrs(&[
            ("network", AttributeValue::reference("vpc", "id")),
            ("ingress", AttributeValue::literal(json!([{"port": 22}]))),
        ]);
        assert!(adapter.validate("web_sg", &no_source).is_err());
    }

    #[test]
    fn test_target_group_protocol_and_port() {
        let adapter = ProviderAdapter::new(ResourceKind::TargetGroup, None);
        let mut declared = attrs(&[
            ("network", AttributeValue::reference("vpc", "id")),
            ("port", AttributeValue::literal(80)),
            ("protocol", AttributeValue::literal("HTTP")),
        ]);
        assert!(adapter.validate("tg", &declared).is_ok());

        declared.insert("protocol".into(), AttributeValue::literal("UDP"));
        assert!(adapter.validate("tg", &declared).is_err());

        declared.insert("protocol".into(), AttributeValue::reference("cfg", "protocol"));
        declared.insert("port".into(), AttributeValue::literal(0));
        assert!(adapter.validate("tg", &declared).is_err());
    }

    #[test]
    fn test_network_subnet_mask() {
        let adapter = ProviderAdapter::new(ResourceKind::Network, None);
        let declared = attrs(&[
            ("cidr", AttributeValue::literal("10.0.0.0/18")),
            (
                "subnets",
                AttributeValue::literal(json!([{"type": "public", "cidr_mask": 30}])),
            ),
        ]);
        assert!(adapter.validate("vpc", &declared).is_err());
    }

    #[test]
    fn test_missing_required() {
        let adapter = ProviderAdapter::new(ResourceKind::Instance, None);
        let declared = attrs(&[("image", AttributeValue::literal("ubuntu-22.04"))]);
        let err = adapter.validate("web1", &declared).unwrap_err();
        assert!(err.message.contains("network"));
        assert!(err.message.contains("instance_type"));
    }

    #[tokio::test]
    async fn test_apply_without_client_is_permanent() {
        let adapter = ProviderAdapter::new(ResourceKind::Network, None);
        let err = adapter.apply(None, &ResolvedAttributes::new()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_apply_forwards_to_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources/load_balancer"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "lb-1",
                "outputs": {"dns_name": "lb-1.example.net"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/load_balancer/lb-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ProviderClient::new(&server.uri(), None, 5).unwrap();
        let adapter = ProviderAdapter::new(ResourceKind::LoadBalancer, Some(client));

        let outcome = adapter.apply(None, &ResolvedAttributes::new()).await.unwrap();
        assert_eq!(outcome.physical_id, "lb-1");
        assert_eq!(outcome.outputs["dns_name"], json!("lb-1.example.net"));
        assert_eq!(outcome.outputs["id"], json!("lb-1"));

        adapter.delete("lb-1").await.unwrap();
    }
}
