//! Provider API client.
//!
//! A thin REST client: `POST /v1/resources/{type}` creates,
//! `PUT /v1/resources/{type}/{id}` updates, `DELETE /v1/resources/{type}/{id}`
//! deletes. Failures are classified into transient, permanent and not-found
//! adapter errors; retries are left to the executor.

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ProviderConfig;
use crate::error::{AdapterError, ConfigError, KeelError, Result};
use crate::model::ResolvedAttributes;

use super::types::{ProviderErrorBody, ProviderResource, ResourceRequest};

/// Provider API client.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: Client,
    endpoint: String,
    region: Option<String>,
    token: Option<String>,
}

impl ProviderClient {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| KeelError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: None,
            token,
        })
    }

    /// Creates a client from the `provider` section of a deployment file.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured.
    pub fn from_config(config: &ProviderConfig, token: Option<String>) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            KeelError::Config(ConfigError::MissingEnvVar {
                name: crate::config::PROVIDER_ENDPOINT_VAR.to_string(),
            })
        })?;

        let mut client = Self::new(endpoint, token, config.timeout_secs)?;
        client.region.clone_from(&config.region);
        Ok(client)
    }

    /// Sets the region sent with every request.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Returns the endpoint base URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// Returns a classified adapter error on failure.
    pub async fn create(
        &self,
        resource_type: &str,
        attributes: &ResolvedAttributes,
    ) -> std::result::Result<ProviderResource, AdapterError> {
        let url = format!("{}/v1/resources/{resource_type}", self.endpoint);
        let body = ResourceRequest {
            region: self.region.as_deref(),
            attributes,
        };
        let response = Self::send(self.request(Method::POST, &url).json(&body)).await?;
        Self::parse_resource(response).await
    }

    /// Updates a resource in place.
    ///
    /// # Errors
    ///
    /// Returns a classified adapter error on failure.
    pub async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        attributes: &ResolvedAttributes,
    ) -> std::result::Result<ProviderResource, AdapterError> {
        let url = format!("{}/v1/resources/{resource_type}/{physical_id}", self.endpoint);
        let body = ResourceRequest {
            region: self.region.as_deref(),
            attributes,
        };
        let response = Self::send(self.request(Method::PUT, &url).json(&body)).await?;
        Self::parse_resource(response).await
    }

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// Returns a classified adapter error on failure; a missing resource is
    /// reported as not-found.
    pub async fn delete(
        &self,
        resource_type: &str,
        physical_id: &str,
    ) -> std::result::Result<(), AdapterError> {
        let url = format!("{}/v1/resources/{resource_type}/{physical_id}", self.endpoint);
        Self::send(self.request(Method::DELETE, &url)).await?;
        Ok(())
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        trace!("{method} {url}");
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");

        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends a request, mapping transport failures and error statuses.
    async fn send(builder: RequestBuilder) -> std::result::Result<Response, AdapterError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::transient(format!("Provider request timed out: {e}"))
            } else {
                AdapterError::transient(format!("Provider request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ProviderErrorBody>(&body)
            .map_or(body, |parsed| parsed.message);

        debug!("Provider returned {status}: {message}");
        Err(classify_status(status, &message, retry_after.as_deref()))
    }

    async fn parse_resource(
        response: Response,
    ) -> std::result::Result<ProviderResource, AdapterError> {
        response.json().await.map_err(|e| {
            AdapterError::permanent(format!("Invalid provider response: {e}"))
        })
    }
}

/// Maps an HTTP error status to an adapter error.
///
/// 429 and 5xx are transient; 404 is not-found; everything else is permanent.
#[must_use]
pub fn classify_status(status: StatusCode, message: &str, retry_after: Option<&str>) -> AdapterError {
    let code = status.as_u16();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let hint = retry_after.map_or_else(String::new, |s| format!(", retry after {s}s"));
            AdapterError::transient(format!("Rate limited ({code}){hint}: {message}"))
        }
        StatusCode::NOT_FOUND => AdapterError::not_found(format!("Not found ({code}): {message}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::permanent(format!("Authentication failed ({code}): {message}"))
        }
        s if s.is_server_error() => {
            AdapterError::transient(format!("Provider error ({code}): {message}"))
        }
        _ => AdapterError::permanent(format!("Request rejected ({code}): {message}")),
    }
}
