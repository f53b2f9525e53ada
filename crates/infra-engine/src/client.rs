//! Typed HTTP client for the registry control channel.
//!
//! Engines authenticate with their connector access key on every call. The
//! channel carries three operations: destination registration, the role
//! pull, and the JWKS fetch backing the proxy's verifier.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use infra_common::api::{
    CreateDestinationRequest, CreateDestinationResponse, JsonWebKeySet, ListRolesResponse,
};
use infra_common::Id;

use crate::error::{Error, Result};

/// Timeout for registry calls.
const REGISTRY_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    access_key: String,
}

impl RegistryClient {
    /// Build a client for `registry_url` (scheme optional, https assumed).
    ///
    /// `insecure_skip_verify` disables certificate verification for
    /// registries with self-signed certificates; never use it outside of
    /// development.
    pub fn new(registry_url: &str, access_key: &str, insecure_skip_verify: bool) -> Result<Self> {
        let base_url = if registry_url.contains("://") {
            registry_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", registry_url.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(REGISTRY_HTTP_TIMEOUT)
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(|e| Error::config(format!("failed to build registry client: {e}")))?;
        Ok(RegistryClient {
            http,
            base_url,
            access_key: access_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Register or refresh this cluster's destination record.
    pub async fn register_destination(&self, request: &CreateDestinationRequest) -> Result<Id> {
        let response = self
            .http
            .post(self.url("/destinations"))
            .bearer_auth(&self.access_key)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::registry(format!("destination registration failed: {e}")))?;
        let response = check_status(response).await?;
        let body: CreateDestinationResponse = response
            .json()
            .await
            .map_err(|e| Error::registry(format!("invalid registration response: {e}")))?;
        debug!(destination_id = %body.id, "registered destination");
        Ok(body.id)
    }

    /// Pull the destination's projected roles with the sync cursor.
    pub async fn list_roles(&self, destination_id: Id, since: i64) -> Result<ListRolesResponse> {
        let response = self
            .http
            .get(self.url(&format!("/destinations/{destination_id}/roles")))
            .query(&[("since", since.to_string())])
            .bearer_auth(&self.access_key)
            .send()
            .await
            .map_err(|e| Error::registry(format!("role pull failed: {e}")))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::registry(format!("invalid roles response: {e}")))
    }

    /// Fetch the registry's published signing keys.
    pub async fn fetch_jwks(&self) -> Result<JsonWebKeySet> {
        let response = self
            .http
            .get(self.url("/.well-known/jwks.json"))
            .send()
            .await
            .map_err(|e| Error::registry(format!("JWKS fetch failed: {e}")))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::registry(format!("invalid JWKS response: {e}")))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::unauthorized(format!(
            "registry rejected the engine credential: {status}"
        ))),
        _ => Err(Error::registry(format!("registry returned {status}: {body}"))),
    }
}
