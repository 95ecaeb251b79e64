//! GCP Client
//!
//! Main client for interacting with GCP APIs, combining a token source,
//! the HTTP layer and the configured endpoint base URLs.

use super::auth::TokenSource;
use super::http::GcpHttpClient;
use crate::config::Endpoints;
use crate::error::HydrateError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Main GCP client
#[derive(Clone)]
pub struct GcpClient {
    credentials: Arc<dyn TokenSource>,
    http: GcpHttpClient,
    endpoints: Endpoints,
}

impl GcpClient {
    pub fn new(
        credentials: Arc<dyn TokenSource>,
        endpoints: Endpoints,
        request_timeout: Duration,
    ) -> Result<Self, HydrateError> {
        Ok(Self {
            credentials,
            http: GcpHttpClient::new(request_timeout)?,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Get the current access token.
    ///
    /// A credential that cannot mint a token is reported as a permission failure.
    pub async fn get_token(&self) -> Result<String, HydrateError> {
        self.credentials
            .token()
            .await
            .map_err(|e| HydrateError::permission_denied(format!("no access token: {e:#}")))
    }

    /// Make a GET request to a GCP API
    pub async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, HydrateError> {
        let token = self.get_token().await?;
        self.http.get(url, &token, query).await
    }

    // =========================================================================
    // Resource Manager API helpers
    // =========================================================================

    /// Build Resource Manager API URL
    pub fn resourcemanager_url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.endpoints.resourcemanager, path)
    }
}
