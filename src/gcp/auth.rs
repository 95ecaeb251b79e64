//! GCP Authentication
//!
//! Bearer tokens come from Application Default Credentials through
//! `gcp_auth`. The engine only sees the [`TokenSource`] trait, so the
//! credential itself stays opaque.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// OAuth scopes requested for every token
pub const DEFAULT_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Tokens are replaced this long before the assumed expiry
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Assumed token lifetime; ADC tokens live for an hour
const TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Anything that can hand out a bearer token for API calls
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Application Default Credentials with a shared token cache.
///
/// Many detail calls start at once when a query fans out; the mutex makes
/// them wait for one refresh instead of each minting a token.
#[derive(Clone)]
pub struct GcpCredentials {
    provider: Arc<dyn TokenProvider>,
    cached: Arc<Mutex<Option<CachedToken>>>,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

impl GcpCredentials {
    pub async fn new() -> Result<Self> {
        let provider = gcp_auth::provider().await.context(
            "Failed to initialize GCP authentication. Run 'gcloud auth application-default login'",
        )?;

        Ok(Self {
            provider,
            cached: Arc::new(Mutex::new(None)),
        })
    }

    async fn fresh_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if Instant::now() < c.refresh_at {
                return Ok(c.token.clone());
            }
            tracing::debug!("Access token due for refresh");
        }

        let token = self
            .provider
            .token(DEFAULT_SCOPES)
            .await
            .context("Failed to get access token")?;

        let lifetime = TOKEN_TTL.saturating_sub(TOKEN_EXPIRY_BUFFER);
        tracing::debug!("New access token, refreshing in {:?}", lifetime);

        let value = token.as_str().to_string();
        *cached = Some(CachedToken {
            token: value.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(value)
    }
}

#[async_trait]
impl TokenSource for GcpCredentials {
    async fn token(&self) -> Result<String> {
        self.fresh_token().await
    }
}

/// Fixed token, for emulators and tests
#[derive(Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Validate a GCP project ID format
/// Project IDs must be 6-30 characters, lowercase letters, digits, and hyphens
/// Must start with a letter and cannot end with a hyphen
pub fn validate_project_id(project: &str) -> bool {
    if project.len() < 6 || project.len() > 30 {
        return false;
    }

    match project.chars().next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }

    if project.ends_with('-') {
        return false;
    }

    project
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_project_id() {
        assert!(validate_project_id("my-project-123"));
        assert!(!validate_project_id("short"));
        assert!(!validate_project_id("1starts-with-digit"));
        assert!(!validate_project_id("ends-with-hyphen-"));
        assert!(!validate_project_id("Has-Upper-Case"));
    }

    #[tokio::test]
    async fn test_static_token() {
        let source = StaticToken("abc".to_string());
        assert_eq!(source.token().await.unwrap(), "abc");
    }
}
