//! Configuration Management
//!
//! Engine options for gcptables. Every field has a default so an empty or
//! missing config file yields a working engine.

use crate::error::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rate-limit budget applied per (scope, resource kind)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained refill rate
    pub requests_per_second: f64,
    /// Maximum tokens available at once
    pub burst: u32,
    /// How long a call may wait for a token before giving up
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl RateLimitConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Nanoseconds between refilled tokens; non-positive rates fall back to 1/s
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn interval_nanos(&self) -> u64 {
        let rate = if self.requests_per_second > 0.0 {
            self.requests_per_second
        } else {
            1.0
        };
        ((1_000_000_000.0 / rate) as u64).max(1)
    }

    /// How far ahead of schedule a full burst may run, in nanoseconds.
    /// `None` when that window does not fit in a `u64`.
    pub fn burst_tolerance_nanos(&self) -> Option<u64> {
        self.interval_nanos()
            .checked_mul(u64::from(self.burst.max(1) - 1))
    }
}

/// Exponential backoff parameters for retryable failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Jitter factor in [0.0, 1.0]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.1,
        }
    }
}

/// API base URLs, overridable for private endpoints and tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub compute: String,
    pub storage: String,
    pub container: String,
    pub resourcemanager: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            compute: "https://compute.googleapis.com".to_string(),
            storage: "https://storage.googleapis.com".to_string(),
            container: "https://container.googleapis.com".to_string(),
            resourcemanager: "https://cloudresourcemanager.googleapis.com".to_string(),
        }
    }
}

impl Endpoints {
    /// Point every service at the same base URL
    pub fn all(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            compute: base.clone(),
            storage: base.clone(),
            container: base.clone(),
            resourcemanager: base,
        }
    }

    /// Look up a service base URL by template placeholder name
    pub fn get(&self, service: &str) -> Option<&str> {
        match service {
            "compute" => Some(&self.compute),
            "storage" => Some(&self.storage),
            "container" => Some(&self.container),
            "resourcemanager" => Some(&self.resourcemanager),
            _ => None,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum in-flight detail calls per query
    pub max_concurrency: usize,
    /// Maximum scopes listed at the same time per query
    pub max_list_concurrency: usize,
    /// Listing stops for a scope once this many items were collected
    pub item_cap_per_scope: usize,
    /// Overall query deadline, checked at each phase transition
    pub query_deadline_ms: Option<u64>,
    /// Per-call network timeout
    pub request_timeout_ms: u64,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Static project list; empty means discover projects
    pub projects: Vec<String>,
    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_list_concurrency: 4,
            item_cap_per_scope: 5_000,
            query_deadline_ms: None,
            request_timeout_ms: 30_000,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            projects: Vec::new(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        let dir = dirs::config_dir()?.join("gcptables");
        ["config.json", "config.yaml", "config.yml"]
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
    }

    /// Load configuration from an explicit path, or the default location.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config = Self::parse(&content, &path)?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_str(content).context("Failed to parse YAML config")
        } else {
            serde_json::from_str(content).context("Failed to parse JSON config")
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrency",
            });
        }
        if self.max_list_concurrency == 0 {
            return Err(ConfigError::Zero {
                field: "max_list_concurrency",
            });
        }
        if self.item_cap_per_scope == 0 {
            return Err(ConfigError::Zero {
                field: "item_cap_per_scope",
            });
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::Zero {
                field: "rate_limit.burst",
            });
        }
        if !(self.rate_limit.requests_per_second > 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "rate_limit.requests_per_second",
                reason: "must be positive".to_string(),
            });
        }
        if self.rate_limit.burst_tolerance_nanos().is_none() {
            return Err(ConfigError::OutOfRange {
                field: "rate_limit.burst",
                reason: "burst window at this requests_per_second is too long".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "retry.max_attempts",
            });
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "retry.multiplier",
                reason: "must be at least 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::OutOfRange {
                field: "retry.jitter",
                reason: "must be within [0.0, 1.0]".to_string(),
            });
        }
        for service in ["compute", "storage", "container", "resourcemanager"] {
            let base = self.endpoints.get(service).unwrap_or_default();
            match url::Url::parse(base) {
                Ok(u) if matches!(u.scheme(), "http" | "https") => {}
                Ok(u) => {
                    return Err(ConfigError::OutOfRange {
                        field: "endpoints",
                        reason: format!("{service}: unsupported scheme {}", u.scheme()),
                    })
                }
                Err(e) => {
                    return Err(ConfigError::OutOfRange {
                        field: "endpoints",
                        reason: format!("{service}: {e}"),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn query_deadline(&self) -> Option<Duration> {
        self.query_deadline_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
