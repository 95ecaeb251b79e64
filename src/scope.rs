//! Scopes
//!
//! A scope is the authorization boundary resources are listed in: a GCP
//! project, optionally narrowed to one location.

use crate::error::QueryError;
use crate::gcp::auth::validate_project_id;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Location placeholder GCP list APIs accept for "every location"
pub const ALL_LOCATIONS: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceScope {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ResourceScope {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Location used when filling URL templates
    pub fn location_or_all(&self) -> &str {
        self.location.as_deref().unwrap_or(ALL_LOCATIONS)
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}/{}", self.project_id, location),
            None => f.write_str(&self.project_id),
        }
    }
}

/// Source of the scopes a query runs against.
///
/// The returned stream is lazy and finite: pulling it is what triggers
/// discovery calls, and it cannot be restarted. Scopes are yielded once each.
pub trait ScopeEnumerator: Send + Sync {
    fn enumerate(&self, cancel: CancellationToken)
        -> BoxStream<'static, Result<ResourceScope, QueryError>>;
}

/// Fixed list of projects from configuration; no discovery calls
#[derive(Debug, Clone, Default)]
pub struct StaticScopes {
    scopes: Vec<ResourceScope>,
}

impl StaticScopes {
    pub fn new<I, S>(projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let scopes = projects
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| {
                if !validate_project_id(p) {
                    tracing::warn!("Ignoring invalid project id in config: {}", p);
                    return false;
                }
                true
            })
            .filter(|p| seen.insert(p.clone()))
            .map(ResourceScope::project)
            .collect();
        Self { scopes }
    }

    pub fn from_scopes(scopes: Vec<ResourceScope>) -> Self {
        let mut seen = HashSet::new();
        Self {
            scopes: scopes.into_iter().filter(|s| seen.insert(s.clone())).collect(),
        }
    }
}

impl ScopeEnumerator for StaticScopes {
    fn enumerate(
        &self,
        _cancel: CancellationToken,
    ) -> BoxStream<'static, Result<ResourceScope, QueryError>> {
        stream::iter(self.scopes.clone().into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_scopes_dedup_and_validate() {
        let scopes = StaticScopes::new(["alpha-project", "bad", "alpha-project", "beta-project"]);
        let collected: Vec<_> = scopes
            .enumerate(CancellationToken::new())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|s| s.unwrap().project_id)
            .collect();
        assert_eq!(collected, vec!["alpha-project", "beta-project"]);
    }

    #[test]
    fn test_scope_display() {
        let scope = ResourceScope::project("alpha-project").with_location("us-east1-b");
        assert_eq!(scope.to_string(), "alpha-project/us-east1-b");
        assert_eq!(ResourceScope::project("p").location_or_all(), "-");
    }
}
