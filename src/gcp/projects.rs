//! GCP Projects
//!
//! Project discovery through the Resource Manager API. Every project the
//! credential can see and that is `ACTIVE` becomes a scope.

use super::client::GcpClient;
use crate::engine::retry::{retry_call, RetryPolicy};
use crate::error::QueryError;
use crate::resource::fetcher::next_page_token;
use crate::scope::{ResourceScope, ScopeEnumerator};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tokio_util::sync::CancellationToken;

/// Project information
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub project_number: String,
    pub lifecycle_state: String,
}

impl From<&Value> for Project {
    fn from(value: &Value) -> Self {
        let field = |key: &str, default: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        Self {
            project_id: field("projectId", "-"),
            name: field("name", "-"),
            project_number: field("projectNumber", "-"),
            lifecycle_state: field("lifecycleState", "UNKNOWN"),
        }
    }
}

impl Project {
    pub fn is_active(&self) -> bool {
        self.lifecycle_state == "ACTIVE"
    }
}

/// One page of the projects listing
#[derive(Debug, Clone, Default)]
pub struct ProjectPage {
    pub projects: Vec<Project>,
    pub next_page_token: Option<String>,
}

/// List one page of accessible GCP projects
pub async fn list_projects_page(
    client: &GcpClient,
    page_token: Option<&str>,
) -> Result<ProjectPage, crate::error::HydrateError> {
    let url = client.resourcemanager_url("projects");
    let query: Vec<(&str, &str)> = page_token
        .map(|t| vec![("pageToken", t)])
        .unwrap_or_default();
    let response = client.get(&url, &query).await?;

    let projects = response
        .get("projects")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(Project::from).collect())
        .unwrap_or_default();

    Ok(ProjectPage {
        projects,
        next_page_token: next_page_token(&response),
    })
}

/// Discovers scopes by paging through the projects listing
#[derive(Clone)]
pub struct ProjectEnumerator {
    client: GcpClient,
    retry: RetryPolicy,
}

impl ProjectEnumerator {
    pub fn new(client: GcpClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

struct DiscoveryState {
    client: GcpClient,
    retry: RetryPolicy,
    cancel: CancellationToken,
    buffer: VecDeque<ResourceScope>,
    seen: HashSet<String>,
    next_page: Option<String>,
    finished: bool,
}

impl ScopeEnumerator for ProjectEnumerator {
    fn enumerate(
        &self,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<ResourceScope, QueryError>> {
        let state = DiscoveryState {
            client: self.client.clone(),
            retry: self.retry.clone(),
            cancel,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            next_page: None,
            finished: false,
        };

        stream::unfold(state, |mut st| async move {
            loop {
                if let Some(scope) = st.buffer.pop_front() {
                    return Some((Ok(scope), st));
                }
                if st.finished {
                    return None;
                }

                let token = st.next_page.clone();
                let page = retry_call(&st.retry, &st.cancel, |_| {
                    list_projects_page(&st.client, token.as_deref())
                })
                .await;

                match page {
                    Ok(page) => {
                        tracing::debug!("Discovered {} projects", page.projects.len());
                        for project in page.projects.into_iter().filter(Project::is_active) {
                            if st.seen.insert(project.project_id.clone()) {
                                st.buffer.push_back(ResourceScope::project(project.project_id));
                            }
                        }
                        st.finished = page.next_page_token.is_none();
                        st.next_page = page.next_page_token;
                    }
                    Err(failure) => {
                        st.finished = true;
                        tracing::error!("Project discovery failed: {}", failure);
                        return Some((Err(QueryError::AuthError(failure.to_string())), st));
                    }
                }
            }
        })
        .boxed()
    }
}
