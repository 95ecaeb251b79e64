//! Hydration engine
//!
//! Turns a decoded query (table, columns, qualifiers) into a stream of rows
//! and a terminal status. A query moves through
//! `Enumerating -> Listing -> Detailing -> Draining -> Done`, or ends in
//! `Failed` on a query-scoped error.
//!
//! # Module Structure
//!
//! - [`scheduler`] - Per-query state machine and fan-out
//! - [`limiter`] - Process-wide rate budgets per (scope, resource kind)
//! - [`retry`] - Exponential backoff for transient failures
//! - [`cache`] - Per-query single-flight cache of hydrate results

pub mod cache;
pub mod limiter;
pub mod retry;
mod scheduler;

use crate::config::Config;
use crate::error::{CallFailure, ErrorKind, QueryError};
use crate::resource::{ColumnValue, Qualifier, ResourceClients, SchemaRegistry};
use crate::scope::{ResourceScope, ScopeEnumerator};
use limiter::RateLimiter;
use retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Rows buffered between the engine and a collecting caller
const COLLECT_CHANNEL_CAPACITY: usize = 64;

/// A decoded query from the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub table: String,
    /// Columns to project; empty means all columns
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, alias = "qualifiers")]
    pub quals: Vec<Qualifier>,
}

impl QueryRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn qual(mut self, qual: Qualifier) -> Self {
        self.quals.push(qual);
        self
    }
}

/// Query lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Enumerating,
    Listing,
    Detailing,
    Draining,
    Done,
    Failed,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Enumerating => "enumerating",
            Self::Listing => "listing",
            Self::Detailing => "detailing",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A recorded item- or scope-scoped failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub resource_kind: String,
    pub scope: ResourceScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hydrate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub attempts: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn from_failure(
        failure: &CallFailure,
        resource_kind: &str,
        scope: &ResourceScope,
        hydrate: &str,
        item_id: Option<&str>,
    ) -> Self {
        Self {
            kind: failure.kind(),
            resource_kind: resource_kind.to_string(),
            scope: scope.clone(),
            hydrate: Some(hydrate.to_string()),
            item_id: item_id.map(|s| s.to_string()),
            attempts: failure.attempts,
            message: failure.error.to_string(),
        }
    }
}

/// Row accumulator for one listed item.
///
/// Filled in as hydrates complete; turned into a [`Row`] once every
/// required hydrate has finished, successfully or not.
#[derive(Debug, Clone)]
pub struct ResourceItem {
    pub scope: ResourceScope,
    pub id: String,
    /// Listing payload
    pub base: Value,
    /// Detail payloads by hydrate name
    pub details: BTreeMap<String, Value>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ResourceItem {
    pub fn new(scope: ResourceScope, id: String, base: Value) -> Self {
        Self {
            scope,
            id,
            base,
            details: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }
}

/// One output row: projected cells in request order
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub scope: ResourceScope,
    pub item_id: String,
    pub cells: Vec<(String, Option<ColumnValue>)>,
    /// Set when some hydrate failed and its columns were left null
    pub diagnostics: Vec<Diagnostic>,
}

impl Row {
    /// Value of a projected column; `None` when null or not projected
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, v)| v.as_ref())
    }

    pub fn is_partial(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Column map as JSON, nulls included
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .cells
            .iter()
            .map(|(name, v)| (name.clone(), v.as_ref().map_or(Value::Null, |v| v.to_json())))
            .collect();
        Value::Object(map)
    }
}

/// Terminal status of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    Done {
        table: String,
        rows: usize,
        /// Scope-level failures that reduced the result (e.g. a denied project)
        warnings: Vec<Diagnostic>,
    },
    Failed {
        table: String,
        error: QueryError,
        /// Rows emitted before the failure; they stay valid
        rows: usize,
        warnings: Vec<Diagnostic>,
    },
}

impl QueryStatus {
    pub fn rows(&self) -> usize {
        match self {
            Self::Done { rows, .. } | Self::Failed { rows, .. } => *rows,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Done { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        match self {
            Self::Done { warnings, .. } | Self::Failed { warnings, .. } => warnings,
        }
    }
}

/// Limits applied to each query
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_concurrency: usize,
    pub max_list_concurrency: usize,
    pub item_cap_per_scope: usize,
    pub query_deadline: Option<Duration>,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            max_list_concurrency: config.max_list_concurrency.max(1),
            item_cap_per_scope: config.item_cap_per_scope.max(1),
            query_deadline: config.query_deadline(),
        }
    }
}

/// Long-lived engine; each [`execute`](Self::execute) call is one query
pub struct HydrationEngine {
    registry: Arc<SchemaRegistry>,
    clients: Arc<dyn ResourceClients>,
    scopes: Arc<dyn ScopeEnumerator>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    settings: EngineSettings,
}

impl HydrationEngine {
    pub fn new(
        config: &Config,
        registry: Arc<SchemaRegistry>,
        clients: Arc<dyn ResourceClients>,
        scopes: Arc<dyn ScopeEnumerator>,
    ) -> Self {
        Self {
            registry,
            clients,
            scopes,
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            retry: RetryPolicy::from(&config.retry),
            settings: EngineSettings::from(config),
        }
    }

    /// Share an existing rate limiter (budgets are process-wide)
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run one query, sending rows to `sink` as they complete.
    ///
    /// Rows already sent stay valid even if the query later fails. A dropped
    /// receiver is treated like cancellation.
    pub async fn execute(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
        sink: mpsc::Sender<Row>,
    ) -> QueryStatus {
        scheduler::run(self, request, cancel, sink).await
    }

    /// Run one query and gather its rows
    pub async fn collect(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> (Vec<Row>, QueryStatus) {
        let (tx, mut rx) = mpsc::channel(COLLECT_CHANNEL_CAPACITY);
        let gather = async {
            let mut rows = Vec::new();
            while let Some(row) = rx.recv().await {
                rows.push(row);
            }
            rows
        };
        let (status, rows) = tokio::join!(self.execute(request, cancel, tx), gather);
        (rows, status)
    }
}
