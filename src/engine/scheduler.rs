//! Hydration scheduler
//!
//! Runs one query through its phases. Listing fans out over scopes, detail
//! hydrates fan out over items, and rows come back out in scope order then
//! listing order.

use super::cache::{CacheKey, CachedResult, RowCache};
use super::retry::retry_call;
use super::{Diagnostic, HydrationEngine, QueryPhase, QueryRequest, QueryStatus, ResourceItem, Row};
use crate::error::{HydrateError, QueryError};
use crate::resource::fetcher::item_identity;
use crate::resource::value::json_path;
use crate::resource::{
    ColumnSource, ColumnSpec, ColumnValue, ItemRef, Qualifier, ResourceClient, ScopeField,
    TableSchema, LIST_HYDRATE,
};
use crate::scope::ResourceScope;
use futures::future::join_all;
use futures::stream::{self, FuturesOrdered, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Hydrated items kept waiting for emission, per detail permit
const REORDER_FACTOR: usize = 64;

pub(super) async fn run(
    engine: &HydrationEngine,
    request: QueryRequest,
    cancel: CancellationToken,
    sink: mpsc::Sender<Row>,
) -> QueryStatus {
    let id = Uuid::new_v4();
    let cancel = cancel.child_token();
    tracing::info!(
        "Query {} on {}: {} columns, {} qualifiers",
        id,
        request.table,
        request.columns.len(),
        request.quals.len()
    );

    let mut progress = Progress::new(id, engine.settings.query_deadline, cancel.clone());
    let mut outcome = Outcome::default();

    let result = match QueryRun::new(engine, &request, cancel) {
        Ok(run) => {
            let result = run.drive(&mut progress, &mut outcome, &sink).await;
            tracing::debug!(
                "Query {} made {} hydrate computations",
                id,
                run.cache.computations()
            );
            run.cache.clear();
            result
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            progress.finish(QueryPhase::Done);
            QueryStatus::Done {
                table: request.table,
                rows: outcome.rows,
                warnings: outcome.warnings,
            }
        }
        Err(error) => {
            tracing::warn!("Query {} failed after {} rows: {}", id, outcome.rows, error);
            progress.finish(QueryPhase::Failed);
            QueryStatus::Failed {
                table: request.table,
                error,
                rows: outcome.rows,
                warnings: outcome.warnings,
            }
        }
    }
}

/// Phase bookkeeping; cancellation and the deadline are checked on every move
struct Progress {
    id: Uuid,
    phase: Option<QueryPhase>,
    started: Instant,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl Progress {
    fn new(id: Uuid, deadline: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            id,
            phase: None,
            started: Instant::now(),
            deadline,
            cancel,
        }
    }

    fn advance(&mut self, next: QueryPhase) -> Result<(), QueryError> {
        if self.cancel.is_cancelled() {
            return Err(QueryError::Canceled);
        }
        if let Some(limit) = self.deadline {
            if self.started.elapsed() >= limit {
                return Err(QueryError::DeadlineExceeded(limit));
            }
        }
        self.log(next);
        Ok(())
    }

    fn finish(&mut self, terminal: QueryPhase) {
        self.log(terminal);
    }

    fn log(&mut self, next: QueryPhase) {
        match self.phase {
            Some(prev) => tracing::info!(
                "Query {}: {} -> {} at {:?}",
                self.id,
                prev,
                next,
                self.started.elapsed()
            ),
            None => tracing::info!("Query {}: {}", self.id, next),
        }
        self.phase = Some(next);
    }
}

#[derive(Default)]
struct Outcome {
    rows: usize,
    warnings: Vec<Diagnostic>,
}

/// Items listed in one scope
struct ScopeListing {
    scope: ResourceScope,
    items: Vec<(String, Value)>,
    warning: Option<Diagnostic>,
}

/// Everything one query needs, resolved up front
struct QueryRun<'e> {
    engine: &'e HydrationEngine,
    schema: &'e TableSchema,
    client: Arc<dyn ResourceClient>,
    projected: Vec<&'e ColumnSpec>,
    /// Required hydrates other than the base listing
    detail_hydrates: Vec<String>,
    quals: Vec<(&'e ColumnSpec, Qualifier)>,
    pinned_projects: Option<Vec<String>>,
    pinned_locations: Option<Vec<String>>,
    cache: RowCache,
    permits: Semaphore,
    cancel: CancellationToken,
}

impl<'e> QueryRun<'e> {
    fn new(
        engine: &'e HydrationEngine,
        request: &QueryRequest,
        cancel: CancellationToken,
    ) -> Result<Self, QueryError> {
        let registry = &*engine.registry;
        let schema = registry.schema_for(&request.table)?;
        let projected = registry.resolve_columns(schema, &request.columns)?;
        let required = registry.required_hydrates(&request.table, &request.columns, &request.quals)?;

        let quals = request
            .quals
            .iter()
            .map(|q| {
                schema
                    .column(&q.column)
                    .map(|c| (c, q.clone()))
                    .ok_or_else(|| QueryError::UnknownColumn {
                        table: schema.name.clone(),
                        column: q.column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let detail_hydrates: Vec<String> =
            required.into_iter().filter(|h| h != LIST_HYDRATE).collect();
        tracing::debug!("Detail hydrates for {}: {:?}", schema.name, detail_hydrates);

        let client = engine.clients.client_for(schema)?;

        Ok(Self {
            engine,
            schema,
            client,
            projected,
            detail_hydrates,
            pinned_projects: pinned(&quals, ScopeField::Project),
            pinned_locations: pinned(&quals, ScopeField::Location),
            quals,
            cache: RowCache::new(),
            permits: Semaphore::new(engine.settings.max_concurrency),
            cancel,
        })
    }

    fn kind(&self) -> &str {
        &self.schema.name
    }

    async fn drive(
        &self,
        progress: &mut Progress,
        outcome: &mut Outcome,
        sink: &mpsc::Sender<Row>,
    ) -> Result<(), QueryError> {
        progress.advance(QueryPhase::Enumerating)?;
        let scopes = self.enumerate().await?;
        if scopes.is_empty() {
            tracing::info!("No scopes to query for {}", self.kind());
            return Ok(());
        }

        progress.advance(QueryPhase::Listing)?;
        let items = self.list(scopes, &mut outcome.warnings).await?;

        progress.advance(QueryPhase::Detailing)?;
        self.hydrate_and_emit(items, progress, outcome, sink).await
    }

    // --- Enumerating ---

    async fn enumerate(&self) -> Result<Vec<ResourceScope>, QueryError> {
        let mut discovered = self.engine.scopes.enumerate(self.cancel.clone());
        let mut scopes = Vec::new();
        let mut seen = HashSet::new();
        let mut pruned = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(QueryError::Canceled),
                next = discovered.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(scope)) => {
                    let narrowed = self.narrow_scope(scope);
                    if narrowed.is_empty() {
                        pruned += 1;
                    }
                    for scope in narrowed {
                        if seen.insert(scope.clone()) {
                            scopes.push(scope);
                        }
                    }
                }
            }
        }

        tracing::debug!("{} scopes ({} pruned by qualifiers)", scopes.len(), pruned);
        Ok(scopes)
    }

    /// Apply project/location qualifiers to a discovered scope.
    ///
    /// A scope outside the pinned projects is dropped. A scope without a
    /// location is split into one scope per pinned location; one with a
    /// location is kept only if that location is pinned.
    fn narrow_scope(&self, scope: ResourceScope) -> Vec<ResourceScope> {
        if let Some(projects) = &self.pinned_projects {
            if !projects.contains(&scope.project_id) {
                return Vec::new();
            }
        }

        let Some(locations) = &self.pinned_locations else {
            return vec![scope];
        };
        match &scope.location {
            Some(location) if locations.contains(location) => vec![scope],
            Some(_) => Vec::new(),
            None => locations
                .iter()
                .map(|l| scope.clone().with_location(l.clone()))
                .collect(),
        }
    }

    // --- Listing ---

    async fn list(
        &self,
        scopes: Vec<ResourceScope>,
        warnings: &mut Vec<Diagnostic>,
    ) -> Result<Vec<ResourceItem>, QueryError> {
        let listings = stream::iter(scopes)
            .map(|scope| self.list_scope(scope))
            .buffered(self.engine.settings.max_list_concurrency)
            .collect::<Vec<_>>();

        let listings = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(QueryError::Canceled),
            listings = listings => listings,
        };

        // Ids are unique within a project; location-split scopes of one
        // project may list the same item.
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut listed = 0;

        for listing in listings {
            if let Some(warning) = listing.warning {
                tracing::warn!(
                    "Listing {} in {} failed: {} ({})",
                    warning.resource_kind,
                    warning.scope,
                    warning.message,
                    warning.kind
                );
                warnings.push(warning);
            }

            for (id, base) in listing.items {
                if !seen.insert((listing.scope.project_id.clone(), id.clone())) {
                    tracing::debug!("Dropping duplicate item {} from {}", id, listing.scope);
                    continue;
                }
                listed += 1;
                let item = ResourceItem::new(listing.scope.clone(), id, base);
                if self.passes_list_quals(&item) {
                    items.push(item);
                }
            }
        }

        tracing::info!(
            "Listed {} {} items, {} after qualifiers",
            listed,
            self.kind(),
            items.len()
        );
        Ok(items)
    }

    /// Page through one scope's listing, up to the per-scope item cap
    async fn list_scope(&self, scope: ResourceScope) -> ScopeListing {
        let cap = self.engine.settings.item_cap_per_scope;
        let client = &*self.client;
        let limiter = &*self.engine.limiter;
        let kind = self.kind();

        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut warning = None;

        loop {
            let scope_ref = &scope;
            let token = page_token.as_deref();
            let page = retry_call(&self.engine.retry, &self.cancel, move |_| async move {
                limiter.acquire(scope_ref, kind).await?;
                client.list_page(scope_ref, token).await
            })
            .await;

            let page = match page {
                Ok(page) => page,
                Err(failure) => {
                    warning = Some(Diagnostic::from_failure(
                        &failure,
                        kind,
                        &scope,
                        LIST_HYDRATE,
                        None,
                    ));
                    break;
                }
            };

            for raw in page.items {
                let Some(id) = item_identity(&raw, &self.schema.id_field) else {
                    tracing::debug!("Skipping {} item without {}", kind, self.schema.id_field);
                    continue;
                };
                if seen.insert(id.clone()) {
                    items.push((id, raw));
                }
            }

            if items.len() >= cap {
                tracing::info!("Item cap {} reached for {} in {}", cap, kind, scope);
                items.truncate(cap);
                break;
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::debug!("Listed {} {} items in {}", items.len(), kind, scope);
        ScopeListing {
            scope,
            items,
            warning,
        }
    }

    fn passes_list_quals(&self, item: &ResourceItem) -> bool {
        self.quals
            .iter()
            .filter(|(column, _)| column.source.is_list_level())
            .all(|(column, qual)| qual.matches(column.column_type, cell(column, item).as_ref()))
    }

    // --- Detailing / Draining ---

    async fn hydrate_and_emit(
        &self,
        items: Vec<ResourceItem>,
        progress: &mut Progress,
        outcome: &mut Outcome,
        sink: &mpsc::Sender<Row>,
    ) -> Result<(), QueryError> {
        // Permits bound the calls in flight; the window only bounds how many
        // finished items may wait behind a slow one.
        let window = self
            .engine
            .settings
            .max_concurrency
            .saturating_mul(REORDER_FACTOR);
        let mut pending = items.into_iter();
        let mut in_flight = FuturesOrdered::new();
        let mut draining = false;

        loop {
            while in_flight.len() < window {
                match pending.next() {
                    Some(item) => in_flight.push_back(self.hydrate(item)),
                    None => break,
                }
            }
            if !draining && pending.len() == 0 {
                progress.advance(QueryPhase::Draining)?;
                draining = true;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(QueryError::Canceled),
                next = in_flight.next() => next,
            };
            let Some(item) = next else {
                return Ok(());
            };

            let Some(row) = self.assemble(item) else {
                continue;
            };
            for d in &row.diagnostics {
                tracing::warn!(
                    "{} {} in {}: hydrate {} failed after {} attempt(s): {}",
                    d.resource_kind,
                    row.item_id,
                    d.scope,
                    d.hydrate.as_deref().unwrap_or(LIST_HYDRATE),
                    d.attempts,
                    d.message
                );
            }

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(QueryError::Canceled),
                sent = sink.send(row) => sent,
            };
            if sent.is_err() {
                tracing::info!("Row receiver closed, stopping query");
                self.cancel.cancel();
                return Err(QueryError::Canceled);
            }
            outcome.rows += 1;
        }
    }

    /// Run every required detail hydrate for one item concurrently
    async fn hydrate(&self, mut item: ResourceItem) -> ResourceItem {
        if self.detail_hydrates.is_empty() {
            return item;
        }

        let results = join_all(self.detail_hydrates.iter().map(|h| self.detail(&item, h))).await;

        for (hydrate, result) in self.detail_hydrates.iter().zip(results) {
            match result {
                Ok(value) => {
                    item.details.insert(hydrate.clone(), value);
                }
                Err(failure) => item.diagnostics.push(Diagnostic::from_failure(
                    &failure,
                    self.kind(),
                    &item.scope,
                    hydrate,
                    Some(&item.id),
                )),
            }
        }
        item
    }

    async fn detail(&self, item: &ResourceItem, hydrate: &str) -> CachedResult {
        let key = CacheKey::new(self.kind(), &item.scope, &item.id, hydrate);
        let client = &*self.client;
        let limiter = &*self.engine.limiter;
        let permits = &self.permits;
        let kind = self.kind();
        let scope = &item.scope;
        let item_ref = ItemRef {
            id: &item.id,
            base: &item.base,
        };

        self.cache
            .get_or_compute(key, move || {
                retry_call(&self.engine.retry, &self.cancel, move |_| async move {
                    // One permit per attempt; backoff sleeps hold none
                    let _permit = permits
                        .acquire()
                        .await
                        .map_err(|_| HydrateError::fatal("detail permits closed"))?;
                    limiter.acquire(scope, kind).await?;
                    client.get_detail(scope, hydrate, item_ref).await
                })
            })
            .await
    }

    /// Build the output row; `None` when a qualifier filters it out.
    ///
    /// Qualifiers on columns whose hydrate failed are not evaluated, so the
    /// row still reaches the host along with its diagnostic.
    fn assemble(&self, item: ResourceItem) -> Option<Row> {
        let failed: HashSet<&str> = item
            .diagnostics
            .iter()
            .filter_map(|d| d.hydrate.as_deref())
            .collect();

        for (column, qual) in &self.quals {
            if column.source.is_list_level() {
                continue;
            }
            if column.source.hydrate().is_some_and(|h| failed.contains(h)) {
                continue;
            }
            if !qual.matches(column.column_type, cell(column, &item).as_ref()) {
                return None;
            }
        }

        let cells = self
            .projected
            .iter()
            .map(|column| (column.name.clone(), cell(column, &item)))
            .collect();

        Some(Row {
            scope: item.scope,
            item_id: item.id,
            cells,
            diagnostics: item.diagnostics,
        })
    }
}

/// Values `=`/`in` qualifiers pin a scope field to, intersected across qualifiers
fn pinned(quals: &[(&ColumnSpec, Qualifier)], field: ScopeField) -> Option<Vec<String>> {
    let mut pinned: Option<Vec<String>> = None;

    for (column, qual) in quals {
        if column.pushdown_field() != Some(field) {
            continue;
        }
        let Some(values) = qual.pinned_values() else {
            continue;
        };
        let values: Vec<String> = values
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();

        pinned = Some(match pinned {
            None => values,
            Some(prev) => prev.into_iter().filter(|v| values.contains(v)).collect(),
        });
    }

    pinned
}

/// Typed value of a column for an item; null when missing or not coercible
fn cell(column: &ColumnSpec, item: &ResourceItem) -> Option<ColumnValue> {
    let scope_value;
    let raw = match &column.source {
        ColumnSource::List => json_path(&item.base, &column.path)?,
        ColumnSource::Hydrate(hydrate) => json_path(item.details.get(hydrate)?, &column.path)?,
        ColumnSource::Scope(ScopeField::Project) => {
            scope_value = Value::String(item.scope.project_id.clone());
            &scope_value
        }
        ColumnSource::Scope(ScopeField::Location) => {
            scope_value = Value::String(item.scope.location.clone()?);
            &scope_value
        }
    };
    ColumnValue::coerce(column.column_type, raw)
}
