//! Resource clients
//!
//! A [`ResourceClient`] wraps the provider calls for one resource kind:
//! listing pages and fetching per-item detail payloads. The GCP
//! implementation is driven entirely by the table's URL templates.

use super::fetcher::{extract_items, next_page_token};
use super::registry::{HydrateSpec, TableSchema};
use super::value::json_path;
use crate::error::{HydrateError, QueryError};
use crate::gcp::client::GcpClient;
use crate::scope::ResourceScope;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Query parameter GCP list APIs take for continuation
const PAGE_TOKEN_PARAM: &str = "pageToken";

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_page_token: Option<String>,
}

/// A listed item, as seen by detail calls
#[derive(Debug, Clone, Copy)]
pub struct ItemRef<'a> {
    pub id: &'a str,
    /// Listing payload, for fields detail URLs are built from
    pub base: &'a Value,
}

#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Resource kind this client serves
    fn kind(&self) -> &str;

    /// Fetch one page of the base listing
    async fn list_page(
        &self,
        scope: &ResourceScope,
        page_token: Option<&str>,
    ) -> Result<Page, HydrateError>;

    /// Fetch one item's payload for the named detail hydrate
    async fn get_detail(
        &self,
        scope: &ResourceScope,
        hydrate: &str,
        item: ItemRef<'_>,
    ) -> Result<Value, HydrateError>;
}

/// Hands out the client for a table
pub trait ResourceClients: Send + Sync {
    fn client_for(&self, schema: &TableSchema) -> Result<Arc<dyn ResourceClient>, QueryError>;
}

/// Template-driven client for one GCP table
pub struct GcpResourceClient {
    client: GcpClient,
    schema: TableSchema,
}

impl GcpResourceClient {
    pub fn new(client: GcpClient, schema: TableSchema) -> Self {
        Self { client, schema }
    }

    fn render(
        &self,
        template: &str,
        scope: &ResourceScope,
        item: Option<ItemRef<'_>>,
    ) -> Result<String, HydrateError> {
        render_url(template, scope, item, |service| {
            self.client.endpoints().get(service).map(|s| s.to_string())
        })
    }

    fn spec(&self, hydrate: &str) -> Result<&HydrateSpec, HydrateError> {
        self.schema.hydrate(hydrate).ok_or_else(|| {
            HydrateError::fatal(format!(
                "table {} has no hydrate {}",
                self.schema.name, hydrate
            ))
        })
    }
}

#[async_trait]
impl ResourceClient for GcpResourceClient {
    fn kind(&self) -> &str {
        &self.schema.name
    }

    async fn list_page(
        &self,
        scope: &ResourceScope,
        page_token: Option<&str>,
    ) -> Result<Page, HydrateError> {
        let spec = &self.schema.list;
        let url = self.render(&spec.url, scope, None)?;

        let query: Vec<(&str, &str)> = page_token
            .map(|t| vec![(PAGE_TOKEN_PARAM, t)])
            .unwrap_or_default();
        let response = self.client.get(&url, &query).await?;

        Ok(Page {
            items: extract_items(&response, &spec.response_path, spec.aggregated),
            next_page_token: next_page_token(&response),
        })
    }

    async fn get_detail(
        &self,
        scope: &ResourceScope,
        hydrate: &str,
        item: ItemRef<'_>,
    ) -> Result<Value, HydrateError> {
        if item.id.is_empty() {
            return Err(HydrateError::fatal("detail call without item identity"));
        }

        let spec = self.spec(hydrate)?;
        let url = self.render(&spec.url, scope, Some(item))?;
        let response = self.client.get(&url, &[]).await?;

        Ok(json_path(&response, &spec.response_path)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

impl ResourceClients for GcpClient {
    fn client_for(&self, schema: &TableSchema) -> Result<Arc<dyn ResourceClient>, QueryError> {
        Ok(Arc::new(GcpResourceClient::new(self.clone(), schema.clone())))
    }
}

/// Fill a URL template.
///
/// `{project}` and `{location}` come from the scope, `{item.<path>}` from the
/// listed item (URL-encoded), and any other `{name}` from `endpoint`.
pub fn render_url<F>(
    template: &str,
    scope: &ResourceScope,
    item: Option<ItemRef<'_>>,
    endpoint: F,
) -> Result<String, HydrateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| HydrateError::fatal(format!("unterminated placeholder in {template}")))?;
        let name = &after[..end];

        let value = match name {
            "project" => urlencoding::encode(&scope.project_id).into_owned(),
            "location" => urlencoding::encode(scope.location_or_all()).into_owned(),
            _ => match name.strip_prefix("item.") {
                Some(path) => {
                    let item = item.ok_or_else(|| {
                        HydrateError::fatal(format!("{template} needs an item"))
                    })?;
                    let field = json_path(item.base, path)
                        .and_then(|v| match v {
                            Value::String(s) => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        })
                        .ok_or_else(|| {
                            HydrateError::fatal(format!("item {} has no field {path}", item.id))
                        })?;
                    urlencoding::encode(&field).into_owned()
                }
                None => endpoint(name).ok_or_else(|| {
                    HydrateError::fatal(format!("unknown placeholder {{{name}}} in {template}"))
                })?,
            },
        };

        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}
