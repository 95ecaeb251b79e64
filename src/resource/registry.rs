//! Table Schema Registry - Load table definitions from JSON
//!
//! Every table is described by an embedded JSON descriptor: how to list it,
//! which detail hydrates exist, and which hydrate feeds each column. The
//! descriptors are parsed and checked once, then shared read-only.

use super::qual::Qualifier;
use super::value::ColumnType;
use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Embedded table JSON files (compiled into the binary)
const RESOURCE_FILES: &[&str] = &[
    include_str!("../resources/compute.json"),
    include_str!("../resources/storage.json"),
    include_str!("../resources/gke.json"),
    include_str!("../resources/resourcemanager.json"),
];

/// Name of the base listing hydrate every table has
pub const LIST_HYDRATE: &str = "list";

/// Which part of the scope a scope-sourced column exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeField {
    Project,
    Location,
}

/// Where a column's value comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum ColumnSource {
    /// The base listing payload
    List,
    /// A named detail hydrate
    Hydrate(String),
    /// The scope the item was listed in
    Scope(ScopeField),
}

impl From<String> for ColumnSource {
    fn from(s: String) -> Self {
        match s.as_str() {
            LIST_HYDRATE => Self::List,
            "scope.project" => Self::Scope(ScopeField::Project),
            "scope.location" => Self::Scope(ScopeField::Location),
            _ => Self::Hydrate(s),
        }
    }
}

impl ColumnSource {
    /// Hydrate that must run for this column to have a value
    pub fn hydrate(&self) -> Option<&str> {
        match self {
            Self::List => Some(LIST_HYDRATE),
            Self::Hydrate(name) => Some(name),
            Self::Scope(_) => None,
        }
    }

    /// Whether the value is known right after listing
    pub fn is_list_level(&self) -> bool {
        matches!(self, Self::List | Self::Scope(_))
    }
}

/// Column definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub source: ColumnSource,
    /// Dot path into the hydrate payload; empty means the whole payload
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Scope part an `=`/`in` qualifier on this column can narrow
    #[serde(default)]
    pub pushdown: Option<ScopeField>,
}

impl ColumnSpec {
    pub fn pushdown_field(&self) -> Option<ScopeField> {
        match self.source {
            ColumnSource::Scope(field) => Some(field),
            _ => self.pushdown,
        }
    }
}

/// One provider call: URL template plus where the result lives in the response
#[derive(Debug, Clone, Deserialize)]
pub struct HydrateSpec {
    /// URL template: `{compute}`-style endpoint placeholders, `{project}`,
    /// `{location}`, and `{item.<path>}` for fields of the listed item
    pub url: String,
    #[serde(default)]
    pub response_path: String,
    /// Response is keyed by location (compute `aggregated/` APIs)
    #[serde(default)]
    pub aggregated: bool,
}

/// Table definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct TableSchema {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub list: HydrateSpec,
    /// Path of the provider-assigned identity in the listing payload
    pub id_field: String,
    #[serde(default)]
    pub hydrates: BTreeMap<String, HydrateSpec>,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Spec of a hydrate by name, including the base listing
    pub fn hydrate(&self, name: &str) -> Option<&HydrateSpec> {
        if name == LIST_HYDRATE {
            Some(&self.list)
        } else {
            self.hydrates.get(name)
        }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.hydrates.contains_key(LIST_HYDRATE) {
            return Err(RegistryError::Invalid {
                table: self.name.clone(),
                reason: format!("hydrate name '{LIST_HYDRATE}' is reserved"),
            });
        }

        let mut seen = BTreeSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(RegistryError::Invalid {
                    table: self.name.clone(),
                    reason: format!("duplicate column {}", column.name),
                });
            }
            if let ColumnSource::Hydrate(h) = &column.source {
                if !self.hydrates.contains_key(h) {
                    return Err(RegistryError::Invalid {
                        table: self.name.clone(),
                        reason: format!("column {} uses undeclared hydrate {}", column.name, h),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Table metadata for the plugin descriptor
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Root structure of resources/*.json
#[derive(Debug, Clone, Deserialize)]
struct ResourceFile {
    #[serde(default)]
    tables: HashMap<String, TableSchema>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to parse table definitions: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("table {0} is defined twice")]
    Duplicate(String),

    #[error("invalid table {table}: {reason}")]
    Invalid { table: String, reason: String },
}

/// Immutable set of table schemas
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaRegistry {
    /// Parse and validate a set of JSON table definition documents
    pub fn from_sources(sources: &[&str]) -> Result<Self, RegistryError> {
        let mut tables = BTreeMap::new();

        for content in sources {
            let partial: ResourceFile = serde_json::from_str(content)?;
            for (name, mut schema) in partial.tables {
                schema.name = name.clone();
                schema.validate()?;
                if tables.insert(name.clone(), schema).is_some() {
                    return Err(RegistryError::Duplicate(name));
                }
            }
        }

        Ok(Self { tables })
    }

    /// Registry of the built-in tables (parsed on first access)
    pub fn builtin() -> Arc<SchemaRegistry> {
        static REGISTRY: OnceLock<Arc<SchemaRegistry>> = OnceLock::new();
        REGISTRY
            .get_or_init(|| {
                let registry = Self::from_sources(RESOURCE_FILES)
                    .unwrap_or_else(|e| panic!("Failed to load embedded table definitions: {}", e));
                Arc::new(registry)
            })
            .clone()
    }

    pub fn schema_for(&self, table: &str) -> Result<&TableSchema, QueryError> {
        self.tables
            .get(table)
            .ok_or_else(|| QueryError::UnknownTable(table.to_string()))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    pub fn tables(&self) -> Vec<TableInfo> {
        self.tables
            .values()
            .map(|t| TableInfo {
                name: t.name.clone(),
                description: t.description.clone(),
                columns: t
                    .columns
                    .iter()
                    .map(|c| ColumnInfo {
                        name: c.name.clone(),
                        column_type: c.column_type,
                        description: c.description.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Columns a query will project; an empty request means every column
    pub fn resolve_columns<'a>(
        &self,
        table: &'a TableSchema,
        requested: &[String],
    ) -> Result<Vec<&'a ColumnSpec>, QueryError> {
        if requested.is_empty() {
            return Ok(table.columns.iter().collect());
        }

        requested
            .iter()
            .map(|name| {
                table.column(name).ok_or_else(|| QueryError::UnknownColumn {
                    table: table.name.clone(),
                    column: name.clone(),
                })
            })
            .collect()
    }

    /// Minimal set of hydrates needed to answer a query.
    ///
    /// The base listing is always included since it establishes item identity.
    /// Any other hydrate is included only when it feeds a requested column or
    /// a column referenced by a qualifier.
    pub fn required_hydrates(
        &self,
        table: &str,
        requested: &[String],
        qualifiers: &[Qualifier],
    ) -> Result<BTreeSet<String>, QueryError> {
        let schema = self.schema_for(table)?;
        let mut required = BTreeSet::from([LIST_HYDRATE.to_string()]);

        for column in self.resolve_columns(schema, requested)? {
            if let Some(h) = column.source.hydrate() {
                required.insert(h.to_string());
            }
        }

        for qual in qualifiers {
            let column = schema
                .column(&qual.column)
                .ok_or_else(|| QueryError::UnknownColumn {
                    table: schema.name.clone(),
                    column: qual.column.clone(),
                })?;
            if let Some(h) = column.source.hydrate() {
                required.insert(h.to_string());
            }
        }

        Ok(required)
    }
}
