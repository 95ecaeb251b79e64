//! Resource abstraction layer
//!
//! Tables are data-driven: each GCP resource kind is described by a JSON
//! descriptor compiled into the binary, so adding a table does not need
//! code changes.
//!
//! # Architecture
//!
//! - [`registry`] - Loads and validates table schemas from embedded JSON
//! - [`client`] - Per-kind provider calls (listing pages, detail hydrates)
//! - [`fetcher`] - Item extraction and post-processing of list responses
//! - [`value`] - Column types and lenient JSON coercion
//! - [`qual`] - Qualifiers pushed down by the host
//!
//! # Table Definitions
//!
//! Tables are defined in JSON files under `src/resources/`:
//! - `compute.json` - Compute Engine (instances, disks, networks)
//! - `storage.json` - Cloud Storage buckets
//! - `gke.json` - GKE clusters
//! - `resourcemanager.json` - Projects

pub mod client;
pub mod fetcher;
pub mod qual;
pub mod registry;
pub mod value;

pub use client::{GcpResourceClient, ItemRef, Page, ResourceClient, ResourceClients};
pub use qual::{Operator, Qualifier};
pub use registry::{
    ColumnSource, ColumnSpec, ScopeField, SchemaRegistry, TableInfo, TableSchema, LIST_HYDRATE,
};
pub use value::{ColumnType, ColumnValue};
