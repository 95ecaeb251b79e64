//! gcptables
//!
//! Exposes GCP resources (compute instances, disks, networks, buckets, GKE
//! clusters, projects) as relational tables to a host query engine. Each
//! query is answered by listing resources across projects and fetching only
//! the per-item detail payloads the requested columns need.

pub mod config;
pub mod engine;
pub mod error;
pub mod gcp;
pub mod plugin;
pub mod resource;
pub mod scope;

/// Version injected at compile time via GCPTABLES_VERSION env var (set by CI/CD),
/// or the crate version for local builds.
pub const VERSION: &str = match option_env!("GCPTABLES_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
