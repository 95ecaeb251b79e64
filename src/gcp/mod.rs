//! GCP API interaction module
//!
//! Authentication, the HTTP layer with its error classification, and
//! project discovery.
//!
//! # Module Structure
//!
//! - [`auth`] - Bearer tokens from Application Default Credentials
//! - [`client`] - Authenticated client bound to a set of API endpoints
//! - [`http`] - REST calls and status classification
//! - [`projects`] - Project listing as a scope source
//!
//! # Example
//!
//! ```ignore
//! use crate::gcp::client::GcpClient;
//!
//! async fn example(client: &GcpClient) -> Result<(), HydrateError> {
//!     let projects = client.get(&client.resourcemanager_url("projects"), &[]).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod http;
pub mod projects;
