//! Integration tests for the GCP HTTP layer using wiremock
//!
//! These tests verify status classification, pagination and project
//! discovery against mocked endpoints.

use futures::StreamExt;
use gcptables::config::{Config, Endpoints};
use gcptables::engine::retry::RetryPolicy;
use gcptables::engine::HydrationEngine;
use gcptables::error::{ErrorKind, QueryError};
use gcptables::gcp::auth::StaticToken;
use gcptables::gcp::client::GcpClient;
use gcptables::gcp::projects::ProjectEnumerator;
use gcptables::resource::{ItemRef, ResourceClient, ResourceClients, SchemaRegistry};
use gcptables::scope::{ResourceScope, ScopeEnumerator, StaticScopes};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{bearer_token, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> GcpClient {
    GcpClient::new(
        Arc::new(StaticToken("test-token".to_string())),
        Endpoints::all(&server.uri()),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        multiplier: 1.0,
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    }
}

/// Test module for HTTP classification
mod http_client_tests {
    use super::*;

    /// Test successful GET request returns parsed JSON
    #[tokio::test]
    async fn test_get_success_returns_json() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .and(bearer_token("test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "projects": [{"projectId": "alpha-project", "lifecycleState": "ACTIVE"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let url = client.resourcemanager_url("projects");
        let response = client.get(&url, &[]).await.expect("Request should succeed");

        assert_eq!(response["projects"][0]["projectId"], "alpha-project");
    }

    /// Test 401 is a permission failure, never retried
    #[tokio::test]
    async fn test_401_is_permission_denied() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"code": 401, "message": "Invalid credentials"}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get(&format!("{}/anything", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!err.is_retryable());
    }

    /// Test a plain 403 is a permission failure
    #[tokio::test]
    async fn test_403_is_permission_denied() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "code": 403,
                    "errors": [{"reason": "forbidden"}],
                    "status": "PERMISSION_DENIED"
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get(&format!("{}/anything", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    /// Test 403 carrying a rate-limit reason is throttling
    #[tokio::test]
    async fn test_403_rate_limit_reason_is_throttled() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"code": 403, "errors": [{"reason": "userRateLimitExceeded"}]}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get(&format!("{}/anything", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Throttled);
    }

    /// Test 429 with Retry-After carries the hint
    #[tokio::test]
    async fn test_429_carries_retry_after() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get(&format!("{}/anything", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Throttled);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    /// Test server errors are transient
    #[tokio::test]
    async fn test_5xx_is_transient() {
        for status in [500, 502, 503, 504] {
            let server = MockServer::start().await;

            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let client = client_for(&server);
            let err = client
                .get(&format!("{}/anything", server.uri()), &[])
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transient, "status {status}");
        }
    }

    /// Test other client errors and bad JSON are fatal
    #[tokio::test]
    async fn test_404_and_bad_json_are_fatal() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/garbled"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let missing = client
            .get(&format!("{}/missing", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Fatal);

        let garbled = client
            .get(&format!("{}/garbled", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(garbled.kind(), ErrorKind::Fatal);
    }

    /// Test an unreachable endpoint is transient
    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let client = GcpClient::new(
            Arc::new(StaticToken("test-token".to_string())),
            Endpoints::all("http://127.0.0.1:1"),
            Duration::from_secs(1),
        )
        .unwrap();
        let err = client.get("http://127.0.0.1:1/x", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}

/// Test module for the template-driven resource client
mod resource_client_tests {
    use super::*;

    #[tokio::test]
    async fn test_list_page_follows_page_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b"))
            .and(query_param("project", "alpha-project"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "b3", "name": "b3"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b"))
            .and(query_param("project", "alpha-project"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "b1", "name": "b1"}, {"id": "b2", "name": "b2"}],
                "nextPageToken": "page-2"
            })))
            .mount(&server)
            .await;

        let registry = SchemaRegistry::builtin();
        let schema = registry.schema_for("gcp_storage_bucket").unwrap();
        let client = client_for(&server).client_for(schema).unwrap();
        let scope = ResourceScope::project("alpha-project");

        let first = client.list_page(&scope, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_page_token.as_deref(), Some("page-2"));

        let second = client.list_page(&scope, Some("page-2")).await.unwrap();
        assert_eq!(second.items[0]["id"], "b3");
        assert_eq!(second.next_page_token, None);
    }

    #[tokio::test]
    async fn test_aggregated_listing_is_flattened() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v1/projects/alpha-project/aggregated/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": {
                    "zones/us-central1-a": {"instances": [{
                        "id": "1",
                        "name": "web-1",
                        "zone": "https://www.googleapis.com/compute/v1/projects/alpha-project/zones/us-central1-a"
                    }]},
                    "zones/us-east1-b": {"warning": {"code": "NO_RESULTS_ON_PAGE"}}
                }
            })))
            .mount(&server)
            .await;

        let registry = SchemaRegistry::builtin();
        let schema = registry.schema_for("gcp_compute_instance").unwrap();
        let client = client_for(&server).client_for(schema).unwrap();

        let page = client
            .list_page(&ResourceScope::project("alpha-project"), None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["zone_short"], "us-central1-a");
    }

    #[tokio::test]
    async fn test_get_detail_uses_listed_fields() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/logs-bucket/iam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "bindings": [{"role": "roles/storage.admin", "members": ["user:a@example.com"]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let registry = SchemaRegistry::builtin();
        let schema = registry.schema_for("gcp_storage_bucket").unwrap();
        let client = client_for(&server).client_for(schema).unwrap();
        let base = json!({"id": "logs-bucket", "name": "logs-bucket"});

        let detail = client
            .get_detail(
                &ResourceScope::project("alpha-project"),
                "iam_policy",
                ItemRef {
                    id: "logs-bucket",
                    base: &base,
                },
            )
            .await
            .unwrap();
        assert_eq!(detail["bindings"][0]["role"], "roles/storage.admin");
    }
}

/// Test module for project discovery
mod discovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_pages_filters_and_dedups() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .and(query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "projects": [
                    {"projectId": "beta-project", "lifecycleState": "ACTIVE"},
                    {"projectId": "gamma-project", "lifecycleState": "ACTIVE"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "projects": [
                    {"projectId": "alpha-project", "lifecycleState": "ACTIVE"},
                    {"projectId": "beta-project", "lifecycleState": "ACTIVE"},
                    {"projectId": "old-project", "lifecycleState": "DELETE_REQUESTED"}
                ],
                "nextPageToken": "next"
            })))
            .mount(&server)
            .await;

        let enumerator = ProjectEnumerator::new(client_for(&server), fast_retry(1));
        let scopes: Vec<_> = enumerator
            .enumerate(CancellationToken::new())
            .map(|s| s.unwrap().project_id)
            .collect()
            .await;

        assert_eq!(scopes, vec!["alpha-project", "beta-project", "gamma-project"]);
    }

    #[tokio::test]
    async fn test_discovery_is_lazy() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"projects": []})))
            .expect(0)
            .mount(&server)
            .await;

        let enumerator = ProjectEnumerator::new(client_for(&server), fast_retry(1));
        let stream = enumerator.enumerate(CancellationToken::new());
        drop(stream);
        // MockServer verifies `expect(0)` on drop
    }

    #[tokio::test]
    async fn test_empty_discovery_is_zero_scopes() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let enumerator = ProjectEnumerator::new(client_for(&server), fast_retry(1));
        let scopes: Vec<_> = enumerator.enumerate(CancellationToken::new()).collect().await;
        assert!(scopes.is_empty());
    }

    #[tokio::test]
    async fn test_denied_discovery_is_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let enumerator = ProjectEnumerator::new(client_for(&server), fast_retry(3));
        let scopes: Vec<_> = enumerator.enumerate(CancellationToken::new()).collect().await;
        assert_eq!(scopes.len(), 1);
        assert!(matches!(scopes[0], Err(QueryError::AuthError(_))));
    }

    #[tokio::test]
    async fn test_auth_error_fails_query_before_listing() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/projects"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let engine = HydrationEngine::new(
            &Config::default(),
            SchemaRegistry::builtin(),
            Arc::new(client.clone()),
            Arc::new(ProjectEnumerator::new(client, fast_retry(1))),
        );

        let (rows, status) = engine
            .collect(
                gcptables::engine::QueryRequest::new("gcp_storage_bucket"),
                CancellationToken::new(),
            )
            .await;
        assert!(rows.is_empty());
        assert_eq!(status.error().map(|e| e.kind()), Some(ErrorKind::AuthError));
    }
}

/// End-to-end queries against a mocked provider
mod engine_http_tests {
    use super::*;
    use gcptables::engine::QueryRequest;

    #[tokio::test]
    async fn test_bucket_query_with_iam_hydrate() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "logs", "name": "logs", "location": "US"},
                    {"id": "assets", "name": "assets", "location": "EU"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/logs/iam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"bindings": []})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/assets/iam"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let engine = HydrationEngine::new(
            &Config::default(),
            SchemaRegistry::builtin(),
            Arc::new(client),
            Arc::new(StaticScopes::new(["alpha-project"])),
        );

        let request =
            QueryRequest::new("gcp_storage_bucket").columns(["name", "iam_policy", "iam_bindings"]);
        let (rows, status) = engine.collect(request, CancellationToken::new()).await;

        assert!(status.is_done());
        assert_eq!(rows.len(), 2);
        assert!(rows[0].get("iam_policy").is_some());
        assert!(!rows[0].is_partial());

        assert!(rows[1].get("iam_policy").is_none());
        assert!(rows[1].get("iam_bindings").is_none());
        assert_eq!(rows[1].diagnostics.len(), 1);
        assert_eq!(rows[1].diagnostics[0].kind, ErrorKind::PermissionDenied);
        assert_eq!(rows[1].diagnostics[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_denied_scope_is_a_warning() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b"))
            .and(query_param("project", "alpha-project"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "logs", "name": "logs"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b"))
            .and(query_param("project", "beta-project"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let engine = HydrationEngine::new(
            &Config::default(),
            SchemaRegistry::builtin(),
            Arc::new(client_for(&server)),
            Arc::new(StaticScopes::new(["alpha-project", "beta-project"])),
        );

        let (rows, status) = engine
            .collect(
                QueryRequest::new("gcp_storage_bucket").columns(["name", "project"]),
                CancellationToken::new(),
            )
            .await;

        assert!(status.is_done());
        assert_eq!(rows.len(), 1);
        assert_eq!(status.warnings().len(), 1);
        assert_eq!(status.warnings()[0].scope.project_id, "beta-project");
        assert_eq!(status.warnings()[0].kind, ErrorKind::PermissionDenied);
    }
}
