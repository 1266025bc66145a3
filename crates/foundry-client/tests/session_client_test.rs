#![allow(clippy::unwrap_used)]
// Integration tests for the session backend using wiremock.
//
// The session backend must behave identically to the direct backend from
// the caller's perspective, so this file mirrors the interesting subset of
// `direct_client_test.rs` through a pre-built `reqwest::Client`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use foundry_client::{
    ApiVersion, ApiVersionSelectState, Client, Error, RetryPolicy, VersionCache,
};

const VERSION_HEADER: &str = "X-Foundry-API-Version";
const MIN_VERSION_HEADER: &str = "X-Foundry-API-Minimum-Version";
const MAX_VERSION_HEADER: &str = "X-Foundry-API-Maximum-Version";

// ── Helpers ─────────────────────────────────────────────────────────

/// A session with redirect following disabled, as the contract requires.
fn session() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn client_for(server: &MockServer) -> Client {
    Client::with_session(server.uri(), session())
        .retry_policy(RetryPolicy {
            max_retries: 1,
            interval: Duration::from_millis(0),
        })
        .build()
        .unwrap()
}

#[derive(Default)]
struct RecordingCache {
    saved: Mutex<Vec<(String, u16, ApiVersion)>>,
}

impl VersionCache for RecordingCache {
    fn save(&self, host: &str, port: u16, version: ApiVersion) {
        self.saved
            .lock()
            .unwrap()
            .push((host.to_owned(), port, version));
    }
}

// ── Basic requests ──────────────────────────────────────────────────

#[tokio::test]
async fn json_request_decodes_json_bodies() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .and(header("user-agent", "foundry-client/0.1.0"))
        .and(header(VERSION_HEADER, "1.9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"portgroups": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let (resp, body) = client
        .json_request(Method::GET, "/v1/portgroups", None, None)
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(body, json!({"portgroups": []}));
}

// ── Version negotiation ─────────────────────────────────────────────

#[tokio::test]
async fn negotiates_down_after_406_and_replays_the_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .and(header(VERSION_HEADER, "1.40"))
        .respond_with(
            ResponseTemplate::new(406)
                .insert_header(MIN_VERSION_HEADER, "1.1")
                .insert_header(MAX_VERSION_HEADER, "1.31"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .and(header(VERSION_HEADER, "1.31"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"portgroups": []})))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(RecordingCache::default());
    let client = Client::with_session(server.uri(), session())
        .cached_version("1.40".parse().unwrap())
        .version_cache(cache.clone())
        .build()
        .unwrap();

    let (resp, _) = client
        .json_request(Method::GET, "/v1/portgroups", None, None)
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(client.api_version().unwrap().to_string(), "1.31");
    assert_eq!(
        client.version_select_state(),
        ApiVersionSelectState::Negotiated
    );
    assert_eq!(cache.saved.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_version_headers_trigger_exactly_one_probe() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .and(header(VERSION_HEADER, "1.40"))
        .respond_with(ResponseTemplate::new(406))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(MIN_VERSION_HEADER, "1.1")
                .insert_header(MAX_VERSION_HEADER, "1.31"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .and(header(VERSION_HEADER, "1.31"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"portgroups": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::with_session(server.uri(), session())
        .cached_version("1.40".parse().unwrap())
        .build()
        .unwrap();

    client
        .json_request(Method::GET, "/v1/portgroups", None, None)
        .await
        .unwrap();
    assert_eq!(client.api_version().unwrap().to_string(), "1.31");
}

#[tokio::test]
async fn user_pinned_versions_fail_instead_of_negotiating() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .respond_with(
            ResponseTemplate::new(406)
                .insert_header(MIN_VERSION_HEADER, "1.1")
                .insert_header(MAX_VERSION_HEADER, "1.31"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::with_session(server.uri(), session())
        .api_version("1.99".parse().unwrap())
        .build()
        .unwrap();

    let err = client
        .json_request(Method::GET, "/v1/portgroups", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion { .. }), "got: {err:?}");
}

// ── Redirects ───────────────────────────────────────────────────────

#[tokio::test]
async fn redirects_preserve_method_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/portgroups"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/v1/moved"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/moved"))
        .and(body_json(json!({"name": "pg0"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "pg0"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let (resp, body) = client
        .json_request(
            Method::POST,
            "/v1/portgroups",
            None,
            Some(&json!({"name": "pg0"})),
        )
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(body, json!({"name": "pg0"}));
}

// ── Error translation & retries ─────────────────────────────────────

#[tokio::test]
async fn structured_error_bodies_surface_fault_details() {
    let server = MockServer::start().await;

    let envelope = json!({
        "error_message": "{\"faultstring\": \"boom\", \"debuginfo\": \"trace\"}"
    });
    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .respond_with(ResponseTemplate::new(500).set_body_json(envelope))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .json_request(Method::GET, "/v1/portgroups", None, None)
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            Error::Status { status: 500, ref faultstring, ref debuginfo, .. }
                if faultstring.as_deref() == Some("boom") && debuginfo.as_deref() == Some("trace")
        ),
        "got: {err:?}"
    );
}

#[tokio::test]
async fn service_unavailable_is_retried_until_the_budget_runs_out() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/portgroups"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = Client::with_session(server.uri(), session())
        .retry_policy(RetryPolicy {
            max_retries: 2,
            interval: Duration::from_millis(0),
        })
        .build()
        .unwrap();

    let err = client
        .json_request(Method::GET, "/v1/portgroups", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable { .. }), "got: {err:?}");
}

// ── Body streaming ──────────────────────────────────────────────────

#[tokio::test]
async fn octet_stream_bodies_arrive_in_fixed_chunks() {
    let server = MockServer::start().await;

    let payload = vec![0x5Au8; 150 * 1024];
    Mock::given(method("GET"))
        .and(path("/v1/nodes/n0/image"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(payload.clone(), "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let (_, mut body) = client
        .raw_request(Method::GET, "/v1/nodes/n0/image", None, None)
        .await
        .unwrap();

    let mut sizes = Vec::new();
    let mut total = Vec::new();
    while let Some(chunk) = body.chunk().await.unwrap() {
        sizes.push(chunk.len());
        total.extend_from_slice(&chunk);
    }
    assert_eq!(sizes, vec![64 * 1024, 64 * 1024, 22 * 1024]);
    assert_eq!(total, payload);
}
