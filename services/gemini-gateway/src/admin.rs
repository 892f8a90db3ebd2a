//! Admin API for key management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is only started
//! when an `[admin]` section is configured.
//!
//! Endpoints:
//! - GET  /admin/keys            - list keys by id and fingerprint
//! - POST /admin/keys            - import a key (insert or reactivate)
//! - POST /admin/keys/quarantine - take a key out of rotation
//! - GET  /admin/pool            - pool summary

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::KeyPool;
use serde::Deserialize;
use tracing::{error, info};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<KeyPool>,
}

impl AdminState {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self { pool }
    }
}

/// Build the admin axum router with all key management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys).post(import_key))
        .route("/admin/keys/quarantine", post(quarantine_key))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(
    status: StatusCode,
    body: serde_json::Value,
) -> (StatusCode, [(axum::http::HeaderName, &'static str); 1], String) {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

fn pool_error(e: key_pool::Error) -> (StatusCode, [(axum::http::HeaderName, &'static str); 1], String) {
    let status = match e {
        key_pool::Error::InvalidKey(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "admin key operation failed");
    }
    json_response(status, serde_json::json!({ "error": e.to_string() }))
}

/// GET /admin/keys. Never exposes key values.
async fn list_keys(State(state): State<AdminState>) -> impl IntoResponse {
    match state.pool.list().await {
        Ok(keys) => {
            let keys: Vec<_> = keys
                .iter()
                .map(|k| {
                    serde_json::json!({
                        "id": k.id.0,
                        "fingerprint": k.fingerprint(),
                        "alive": k.alive,
                        "last_used": k.last_used,
                    })
                })
                .collect();
            json_response(StatusCode::OK, serde_json::json!({ "keys": keys }))
        }
        Err(e) => pool_error(e),
    }
}

/// Request body for import and quarantine.
#[derive(Deserialize)]
struct KeyRequest {
    key: String,
}

/// POST /admin/keys: insert a new key or reactivate a quarantined one.
async fn import_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeyRequest>,
) -> impl IntoResponse {
    let key = body.key.trim();
    match state.pool.import(key).await {
        Ok(outcome) => {
            let fingerprint = common::fingerprint(key);
            info!(key = %fingerprint, outcome = outcome.label(), "key imported via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "fingerprint": fingerprint,
                    "outcome": outcome.label(),
                }),
            )
        }
        Err(e) => pool_error(e),
    }
}

/// POST /admin/keys/quarantine: idempotent, unknown keys are accepted.
async fn quarantine_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeyRequest>,
) -> impl IntoResponse {
    let key = body.key.trim();
    if key.is_empty() {
        return pool_error(key_pool::Error::InvalidKey("key must not be empty".into()));
    }
    match state.pool.quarantine(key).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "fingerprint": common::fingerprint(key),
                "status": "quarantined",
            }),
        ),
        Err(e) => pool_error(e),
    }
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    match state.pool.summary().await {
        Ok(summary) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "keys_total": summary.keys_total,
                "keys_alive": summary.keys_alive,
                "keys_quarantined": summary.keys_quarantined,
            }),
        ),
        Err(e) => pool_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use key_pool::PoolSettings;
    use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
    use tower::ServiceExt;

    fn test_pool(keys: &[&str]) -> Arc<KeyPool> {
        let store = Arc::new(MemoryKeyStore::with_keys(keys.iter().copied()));
        Arc::new(KeyPool::new(store, PoolSettings::default()))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn list_keys_empty_pool() {
        let app = build_admin_router(AdminState::new(test_pool(&[])));

        let (status, json) = send(app, get_request("/admin/keys")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["keys"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn list_keys_never_exposes_values() {
        let pool = test_pool(&["AIzaSyFirst", "AIzaSySecond"]);
        pool.quarantine("AIzaSySecond").await.unwrap();
        let app = build_admin_router(AdminState::new(pool));

        let response = app.oneshot(get_request("/admin/keys")).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("AIzaSy"), "key values must never be returned");

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        let keys = json["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0]["id"], 1);
        assert_eq!(keys[0]["fingerprint"], common::fingerprint("AIzaSyFirst"));
        assert_eq!(keys[0]["alive"], true);
        assert_eq!(keys[1]["alive"], false);
        assert_eq!(keys[1]["last_used"], 0);
    }

    #[tokio::test]
    async fn import_reports_outcome() {
        let pool = test_pool(&["existing"]);
        pool.quarantine("existing").await.unwrap();

        let app = build_admin_router(AdminState::new(pool.clone()));
        let (status, json) = send(
            app.clone(),
            post_json("/admin/keys", serde_json::json!({ "key": "fresh" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "inserted");
        assert_eq!(json["fingerprint"], common::fingerprint("fresh"));

        let (_, json) = send(
            app.clone(),
            post_json("/admin/keys", serde_json::json!({ "key": "existing" })),
        )
        .await;
        assert_eq!(json["outcome"], "reactivated");

        let (_, json) = send(
            app,
            post_json("/admin/keys", serde_json::json!({ "key": "fresh" })),
        )
        .await;
        assert_eq!(json["outcome"], "already_alive");
        assert_eq!(pool.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn import_empty_key_is_400() {
        let app = build_admin_router(AdminState::new(test_pool(&[])));

        let (status, json) =
            send(app, post_json("/admin/keys", serde_json::json!({ "key": "  " }))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn quarantine_takes_key_out_of_rotation() {
        let pool = test_pool(&["key-a", "key-b"]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        let (status, json) = send(
            app,
            post_json("/admin/keys/quarantine", serde_json::json!({ "key": "key-a" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "quarantined");
        assert_eq!(json["fingerprint"], common::fingerprint("key-a"));
        assert!(!pool.validate("key-a").await.unwrap());
        assert_eq!(pool.acquire().await.unwrap().value, "key-b");
    }

    #[tokio::test]
    async fn pool_status_counts_keys() {
        let pool = test_pool(&["key-a", "key-b", "key-c"]);
        pool.quarantine("key-c").await.unwrap();
        let app = build_admin_router(AdminState::new(pool));

        let (status, json) = send(app, get_request("/admin/pool")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["keys_total"], 3);
        assert_eq!(json["keys_alive"], 2);
        assert_eq!(json["keys_quarantined"], 1);
    }

    #[tokio::test]
    async fn imports_persist_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = Arc::new(FileKeyStore::load(path.clone()).await.unwrap());
        let pool = Arc::new(KeyPool::new(store, PoolSettings::default()));
        let app = build_admin_router(AdminState::new(pool));

        send(
            app,
            post_json("/admin/keys", serde_json::json!({ "key": "persisted" })),
        )
        .await;

        let reloaded = FileKeyStore::load(path).await.unwrap();
        assert_eq!(reloaded.count_alive().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn admin_routes_isolated_from_proxy_paths() {
        let app = build_admin_router(AdminState::new(test_pool(&[])));

        let response = app
            .oneshot(get_request("/v1beta/models"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
