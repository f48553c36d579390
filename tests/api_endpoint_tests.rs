// HTTP API tests. None of these requests need a reachable database.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sqlgate_core::{DatabaseConfig, GatewayConfig, PoolConfig};
use sqlgate_server::{create_router, Gateway};
use std::sync::Arc;
use tower::ServiceExt;

fn unreachable_config() -> GatewayConfig {
    GatewayConfig {
        database: DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        },
        pool: PoolConfig {
            acquire_timeout_secs: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn app() -> (Router, Arc<Gateway>) {
    let gateway = Arc::new(Gateway::new(unreachable_config()));
    (create_router(gateway.clone()), gateway)
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

// ============================================================================
// SERVICE INFO
// ============================================================================

#[tokio::test]
async fn test_liveness_and_root() {
    let (router, _) = app();
    let (status, body) = send(router.clone(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["detailed_health"], "/admin/health");

    let (status, body) = send(router, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "sqlgate");
}

#[tokio::test]
async fn test_admin_health_reports_unreachable_database() {
    let (router, _) = app();
    let (status, body) = send(router, "GET", "/admin/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_database_errors_map_to_503() {
    let (router, _) = app();
    let (status, body) = send(router, "GET", "/admin/db-info", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "pool_unavailable");
}

// ============================================================================
// REJECTIONS BEFORE THE DATABASE
// ============================================================================

#[tokio::test]
async fn test_bad_identifier_is_400() {
    let (router, gateway) = app();
    let (status, body) = send(router.clone(), "GET", "/crud/public/users%3Bdrop", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_identifier");
    assert_eq!(body["error"], "Invalid character in identifier: ';'");

    let (status, body) = send(router, "GET", "/admin/tables/bad-schema", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_identifier");

    assert!(!gateway.pool_stats().created);
}

#[tokio::test]
async fn test_blocked_sql_is_400() {
    let (router, gateway) = app();
    let (status, body) = send(
        router.clone(),
        "POST",
        "/raw/sql",
        Some(json!({"sql": "SELECT * FROM users; DROP TABLE users"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "sql_rejected");
    assert_eq!(body["error"], "SQL rejected: dangerous keyword 'DROP'");

    let (status, _) = send(
        router,
        "POST",
        "/raw/sql/write",
        Some(json!({"sql": "SELECT * FROM users"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!gateway.pool_stats().created);
}

#[tokio::test]
async fn test_parameter_mismatch_is_400() {
    let (router, _) = app();
    let (status, body) = send(
        router,
        "POST",
        "/crud/prepared/execute",
        Some(json!({
            "sql": "SELECT * FROM users WHERE id = $1 AND name = $2",
            "parameters": [1],
            "operation_type": "read",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "parameter_mismatch");
    assert_eq!(
        body["error"],
        "Parameter count mismatch: SQL expects 2 parameters, but 1 were provided"
    );
}

#[tokio::test]
async fn test_invalid_operation_type_is_400() {
    let (router, _) = app();
    let (status, body) = send(
        router,
        "POST",
        "/crud/prepared/execute",
        Some(json!({"sql": "SELECT 1", "operation_type": "admin"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "SQL rejected: Invalid operation type");
}

#[tokio::test]
async fn test_out_of_range_limit_is_400() {
    let (router, _) = app();
    let (status, body) = send(router, "GET", "/crud/public/users?limit=5000", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_empty_update_body_is_400() {
    let (router, _) = app();
    let (status, body) = send(router, "PUT", "/crud/public/users/1", Some(json!({"data": {}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid request: No fields to update");
}

// ============================================================================
// PREPARED STATEMENT ADMINISTRATION
// ============================================================================

#[tokio::test]
async fn test_validate_always_200() {
    let (router, _) = app();
    let (status, body) = send(
        router.clone(),
        "POST",
        "/crud/prepared/validate",
        Some(json!({"sql": "SELECT * FROM t WHERE a = $1 AND b = $2", "parameters": {"2": "b", "1": "a"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["placeholder_count"], 2);
    assert_eq!(body["parameter_count"], 2);

    let (status, body) = send(
        router,
        "POST",
        "/crud/prepared/validate",
        Some(json!({"sql": "DROP TABLE t", "operation_type": "write"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert_eq!(body["error"], "SQL rejected: dangerous keyword 'DROP'");
}

#[tokio::test]
async fn test_statement_admin_routes() {
    let (router, _) = app();
    let (status, body) = send(router.clone(), "GET", "/crud/prepared/statements", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, body) = send(router.clone(), "DELETE", "/crud/prepared/statements/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Prepared statement 'missing' not found");

    let (status, body) = send(router, "DELETE", "/crud/prepared/statements", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 0);
}

#[tokio::test]
async fn test_pool_stats_before_first_use() {
    let (router, _) = app();
    let (status, body) = send(router, "GET", "/admin/pool-stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"]["created"], false);
    assert_eq!(body["pool"]["max_size"], 10);
    assert_eq!(body["cached_statements"], 0);
}

// ============================================================================
// MALFORMED REQUESTS
// ============================================================================

#[tokio::test]
async fn test_malformed_json_uses_error_envelope() {
    let (router, _) = app();
    let request = Request::builder()
        .method("POST")
        .uri("/raw/sql")
        .header("content-type", "application/json")
        .body(Body::from("{\"sql\": "))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_bare_string_parameters_use_error_envelope() {
    let (router, _) = app();
    let (status, body) = send(
        router,
        "POST",
        "/crud/prepared/execute",
        Some(json!({"sql": "SELECT 1", "parameters": "oops"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
    assert!(body["error"].as_str().unwrap().starts_with("Invalid request: "));
}

#[tokio::test]
async fn test_non_numeric_limit_uses_error_envelope() {
    let (router, _) = app();
    let (status, body) = send(router, "GET", "/crud/public/users?limit=ten", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}
