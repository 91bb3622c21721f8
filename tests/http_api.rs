//! HTTP surface tests driven through the router with `tower::ServiceExt`,
//! backed by a real engine instance per test.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use spotdb::config::{Config, ServerMode};
use spotdb::db::Database;
use spotdb::server::{build_router, AppState};

const BOUNDARY: &str = "spotdb-test-boundary";

fn test_config() -> Config {
    Config {
        socket_port: 6033,
        api_key: None,
        rate_limit_rps: 0,
        enable_benchmarks: false,
        snapshot_location: None,
        server_mode: ServerMode::Test,
    }
}

async fn test_state(config: Config) -> (AppState, Arc<Database>) {
    let db = Arc::new(Database::open(&config).await.expect("open database"));
    let state = AppState::new(Arc::clone(&db), Arc::new(config));
    (state, db)
}

/// Build a multipart upload body with text fields and one `csv_file` part.
fn multipart_body(fields: &[(&str, &str)], file_name: &str, file_content: &str) -> String {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"csv_file\"; \
         filename=\"{file_name}\"\r\nContent-Type: text/csv\r\n\r\n{file_content}\r\n"
    ));
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

fn upload_request(fields: &[(&str, &str)], file_name: &str, file_content: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(fields, file_name, file_content)))
        .unwrap()
}

fn query_request(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthcheck_returns_ok() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/healthcheck")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"OK");

    db.close().await.unwrap();
}

#[tokio::test]
async fn upload_then_query_round_trip() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(upload_request(
            &[("table_name", "t"), ("has_header", "true")],
            "data.csv",
            "id,name\n1,alice\n2,bob\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["table"], "t");
    assert_eq!(body["row_count"], 2);
    assert_eq!(body["columns"].as_array().unwrap().len(), 2);
    assert_eq!(body["import"]["import_method"], "direct_import");

    let response = app
        .oneshot(query_request(
            "/api/v1/query",
            r#"{"query":"SELECT COUNT(*) AS n FROM t"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["results"][0]["n"], 2);

    db.close().await.unwrap();
}

#[tokio::test]
async fn duplicate_upload_without_override_is_422() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);
    let fields = [("table_name", "dup_http"), ("has_header", "true")];

    let first = app
        .clone()
        .oneshot(upload_request(&fields, "data.csv", "id,name\n1,alice\n"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(upload_request(&fields, "data.csv", "id,name\n1,alice\n"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = body_json(second).await;
    assert_eq!(body["errors"][0]["code"], "DUPLICATE_TABLE_NAME");

    db.close().await.unwrap();
}

#[tokio::test]
async fn malicious_query_pattern_returns_500() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let response = app
        .oneshot(query_request(
            "/api/v1/query",
            r#"{"query":"SELECT 1 -- drop"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = body_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("malicious SQL pattern"));

    db.close().await.unwrap();
}

#[tokio::test]
async fn injection_upload_is_rejected_with_location() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let response = app
        .oneshot(upload_request(
            &[("table_name", "inj_http"), ("has_header", "true")],
            "data.csv",
            "id,payload\n1,=CMD('calc')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "SECURITY_VALIDATION_FAILED");
    assert_eq!(body["errors"][0]["details"]["line"], 2);
    assert_eq!(body["errors"][0]["details"]["column"], "payload");

    db.close().await.unwrap();
}

#[tokio::test]
async fn encoding_mismatch_is_reported() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let response = app
        .oneshot(upload_request(
            &[
                ("table_name", "enc_http"),
                ("has_header", "true"),
                ("csv_file_encoding", "utf-16"),
            ],
            "data.csv",
            "id,name\n1,alice\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "INVALID_ENCODING");
    assert!(body["errors"][0]["message"]
        .as_str()
        .unwrap()
        .contains("you specified utf-16 but detected utf-8"));

    db.close().await.unwrap();
}

#[tokio::test]
async fn missing_table_name_is_bad_request() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let response = app
        .oneshot(upload_request(&[], "data.csv", "id,name\n1,alice\n"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "INVALID_REQUEST_PARAMETERS");

    db.close().await.unwrap();
}

#[tokio::test]
async fn query_limit_is_applied() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let setup = app
        .clone()
        .oneshot(query_request(
            "/api/v1/query",
            r#"{"query":"CREATE TABLE lim (id INTEGER); INSERT INTO lim VALUES (1), (2), (3); SELECT COUNT(*) AS n FROM lim"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(setup.status(), StatusCode::OK);

    let response = app
        .oneshot(query_request(
            "/api/v1/query",
            r#"{"query":"SELECT id FROM lim","limit":1}"#,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["row_count"], 1);

    db.close().await.unwrap();
}

#[tokio::test]
async fn benchmark_param_includes_record() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let without = app
        .clone()
        .oneshot(query_request("/api/v1/query", r#"{"query":"SELECT 1 AS x"}"#))
        .await
        .unwrap();
    let body = body_json(without).await;
    assert!(body.get("benchmark").is_none());

    let with = app
        .oneshot(query_request(
            "/api/v1/query?benchmark=true",
            r#"{"query":"SELECT 1 AS x"}"#,
        ))
        .await
        .unwrap();
    let body = body_json(with).await;
    assert!(body["benchmark"]["timing"]["total_ms"].is_number());
    assert_eq!(body["benchmark"]["query_stats"]["rows_returned"], 1);

    db.close().await.unwrap();
}

#[tokio::test]
async fn tables_endpoint_lists_schema() {
    let (state, db) = test_state(test_config()).await;
    let app = build_router(state);

    let upload = app
        .clone()
        .oneshot(upload_request(
            &[("table_name", "schema_http"), ("has_header", "true")],
            "data.csv",
            "id,name\n1,alice\n",
        ))
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tables")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let tables = body["tables"].as_array().unwrap();
    let table = tables
        .iter()
        .find(|t| t["name"] == "schema_http")
        .expect("uploaded table listed");
    let columns = table["columns"].as_array().unwrap();
    assert_eq!(columns.len(), 2);
    assert!(columns[0]["name"].is_string());
    assert!(columns[0]["type"].is_string());
    assert!(columns[0]["nullable"].is_boolean());

    db.close().await.unwrap();
}

#[tokio::test]
async fn api_key_is_enforced_when_configured() {
    let mut config = test_config();
    config.api_key = Some("sekrit".to_string());
    let (state, db) = test_state(config).await;
    let app = build_router(state);

    let denied = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/healthcheck")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/healthcheck")
                .header("X-API-Key", "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/healthcheck")
                .header("X-API-Key", "sekrit")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    db.close().await.unwrap();
}
