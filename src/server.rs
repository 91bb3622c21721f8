//! HTTP API surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/v1/healthcheck` | Liveness probe, plain `OK` |
//! | `POST` | `/api/v1/upload` | Multipart CSV upload into a table |
//! | `POST` | `/api/v1/query` | Execute SQL, optional benchmark record |
//! | `GET`  | `/api/v1/tables` | List tables with column schemas |
//! | `POST` | `/api/v1/snapshot` | Checkpointed snapshot to object storage |
//! | `GET`  | `/explorer` | Static web explorer page |
//!
//! # Middleware
//!
//! Outermost to innermost: per-request logger (generated request id on a
//! tracing span), CORS, API-key check (`X-API-Key` against `API_KEY`), and a
//! per-client-IP fixed-window rate limit. Upload failures are reported as
//! `{"errors": [{code, message, details}]}` with the status mapped from the
//! error code; query/snapshot failures use `{"status", "message"}`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Query, State};
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{self, Config, ServerMode};
use crate::db::Database;
use crate::error::{ErrorCode, UploadError};
use crate::ingest::{self, CsvUpload};
use crate::snapshot::S3Client;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(db: Arc<Database>, config: Arc<Config>) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config));
        AppState { db, config, limiter }
    }
}

/// Serve the HTTP API until the token is cancelled.
pub async fn run_http_server(
    state: AppState,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "starting HTTP server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/healthcheck", get(handle_healthcheck))
        .route("/upload", post(handle_upload))
        .route("/query", post(handle_query))
        .route("/tables", get(handle_tables))
        .route("/snapshot", post(handle_snapshot));

    Router::new()
        .route("/explorer", get(handle_explorer))
        .nest("/api/v1", v1)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), api_key_middleware))
        .layer(cors_layer())
        .layer(middleware::from_fn(request_logger))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn request_logger(req: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client_ip = client_ip_of(&req);

    let span = info_span!(
        "request",
        id = %request_id,
        method = %method,
        path = %path,
        client_ip = %client_ip.map(|ip| ip.to_string()).unwrap_or_default(),
    );

    let start = Instant::now();
    let response = next.run(req).instrument(span.clone()).await;

    let _enter = span.enter();
    info!(
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

fn client_ip_of(req: &Request<axum::body::Body>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

async fn api_key_middleware(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided != expected {
        info!(path = req.uri().path(), "unauthorized access attempt");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Unauthorized",
                "message": "Invalid or missing API Key",
            })),
        )
            .into_response();
    }
    next.run(req).await
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(ip) = client_ip_of(&req) {
        if let Err(wait) = state.limiter.check(ip) {
            info!(client_ip = %ip, wait_ms = wait.as_millis() as u64, "rate limit exceeded");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                format!("Too many requests. Try again in {}ms", wait.as_millis()),
            )
                .into_response();
        }
    }
    next.run(req).await
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("content-length"),
            HeaderName::from_static("accept-encoding"),
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("accept"),
            HeaderName::from_static("origin"),
            HeaderName::from_static("cache-control"),
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(86400))
}

/// Fixed-window per-IP rate limiter.
///
/// One window per second with `limit` tokens; exhausted clients learn how
/// long to wait. Disabled entirely when the configured rate is 0 or the
/// server is not in release mode.
pub struct RateLimiter {
    enabled: bool,
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, (u32, Instant)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, enabled: bool) -> Self {
        RateLimiter {
            enabled: enabled && limit > 0,
            limit,
            window: Duration::from_secs(1),
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let enabled = config.rate_limit_rps > 0 && config.server_mode == ServerMode::Release;
        if !enabled {
            info!(
                mode = config.server_mode.as_str(),
                rps = config.rate_limit_rps,
                "rate limiting disabled"
            );
        } else {
            info!(requests_per_second = config.rate_limit_rps, "rate limiting enabled");
        }
        RateLimiter::new(config.rate_limit_rps, enabled)
    }

    /// Take a token for `ip`, or report how long until the window resets.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        if !self.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter lock poisoned");
        let entry = hits.entry(ip).or_insert((0, now));

        if now.duration_since(entry.1) >= self.window {
            *entry = (1, now);
            return Ok(());
        }
        if entry.0 < self.limit {
            entry.0 += 1;
            return Ok(());
        }
        Err(self.window.saturating_sub(now.duration_since(entry.1)))
    }
}

// ---------------------------------------------------------------------------
// Plain endpoints
// ---------------------------------------------------------------------------

async fn handle_healthcheck() -> &'static str {
    "OK"
}

async fn handle_explorer() -> Response {
    match tokio::fs::read_to_string("static/index.html").await {
        Ok(content) => Html(content).into_response(),
        Err(e) => {
            warn!(error = %e, "explorer page not available");
            (StatusCode::NOT_FOUND, "explorer page not found").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Query endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    benchmark: Option<String>,
}

#[derive(Serialize)]
struct StatusMessage {
    status: &'static str,
    message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(StatusMessage {
            status: "error",
            message: message.into(),
        }),
    )
        .into_response()
}

/// Append ` LIMIT n` when a positive limit is requested and the query does
/// not already carry one (case-insensitive).
fn apply_query_limit(query: &str, limit: i64) -> String {
    if limit > 0 && !query.to_uppercase().contains("LIMIT") {
        format!("{query} LIMIT {limit}")
    } else {
        query.to_string()
    }
}

/// The `benchmark` query parameter wins over `ENABLE_QUERY_BENCHMARKS`.
fn include_benchmarks(default_enabled: bool, param: Option<&str>) -> bool {
    match param {
        Some("true") => true,
        Some("false") => false,
        _ => default_enabled,
    }
}

async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    payload: Result<Json<QueryRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid query request: {e}"),
            );
        }
    };
    if payload.query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid query request: query is required");
    }

    let include = include_benchmarks(state.config.enable_benchmarks, params.benchmark.as_deref());
    let query = apply_query_limit(&payload.query, payload.limit);
    info!(query = %query, benchmark = include, "executing query");

    let result = match state.db.execute_query(&query).await {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to execute query: {e}"),
            );
        }
    };

    info!(
        duration_ms = result.duration.as_millis() as u64,
        rows = result.results.len(),
        "query executed successfully"
    );

    let mut body = json!({
        "status": "success",
        "row_count": result.results.len(),
        "columns": result.columns,
        "results": result.results,
        "duration_ms": result.duration.as_millis() as u64,
    });
    if include {
        body["benchmark"] = serde_json::to_value(&result.benchmark).unwrap_or(Value::Null);
    }
    Json(body).into_response()
}

// ---------------------------------------------------------------------------
// Tables endpoint
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TableColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    nullable: bool,
}

#[derive(Serialize)]
struct TableInfo {
    name: String,
    columns: Vec<TableColumn>,
}

#[derive(Serialize)]
struct TablesResponse {
    tables: Vec<TableInfo>,
}

async fn handle_tables(State(state): State<AppState>) -> Response {
    let tables_result = match state
        .db
        .execute_query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'main'",
        )
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "error listing tables");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list tables");
        }
    };

    let mut tables = Vec::new();
    for row in &tables_result.results {
        let Some(table_name) = row.get("table_name").and_then(|v| v.as_str()) else {
            continue;
        };

        let columns_query = format!(
            "SELECT column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = 'main' AND table_name = '{table_name}' \
             ORDER BY ordinal_position"
        );
        let columns_result = match state.db.execute_query(&columns_query).await {
            Ok(r) => r,
            Err(e) => {
                warn!(table = table_name, error = %e, "error getting table schema");
                continue;
            }
        };

        let columns = columns_result
            .results
            .iter()
            .map(|col| TableColumn {
                name: string_field(col, "column_name"),
                column_type: string_field(col, "data_type"),
                nullable: col.get("is_nullable").and_then(|v| v.as_str()) == Some("YES"),
            })
            .collect();

        tables.push(TableInfo {
            name: table_name.to_string(),
            columns,
        });
    }

    Json(TablesResponse { tables }).into_response()
}

fn string_field(row: &Map<String, Value>, key: &str) -> String {
    row.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Snapshot endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    bucket: String,
    key: String,
}

#[derive(Serialize)]
struct SnapshotResponse {
    status: &'static str,
    snapshot_uri: String,
    filename: String,
}

async fn handle_snapshot(
    State(state): State<AppState>,
    payload: Result<Json<SnapshotRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid snapshot request: {e}"),
            );
        }
    };
    if payload.bucket.is_empty() || payload.key.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid snapshot request: bucket and key are required",
        );
    }

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let filename = format!("snapshot-{timestamp}.db");
    let full_key = format!("{}/{}", payload.key.trim_end_matches('/'), filename);
    info!(bucket = %payload.bucket, key = %full_key, "creating snapshot");

    let temp_path = std::env::temp_dir().join(&filename);
    if let Err(e) = state.db.snapshot(&temp_path).await {
        warn!(error = %e, "failed to create snapshot");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to create snapshot: {e}"),
        );
    }
    let _guard = ScopedFile(temp_path.clone());

    let client = match S3Client::from_env() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to create S3 client");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create S3 client: {e}"),
            );
        }
    };

    let uri = match client
        .upload_snapshot(&temp_path, &payload.bucket, &full_key)
        .await
    {
        Ok(uri) => uri,
        Err(e) => {
            warn!(error = %e, "failed to upload snapshot");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to upload snapshot to S3: {e}"),
            );
        }
    };

    info!(uri = %uri, "snapshot created and uploaded");
    Json(SnapshotResponse {
        status: "success",
        snapshot_uri: uri,
        filename,
    })
    .into_response()
}

/// Removes a scratch file on scope exit; failures are logged only.
struct ScopedFile(PathBuf);

impl Drop for ScopedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "failed to remove scratch file");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Upload endpoint
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct UploadErrorsResponse {
    errors: Vec<UploadError>,
}

#[derive(Serialize)]
struct UploadResponse {
    table: String,
    columns: Vec<Map<String, Value>>,
    row_count: i64,
    import: Map<String, Value>,
}

fn upload_error_response(error: UploadError) -> Response {
    let status = StatusCode::from_u16(error.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(UploadErrorsResponse { errors: vec![error] })).into_response()
}

fn parse_form_bool(value: &str, default: bool) -> bool {
    match value {
        "true" | "1" => true,
        "false" | "0" => false,
        _ => default,
    }
}

/// Multipart form fields for an upload. Text fields may arrive in any order
/// relative to the file part: the file is spooled (size-capped) and the
/// validated copy runs after the whole form is read.
struct UploadForm {
    table_name: Option<String>,
    has_header: bool,
    override_existing: bool,
    smart: bool,
    encoding: String,
    spool: Option<(PathBuf, u64, String)>,
}

async fn read_upload_form(multipart: &mut Multipart) -> Result<(UploadForm, Option<ScopedFile>), UploadError> {
    let mut form = UploadForm {
        table_name: None,
        has_header: false,
        override_existing: false,
        smart: true,
        encoding: String::new(),
        spool: None,
    };
    let mut guard = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return Err(UploadError::new(
                    ErrorCode::InvalidRequestParameters,
                    format!("Invalid request: {e}"),
                ));
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "csv_file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let (path, written) = spool_file_field(field).await?;
                guard = Some(ScopedFile(path.clone()));
                form.spool = Some((path, written, file_name));
            }
            "table_name" => form.table_name = Some(read_text_field(field).await?),
            "has_header" => {
                form.has_header = parse_form_bool(&read_text_field(field).await?, false)
            }
            "override" => {
                form.override_existing = parse_form_bool(&read_text_field(field).await?, false)
            }
            "smart" => form.smart = parse_form_bool(&read_text_field(field).await?, true),
            "csv_file_encoding" => form.encoding = read_text_field(field).await?,
            _ => {}
        }
    }

    Ok((form, guard))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, UploadError> {
    field.text().await.map_err(|e| {
        UploadError::new(
            ErrorCode::InvalidRequestParameters,
            format!("Invalid request: {e}"),
        )
    })
}

/// Stream the file part to a scratch spool file, enforcing the size cap.
async fn spool_file_field(
    mut field: axum::extract::multipart::Field<'_>,
) -> Result<(PathBuf, u64), UploadError> {
    let path = std::env::temp_dir().join(format!("upload_spool_{}.csv", Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
        UploadError::new(
            ErrorCode::TempFileCreationError,
            format!("Failed to create temporary file: {e}"),
        )
    })?;
    let cleanup_on_error = ScopedFile(path.clone());

    let max_size = config::max_file_size();
    let mut written: u64 = 0;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                return Err(UploadError::new(
                    ErrorCode::FileOpenError,
                    format!("Failed to open uploaded file: {e}"),
                ));
            }
        };
        file.write_all(&chunk).await.map_err(|e| {
            UploadError::new(ErrorCode::FileCopyError, format!("Error processing file: {e}"))
        })?;
        written += chunk.len() as u64;
        if written > max_size {
            let max_gb = max_size / (1024 * 1024 * 1024);
            return Err(UploadError::new(
                ErrorCode::FileSizeExceeded,
                format!("File too large (max {max_gb}GB)"),
            ));
        }
    }
    file.flush().await.map_err(|e| {
        UploadError::new(ErrorCode::FileCopyError, format!("Error processing file: {e}"))
    })?;

    std::mem::forget(cleanup_on_error);
    Ok((path, written))
}

async fn handle_upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let (form, _spool_guard) = match read_upload_form(&mut multipart).await {
        Ok(parts) => parts,
        Err(e) => return upload_error_response(e),
    };

    let Some(table_name) = form.table_name.filter(|t| !t.is_empty()) else {
        return upload_error_response(UploadError::new(
            ErrorCode::InvalidRequestParameters,
            "Invalid request: table_name is required",
        ));
    };
    let Some((spool_path, size, file_name)) = form.spool else {
        return upload_error_response(UploadError::new(
            ErrorCode::InvalidRequestParameters,
            "Invalid request: csv_file is required",
        ));
    };

    info!(
        table = %table_name,
        has_header = form.has_header,
        smart = form.smart,
        encoding = %form.encoding,
        size_bytes = size,
        "CSV upload request received"
    );

    let upload = CsvUpload {
        table_name,
        file_name,
        size,
        has_header: form.has_header,
        override_existing: form.override_existing,
        declared_encoding: form.encoding,
    };

    match ingest::import_csv(&state.db, &upload, &spool_path).await {
        Ok(outcome) => {
            let mut import = Map::new();
            import.insert(
                "import_method".to_string(),
                Value::String(outcome.import_method.to_string()),
            );
            Json(UploadResponse {
                table: outcome.table,
                columns: outcome.columns,
                row_count: outcome.row_count,
                import,
            })
            .into_response()
        }
        Err(e) => upload_error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_appended_when_absent() {
        assert_eq!(apply_query_limit("SELECT * FROM t", 10), "SELECT * FROM t LIMIT 10");
    }

    #[test]
    fn limit_not_duplicated() {
        assert_eq!(
            apply_query_limit("SELECT * FROM t LIMIT 5", 10),
            "SELECT * FROM t LIMIT 5"
        );
        assert_eq!(
            apply_query_limit("select * from t limit 5", 10),
            "select * from t limit 5"
        );
    }

    #[test]
    fn zero_limit_leaves_query_alone() {
        assert_eq!(apply_query_limit("SELECT 1", 0), "SELECT 1");
        assert_eq!(apply_query_limit("SELECT 1", -3), "SELECT 1");
    }

    #[test]
    fn benchmark_param_wins_over_default() {
        assert!(include_benchmarks(false, Some("true")));
        assert!(!include_benchmarks(true, Some("false")));
        assert!(include_benchmarks(true, None));
        assert!(!include_benchmarks(false, None));
        assert!(include_benchmarks(true, Some("bogus")));
    }

    #[test]
    fn form_bool_parsing() {
        assert!(parse_form_bool("true", false));
        assert!(parse_form_bool("1", false));
        assert!(!parse_form_bool("false", true));
        assert!(parse_form_bool("whatever", true));
        assert!(!parse_form_bool("whatever", false));
    }

    #[test]
    fn rate_limiter_enforces_window() {
        let limiter = RateLimiter::new(2, true);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        let wait = limiter.check(ip).unwrap_err();
        assert!(wait <= Duration::from_secs(1));
        // A different client is unaffected.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(other).is_ok());
    }

    #[test]
    fn disabled_rate_limiter_always_allows() {
        let limiter = RateLimiter::new(0, true);
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        for _ in 0..100 {
            assert!(limiter.check(ip).is_ok());
        }
    }
}
