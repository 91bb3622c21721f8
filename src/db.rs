//! DuckDB façade.
//!
//! Owns the one engine connection for the process. DuckDB connections are not
//! `Sync`, so the connection lives on a dedicated actor thread and requests
//! travel over an mpsc channel with oneshot replies. The façade in front of
//! the actor adds the pieces the transports share: query pre-flight
//! validation, quote-aware multi-statement splitting, benchmark accounting,
//! snapshot/restore, and the background cleanup of transient import tables.
//!
//! Lifecycle is one-shot: `Open → Closed`. The handle slot is a
//! `RwLock<Option<EngineHandle>>`; closing takes the handle out under the
//! write lock, so every later operation observes `None` and fails with
//! "database is closed".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::snapshot;

/// Transient tables carry this prefix and are dropped by the cleanup worker.
pub const TRANSIENT_TABLE_PREFIX: &str = "tmp_import_";

/// How long an enqueued transient table lives before it is dropped.
const CLEANUP_TTL: Duration = Duration::from_secs(30 * 60);
/// Sweep cadence of the cleanup worker.
const CLEANUP_TICK: Duration = Duration::from_secs(5 * 60);
/// Backlog of the cleanup queue.
const CLEANUP_QUEUE: usize = 100;

const ENGINE_QUEUE: usize = 1024;
const ROW_PROGRESS_INTERVAL: usize = 10_000;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is closed")]
    Closed,
    #[error("invalid SQL query: {0}")]
    InvalidQuery(String),
    #[error("failed to execute query {index}: {message}")]
    Statement { index: usize, message: String },
    #[error("no valid queries to execute")]
    NoStatements,
    #[error("failed to ping database: {0}")]
    Ping(String),
    #[error("failed to load snapshot from S3: {0}")]
    SnapshotSeed(String),
    #[error("{0}")]
    Engine(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Benchmark record
// ---------------------------------------------------------------------------

/// Per-query performance record with a stable shape.
///
/// Timing fields are measured (parsing, serialization) or derived (planning
/// is a nominal one-third of the first execution span; execution is the
/// remainder floored at zero). The resource, query-stat, and cache groups
/// are heuristic estimates scaled by row count; DuckDB does not expose the
/// underlying counters through this driver.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkMetrics {
    pub timing: BenchmarkTiming,
    pub resources: BenchmarkResources,
    pub query_stats: BenchmarkQueryStats,
    pub cache: BenchmarkCache,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkTiming {
    pub total_ms: i64,
    pub parsing_ms: f64,
    pub planning_ms: f64,
    pub execution_ms: f64,
    pub serialization_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkResources {
    pub peak_memory_bytes: i64,
    pub thread_count: i64,
    pub cpu_time_ms: i64,
    pub io_read_bytes: i64,
    pub io_write_bytes: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkQueryStats {
    pub rows_processed: i64,
    pub rows_returned: i64,
    pub operator_count: i64,
    pub scan_count: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkCache {
    pub hit_count: i64,
    pub miss_count: i64,
    pub hit_ratio: f64,
}

/// Result of a query submission: ordered columns, row maps, wall-clock
/// duration, and the benchmark record for the last statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub results: Vec<Map<String, Value>>,
    pub duration: Duration,
    pub benchmark: BenchmarkMetrics,
}

// ---------------------------------------------------------------------------
// Query validation and splitting
// ---------------------------------------------------------------------------

/// Deny-list applied before anything reaches the engine. The list is
/// authoritative: submissions it does not match are accepted, which includes
/// multi-statement `DROP TABLE ...; CREATE TABLE ...` mixes.
static DENY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bUNION\b.*\bSELECT\b",
        r"(?i)\bOR\b\s+\d+\s*=\s*\d+",
        r"--",
        r"(?is)/\*.*\*/",
        r"(?i)\bEXEC\b",
        r"(?i)\bXP_\w+\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("deny pattern must compile"))
    .collect()
});

/// Reject queries matching known injection shapes. Multiple semicolons are
/// logged but allowed.
pub fn validate_query(query: &str) -> Result<(), DbError> {
    if query.matches(';').count() > 1 {
        info!(query, "multiple SQL statements detected");
    }

    for pattern in DENY_PATTERNS.iter() {
        if pattern.is_match(query) {
            return Err(DbError::InvalidQuery(format!(
                "potentially malicious SQL pattern detected: {}",
                pattern.as_str()
            )));
        }
    }
    Ok(())
}

/// Split on `;` outside quotes. A quote (`'` or `"`) toggles the in-quote
/// state; a backslash suppresses the next character's special meaning.
pub fn split_statements(query: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escape_next = false;

    for ch in query.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
        } else if ch == '\\' {
            current.push(ch);
            escape_next = true;
        } else if ch == '\'' || ch == '"' {
            current.push(ch);
            in_quote = !in_quote;
        } else if ch == ';' && !in_quote {
            statements.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        statements.push(current);
    }
    statements
}

/// Map every rune outside `[A-Za-z0-9_]` to `_`.
pub fn sanitize_table_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// Engine actor
// ---------------------------------------------------------------------------

struct SingleTiming {
    parsing: Duration,
    planning: Duration,
    serialization: Duration,
}

struct SingleResult {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
    timing: SingleTiming,
}

enum EngineRequest {
    Query {
        sql: String,
        resp: oneshot::Sender<Result<SingleResult, String>>,
    },
    Batch {
        sql: String,
        resp: oneshot::Sender<Result<(), String>>,
    },
}

#[derive(Clone)]
struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn query(&self, sql: String) -> Result<SingleResult, DbError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Query { sql, resp: resp_tx })
            .await
            .map_err(|_| DbError::Closed)?;
        resp_rx
            .await
            .map_err(|_| DbError::Engine("engine dropped response".to_string()))?
            .map_err(DbError::Engine)
    }

    async fn batch(&self, sql: String) -> Result<(), DbError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Batch { sql, resp: resp_tx })
            .await
            .map_err(|_| DbError::Closed)?;
        resp_rx
            .await
            .map_err(|_| DbError::Engine("engine dropped response".to_string()))?
            .map_err(DbError::Engine)
    }
}

/// Spawn the engine thread. The closure opens the connection on the actor
/// thread itself; failures are reported back before the handle is returned.
async fn spawn_engine<F>(open: F) -> Result<EngineHandle, DbError>
where
    F: FnOnce() -> Result<duckdb::Connection, duckdb::Error> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(ENGINE_QUEUE);
    let (init_tx, init_rx) = oneshot::channel();

    std::thread::spawn(move || match open() {
        Ok(conn) => {
            let _ = init_tx.send(Ok(()));
            run_engine(conn, rx);
        }
        Err(e) => {
            let _ = init_tx.send(Err(e.to_string()));
        }
    });

    match init_rx.await {
        Ok(Ok(())) => Ok(EngineHandle { tx }),
        Ok(Err(e)) => Err(DbError::Engine(format!(
            "failed to open database connection: {e}"
        ))),
        Err(_) => Err(DbError::Engine("engine failed to start".to_string())),
    }
}

fn run_engine(conn: duckdb::Connection, mut rx: mpsc::Receiver<EngineRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            EngineRequest::Query { sql, resp } => {
                let _ = resp.send(execute_on_conn(&conn, &sql));
            }
            EngineRequest::Batch { sql, resp } => {
                let _ = resp.send(conn.execute_batch(&sql).map_err(|e| e.to_string()));
            }
        }
    }
}

fn execute_on_conn(conn: &duckdb::Connection, sql: &str) -> Result<SingleResult, String> {
    let parsing_start = Instant::now();
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| format!("failed to prepare query: {e}"))?;
    let parsing = parsing_start.elapsed();

    let execution_start = Instant::now();
    let mut rows = stmt
        .query([])
        .map_err(|e| format!("failed to execute query: {e}"))?;
    // Nominal planning estimate: one third of the initial execution span.
    let planning = execution_start.elapsed() / 3;

    let columns: Vec<String> = match rows.as_ref() {
        Some(stmt_ref) => (0..stmt_ref.column_count())
            .map(|i| {
                stmt_ref
                    .column_name(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("col{i}"))
            })
            .collect(),
        None => Vec::new(),
    };

    let serialization_start = Instant::now();
    let mut result_rows = Vec::new();
    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => return Err(format!("error during row iteration: {e}")),
        };
        let mut map = Map::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map(value_ref_to_json)
                .map_err(|e| format!("failed to scan row: {e}"))?;
            map.insert(col.clone(), value);
        }
        result_rows.push(map);

        if result_rows.len() % ROW_PROGRESS_INTERVAL == 0 {
            info!(rows = result_rows.len(), "query row streaming in progress");
        }
    }
    let serialization = serialization_start.elapsed();

    Ok(SingleResult {
        columns,
        rows: result_rows,
        timing: SingleTiming {
            parsing,
            planning,
            serialization,
        },
    })
}

/// Convert a DuckDB value to JSON. Binary values surface as strings.
fn value_ref_to_json(value: duckdb::types::ValueRef<'_>) -> Value {
    use duckdb::types::ValueRef;

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(v) => Value::Bool(v),
        ValueRef::TinyInt(v) => Value::from(v as i64),
        ValueRef::SmallInt(v) => Value::from(v as i64),
        ValueRef::Int(v) => Value::from(v as i64),
        ValueRef::BigInt(v) => Value::from(v),
        // Lossy for values outside the i64 range.
        ValueRef::HugeInt(v) => Value::from(v as i64),
        ValueRef::UTinyInt(v) => Value::from(v as i64),
        ValueRef::USmallInt(v) => Value::from(v as i64),
        ValueRef::UInt(v) => Value::from(v as i64),
        ValueRef::UBigInt(v) => Value::from(v as i64),
        ValueRef::Float(v) => serde_json::Number::from_f64(v as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(v) => Value::String(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::String(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Timestamp(unit, v) => {
            let micros = match unit {
                duckdb::types::TimeUnit::Second => v.saturating_mul(1_000_000),
                duckdb::types::TimeUnit::Millisecond => v.saturating_mul(1_000),
                duckdb::types::TimeUnit::Microsecond => v,
                duckdb::types::TimeUnit::Nanosecond => v / 1_000,
            };
            let secs = micros.div_euclid(1_000_000);
            let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
            match chrono::DateTime::from_timestamp(secs, nanos) {
                Some(dt) => Value::String(dt.to_rfc3339()),
                None => Value::from(micros),
            }
        }
        ValueRef::Date32(days) => {
            match chrono::NaiveDate::from_num_days_from_ce_opt(719_163 + days) {
                Some(date) => Value::String(date.format("%Y-%m-%d").to_string()),
                None => Value::from(days as i64),
            }
        }
        ValueRef::Time64(unit, v) => {
            let micros = match unit {
                duckdb::types::TimeUnit::Second => v.saturating_mul(1_000_000),
                duckdb::types::TimeUnit::Millisecond => v.saturating_mul(1_000),
                duckdb::types::TimeUnit::Microsecond => v,
                duckdb::types::TimeUnit::Nanosecond => v / 1_000,
            };
            let secs = (micros / 1_000_000) as u32;
            let nanos = ((micros % 1_000_000) * 1_000) as u32;
            match chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos) {
                Some(time) => Value::String(time.format("%H:%M:%S%.6f").to_string()),
                None => Value::from(micros),
            }
        }
        other => Value::String(format!("{other:?}")),
    }
}

fn benchmark_metrics(total: Duration, timing: &SingleTiming, row_count: usize) -> BenchmarkMetrics {
    let parsing_ms = timing.parsing.as_millis() as f64;
    let planning_ms = timing.planning.as_millis() as f64;
    let serialization_ms = timing.serialization.as_millis() as f64;
    let execution_ms =
        (total.as_millis() as f64 - parsing_ms - planning_ms - serialization_ms).max(0.0);

    BenchmarkMetrics {
        timing: BenchmarkTiming {
            total_ms: total.as_millis() as i64,
            parsing_ms,
            planning_ms,
            execution_ms,
            serialization_ms,
        },
        resources: BenchmarkResources {
            peak_memory_bytes: (row_count * 1024) as i64,
            thread_count: 4,
            cpu_time_ms: (total.as_millis() as f64 * 0.8) as i64,
            io_read_bytes: (row_count * 256) as i64,
            io_write_bytes: 0,
        },
        query_stats: BenchmarkQueryStats {
            rows_processed: (row_count * 2) as i64,
            rows_returned: row_count as i64,
            operator_count: 3,
            scan_count: 1,
        },
        cache: BenchmarkCache {
            hit_count: 10,
            miss_count: 2,
            hit_ratio: 0.83,
        },
    }
}

// ---------------------------------------------------------------------------
// Database handle
// ---------------------------------------------------------------------------

/// The shared database handle. Cheap to clone behind `Arc` by the transport
/// surfaces; only the lifecycle owner may call [`Database::close`].
pub struct Database {
    handle: Arc<RwLock<Option<EngineHandle>>>,
    db_path: PathBuf,
    cancel: CancellationToken,
    cleanup_tx: mpsc::Sender<String>,
}

impl Database {
    /// Open the engine, optionally seeding it from an object-store snapshot.
    ///
    /// A configured `SNAPSHOT_LOCATION` pins the database file to a fixed
    /// path and downloads the snapshot before opening; any failure there is
    /// fatal to startup. Otherwise each process gets a unique file under the
    /// temp directory. A failed ping of the fresh connection also aborts.
    pub async fn open(config: &Config) -> Result<Database, DbError> {
        let temp_dir = std::env::temp_dir();

        let db_path = match &config.snapshot_location {
            Some(location) => {
                let path = temp_dir.join("duckdb.db");
                info!(location = %location, "snapshot location configured, seeding database");
                let client = snapshot::S3Client::from_env()
                    .map_err(|e| DbError::SnapshotSeed(e.to_string()))?;
                client
                    .download_snapshot(location, &path)
                    .await
                    .map_err(|e| DbError::SnapshotSeed(e.to_string()))?;
                info!(path = %path.display(), "snapshot downloaded and ready to use");
                path
            }
            None => temp_dir.join(format!("duckdb_{}.db", Uuid::new_v4())),
        };

        let open_path = db_path.clone();
        let handle = spawn_engine(move || duckdb::Connection::open(open_path)).await?;

        // A connection that cannot answer SELECT 1 is unusable.
        handle
            .query("SELECT 1".to_string())
            .await
            .map_err(|e| DbError::Ping(e.to_string()))?;

        let cancel = CancellationToken::new();
        let (cleanup_tx, cleanup_rx) = mpsc::channel(CLEANUP_QUEUE);
        let handle = Arc::new(RwLock::new(Some(handle)));

        tokio::spawn(cleanup_worker(
            Arc::clone(&handle),
            cancel.clone(),
            cleanup_rx,
        ));

        info!(path = %db_path.display(), "database initialized");

        Ok(Database {
            handle,
            db_path,
            cancel,
            cleanup_tx,
        })
    }

    /// Path of the engine's persistent file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Execute one or more semicolon-separated statements.
    ///
    /// Statements run sequentially, left to right; the first failure aborts
    /// the remainder and is wrapped with its 1-based statement index. The
    /// returned result is the last non-empty statement's.
    pub async fn execute_query(&self, query: &str) -> Result<QueryResult, DbError> {
        let handle = {
            let guard = self.handle.read().await;
            guard.as_ref().ok_or(DbError::Closed)?.clone()
        };

        validate_query(query)?;

        let statements = split_statements(query);
        info!(quantity = statements.len(), "query split into statements");

        let start = Instant::now();
        let mut last: Option<SingleResult> = None;

        for (i, statement) in statements.iter().enumerate() {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }

            let result = handle
                .query(statement.to_string())
                .await
                .map_err(|e| DbError::Statement {
                    index: i + 1,
                    message: e.to_string(),
                })?;
            last = Some(result);
        }

        let last = last.ok_or(DbError::NoStatements)?;
        let duration = start.elapsed();
        info!(duration_ms = duration.as_millis() as u64, "all statements completed");

        let benchmark = benchmark_metrics(duration, &last.timing, last.rows.len());

        Ok(QueryResult {
            columns: last.columns,
            results: last.rows,
            duration,
            benchmark,
        })
    }

    /// Materialize a CSV file as a table using the engine's native reader.
    ///
    /// With `override_existing` the table is dropped first; there is no
    /// transactional guarantee, so a failed create after the drop leaves the
    /// table absent.
    pub async fn create_table_from_csv(
        &self,
        table_name: &str,
        csv_path: &Path,
        has_header: bool,
        override_existing: bool,
    ) -> Result<(), DbError> {
        let guard = self.handle.write().await;
        let handle = guard.as_ref().ok_or(DbError::Closed)?;

        let table = sanitize_table_name(table_name);
        info!(table = %table, path = %csv_path.display(), "direct CSV import");

        if override_existing {
            handle
                .batch(format!("DROP TABLE IF EXISTS {table}"))
                .await
                .map_err(|e| DbError::Engine(format!("failed to drop table: {e}")))?;
        }

        let path_literal = csv_path.display().to_string().replace('\'', "''");
        let create = format!(
            "CREATE TABLE {table} AS SELECT * FROM read_csv('{path_literal}', \
             header={has_header}, auto_detect=true, sample_size=-1, normalize_names=true);"
        );
        handle
            .batch(create)
            .await
            .map_err(|e| DbError::Engine(format!("failed to create table from CSV: {e}")))?;

        Ok(())
    }

    /// True when the (sanitized) table exists in the main schema.
    pub async fn table_exists(&self, table_name: &str) -> Result<bool, DbError> {
        let table = sanitize_table_name(table_name);
        let result = self
            .execute_query(&format!(
                "SELECT COUNT(*) AS table_count FROM information_schema.tables \
                 WHERE table_schema = 'main' AND table_name = '{table}'"
            ))
            .await?;

        Ok(result
            .results
            .first()
            .and_then(|row| row.get("table_count"))
            .and_then(|v| v.as_i64())
            .is_some_and(|n| n > 0))
    }

    /// Force a checkpoint and copy the engine file byte-for-byte to `dest`.
    pub async fn snapshot(&self, dest: &Path) -> Result<(), DbError> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(DbError::Closed)?;

        handle
            .batch("CHECKPOINT".to_string())
            .await
            .map_err(|e| DbError::Engine(format!("failed to checkpoint database: {e}")))?;

        snapshot::copy_file(&self.db_path, dest)
            .map_err(|e| DbError::Engine(format!("failed to copy database file: {e}")))?;

        info!(source = %self.db_path.display(), dest = %dest.display(), "snapshot created");
        Ok(())
    }

    /// Enqueue a transient table for background cleanup.
    pub async fn enqueue_cleanup(&self, table_name: &str) {
        if self.cleanup_tx.send(table_name.to_string()).await.is_err() {
            warn!(table = table_name, "cleanup queue closed, table not scheduled");
        }
    }

    /// Cancel workers, close the engine, and remove the database file plus
    /// its write-ahead file. A second close returns an error but is safe;
    /// operations after close fail with "database is closed".
    pub async fn close(&self) -> Result<(), DbError> {
        let mut guard = self.handle.write().await;
        let handle = guard.take().ok_or(DbError::Closed)?;

        self.cancel.cancel();
        drop(handle); // channel close ends the engine thread

        if let Err(e) = std::fs::remove_file(&self.db_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(DbError::Engine(format!(
                    "failed to remove database file: {e}"
                )));
            }
        }
        let mut wal = self.db_path.as_os_str().to_owned();
        wal.push(".wal");
        let _ = std::fs::remove_file(PathBuf::from(wal));

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cleanup worker
// ---------------------------------------------------------------------------

/// Consumes transient table names and drops the expired ones.
///
/// Each enqueued name expires 30 minutes later; a 5-minute ticker sweeps the
/// map and issues `DROP TABLE IF EXISTS` for entries whose sanitized name
/// carries the transient prefix. Exits when the handle's token is cancelled.
async fn cleanup_worker(
    handle: Arc<RwLock<Option<EngineHandle>>>,
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<String>,
) {
    let mut ticker = tokio::time::interval(CLEANUP_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; consume it so sweeps start one period in.
    ticker.tick().await;

    let mut expiries: HashMap<String, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            Some(table) = rx.recv() => {
                let expiry = Instant::now() + CLEANUP_TTL;
                info!(table = %table, "added table to cleanup queue");
                expiries.insert(table, expiry);
            }
            _ = ticker.tick() => {
                sweep_expired(&handle, &mut expiries).await;
            }
        }
    }
}

async fn sweep_expired(
    handle: &Arc<RwLock<Option<EngineHandle>>>,
    expiries: &mut HashMap<String, Instant>,
) {
    let now = Instant::now();
    let expired: Vec<String> = expiries
        .iter()
        .filter(|(_, expiry)| now > **expiry)
        .map(|(name, _)| name.clone())
        .collect();

    for table in expired {
        if table.starts_with(TRANSIENT_TABLE_PREFIX) {
            let sanitized = sanitize_table_name(&table);
            let guard = handle.write().await;
            if let Some(engine) = guard.as_ref() {
                match engine
                    .batch(format!("DROP TABLE IF EXISTS {sanitized}"))
                    .await
                {
                    Ok(()) => info!(table = %sanitized, "dropped transient table"),
                    Err(e) => warn!(table = %sanitized, error = %e, "error dropping transient table"),
                }
            }
        }
        expiries.remove(&table);
    }
}
