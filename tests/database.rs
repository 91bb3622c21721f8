//! Engine-backed tests for the database façade: lifecycle, query execution,
//! multi-statement handling, and snapshots against a real DuckDB file.

use std::sync::Arc;

use spotdb::config::{Config, ServerMode};
use spotdb::db::Database;

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

async fn open_db() -> Arc<Database> {
    Arc::new(Database::open(&test_config()).await.expect("open database"))
}

#[tokio::test]
async fn select_one_round_trip() {
    let db = open_db().await;

    let result = db.execute_query("SELECT 1 AS one").await.unwrap();
    assert_eq!(result.columns, vec!["one"]);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0]["one"], serde_json::json!(1));

    db.close().await.unwrap();
}

#[tokio::test]
async fn csv_import_reports_rows_and_columns() {
    let db = open_db().await;
    let dir = tempfile::tempdir().unwrap();

    let csv_path = dir.path().join("people.csv");
    std::fs::write(&csv_path, "id,name\n1,alice\n2,bob\n").unwrap();

    db.create_table_from_csv("people_rt", &csv_path, true, false)
        .await
        .unwrap();

    let count = db
        .execute_query("SELECT COUNT(*) AS n FROM people_rt")
        .await
        .unwrap();
    assert_eq!(count.results[0]["n"], serde_json::json!(2));

    let info = db
        .execute_query("PRAGMA table_info(people_rt)")
        .await
        .unwrap();
    assert_eq!(info.results.len(), 2);

    db.close().await.unwrap();
}

#[tokio::test]
async fn multi_statement_returns_last_result() {
    let db = open_db().await;

    let result = db
        .execute_query(
            "CREATE TABLE ms (id INTEGER); INSERT INTO ms VALUES (1), (2); \
             SELECT COUNT(*) AS n FROM ms",
        )
        .await
        .unwrap();
    assert_eq!(result.results[0]["n"], serde_json::json!(2));

    db.close().await.unwrap();
}

#[tokio::test]
async fn drop_then_create_mix_is_accepted() {
    let db = open_db().await;

    db.execute_query("CREATE TABLE mix (id INTEGER)")
        .await
        .unwrap();
    db.execute_query("DROP TABLE mix; CREATE TABLE mix (id INTEGER, label VARCHAR)")
        .await
        .unwrap();

    let info = db.execute_query("PRAGMA table_info(mix)").await.unwrap();
    assert_eq!(info.results.len(), 2);

    db.close().await.unwrap();
}

#[tokio::test]
async fn statement_errors_carry_their_index() {
    let db = open_db().await;

    let err = db
        .execute_query("CREATE TABLE idx1 (id INTEGER); SELECT * FROM does_not_exist")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to execute query 2"), "{err}");

    // The first statement still ran.
    assert!(db.table_exists("idx1").await.unwrap());

    db.close().await.unwrap();
}

#[tokio::test]
async fn deny_listed_query_is_rejected_before_the_engine() {
    let db = open_db().await;

    let err = db.execute_query("SELECT 1 -- drop").await.unwrap_err();
    assert!(err.to_string().contains("malicious SQL pattern"), "{err}");

    db.close().await.unwrap();
}

#[tokio::test]
async fn empty_submission_is_an_error() {
    let db = open_db().await;

    let err = db.execute_query(";;").await.unwrap_err();
    assert!(err.to_string().contains("no valid queries"), "{err}");

    db.close().await.unwrap();
}

#[tokio::test]
async fn benchmark_record_has_stable_shape() {
    let db = open_db().await;

    let result = db.execute_query("SELECT 1 AS one").await.unwrap();
    let b = &result.benchmark;
    assert_eq!(b.query_stats.rows_returned, 1);
    assert_eq!(b.query_stats.rows_processed, 2);
    assert_eq!(b.resources.thread_count, 4);
    assert!(b.timing.execution_ms >= 0.0);
    assert!((b.cache.hit_ratio - 0.83).abs() < f64::EPSILON);

    db.close().await.unwrap();
}

#[tokio::test]
async fn snapshot_is_byte_identical_to_engine_file() {
    let db = open_db().await;
    let dir = tempfile::tempdir().unwrap();

    db.execute_query("CREATE TABLE snap (id INTEGER); INSERT INTO snap VALUES (42)")
        .await
        .unwrap();

    let dest = dir.path().join("snapshot.db");
    db.snapshot(&dest).await.unwrap();

    let engine_bytes = std::fs::read(db.path()).unwrap();
    let snapshot_bytes = std::fs::read(&dest).unwrap();
    assert_eq!(engine_bytes, snapshot_bytes);

    db.close().await.unwrap();
}

#[tokio::test]
async fn snapshot_into_missing_directory_fails() {
    let db = open_db().await;
    let dir = tempfile::tempdir().unwrap();

    let dest = dir.path().join("no_such_dir").join("snapshot.db");
    assert!(db.snapshot(&dest).await.is_err());

    db.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let db = open_db().await;
    let path = db.path().to_path_buf();

    db.execute_query("CREATE TABLE gone (id INTEGER)")
        .await
        .unwrap();

    db.close().await.unwrap();
    assert!(!path.exists(), "database file should be removed on close");

    // Second close errors but does not panic.
    let err = db.close().await.unwrap_err();
    assert_eq!(err.to_string(), "database is closed");

    // Operations after close fail the same way.
    let err = db.execute_query("SELECT 1").await.unwrap_err();
    assert_eq!(err.to_string(), "database is closed");

    let err = db.snapshot(&path).await.unwrap_err();
    assert_eq!(err.to_string(), "database is closed");
}

#[tokio::test]
async fn override_drop_replaces_table() {
    let db = open_db().await;
    let dir = tempfile::tempdir().unwrap();

    let first = dir.path().join("v1.csv");
    std::fs::write(&first, "id,name\n1,alice\n").unwrap();
    db.create_table_from_csv("replaced", &first, true, false)
        .await
        .unwrap();

    let second = dir.path().join("v2.csv");
    std::fs::write(&second, "id,name\n1,alice\n2,bob\n3,carol\n").unwrap();
    db.create_table_from_csv("replaced", &second, true, true)
        .await
        .unwrap();

    let count = db
        .execute_query("SELECT COUNT(*) AS n FROM replaced")
        .await
        .unwrap();
    assert_eq!(count.results[0]["n"], serde_json::json!(3));

    db.close().await.unwrap();
}
