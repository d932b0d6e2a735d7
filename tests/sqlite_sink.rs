//! SQLite sink and checkpoint store, including the incremental window
//! scenario against a database on disk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use commcare_sync::checkpoint::SqliteCheckpointStore;
use commcare_sync::db;
use commcare_sync::config::Config;
use commcare_sync::export::{export_with_source, parse_bound, ExportRequest, OutputFormat};
use commcare_sync::orchestrator::{ExportOptions, Orchestrator};
use commcare_sync::sink_sql::SqliteSink;
use commcare_sync_core::error::{QueryError, SyncError};
use commcare_sync_core::log::{LogLevel, MemoryLog};
use commcare_sync_core::models::{Checkpoint, Table};
use commcare_sync_core::query::CompiledQuery;
use commcare_sync_core::source::{FetchParams, Page, RemoteSource, StaticSource};
use commcare_sync_core::store::{CheckpointStore, TableSink};
use commcare_sync_core::watermark::{format_timestamp, Watermark};

const FORMS_ONLY: &str = include_str!("fixtures/forms_only.json");

async fn open(tmp: &TempDir) -> SqlitePool {
    db::open(&tmp.path().join("export.sqlite")).await.unwrap()
}

fn table(name: &str, headings: &[&str], key: Option<&str>, rows: Vec<Vec<Value>>) -> Table {
    let mut t = Table::new(name, headings.iter().map(|h| h.to_string()).collect())
        .with_key(key.map(String::from));
    t.rows = rows;
    t
}

async fn select_all(pool: &SqlitePool, sql: &str) -> Vec<Vec<Option<String>>> {
    sqlx::query(sql)
        .fetch_all(pool)
        .await
        .unwrap()
        .iter()
        .map(|row| (0..row.len()).map(|i| row.get::<Option<String>, _>(i)).collect())
        .collect()
}

/// 24 forms, one every 13 days from 2012-01-10.
fn reference_forms() -> Vec<Value> {
    let start = Utc.with_ymd_and_hms(2012, 1, 10, 12, 0, 0).unwrap();
    (0..24)
        .map(|i| {
            let modified = start + Duration::days(13 * i);
            let received = modified - Duration::hours(2);
            json!({
                "id": format!("form-{:02}", i),
                "form": {"name": format!("visit {}", i)},
                "received_on": format_timestamp(received),
                "server_modified_on": format_timestamp(modified),
            })
        })
        .collect()
}

#[tokio::test]
async fn test_keyed_table_upserts() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    let sink = SqliteSink::new(pool.clone(), Arc::new(MemoryLog::new()));

    sink.write(&table("Forms", &["id", "name"], Some("id"), vec![vec![json!("1"), json!("a")]]))
        .await
        .unwrap();
    sink.write(&table(
        "Forms",
        &["id", "name"],
        Some("id"),
        vec![vec![json!("1"), json!("b")], vec![json!("2"), Value::Null]],
    ))
    .await
    .unwrap();

    assert_eq!(
        select_all(&pool, "SELECT id, name FROM \"Forms\" ORDER BY id").await,
        vec![
            vec![Some("1".to_string()), Some("b".to_string())],
            vec![Some("2".to_string()), None],
        ]
    );
}

#[tokio::test]
async fn test_unkeyed_table_appends_and_gains_columns() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    let log = Arc::new(MemoryLog::new());
    let sink = SqliteSink::new(pool.clone(), log.clone());

    sink.write(&table("Cases", &["case_id"], None, vec![vec![json!("c1")]]))
        .await
        .unwrap();
    sink.write(&table(
        "Cases",
        &["case_id", "owner"],
        None,
        vec![vec![json!("c1"), json!("u1")]],
    ))
    .await
    .unwrap();

    assert!(log.contains(LogLevel::Info, "added column `owner`"));
    assert_eq!(
        select_all(&pool, "SELECT case_id, owner FROM \"Cases\" ORDER BY rowid").await,
        vec![
            vec![Some("c1".to_string()), None],
            vec![Some("c1".to_string()), Some("u1".to_string())],
        ]
    );
}

#[tokio::test]
async fn test_checkpoint_store_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteCheckpointStore::open(&tmp.path().join("cp.sqlite"))
        .await
        .unwrap();

    assert!(store.get("fp", "default/form").await.unwrap().is_none());

    for (watermark, label) in [("2012-01-01T00:00:00Z", "q1"), ("2012-02-01T00:00:00Z", "q2")] {
        store
            .set(&Checkpoint {
                fingerprint: "fp".into(),
                run_id: "default/form".into(),
                watermark: Watermark::new(vec![json!(watermark), json!(null)]),
                query: Some(label.into()),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let cp = store.get("fp", "default/form").await.unwrap().unwrap();
    assert_eq!(cp.watermark.values(), &[json!("2012-02-01T00:00:00Z"), Value::Null]);
    assert_eq!(cp.query.as_deref(), Some("q2"));
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_incremental_window_and_rerun() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    let source = Arc::new(StaticSource::new().with_records("form", reference_forms()));
    let query = CompiledQuery::from_slice(FORMS_ONLY.as_bytes()).unwrap();
    let options = ExportOptions {
        page_size: 5,
        since: Some(parse_bound("2012-01-01").unwrap()),
        until: Some(parse_bound("2012-08-01").unwrap()),
        ..ExportOptions::default()
    };

    let orchestrator = || {
        let log = Arc::new(MemoryLog::new());
        Orchestrator::new(source.clone(), log.clone())
            .with_sink(Arc::new(SqliteSink::new(pool.clone(), log)))
            .with_checkpoints(Arc::new(SqliteCheckpointStore::new(pool.clone())))
    };

    orchestrator().run(&query, "fp", &options).await.unwrap();

    let expected: Vec<Vec<Option<String>>> = reference_forms()
        .into_iter()
        .take(16)
        .map(|f| {
            ["id", "name", "received_on", "server_modified_on"]
                .iter()
                .map(|field| {
                    let cell = if *field == "name" { &f["form"]["name"] } else { &f[*field] };
                    cell.as_str().map(String::from)
                })
                .collect()
        })
        .collect();
    let sql = "SELECT id, name, received_on, server_modified_on FROM \"Forms\" \
               ORDER BY server_modified_on";
    assert_eq!(select_all(&pool, sql).await, expected);

    // The rerun only re-fetches the record at the checkpoint.
    let second = orchestrator().run(&query, "fp", &options).await.unwrap();
    assert_eq!(second.resources[0].records, 1);
    assert_eq!(select_all(&pool, sql).await, expected);
}

/// Fails the second fetch.
struct DropsSecondPage {
    inner: StaticSource,
    fetches: AtomicUsize,
}

#[async_trait]
impl RemoteSource for DropsSecondPage {
    async fn fetch(&self, resource: &str, params: &FetchParams) -> Result<Page, SyncError> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(SyncError::fetch(resource, "connection reset"));
        }
        self.inner.fetch(resource, params).await
    }
}

#[tokio::test]
async fn test_json_export_keeps_checkpoint_when_a_later_page_fails() {
    let tmp = TempDir::new().unwrap();
    let query_path = tmp.path().join("query.json");
    std::fs::write(&query_path, FORMS_ONLY).unwrap();
    let checkpoint_db = tmp.path().join("cp.sqlite");
    let output = tmp.path().join("out.json");

    let mut config = Config::default();
    config.export.page_size = 2;
    let request = ExportRequest {
        query_path,
        format: OutputFormat::Json,
        output: Some(output.clone()),
        since: None,
        until: None,
        start_over: false,
        checkpoint_db: Some(checkpoint_db.clone()),
    };

    let failing = Arc::new(DropsSecondPage {
        inner: StaticSource::new().with_records("form", reference_forms()),
        fetches: AtomicUsize::new(0),
    });
    let result = export_with_source(
        failing,
        &config,
        &request,
        Arc::new(MemoryLog::new()),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
    assert!(!output.exists());

    let store = SqliteCheckpointStore::open(&checkpoint_db).await.unwrap();
    assert!(store.list().await.unwrap().is_empty());

    let summary = export_with_source(
        Arc::new(StaticSource::new().with_records("form", reference_forms())),
        &config,
        &request,
        Arc::new(MemoryLog::new()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(output.exists());

    let checkpoints = store.list().await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(
        Some(&checkpoints[0].watermark),
        summary.resources[0].watermark.as_ref()
    );

    let written: Value = serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
    assert_eq!(written[0]["rows"].as_array().unwrap().len(), 24);
}

#[tokio::test]
async fn test_long_headings_rejected_before_fetch() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    let long = "x".repeat(70);
    let definition = json!({"tables": [{"name": "T", "source": "form",
        "columns": [{"heading": long, "expr": "id"}]}]});
    let query = CompiledQuery::from_slice(definition.to_string().as_bytes()).unwrap();
    let source = Arc::new(StaticSource::new());

    let err = Orchestrator::new(source.clone(), Arc::new(MemoryLog::new()))
        .with_sink(Arc::new(SqliteSink::new(pool, Arc::new(MemoryLog::new()))))
        .run(&query, "fp", &ExportOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::Query(QueryError::HeadingTooLong { max: 63, .. })
    ));
    assert!(source.requests().is_empty());
}
