//! `ccsync export`: wire a query, a source and the chosen output format
//! into an [`Orchestrator`] run.
//!
//! | Format | Sink | Checkpoints |
//! |--------|------|-------------|
//! | `json` | [`JsonSink`] | only with `--checkpoint-db` |
//! | `csv` | [`CsvSink`] (zip of CSV files) | only with `--checkpoint-db` |
//! | `xlsx` | [`XlsxSink`] (one worksheet per table) | only with `--checkpoint-db` |
//! | `markdown` | [`MarkdownSink`] | only with `--checkpoint-db` |
//! | `sql` | [`SqliteSink`] | same database as the tables |
//!
//! Only `sql` commits checkpoints page by page. The other formats write
//! their output on `finish`, so their checkpoints are committed after it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use commcare_sync_core::fingerprint::fingerprint_bytes;
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::query::CompiledQuery;
use commcare_sync_core::source::RemoteSource;
use commcare_sync_core::store::{CheckpointStore, TableSink};
use commcare_sync_core::watermark::{parse_timestamp, Watermark};

use crate::checkpoint::SqliteCheckpointStore;
use crate::config::Config;
use crate::connector_hq::{Credentials, HqSource};
use crate::db;
use crate::orchestrator::{ExportOptions, Orchestrator, RunSummary};
use crate::sink_csv::CsvSink;
use crate::sink_json::JsonSink;
use crate::sink_markdown::MarkdownSink;
use crate::sink_sql::SqliteSink;
use crate::sink_xlsx::XlsxSink;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
    Xlsx,
    Markdown,
    Sql,
}

/// Everything `ccsync export` needs beyond the config file.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub query_path: PathBuf,
    pub format: OutputFormat,
    pub output: Option<PathBuf>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub start_over: bool,
    pub checkpoint_db: Option<PathBuf>,
}

/// Parse a `--since` / `--until` argument into a time bound.
pub fn parse_bound(text: &str) -> Result<Watermark> {
    parse_timestamp(text)
        .map(Watermark::from_time)
        .ok_or_else(|| anyhow!("invalid date '{}': expected YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS", text))
}

fn read_query(path: &Path) -> Result<(Vec<u8>, CompiledQuery)> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read query file: {}", path.display()))?;
    let query = CompiledQuery::from_slice(&bytes)
        .with_context(|| format!("Invalid query file: {}", path.display()))?;
    Ok((bytes, query))
}

/// Export against CommCare HQ.
pub async fn run_export(
    config: &Config,
    request: &ExportRequest,
    credentials: Option<Credentials>,
    log: Arc<dyn RunLog>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    if credentials.is_none() {
        log.log(
            LogLevel::Warn,
            "no credentials given (--username / --password or COMMCARE_API_KEY); requests are unauthenticated",
        );
    }
    let source = Arc::new(HqSource::new(&config.hq, credentials, Arc::clone(&log))?);
    export_with_source(source, config, request, log, cancel).await
}

/// Export against any [`RemoteSource`].
pub async fn export_with_source(
    source: Arc<dyn RemoteSource>,
    config: &Config,
    request: &ExportRequest,
    log: Arc<dyn RunLog>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let (bytes, query) = read_query(&request.query_path)?;
    let fingerprint = fingerprint_bytes(&bytes);

    let options = ExportOptions {
        run_id: config.export.run_id.clone(),
        page_size: config.export.page_size,
        since: request.since.as_deref().map(parse_bound).transpose()?,
        until: request.until.as_deref().map(parse_bound).transpose()?,
        start_over: request.start_over,
        missing_value: config
            .export
            .missing_value
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        parallel_resources: config.export.parallel_resources,
        query_label: Some(request.query_path.display().to_string()),
    };

    let mut checkpoints: Option<Arc<dyn CheckpointStore>> = None;
    if let Some(path) = &request.checkpoint_db {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(path).await?);
        checkpoints = Some(store);
    }

    let sink: Arc<dyn TableSink> = match request.format {
        OutputFormat::Json => Arc::new(JsonSink::new(request.output.clone(), Arc::clone(&log))),
        OutputFormat::Csv => {
            let Some(path) = &request.output else {
                bail!("--output is required for csv output (a .zip archive path)");
            };
            Arc::new(CsvSink::new(path.clone(), Arc::clone(&log)))
        }
        OutputFormat::Xlsx => {
            let Some(path) = &request.output else {
                bail!("--output is required for xlsx output (a .xlsx workbook path)");
            };
            Arc::new(XlsxSink::new(path.clone(), Arc::clone(&log)))
        }
        OutputFormat::Markdown => {
            let out: Box<dyn std::io::Write + Send> = match &request.output {
                Some(path) => Box::new(
                    std::fs::File::create(path)
                        .with_context(|| format!("Failed to create {}", path.display()))?,
                ),
                None => Box::new(std::io::stdout()),
            };
            Arc::new(MarkdownSink::new(out, Arc::clone(&log)))
        }
        OutputFormat::Sql => {
            let path = request.output.clone().unwrap_or_else(|| config.db.path.clone());
            let pool = db::open(&path).await?;
            if checkpoints.is_none() {
                let store: Arc<dyn CheckpointStore> =
                    Arc::new(SqliteCheckpointStore::new(pool.clone()));
                checkpoints = Some(store);
            }
            Arc::new(SqliteSink::new(pool, Arc::clone(&log)))
        }
    };

    let mut orchestrator = Orchestrator::new(source, Arc::clone(&log))
        .with_sink(sink)
        .with_cancellation(cancel);
    if let Some(store) = checkpoints {
        orchestrator = orchestrator.with_checkpoints(store);
    }

    log.log(
        LogLevel::Debug,
        &format!("query {} fingerprint {}", request.query_path.display(), fingerprint),
    );
    let summary = orchestrator.run(&query, &fingerprint, &options).await?;

    for resource in &summary.resources {
        log.log(
            LogLevel::Info,
            &format!(
                "{}: {} page(s), {} record(s), {} row(s){}",
                resource.resource,
                resource.pages,
                resource.records,
                resource.rows,
                if resource.cancelled { " (cancelled)" } else { "" }
            ),
        );
    }
    Ok(summary)
}

/// `ccsync dump-query`: the parsed definition as pretty JSON.
pub fn dump_query(path: &Path) -> Result<String> {
    let (_, query) = read_query(path)?;
    Ok(query.definition().to_pretty_json()?)
}
