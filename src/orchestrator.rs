//! Export orchestration.
//!
//! For every resource a compiled query reads, the orchestrator runs one
//! strictly sequential page loop:
//!
//! ```text
//! Start → Fetching → Normalizing → Writing → Checkpointing → (Fetching | Done)
//!                                                        any → Failed
//! ```
//!
//! A page's watermark (the ordering key of its last record) is committed to
//! the checkpoint store only after every sink accepted all of that page's
//! rows. When any sink only persists its output in
//! [`finish`](TableSink::finish), commits wait until every sink finished.
//! A failure anywhere leaves the previous checkpoint in place, so the next
//! run resumes at the last fully delivered page.
//!
//! Each fetch starts at the watermark inclusively. Records whose ordering
//! key equals the watermark are delivered again; keyed sinks absorb that
//! by upserting.
//!
//! Lineages are per resource: `"{run_id}/{resource}"` under the query's
//! fingerprint.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use commcare_sync_core::error::{QueryError, SyncError};
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::models::{record_id, Checkpoint, Record, Table};
use commcare_sync_core::query::{CompiledQuery, ResourcePlan};
use commcare_sync_core::source::{FetchParams, RemoteSource};
use commcare_sync_core::store::{CheckpointStore, TableSink};
use commcare_sync_core::watermark::Watermark;

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub run_id: String,
    /// Records requested per page. At least 2.
    pub page_size: usize,
    /// Inclusive lower bound used when there is no later checkpoint.
    pub since: Option<Watermark>,
    /// Exclusive upper bound.
    pub until: Option<Watermark>,
    /// Ignore stored checkpoints.
    pub start_over: bool,
    /// Cell value for empty extractions.
    pub missing_value: Value,
    pub parallel_resources: bool,
    /// Stored alongside checkpoints (usually the query path).
    pub query_label: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            run_id: "default".to_string(),
            page_size: 1000,
            since: None,
            until: None,
            start_over: false,
            missing_value: Value::Null,
            parallel_resources: false,
            query_label: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Start,
    Fetching,
    Normalizing,
    Writing,
    Checkpointing,
    Done,
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Start => "start",
            LoopState::Fetching => "fetching",
            LoopState::Normalizing => "normalizing",
            LoopState::Writing => "writing",
            LoopState::Checkpointing => "checkpointing",
            LoopState::Done => "done",
            LoopState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSummary {
    pub resource: String,
    pub pages: usize,
    /// Records delivered, counting re-fetched boundary records again.
    pub records: usize,
    pub rows: usize,
    /// Ordering key of the last record delivered in this run.
    pub watermark: Option<Watermark>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub resources: Vec<ResourceSummary>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn resource(&self, name: &str) -> Option<&ResourceSummary> {
        self.resources.iter().find(|r| r.resource == name)
    }
}

pub struct Orchestrator {
    source: Arc<dyn RemoteSource>,
    sinks: Vec<Arc<dyn TableSink>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    log: Arc<dyn RunLog>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(source: Arc<dyn RemoteSource>, log: Arc<dyn RunLog>) -> Self {
        Self {
            source,
            sinks: Vec::new(),
            checkpoints: None,
            log,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TableSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run every resource of `query`, then finish the sinks.
    pub async fn run(
        &self,
        query: &CompiledQuery,
        fingerprint: &str,
        options: &ExportOptions,
    ) -> Result<RunSummary, SyncError> {
        self.check(query, options)?;

        let resources = if options.parallel_resources {
            futures::future::try_join_all(
                query
                    .resources()
                    .iter()
                    .map(|plan| self.run_resource(plan, fingerprint, options)),
            )
            .await?
        } else {
            let mut done = Vec::with_capacity(query.resources().len());
            for plan in query.resources() {
                done.push(self.run_resource(plan, fingerprint, options).await?);
            }
            done
        };

        for sink in &self.sinks {
            sink.finish().await?;
        }

        if !self.commits_per_page() {
            if let Some(store) = &self.checkpoints {
                for summary in &resources {
                    if let Some(watermark) = &summary.watermark {
                        let lineage = lineage_key(options, &summary.resource);
                        store
                            .set(&checkpoint(fingerprint, lineage, watermark, options))
                            .await?;
                    }
                }
            }
        }

        let cancelled = resources.iter().any(|r| r.cancelled);
        Ok(RunSummary {
            resources,
            cancelled,
        })
    }

    /// Per-page commits need every sink to persist rows as they are written.
    fn commits_per_page(&self) -> bool {
        self.sinks.iter().all(|sink| sink.is_durable())
    }

    fn check(&self, query: &CompiledQuery, options: &ExportOptions) -> Result<(), SyncError> {
        if options.page_size < 2 {
            return Err(SyncError::Options(format!(
                "page size must be at least 2, got {}",
                options.page_size
            )));
        }
        if options.run_id.trim().is_empty() {
            return Err(SyncError::Options("run id must not be empty".to_string()));
        }
        for sink in &self.sinks {
            let Some(max) = sink.max_identifier_len() else {
                continue;
            };
            if let Some((table, heading)) = query.long_headings(max).into_iter().next() {
                return Err(QueryError::HeadingTooLong {
                    table,
                    heading,
                    max,
                }
                .into());
            }
        }
        if self.checkpoints.is_some() && !self.commits_per_page() {
            let deferred: Vec<&str> = self
                .sinks
                .iter()
                .filter(|sink| !sink.is_durable())
                .map(|sink| sink.name())
                .collect();
            self.log.log(
                LogLevel::Debug,
                &format!(
                    "checkpoints wait until {} finished writing",
                    deferred.join(", ")
                ),
            );
        }
        Ok(())
    }

    fn enter(&self, resource: &str, state: &mut LoopState, next: LoopState) {
        self.log.log(
            LogLevel::Debug,
            &format!("{}: {} -> {}", resource, state, next),
        );
        *state = next;
    }

    async fn run_resource(
        &self,
        plan: &ResourcePlan,
        fingerprint: &str,
        options: &ExportOptions,
    ) -> Result<ResourceSummary, SyncError> {
        let mut state = LoopState::Start;
        match self.drive(plan, fingerprint, options, &mut state).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.enter(&plan.resource, &mut state, LoopState::Failed);
                self.log.log(
                    LogLevel::Error,
                    &format!("{}: export failed, checkpoint not advanced: {}", plan.resource, e),
                );
                Err(e)
            }
        }
    }

    /// Where a lineage starts: the later of its checkpoint and `since`.
    async fn resolve_start(
        &self,
        resource: &str,
        fingerprint: &str,
        lineage: &str,
        options: &ExportOptions,
    ) -> Result<Option<Watermark>, SyncError> {
        let store = match &self.checkpoints {
            Some(store) if !options.start_over => store,
            _ => return Ok(options.since.clone()),
        };

        match store.get(fingerprint, lineage).await? {
            Some(cp) => match &options.since {
                Some(since) if *since > cp.watermark => Ok(Some(since.clone())),
                _ => {
                    self.log.log(
                        LogLevel::Info,
                        &format!("{}: resuming from {}", resource, cp.watermark.encode()),
                    );
                    Ok(Some(cp.watermark))
                }
            },
            None => {
                let previous = store
                    .list()
                    .await?
                    .into_iter()
                    .any(|cp| cp.run_id == lineage && cp.fingerprint != fingerprint);
                if previous {
                    self.log.log(
                        LogLevel::Info,
                        &format!(
                            "{}: query changed since the last run of `{}`, starting a new lineage",
                            resource, lineage
                        ),
                    );
                }
                Ok(options.since.clone())
            }
        }
    }

    async fn drive(
        &self,
        plan: &ResourcePlan,
        fingerprint: &str,
        options: &ExportOptions,
        state: &mut LoopState,
    ) -> Result<ResourceSummary, SyncError> {
        let resource = plan.resource.as_str();
        let lineage = lineage_key(options, resource);
        let mut watermark = self
            .resolve_start(resource, fingerprint, &lineage, options)
            .await?;
        let per_page = self.commits_per_page();

        let mut summary = ResourceSummary {
            resource: resource.to_string(),
            pages: 0,
            records: 0,
            rows: 0,
            watermark: None,
            cancelled: false,
        };

        loop {
            if self.cancel.is_cancelled() {
                self.log
                    .log(LogLevel::Info, &format!("{}: cancelled", resource));
                summary.cancelled = true;
                break;
            }

            self.enter(resource, state, LoopState::Fetching);
            let params = FetchParams {
                limit: options.page_size,
                order_by: plan.order_by.clone(),
                since: watermark.clone(),
                until: options.until.clone(),
            };
            let page = self.source.fetch(resource, &params).await?;
            let fetched = page.records.len();
            let last_key = page
                .records
                .last()
                .map(|r| Watermark::of_record(r, &plan.order_by));

            if let (Some(last), Some(current)) = (&last_key, &watermark) {
                if fetched >= options.page_size && last <= current {
                    return Err(SyncError::fetch(
                        resource,
                        format!(
                            "a full page of {} records did not advance past {}; \
                             increase the page size",
                            fetched,
                            current.encode()
                        ),
                    ));
                }
            }

            let records: Vec<Arc<Record>> = page.records.into_iter().map(Arc::new).collect();

            self.enter(resource, state, LoopState::Normalizing);
            let tables = self.extract(plan, &records, &options.missing_value)?;

            self.enter(resource, state, LoopState::Writing);
            for table in tables.iter().filter(|t| !t.is_empty()) {
                for sink in &self.sinks {
                    sink.write(table).await?;
                }
            }

            self.enter(resource, state, LoopState::Checkpointing);
            let rows: usize = tables.iter().map(|t| t.rows.len()).sum();
            summary.pages += 1;
            summary.records += records.len();
            summary.rows += rows;

            if let Some(last) = &last_key {
                if let Some(store) = self.checkpoints.as_ref().filter(|_| per_page) {
                    store
                        .set(&checkpoint(fingerprint, lineage.clone(), last, options))
                        .await?;
                }
                watermark = Some(last.clone());
                summary.watermark = Some(last.clone());
            }
            self.log.log(
                LogLevel::Info,
                &format!(
                    "{}: page {} delivered {} record(s), {} row(s)",
                    resource,
                    summary.pages,
                    records.len(),
                    rows
                ),
            );

            let reached_until = match (&last_key, &options.until) {
                (Some(last), Some(until)) => last >= until,
                _ => false,
            };
            if !page.has_more || fetched < options.page_size || reached_until {
                self.enter(resource, state, LoopState::Done);
                break;
            }
        }

        Ok(summary)
    }

    /// Apply every table plan of `plan` to every record of a page.
    fn extract(
        &self,
        plan: &ResourcePlan,
        records: &[Arc<Record>],
        missing: &Value,
    ) -> Result<Vec<Table>, SyncError> {
        let mut tables: Vec<Table> = plan.tables.iter().map(|t| t.empty_table()).collect();
        for record in records {
            for (table_plan, table) in plan.tables.iter().zip(tables.iter_mut()) {
                let rows = table_plan
                    .rows_for(record, missing)
                    .map_err(|e| SyncError::Normalization {
                        resource: plan.resource.clone(),
                        record_id: record_id(record),
                        message: e.to_string(),
                    })?;
                table.rows.extend(rows);
            }
        }
        Ok(tables)
    }
}

fn lineage_key(options: &ExportOptions, resource: &str) -> String {
    format!("{}/{}", options.run_id, resource)
}

fn checkpoint(
    fingerprint: &str,
    lineage: String,
    watermark: &Watermark,
    options: &ExportOptions,
) -> Checkpoint {
    Checkpoint {
        fingerprint: fingerprint.to_string(),
        run_id: lineage,
        watermark: watermark.clone(),
        query: options.query_label.clone(),
        updated_at: Utc::now(),
    }
}
