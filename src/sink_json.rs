//! JSON output: every table as `{name, headings, rows}` in one pretty
//! array, written to a file or stdout on `finish`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use commcare_sync_core::error::SyncError;
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::models::Table;
use commcare_sync_core::store::memory::MemorySink;
use commcare_sync_core::store::TableSink;

pub struct JsonSink {
    /// `None` prints to stdout.
    path: Option<PathBuf>,
    buffer: MemorySink,
    log: Arc<dyn RunLog>,
}

impl JsonSink {
    pub fn new(path: Option<PathBuf>, log: Arc<dyn RunLog>) -> Self {
        Self {
            path,
            buffer: MemorySink::new(),
            log,
        }
    }
}

/// Pretty JSON array of `{name, headings, rows}`.
pub fn render_json(tables: &[Table]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(tables)
}

#[async_trait]
impl TableSink for JsonSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn write(&self, table: &Table) -> Result<(), SyncError> {
        self.buffer.write(table).await
    }

    async fn finish(&self) -> Result<(), SyncError> {
        let tables = self.buffer.tables();
        let text = render_json(&tables).map_err(|e| SyncError::sink("json", e))?;
        match &self.path {
            Some(path) => {
                std::fs::write(path, text)
                    .map_err(|e| SyncError::sink(&path.display().to_string(), e))?;
                self.log.log(
                    LogLevel::Info,
                    &format!("wrote {} table(s) to {}", tables.len(), path.display()),
                );
            }
            None => println!("{}", text),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commcare_sync_core::log::MemoryLog;
    use serde_json::{json, Value};

    #[test]
    fn test_render_json() {
        let mut table = Table::new("Forms", vec!["id".into()]);
        table.rows.push(vec![json!("1")]);
        let parsed: Value = serde_json::from_str(&render_json(&[table]).unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!([{"name": "Forms", "headings": ["id"], "rows": [["1"]]}])
        );
    }

    #[tokio::test]
    async fn test_nothing_written_before_finish() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        let sink = JsonSink::new(Some(path.clone()), Arc::new(MemoryLog::new()));

        let mut table = Table::new("Forms", vec!["id".into()]).with_key(Some("id".into()));
        table.rows.push(vec![json!("1")]);
        sink.write(&table).await.unwrap();
        sink.write(&table).await.unwrap();
        assert!(!path.exists());

        sink.finish().await.unwrap();
        let parsed: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed[0]["rows"], json!([["1"]]));
    }
}
