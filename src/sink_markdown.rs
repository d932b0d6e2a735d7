//! Markdown output, streamed as pages arrive.
//!
//! Each run of consecutive writes to the same table becomes one section:
//! a `## name` heading, a header row, then the rows. Keys are ignored, so a
//! re-delivered page shows up twice.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use commcare_sync_core::error::SyncError;
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::models::{cell_text, Table};
use commcare_sync_core::store::TableSink;

struct State {
    out: Box<dyn Write + Send>,
    current: Option<String>,
}

pub struct MarkdownSink {
    state: Mutex<State>,
    log: Arc<dyn RunLog>,
}

impl MarkdownSink {
    pub fn new(out: Box<dyn Write + Send>, log: Arc<dyn RunLog>) -> Self {
        Self {
            state: Mutex::new(State { out, current: None }),
            log,
        }
    }
}

fn escape(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', " ")
}

fn markdown_row<I, S>(cells: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let cells: Vec<String> = cells.into_iter().map(|c| escape(c.as_ref())).collect();
    format!("| {} |\n", cells.join(" | "))
}

/// The markdown for `table`, with a section header when `with_header`.
pub fn render_section(table: &Table, with_header: bool) -> String {
    let mut text = String::new();
    if with_header {
        text.push_str(&format!("\n## {}\n\n", table.name));
        text.push_str(&markdown_row(&table.headings));
        text.push_str(&markdown_row(table.headings.iter().map(|_| "---")));
    }
    for row in &table.rows {
        text.push_str(&markdown_row(
            row.iter().map(|cell| cell_text(cell).unwrap_or_default()),
        ));
    }
    text
}

#[async_trait]
impl TableSink for MarkdownSink {
    fn name(&self) -> &str {
        "markdown"
    }

    async fn write(&self, table: &Table) -> Result<(), SyncError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SyncError::sink(&table.name, e))?;
        let with_header = state.current.as_deref() != Some(table.name.as_str());
        let text = render_section(table, with_header);
        state
            .out
            .write_all(text.as_bytes())
            .map_err(|e| SyncError::sink(&table.name, e))?;
        state.current = Some(table.name.clone());
        Ok(())
    }

    async fn finish(&self) -> Result<(), SyncError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SyncError::sink("markdown", e))?;
        state.out.flush().map_err(|e| SyncError::sink("markdown", e))?;
        self.log.log(LogLevel::Debug, "markdown output flushed");
        Ok(())
    }
}
