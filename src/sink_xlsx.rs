//! Excel output: one worksheet per table in a single `.xlsx` workbook.
//!
//! Rows are buffered in a [`MemorySink`] and the workbook is saved on
//! `finish`, like the CSV archive.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rust_xlsxwriter::{Workbook, XlsxError};
use serde_json::Value;

use commcare_sync_core::error::SyncError;
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::models::{cell_text, Table};
use commcare_sync_core::store::memory::MemorySink;
use commcare_sync_core::store::TableSink;

/// Longest worksheet name Excel accepts.
pub const MAX_SHEET_NAME: usize = 31;

pub struct XlsxSink {
    path: PathBuf,
    buffer: MemorySink,
    log: Arc<dyn RunLog>,
}

impl XlsxSink {
    pub fn new(path: impl Into<PathBuf>, log: Arc<dyn RunLog>) -> Self {
        Self {
            path: path.into(),
            buffer: MemorySink::new(),
            log,
        }
    }
}

/// A worksheet name for `table` that Excel accepts and that is not in
/// `taken`.
pub fn sheet_name(table: &str, taken: &[String]) -> String {
    let cleaned: String = table
        .chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .collect();
    let base: String = match cleaned.trim_matches('\'') {
        "" => "Sheet".to_string(),
        name => name.chars().take(MAX_SHEET_NAME).collect(),
    };

    let mut name = base.clone();
    let mut n = 2;
    while taken.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
        let suffix = format!(" ({})", n);
        let keep = MAX_SHEET_NAME.saturating_sub(suffix.chars().count());
        name = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
        n += 1;
    }
    name
}

/// Build a workbook holding every table, headings in the first row.
pub fn build_workbook(tables: &[Table]) -> Result<Workbook, XlsxError> {
    let mut workbook = Workbook::new();
    let mut taken: Vec<String> = Vec::new();
    for table in tables {
        let name = sheet_name(&table.name, &taken);
        let sheet = workbook.add_worksheet();
        sheet.set_name(&name)?;
        taken.push(name);

        for (col, heading) in table.headings.iter().enumerate() {
            sheet.write_string(0, col as u16, heading)?;
        }
        for (i, row) in table.rows.iter().enumerate() {
            let r = i as u32 + 1;
            for (col, cell) in row.iter().enumerate() {
                let c = col as u16;
                match cell {
                    Value::Null => {}
                    Value::Bool(b) => {
                        sheet.write_boolean(r, c, *b)?;
                    }
                    Value::Number(n) => match n.as_f64() {
                        Some(f) => {
                            sheet.write_number(r, c, f)?;
                        }
                        None => {
                            sheet.write_string(r, c, n.to_string())?;
                        }
                    },
                    other => {
                        sheet.write_string(r, c, cell_text(other).unwrap_or_default())?;
                    }
                }
            }
        }
    }
    Ok(workbook)
}

#[async_trait]
impl TableSink for XlsxSink {
    fn name(&self) -> &str {
        "xlsx"
    }

    async fn write(&self, table: &Table) -> Result<(), SyncError> {
        self.buffer.write(table).await
    }

    async fn finish(&self) -> Result<(), SyncError> {
        let tables = self.buffer.tables();
        let target = self.path.display().to_string();
        let mut workbook = build_workbook(&tables).map_err(|e| SyncError::sink(&target, e))?;
        workbook
            .save(&self.path)
            .map_err(|e| SyncError::sink(&target, e))?;
        self.log.log(
            LogLevel::Info,
            &format!("wrote {} sheet(s) to {}", tables.len(), self.path.display()),
        );
        Ok(())
    }
}
