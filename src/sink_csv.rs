//! CSV output: one `<table>.csv` entry per table inside a zip archive.
//!
//! Rows are buffered in a [`MemorySink`] (so keyed tables still upsert)
//! and the archive is written once, on `finish`.

use std::io::{Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use commcare_sync_core::error::SyncError;
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::models::{cell_text, Table};
use commcare_sync_core::store::memory::MemorySink;
use commcare_sync_core::store::TableSink;

pub struct CsvSink {
    path: PathBuf,
    buffer: MemorySink,
    log: Arc<dyn RunLog>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>, log: Arc<dyn RunLog>) -> Self {
        Self {
            path: path.into(),
            buffer: MemorySink::new(),
            log,
        }
    }
}

/// Render one table as CSV bytes, headings first.
pub fn table_to_csv(table: &Table) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.headings)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(|cell| cell_text(cell).unwrap_or_default()))?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Write every table into `out` as a zip archive.
pub fn write_archive<W: Write + Seek>(out: W, tables: &[Table]) -> anyhow::Result<()> {
    let mut zip = ZipWriter::new(out);
    let options = SimpleFileOptions::default();
    for table in tables {
        zip.start_file(format!("{}.csv", table.name), options)?;
        zip.write_all(&table_to_csv(table)?)?;
    }
    zip.finish()?;
    Ok(())
}

#[async_trait]
impl TableSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(&self, table: &Table) -> Result<(), SyncError> {
        self.buffer.write(table).await
    }

    async fn finish(&self) -> Result<(), SyncError> {
        let tables = self.buffer.tables();
        let file = std::fs::File::create(&self.path)
            .map_err(|e| SyncError::sink(&self.path.display().to_string(), e))?;
        write_archive(file, &tables)
            .map_err(|e| SyncError::sink(&self.path.display().to_string(), e))?;
        self.log.log(
            LogLevel::Info,
            &format!("wrote {} table(s) to {}", tables.len(), self.path.display()),
        );
        Ok(())
    }
}
