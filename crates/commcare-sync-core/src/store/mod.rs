//! Storage abstractions for export runs.
//!
//! A [`TableSink`] receives the rows each page produces, table by table.
//! A [`CheckpointStore`] persists the last committed watermark per
//! `(query fingerprint, lineage)` pair.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Trait | In-memory | Native backends (`commcare-sync` crate) |
//! |-------|-----------|------------------------------------------|
//! | [`TableSink`] | [`MemorySink`](memory::MemorySink) | SQLite, CSV, XLSX, JSON, Markdown |
//! | [`CheckpointStore`] | [`MemoryCheckpointStore`](memory::MemoryCheckpointStore) | SQLite |

pub mod memory;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::models::{Checkpoint, Table};

#[async_trait]
pub trait TableSink: Send + Sync {
    /// Short label for log messages.
    fn name(&self) -> &str;

    /// Whether rows are persisted by the time `write` returns. Sinks that
    /// only persist in `finish` return false, which holds every checkpoint
    /// back until `finish` succeeded.
    fn is_durable(&self) -> bool {
        false
    }

    /// Longest column identifier the sink accepts, if bounded.
    fn max_identifier_len(&self) -> Option<usize> {
        None
    }

    /// Write one page worth of rows for a table. Keyed tables are upserted
    /// on their key column.
    async fn write(&self, table: &Table) -> Result<(), SyncError>;

    /// Called once after a successful run.
    async fn finish(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, fingerprint: &str, run_id: &str) -> Result<Option<Checkpoint>, SyncError>;

    /// Insert or replace the checkpoint for its `(fingerprint, run_id)`.
    async fn set(&self, checkpoint: &Checkpoint) -> Result<(), SyncError>;

    async fn list(&self) -> Result<Vec<Checkpoint>, SyncError>;
}
