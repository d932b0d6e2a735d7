//! SQLite-backed [`CheckpointStore`].
//!
//! One row per `(query_fingerprint, run_id)`; `set` overwrites the row in a
//! single statement so a lineage always reads either the old or the new
//! watermark.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use commcare_sync_core::error::SyncError;
use commcare_sync_core::models::Checkpoint;
use commcare_sync_core::store::CheckpointStore;
use commcare_sync_core::watermark::Watermark;

use crate::db;

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `path` and make sure the checkpoint table exists.
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(db::open(path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn store_err(e: impl ToString) -> SyncError {
    SyncError::Checkpoint(e.to_string())
}

fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint, SyncError> {
    let watermark: String = row.try_get("watermark").map_err(store_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(store_err)?;
    Ok(Checkpoint {
        fingerprint: row.try_get("query_fingerprint").map_err(store_err)?,
        run_id: row.try_get("run_id").map_err(store_err)?,
        watermark: Watermark::decode(&watermark).map_err(store_err)?,
        query: row.try_get("query").map_err(store_err)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(store_err)?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, fingerprint: &str, run_id: &str) -> Result<Option<Checkpoint>, SyncError> {
        let row = sqlx::query(
            "SELECT query_fingerprint, run_id, watermark, query, updated_at \
             FROM checkpoints WHERE query_fingerprint = ? AND run_id = ?",
        )
        .bind(fingerprint)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn set(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (query_fingerprint, run_id, watermark, query, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(query_fingerprint, run_id) DO UPDATE SET
                watermark = excluded.watermark,
                query = excluded.query,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.fingerprint)
        .bind(&checkpoint.run_id)
        .bind(checkpoint.watermark.encode())
        .bind(&checkpoint.query)
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, SyncError> {
        let rows = sqlx::query(
            "SELECT query_fingerprint, run_id, watermark, query, updated_at \
             FROM checkpoints ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(row_to_checkpoint).collect()
    }
}

/// `ccsync checkpoints`: print every stored lineage.
pub async fn run_list(db_path: &Path) -> Result<()> {
    let store = SqliteCheckpointStore::open(db_path).await?;
    let checkpoints = store.list().await?;

    if checkpoints.is_empty() {
        println!("No checkpoints stored in {}.", db_path.display());
    } else {
        println!("{:<20} {:<28} {:<26} WATERMARK", "FINGERPRINT", "RUN", "UPDATED");
        for cp in &checkpoints {
            let short: String = cp.fingerprint.chars().take(16).collect();
            println!(
                "{:<20} {:<28} {:<26} {}",
                short,
                cp.run_id,
                cp.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                cp.watermark.encode()
            );
            if let Some(query) = &cp.query {
                println!("  query: {}", query);
            }
        }
    }

    store.pool.close().await;
    Ok(())
}
