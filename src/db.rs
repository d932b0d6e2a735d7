//! SQLite connection handling.
//!
//! The export tables and the checkpoint table share one database file
//! for `--output-format sql`, so the sink and the checkpoint store write
//! through the same pool.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::migrate;

/// Open (creating if needed) the SQLite database at `db_path`.
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}

/// [`connect`], then make sure the checkpoint table exists.
pub async fn open(db_path: &Path) -> Result<SqlitePool> {
    let pool = connect(db_path).await?;
    migrate::run_migrations(&pool).await?;
    Ok(pool)
}
