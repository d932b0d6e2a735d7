use anyhow::Result;
use sqlx::SqlitePool;

/// Create the checkpoint table. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            query_fingerprint TEXT NOT NULL,
            run_id TEXT NOT NULL,
            watermark TEXT NOT NULL,
            query TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (query_fingerprint, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_updated_at ON checkpoints(updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
