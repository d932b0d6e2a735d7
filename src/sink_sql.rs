//! SQLite [`TableSink`].
//!
//! Every table is stored with TEXT columns named after its headings. The
//! schema follows the query: missing tables are created, new headings are
//! added as columns, and keyed tables get a unique index so repeated pages
//! upsert instead of duplicating rows. Each `write` runs in one
//! transaction.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use commcare_sync_core::error::SyncError;
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::models::{cell_text, Table};
use commcare_sync_core::store::TableSink;

/// Longest column name accepted (the PostgreSQL limit).
pub const MAX_IDENTIFIER_LEN: usize = 63;

pub struct SqliteSink {
    pool: SqlitePool,
    log: Arc<dyn RunLog>,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool, log: Arc<dyn RunLog>) -> Self {
        Self { pool, log }
    }

    async fn ensure_schema(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        table: &Table,
    ) -> Result<(), sqlx::Error> {
        let name = quote_ident(&table.name);
        let columns: Vec<String> = table
            .headings
            .iter()
            .map(|h| format!("{} TEXT", quote_ident(h)))
            .collect();
        let create = format!("CREATE TABLE IF NOT EXISTS {} ({})", name, columns.join(", "));
        sqlx::query(&create).execute(&mut **tx).await?;

        let pragma = format!("PRAGMA table_info({})", name);
        let existing: Vec<String> = sqlx::query(&pragma)
            .fetch_all(&mut **tx)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;

        for heading in &table.headings {
            if !existing.iter().any(|c| c == heading) {
                let alter = format!("ALTER TABLE {} ADD COLUMN {} TEXT", name, quote_ident(heading));
                sqlx::query(&alter).execute(&mut **tx).await?;
                self.log.log(
                    LogLevel::Info,
                    &format!("added column `{}` to table `{}`", heading, table.name),
                );
            }
        }

        if let Some(key) = &table.key {
            let index = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("uq_{}_{}", table.name, key)),
                name,
                quote_ident(key)
            );
            sqlx::query(&index).execute(&mut **tx).await?;
        }
        Ok(())
    }

    async fn write_rows(&self, table: &Table) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        self.ensure_schema(&mut tx, table).await?;

        let insert = insert_statement(table);
        for row in &table.rows {
            let mut query = sqlx::query(&insert);
            for cell in row {
                query = query.bind(cell_text(cell));
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await
    }
}

/// Quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn insert_statement(table: &Table) -> String {
    let columns: Vec<String> = table.headings.iter().map(|h| quote_ident(h)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&table.name),
        columns.join(", "),
        placeholders
    );

    if let Some(key) = &table.key {
        let updates: Vec<String> = table
            .headings
            .iter()
            .filter(|h| *h != key)
            .map(|h| format!("{0} = excluded.{0}", quote_ident(h)))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", quote_ident(key)));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT({}) DO UPDATE SET {}",
                quote_ident(key),
                updates.join(", ")
            ));
        }
    }
    sql
}

#[async_trait]
impl TableSink for SqliteSink {
    fn name(&self) -> &str {
        "sql"
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn max_identifier_len(&self) -> Option<usize> {
        Some(MAX_IDENTIFIER_LEN)
    }

    async fn write(&self, table: &Table) -> Result<(), SyncError> {
        self.write_rows(table)
            .await
            .map_err(|e| SyncError::sink(&table.name, e))?;
        self.log.log(
            LogLevel::Debug,
            &format!("wrote {} row(s) to `{}`", table.rows.len(), table.name),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("Forms"), "\"Forms\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_insert_statement_keyed() {
        let table = Table::new("Forms", vec!["id".into(), "name".into()])
            .with_key(Some("id".into()));
        assert_eq!(
            insert_statement(&table),
            "INSERT INTO \"Forms\" (\"id\", \"name\") VALUES (?, ?) \
             ON CONFLICT(\"id\") DO UPDATE SET \"name\" = excluded.\"name\""
        );
    }

    #[test]
    fn test_insert_statement_unkeyed() {
        let table = Table::new("Cases", vec!["case_id".into()]);
        assert_eq!(
            insert_statement(&table),
            "INSERT INTO \"Cases\" (\"case_id\") VALUES (?)"
        );
    }
}
