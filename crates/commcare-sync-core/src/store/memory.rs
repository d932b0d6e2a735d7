//! In-memory [`TableSink`] and [`CheckpointStore`] implementations for
//! tests and JSON output.
//!
//! Uses `Vec` behind `std::sync::RwLock`. Tables keep the order in which
//! they were first written.

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncError;
use crate::models::{Checkpoint, Row, Table};

use super::{CheckpointStore, TableSink};

/// Accumulates every written table.
#[derive(Default)]
pub struct MemorySink {
    tables: RwLock<Vec<Table>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all tables in first-write order.
    pub fn tables(&self) -> Vec<Table> {
        self.tables.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.tables
            .read()
            .ok()?
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }
}

/// Extend `target`'s headings with any new ones from `incoming`, padding
/// existing rows with nulls.
fn merge_headings(target: &mut Table, incoming: &[String]) {
    for heading in incoming {
        if !target.headings.contains(heading) {
            target.headings.push(heading.clone());
            for row in &mut target.rows {
                row.push(Value::Null);
            }
        }
    }
}

/// Reorder `row` (laid out per `from`) into `to`'s heading order.
fn align_row(row: &Row, from: &[String], to: &[String]) -> Row {
    to.iter()
        .map(|heading| {
            from.iter()
                .position(|h| h == heading)
                .and_then(|i| row.get(i).cloned())
                .unwrap_or(Value::Null)
        })
        .collect()
}

#[async_trait]
impl TableSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, table: &Table) -> Result<(), SyncError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| SyncError::sink(&table.name, e))?;

        let index = match tables.iter().position(|t| t.name == table.name) {
            Some(i) => i,
            None => {
                tables.push(Table::new(table.name.clone(), Vec::new()).with_key(table.key.clone()));
                tables.len() - 1
            }
        };
        let target = &mut tables[index];
        merge_headings(target, &table.headings);

        let key_index = target.key_index();
        for row in &table.rows {
            let aligned = align_row(row, &table.headings, &target.headings);
            let existing = key_index.and_then(|k| {
                target
                    .rows
                    .iter()
                    .position(|r| r.get(k) == aligned.get(k))
            });
            match existing {
                Some(i) => target.rows[i] = aligned,
                None => target.rows.push(aligned),
            }
        }
        Ok(())
    }
}

/// Checkpoints kept in memory, along with the history of every `set`.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    history: RwLock<Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkpoint ever written, oldest first.
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, fingerprint: &str, run_id: &str) -> Result<Option<Checkpoint>, SyncError> {
        let history = self
            .history
            .read()
            .map_err(|e| SyncError::Checkpoint(e.to_string()))?;
        Ok(history
            .iter()
            .rev()
            .find(|c| c.fingerprint == fingerprint && c.run_id == run_id)
            .cloned())
    }

    async fn set(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        self.history
            .write()
            .map_err(|e| SyncError::Checkpoint(e.to_string()))?
            .push(checkpoint.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, SyncError> {
        let history = self
            .history
            .read()
            .map_err(|e| SyncError::Checkpoint(e.to_string()))?;
        let mut latest: Vec<Checkpoint> = Vec::new();
        for checkpoint in history.iter() {
            match latest
                .iter_mut()
                .find(|c| c.fingerprint == checkpoint.fingerprint && c.run_id == checkpoint.run_id)
            {
                Some(slot) => *slot = checkpoint.clone(),
                None => latest.push(checkpoint.clone()),
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::Watermark;
    use chrono::Utc;
    use serde_json::json;

    fn table(headings: &[&str], key: Option<&str>, rows: Vec<Row>) -> Table {
        let mut t = Table::new("T", headings.iter().map(|h| h.to_string()).collect())
            .with_key(key.map(String::from));
        t.rows = rows;
        t
    }

    #[tokio::test]
    async fn test_keyed_writes_upsert() {
        let sink = MemorySink::new();
        sink.write(&table(&["id", "v"], Some("id"), vec![vec![json!("1"), json!("a")]]))
            .await
            .unwrap();
        sink.write(&table(
            &["id", "v"],
            Some("id"),
            vec![vec![json!("1"), json!("b")], vec![json!("2"), json!("c")]],
        ))
        .await
        .unwrap();

        let t = sink.table("T").unwrap();
        assert_eq!(t.rows, vec![vec![json!("1"), json!("b")], vec![json!("2"), json!("c")]]);
    }

    #[tokio::test]
    async fn test_unkeyed_writes_append_and_union_headings() {
        let sink = MemorySink::new();
        sink.write(&table(&["a"], None, vec![vec![json!("1")]])).await.unwrap();
        sink.write(&table(&["b", "a"], None, vec![vec![json!("x"), json!("2")]]))
            .await
            .unwrap();

        let t = sink.table("T").unwrap();
        assert_eq!(t.headings, vec!["a", "b"]);
        assert_eq!(
            t.rows,
            vec![vec![json!("1"), Value::Null], vec![json!("2"), json!("x")]]
        );
    }

    #[tokio::test]
    async fn test_checkpoint_store_keeps_latest() {
        let store = MemoryCheckpointStore::new();
        for day in ["2012-01-01", "2012-02-01"] {
            store
                .set(&Checkpoint {
                    fingerprint: "fp".into(),
                    run_id: "default/form".into(),
                    watermark: Watermark::new(vec![json!(day)]),
                    query: None,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let latest = store.get("fp", "default/form").await.unwrap().unwrap();
        assert_eq!(latest.watermark, Watermark::new(vec![json!("2012-02-01")]));
        assert!(store.get("fp", "default/case").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.history().len(), 2);
    }
}
