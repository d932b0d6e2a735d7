//! Core data types that flow through an export run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::watermark::Watermark;

/// One resource instance as returned by the remote source.
pub type Record = Value;

/// Ordered cell values, one per table heading.
pub type Row = Vec<Value>;

/// A named table: headings plus rows.
///
/// Serializes as `{"name", "headings", "rows"}`. The key column is a sink
/// hint for idempotent upserts and is not part of the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub headings: Vec<String>,
    #[serde(skip)]
    pub key: Option<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(name: impl Into<String>, headings: Vec<String>) -> Self {
        Self {
            name: name.into(),
            headings,
            key: None,
            rows: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    /// Position of the key column among the headings.
    pub fn key_index(&self) -> Option<usize> {
        let key = self.key.as_deref()?;
        self.headings.iter().position(|h| h == key)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The last committed watermark of one lineage.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Fingerprint of the query definition.
    pub fingerprint: String,
    /// Lineage within the query: `"{run_id}/{resource}"`.
    pub run_id: String,
    pub watermark: Watermark,
    /// Human label for the query (usually its path).
    pub query: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Best-effort identifier of a record for error messages.
pub fn record_id(record: &Record) -> String {
    match record.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "<no id>".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Plain-text rendering of a cell for text-only sinks (CSV, Markdown,
/// SQL TEXT columns). `None` stands for a null cell.
pub fn cell_text(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_serializes_without_key() {
        let mut table = Table::new("Forms", vec!["id".into(), "name".into()])
            .with_key(Some("id".into()));
        table.rows.push(vec![json!("1"), json!("f1")]);
        assert_eq!(table.key_index(), Some(0));
        assert_eq!(
            serde_json::to_value(&table).unwrap(),
            json!({"name": "Forms", "headings": ["id", "name"], "rows": [["1", "f1"]]})
        );
    }

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&json!({"id": "abc"})), "abc");
        assert_eq!(record_id(&json!({"id": 7})), "7");
        assert_eq!(record_id(&json!({})), "<no id>");
    }

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(&Value::Null), None);
        assert_eq!(cell_text(&json!("x")), Some("x".to_string()));
        assert_eq!(cell_text(&json!(["a", "b"])), Some("[\"a\",\"b\"]".to_string()));
    }
}
