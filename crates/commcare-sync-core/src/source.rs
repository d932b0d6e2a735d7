//! Remote resource source abstraction.
//!
//! A [`RemoteSource`] returns one page of records of a resource type,
//! sorted by the requested ordering fields and restricted to the
//! `[since, until)` watermark window. The orchestrator drives pagination
//! by advancing `since` to the last record of each committed page.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SyncError;
use crate::models::Record;
use crate::watermark::Watermark;

/// Parameters of one page request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchParams {
    pub limit: usize,
    pub order_by: Vec<String>,
    /// Inclusive lower bound.
    pub since: Option<Watermark>,
    /// Exclusive upper bound.
    pub until: Option<Watermark>,
}

/// One page of records.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// The source knows of more records past this page.
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, resource: &str, params: &FetchParams) -> Result<Page, SyncError>;
}

/// Serves records from memory and remembers every request it receives.
#[derive(Default)]
pub struct StaticSource {
    resources: Vec<(String, Vec<Record>)>,
    requests: Mutex<Vec<(String, FetchParams)>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, resource: impl Into<String>, records: Vec<Record>) -> Self {
        let resource = resource.into();
        match self.resources.iter_mut().find(|(r, _)| *r == resource) {
            Some((_, existing)) => existing.extend(records),
            None => self.resources.push((resource, records)),
        }
        self
    }

    /// Every `(resource, params)` pair fetched so far, in order.
    pub fn requests(&self) -> Vec<(String, FetchParams)> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteSource for StaticSource {
    async fn fetch(&self, resource: &str, params: &FetchParams) -> Result<Page, SyncError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((resource.to_string(), params.clone()));
        }

        let records = self
            .resources
            .iter()
            .find(|(r, _)| r == resource)
            .map(|(_, records)| records.as_slice())
            .unwrap_or_default();

        let mut keyed: Vec<(Watermark, &Record)> = records
            .iter()
            .map(|r| (Watermark::of_record(r, &params.order_by), r))
            .filter(|(key, _)| params.since.as_ref().map_or(true, |since| key >= since))
            .filter(|(key, _)| params.until.as_ref().map_or(true, |until| key < until))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let has_more = keyed.len() > params.limit;
        Ok(Page {
            records: keyed
                .into_iter()
                .take(params.limit)
                .map(|(_, r)| r.clone())
                .collect(),
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(limit: usize, since: Option<&str>) -> FetchParams {
        FetchParams {
            limit,
            order_by: vec!["modified".into()],
            since: since.map(|s| Watermark::new(vec![json!(s)])),
            until: None,
        }
    }

    #[tokio::test]
    async fn test_static_source_sorts_filters_and_limits() {
        let source = StaticSource::new().with_records(
            "form",
            vec![
                json!({"id": "c", "modified": "2012-03-01T00:00:00Z"}),
                json!({"id": "a", "modified": "2012-01-01T00:00:00Z"}),
                json!({"id": "b", "modified": "2012-02-01T00:00:00Z"}),
            ],
        );

        let page = source.fetch("form", &params(2, None)).await.unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b")]);
        assert!(page.has_more);

        let page = source
            .fetch("form", &params(2, Some("2012-02-01T00:00:00Z")))
            .await
            .unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("c")]);
        assert!(!page.has_more);

        let empty = source.fetch("case", &params(2, None)).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(source.requests().len(), 3);
    }
}
