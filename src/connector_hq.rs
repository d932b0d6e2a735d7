//! CommCare HQ REST API source.
//!
//! Pages are fetched from `GET {base}/a/{project}/api/v{version}/{resource}/`
//! with the resource's ordering fields as repeated `order_by` parameters and
//! the watermark window applied to the first ordering field as
//! `{field}_start` / `{field}_end`. HQ can only filter on that one field, so
//! the exact tuple bounds are re-applied to every returned record.
//!
//! # Authentication
//!
//! - `apikey`: `Authorization: ApiKey <username>:<key>`
//! - `basic`: HTTP basic auth with username and password
//!
//! The secret is read from `--password` or the `COMMCARE_API_KEY`
//! environment variable.
//!
//! # Retries
//!
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - other HTTP 4xx → fail immediately
//! - network error → retry

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use commcare_sync_core::error::SyncError;
use commcare_sync_core::log::{LogLevel, RunLog};
use commcare_sync_core::models::Record;
use commcare_sync_core::source::{FetchParams, Page, RemoteSource};
use commcare_sync_core::watermark::Watermark;

use crate::config::{resolve_base_url, HqConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey,
    Basic,
}

impl AuthMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "apikey" => Ok(AuthMode::ApiKey),
            "basic" => Ok(AuthMode::Basic),
            other => bail!("Unknown auth mode: '{}'. Must be apikey or basic.", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub mode: AuthMode,
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    meta: ApiMeta,
    #[serde(default)]
    objects: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiMeta {
    #[serde(default)]
    next: Option<String>,
}

pub struct HqSource {
    client: reqwest::Client,
    base_url: String,
    project: String,
    api_version: String,
    credentials: Option<Credentials>,
    max_retries: u32,
    log: Arc<dyn RunLog>,
}

impl HqSource {
    pub fn new(
        config: &HqConfig,
        credentials: Option<Credentials>,
        log: Arc<dyn RunLog>,
    ) -> Result<Self> {
        let project = match &config.project {
            Some(p) if !p.trim().is_empty() => p.clone(),
            _ => bail!("hq.project is required (set it in the config or pass --project)"),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: resolve_base_url(&config.base_url),
            project,
            api_version: config.api_version.clone(),
            credentials,
            max_retries: config.max_retries,
            log,
        })
    }

    pub fn resource_url(&self, resource: &str) -> String {
        format!(
            "{}/a/{}/api/v{}/{}/",
            self.base_url, self.project, self.api_version, resource
        )
    }

    /// Fetch one API page with retry/backoff.
    async fn get_page(
        &self,
        resource: &str,
        query: &[(String, String)],
    ) -> Result<ApiResponse, SyncError> {
        let url = self.resource_url(resource);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                self.log.log(
                    LogLevel::Warn,
                    &format!("retrying {} in {}s (attempt {})", resource, delay.as_secs(), attempt),
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.get(&url).query(query);
            request = match &self.credentials {
                Some(Credentials {
                    mode: AuthMode::ApiKey,
                    username,
                    secret,
                }) => request.header("Authorization", format!("ApiKey {}:{}", username, secret)),
                Some(Credentials {
                    mode: AuthMode::Basic,
                    username,
                    secret,
                }) => request.basic_auth(username, Some(secret)),
                None => request,
            };

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<ApiResponse>()
                            .await
                            .map_err(|e| SyncError::fetch(resource, e));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = SyncError::fetch(
                        resource,
                        format!("CommCare HQ API error {}: {}", status, body_text),
                    );
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(SyncError::fetch(resource, e));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| SyncError::fetch(resource, "request failed after retries")))
    }
}

/// Query string for one page request at `offset`.
pub fn query_params(params: &FetchParams, offset: usize) -> Vec<(String, String)> {
    let mut query = vec![
        ("format".to_string(), "json".to_string()),
        ("limit".to_string(), params.limit.to_string()),
    ];
    for field in &params.order_by {
        query.push(("order_by".to_string(), field.clone()));
    }
    if let Some(field) = params.order_by.first() {
        if let Some(value) = params.since.as_ref().and_then(|w| w.values().first()) {
            query.push((format!("{}_start", field), param_text(value)));
        }
        if let Some(value) = params.until.as_ref().and_then(|w| w.values().first()) {
            query.push((format!("{}_end", field), param_text(value)));
        }
    }
    if offset > 0 {
        query.push(("offset".to_string(), offset.to_string()));
    }
    query
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn in_window(record: &Record, params: &FetchParams) -> bool {
    let key = Watermark::of_record(record, &params.order_by);
    params.since.as_ref().map_or(true, |since| &key >= since)
        && params.until.as_ref().map_or(true, |until| &key < until)
}

#[async_trait]
impl RemoteSource for HqSource {
    async fn fetch(&self, resource: &str, params: &FetchParams) -> Result<Page, SyncError> {
        let mut records = Vec::new();
        let mut offset = 0;

        loop {
            let query = query_params(params, offset);
            self.log.log(
                LogLevel::Debug,
                &format!("GET {} offset={}", self.resource_url(resource), offset),
            );
            let response = self.get_page(resource, &query).await?;
            let returned = response.objects.len();
            records.extend(response.objects.into_iter().filter(|r| in_window(r, params)));

            let next = response.meta.next.is_some();
            if records.len() >= params.limit || !next || returned == 0 {
                let truncated = records.len() > params.limit;
                records.truncate(params.limit);
                return Ok(Page {
                    records,
                    has_more: next || truncated,
                });
            }
            offset += returned;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> FetchParams {
        FetchParams {
            limit: 100,
            order_by: vec!["server_modified_on".into(), "received_on".into()],
            since: Some(Watermark::new(vec![json!("2012-01-01T00:00:00Z")])),
            until: Some(Watermark::new(vec![json!("2012-08-01T00:00:00Z")])),
        }
    }

    #[test]
    fn test_query_params() {
        let query = query_params(&params(), 0);
        let pairs: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(
            pairs,
            vec![
                ("format", "json"),
                ("limit", "100"),
                ("order_by", "server_modified_on"),
                ("order_by", "received_on"),
                ("server_modified_on_start", "2012-01-01T00:00:00Z"),
                ("server_modified_on_end", "2012-08-01T00:00:00Z"),
            ]
        );
        assert!(query_params(&params(), 200).contains(&("offset".to_string(), "200".to_string())));
    }

    #[test]
    fn test_window_is_half_open_on_the_tuple() {
        let mut p = params();
        p.since = Some(Watermark::new(vec![json!("2012-02-01T00:00:00Z"), json!("2012-01-31T00:00:00Z")]));
        let below = json!({"server_modified_on": "2012-02-01T00:00:00Z", "received_on": "2012-01-30T00:00:00Z"});
        let at = json!({"server_modified_on": "2012-02-01T00:00:00Z", "received_on": "2012-01-31T00:00:00Z"});
        let end = json!({"server_modified_on": "2012-08-01T00:00:00Z", "received_on": "2012-07-01T00:00:00Z"});
        assert!(!in_window(&below, &p));
        assert!(in_window(&at, &p));
        assert!(!in_window(&end, &p));
    }

    #[test]
    fn test_auth_mode_parse() {
        assert_eq!(AuthMode::parse("apikey").unwrap(), AuthMode::ApiKey);
        assert_eq!(AuthMode::parse("basic").unwrap(), AuthMode::Basic);
        assert!(AuthMode::parse("token").is_err());
    }
}
