//! TOML configuration.
//!
//! Every section is optional; commands that only need a query file (or
//! whose settings all come from flags) run without a config file at all.
//!
//! ```toml
//! [hq]
//! base_url = "prod"
//! project = "demo"
//! auth_mode = "apikey"
//! username = "me@example.org"
//!
//! [export]
//! page_size = 1000
//! run_id = "default"
//!
//! [db]
//! path = "./data/ccsync.sqlite"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub hq: HqConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HqConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for HqConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            project: None,
            api_version: default_api_version(),
            auth_mode: default_auth_mode(),
            username: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_url() -> String {
    "prod".to_string()
}
fn default_api_version() -> String {
    "0.5".to_string()
}
fn default_auth_mode() -> String {
    "apikey".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_run_id")]
    pub run_id: String,
    #[serde(default)]
    pub missing_value: Option<String>,
    #[serde(default)]
    pub parallel_resources: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            run_id: default_run_id(),
            missing_value: None,
            parallel_resources: false,
        }
    }
}

fn default_page_size() -> usize {
    1000
}
fn default_run_id() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/ccsync.sqlite")
}

/// Known base URL aliases.
pub fn resolve_base_url(base_url: &str) -> String {
    match base_url {
        "prod" => "https://www.commcarehq.org".to_string(),
        "local" => "http://localhost:8000".to_string(),
        other => other.trim_end_matches('/').to_string(),
    }
}

impl Config {
    /// Check cross-field constraints. Called after loading and again after
    /// CLI overrides are applied.
    pub fn validate(&self) -> Result<()> {
        if self.export.page_size < 2 {
            bail!("export.page_size must be >= 2");
        }
        if self.export.run_id.trim().is_empty() {
            bail!("export.run_id must not be empty");
        }
        match self.hq.auth_mode.as_str() {
            "apikey" | "basic" => {}
            other => bail!(
                "Unknown auth mode: '{}'. Must be apikey or basic.",
                other
            ),
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.export.page_size, 1000);
        assert_eq!(config.export.run_id, "default");
        assert_eq!(config.hq.auth_mode, "apikey");
        assert_eq!(config.db.path, PathBuf::from("./data/ccsync.sqlite"));
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_tiny_page_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[export]\npage_size = 1").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn test_rejects_unknown_auth_mode() {
        let config: Config = toml::from_str("[hq]\nauth_mode = \"oauth\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_url_aliases() {
        assert_eq!(resolve_base_url("prod"), "https://www.commcarehq.org");
        assert_eq!(resolve_base_url("local"), "http://localhost:8000");
        assert_eq!(resolve_base_url("http://hq.test/"), "http://hq.test");
    }
}
