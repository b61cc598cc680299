//! Configuration loader and validator for the issue sync.
use crate::model::{PaginationMode, Source};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

static REPO_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").expect("valid repo regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub github: Github,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// GitHub API access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Github {
    /// Usually supplied through `GITHUB_OAUTH_TOKEN` instead.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Fan-out and retry policy of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

/// One configured repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceEntry {
    pub repo: String,
    #[serde(default)]
    pub mode: PaginationMode,
}

fn default_api_url() -> String {
    "https://api.github.com/".to_string()
}
fn default_graphql_url() -> String {
    "https://api.github.com/graphql".to_string()
}
fn default_per_page() -> u32 {
    100
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_concurrency() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_max_backoff_seconds() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            max_backoff_seconds: default_max_backoff_seconds(),
        }
    }
}

impl SyncSettings {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Apply environment overrides.
    /// - `GITHUB_OAUTH_TOKEN` replaces `github.token`
    /// - `PRIVATE_REPOS` (comma separated `owner/name`) appends offset-mode sources
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GITHUB_OAUTH_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.github.token = token.trim().to_string();
        }
        if let Some(private) = lookup("PRIVATE_REPOS") {
            for repo in private.split(',').map(str::trim).filter(|r| !r.is_empty()) {
                if self.sources.iter().any(|s| s.repo == repo) {
                    continue;
                }
                self.sources.push(SourceEntry {
                    repo: repo.to_string(),
                    mode: PaginationMode::Offset,
                });
            }
        }
    }

    /// Configured sources in order, first occurrence of each repository wins.
    pub fn sources(&self) -> Vec<Source> {
        let mut seen = HashSet::new();
        self.sources
            .iter()
            .filter_map(|entry| Source::parse(&entry.repo, entry.mode))
            .filter(|src| seen.insert(src.full_name()))
            .collect()
    }

    /// Default SQLite location under `app.data_dir`.
    pub fn default_database_url(&self) -> String {
        format!(
            "sqlite://{}/issues.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }
}

/// Load configuration from a YAML file, apply process environment overrides
/// and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content, |key| std::env::var(key).ok())
}

/// Parse YAML, apply overrides from `lookup` and validate.
pub fn parse<F>(content: &str, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg: Config = serde_yaml::from_str(content)?;
    cfg.apply_overrides(lookup);
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.github.token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "github.token must be non-empty (or set GITHUB_OAUTH_TOKEN)",
        ));
    }
    if Url::parse(&cfg.github.api_url).is_err() {
        return Err(ConfigError::Invalid("github.api_url must be a valid URL"));
    }
    if Url::parse(&cfg.github.graphql_url).is_err() {
        return Err(ConfigError::Invalid("github.graphql_url must be a valid URL"));
    }
    if cfg.github.per_page == 0 || cfg.github.per_page > 100 {
        return Err(ConfigError::Invalid("github.per_page must be within 1..=100"));
    }
    if cfg.github.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("github.timeout_seconds must be > 0"));
    }

    if cfg.sync.concurrency == 0 {
        return Err(ConfigError::Invalid("sync.concurrency must be > 0"));
    }
    // max_retries and the backoff values are unsigned; zero disables retries

    if cfg.sources.is_empty() {
        return Err(ConfigError::Invalid(
            "sources must list at least one repository (or set PRIVATE_REPOS)",
        ));
    }
    if cfg
        .sources
        .iter()
        .any(|s| !REPO_NAME.is_match(s.repo.trim()))
    {
        return Err(ConfigError::Invalid("sources[].repo must look like owner/name"));
    }

    Ok(())
}

/// Sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

github:
  token: "YOUR_GITHUB_TOKEN"
  api_url: "https://api.github.com/"
  graphql_url: "https://api.github.com/graphql"
  per_page: 100
  timeout_seconds: 30

sync:
  concurrency: 2
  max_retries: 3
  retry_base_ms: 500
  max_backoff_seconds: 60

sources:
  - repo: elastic/kibana
  - repo: elastic/eui
  - repo: elastic/elastic-charts
    mode: cursor
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn parse_example_ok() {
        let cfg = parse(example(), no_env).unwrap();
        assert_eq!(cfg.github.per_page, 100);
        assert_eq!(cfg.sync.concurrency, 2);
        let sources = cfg.sources();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[2].mode, PaginationMode::Cursor);
        assert_eq!(sources[0].mode, PaginationMode::Offset);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"app:
  data_dir: "./data"
github:
  token: "t"
sources:
  - repo: a/b
"#;
        let cfg = parse(yaml, no_env).unwrap();
        assert_eq!(cfg.github.api_url, "https://api.github.com/");
        assert_eq!(cfg.sync, SyncSettings::default());
        assert_eq!(cfg.sync.retry_base(), Duration::from_millis(500));
    }

    #[test]
    fn token_from_env_overrides_file() {
        let env: HashMap<&str, &str> = [("GITHUB_OAUTH_TOKEN", "from-env")].into_iter().collect();
        let cfg = parse(example(), |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.github.token, "from-env");
    }

    #[test]
    fn missing_token_is_rejected() {
        let yaml = example().replace("YOUR_GITHUB_TOKEN", "");
        let err = parse(&yaml, no_env).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("github.token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn private_repos_are_appended_once() {
        let env: HashMap<&str, &str> = [("PRIVATE_REPOS", "acme/secret, elastic/eui,,acme/other")]
            .into_iter()
            .collect();
        let cfg = parse(example(), |k| env.get(k).map(|v| v.to_string())).unwrap();
        let names: Vec<String> = cfg.sources().iter().map(|s| s.full_name()).collect();
        assert_eq!(
            names,
            vec![
                "elastic/kibana",
                "elastic/eui",
                "elastic/elastic-charts",
                "acme/secret",
                "acme/other"
            ]
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = parse(example(), no_env).unwrap();
        cfg.github.per_page = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = parse(example(), no_env).unwrap();
        cfg.github.per_page = 101;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = parse(example(), no_env).unwrap();
        cfg.sync.concurrency = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("concurrency")),
            _ => panic!("wrong error"),
        }

        let mut cfg = parse(example(), no_env).unwrap();
        cfg.sources[0].repo = "not-a-repo".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = parse(example(), no_env).unwrap();
        cfg.sources.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = parse(example(), no_env).unwrap();
        cfg.github.graphql_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = parse(example(), no_env).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.default_database_url().ends_with("data/issues.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert!(cfg.sources().iter().any(|s| s.full_name() == "elastic/eui"));
    }
}
