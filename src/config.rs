use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub search: SearchConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size. The indexer writes from one task, but the HTTP read
    /// surface shares the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a connection waits on SQLite's write lock before failing.
    /// Search reads and run bookkeeping contend with normalizer
    /// transactions mid-run.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    /// Zip archive of the registries meta-repository.
    #[serde(default = "default_archive_url")]
    pub archive_url: String,
    /// URL template for a registry's generated data file. `{repo}` is
    /// replaced with the `owner/name` identifier.
    #[serde(default = "default_data_url_template")]
    pub data_url_template: String,
    /// Bounds every fetcher HTTP call (archive download and per-registry
    /// data files).
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            archive_url: default_archive_url(),
            data_url_template: default_data_url_template(),
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_archive_url() -> String {
    "https://codeload.github.com/v1nvn/enhansome/zip/refs/heads/main".to_string()
}
fn default_data_url_template() -> String {
    "https://raw.githubusercontent.com/{repo}/main/registry.json".to_string()
}
fn default_fetch_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// TTL for the cached search index snapshot.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Over-fetch factor applied to the requested limit when querying the
    /// text index, leaving room for post-filtering.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Hard cap on results considered by one query.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            candidate_multiplier: default_candidate_multiplier(),
            max_results: default_max_results(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_max_results() -> usize {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// API key required by the admin indexing endpoints. When unset, manual
    /// indexing over HTTP is disabled (the CLI path still works).
    #[serde(default)]
    pub api_key: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }
    if config.fetcher.archive_url.is_empty() {
        anyhow::bail!("fetcher.archive_url must not be empty");
    }
    if !config.fetcher.data_url_template.contains("{repo}") {
        anyhow::bail!("fetcher.data_url_template must contain a {{repo}} placeholder");
    }
    if config.fetcher.timeout_secs == 0 {
        anyhow::bail!("fetcher.timeout_secs must be > 0");
    }
    if config.search.candidate_multiplier == 0 {
        anyhow::bail!("search.candidate_multiplier must be >= 1");
    }
    if config.search.max_results == 0 {
        anyhow::bail!("search.max_results must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/awix.sqlite"

            [server]
            bind = "127.0.0.1:7300"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.db.max_connections, 5);
        assert_eq!(cfg.db.busy_timeout_secs, 5);
        assert_eq!(cfg.fetcher.timeout_secs, 60);
        assert!(cfg.fetcher.data_url_template.contains("{repo}"));
        assert_eq!(cfg.search.cache_ttl_secs, 300);
        assert_eq!(cfg.search.candidate_multiplier, 3);
        assert!(cfg.server.api_key.is_none());
    }

    #[test]
    fn test_template_without_placeholder_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("awix.toml");
        std::fs::write(
            &path,
            r#"
            [db]
            path = "/tmp/awix.sqlite"

            [fetcher]
            data_url_template = "https://example.com/static.json"

            [server]
            bind = "127.0.0.1:7300"
            "#,
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("{repo}"));
    }
}
