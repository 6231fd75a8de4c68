use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode config: {0}")]
    Decode(#[from] toml::de::Error),
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    #[serde(rename = "fetch_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    #[serde(rename = "retry_base_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_base_delay: Duration,
    #[serde(rename = "retry_max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_max_delay: Duration,
    #[serde(rename = "search_debounce_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub search_debounce: Duration,
    pub max_search_pages: usize,
    #[serde(rename = "cache_ttl_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cache_ttl: Duration,
}

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(15_000);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            fetch_retries: 3,
            retry_base_delay: Duration::from_millis(300),
            retry_max_delay: Duration::from_millis(3_000),
            search_debounce: Duration::from_millis(300),
            max_search_pages: 10,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads the config at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.fetch_retries.max(1),
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let config = ViewerConfig::from_toml_str("fetch_timeout_ms = 5000\nmax_search_pages = 3\n")
            .unwrap();
        assert_eq!(config.fetch_timeout, Duration::from_millis(5000));
        assert_eq!(config.max_search_pages, 3);
        assert_eq!(config.fetch_retries, 3);
        assert_eq!(config.search_debounce, Duration::from_millis(300));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = ViewerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ViewerConfig::default());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "fetch_retries = 5\nretry_max_delay_ms = 800\n").unwrap();

        let config = ViewerConfig::load(&path).unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.max_delay, Duration::from_millis(800));
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(matches!(
            ViewerConfig::from_toml_str("fetch_retries = \"many\""),
            Err(ConfigError::Decode(_))
        ));
    }
}
