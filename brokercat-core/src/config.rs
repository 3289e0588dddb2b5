//! Catalog configuration
//!
//! Loaded from YAML (camelCase keys), every field optional. Resolution order:
//! explicit path → `$BROKERCAT_CONFIG` → `<config dir>/brokercat/config.yaml`
//! → built-in defaults. Environment overrides are applied after the file.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::fetcher::TransportError;
use crate::trust::VerifyError;

pub const CONFIG_ENV: &str = "BROKERCAT_CONFIG";
pub const BASE_URL_ENV: &str = "BROKERCAT_BASE_URL";
pub const CACHE_DIR_ENV: &str = "BROKERCAT_CACHE_DIR";

const CONFIG_FILE: &str = "config.yaml";

/// Invalid configuration, or a loader that cannot be assembled from it
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Base URL '{url}' must use https (http is only allowed for loopback hosts)")]
    InsecureBaseUrl { url: String },

    #[error("'{field}' must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("Could not determine a cache directory; set cacheDir or {CACHE_DIR_ENV}")]
    NoCacheDir,

    #[error("Trusted keys are unusable: {0}")]
    Keys(#[from] VerifyError),

    #[error("Failed to create HTTP fetcher: {0}")]
    Fetcher(#[from] TransportError),

    #[error("No remote fetcher configured (built without the `http` feature)")]
    NoFetcher,
}

/// Endpoint, timeout and cache policy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogConfig {
    /// Directory serving `brokers.json` and `brokers.json.sig`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Budget for each request of a refresh
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Cached catalogs older than this are ignored
    #[serde(default = "default_cache_expiration")]
    pub cache_expiration_secs: u64,

    /// Minimum spacing between remote checks, for `should_update`
    #[serde(default = "default_min_refresh_interval")]
    pub min_refresh_interval_secs: u64,

    /// Defaults to the platform cache directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            request_timeout_secs: default_request_timeout(),
            cache_expiration_secs: default_cache_expiration(),
            min_refresh_interval_secs: default_min_refresh_interval(),
            cache_dir: None,
        }
    }
}

fn default_base_url() -> String {
    "https://catalog.brokercat.dev/v1".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    30
}

fn default_cache_expiration() -> u64 {
    7 * 24 * 60 * 60
}

fn default_min_refresh_interval() -> u64 {
    60 * 60
}

impl CatalogConfig {
    /// Resolve, read, override from the environment, and validate
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit) {
            Some(path) => Self::load_from_path(&path)?,
            None => {
                debug!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        info!("Loaded catalog configuration from {}", path.display());
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        let default_path = project_dirs()?.config_dir().join(CONFIG_FILE);
        default_path.exists().then_some(default_path)
    }

    /// Apply `BROKERCAT_BASE_URL` and `BROKERCAT_CACHE_DIR`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.is_empty() {
                debug!("{} overrides base URL: {}", BASE_URL_ENV, base_url);
                self.base_url = base_url;
            }
        }

        if let Ok(cache_dir) = std::env::var(CACHE_DIR_ENV) {
            if !cache_dir.is_empty() {
                debug!("{} overrides cache dir: {}", CACHE_DIR_ENV, cache_dir);
                self.cache_dir = Some(PathBuf::from(cache_dir));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "https" => {}
            "http" if is_loopback(&url) => {}
            "http" => {
                return Err(ConfigError::InsecureBaseUrl {
                    url: self.base_url.clone(),
                })
            }
            other => {
                return Err(ConfigError::InvalidBaseUrl {
                    url: self.base_url.clone(),
                    reason: format!("unsupported scheme '{other}'"),
                })
            }
        }

        if url.host().is_none() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "missing host".to_string(),
            });
        }

        for (field, value) in [
            ("connectTimeoutSecs", self.connect_timeout_secs),
            ("readTimeoutSecs", self.read_timeout_secs),
            ("requestTimeoutSecs", self.request_timeout_secs),
            ("cacheExpirationSecs", self.cache_expiration_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        Ok(())
    }

    pub fn catalog_url(&self) -> String {
        format!("{}/brokers.json", self.base_url.trim_end_matches('/'))
    }

    pub fn signature_url(&self) -> String {
        format!("{}/brokers.json.sig", self.base_url.trim_end_matches('/'))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.cache_expiration_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }

    /// Configured cache dir, else the platform cache dir
    pub fn resolved_cache_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => project_dirs()
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .ok_or(ConfigError::NoCacheDir),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "brokercat")
}

fn is_loopback(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::TempDir;

    fn with_base(base_url: &str) -> CatalogConfig {
        CatalogConfig {
            base_url: base_url.to_string(),
            ..CatalogConfig::default()
        }
    }

    fn clear_env() {
        std::env::remove_var(CONFIG_ENV);
        std::env::remove_var(BASE_URL_ENV);
        std::env::remove_var(CACHE_DIR_ENV);
    }

    #[test]
    fn test_defaults() {
        let config = CatalogConfig::default();
        assert_eq!(config.cache_expiration(), Duration::from_secs(604_800));
        assert_eq!(config.min_refresh_interval(), Duration::from_secs(3_600));
        assert_eq!(
            config.catalog_url(),
            "https://catalog.brokercat.dev/v1/brokers.json"
        );
        assert_eq!(
            config.signature_url(),
            "https://catalog.brokercat.dev/v1/brokers.json.sig"
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "baseUrl: https://mirror.example/catalog/\ncacheExpirationSecs: 86400\n";
        let config: CatalogConfig = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(config.cache_expiration_secs, 86_400);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(
            config.catalog_url(),
            "https://mirror.example/catalog/brokers.json"
        );
    }

    #[test]
    fn test_validate_rejects_plain_http() {
        assert!(matches!(
            with_base("http://catalog.example/v1").validate(),
            Err(ConfigError::InsecureBaseUrl { .. })
        ));
    }

    #[test]
    fn test_validate_allows_loopback_http() {
        for base in [
            "http://127.0.0.1:8080",
            "http://localhost:9000/v1",
            "http://[::1]:8080",
        ] {
            with_base(base).validate().unwrap();
        }
    }

    #[test]
    fn test_validate_rejects_garbage_and_other_schemes() {
        for base in ["not a url", "ftp://catalog.example", "file:///etc/brokers"] {
            assert!(
                matches!(
                    with_base(base).validate(),
                    Err(ConfigError::InvalidBaseUrl { .. })
                ),
                "{base} accepted"
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = CatalogConfig {
            request_timeout_secs: 0,
            ..CatalogConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                field: "requestTimeoutSecs"
            })
        ));
    }

    #[test]
    #[serial]
    fn test_load_explicit_path_then_env_overrides() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "baseUrl: https://file.example/v1\nreadTimeoutSecs: 3\n").unwrap();

        std::env::set_var(BASE_URL_ENV, "https://env.example/v2");
        std::env::set_var(CACHE_DIR_ENV, temp.path().join("cache"));
        let config = CatalogConfig::load(Some(&path)).unwrap();
        clear_env();

        assert_eq!(config.base_url, "https://env.example/v2");
        assert_eq!(config.read_timeout_secs, 3);
        assert_eq!(
            config.resolved_cache_dir().unwrap(),
            temp.path().join("cache")
        );
    }

    #[test]
    #[serial]
    fn test_load_from_config_env_var() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.yaml");
        std::fs::write(&path, "minRefreshIntervalSecs: 60\n").unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let config = CatalogConfig::load(None).unwrap();
        clear_env();

        assert_eq!(config.min_refresh_interval_secs, 60);
    }

    #[test]
    #[serial]
    fn test_load_rejects_insecure_env_override() {
        clear_env();
        std::env::set_var(BASE_URL_ENV, "http://catalog.example");
        let result = CatalogConfig::load(None);
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        clear_env();
        let err = CatalogConfig::load(Some(Path::new("/nonexistent/brokercat.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
