//! # Hub Configuration
//!
//! Optional TOML file; every key has a default so an empty or missing
//! file yields a working hub.
//!
//! ```toml
//! [backend]
//! url = "http://localhost:9200"
//! version = "1.7"
//!
//! [freshness]
//! timeout_secs = 60
//! poll_interval_ms = 1000
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Protocol version of the store; major `0` selects the legacy form.
    #[serde(default = "default_backend_version")]
    pub version: String,
    /// HTTP client timeout. Off unless set.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            version: default_backend_version(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FreshnessConfig {
    #[serde(default = "default_freshness_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_freshness_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MutationConfig {
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            max_matches: default_max_matches(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_backend_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_backend_version() -> String {
    "1.7".to_string()
}
fn default_freshness_timeout() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_max_matches() -> usize {
    200_000
}
fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

impl Config {
    /// Read `path` if it exists. A file that does not parse is reported
    /// and replaced by defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to read config {:?}: {}", path, e);
                return Self::default();
            }
        };
        toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed config {:?}: {}", path, e);
            Self::default()
        })
    }

    pub fn settings(&self) -> Settings {
        Settings {
            freshness_timeout: Duration::from_secs(self.freshness.timeout_secs),
            poll_interval: Duration::from_millis(self.freshness.poll_interval_ms),
            max_matches: self.mutation.max_matches,
        }
    }
}

/// The engine's view of the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub freshness_timeout: Duration,
    pub poll_interval: Duration,
    pub max_matches: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend.url, "http://localhost:9200");
        assert_eq!(config.backend.version, "1.7");
        assert_eq!(config.server.bind, "127.0.0.1:5000");
        assert_eq!(config.mutation.max_matches, 200_000);
        assert_eq!(config.settings().freshness_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            version = "0.90"

            [freshness]
            poll_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.url, "http://localhost:9200");
        assert_eq!(config.backend.version, "0.90");
        assert_eq!(config.freshness.timeout_secs, 60);
        assert_eq!(config.settings().poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/fq-hub.toml"));
        assert_eq!(config.server.bind, "127.0.0.1:5000");
    }
}
