//! Configuration management for the collapsing proxy.
//!
//! This module provides configuration loading with multiple sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! # Configuration Hierarchy
//!
//! Environment variables take precedence over config file values,
//! which take precedence over defaults.
//!
//! # Example
//!
//! ```ignore
//! use collapse_server::config::ProxyConfig;
//!
//! // Load from file with env overrides
//! let config = ProxyConfig::load("config.yaml")?;
//!
//! // Or load from environment only
//! let config = ProxyConfig::from_env()?;
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::batcher::BatcherConfig;

/// Environment variable prefix for overrides (`COLLAPSE_SERVER__PORT=9090`).
pub const ENV_PREFIX: &str = "COLLAPSE";

/// Proxy configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ProxyConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Upstream service settings
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Request collapsing settings
    #[serde(default)]
    pub batcher: BatcherSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsSettings,
}

/// Listener network settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    1024 * 1024
}

/// Upstream service settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UpstreamSettings {
    /// Base URL requests are forwarded to. The inbound path and query are
    /// appended to it.
    #[serde(default = "default_upstream_url")]
    pub base_url: String,

    /// Timeout for a single upstream call in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

fn default_upstream_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

/// Request collapsing settings.
///
/// # Example YAML Configuration
///
/// ```yaml
/// batcher:
///   flush_interval_ms: 5000
///   request_timeout_ms: 15000
///   include_query: true
///   coalesce_methods: [GET, HEAD]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BatcherSettings {
    /// Period of the background flush loop in milliseconds.
    ///
    /// Environment variable: `COLLAPSE_BATCHER__FLUSH_INTERVAL_MS`
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Optional deadline for a queued request in milliseconds.
    ///
    /// Unset means a request waits for the next flush however long it takes.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Whether the query string is part of the coalescing key.
    #[serde(default = "default_true")]
    pub include_query: bool,

    /// HTTP methods eligible for collapsing. Everything else is forwarded
    /// one-to-one.
    #[serde(default = "default_coalesce_methods")]
    pub coalesce_methods: Vec<String>,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            request_timeout_ms: None,
            include_query: true,
            coalesce_methods: default_coalesce_methods(),
        }
    }
}

impl BatcherSettings {
    /// Runtime batcher settings derived from this section.
    pub fn to_batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Whether requests with `method` may be collapsed.
    pub fn coalesces(&self, method: &str) -> bool {
        self.coalesce_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

fn default_flush_interval() -> u64 {
    5000
}

fn default_coalesce_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricsSettings {
    /// Enable metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ProxyConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `COLLAPSE_` and use `__` as separator:
    /// - `COLLAPSE_SERVER__PORT=9090` overrides `server.port`
    /// - `COLLAPSE_UPSTREAM__BASE_URL=...` overrides `upstream.base_url`
    /// - `COLLAPSE_BATCHER__COALESCE_METHODS=GET,HEAD,OPTIONS` overrides a list
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ProxyConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(env_source())
            .build()?;

        let proxy_config: ProxyConfig = config.try_deserialize()?;
        proxy_config.validate()?;

        Ok(proxy_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ProxyConfig::default())?)
            .add_source(env_source())
            .build()?;

        let proxy_config: ProxyConfig = config.try_deserialize()?;
        proxy_config.validate()?;

        Ok(proxy_config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.server.port == 0 {
            return Err(invalid("server.port must be greater than 0"));
        }

        if self.server.body_limit_bytes == 0 {
            return Err(invalid("server.body_limit_bytes must be greater than 0"));
        }

        let base_url = self.upstream.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(invalid(format!(
                "upstream.base_url must be an http(s) URL, got: {}",
                self.upstream.base_url
            )));
        }

        if self.upstream.timeout_secs == 0 {
            return Err(invalid("upstream.timeout_secs must be greater than 0"));
        }

        if self.batcher.flush_interval_ms == 0 {
            return Err(invalid("batcher.flush_interval_ms must be greater than 0"));
        }

        if self.batcher.request_timeout_ms == Some(0) {
            return Err(invalid("batcher.request_timeout_ms must be greater than 0"));
        }

        if let Some(method) = self
            .batcher
            .coalesce_methods
            .iter()
            .find(|m| m.is_empty() || !m.bytes().all(|b| b.is_ascii_alphabetic()))
        {
            return Err(invalid(format!(
                "batcher.coalesce_methods contains an invalid method: {method:?}"
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "logging.level must be one of: {:?}, got: {}",
                valid_levels, self.logging.level
            )));
        }

        if !self.metrics.path.starts_with('/') {
            return Err(invalid(format!(
                "metrics.path must start with '/', got: {}",
                self.metrics.path
            )));
        }

        // `/health` is served by the proxy itself.
        if self.metrics.path == "/health" {
            return Err(invalid("metrics.path must not be /health".to_string()));
        }

        Ok(())
    }
}

fn env_source() -> Environment {
    // `__` separates nested keys: COLLAPSE_SERVER__HOST -> server.host.
    // List values are comma separated: COLLAPSE_BATCHER__COALESCE_METHODS=GET,HEAD
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("batcher.coalesce_methods")
}

fn invalid(message: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::Invalid {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_can_load_config_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  host: "127.0.0.1"
  port: 9090

upstream:
  base_url: "http://backend:8081"
  timeout_secs: 10

batcher:
  flush_interval_ms: 250
  request_timeout_ms: 1000
  include_query: false

logging:
  level: debug
  json: true

metrics:
  enabled: false
  path: /custom-metrics
"#
        )
        .unwrap();

        let config = ProxyConfig::load(file.path()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.upstream.base_url, "http://backend:8081");
        assert_eq!(config.upstream.timeout_secs, 10);
        assert_eq!(config.batcher.flush_interval_ms, 250);
        assert_eq!(config.batcher.request_timeout_ms, Some(1000));
        assert!(!config.batcher.include_query);
        // Not set in the file, so the default applies.
        assert_eq!(config.batcher.coalesce_methods, vec!["GET", "HEAD"]);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.path, "/custom-metrics");
    }

    #[test]
    #[serial]
    fn test_can_override_config_with_env_vars() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  host: "127.0.0.1"
  port: 8080
"#
        )
        .unwrap();

        std::env::set_var("COLLAPSE_SERVER__PORT", "9999");
        std::env::set_var("COLLAPSE_BATCHER__FLUSH_INTERVAL_MS", "100");

        let config = ProxyConfig::load(file.path());

        std::env::remove_var("COLLAPSE_SERVER__PORT");
        std::env::remove_var("COLLAPSE_BATCHER__FLUSH_INTERVAL_MS");

        let config = config.unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.batcher.flush_interval_ms, 100);
    }

    #[test]
    #[serial]
    fn test_from_env_loads_defaults_with_env_overrides() {
        std::env::set_var("COLLAPSE_UPSTREAM__BASE_URL", "https://api.internal");

        let config = ProxyConfig::from_env();

        std::env::remove_var("COLLAPSE_UPSTREAM__BASE_URL");

        let config = config.unwrap();
        assert_eq!(config.upstream.base_url, "https://api.internal");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    #[serial]
    fn test_env_overrides_coalesce_methods_list() {
        std::env::set_var("COLLAPSE_BATCHER__COALESCE_METHODS", "GET,HEAD,OPTIONS");
        let several = ProxyConfig::from_env();
        std::env::set_var("COLLAPSE_BATCHER__COALESCE_METHODS", "GET");
        let single = ProxyConfig::from_env();
        std::env::remove_var("COLLAPSE_BATCHER__COALESCE_METHODS");

        let several = several.unwrap();
        assert_eq!(
            several.batcher.coalesce_methods,
            vec!["GET", "HEAD", "OPTIONS"]
        );
        assert!(several.batcher.coalesces("options"));

        let single = single.unwrap();
        assert_eq!(single.batcher.coalesce_methods, vec!["GET"]);
        assert!(!single.batcher.coalesces("HEAD"));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.batcher.flush_interval_ms, 5000);
        assert_eq!(config.batcher.request_timeout_ms, None);
        assert!(config.batcher.include_query);
        assert_eq!(config.logging.level, "info");
        assert!(config.metrics.enabled);
    }

    fn assert_invalid(mutate: impl FnOnce(&mut ProxyConfig), field: &str) {
        let mut config = ProxyConfig::default();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains(field),
            "expected error mentioning '{field}', got: {err}"
        );
    }

    #[test]
    fn test_config_validation_catches_errors() {
        assert_invalid(|c| c.server.port = 0, "server.port");
        assert_invalid(|c| c.server.body_limit_bytes = 0, "body_limit_bytes");
        assert_invalid(|c| c.upstream.base_url = "ftp://x".into(), "upstream.base_url");
        assert_invalid(|c| c.upstream.base_url = String::new(), "upstream.base_url");
        assert_invalid(|c| c.upstream.timeout_secs = 0, "upstream.timeout_secs");
        assert_invalid(|c| c.batcher.flush_interval_ms = 0, "flush_interval_ms");
        assert_invalid(
            |c| c.batcher.request_timeout_ms = Some(0),
            "request_timeout_ms",
        );
        assert_invalid(
            |c| c.batcher.coalesce_methods = vec!["GET".into(), String::new()],
            "coalesce_methods",
        );
        assert_invalid(|c| c.logging.level = "verbose".into(), "logging.level");
        assert_invalid(|c| c.metrics.path = "metrics".into(), "metrics.path");
        assert_invalid(|c| c.metrics.path = "/health".into(), "metrics.path");
    }

    #[test]
    fn test_invalid_config_returns_clear_error() {
        let err = ProxyConfig::load("/nonexistent/path/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigLoadError::FileNotFound { .. }));
        assert!(err.to_string().contains("not found"));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: syntax: [").unwrap();

        let err = ProxyConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Load(_)));
    }

    #[test]
    fn test_batcher_settings_convert_to_runtime_config() {
        let settings = BatcherSettings {
            flush_interval_ms: 250,
            request_timeout_ms: Some(40),
            ..Default::default()
        };

        let runtime = settings.to_batcher_config();
        assert_eq!(runtime.flush_interval, Duration::from_millis(250));
        assert_eq!(runtime.request_timeout, Some(Duration::from_millis(40)));

        assert_eq!(
            BatcherSettings::default().to_batcher_config().request_timeout,
            None
        );
    }

    #[test]
    fn test_coalesce_methods_match_case_insensitively() {
        let settings = BatcherSettings::default();
        assert!(settings.coalesces("GET"));
        assert!(settings.coalesces("head"));
        assert!(!settings.coalesces("POST"));
    }
}
