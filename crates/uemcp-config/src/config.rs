use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use uemcp_core::{BridgeError, Result};

/// Immutable configuration snapshot loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ue: UeConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UeConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub connection_file: String,
    #[serde(default)]
    pub project_root: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:19090".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

impl Default for UeConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            connection_file: String::new(),
            project_root: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_ms(),
            max_delay_ms: default_reconnect_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_true")]
    pub include_schemas: bool,
    /// 0 disables the periodic refresh task.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub pin_schema_hash: String,
    #[serde(default)]
    pub fail_on_schema_change: bool,
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval_ms() -> u64 {
    60_000
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            include_schemas: true,
            refresh_interval_ms: default_refresh_interval_ms(),
            required_tools: Vec::new(),
            pin_schema_hash: String::new(),
            fail_on_schema_change: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_transient_max_attempts")]
    pub transient_max_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_transient_max_attempts() -> u32 {
    2
}

fn default_backoff_initial_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient_max_attempts: default_transient_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_log_interval_ms")]
    pub log_interval_ms: u64,
}

fn default_metrics_log_interval_ms() -> u64 {
    30_000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_interval_ms: default_metrics_log_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Load and validate the config. `None` yields the validated defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        };

        if !path.exists() {
            let example = path
                .parent()
                .map(|parent| parent.join("config.example.yaml"))
                .filter(|example| example.exists());
            return Err(BridgeError::Config(match example {
                Some(example) => format!(
                    "Config file not found: {} (hint: copy {} to {})",
                    path.display(),
                    example.display(),
                    path.display()
                ),
                None => format!("Config file not found: {}", path.display()),
            }));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let mut config: AppConfig = serde_yaml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("Invalid config {}: {e}", path.display())))?;

        config.catalog.required_tools = normalize_required_tools(&config.catalog.required_tools);
        config.catalog.pin_schema_hash = config.catalog.pin_schema_hash.trim().to_string();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let parsed = Url::parse(&self.ue.ws_url)
            .map_err(|e| BridgeError::Config(format!("ue.ws_url is not a valid URL: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(BridgeError::Config(
                "ue.ws_url must start with ws:// or wss://".into(),
            ));
        }
        if parsed.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(BridgeError::Config("ue.ws_url must include host:port".into()));
        }

        if self.ue.connect_timeout_ms == 0 {
            return Err(BridgeError::Config("ue.connect_timeout_ms must be > 0".into()));
        }
        if self.ue.ping_interval_ms == 0 {
            return Err(BridgeError::Config("ue.ping_interval_ms must be > 0".into()));
        }
        if self.ue.reconnect.initial_delay_ms == 0 {
            return Err(BridgeError::Config(
                "ue.reconnect.initial_delay_ms must be > 0".into(),
            ));
        }
        if self.ue.reconnect.max_delay_ms < self.ue.reconnect.initial_delay_ms {
            return Err(BridgeError::Config(
                "ue.reconnect.max_delay_ms must be >= initial_delay_ms".into(),
            ));
        }

        if self.request.default_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "request.default_timeout_ms must be > 0".into(),
            ));
        }

        if self.retry.transient_max_attempts == 0 {
            return Err(BridgeError::Config(
                "retry.transient_max_attempts must be > 0".into(),
            ));
        }
        if self.retry.backoff_initial_ms == 0 {
            return Err(BridgeError::Config("retry.backoff_initial_ms must be > 0".into()));
        }
        if self.retry.backoff_max_ms < self.retry.backoff_initial_ms {
            return Err(BridgeError::Config(
                "retry.backoff_max_ms must be >= backoff_initial_ms".into(),
            ));
        }

        Ok(())
    }
}

fn normalize_required_tools(raw: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.iter()
        .map(|tool| tool.trim().to_string())
        .filter(|tool| !tool.is_empty() && seen.insert(tool.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.ue.ws_url, "ws://127.0.0.1:19090");
        assert_eq!(config.request.default_timeout_ms, 30_000);
        assert_eq!(config.retry.transient_max_attempts, 2);
        assert!(config.catalog.include_schemas);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.yaml");
        let err = AppConfig::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn missing_file_hints_at_example_sibling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.example.yaml"), "server: {}\n").unwrap();
        let err = AppConfig::load(Some(&dir.path().join("config.yaml"))).unwrap_err();
        assert!(err.to_string().contains("config.example.yaml"));
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let (_dir, path) = write_config(
            "ue:\n  ws_url: ws://10.0.0.5:20000\ncatalog:\n  required_tools: [\" umg.widget.add \", \"\", \"umg.widget.add\"]\n",
        );
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.ue.ws_url, "ws://10.0.0.5:20000");
        assert_eq!(config.ue.ping_interval_ms, 10_000);
        assert_eq!(config.catalog.required_tools, vec!["umg.widget.add"]);
    }

    #[test]
    fn rejects_non_ws_scheme() {
        let (_dir, path) = write_config("ue:\n  ws_url: http://127.0.0.1:19090\n");
        let err = AppConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("ws:// or wss://"));
    }

    #[test]
    fn rejects_backoff_inversion() {
        let (_dir, path) =
            write_config("retry:\n  backoff_initial_ms: 2000\n  backoff_max_ms: 1000\n");
        let err = AppConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("backoff_max_ms"));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let (_dir, path) = write_config("request:\n  default_timeout_ms: 0\n");
        assert!(AppConfig::load(Some(&path)).is_err());

        let (_dir2, path2) = write_config("ue:\n  connect_timeout_ms: 0\n");
        assert!(AppConfig::load(Some(&path2)).is_err());
    }
}
