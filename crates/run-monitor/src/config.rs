use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{MonitorError, Result};

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:5106";
const DEFAULT_HUB_PATH: &str = "/hubs/testrun";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub api_base_url: String,
    pub hub_path: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    pub history: HistoryConfig,
    pub run: RunDefaults,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub page_size: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub environment: String,
    pub browser: String,
    pub name_prefix: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            hub_path: DEFAULT_HUB_PATH.to_string(),
            request_timeout_ms: 5_000,
            connect_timeout_ms: 2_000,
            reconnect: ReconnectConfig::default(),
            history: HistoryConfig::default(),
            run: RunDefaults::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            poll_interval_ms: 5_000,
        }
    }
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            environment: "Development".to_string(),
            browser: "chrome".to_string(),
            name_prefix: "Manual Run".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn history_poll_interval(&self) -> Duration {
        Duration::from_millis(self.history.poll_interval_ms)
    }

    /// WebSocket URL of the run-events hub, derived from the REST base URL.
    pub fn hub_url(&self) -> Result<String> {
        let base = self.api_base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(MonitorError::Config(format!(
                "api_base_url must be an http(s) url: {}",
                self.api_base_url
            )));
        };
        let path = self.hub_path.trim_start_matches('/');
        Ok(format!("{ws_base}/{path}"))
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(MonitorError::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(MonitorError::Config(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return Err(MonitorError::Config(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        self.hub_url().map(|_| ())
    }
}

pub fn parse_monitor_config(raw: &str) -> Result<MonitorConfig> {
    let config: MonitorConfig =
        toml::from_str(raw).map_err(|err| MonitorError::Config(err.to_string()))?;
    config.validate()?;
    Ok(config)
}

pub fn load_monitor_config(path: &Path) -> Result<MonitorConfig> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        MonitorError::Config(format!("failed to read config {}: {err}", path.display()))
    })?;
    parse_monitor_config(&raw).map_err(|err| match err {
        MonitorError::Config(message) => {
            MonitorError::Config(format!("failed to parse config {}: {message}", path.display()))
        }
        other => other,
    })
}
