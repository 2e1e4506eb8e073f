//! Configuration schema and defaults.
//!
//! Every tunable of the broker and client carries the contract
//! default, so an absent or partial config file always yields a
//! working setup. The core consumes no environment variables.

mod load;

pub use load::{ConfigError, config_path, load, load_or_init, write_config};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerSettings,
    pub client: ClientSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// Pending clarifications per consumer before insertions are
    /// rejected.
    pub max_clarification_queue: usize,
    /// Quiet window before a consumer's yap buffer flushes.
    pub yap_buffer_ms: u64,
    /// Yaps held per consumer; oldest dropped beyond this.
    pub yap_buffer_max: usize,
    pub heartbeat_interval_ms: u64,
    /// Sessions whose last-seen lags by more than this are stale.
    pub client_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            max_clarification_queue: 10,
            yap_buffer_ms: 200,
            yap_buffer_max: 50,
            heartbeat_interval_ms: 5_000,
            client_timeout_ms: 15_000,
        }
    }
}

impl BrokerSettings {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn yap_buffer(&self) -> Duration {
        Duration::from_millis(self.yap_buffer_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub register_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            connect_timeout_ms: 3_000,
            register_timeout_ms: 5_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl ClientSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_contract_values() {
        let config = Config::default();
        assert_eq!(config.broker.port, 8765);
        assert_eq!(config.broker.max_clarification_queue, 10);
        assert_eq!(config.broker.yap_buffer_ms, 200);
        assert_eq!(config.broker.yap_buffer_max, 50);
        assert_eq!(config.broker.heartbeat_interval_ms, 5_000);
        assert_eq!(config.broker.client_timeout_ms, 15_000);
        assert_eq!(config.client.reconnect_delay_ms, 1_000);
        assert_eq!(config.client.max_reconnect_attempts, 10);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str("[broker]\nport = 9100\n").unwrap();
        assert_eq!(config.broker.port, 9100);
        assert_eq!(config.broker.max_clarification_queue, 10);
        assert_eq!(config.client.max_reconnect_attempts, 10);
    }
}
