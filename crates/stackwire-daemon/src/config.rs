//! Configuration loading

use anyhow::Result;
use serde::{Deserialize, Serialize};
use stackwire_core::RetryPolicy;
use stackwire_discovery::{DriverSettings, LossPolicy};
use stackwire_transport::{ConnectionOptions, DEFAULT_PORT};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub drivers: DriversConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keep-alive probe interval in seconds (0 disables the probe)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_probe_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Pause between connect/enumerate attempts
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
    /// Unset retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_retry_delay(),
            max_attempts: None,
        }
    }
}

fn default_retry_delay() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Release every driver when the connection goes away
    #[serde(default)]
    pub detach_on_disconnect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriversConfig {
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_air_quality_period")]
    pub air_quality_period_ms: u32,
    #[serde(default = "default_display_title")]
    pub display_title: String,
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            air_quality_period_ms: default_air_quality_period(),
            display_title: default_display_title(),
        }
    }
}

fn default_response_timeout() -> u64 {
    2500
}

fn default_air_quality_period() -> u32 {
    1000
}

fn default_display_title() -> String {
    "   Weather Station".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Serve the HTTP/WebSocket status API
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.broker.host, self.broker.port)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let probe_interval = match self.broker.probe_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        ConnectionOptions { probe_interval }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::fixed(Duration::from_millis(self.retry.delay_ms));
        match self.retry.max_attempts {
            Some(attempts) => policy.with_max_attempts(attempts),
            None => policy,
        }
    }

    pub fn loss_policy(&self) -> LossPolicy {
        if self.registry.detach_on_disconnect {
            LossPolicy::DetachAll
        } else {
            LossPolicy::KeepDevices
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            response_timeout: Duration::from_millis(self.drivers.response_timeout_ms),
            air_quality_period_ms: self.drivers.air_quality_period_ms,
            display_title: self.drivers.display_title.clone(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("stackwire.toml")).unwrap();
        assert_eq!(config.broker_address(), "localhost:4223");
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.loss_policy(), LossPolicy::KeepDevices);
        assert!(!config.status.enabled);
        assert_eq!(
            config.connection_options().probe_interval,
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[broker]
host = "10.0.0.7"
probe_interval_secs = 0

[retry]
delay_ms = 250
max_attempts = 4

[registry]
detach_on_disconnect = true

[drivers]
display_title = "Lab"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.broker_address(), "10.0.0.7:4223");
        assert_eq!(config.connection_options().probe_interval, None);
        assert_eq!(config.retry_policy().max_attempts(), Some(4));
        assert_eq!(config.retry_policy().delay_after(1), Duration::from_millis(250));
        assert_eq!(config.loss_policy(), LossPolicy::DetachAll);

        let settings = config.driver_settings();
        assert_eq!(settings.display_title, "Lab");
        assert_eq!(settings.response_timeout, Duration::from_millis(2500));
        assert_eq!(settings.air_quality_period_ms, 1000);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nport = \"not a port\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
