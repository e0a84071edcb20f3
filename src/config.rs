//! Configuration management for trafmask
//!
//! Loads and saves endpoint settings from YAML. Every field has a default,
//! so a missing file or a partial file both produce a usable configuration;
//! command-line flags are applied on top by the binary.

use crate::net::SocketConfig;
use crate::obfuscation::ObfuscationConfig;
use crate::profile::TrafficProfile;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/trafmask.yml";

/// Masking server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Network address to bind the server
    #[serde(default = "default_server_bind_address")]
    pub bind_address: String,
    /// UDP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Fixed target rate in Mbps, used unless a floating range is set
    #[serde(default = "default_target_mbps")]
    pub target_mbps: f64,
    /// Lower bound of the floating rate range
    #[serde(default)]
    pub min_mbps: Option<f64>,
    /// Upper bound of the floating rate range
    #[serde(default)]
    pub max_mbps: Option<f64>,
    /// Drive traffic from the obfuscation pipeline instead of legacy packets
    #[serde(default)]
    pub advanced: bool,
    #[serde(default)]
    pub profile: TrafficProfile,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: f64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Clients silent for longer than this are dropped
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,
    /// Send loop sleep while no client is registered
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_server_bind_address(),
            port: default_port(),
            target_mbps: default_target_mbps(),
            min_mbps: None,
            max_mbps: None,
            advanced: false,
            profile: TrafficProfile::default(),
            stats_interval_secs: default_stats_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            client_timeout_secs: default_client_timeout_secs(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl ServerConfig {
    /// `(min, max)` when both floating bounds are present
    pub fn floating_range(&self) -> Option<(f64, f64)> {
        self.min_mbps.zip(self.max_mbps)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs_f64(self.stats_interval_secs)
    }
}

/// Adaptive client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// Uplink rate as a fraction of the measured downlink rate
    #[serde(default = "default_response_ratio")]
    pub response_ratio: f64,
    #[serde(default)]
    pub advanced: bool,
    /// Profile used to shape uplink packets in advanced mode
    #[serde(default)]
    pub uplink_profile: TrafficProfile,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: f64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Silence after which the connection is declared lost
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    #[serde(default = "default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Bound on a single socket receive
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_port(),
            response_ratio: default_response_ratio(),
            advanced: false,
            uplink_profile: TrafficProfile::default(),
            stats_interval_secs: default_stats_interval_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            receive_timeout_secs: default_receive_timeout_secs(),
            reconnect_min_secs: default_reconnect_min_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            socket_timeout_secs: default_socket_timeout_secs(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to logging theme configuration file
    #[serde(default = "default_log_theme_path")]
    pub log_theme_path: String,
    /// Whether to log to file
    #[serde(default = "default_log_to_file")]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default = "default_log_file_path")]
    pub log_file_path: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    /// Advanced-mode obfuscation shared by both endpoints
    #[serde(default)]
    pub obfuscation: ObfuscationConfig,
    #[serde(default)]
    pub socket: SocketConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_theme_path: default_log_theme_path(),
            log_to_file: default_log_to_file(),
            log_file_path: default_log_file_path(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            obfuscation: ObfuscationConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_theme_path() -> String {
    "config/logging_theme.yml".to_string()
}

fn default_log_to_file() -> bool {
    false
}

fn default_log_file_path() -> Option<String> {
    None
}

fn default_server_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_target_mbps() -> f64 {
    5.0
}

fn default_stats_interval_secs() -> f64 {
    5.0
}

fn default_cleanup_interval_secs() -> u64 {
    5
}

fn default_client_timeout_secs() -> u64 {
    30
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_response_ratio() -> f64 {
    0.3
}

fn default_keepalive_interval_secs() -> u64 {
    5
}

fn default_receive_timeout_secs() -> u64 {
    10
}

fn default_reconnect_min_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_socket_timeout_secs() -> u64 {
    2
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                // Parse YAML, propagate parse errors instead of silently defaulting
                let config: Config = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("Failed to parse YAML configuration: {}", e))?;
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(
                        "Configuration file not found at '{}', using default configuration",
                        path.as_ref().display()
                    );
                    let config = Config::default();
                    config.validate()?;
                    Ok(config)
                } else {
                    // Other error (permission denied, disk error, etc.)
                    Err(anyhow::anyhow!(
                        "Failed to read configuration file '{}': {}",
                        path.as_ref().display(),
                        e
                    ))
                }
            }
        }
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).await?;
        Ok(())
    }

    /// Validate configuration fields
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate log level
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.log_level));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if path.trim().is_empty() {
                    return Err(anyhow::anyhow!("Log file path cannot be empty when log_to_file is true"));
                }
            }
        }

        // Server
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port must be between 1 and 65535"));
        }
        match (self.server.min_mbps, self.server.max_mbps) {
            (Some(min), Some(max)) => {
                if !(min > 0.0 && max >= min) {
                    return Err(anyhow::anyhow!(
                        "Floating rate range must satisfy 0 < min_mbps <= max_mbps (got {}..{})",
                        min,
                        max
                    ));
                }
            }
            (None, None) => {
                if !(self.server.target_mbps > 0.0) {
                    return Err(anyhow::anyhow!("Target rate must be greater than 0"));
                }
            }
            _ => {
                return Err(anyhow::anyhow!("min_mbps and max_mbps must be set together"));
            }
        }
        if !(self.server.stats_interval_secs > 0.0) || !(self.client.stats_interval_secs > 0.0) {
            return Err(anyhow::anyhow!("Stats interval must be greater than 0"));
        }
        if self.server.cleanup_interval_secs == 0 {
            return Err(anyhow::anyhow!("Cleanup interval must be greater than 0"));
        }
        if self.server.client_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Client timeout must be greater than 0"));
        }

        // Client
        if self.client.server_port == 0 {
            return Err(anyhow::anyhow!("Client server_port must be between 1 and 65535"));
        }
        if !(0.0..=1.0).contains(&self.client.response_ratio) {
            return Err(anyhow::anyhow!(
                "Response ratio must be within 0.0-1.0 (got {})",
                self.client.response_ratio
            ));
        }
        if self.client.keepalive_interval_secs == 0 || self.client.socket_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Keepalive and socket timeouts must be greater than 0"));
        }
        if self.client.reconnect_min_secs == 0 || self.client.reconnect_max_secs < self.client.reconnect_min_secs {
            return Err(anyhow::anyhow!("Reconnect backoff must satisfy 0 < min <= max"));
        }

        // Obfuscation
        self.obfuscation.clone().validated()?;

        if self.socket.send_buffer == 0 || self.socket.recv_buffer == 0 {
            return Err(anyhow::anyhow!("Socket buffer sizes must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::{HeaderMode, PaddingStrategy};

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.server.client_timeout(), Duration::from_secs(30));
        assert_eq!(config.client.response_ratio, 0.3);
        assert_eq!(config.socket.send_buffer, 4 * 1024 * 1024);
        assert_eq!(config.obfuscation.mtu, 1200);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
log_level: debug
server:
  port: 9999
  min_mbps: 1.0
  max_mbps: 5.0
  advanced: true
  profile: video
obfuscation:
  header_mode: rtp
  padding_strategy: progressive
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.floating_range(), Some((1.0, 5.0)));
        assert_eq!(config.server.profile, TrafficProfile::Video);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.obfuscation.header_mode, HeaderMode::RtpLike);
        assert_eq!(config.obfuscation.padding_strategy, PaddingStrategy::Progressive);
        assert_eq!(config.client.reconnect_max_secs, 30);
    }

    #[test]
    fn test_unknown_profile_rejected_at_parse() {
        let yaml = "server:\n  profile: torrent\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.log_level = "LOUD".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.min_mbps = Some(5.0);
        config.server.max_mbps = Some(1.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.min_mbps = Some(1.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.response_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.obfuscation.entropy = -0.1;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join(format!("trafmask-missing-{}.yml", std::process::id()));
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.server.port, 8888);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("trafmask-config-{}.yml", std::process::id()));
        let mut config = Config::default();
        config.server.advanced = true;
        config.client.uplink_profile = TrafficProfile::Voip;
        config.save(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert!(loaded.server.advanced);
        assert_eq!(loaded.client.uplink_profile, TrafficProfile::Voip);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_load_invalid_yaml_fails() {
        let path = std::env::temp_dir().join(format!("trafmask-bad-{}.yml", std::process::id()));
        tokio::fs::write(&path, "server: [unclosed").await.unwrap();
        assert!(Config::load(&path).await.is_err());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
