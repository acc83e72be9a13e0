//! INI-style configuration, one section per subsystem.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Everything the server reads at startup. Defaults match the legacy
/// shipped configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub thread_count: usize,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    /// Idle timeout, milliseconds.
    pub connection_timeout_ms: u64,
    pub max_packet_size: usize,
    pub tick_rate_ms: u64,
    pub max_event_history: usize,

    pub log_level: String,
    pub log_rotation_mb: u64,

    pub allowed_ips: Vec<IpAddr>,
    pub banned_ips: Vec<IpAddr>,

    pub enable_encryption: bool,
    pub encryption_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "destiny".to_owned(),
            ip: "0.0.0.0".to_owned(),
            port: 8281,
            thread_count: 4,
            max_connections: 1000,
            max_connections_per_ip: 5,
            connection_timeout_ms: 300_000,
            max_packet_size: destiny_protocol::MAX_FRAME_SIZE,
            tick_rate_ms: 100,
            max_event_history: 1000,
            log_level: "info".to_owned(),
            log_rotation_mb: 100,
            allowed_ips: Vec::new(),
            banned_ips: Vec::new(),
            enable_encryption: true,
            encryption_key: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn tick_rate(&self) -> Duration {
        Duration::from_millis(self.tick_rate_ms)
    }

    /// Parses `section.key = value` pairs. Unknown keys are ignored with
    /// a warning; malformed lines and bad values are errors.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut section = String::new();

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let number = number + 1;

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    return Err(ConfigError::Parse {
                        line: number,
                        reason: "unterminated section header".to_owned(),
                    });
                };
                section = name.trim().to_owned();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Parse {
                    line: number,
                    reason: format!("expected key = value, got {line:?}"),
                });
            };
            let key = key.trim();
            let value = value.trim();
            let full_key = if section.is_empty() {
                key.to_owned()
            } else {
                format!("{section}.{key}")
            };

            config.apply(&full_key, value, number)?;
        }

        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(value: &str, line: usize) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.parse().map_err(|e| ConfigError::Parse {
                line,
                reason: format!("invalid value {value:?}: {e}"),
            })
        }

        fn parse_ip_list(value: &str, line: usize) -> Result<Vec<IpAddr>, ConfigError> {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| parse(entry, line))
                .collect()
        }

        match key {
            "server.name" => self.name = value.to_owned(),
            "server.ip" => self.ip = value.to_owned(),
            "server.port" => self.port = parse(value, line)?,
            "server.threadCount" => self.thread_count = parse(value, line)?,
            "server.maxConnections" => self.max_connections = parse(value, line)?,
            "server.maxConnectionsPerIP" => self.max_connections_per_ip = parse(value, line)?,
            "server.connectionTimeout" => self.connection_timeout_ms = parse(value, line)?,
            "server.maxPacketSize" => self.max_packet_size = parse(value, line)?,
            "server.tickRateMs" => self.tick_rate_ms = parse(value, line)?,
            "server.maxEventHistory" => self.max_event_history = parse(value, line)?,
            "logging.level" => self.log_level = value.to_owned(),
            "logging.rotationSizeMB" => self.log_rotation_mb = parse(value, line)?,
            "network.allowedIPs" => self.allowed_ips = parse_ip_list(value, line)?,
            "network.bannedIPs" => self.banned_ips = parse_ip_list(value, line)?,
            "security.enableEncryption" => self.enable_encryption = parse(value, line)?,
            "security.encryptionKey" => self.encryption_key = value.to_owned(),
            _ => warn!(key, "ignoring unknown config key"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_survive_an_empty_config() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.port, 8281);
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.connection_timeout_ms, 300_000);
    }

    #[test]
    fn sections_prefix_keys() {
        let config = ServerConfig::parse(
            r"
# game world
[server]
name = Kersef
port = 8285
threadCount = 8
maxConnectionsPerIP = 3

[logging]
level = debug

[network]
bannedIPs = 10.0.0.8, 10.0.0.9

[security]
enableEncryption = false
",
        )
        .unwrap();

        assert_eq!(config.name, "Kersef");
        assert_eq!(config.port, 8285);
        assert_eq!(config.thread_count, 8);
        assert_eq!(config.max_connections_per_ip, 3);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.banned_ips.len(), 2);
        assert!(!config.enable_encryption);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = ServerConfig::parse("[server]\nfancyNewKnob = 7\nport = 9000\n").unwrap();
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn bad_values_and_lines_are_errors() {
        assert!(matches!(
            ServerConfig::parse("[server]\nport = many\n"),
            Err(ConfigError::Parse { line: 2, .. })
        ));
        assert!(matches!(
            ServerConfig::parse("[server\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            ServerConfig::parse("just some words\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
    }
}
