//! Configuration module
//!
//! Handles loading and saving EngineNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network;
use crate::protocol::{DEFAULT_MAX_BODY_SIZE, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Server loop settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this peer
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Server host a client connects to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest message body accepted from a peer
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u32,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_body_size() -> u32 {
    DEFAULT_MAX_BODY_SIZE
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Server loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Messages dispatched per update (all when unset)
    pub max_messages_per_update: Option<usize>,
    /// Simulation ticks per second
    #[serde(default = "default_tick_rate")]
    pub tick_rate_hz: u32,
}

fn default_tick_rate() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_messages_per_update: None,
            tick_rate_hz: default_tick_rate(),
        }
    }
}

impl From<&Config> for network::NetworkConfig {
    fn from(config: &Config) -> Self {
        Self {
            port: config.network.port,
            max_body_size: config.network.max_body_size,
            connect_timeout_ms: config.network.connect_timeout_ms,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("enginenet/config.toml")),
            Some(PathBuf::from("./enginenet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "arena-server".to_string(),
            verbose: false,
        },
        server: ServerConfig {
            max_messages_per_update: Some(256),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.max_body_size, 1024);
        assert_eq!(config.server.tick_rate_hz, 30);
        assert!(config.server.max_messages_per_update.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.port = 4242;
        config.server.max_messages_per_update = Some(8);
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 4242);
        assert_eq!(loaded.server.max_messages_per_update, Some(8));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[network]\nport = 7000\n").unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.connect_timeout_ms, 5000);
        assert_eq!(config.server.tick_rate_hz, 30);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(Config::load(&path), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[network]\nport = \"not a number\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_network_config_conversion() {
        let mut config = Config::default();
        config.network.max_body_size = 64;
        let net = network::NetworkConfig::from(&config);
        assert_eq!(net.port, DEFAULT_PORT);
        assert_eq!(net.max_body_size, 64);
        assert_eq!(net.connect_timeout_ms, 5000);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "arena-server");
        assert_eq!(parsed.server.max_messages_per_update, Some(256));
    }
}
