//! Application configuration from file and environment variables
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Environment variables (prefixed with BAZAAR_, sections split by `__`)
//! 2. Config file (messaging.toml)
//! 3. Default values
//!
//! e.g. `BAZAAR_DATABASE__URL`, `BAZAAR_PRESENCE__OFFLINE_AFTER_SECS`.
//! Keep the session key and database credentials in the environment.

use crate::crypto::KdfParams;
use crate::messaging::MessagingConfig;
use crate::presence::PresenceConfig;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "messaging.toml";

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Cookie session signing key, at least 64 bytes. A random key is used
    /// when empty, which logs everyone out on restart.
    pub session_key: String,
    /// Hub mailbox size before publishes are dropped
    pub hub_mailbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            session_key: String::new(),
            hub_mailbox_capacity: 256,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Create missing tables on startup
    pub create_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://messaging.db?mode=rwc".to_string(),
            max_connections: 10,
            create_schema: true,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub presence: PresenceConfig,
    pub crypto: KdfParams,
    pub messaging: MessagingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from_path(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("BAZAAR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
