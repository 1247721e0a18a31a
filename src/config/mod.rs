//! Application configuration.
//!
//! Loaded from YAML files and environment variables into a single [`Config`]
//! shared by the leader and member binaries.

mod messaging;

pub use messaging::{BrokerConfig, BrokerType};

use std::net::SocketAddr;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TASKSYNC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TASKSYNC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TASKSYNC_LOG";

/// Legacy variable for the broker URL.
pub const RABBITMQ_URL_ENV_VAR: &str = "RABBITMQ_URL";
/// Legacy variable for the leader port.
pub const PORT_LEADER_ENV_VAR: &str = "PORT_LEADER";
/// Legacy variable for the member port.
pub const PORT_MEMBER_ENV_VAR: &str = "PORT_MEMBER";

pub const DEFAULT_LEADER_PORT: u16 = 5000;
pub const DEFAULT_MEMBER_PORT: u16 = 5001;

/// (legacy variable, config key, prefixed variable that takes precedence)
const LEGACY_ENV: [(&str, &str, &str); 3] = [
    (RABBITMQ_URL_ENV_VAR, "broker.url", "TASKSYNC__BROKER__URL"),
    (PORT_LEADER_ENV_VAR, "leader.port", "TASKSYNC__LEADER__PORT"),
    (PORT_MEMBER_ENV_VAR, "member.port", "TASKSYNC__MEMBER__PORT"),
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid listen address '{address}': {message}")]
    InvalidAddress { address: String, message: String },
}

/// HTTP listener for one service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_LEADER_PORT,
        }
    }
}

impl ServiceConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn address(&self) -> Result<SocketAddr, ConfigError> {
        let address = format!("{}:{}", self.host, self.port);
        address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddress {
                message: e.to_string(),
                address,
            })
    }
}

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub leader: ServiceConfig,
    pub member: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            leader: ServiceConfig::with_port(DEFAULT_LEADER_PORT),
            member: ServiceConfig::with_port(DEFAULT_MEMBER_PORT),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy `RABBITMQ_URL`, `PORT_LEADER`, `PORT_MEMBER`, unless the
    ///    prefixed equivalent is set
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .set_default("leader.port", i64::from(DEFAULT_LEADER_PORT))?
            .set_default("member.port", i64::from(DEFAULT_MEMBER_PORT))?
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (legacy, key, prefixed) in LEGACY_ENV {
            if std::env::var(prefixed).is_ok() {
                continue;
            }
            if let Ok(value) = std::env::var(legacy) {
                builder = builder.set_override(key, value)?;
            }
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-memory broker, ephemeral ports.
    pub fn for_test() -> Self {
        Self {
            broker: BrokerConfig {
                broker_type: BrokerType::Memory,
                ..BrokerConfig::default()
            },
            leader: ServiceConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            member: ServiceConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
        }
    }
}
