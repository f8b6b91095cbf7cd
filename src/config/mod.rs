//! Application configuration.
//!
//! Aggregates the routing, dedup, consumer and messaging sections into a
//! single Config struct loaded from YAML files and environment variables.

mod messaging;
mod routing;

pub use messaging::{AmqpConfig, ChannelConfig, MessagingConfig, NatsConfig, TransportKind};
pub use routing::{ConsumerConfig, DedupConfig, NotificationDistribution, RoutingConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Keys whose environment values are comma-separated lists.
const LIST_KEYS: &[&str] = &[
    "routing.local_types",
    "routing.remote_types",
    "messaging.transports",
    "messaging.amqp.types",
    "messaging.nats.types",
];

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Type classification and routing keys.
    pub routing: RoutingConfig,
    /// Notification dedup window.
    pub dedup: DedupConfig,
    /// Inbound consumer settings.
    pub consumer: ConsumerConfig,
    /// Transports in precedence order.
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `COURIER__DEDUP__TTL_SECS=30`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let mut environment = Environment::with_prefix(CONFIG_ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let config: Config = builder.add_source(environment).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the router cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messaging.transports.is_empty() {
            return Err(ConfigError::Invalid(
                "messaging.transports must list at least one transport".to_string(),
            ));
        }
        if self.consumer.prefetch == 0 {
            return Err(ConfigError::Invalid(
                "consumer.prefetch must be greater than zero".to_string(),
            ));
        }
        if self.dedup.enabled && self.dedup.ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "dedup.ttl_secs must be greater than zero while dedup is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
