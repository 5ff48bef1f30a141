//! Application configuration.
//!
//! Aggregates broker, topology, client and server settings into a single
//! Config struct that can be loaded from YAML files or environment variables.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SWITCHBOARD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SWITCHBOARD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SWITCHBOARD_LOG";

/// Default shared exchange.
pub const DEFAULT_EXCHANGE_NAME: &str = "switchboard.rpc";
/// Default request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Default number of in-flight handler invocations per queue.
pub const DEFAULT_PREFETCH: u16 = 16;

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub messaging: MessagingConfig,
    /// Exchange and queue naming.
    pub topology: TopologyConfig,
    /// Request timeouts.
    pub client: ClientConfig,
    /// Handler dispatch.
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
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

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Create config for testing: in-process broker, short timeouts.
    pub fn for_test() -> Self {
        Self {
            messaging: MessagingConfig {
                messaging_type: MessagingType::Channel,
                ..Default::default()
            },
            client: ClientConfig {
                default_timeout_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject settings the substrate cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.exchange.is_empty() {
            return Err(ConfigError::Invalid(
                "topology.exchange must not be empty".to_string(),
            ));
        }
        if self.topology.queue_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "topology.queue_prefix must not be empty".to_string(),
            ));
        }
        if self.server.prefetch == 0 {
            return Err(ConfigError::Invalid(
                "server.prefetch must be at least 1".to_string(),
            ));
        }
        if self.client.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "client.default_timeout_ms must be positive".to_string(),
            ));
        }
        if let FailurePolicyConfig::Retry { max_attempts, .. } = &self.server.failure_policy {
            if *max_attempts == 0 {
                return Err(ConfigError::Invalid(
                    "server.failure_policy.max_attempts must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-process channel broker (no external broker).
    Channel,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL, credentials included.
    pub url: String,
    /// Connections kept open. One is the shared process connection.
    pub pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 1,
        }
    }
}

/// Exchange and queue naming.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Shared topic exchange.
    pub exchange: String,
    /// Domain prefix for queue names (`<prefix>.<routing-key>`).
    pub queue_prefix: String,
    /// Declare operation queues durable.
    pub durable: bool,
    /// Bind attempts before giving up at start-up.
    pub bind_attempts: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE_NAME.to_string(),
            queue_prefix: "switchboard".to_string(),
            durable: true,
            bind_attempts: 10,
        }
    }
}

/// Request timeout configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for operations without an override.
    pub default_timeout_ms: u64,
    /// Per routing key overrides, e.g. slow payment gateway calls.
    pub timeouts: HashMap<String, u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            timeouts: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Timeout for a routing key.
    pub fn timeout_for(&self, routing_key: &str) -> Duration {
        let ms = self
            .timeouts
            .get(routing_key)
            .copied()
            .unwrap_or(self.default_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Handler dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum in-flight handler invocations per queue.
    pub prefetch: u16,
    /// What happens to a fire-and-forget message whose handler failed.
    pub failure_policy: FailurePolicyConfig,
    /// Consumer reconnect attempts before the server reports a fatal error.
    pub reconnect_attempts: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            failure_policy: FailurePolicyConfig::default(),
            reconnect_attempts: 30,
        }
    }
}

/// Failure policy for fire-and-forget messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicyConfig {
    /// Negative-acknowledge without requeue.
    #[default]
    Drop,
    /// Redeliver up to `max_attempts` times, then dead-letter or drop.
    Retry {
        max_attempts: u32,
        #[serde(default)]
        dead_letter_key: Option<String>,
    },
}
