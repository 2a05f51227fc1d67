use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub blackboard: BlackboardConfig,
    #[serde(default)]
    pub swap: SwapConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Prefix for every agent subject (`<prefix><agent>.<topic>`)
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Buffered deliveries per subscription before publishers back off
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_subject_prefix() -> String {
    "agents.".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subject_prefix: default_subject_prefix(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardConfig {
    /// Namespace prepended to every durable key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Mirror registry and swap sessions to the blackboard
    #[serde(default = "default_true")]
    pub mirror_enabled: bool,
}

fn default_key_prefix() -> String {
    "blackboard:".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            mirror_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Upper bound on the liveness ping wait, further capped by the caller's deadline
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    /// Terminal sessions kept in memory before the oldest are pruned
    #[serde(default = "default_max_sessions")]
    pub max_sessions_retained: usize,
}

fn default_ping_timeout() -> u64 {
    5_000
}

fn default_max_sessions() -> usize {
    256
}

impl SwapConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: default_ping_timeout(),
            max_sessions_retained: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum time without heartbeat before an agent is reported stale (ms)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
}

fn default_heartbeat_timeout() -> u64 {
    30_000
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("bus.subject_prefix", default_subject_prefix())?
            .set_default("blackboard.key_prefix", default_key_prefix())?
            .set_default("swap.ping_timeout_ms", default_ping_timeout())?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ORCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // ORCH_SWAP__PING_TIMEOUT_MS, ORCH_BUS__SUBJECT_PREFIX, ...
            .add_source(
                Environment::with_prefix("ORCH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bus.subject_prefix.is_empty() {
            errors.push("bus.subject_prefix must not be empty".to_string());
        }
        if self.bus.channel_capacity == 0 {
            errors.push("bus.channel_capacity must be positive".to_string());
        }
        if self.blackboard.key_prefix.is_empty() {
            errors.push("blackboard.key_prefix must not be empty".to_string());
        }
        if self.swap.ping_timeout_ms == 0 {
            errors.push("swap.ping_timeout_ms must be positive".to_string());
        }
        if self.swap.max_sessions_retained == 0 {
            errors.push("swap.max_sessions_retained must be positive".to_string());
        }
        if self.registry.heartbeat_timeout_ms == 0 {
            errors.push("registry.heartbeat_timeout_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
