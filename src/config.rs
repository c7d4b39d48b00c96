use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    /// Present when the Ledger protocol variant should be wired up.
    #[serde(default)]
    pub ledger: Option<LedgerConfig>,
    /// Absent means the in-memory store (dry runs).
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Stable node identity used in negotiation.
    pub id: String,
    /// Directory scanned for policy files at startup.
    pub policy_dir: PathBuf,
    /// When true, proposals for protocols we never subscribed to are
    /// ignored instead of evaluated.
    #[serde(default)]
    pub require_subscription: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the node registry
    pub base_url: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Base URL of the ledger gateway
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
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
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("agent.require_subscription", false)?
            .set_default("agent.heartbeat_interval_secs", 60)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ACCORD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ACCORD_AGENT__ID, etc.)
            .add_source(
                Environment::with_prefix("ACCORD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.agent.id.is_empty() {
            errors.push("agent.id must not be empty".to_string());
        }
        if self.agent.heartbeat_interval_secs == 0 {
            errors.push("agent.heartbeat_interval_secs must be positive".to_string());
        }
        if self.registry.base_url.is_empty() {
            errors.push("registry.base_url must not be empty".to_string());
        }
        if let Some(database) = &self.database {
            if database.url.is_empty() {
                errors.push("database.url must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
