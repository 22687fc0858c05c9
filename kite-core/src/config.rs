use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::resilience::timeout::{
    COORDINATION_CONNECT_TIMEOUT, RPC_CALL_TIMEOUT, TRANSPORT_CONNECT_TIMEOUT,
};

/// Default coordination service address when none is configured
pub const DEFAULT_COORDINATION_ADDRESS: &str = "127.0.0.1:2181";

/// Framework configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KiteConfig {
    pub coordination: CoordinationConfig,
    pub server: ServerConfig,
    pub extension: ExtensionConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// Which coordination backend holds registrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    /// Shared Redis deployment (multi-process)
    Redis,
    /// In-process tree (single-process deployments and tests)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: CoordinationBackend,
    /// `host:port` or a full `redis://` URL
    pub address: String,
    pub connect_timeout_secs: u64,
    /// First backoff delay between connection attempts
    pub base_sleep_ms: u64,
    pub max_retries: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Redis,
            address: DEFAULT_COORDINATION_ADDRESS.to_string(),
            connect_timeout_secs: COORDINATION_CONNECT_TIMEOUT.as_secs(),
            base_sleep_ms: 1000,
            max_retries: 3,
        }
    }
}

impl CoordinationConfig {
    /// Connection URL for the Redis backend
    #[must_use]
    pub fn redis_url(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("redis://{}", self.address)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address advertised to the registry; resolved from the primary
    /// interface when unset.
    pub host: Option<String>,
    pub bind_host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            bind_host: "0.0.0.0".to_string(),
            port: 9998,
        }
    }
}

/// Extension selection and descriptor lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Extra resource roots scanned for `extensions/<extension point>` files
    pub directories: Vec<PathBuf>,
    pub registry: String,
    pub discovery: String,
    pub load_balance: String,
    pub transport: String,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            registry: "coordinated".to_string(),
            discovery: "coordinated".to_string(),
            load_balance: "consistent_hash".to_string(),
            transport: "tcp".to_string(),
        }
    }
}

/// Client call policy defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-attempt timeout; 0 disables it
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: RPC_CALL_TIMEOUT.as_secs(),
            max_retries: 0,
            retry_base_ms: 200,
            connect_timeout_secs: TRANSPORT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl KiteConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // KITE_COORDINATION__ADDRESS, KITE_EXTENSION__LOAD_BALANCE, ...
        builder = builder.add_source(
            Environment::with_prefix("KITE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("extension.directories")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for values that would only fail later at runtime
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.coordination.address.trim().is_empty() {
            errors.push("coordination.address must not be empty".to_string());
        }
        if self.coordination.connect_timeout_secs == 0 {
            errors.push("coordination.connect_timeout_secs must be greater than 0".to_string());
        }
        for (field, value) in [
            ("extension.registry", &self.extension.registry),
            ("extension.discovery", &self.extension.discovery),
            ("extension.load_balance", &self.extension.load_balance),
            ("extension.transport", &self.extension.transport),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{field} must name an extension"));
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

static GLOBAL: Lazy<KiteConfig> = Lazy::new(|| match KiteConfig::from_env() {
    Ok(config) => config,
    Err(e) => {
        tracing::warn!(error = %e, "Failed to load configuration from environment, using defaults");
        KiteConfig::default()
    }
});

/// Process-wide configuration, read from the environment on first use
pub fn global() -> &'static KiteConfig {
    &GLOBAL
}
