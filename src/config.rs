//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `TURNSTILE__*` environment variables (`TURNSTILE__STORE__URL`, ...).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{GuardError, Result};
use crate::ratelimit::{FailMode, IdentityHasher, PolicyTable};

/// Prefix of environment variable overrides.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Identity hashing configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Inline policy table, used when `policy_file` is unset
    #[serde(default)]
    pub policies: PolicyTable,

    /// Path to a YAML policy table
    #[serde(default)]
    pub policy_file: Option<String>,

    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Bound on connecting and on each command, in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_command_timeout_ms() -> u64 {
    1000
}

/// Identity hashing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Salt prepended to identities before hashing
    #[serde(default)]
    pub salt: Option<String>,
}

impl IdentityConfig {
    /// Build the hasher this configuration describes.
    pub fn hasher(&self) -> IdentityHasher {
        match &self.salt {
            Some(salt) => IdentityHasher::with_salt(salt.clone()),
            None => IdentityHasher::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| GuardError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file, ignoring the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GuardError::Config(e.to_string()))
    }

    /// The policy table to install: the policy file if one is named,
    /// otherwise the inline table.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        match &self.policy_file {
            Some(path) => PolicyTable::from_file(path),
            None => {
                info!(routes = self.policies.routes.len(), "Using inline rate limit policies");
                Ok(self.policies.clone())
            }
        }
    }
}
