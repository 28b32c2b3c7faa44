//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{KeyStrategy, LimitConfig, TimeWindow, WindowSpec};

/// Prefix for environment overrides, e.g. `TURNSTILE__STORE__URL`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Per route group limits
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Take the caller address from the first `X-Forwarded-For` entry
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    Redis,
    /// In-process map, single instance only
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Bound on every store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix prepended to every counter key
    #[serde(default)]
    pub key_prefix: String,

    /// Increment and arm the window expiry in one atomic store call
    #[serde(default)]
    pub atomic_expiry: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            timeout_ms: default_timeout_ms(),
            key_prefix: String::new(),
            atomic_expiry: false,
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Limits for each route group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Applied to every request
    #[serde(default = "default_global_rule")]
    pub global: RuleConfig,

    /// Applied to the uploads group on top of the global rule
    #[serde(default = "default_uploads_rule")]
    pub uploads: RuleConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            global: default_global_rule(),
            uploads: default_uploads_rule(),
        }
    }
}

fn default_global_rule() -> RuleConfig {
    RuleConfig {
        limit: 100,
        window: WindowSpec::Unit(TimeWindow::Minute),
        strategy: KeyStrategy::NetworkAddress,
    }
}

fn default_uploads_rule() -> RuleConfig {
    RuleConfig {
        limit: 10,
        window: WindowSpec::Unit(TimeWindow::Minute),
        strategy: KeyStrategy::Credential,
    }
}

/// One `(limit, window, strategy)` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length: a unit name or a number of seconds
    pub window: WindowSpec,
    /// How requests are mapped to counters
    pub strategy: KeyStrategy,
}

impl RuleConfig {
    /// Build the validated limit for this rule.
    pub fn limit_config(&self) -> Result<LimitConfig> {
        LimitConfig::new(self.limit, self.window.duration())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    ///
    /// Fields the document leaves out, including single fields of a rule,
    /// keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = Self::builder()?
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with `TURNSTILE__*`
    /// environment variables, then apply a `PORT` override.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment(), std::env::var("PORT").ok())
    }

    fn load_with(
        path: Option<&Path>,
        environment: config::Environment,
        port: Option<String>,
    ) -> Result<Self> {
        let mut builder = Self::builder()?;
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let mut config: TurnstileConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        if let Some(port) = port {
            config.apply_port(&port)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// A builder seeded with the defaults, so later sources only need to
    /// name the fields they change.
    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let defaults = config::Config::try_from(&TurnstileConfig::default())?;
        Ok(config::Config::builder().add_source(defaults))
    }

    /// Replace the listen port, keeping the bind host.
    pub fn apply_port(&mut self, port: &str) -> Result<()> {
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| TurnstileError::Config(format!("Invalid PORT value: {:?}", port)))?;
        self.server.bind_addr.set_port(port);
        Ok(())
    }

    /// Reject limits, windows or timeouts of zero.
    pub fn validate(&self) -> Result<()> {
        for (group, rule) in [
            ("global", &self.rate_limits.global),
            ("uploads", &self.rate_limits.uploads),
        ] {
            rule.limit_config()
                .map_err(|e| TurnstileError::Config(format!("rate_limits.{}: {}", group, e)))?;
        }

        if self.store.timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
