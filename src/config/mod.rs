//! Configuration management for hello-discovery
//!
//! Configuration is an explicit, immutable value. It is loaded once from
//! environment variables or a TOML file, validated, and then passed into
//! constructors. Nothing reads the environment after startup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::discovery::Address;
use crate::reconnect::ReconnectConfig;
use crate::retry::RetryConfig;

/// Environment variable selecting the discovery backend
pub const ENV_DISCOVERY: &str = "GRPC_HELLO_DISCOVERY";

/// Environment variable holding the discovery endpoint
pub const ENV_DISCOVERY_ENDPOINT: &str = "GRPC_HELLO_DISCOVERY_ENDPOINT";

pub const ENV_SERVER: &str = "GRPC_SERVER";
pub const ENV_SERVER_PORT: &str = "GRPC_SERVER_PORT";
pub const ENV_BACKEND: &str = "GRPC_HELLO_BACKEND";
pub const ENV_BACKEND_PORT: &str = "GRPC_HELLO_BACKEND_PORT";

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
const DEFAULT_SERVICE: &str = "hello-grpc";
const DEFAULT_SERVER_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 9996;

// ============================================================================
// Top-level Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discovery and registration
    pub discovery: DiscoveryConfig,

    /// Reconnect controller
    pub reconnect: ReconnectConfig,

    /// Per-call retry helper
    pub retry: RetryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            discovery: DiscoveryConfig::from_lookup(&lookup)?,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        config.discovery.endpoint = normalize_endpoint(&config.discovery.endpoint);
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.discovery.validate()?;
        self.reconnect.validate()?;
        self.retry.validate()?;
        self.logging.validate()
    }
}

// ============================================================================
// Discovery Config
// ============================================================================

/// Which discovery backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    Etcd,
    Nacos,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Etcd => "etcd",
            Self::Nacos => "nacos",
        }
    }
}

impl std::str::FromStr for DiscoveryKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(Self::Etcd),
            "nacos" => Ok(Self::Nacos),
            other => Err(ConfigError::InvalidValue {
                field: ENV_DISCOVERY.to_string(),
                reason: format!("unknown discovery backend '{other}' (expected etcd or nacos)"),
            }),
        }
    }
}

/// Discovery and registration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Backend; `None` means static addressing
    pub discovery: Option<DiscoveryKind>,

    /// Discovery endpoint URL(s), comma separated
    pub endpoint: String,

    /// Service name used as the key prefix
    pub service_name: String,

    /// Server host
    pub server_host: String,

    /// Server port
    pub server_port: u16,

    /// Static backend host override
    pub backend_host: Option<String>,

    /// Static backend port override
    pub backend_port: Option<u16>,

    /// Registration lease TTL in seconds
    pub lease_ttl_secs: u64,

    /// Scheme written into registration keys
    pub scheme: String,

    /// Nacos poll interval in milliseconds
    pub nacos_poll_interval_ms: u64,

    /// Transport connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE.to_string(),
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_PORT,
            backend_host: None,
            backend_port: None,
            lease_ttl_secs: 5,
            scheme: crate::discovery::DEFAULT_SCHEME.to_string(),
            nacos_poll_interval_ms: 2000,
            connect_timeout_ms: 3000,
        }
    }
}

impl DiscoveryConfig {
    /// Create a new config builder
    pub fn builder() -> DiscoveryConfigBuilder {
        DiscoveryConfigBuilder::default()
    }

    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let discovery = non_empty(ENV_DISCOVERY)
            .map(|v| v.parse::<DiscoveryKind>())
            .transpose()?;

        let endpoint = non_empty(ENV_DISCOVERY_ENDPOINT)
            .map(|v| normalize_endpoint(&v))
            .unwrap_or(defaults.endpoint);

        let server_host = non_empty(ENV_SERVER).unwrap_or(defaults.server_host);
        let server_port = non_empty(ENV_SERVER_PORT)
            .map(|v| parse_port(ENV_SERVER_PORT, &v))
            .transpose()?
            .unwrap_or(defaults.server_port);

        let backend_host = non_empty(ENV_BACKEND);
        let backend_port = non_empty(ENV_BACKEND_PORT)
            .map(|v| parse_port(ENV_BACKEND_PORT, &v))
            .transpose()?;

        Ok(Self {
            discovery,
            endpoint,
            server_host,
            server_port,
            backend_host,
            backend_port,
            ..defaults
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "service_name".to_string(),
            });
        }

        if self.service_name.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "service_name".to_string(),
                reason: "Must not contain '/'".to_string(),
            });
        }

        if self.endpoints().is_empty() {
            return Err(ConfigError::MissingField {
                field: "endpoint".to_string(),
            });
        }

        if self.server_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server_port".to_string(),
                reason: "Port must be non-zero".to_string(),
            });
        }

        if self.lease_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lease_ttl_secs".to_string(),
                reason: "TTL must be at least 1 second".to_string(),
            });
        }

        if self.nacos_poll_interval_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "nacos_poll_interval_ms/connect_timeout_ms".to_string(),
                reason: "Must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Discovery endpoints as a list
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoint
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(normalize_endpoint)
            .collect()
    }

    /// Address used when discovery is off
    ///
    /// `GRPC_HELLO_BACKEND` wins over `GRPC_SERVER`; the backend port falls
    /// back to the server port.
    pub fn static_address(&self) -> Address {
        let host = self
            .backend_host
            .clone()
            .unwrap_or_else(|| self.server_host.clone());
        let port = self.backend_port.unwrap_or(self.server_port);
        Address::new(host, port)
    }

    /// Address this process registers as
    pub fn server_address(&self) -> Address {
        Address::new(self.server_host.clone(), self.server_port)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    #[must_use]
    pub fn nacos_poll_interval(&self) -> Duration {
        Duration::from_millis(self.nacos_poll_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Builder for DiscoveryConfig
#[derive(Debug, Default)]
pub struct DiscoveryConfigBuilder {
    discovery: Option<DiscoveryKind>,
    endpoint: Option<String>,
    service_name: Option<String>,
    server_host: Option<String>,
    server_port: Option<u16>,
    backend_host: Option<String>,
    backend_port: Option<u16>,
    lease_ttl_secs: Option<u64>,
    scheme: Option<String>,
    nacos_poll_interval_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

impl DiscoveryConfigBuilder {
    /// Set the discovery backend
    pub fn discovery(mut self, kind: DiscoveryKind) -> Self {
        self.discovery = Some(kind);
        self
    }

    /// Set the discovery endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the service name
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the server address
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_host = Some(host.into());
        self.server_port = Some(port);
        self
    }

    /// Set a static backend override
    pub fn backend(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.backend_host = Some(host.into());
        self.backend_port = port;
        self
    }

    /// Set the lease TTL
    pub fn lease_ttl_secs(mut self, secs: u64) -> Self {
        self.lease_ttl_secs = Some(secs);
        self
    }

    /// Set the registration key scheme
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    /// Set the Nacos poll interval
    pub fn nacos_poll_interval_ms(mut self, ms: u64) -> Self {
        self.nacos_poll_interval_ms = Some(ms);
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<DiscoveryConfig, ConfigError> {
        let defaults = DiscoveryConfig::default();
        let config = DiscoveryConfig {
            discovery: self.discovery,
            endpoint: self
                .endpoint
                .map(|e| normalize_endpoint(&e))
                .unwrap_or(defaults.endpoint),
            service_name: self.service_name.unwrap_or(defaults.service_name),
            server_host: self.server_host.unwrap_or(defaults.server_host),
            server_port: self.server_port.unwrap_or(defaults.server_port),
            backend_host: self.backend_host,
            backend_port: self.backend_port,
            lease_ttl_secs: self.lease_ttl_secs.unwrap_or(defaults.lease_ttl_secs),
            scheme: self.scheme.unwrap_or(defaults.scheme),
            nacos_poll_interval_ms: self
                .nacos_poll_interval_ms
                .unwrap_or(defaults.nacos_poll_interval_ms),
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(defaults.connect_timeout_ms),
        };

        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Logging Config
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                reason: format!("Unknown format '{other}'"),
            }),
        }
    }
}

// ============================================================================
// Helpers & Errors
// ============================================================================

/// Prefix `http://` when the endpoint carries no scheme
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

fn parse_port(field: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("Invalid port: {value}"),
        })
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue { field: String, reason: String },
    MissingField { field: String },
    ReadFailed { path: String, reason: String },
    ParseFailed { path: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            Self::MissingField { field } => {
                write!(f, "Missing required field: {}", field)
            }
            Self::ReadFailed { path, reason } => {
                write!(f, "Failed to read config file {}: {}", path, reason)
            }
            Self::ParseFailed { path, reason } => {
                write!(f, "Failed to parse TOML config file {}: {}", path, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
