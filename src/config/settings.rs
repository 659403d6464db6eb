//! Dispatcher settings and configuration management

use crate::balancer::registry::LoadBalancingStrategy;
use crate::balancer::server::Server;
use crate::error::{DispatchError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Logical service the client talks to
    #[serde(default = "default_service_id")]
    pub service_id: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_service_id() -> String {
    "default".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    30000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

/// Load balancer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Consecutive failures before a server's circuit trips
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_open")]
    pub circuit_open_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_circuit_open() -> u64 {
    30000
}

impl LoadBalancerConfig {
    /// Whether requests should go through selection at all
    pub fn is_active(&self) -> bool {
        self.enabled && !self.servers.is_empty()
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: LoadBalancingStrategy::default(),
            servers: vec![],
            failure_threshold: default_failure_threshold(),
            circuit_open_ms: default_circuit_open(),
        }
    }
}

/// Retry and failover configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries_same_server: u32,
    #[serde(default = "default_retries_next_server")]
    pub max_retries_next_server: u32,
    /// Retry non-idempotent methods on errors other than connect failures
    #[serde(default)]
    pub retry_on_all_operations: bool,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub exponential: bool,
    #[serde(default)]
    pub jitter: bool,
}

fn default_retries_next_server() -> u32 {
    1
}

fn default_max_backoff() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_same_server: 0,
            max_retries_next_server: default_retries_next_server(),
            retry_on_all_operations: false,
            backoff_ms: 0,
            max_backoff_ms: default_max_backoff(),
            exponential: false,
            jitter: false,
        }
    }
}

/// Server health check configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_check_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_check_path")]
    pub path: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_recovery_threshold() -> u32 {
    2
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_health_check_interval(),
            path: default_health_check_path(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/default.toml")
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            // Start with default values
            .set_default("client.service_id", default_service_id())?
            .set_default("load_balancer.enabled", true)?
            // Load from configuration file
            .add_source(File::with_name(path.as_ref().to_str().unwrap_or("config/default")).required(false))
            // Override with environment variables (prefixed with LB_DISPATCH_)
            .add_source(
                Environment::with_prefix("LB_DISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.client.connect_timeout_ms == 0 || self.client.read_timeout_ms == 0 {
            return Err(invalid("Client timeouts must be greater than 0".to_string()));
        }

        if self.client.service_id.is_empty() {
            return Err(invalid("Client service_id cannot be empty".to_string()));
        }

        for server in &self.load_balancer.servers {
            if server.host.is_empty() {
                return Err(invalid("Server host cannot be empty".to_string()));
            }
            if server.port == 0 {
                return Err(invalid(format!("Server '{}' port cannot be 0", server.host)));
            }
        }

        if self.health_check.enabled && self.health_check.interval_secs == 0 {
            return Err(invalid("Health check interval cannot be 0".to_string()));
        }

        Ok(())
    }
}

fn invalid(message: String) -> DispatchError {
    DispatchError::Config(config::ConfigError::Message(message))
}
