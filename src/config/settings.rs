//! # Configuration Settings
//!
//! Defines the configuration structure for the Switchyard control plane.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    /// xDS server configuration
    #[validate(nested)]
    pub xds: XdsConfig,

    /// Where configuration, secrets and files are read from
    #[validate(nested)]
    pub sources: SourcesConfig,

    /// Logging and metrics configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    /// Checks spanning more than one section
    fn validate_custom(&self) -> Result<()> {
        if self.xds.port == self.observability.metrics_port {
            return Err(Error::config(format!(
                "xDS port {} conflicts with the metrics port",
                self.xds.port
            )));
        }
        Ok(())
    }
}

/// xDS server configuration for Envoy communication
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct XdsConfig {
    /// xDS server bind address
    #[validate(length(min = 1, message = "xDS host cannot be empty"))]
    pub host: String,

    /// xDS server port
    #[validate(range(min = 1, max = 65535, message = "xDS port must be between 1 and 65535"))]
    pub port: u16,

    /// Port of the error-page listener served to proxies with a malformed node id
    #[validate(range(min = 1, max = 65535, message = "Fallback port must be between 1 and 65535"))]
    pub fallback_port: u16,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 18000, fallback_port: 8080 }
    }
}

impl XdsConfig {
    /// Get the xDS server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// File-backed inputs polled by the watchers
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SourcesConfig {
    /// YAML file holding upstreams, virtual services, roles and attributes
    #[validate(length(min = 1, message = "Config path cannot be empty"))]
    pub config_path: String,

    /// Directory of `<ref>.yaml` secrets
    #[validate(length(min = 1, message = "Secrets directory cannot be empty"))]
    pub secrets_dir: String,

    /// Directory of raw files referenced by name
    #[validate(length(min = 1, message = "Files directory cannot be empty"))]
    pub files_dir: String,

    #[validate(range(
        min = 10,
        max = 60000,
        message = "Poll interval must be between 10 and 60000 milliseconds"
    ))]
    pub poll_interval_ms: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            config_path: "switchyard.yaml".to_string(),
            secrets_dir: "secrets".to_string(),
            files_dir: "files".to_string(),
            poll_interval_ms: 1000,
        }
    }
}

impl SourcesConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Service name attached to exported metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log filter directive (trace, debug, info, warn, error or a target list)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_port: 0,
            service_name: "switchyard".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
