//! # Configuration Management
//!
//! Process settings are read from `SWITCHYARD_*` environment variables (a
//! `.env` file is honoured by the binary) and validated before startup.

mod settings;

pub use settings::{AppConfig, ObservabilityConfig, SourcesConfig, XdsConfig};

use std::str::FromStr;

use crate::errors::{Error, Result};

impl AppConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source; unset
    /// variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();
        let config = AppConfig {
            xds: XdsConfig {
                host: lookup("SWITCHYARD_XDS_BIND_ADDRESS").unwrap_or(defaults.xds.host),
                port: parse_var(&lookup, "SWITCHYARD_XDS_PORT", defaults.xds.port)?,
                fallback_port: parse_var(
                    &lookup,
                    "SWITCHYARD_FALLBACK_PORT",
                    defaults.xds.fallback_port,
                )?,
            },
            sources: SourcesConfig {
                config_path: lookup("SWITCHYARD_CONFIG_PATH")
                    .unwrap_or(defaults.sources.config_path),
                secrets_dir: lookup("SWITCHYARD_SECRETS_DIR").unwrap_or(defaults.sources.secrets_dir),
                files_dir: lookup("SWITCHYARD_FILES_DIR").unwrap_or(defaults.sources.files_dir),
                poll_interval_ms: parse_var(
                    &lookup,
                    "SWITCHYARD_POLL_INTERVAL_MS",
                    defaults.sources.poll_interval_ms,
                )?,
            },
            observability: ObservabilityConfig {
                metrics_port: parse_var(
                    &lookup,
                    "SWITCHYARD_METRICS_PORT",
                    defaults.observability.metrics_port,
                )?,
                service_name: defaults.observability.service_name,
                log_level: lookup("SWITCHYARD_LOG_LEVEL")
                    .unwrap_or(defaults.observability.log_level),
                json_logging: lookup("SWITCHYARD_JSON_LOGGING")
                    .map(|value| parse_bool(&value))
                    .unwrap_or(defaults.observability.json_logging),
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[])).expect("config");
        assert_eq!(config.xds.bind_address(), "0.0.0.0:18000");
        assert_eq!(config.xds.fallback_port, 8080);
        assert_eq!(config.sources.poll_interval_ms, 1000);
        assert_eq!(config.sources.secrets_dir, "secrets");
    }

    #[test]
    fn variables_override_defaults() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("SWITCHYARD_XDS_PORT", "19000"),
            ("SWITCHYARD_CONFIG_PATH", "/etc/switchyard/config.yaml"),
            ("SWITCHYARD_SECRETS_DIR", "/etc/switchyard/secrets"),
            ("SWITCHYARD_JSON_LOGGING", "yes"),
            ("SWITCHYARD_POLL_INTERVAL_MS", "250"),
        ]))
        .expect("config");

        assert_eq!(config.xds.port, 19000);
        assert_eq!(config.sources.config_path, "/etc/switchyard/config.yaml");
        assert_eq!(config.sources.secrets_dir, "/etc/switchyard/secrets");
        assert!(config.observability.json_logging);
        assert_eq!(config.sources.poll_interval().as_millis(), 250);
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let err = AppConfig::from_lookup(lookup_from(&[("SWITCHYARD_XDS_PORT", "lots")]))
            .expect_err("invalid port");
        assert!(err.to_string().contains("SWITCHYARD_XDS_PORT"));
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let err = AppConfig::from_lookup(lookup_from(&[("SWITCHYARD_POLL_INTERVAL_MS", "5")]))
            .expect_err("interval too small");
        assert!(matches!(err, Error::Validation(_)));
    }
}
