//! # Observability
//!
//! Structured logging, the gRPC interceptor chain and Prometheus metrics for
//! the Switchyard control plane.

pub mod grpc_logging;
pub mod logging;
pub mod metrics;

pub use grpc_logging::GrpcLoggingLayer;
pub use logging::{init_logging, log_config_info};
pub use metrics::{init_metrics, GrpcMetricsLayer};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging, then metrics when a metrics port is configured.
pub fn init_observability(config: &ObservabilityConfig) -> Result<()> {
    init_logging(config)?;
    init_metrics(config)?;

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logging = config.json_logging,
        metrics_enabled = config.metrics_bind_address().is_some(),
        "Observability initialized"
    );
    Ok(())
}
