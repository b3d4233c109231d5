//! # Metrics Collection
//!
//! Counters and gauges for translation, snapshot distribution and xDS
//! traffic, exported through Prometheus when a metrics port is configured.
//! Without an installed exporter every call is a no-op.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use ::tracing::info;
use http::{Request, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower::{Layer, Service};

use super::grpc_logging::parse_grpc_path;
use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Install the Prometheus exporter. A metrics port of 0 disables export.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(metrics_addr) = config.metrics_bind_address() else {
        return Ok(());
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    describe_metrics();
    info!(metrics_addr = %metrics_addr, "Metrics collection initialized");
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "switchyard_translations_total",
        Unit::Count,
        "Role translations grouped by outcome"
    );
    describe_histogram!(
        "switchyard_translation_duration_seconds",
        Unit::Seconds,
        "Time spent translating one role"
    );
    describe_counter!(
        "switchyard_snapshot_updates_total",
        Unit::Count,
        "Snapshots published to the xDS cache per node group"
    );
    describe_counter!(
        "switchyard_status_changes_total",
        Unit::Count,
        "Config object status transitions grouped by state"
    );
    describe_counter!("xds_grpc_calls_total", Unit::Count, "gRPC calls grouped by method");
    describe_gauge!("xds_active_streams", Unit::Count, "Open xDS discovery streams");
    describe_counter!(
        "xds_responses_total",
        Unit::Count,
        "Discovery responses sent grouped by type URL"
    );
}

/// Record one role translation and how many objects it rejected.
pub fn record_translation(role: &str, rejected: usize, duration_seconds: f64) {
    let outcome = if rejected == 0 { "clean" } else { "with_errors" };
    counter!("switchyard_translations_total", "role" => role.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("switchyard_translation_duration_seconds").record(duration_seconds);
}

pub fn record_snapshot_update(group: &str) {
    counter!("switchyard_snapshot_updates_total", "group" => group.to_string()).increment(1);
}

pub fn record_status_change(accepted: bool) {
    let state = if accepted { "accepted" } else { "rejected" };
    counter!("switchyard_status_changes_total", "state" => state).increment(1);
}

pub fn record_stream_opened() {
    gauge!("xds_active_streams").increment(1.0);
}

pub fn record_stream_closed() {
    gauge!("xds_active_streams").decrement(1.0);
}

pub fn record_xds_response(type_url: &str) {
    counter!("xds_responses_total", "type_url" => type_url.to_string()).increment(1);
}

/// Tower layer counting every gRPC call by method.
#[derive(Clone, Default)]
pub struct GrpcMetricsLayer;

impl GrpcMetricsLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetricsService { inner }
    }
}

#[derive(Clone)]
pub struct GrpcMetricsService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let (_, method) = parse_grpc_path(request.uri().path());
        counter!("xds_grpc_calls_total", "method" => method).increment(1);

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    #[test]
    fn disabled_exporter_is_a_no_op() {
        let config = ObservabilityConfig { metrics_port: 0, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
        record_status_change(true);
        record_translation("ingress", 0, 0.01);
    }

    #[tokio::test]
    async fn metrics_layer_calls_through() {
        let inner = service_fn(|req: Request<&'static str>| async move {
            Ok::<_, Infallible>(Response::new(req.into_body()))
        });
        let service = GrpcMetricsLayer::new().layer(inner);

        let request = Request::builder()
            .uri("/envoy.service.listener.v3.ListenerDiscoveryService/StreamListeners")
            .body("payload")
            .expect("request");
        let response = service.oneshot(request).await.expect("call");
        assert_eq!(*response.body(), "payload");
    }
}
