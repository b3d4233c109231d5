//! gRPC Logging Interceptor
//!
//! Tower middleware that logs every gRPC call made against the xDS server.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{Request, Response};
use tower::{Layer, Service};
use tracing::{debug, info_span, Instrument};

/// Tower layer that wraps each gRPC call in a span named after its method
/// and logs the call on entry and completion.
#[derive(Clone, Default)]
pub struct GrpcLoggingLayer;

impl GrpcLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for GrpcLoggingLayer {
    type Service = GrpcLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcLoggingService { inner }
    }
}

#[derive(Clone)]
pub struct GrpcLoggingService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcLoggingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let (service, method) = parse_grpc_path(request.uri().path());
        let span = info_span!("grpc.server", rpc.service = %service, rpc.method = %method);

        // The clone that was polled ready must serve this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                debug!("gRPC call started");
                let start = Instant::now();
                let result = inner.call(request).await;
                debug!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "gRPC call finished"
                );
                result
            }
            .instrument(span),
        )
    }
}

/// Split a gRPC path of the form `/package.Service/Method`.
pub(crate) fn parse_grpc_path(path: &str) -> (String, String) {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match parts.as_slice() {
        [service, method] => (service.to_string(), method.to_string()),
        [single] if !single.is_empty() => (single.to_string(), "unknown".to_string()),
        _ => ("unknown".to_string(), "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};
    use tracing_test::traced_test;

    #[test]
    fn parses_discovery_method_paths() {
        let (service, method) = parse_grpc_path(
            "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources",
        );
        assert_eq!(service, "envoy.service.discovery.v3.AggregatedDiscoveryService");
        assert_eq!(method, "StreamAggregatedResources");
    }

    #[test]
    fn malformed_paths_are_unknown() {
        assert_eq!(parse_grpc_path("/"), ("unknown".to_string(), "unknown".to_string()));
        assert_eq!(parse_grpc_path("/OnlyService").1, "unknown");
    }

    #[tokio::test]
    #[traced_test]
    async fn logs_the_called_method() {
        let inner = service_fn(|_req: Request<()>| async {
            Ok::<_, Infallible>(Response::new(()))
        });
        let service = GrpcLoggingLayer::new().layer(inner);

        let request = Request::builder()
            .uri("/envoy.service.cluster.v3.ClusterDiscoveryService/FetchClusters")
            .body(())
            .expect("request");
        service.oneshot(request).await.expect("call");

        assert!(logs_contain("FetchClusters"));
        assert!(logs_contain("gRPC call finished"));
    }
}
