//! xDS gRPC server startup.

use std::net::SocketAddr;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryServiceServer;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use super::{Snapshot, SnapshotCache, XdsServices};
use crate::errors::{Error, Result};
use crate::observability::{GrpcLoggingLayer, GrpcMetricsLayer};

/// Bind the xDS port and start serving.
///
/// Failing to bind is returned immediately. On success the shared cache is
/// returned together with the server task, which completes after `stop` is
/// cancelled and in-flight calls drain.
pub async fn run_xds(
    addr: SocketAddr,
    fallback: Snapshot,
    stop: CancellationToken,
) -> Result<(Arc<SnapshotCache>, JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        Error::transport(format!(
            "XDS server failed to bind to {}: {}. Please use a different port or stop the existing service.",
            addr, e
        ))
    })?;
    let local_addr = listener.local_addr()?;

    let cache = Arc::new(SnapshotCache::new(fallback));
    let services = XdsServices::new(Arc::clone(&cache), stop.clone());

    let server = Server::builder()
        .layer(GrpcLoggingLayer::new())
        .layer(GrpcMetricsLayer::new())
        .add_service(AggregatedDiscoveryServiceServer::new(services.clone()))
        .add_service(ClusterDiscoveryServiceServer::new(services.clone()))
        .add_service(EndpointDiscoveryServiceServer::new(services.clone()))
        .add_service(RouteDiscoveryServiceServer::new(services.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(services))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), stop.cancelled_owned());

    info!(address = %local_addr, "XDS server listening");
    let handle = tokio::spawn(async move {
        server.await.map_err(|e| Error::transport(format!("XDS server failed: {}", e)))?;
        info!("XDS server stopped");
        Ok(())
    });

    Ok((cache, handle))
}
