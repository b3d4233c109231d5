//! gRPC discovery service implementations.
//!
//! Aggregated and per-type services share the same cache and stream loop;
//! they differ only in the resource type assumed for untyped requests.

use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};
use uuid::Uuid;

use super::cache::{node_group, SnapshotCache};
use super::stream::run_stream_loop;
use super::ResourceType;
use crate::observability::metrics;

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
type DeltaResponseStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

/// Every discovery service, backed by one [`SnapshotCache`].
#[derive(Clone)]
pub struct XdsServices {
    cache: Arc<SnapshotCache>,
    stop: CancellationToken,
}

impl XdsServices {
    pub fn new(cache: Arc<SnapshotCache>, stop: CancellationToken) -> Self {
        Self { cache, stop }
    }

    fn stream(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
        default_type: Option<ResourceType>,
        label: &'static str,
    ) -> Result<Response<ResponseStream>, Status> {
        info!(stream = label, "New discovery stream established");
        let responses = run_stream_loop(
            Arc::clone(&self.cache),
            request.into_inner(),
            default_type,
            label,
            self.stop.child_token(),
        );
        Ok(Response::new(Box::pin(responses) as ResponseStream))
    }

    /// Answer a unary fetch from the current snapshot of the caller's group.
    fn fetch(
        &self,
        request: Request<DiscoveryRequest>,
        resource_type: ResourceType,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let request = request.into_inner();
        let group = node_group(request.node.as_ref());
        let snapshot = self
            .cache
            .snapshot(&group)
            .ok_or_else(|| Status::unavailable(format!("no snapshot for group {}", group)))?;

        debug!(group = %group, type_url = resource_type.type_url(), "Answering fetch");
        metrics::record_xds_response(resource_type.type_url());
        Ok(Response::new(DiscoveryResponse {
            version_info: snapshot.version.clone(),
            resources: snapshot.resources(resource_type, &request.resource_names),
            type_url: resource_type.type_url().to_string(),
            nonce: Uuid::new_v4().to_string(),
            ..Default::default()
        }))
    }
}

fn delta_unsupported() -> Status {
    Status::unimplemented("incremental xDS is not supported; use state-of-the-world")
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for XdsServices {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        self.stream(request, None, "ADS")
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(delta_unsupported())
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for XdsServices {
    type StreamClustersStream = ResponseStream;
    type DeltaClustersStream = DeltaResponseStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        self.stream(request, Some(ResourceType::Cluster), "CDS")
    }

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaClustersStream>, Status> {
        Err(delta_unsupported())
    }

    async fn fetch_clusters(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, ResourceType::Cluster)
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryService for XdsServices {
    type StreamEndpointsStream = ResponseStream;
    type DeltaEndpointsStream = DeltaResponseStream;

    async fn stream_endpoints(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamEndpointsStream>, Status> {
        self.stream(request, Some(ResourceType::Endpoint), "EDS")
    }

    async fn delta_endpoints(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaEndpointsStream>, Status> {
        Err(delta_unsupported())
    }

    async fn fetch_endpoints(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, ResourceType::Endpoint)
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for XdsServices {
    type StreamRoutesStream = ResponseStream;
    type DeltaRoutesStream = DeltaResponseStream;

    async fn stream_routes(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRoutesStream>, Status> {
        self.stream(request, Some(ResourceType::Route), "RDS")
    }

    async fn delta_routes(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(delta_unsupported())
    }

    async fn fetch_routes(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, ResourceType::Route)
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for XdsServices {
    type StreamListenersStream = ResponseStream;
    type DeltaListenersStream = DeltaResponseStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        self.stream(request, Some(ResourceType::Listener), "LDS")
    }

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaListenersStream>, Status> {
        Err(delta_unsupported())
    }

    async fn fetch_listeners(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, ResourceType::Listener)
    }
}
