use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::google::protobuf::Any;

use super::proto::any_from_message;
use super::version::snapshot_version;
use super::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL};

/// The four xDS resource types served per snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Route,
    Listener,
}

impl ResourceType {
    pub fn from_type_url(type_url: &str) -> Option<Self> {
        match type_url {
            CLUSTER_TYPE_URL => Some(Self::Cluster),
            ENDPOINT_TYPE_URL => Some(Self::Endpoint),
            ROUTE_TYPE_URL => Some(Self::Route),
            LISTENER_TYPE_URL => Some(Self::Listener),
            _ => None,
        }
    }

    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Cluster => CLUSTER_TYPE_URL,
            Self::Endpoint => ENDPOINT_TYPE_URL,
            Self::Route => ROUTE_TYPE_URL,
            Self::Listener => LISTENER_TYPE_URL,
        }
    }
}

/// A complete, versioned set of Envoy resources for one node group.
///
/// The version is derived from the resource contents, so two snapshots built
/// from equal resources always carry the same version.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: String,
    pub endpoints: Vec<ClusterLoadAssignment>,
    pub clusters: Vec<Cluster>,
    pub routes: Vec<RouteConfiguration>,
    pub listeners: Vec<Listener>,
}

impl Snapshot {
    pub fn new(
        endpoints: Vec<ClusterLoadAssignment>,
        clusters: Vec<Cluster>,
        routes: Vec<RouteConfiguration>,
        listeners: Vec<Listener>,
    ) -> Self {
        let version = snapshot_version(&endpoints, &clusters, &routes, &listeners);
        Self { version, endpoints, clusters, routes, listeners }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
            && self.clusters.is_empty()
            && self.routes.is_empty()
            && self.listeners.is_empty()
    }

    /// Encoded resources of one type. An empty `names` selects everything,
    /// otherwise only resources whose name is listed are returned.
    pub fn resources(&self, resource_type: ResourceType, names: &[String]) -> Vec<Any> {
        let wanted = |name: &str| names.is_empty() || names.iter().any(|n| n == name);
        let type_url = resource_type.type_url();
        match resource_type {
            ResourceType::Cluster => self
                .clusters
                .iter()
                .filter(|c| wanted(&c.name))
                .map(|c| any_from_message(type_url, c))
                .collect(),
            ResourceType::Endpoint => self
                .endpoints
                .iter()
                .filter(|e| wanted(&e.cluster_name))
                .map(|e| any_from_message(type_url, e))
                .collect(),
            ResourceType::Route => self
                .routes
                .iter()
                .filter(|r| wanted(&r.name))
                .map(|r| any_from_message(type_url, r))
                .collect(),
            ResourceType::Listener => self
                .listeners
                .iter()
                .filter(|l| wanted(&l.name))
                .map(|l| any_from_message(type_url, l))
                .collect(),
        }
    }
}
