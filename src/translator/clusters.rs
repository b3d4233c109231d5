//! Upstreams to clusters and cluster load assignments.

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, EdsClusterConfig,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint as EnvoyEndpoint, LbEndpoint, LocalityLbEndpoints,
};

use crate::errors::{Error, MultiError};
use crate::model::{Config, Endpoint, EndpointGroups, Files, SecretMap, Upstream};
use crate::plugins::{PluginRegistry, Registered, UpstreamPlugin, UpstreamPluginParams};
use crate::xds::proto::{ads_config_source, seconds, socket_address};

const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 5;

/// Upstream plugins paired with the inputs each one declared it needs.
pub(super) struct UpstreamPipeline {
    stages: Vec<(Registered<dyn UpstreamPlugin>, UpstreamPluginParams)>,
}

impl UpstreamPipeline {
    pub(super) fn new(
        registry: &PluginRegistry,
        cfg: &Config,
        secrets: &SecretMap,
        files: &Files,
    ) -> Self {
        let stages = registry
            .upstream_plugins()
            .iter()
            .map(|registered| {
                let params = match registered.plugin.dependencies(cfg) {
                    None => UpstreamPluginParams::default(),
                    Some(deps) => UpstreamPluginParams {
                        secrets: deps
                            .secret_refs
                            .iter()
                            .filter_map(|r| secrets.get(r).map(|s| (r.clone(), s.clone())))
                            .collect(),
                        files: deps
                            .file_refs
                            .iter()
                            .filter_map(|r| files.get(r).map(|f| (r.clone(), f.clone())))
                            .collect(),
                    },
                };
                (registered.clone(), params)
            })
            .collect();
        Self { stages }
    }

    /// Build and validate the cluster for `upstream`. Every plugin runs even
    /// after one fails so that all problems are reported together.
    pub(super) fn cluster(
        &self,
        upstream: &Upstream,
        endpoints: &EndpointGroups,
    ) -> Result<Cluster, MultiError> {
        let mut cluster = Cluster {
            name: upstream.name.clone(),
            connect_timeout: Some(seconds(
                upstream.connection_timeout_seconds.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            )),
            ..Default::default()
        };
        if endpoints.contains_key(&upstream.name) {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
            cluster.eds_cluster_config = Some(EdsClusterConfig {
                eds_config: Some(ads_config_source()),
                ..Default::default()
            });
        }

        let mut errors = MultiError::new();
        for (registered, params) in &self.stages {
            if let Err(e) = registered.capability.process_upstream(params, upstream, &mut cluster) {
                errors.push(e);
            }
        }
        if let Err(e) = validate_cluster(&cluster) {
            errors.push(e);
        }

        match errors.into_option() {
            None => Ok(cluster),
            Some(errors) => Err(errors),
        }
    }
}

/// Statically resolved clusters need at least one host; anything else is
/// rejected by Envoy at load time.
pub(super) fn validate_cluster(cluster: &Cluster) -> crate::Result<()> {
    let discovery_type = match cluster.cluster_discovery_type {
        None => DiscoveryType::Static,
        Some(ClusterDiscoveryType::Type(t)) => DiscoveryType::try_from(t).unwrap_or(DiscoveryType::Static),
        Some(ClusterDiscoveryType::ClusterType(_)) => return Ok(()),
    };
    if !matches!(
        discovery_type,
        DiscoveryType::Static | DiscoveryType::StrictDns | DiscoveryType::LogicalDns
    ) {
        return Ok(());
    }

    let hosts: usize = cluster
        .load_assignment
        .as_ref()
        .map(|la| la.endpoints.iter().map(|l| l.lb_endpoints.len()).sum())
        .unwrap_or(0);
    if hosts == 0 {
        return Err(Error::validation(format!(
            "cluster type {} specified but load_assignment was empty",
            discovery_type.as_str_name()
        )));
    }
    Ok(())
}

/// Load assignment for one discovered upstream, endpoints in discovery order.
pub(super) fn load_assignment(upstream: &str, endpoints: &[Endpoint]) -> ClusterLoadAssignment {
    let lb_endpoints = endpoints
        .iter()
        .map(|endpoint| LbEndpoint {
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(EnvoyEndpoint {
                address: Some(socket_address(&endpoint.address, endpoint.port)),
                ..Default::default()
            })),
            ..Default::default()
        })
        .collect();
    ClusterLoadAssignment {
        cluster_name: upstream.to_string(),
        endpoints: vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }],
        ..Default::default()
    }
}
