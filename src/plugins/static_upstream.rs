use std::net::IpAddr;
use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfigType;
use envoy_types::pb::envoy::config::core::v3::TransportSocket;
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, UpstreamTlsContext,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Plugin, UpstreamPlugin, UpstreamPluginParams};
use crate::errors::{Error, Result};
use crate::model::Upstream;
use crate::xds::proto::{any_from_message, socket_address};

const NAME: &str = "static_upstream";

/// Upstream type discriminator handled by this plugin.
pub const STATIC_UPSTREAM_TYPE: &str = "static";

const UPSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticUpstreamSpec {
    #[serde(default)]
    pub hosts: Vec<StaticHost>,
    /// Originate TLS to every host.
    #[serde(default)]
    pub tls: bool,
    /// SNI server name; defaults to the first hostname.
    #[serde(default)]
    pub sni: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticHost {
    pub addr: String,
    pub port: u32,
}

/// Builds clusters for `type: static` upstreams from a fixed host list.
pub struct StaticUpstreamPlugin;

impl Plugin for StaticUpstreamPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn upstream_plugin(self: Arc<Self>) -> Option<Arc<dyn UpstreamPlugin>> {
        Some(self)
    }
}

impl UpstreamPlugin for StaticUpstreamPlugin {
    fn process_upstream(
        &self,
        _params: &UpstreamPluginParams,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<()> {
        if upstream.upstream_type != STATIC_UPSTREAM_TYPE {
            return Ok(());
        }
        let spec: StaticUpstreamSpec = serde_json::from_value(upstream.spec.clone())
            .map_err(|e| Error::plugin(NAME, format!("parsing upstream spec: {}", e)))?;

        let mut first_hostname: Option<&str> = None;
        let mut lb_endpoints = Vec::with_capacity(spec.hosts.len());
        for host in &spec.hosts {
            if host.addr.is_empty() {
                return Err(Error::plugin(NAME, "host address must not be empty"));
            }
            if host.addr.parse::<IpAddr>().is_err() && first_hostname.is_none() {
                first_hostname = Some(host.addr.as_str());
            }
            lb_endpoints.push(LbEndpoint {
                host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                    address: Some(socket_address(&host.addr, host.port)),
                    ..Default::default()
                })),
                ..Default::default()
            });
        }

        let discovery_type = match first_hostname {
            None => DiscoveryType::Static,
            Some(_) if lb_endpoints.len() == 1 => DiscoveryType::LogicalDns,
            Some(_) => DiscoveryType::StrictDns,
        };
        out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(discovery_type as i32));
        out.load_assignment = Some(ClusterLoadAssignment {
            cluster_name: out.name.clone(),
            endpoints: vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }],
            ..Default::default()
        });

        if spec.tls {
            let sni = spec.sni.clone().or_else(|| first_hostname.map(str::to_string));
            if sni.is_none() {
                warn!(
                    upstream = %upstream.name,
                    "TLS enabled without an SNI name; upstream certificate verification may fail"
                );
            }
            let tls = UpstreamTlsContext {
                common_tls_context: Some(CommonTlsContext::default()),
                sni: sni.unwrap_or_default(),
                ..Default::default()
            };
            out.transport_socket = Some(TransportSocket {
                name: "envoy.transport_sockets.tls".to_string(),
                config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
                    UPSTREAM_TLS_TYPE_URL,
                    &tls,
                ))),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process(spec: serde_json::Value) -> Result<Cluster> {
        let upstream = Upstream {
            name: "svc-a".into(),
            upstream_type: STATIC_UPSTREAM_TYPE.into(),
            spec,
            ..Default::default()
        };
        let mut out = Cluster { name: "svc-a".into(), ..Default::default() };
        StaticUpstreamPlugin.process_upstream(&UpstreamPluginParams::default(), &upstream, &mut out)?;
        Ok(out)
    }

    fn discovery_type(cluster: &Cluster) -> Option<DiscoveryType> {
        match cluster.cluster_discovery_type {
            Some(ClusterDiscoveryType::Type(t)) => DiscoveryType::try_from(t).ok(),
            _ => None,
        }
    }

    #[test]
    fn ip_hosts_produce_static_cluster() {
        let cluster = process(json!({"hosts": [{"addr": "10.0.0.1", "port": 80}]})).expect("cluster");

        assert_eq!(discovery_type(&cluster), Some(DiscoveryType::Static));
        let endpoints = &cluster.load_assignment.expect("load assignment").endpoints[0].lb_endpoints;
        assert_eq!(endpoints.len(), 1);
        assert!(cluster.transport_socket.is_none());
    }

    #[test]
    fn hostnames_use_dns_discovery() {
        let single = process(json!({"hosts": [{"addr": "api.example.com", "port": 443}], "tls": true}))
            .expect("cluster");
        assert_eq!(discovery_type(&single), Some(DiscoveryType::LogicalDns));
        assert!(single.transport_socket.is_some());

        let many = process(json!({"hosts": [
            {"addr": "a.example.com", "port": 80},
            {"addr": "10.0.0.2", "port": 80}
        ]}))
        .expect("cluster");
        assert_eq!(discovery_type(&many), Some(DiscoveryType::StrictDns));
    }

    #[test]
    fn other_upstream_types_are_ignored() {
        let upstream = Upstream { name: "k8s".into(), upstream_type: "kubernetes".into(), ..Default::default() };
        let mut out = Cluster::default();
        StaticUpstreamPlugin
            .process_upstream(&UpstreamPluginParams::default(), &upstream, &mut out)
            .expect("ignored");
        assert!(out.cluster_discovery_type.is_none());
    }

    #[test]
    fn malformed_spec_is_a_plugin_error() {
        let err = process(json!({"hosts": "nope"})).unwrap_err();
        assert!(matches!(err, Error::Plugin { plugin: "static_upstream", .. }));
    }
}
