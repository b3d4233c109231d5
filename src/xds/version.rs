//! Content-derived snapshot versions.
//!
//! Protobuf map fields decode into hash maps, so the wire encoding of two
//! equal messages can differ in field order. The digest below encodes each
//! resource with its map fields removed and then feeds those maps in key
//! order, which makes the version a pure function of resource content.
//! `Struct` payloads packed in `Any` are unpacked and hashed the same way,
//! including HTTP filter configs carried inside a listener's connection
//! manager.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::Metadata;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::{filter, listener_filter, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    route, route_action::ClusterSpecifier, RouteConfiguration,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_filter, HttpConnectionManager,
};
use envoy_types::pb::google::protobuf::{value::Kind, Any, Struct, Value};
use prost::Message;
use sha2::{Digest, Sha256};

use super::HTTP_CONNECTION_MANAGER_TYPE_URL;

const STRUCT_TYPE_URL: &str = "type.googleapis.com/google.protobuf.Struct";

/// Version string for a snapshot holding exactly these resources.
pub fn snapshot_version(
    endpoints: &[ClusterLoadAssignment],
    clusters: &[Cluster],
    routes: &[RouteConfiguration],
    listeners: &[Listener],
) -> String {
    let mut digest = Canonical::default();

    digest.section("endpoints", endpoints.len());
    for assignment in endpoints {
        digest.endpoints(assignment);
    }
    digest.section("clusters", clusters.len());
    for cluster in clusters {
        digest.cluster(cluster);
    }
    digest.section("routes", routes.len());
    for route_config in routes {
        digest.route_configuration(route_config);
    }
    digest.section("listeners", listeners.len());
    for listener in listeners {
        digest.listener(listener);
    }

    digest.finish().to_string()
}

#[derive(Default)]
struct Canonical {
    hasher: Sha256,
}

impl Canonical {
    fn finish(self) -> u64 {
        let hash = self.hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Length-prefixed so adjacent fields never run together.
    fn bytes(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }

    fn str(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    fn section(&mut self, name: &str, len: usize) {
        self.str(name);
        self.hasher.update((len as u64).to_be_bytes());
    }

    fn message<M: Message>(&mut self, msg: &M) {
        self.bytes(&msg.encode_to_vec());
    }

    fn endpoints(&mut self, assignment: &ClusterLoadAssignment) {
        let mut stripped = assignment.clone();
        let mut metadata = Vec::new();
        for locality in &mut stripped.endpoints {
            for lb_endpoint in &mut locality.lb_endpoints {
                metadata.push(lb_endpoint.metadata.take());
            }
        }
        self.message(&stripped);
        for m in &metadata {
            self.metadata(m);
        }
    }

    fn cluster(&mut self, cluster: &Cluster) {
        let mut stripped = cluster.clone();
        let metadata = stripped.metadata.take();
        let options = std::mem::take(&mut stripped.typed_extension_protocol_options);
        self.message(&stripped);
        self.metadata(&metadata);
        self.any_map(&options);
    }

    fn route_configuration(&mut self, route_config: &RouteConfiguration) {
        let mut stripped = route_config.clone();
        let mut metadata = Vec::new();
        let mut per_filter = Vec::new();
        for vhost in &mut stripped.virtual_hosts {
            per_filter.push(std::mem::take(&mut vhost.typed_per_filter_config));
            for r in &mut vhost.routes {
                metadata.push(r.metadata.take());
                per_filter.push(std::mem::take(&mut r.typed_per_filter_config));
                if let Some(route::Action::Route(action)) = r.action.as_mut() {
                    if let Some(ClusterSpecifier::WeightedClusters(weighted)) =
                        action.cluster_specifier.as_mut()
                    {
                        for cluster in &mut weighted.clusters {
                            per_filter.push(std::mem::take(&mut cluster.typed_per_filter_config));
                        }
                    }
                }
            }
        }
        self.message(&stripped);
        for m in &metadata {
            self.metadata(m);
        }
        for configs in &per_filter {
            self.any_map(configs);
        }
    }

    fn listener(&mut self, listener: &Listener) {
        let mut stripped = listener.clone();
        let mut metadata = vec![stripped.metadata.take()];
        let mut typed = Vec::new();
        for entry in &mut stripped.listener_filters {
            if let Some(listener_filter::ConfigType::TypedConfig(any)) = entry.config_type.take() {
                typed.push(any);
            }
        }
        for chain in &mut stripped.filter_chains {
            metadata.push(chain.metadata.take());
            for network_filter in &mut chain.filters {
                let Some(filter::ConfigType::TypedConfig(any)) = network_filter.config_type.as_mut() else {
                    continue;
                };
                if any.type_url != HTTP_CONNECTION_MANAGER_TYPE_URL {
                    continue;
                }
                let Ok(mut hcm) = HttpConnectionManager::decode(any.value.as_slice()) else {
                    continue;
                };
                for http in &mut hcm.http_filters {
                    if let Some(http_filter::ConfigType::TypedConfig(config)) = http.config_type.take() {
                        typed.push(config);
                    }
                }
                any.value = hcm.encode_to_vec();
            }
        }
        self.message(&stripped);
        for m in &metadata {
            self.metadata(m);
        }
        self.section("typed_configs", typed.len());
        for any in &typed {
            self.any(any);
        }
    }

    fn metadata(&mut self, metadata: &Option<Metadata>) {
        let Some(metadata) = metadata else {
            self.str("none");
            return;
        };
        self.section("filter_metadata", metadata.filter_metadata.len());
        for (key, value) in sorted(&metadata.filter_metadata) {
            self.str(key);
            self.structure(value);
        }
        self.any_map(&metadata.typed_filter_metadata);
    }

    fn any_map(&mut self, map: &HashMap<String, Any>) {
        self.section("any", map.len());
        for (key, any) in sorted(map) {
            self.str(key);
            self.any(any);
        }
    }

    fn any(&mut self, any: &Any) {
        self.str(&any.type_url);
        if any.type_url == STRUCT_TYPE_URL {
            if let Ok(decoded) = Struct::decode(any.value.as_slice()) {
                self.structure(&decoded);
                return;
            }
        }
        self.bytes(&any.value);
    }

    fn structure(&mut self, s: &Struct) {
        self.section("struct", s.fields.len());
        for (key, value) in sorted(&s.fields) {
            self.str(key);
            self.value(value);
        }
    }

    fn value(&mut self, value: &Value) {
        match &value.kind {
            None => self.str("unset"),
            Some(Kind::NullValue(_)) => self.str("null"),
            Some(Kind::NumberValue(n)) => {
                self.str("number");
                self.hasher.update(n.to_bits().to_be_bytes());
            }
            Some(Kind::StringValue(s)) => {
                self.str("string");
                self.str(s);
            }
            Some(Kind::BoolValue(b)) => {
                self.str("bool");
                self.hasher.update([u8::from(*b)]);
            }
            Some(Kind::StructValue(s)) => self.structure(s),
            Some(Kind::ListValue(list)) => {
                self.section("list", list.values.len());
                for item in &list.values {
                    self.value(item);
                }
            }
        }
    }
}

fn sorted<'a, V>(map: impl IntoIterator<Item = (&'a String, &'a V)>) -> Vec<(&'a String, &'a V)> {
    let mut entries: Vec<_> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::proto::{
        any_from_message, http_connection_manager_filter, number_value, set_filter_metadata,
        string_value, struct_from_pairs,
    };
    use envoy_types::pb::envoy::config::listener::v3::FilterChain;
    use envoy_types::pb::envoy::config::route::v3::{Route, VirtualHost};
    use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
        http_connection_manager::RouteSpecifier, HttpFilter,
    };

    fn metadata_struct(keys: &[&str]) -> Struct {
        struct_from_pairs(keys.iter().map(|k| (k.to_string(), string_value(*k))))
    }

    fn cluster_with_metadata(keys: &[&str]) -> Cluster {
        let mut cluster = Cluster { name: "svc-a".into(), ..Default::default() };
        set_filter_metadata(&mut cluster.metadata, "io.switchyard", metadata_struct(keys));
        cluster
    }

    #[test]
    fn map_insertion_order_does_not_change_the_version() {
        let forward = cluster_with_metadata(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let backward = cluster_with_metadata(&["h", "g", "f", "e", "d", "c", "b", "a"]);

        assert_eq!(
            snapshot_version(&[], &[forward], &[], &[]),
            snapshot_version(&[], &[backward], &[], &[])
        );
    }

    #[test]
    fn metadata_values_change_the_version() {
        let mut one = Cluster { name: "svc-a".into(), ..Default::default() };
        set_filter_metadata(&mut one.metadata, "k", struct_from_pairs([("n", number_value(1.0))]));
        let mut two = Cluster { name: "svc-a".into(), ..Default::default() };
        set_filter_metadata(&mut two.metadata, "k", struct_from_pairs([("n", number_value(2.0))]));

        assert_ne!(
            snapshot_version(&[], &[one], &[], &[]),
            snapshot_version(&[], &[two], &[], &[])
        );
    }

    #[test]
    fn resources_are_not_interchangeable_between_types() {
        let cluster = Cluster { name: "x".into(), ..Default::default() };
        let listener = Listener { name: "x".into(), ..Default::default() };
        assert_ne!(
            snapshot_version(&[], &[cluster], &[], &[]),
            snapshot_version(&[], &[], &[], &[listener])
        );
    }

    #[test]
    fn route_metadata_is_canonicalized() {
        let route_config = |keys: &[&str]| {
            let mut r = Route { name: "r".into(), ..Default::default() };
            set_filter_metadata(&mut r.metadata, "io.switchyard", metadata_struct(keys));
            RouteConfiguration {
                name: "http-routes".into(),
                virtual_hosts: vec![VirtualHost {
                    name: "vs-a".into(),
                    domains: vec!["a.com".into()],
                    routes: vec![r],
                    ..Default::default()
                }],
                ..Default::default()
            }
        };

        assert_eq!(
            snapshot_version(&[], &[], &[route_config(&["x", "y", "z", "w"])], &[]),
            snapshot_version(&[], &[], &[route_config(&["w", "z", "y", "x"])], &[])
        );
    }

    fn struct_any(keys: &[&str]) -> Any {
        any_from_message(STRUCT_TYPE_URL, &metadata_struct(keys))
    }

    #[test]
    fn struct_filter_configs_are_canonicalized() {
        let route_config = |keys: &[&str]| RouteConfiguration {
            name: "http-routes".into(),
            virtual_hosts: vec![VirtualHost {
                name: "vs-a".into(),
                domains: vec!["a.com".into()],
                routes: vec![Route {
                    name: "r".into(),
                    typed_per_filter_config: HashMap::from([("io.switchyard.auth".to_string(), struct_any(keys))]),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let listener = |keys: &[&str]| Listener {
            name: "http".into(),
            filter_chains: vec![FilterChain {
                filters: vec![http_connection_manager_filter(
                    "http",
                    RouteSpecifier::Rds(Default::default()),
                    vec![HttpFilter {
                        name: "io.switchyard.auth".into(),
                        config_type: Some(http_filter::ConfigType::TypedConfig(struct_any(keys))),
                        ..Default::default()
                    }],
                )],
                ..Default::default()
            }],
            ..Default::default()
        };
        let forward = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let backward = ["h", "g", "f", "e", "d", "c", "b", "a"];

        assert_eq!(
            snapshot_version(&[], &[], &[route_config(&forward)], &[listener(&forward)]),
            snapshot_version(&[], &[], &[route_config(&backward)], &[listener(&backward)])
        );
        assert_ne!(
            snapshot_version(&[], &[], &[], &[listener(&forward)]),
            snapshot_version(&[], &[], &[], &[listener(&forward[..7])])
        );
    }
}
