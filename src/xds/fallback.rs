use envoy_types::pb::envoy::config::listener::v3::{FilterChain, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    route, route_match::PathSpecifier, DirectResponseAction, Route, RouteConfiguration,
    RouteMatch, VirtualHost,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::RouteSpecifier;

use super::proto::{http_connection_manager_filter, inline_string, socket_address};
use super::{Snapshot, MISCONFIGURED_GROUP};

const FALLBACK_BODY: &str = "Envoy is misconfigured: its node id must have the form \
    <role>~<instance>, where <role> names a role defined in the control plane configuration. \
    Set it with --service-node or node.id in the bootstrap config.";

/// Snapshot served to proxies whose node id cannot be parsed: a single
/// listener on `port` that answers every request with HTTP 500 and an
/// explanation of the expected node id.
pub fn fallback_snapshot(port: u32) -> Snapshot {
    let route_config = RouteConfiguration {
        name: format!("{}-routes", MISCONFIGURED_GROUP),
        virtual_hosts: vec![VirtualHost {
            name: MISCONFIGURED_GROUP.to_string(),
            domains: vec!["*".to_string()],
            routes: vec![Route {
                r#match: Some(RouteMatch {
                    path_specifier: Some(PathSpecifier::Prefix("/".to_string())),
                    ..Default::default()
                }),
                action: Some(route::Action::DirectResponse(DirectResponseAction {
                    status: 500,
                    body: Some(inline_string(FALLBACK_BODY)),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };

    let listener = Listener {
        name: MISCONFIGURED_GROUP.to_string(),
        address: Some(socket_address("0.0.0.0", port)),
        filter_chains: vec![FilterChain {
            filters: vec![http_connection_manager_filter(
                MISCONFIGURED_GROUP,
                RouteSpecifier::RouteConfig(route_config),
                Vec::new(),
            )],
            ..Default::default()
        }],
        ..Default::default()
    };

    Snapshot::new(Vec::new(), Vec::new(), Vec::new(), vec![listener])
}
