use std::sync::Arc;

use envoy_types::pb::envoy::config::route::v3::{
    route, route_action::ClusterSpecifier, weighted_cluster::ClusterWeight, Route as EnvoyRoute,
    RouteAction, WeightedCluster,
};
use envoy_types::pb::google::protobuf::{Struct, UInt32Value};

use super::{Plugin, RoutePlugin, RoutePluginParams};
use crate::errors::{Error, Result};
use crate::model::{Destination, Route, RouteDestination, WeightedDestination};
use crate::xds::proto::{list_value, number_value, set_filter_metadata, string_value, struct_from_pairs, struct_value};

const NAME: &str = "route_initializer";

/// Route metadata key describing which functions a route invokes, per upstream.
pub const FUNCTION_ROUTER_METADATA_KEY: &str = "io.switchyard.function_router";

/// Initializes the route action (cluster or weighted clusters) and the
/// function routing metadata. Runs before every other route plugin.
pub struct RouteInitializer;

impl Plugin for RouteInitializer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn route_plugin(self: Arc<Self>) -> Option<Arc<dyn RoutePlugin>> {
        Some(self)
    }
}

impl RoutePlugin for RouteInitializer {
    fn process_route(
        &self,
        _params: &RoutePluginParams<'_>,
        route: &Route,
        out: &mut EnvoyRoute,
    ) -> Result<()> {
        let cluster_specifier = match &route.destination {
            RouteDestination::SingleDestination(dest) => {
                ClusterSpecifier::Cluster(dest.upstream_name().to_string())
            }
            RouteDestination::MultipleDestinations(weighted) => {
                ClusterSpecifier::WeightedClusters(weighted_clusters(weighted)?)
            }
        };

        #[allow(deprecated)]
        let action = RouteAction { cluster_specifier: Some(cluster_specifier), ..Default::default() };
        out.action = Some(route::Action::Route(action));

        if let Some(functions) = function_metadata(route) {
            set_filter_metadata(&mut out.metadata, FUNCTION_ROUTER_METADATA_KEY, functions);
        }
        Ok(())
    }
}

/// One weighted cluster per distinct upstream, in order of first appearance;
/// function destinations on the same upstream share its weight.
fn weighted_clusters(destinations: &[WeightedDestination]) -> Result<WeightedCluster> {
    if destinations.is_empty() {
        return Err(Error::plugin(NAME, "multiple_destinations must not be empty"));
    }
    let mut clusters: Vec<ClusterWeight> = Vec::new();
    for weighted in destinations {
        let name = weighted.destination.upstream_name();
        match clusters.iter_mut().find(|c| c.name == name) {
            Some(existing) => {
                if let Some(weight) = existing.weight.as_mut() {
                    weight.value = weight.value.saturating_add(weighted.weight);
                }
            }
            None => clusters.push(ClusterWeight {
                name: name.to_string(),
                weight: Some(UInt32Value { value: weighted.weight }),
                ..Default::default()
            }),
        }
    }
    let total: u64 = destinations.iter().map(|d| u64::from(d.weight)).sum();
    if total == 0 {
        return Err(Error::plugin(NAME, "destination weights must sum to more than zero"));
    }
    Ok(WeightedCluster { clusters, ..Default::default() })
}

/// `{upstream: {functions: [{name, weight}]}}` for every function destination.
fn function_metadata(route: &Route) -> Option<Struct> {
    let weighted: Vec<(&Destination, u32)> = match &route.destination {
        RouteDestination::SingleDestination(dest) => vec![(dest, 1)],
        RouteDestination::MultipleDestinations(dests) => {
            dests.iter().map(|d| (&d.destination, d.weight)).collect()
        }
    };

    let mut per_upstream: Vec<(&str, Vec<_>)> = Vec::new();
    for (dest, weight) in weighted {
        let Destination::Function(function) = dest else { continue };
        let entry = struct_value(struct_from_pairs([
            ("name", string_value(function.function_name.as_str())),
            ("weight", number_value(f64::from(weight))),
        ]));
        match per_upstream.iter_mut().find(|(name, _)| *name == function.upstream_name) {
            Some((_, functions)) => functions.push(entry),
            None => per_upstream.push((function.upstream_name.as_str(), vec![entry])),
        }
    }
    if per_upstream.is_empty() {
        return None;
    }

    Some(struct_from_pairs(per_upstream.into_iter().map(|(upstream, functions)| {
        (upstream, struct_value(struct_from_pairs([("functions", list_value(functions))])))
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        FunctionDestination, Matcher, RequestMatcher, UpstreamDestination, VirtualService,
    };

    fn route(destination: RouteDestination) -> Route {
        Route {
            matcher: Matcher::RequestMatcher(RequestMatcher::default()),
            destination,
            extensions: None,
        }
    }

    fn run(route: &Route) -> Result<EnvoyRoute> {
        let vs = VirtualService::default();
        let params = RoutePluginParams { upstreams: &[], virtual_service: &vs };
        let mut out = EnvoyRoute::default();
        RouteInitializer.process_route(&params, route, &mut out)?;
        Ok(out)
    }

    fn action(out: &EnvoyRoute) -> &RouteAction {
        match out.action.as_ref() {
            Some(route::Action::Route(action)) => action,
            other => panic!("expected route action, got {:?}", other),
        }
    }

    #[test]
    fn single_upstream_destination_targets_cluster() {
        let out = run(&route(RouteDestination::SingleDestination(Destination::Upstream(
            UpstreamDestination { name: "svc-a".into() },
        ))))
        .expect("route");

        assert_eq!(action(&out).cluster_specifier, Some(ClusterSpecifier::Cluster("svc-a".into())));
        assert!(out.metadata.is_none());
    }

    #[test]
    fn weighted_destinations_share_upstream_weight() {
        let function = |name: &str, weight| WeightedDestination {
            destination: Destination::Function(FunctionDestination {
                upstream_name: "lambda".into(),
                function_name: name.into(),
            }),
            weight,
        };
        let out = run(&route(RouteDestination::MultipleDestinations(vec![
            function("one", 2),
            WeightedDestination {
                destination: Destination::Upstream(UpstreamDestination { name: "svc-b".into() }),
                weight: 5,
            },
            function("two", 3),
        ])))
        .expect("route");

        match &action(&out).cluster_specifier {
            Some(ClusterSpecifier::WeightedClusters(weighted)) => {
                let pairs: Vec<_> = weighted
                    .clusters
                    .iter()
                    .map(|c| (c.name.as_str(), c.weight.as_ref().map(|w| w.value)))
                    .collect();
                assert_eq!(pairs, vec![("lambda", Some(5)), ("svc-b", Some(5))]);
            }
            other => panic!("expected weighted clusters, got {:?}", other),
        }
        let metadata = out.metadata.expect("function metadata");
        assert!(metadata.filter_metadata[FUNCTION_ROUTER_METADATA_KEY].fields.contains_key("lambda"));
    }

    #[test]
    fn zero_total_weight_is_rejected() {
        let err = run(&route(RouteDestination::MultipleDestinations(vec![WeightedDestination {
            destination: Destination::Upstream(UpstreamDestination { name: "svc".into() }),
            weight: 0,
        }])))
        .unwrap_err();

        assert!(err.to_string().contains("more than zero"));
    }
}
