//! Virtual services to virtual hosts.

use std::collections::{BTreeMap, HashSet};

use envoy_types::pb::envoy::config::route::v3::{
    virtual_host::TlsRequirementType, Route as EnvoyRoute, RouteConfiguration, VirtualHost,
};
use tracing::warn;

use super::Reports;
use crate::errors::{Error, MultiError};
use crate::model::{Destination, Listener, ObjectRef, Route, Upstream, VirtualService};
use crate::plugins::{PluginRegistry, RoutePluginParams};

pub(super) fn route_config_name(listener: &Listener) -> String {
    format!("{}-routes", listener.name)
}

/// Names of virtual services that share a domain with another virtual
/// service on the same listener. Each of them gets an error naming the
/// whole colliding set.
pub(super) fn domain_conflicts(
    virtual_services: &[&VirtualService],
    reports: &mut Reports,
) -> HashSet<String> {
    let mut owners: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for vs in virtual_services {
        for domain in vs.effective_domains() {
            let names = owners.entry(domain).or_default();
            if !names.contains(&vs.name.as_str()) {
                names.push(&vs.name);
            }
        }
    }

    let mut conflicting = HashSet::new();
    for (domain, names) in owners.iter().filter(|(_, names)| names.len() > 1) {
        for name in names {
            reports.add(
                ObjectRef::virtual_service(*name),
                Error::validation(format!(
                    "domain {} is shared by the following virtual services: [{}]",
                    domain,
                    names.join(", ")
                )),
            );
            conflicting.insert(name.to_string());
        }
    }
    conflicting
}

/// Every destination must name an upstream whose cluster was built. A
/// function the upstream does not declare only warns; the function plugin
/// may still resolve it at runtime.
fn check_destinations(route: &Route, upstreams: &[Upstream]) -> Result<(), MultiError> {
    let mut errors = MultiError::new();
    for destination in route.destinations() {
        let name = destination.upstream_name();
        match upstreams.iter().find(|u| u.name == name) {
            None => errors.push(Error::validation(format!(
                "upstream {} was not found or had errors for upstream destination",
                name
            ))),
            Some(upstream) => {
                if let Destination::Function(function) = destination {
                    if !upstream.functions.iter().any(|f| f.name == function.function_name) {
                        warn!(
                            upstream = %name,
                            function = %function.function_name,
                            "Route targets a function its upstream does not declare"
                        );
                    }
                }
            }
        }
    }
    match errors.into_option() {
        None => Ok(()),
        Some(errors) => Err(errors),
    }
}

/// One virtual host for `vs`. Routes with unresolvable destinations or a
/// failing route plugin are left out and reported on the virtual service.
pub(super) fn virtual_host(
    registry: &PluginRegistry,
    vs: &VirtualService,
    upstreams: &[Upstream],
    require_tls: bool,
    reports: &mut Reports,
) -> VirtualHost {
    let object = ObjectRef::virtual_service(&vs.name);
    let params = RoutePluginParams { upstreams, virtual_service: vs };

    let mut routes = Vec::with_capacity(vs.routes.len());
    for (index, route) in vs.routes.iter().enumerate() {
        if let Err(errors) = check_destinations(route, upstreams) {
            reports.extend(&object, errors);
            continue;
        }

        let mut out = EnvoyRoute::default();
        let mut failed = false;
        for registered in registry.route_plugins() {
            if let Err(e) = registered.capability.process_route(&params, route, &mut out) {
                reports.add(object.clone(), Error::validation(format!("route {}: {}", index, e)));
                failed = true;
            }
        }
        if !failed {
            routes.push(out);
        }
    }

    VirtualHost {
        name: vs.name.clone(),
        domains: vs.effective_domains(),
        routes,
        require_tls: if require_tls { TlsRequirementType::All as i32 } else { TlsRequirementType::None as i32 },
        ..Default::default()
    }
}

pub(super) fn route_configuration(listener: &Listener, virtual_hosts: Vec<VirtualHost>) -> RouteConfiguration {
    RouteConfiguration {
        name: route_config_name(listener),
        virtual_hosts,
        ..Default::default()
    }
}
