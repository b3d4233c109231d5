//! Narrowing the config to what one listener can reach.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use super::Reports;
use crate::errors::Error;
use crate::model::{Config, Listener, ObjectRef, Role, Upstream, VirtualService};

/// The listener's extension map: its attributes merged in order, later
/// attributes winning, then the listener's own extensions on top.
pub(super) fn merged_extensions(
    cfg: &Config,
    role: &Role,
    listener: &Listener,
    reports: &mut Reports,
) -> BTreeMap<String, Value> {
    let mut merged = BTreeMap::new();
    for name in &listener.attributes {
        match cfg.attribute(name) {
            Some(attribute) => {
                merged.extend(attribute.extensions.iter().map(|(k, v)| (k.clone(), v.clone())))
            }
            None => reports.add(
                ObjectRef::role(&role.name),
                Error::validation(format!(
                    "attribute {} not found for listener {}",
                    name, listener.name
                )),
            ),
        }
    }
    merged.extend(listener.extensions.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// The virtual services a listener names, in listener order. Unknown names
/// are reported on the role.
pub(super) fn listener_virtual_services<'a>(
    cfg: &'a Config,
    role: &Role,
    listener: &Listener,
    reports: &mut Reports,
) -> Vec<&'a VirtualService> {
    let mut seen = HashSet::new();
    let mut virtual_services = Vec::with_capacity(listener.virtual_services.len());
    for name in &listener.virtual_services {
        if !seen.insert(name.as_str()) {
            continue;
        }
        match cfg.virtual_service(name) {
            Some(vs) => virtual_services.push(vs),
            None => reports.add(
                ObjectRef::role(&role.name),
                Error::validation(format!(
                    "virtual service {} not found for listener {}",
                    name, listener.name
                )),
            ),
        }
    }
    virtual_services
}

/// Upstreams referenced by any route of `virtual_services`, in config order.
pub(super) fn reachable_upstreams<'a>(
    cfg: &'a Config,
    virtual_services: &[&VirtualService],
) -> Vec<&'a Upstream> {
    let referenced: HashSet<&str> = virtual_services
        .iter()
        .flat_map(|vs| vs.routes.iter())
        .flat_map(|route| route.destinations())
        .map(|dest| dest.upstream_name())
        .collect();
    cfg.upstreams.iter().filter(|u| referenced.contains(u.name.as_str())).collect()
}
