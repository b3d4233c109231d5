//! # Translator
//!
//! Turns one [`Role`] and the current [`Cache`] into an xDS [`Snapshot`] and
//! a [`ConfigObjectReport`] for every object it considered.
//!
//! Translation never fails as a whole. A broken upstream, virtual service or
//! listener is reported on the object responsible and left out of (or
//! reduced in) the snapshot; everything else is still served.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener as EnvoyListener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use tracing::{debug, info_span, warn};

use crate::errors::{Error, MultiError};
use crate::model::{Config, Listener, ObjectRef, Role, Upstream, VirtualService};
use crate::plugins::{ListenerPluginParams, PluginRegistry};
use crate::reporter::ConfigObjectReport;
use crate::snapshot::Cache;
use crate::xds::{Snapshot, MISCONFIGURED_GROUP};

mod clusters;
mod listeners;
mod routes;
mod trim;

pub use listeners::{SSL_CERT_CHAIN_KEY, SSL_PRIVATE_KEY_KEY, SSL_ROOT_CA_KEY};

use clusters::{load_assignment, UpstreamPipeline};

/// Per-object error accumulator for one translation pass.
///
/// Seeded with the role and every upstream and virtual service in the
/// config so that objects without problems are reported as accepted.
#[derive(Debug)]
pub(crate) struct Reports {
    errors: BTreeMap<ObjectRef, MultiError>,
}

impl Reports {
    pub(crate) fn new(cfg: &Config, role: &Role) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(ObjectRef::role(&role.name), MultiError::new());
        for upstream in &cfg.upstreams {
            errors.insert(ObjectRef::upstream(&upstream.name), MultiError::new());
        }
        for vs in &cfg.virtual_services {
            errors.insert(ObjectRef::virtual_service(&vs.name), MultiError::new());
        }
        Self { errors }
    }

    /// Append `err` to the object's errors unless an identical message is
    /// already there; shared upstreams and virtual services are visited once
    /// per listener.
    pub(crate) fn add(&mut self, object: ObjectRef, err: Error) {
        let slot = self.errors.entry(object).or_default();
        let message = err.to_string();
        if slot.errors().iter().any(|existing| existing.to_string() == message) {
            return;
        }
        slot.push(err);
    }

    pub(crate) fn extend(&mut self, object: &ObjectRef, errors: MultiError) {
        for err in errors.into_errors() {
            self.add(object.clone(), err);
        }
    }

    pub(crate) fn rejected(&self) -> usize {
        self.errors.values().filter(|errors| !errors.is_empty()).count()
    }

    pub(crate) fn into_reports(self) -> Vec<ConfigObjectReport> {
        self.errors
            .into_iter()
            .map(|(object, errors)| ConfigObjectReport::new(object, errors))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn error_text(&self, object: &ObjectRef) -> String {
        self.errors
            .get(object)
            .filter(|errors| !errors.is_empty())
            .map(|errors| errors.to_string())
            .unwrap_or_default()
    }
}

/// Resources accumulated across a role's listeners before deduplication.
#[derive(Default)]
struct Resources {
    endpoints: Vec<ClusterLoadAssignment>,
    clusters: Vec<Cluster>,
    routes: Vec<RouteConfiguration>,
    listeners: Vec<EnvoyListener>,
}

impl Resources {
    /// Clusters by name with the first occurrence winning, load assignments
    /// by equality, and no empty route configurations or listeners.
    ///
    /// Clusters and load assignments are then ordered by name so the version
    /// does not depend on the order upstreams appear in the config.
    fn into_snapshot(self) -> Snapshot {
        let mut names = HashSet::new();
        let mut clusters: Vec<Cluster> =
            self.clusters.into_iter().filter(|c| names.insert(c.name.clone())).collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));

        let mut endpoints: Vec<ClusterLoadAssignment> = Vec::with_capacity(self.endpoints.len());
        for cla in self.endpoints {
            if !endpoints.contains(&cla) {
                endpoints.push(cla);
            }
        }
        endpoints.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));

        let routes = self.routes.into_iter().filter(|r| !r.virtual_hosts.is_empty()).collect();
        let listeners = self.listeners.into_iter().filter(|l| !l.filter_chains.is_empty()).collect();

        Snapshot::new(endpoints, clusters, routes, listeners)
    }
}

/// Clusters already built in this pass; `None` marks an upstream whose
/// cluster was rejected.
type BuiltClusters = HashMap<String, Option<Cluster>>;

/// Everything one translation pass shares between listeners.
struct Pass<'a> {
    cfg: &'a Config,
    role: &'a Role,
    inputs: &'a Cache,
    pipeline: UpstreamPipeline,
    built: BuiltClusters,
    resources: Resources,
    reports: Reports,
}

pub struct Translator {
    registry: Arc<PluginRegistry>,
}

impl Translator {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// Translate `role` against `inputs`. Pure with respect to its inputs:
    /// the same role and cache always produce the same snapshot version and
    /// reports.
    pub fn translate(&self, role: &Role, inputs: &Cache) -> (Snapshot, Vec<ConfigObjectReport>) {
        let span = info_span!("translate", role = %role.name);
        span.in_scope(|| {
            let empty = Config::default();
            let cfg = inputs.cfg.as_deref().unwrap_or(&empty);

            if role.name == MISCONFIGURED_GROUP {
                let mut reports = Reports::new(cfg, role);
                reports.add(
                    ObjectRef::role(&role.name),
                    Error::validation(format!(
                        "role name {} is reserved for proxies without a valid role",
                        MISCONFIGURED_GROUP
                    )),
                );
                warn!("Role uses the reserved misconfigured group name; not translating it");
                return (Snapshot::new(Vec::new(), Vec::new(), Vec::new(), Vec::new()), reports.into_reports());
            }

            let mut pass = Pass {
                cfg,
                role,
                inputs,
                pipeline: UpstreamPipeline::new(&self.registry, cfg, &inputs.secrets, &inputs.files),
                built: BuiltClusters::new(),
                resources: Resources::default(),
                reports: Reports::new(cfg, role),
            };

            let mut names = HashSet::new();
            let mut ports = HashSet::new();
            for listener in &role.listeners {
                if !names.insert(listener.name.as_str()) {
                    pass.reports.add(
                        ObjectRef::role(&role.name),
                        Error::validation(format!("listener name {} is used more than once", listener.name)),
                    );
                    continue;
                }
                if !ports.insert(listener.bind_port) {
                    pass.reports.add(
                        ObjectRef::role(&role.name),
                        Error::validation(format!(
                            "listener {} binds port {} which is already used by another listener",
                            listener.name, listener.bind_port
                        )),
                    );
                    continue;
                }
                self.translate_listener(&mut pass, listener);
            }

            let snapshot = pass.resources.into_snapshot();
            debug!(
                version = %snapshot.version,
                clusters = snapshot.clusters.len(),
                endpoints = snapshot.endpoints.len(),
                routes = snapshot.routes.len(),
                listeners = snapshot.listeners.len(),
                rejected = pass.reports.rejected(),
                "Translated role"
            );
            (snapshot, pass.reports.into_reports())
        })
    }

    fn translate_listener(&self, pass: &mut Pass<'_>, listener: &Listener) {
        let cfg = pass.cfg;
        let extensions = trim::merged_extensions(cfg, pass.role, listener, &mut pass.reports);
        let virtual_services = trim::listener_virtual_services(cfg, pass.role, listener, &mut pass.reports);

        let mut upstreams: Vec<Upstream> = Vec::new();
        for upstream in trim::reachable_upstreams(cfg, &virtual_services) {
            let Some(cluster) = self.cluster(pass, upstream) else { continue };
            pass.resources.clusters.push(cluster);
            if let Some(endpoints) = pass.inputs.endpoints.get(&upstream.name) {
                pass.resources.endpoints.push(load_assignment(&upstream.name, endpoints));
            }
            upstreams.push(upstream.clone());
        }

        let conflicting = routes::domain_conflicts(&virtual_services, &mut pass.reports);
        let candidates: Vec<&VirtualService> =
            virtual_services.into_iter().filter(|vs| !conflicting.contains(&vs.name)).collect();
        let plan = listeners::plan_filter_chains(
            &candidates,
            &pass.inputs.secrets,
            &pass.inputs.files,
            &mut pass.reports,
        );

        let virtual_hosts: Vec<_> = plan
            .virtual_services
            .iter()
            .map(|(vs, tls)| routes::virtual_host(&self.registry, vs, &upstreams, *tls, &mut pass.reports))
            .collect();
        if virtual_hosts.is_empty() {
            debug!(listener = %listener.name, "Listener has no virtual hosts; skipping");
            return;
        }

        let params = ListenerPluginParams {
            config: cfg,
            role: pass.role,
            listener,
            extensions: &extensions,
        };
        let (http_filters, listener_filters) =
            listeners::plugin_filters(&self.registry, &params, &mut pass.reports);

        pass.resources.routes.push(routes::route_configuration(listener, virtual_hosts));
        pass.resources.listeners.push(listeners::envoy_listener(
            listener,
            routes::route_config_name(listener),
            &plan,
            http_filters,
            listener_filters,
        ));
    }

    /// The cluster for `upstream`, built at most once per pass.
    fn cluster(&self, pass: &mut Pass<'_>, upstream: &Upstream) -> Option<Cluster> {
        if let Some(built) = pass.built.get(&upstream.name) {
            return built.clone();
        }
        let built = match pass.pipeline.cluster(upstream, &pass.inputs.endpoints) {
            Ok(cluster) => Some(cluster),
            Err(errors) => {
                pass.reports.extend(&ObjectRef::upstream(&upstream.name), errors);
                None
            }
        };
        pass.built.insert(upstream.name.clone(), built.clone());
        built
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Destination, Endpoint, EndpointGroups, Matcher, PathMatcher, RequestMatcher, Route,
        RouteDestination, StatusState, UpstreamDestination,
    };
    use crate::plugins::{Plugin, UpstreamPlugin, UpstreamPluginParams};
    use envoy_types::pb::envoy::config::cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType};
    use serde_json::json;

    /// Gives every cluster the same name.
    struct SharedClusterName;

    impl Plugin for SharedClusterName {
        fn name(&self) -> &'static str {
            "shared-cluster-name"
        }

        fn upstream_plugin(self: Arc<Self>) -> Option<Arc<dyn UpstreamPlugin>> {
            Some(self)
        }
    }

    impl UpstreamPlugin for SharedClusterName {
        fn process_upstream(
            &self,
            _params: &UpstreamPluginParams,
            _upstream: &Upstream,
            out: &mut Cluster,
        ) -> crate::Result<()> {
            out.name = "shared".into();
            Ok(())
        }
    }

    fn to(upstream: &str) -> Route {
        Route {
            matcher: Matcher::RequestMatcher(RequestMatcher {
                path: Some(PathMatcher::Prefix("/".into())),
                ..Default::default()
            }),
            destination: RouteDestination::SingleDestination(Destination::Upstream(
                UpstreamDestination { name: upstream.into() },
            )),
            extensions: None,
        }
    }

    fn static_upstream(name: &str) -> Upstream {
        Upstream {
            name: name.into(),
            upstream_type: "static".into(),
            spec: json!({"hosts": [{"addr": "10.0.0.1", "port": 80}]}),
            ..Default::default()
        }
    }

    fn listener(name: &str, port: u32, virtual_services: &[&str]) -> Listener {
        Listener {
            name: name.into(),
            bind_address: "0.0.0.0".into(),
            bind_port: port,
            virtual_services: virtual_services.iter().map(|s| s.to_string()).collect(),
            attributes: Vec::new(),
            extensions: BTreeMap::new(),
        }
    }

    fn vs(name: &str, domains: &[&str], routes: Vec<Route>) -> VirtualService {
        VirtualService {
            name: name.into(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            routes,
            ..Default::default()
        }
    }

    fn cache(cfg: Config, endpoints: EndpointGroups) -> Cache {
        Cache { cfg: Some(Arc::new(cfg)), endpoints: Arc::new(endpoints), ..Default::default() }
    }

    fn translator() -> Translator {
        Translator::new(Arc::new(PluginRegistry::new(Vec::new())))
    }

    fn state_of(reports: &[ConfigObjectReport], object: ObjectRef) -> StatusState {
        reports
            .iter()
            .find(|r| r.object == object)
            .map(|r| r.status().state)
            .unwrap_or(StatusState::Pending)
    }

    fn role(listeners: Vec<Listener>) -> Role {
        Role { name: "ingress".into(), listeners, ..Default::default() }
    }

    #[test]
    fn single_service_end_to_end() {
        let cfg = Config {
            upstreams: vec![Upstream {
                name: "svc-a".into(),
                upstream_type: "kubernetes".into(),
                ..Default::default()
            }],
            virtual_services: vec![vs("vs-a", &["a.com"], vec![to("svc-a")])],
            ..Default::default()
        };
        let endpoints = EndpointGroups::from([("svc-a".to_string(), vec![Endpoint::new("10.1.1.1", 8080)])]);
        let role = role(vec![listener("http", 8080, &["vs-a"])]);

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, endpoints));

        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.clusters[0].name, "svc-a");
        assert_eq!(snapshot.endpoints.len(), 1);
        assert_eq!(snapshot.endpoints[0].cluster_name, "svc-a");
        assert_eq!(snapshot.routes.len(), 1);
        assert_eq!(snapshot.routes[0].name, "http-routes");
        assert_eq!(snapshot.routes[0].virtual_hosts[0].domains, vec!["a.com".to_string()]);
        assert_eq!(snapshot.listeners.len(), 1);
        assert!(reports.iter().all(ConfigObjectReport::is_accepted));
    }

    #[test]
    fn translation_is_idempotent() {
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a"), static_upstream("svc-b")],
            virtual_services: vec![
                vs("vs-a", &["a.com"], vec![to("svc-a")]),
                vs("vs-b", &["b.com"], vec![to("svc-b")]),
            ],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a", "vs-b"])]);
        let inputs = cache(cfg, EndpointGroups::new());

        let (first, _) = translator().translate(&role, &inputs);
        let (second, _) = translator().translate(&role, &inputs);

        assert_eq!(first.version, second.version);
        assert_eq!(first, second);
    }

    #[test]
    fn dangling_destination_rejects_the_virtual_service() {
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a")],
            virtual_services: vec![vs("vs-a", &["a.com"], vec![to("svc-a"), to("svc-missing")])],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a"])]);

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert_eq!(snapshot.routes[0].virtual_hosts[0].routes.len(), 1);
        assert_eq!(state_of(&reports, ObjectRef::virtual_service("vs-a")), StatusState::Rejected);
        assert_eq!(state_of(&reports, ObjectRef::upstream("svc-a")), StatusState::Accepted);
    }

    #[test]
    fn colliding_domains_reject_both_services() {
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a")],
            virtual_services: vec![
                vs("vs-a", &["a.com"], vec![to("svc-a")]),
                vs("vs-b", &["a.com"], vec![to("svc-a")]),
            ],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a", "vs-b"])]);

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert_eq!(state_of(&reports, ObjectRef::virtual_service("vs-a")), StatusState::Rejected);
        assert_eq!(state_of(&reports, ObjectRef::virtual_service("vs-b")), StatusState::Rejected);
        assert!(snapshot.routes.is_empty());
        assert!(snapshot.listeners.is_empty());
    }

    #[test]
    fn clusters_shared_between_listeners_appear_once() {
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a")],
            virtual_services: vec![
                vs("vs-a", &["a.com"], vec![to("svc-a")]),
                vs("vs-b", &["b.com"], vec![to("svc-a")]),
            ],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a"]), listener("admin", 9090, &["vs-b"])]);

        let (snapshot, _) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.routes.len(), 2);
        assert_eq!(snapshot.listeners.len(), 2);
    }

    #[test]
    fn broken_upstream_is_reported_and_left_out() {
        let cfg = Config {
            upstreams: vec![Upstream {
                name: "svc-a".into(),
                upstream_type: "static".into(),
                spec: json!({"hosts": []}),
                ..Default::default()
            }],
            virtual_services: vec![vs("vs-a", &["a.com"], vec![to("svc-a")])],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a"])]);

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert!(snapshot.clusters.is_empty());
        assert_eq!(state_of(&reports, ObjectRef::upstream("svc-a")), StatusState::Rejected);
        assert_eq!(state_of(&reports, ObjectRef::virtual_service("vs-a")), StatusState::Rejected);
    }

    #[test]
    fn empty_role_produces_an_empty_snapshot() {
        let (snapshot, reports) = translator().translate(&role(vec![]), &Cache::default());
        assert!(snapshot.is_empty());
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_accepted());
    }

    #[test]
    fn reused_port_is_a_role_error() {
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a")],
            virtual_services: vec![
                vs("vs-a", &["a.com"], vec![to("svc-a")]),
                vs("vs-b", &["b.com"], vec![to("svc-a")]),
            ],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a"]), listener("other", 8080, &["vs-b"])]);

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert_eq!(snapshot.listeners.len(), 1);
        let role_report = reports.iter().find(|r| r.object == ObjectRef::role("ingress")).expect("role report");
        assert!(role_report.status().reason.unwrap_or_default().contains("port 8080"));
    }

    #[test]
    fn static_service_end_to_end() {
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a")],
            virtual_services: vec![vs("vs-a", &["a.com"], vec![to("svc-a")])],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a"])]);

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert_eq!(snapshot.clusters.len(), 1);
        let cluster = &snapshot.clusters[0];
        assert_eq!(cluster.name, "svc-a");
        assert_eq!(
            cluster.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32))
        );
        let hosts: usize = cluster
            .load_assignment
            .as_ref()
            .map(|la| la.endpoints.iter().map(|l| l.lb_endpoints.len()).sum())
            .unwrap_or(0);
        assert_eq!(hosts, 1);
        assert!(snapshot.endpoints.is_empty());

        assert_eq!(snapshot.routes.len(), 1);
        let virtual_hosts = &snapshot.routes[0].virtual_hosts;
        assert_eq!(virtual_hosts.len(), 1);
        assert_eq!(virtual_hosts[0].domains, vec!["a.com".to_string()]);
        assert_eq!(virtual_hosts[0].routes.len(), 1);

        assert_eq!(snapshot.listeners.len(), 1);
        let chains = &snapshot.listeners[0].filter_chains;
        assert_eq!(chains.len(), 1);
        assert!(chains[0].filter_chain_match.is_none());
        assert!(chains[0].transport_socket.is_none());
        assert!(reports.iter().all(ConfigObjectReport::is_accepted));
    }

    #[test]
    fn listener_without_virtual_services_emits_nothing() {
        let cfg = Config { upstreams: vec![static_upstream("svc-a")], ..Default::default() };
        let role = role(vec![listener("http", 8080, &[])]);

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert!(snapshot.listeners.is_empty());
        assert!(snapshot.routes.is_empty());
        assert!(snapshot.clusters.is_empty());
        assert!(reports.iter().all(ConfigObjectReport::is_accepted));
    }

    #[test]
    fn clusters_renamed_to_the_same_name_keep_the_first() {
        let mut svc_b = static_upstream("svc-b");
        svc_b.spec = json!({"hosts": [{"addr": "10.0.0.2", "port": 80}]});
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a"), svc_b],
            virtual_services: vec![vs("vs-a", &["a.com"], vec![to("svc-a"), to("svc-b")])],
            ..Default::default()
        };
        let role = role(vec![listener("http", 8080, &["vs-a"])]);
        let translator = Translator::new(Arc::new(PluginRegistry::new(vec![
            Arc::new(SharedClusterName) as Arc<dyn Plugin>,
        ])));

        let (snapshot, _) = translator.translate(&role, &cache(cfg, EndpointGroups::new()));

        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.clusters[0].name, "shared");
        let assignment = format!("{:?}", snapshot.clusters[0].load_assignment);
        assert!(assignment.contains("10.0.0.1"));
        assert!(!assignment.contains("10.0.0.2"));
    }

    #[test]
    fn role_with_the_reserved_group_name_is_rejected() {
        let cfg = Config {
            upstreams: vec![static_upstream("svc-a")],
            virtual_services: vec![vs("vs-a", &["a.com"], vec![to("svc-a")])],
            ..Default::default()
        };
        let role = Role {
            name: MISCONFIGURED_GROUP.into(),
            listeners: vec![listener("http", 8080, &["vs-a"])],
            ..Default::default()
        };

        let (snapshot, reports) = translator().translate(&role, &cache(cfg, EndpointGroups::new()));

        assert!(snapshot.is_empty());
        assert_eq!(state_of(&reports, ObjectRef::role(MISCONFIGURED_GROUP)), StatusState::Rejected);
    }
}
