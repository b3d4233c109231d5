use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::{
    Attribute, Config, EndpointGroups, Files, Function, Listener, Role, Route, SecretMap,
    SslConfig, Upstream, VirtualService,
};

/// The latest value of every translation input.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    pub cfg: Option<Arc<Config>>,
    pub secrets: Arc<SecretMap>,
    pub files: Arc<Files>,
    pub endpoints: Arc<EndpointGroups>,
}

impl Cache {
    /// True once a config has been received.
    pub fn ready(&self) -> bool {
        self.cfg.is_some()
    }

    /// Content hash used to suppress redundant translations.
    ///
    /// Ignores status and resource versions, and the order of upstreams,
    /// virtual services, roles and attributes.
    pub fn hash(&self) -> u64 {
        let cfg = self.cfg.as_deref().map(config_hash).unwrap_or_default();
        cfg.wrapping_add(digest(&*self.secrets))
            .wrapping_add(digest(&*self.files))
            .wrapping_add(digest(&*self.endpoints))
    }
}

fn config_hash(cfg: &Config) -> u64 {
    let projection = ConfigProjection {
        upstreams: sorted_encodings(cfg.upstreams.iter().map(UpstreamProjection::from)),
        virtual_services: sorted_encodings(
            cfg.virtual_services.iter().map(VirtualServiceProjection::from),
        ),
        roles: sorted_encodings(cfg.roles.iter().map(RoleProjection::from)),
        attributes: sorted_encodings(cfg.attributes.iter().map(AttributeProjection::from)),
    };
    digest(&projection)
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("snapshot inputs are always serializable")
}

fn digest<T: Serialize + ?Sized>(value: &T) -> u64 {
    let hash = Sha256::digest(encode(value));
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(prefix)
}

fn sorted_encodings<T: Serialize>(items: impl Iterator<Item = T>) -> Vec<Vec<u8>> {
    let mut encoded: Vec<Vec<u8>> = items.map(|item| encode(&item)).collect();
    encoded.sort();
    encoded
}

#[derive(Serialize)]
struct ConfigProjection {
    upstreams: Vec<Vec<u8>>,
    virtual_services: Vec<Vec<u8>>,
    roles: Vec<Vec<u8>>,
    attributes: Vec<Vec<u8>>,
}

/// Metadata with the resource version stripped.
#[derive(Serialize)]
struct MetadataProjection<'a> {
    namespace: &'a str,
    annotations: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a crate::model::Metadata> for MetadataProjection<'a> {
    fn from(m: &'a crate::model::Metadata) -> Self {
        Self { namespace: &m.namespace, annotations: &m.annotations }
    }
}

#[derive(Serialize)]
struct UpstreamProjection<'a> {
    name: &'a str,
    upstream_type: &'a str,
    spec: &'a Value,
    connection_timeout_seconds: Option<u64>,
    functions: &'a [Function],
    metadata: MetadataProjection<'a>,
}

impl<'a> From<&'a Upstream> for UpstreamProjection<'a> {
    fn from(u: &'a Upstream) -> Self {
        Self {
            name: &u.name,
            upstream_type: &u.upstream_type,
            spec: &u.spec,
            connection_timeout_seconds: u.connection_timeout_seconds,
            functions: &u.functions,
            metadata: (&u.metadata).into(),
        }
    }
}

#[derive(Serialize)]
struct VirtualServiceProjection<'a> {
    name: &'a str,
    domains: &'a [String],
    routes: &'a [Route],
    ssl_config: Option<&'a SslConfig>,
    metadata: MetadataProjection<'a>,
}

impl<'a> From<&'a VirtualService> for VirtualServiceProjection<'a> {
    fn from(vs: &'a VirtualService) -> Self {
        Self {
            name: &vs.name,
            domains: &vs.domains,
            routes: &vs.routes,
            ssl_config: vs.ssl_config.as_ref(),
            metadata: (&vs.metadata).into(),
        }
    }
}

#[derive(Serialize)]
struct RoleProjection<'a> {
    name: &'a str,
    listeners: &'a [Listener],
    metadata: MetadataProjection<'a>,
}

impl<'a> From<&'a Role> for RoleProjection<'a> {
    fn from(r: &'a Role) -> Self {
        Self { name: &r.name, listeners: &r.listeners, metadata: (&r.metadata).into() }
    }
}

#[derive(Serialize)]
struct AttributeProjection<'a> {
    name: &'a str,
    extensions: &'a BTreeMap<String, Value>,
    metadata: MetadataProjection<'a>,
}

impl<'a> From<&'a Attribute> for AttributeProjection<'a> {
    fn from(a: &'a Attribute) -> Self {
        Self { name: &a.name, extensions: &a.extensions, metadata: (&a.metadata).into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Destination, Endpoint, Matcher, PathMatcher, RequestMatcher, RouteDestination, Secret,
        Status, StatusState, UpstreamDestination,
    };
    use proptest::prelude::*;

    fn upstream(name: &str) -> Upstream {
        Upstream {
            name: name.into(),
            upstream_type: "static".into(),
            spec: serde_json::json!({"hosts": [{"addr": "10.0.0.1", "port": 80}]}),
            ..Default::default()
        }
    }

    fn virtual_service(name: &str, domain: &str) -> VirtualService {
        VirtualService {
            name: name.into(),
            domains: vec![domain.into()],
            routes: vec![Route {
                matcher: Matcher::RequestMatcher(RequestMatcher {
                    path: Some(PathMatcher::Prefix("/".into())),
                    ..Default::default()
                }),
                destination: RouteDestination::SingleDestination(Destination::Upstream(
                    UpstreamDestination { name: "svc-a".into() },
                )),
                extensions: None,
            }],
            ..Default::default()
        }
    }

    fn cache(cfg: Config) -> Cache {
        Cache { cfg: Some(Arc::new(cfg)), ..Default::default() }
    }

    fn base_config() -> Config {
        Config {
            upstreams: vec![upstream("svc-a")],
            virtual_services: vec![virtual_service("vs-a", "a.com")],
            ..Default::default()
        }
    }

    #[test]
    fn ready_once_config_is_set() {
        assert!(!Cache::default().ready());
        assert!(cache(Config::default()).ready());
    }

    #[test]
    fn hash_ignores_status_and_resource_version() {
        let before = cache(base_config()).hash();

        let mut cfg = base_config();
        cfg.upstreams[0].status = Status { state: StatusState::Rejected, reason: Some("bad".into()) };
        cfg.upstreams[0].metadata.resource_version = "42".into();
        cfg.virtual_services[0].status.state = StatusState::Accepted;
        cfg.virtual_services[0].metadata.resource_version = "7".into();

        assert_eq!(before, cache(cfg).hash());
    }

    #[test]
    fn hash_is_sensitive_to_content() {
        let base = cache(base_config()).hash();

        let mut domain = base_config();
        domain.virtual_services[0].domains = vec!["b.com".into()];
        assert_ne!(base, cache(domain).hash());

        let mut route = base_config();
        route.virtual_services[0].routes[0].matcher = Matcher::RequestMatcher(RequestMatcher {
            path: Some(PathMatcher::Prefix("/api".into())),
            ..Default::default()
        });
        assert_ne!(base, cache(route).hash());

        let mut spec = base_config();
        spec.upstreams[0].spec = serde_json::json!({"hosts": [{"addr": "10.0.0.2", "port": 80}]});
        assert_ne!(base, cache(spec).hash());

        let mut with_secret = cache(base_config());
        with_secret.secrets = Arc::new(SecretMap::from([("tls".to_string(), Secret::default())]));
        assert_ne!(base, with_secret.hash());

        let mut with_endpoints = cache(base_config());
        with_endpoints.endpoints =
            Arc::new(EndpointGroups::from([("svc-a".to_string(), vec![Endpoint::new("10.1.1.1", 8080)])]));
        assert_ne!(base, with_endpoints.hash());
    }

    proptest! {
        #[test]
        fn hash_ignores_object_order(
            (names, shuffled) in proptest::collection::vec("[a-z]{1,8}", 1..8)
                .prop_flat_map(|names| (Just(names.clone()), Just(names).prop_shuffle()))
        ) {
            let ordered = Config {
                upstreams: names.iter().map(|n| upstream(n)).collect(),
                virtual_services: names.iter().map(|n| virtual_service(n, n)).collect(),
                ..Default::default()
            };
            let reordered = Config {
                upstreams: shuffled.iter().map(|n| upstream(n)).collect(),
                virtual_services: shuffled.iter().rev().map(|n| virtual_service(n, n)).collect(),
                ..Default::default()
            };
            prop_assert_eq!(cache(ordered).hash(), cache(reordered).hash());
        }
    }
}
