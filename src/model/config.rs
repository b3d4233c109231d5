//! Declarative configuration objects: upstreams, virtual services, roles and
//! attributes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The full declarative state a translation pass works from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstreams: Vec<Upstream>,
    pub virtual_services: Vec<VirtualService>,
    pub roles: Vec<Role>,
    pub attributes: Vec<Attribute>,
}

impl Config {
    pub fn upstream(&self, name: &str) -> Option<&Upstream> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    pub fn virtual_service(&self, name: &str) -> Option<&VirtualService> {
        self.virtual_services.iter().find(|vs| vs.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Bookkeeping the storage layer attaches to every object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    /// Changes on every write; carries no meaning for translation.
    pub resource_version: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

/// Accept/reject state written back by the reporter, never by the translator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub state: StatusState,
    pub reason: Option<String>,
}

/// A named backend target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub name: String,
    /// Selects which upstream plugin understands `spec`.
    #[serde(rename = "type")]
    pub upstream_type: String,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub connection_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: Status,
}

/// A named, typed sub-destination of an upstream (for example a Lambda).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub spec: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualService {
    pub name: String,
    /// Empty means the default `*` domain.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub ssl_config: Option<SslConfig>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: Status,
}

impl VirtualService {
    /// Domains with the implicit default applied: no domains, or a single
    /// empty domain, means `*`.
    pub fn effective_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .domains
            .iter()
            .map(|d| if d.is_empty() { "*".to_string() } else { d.clone() })
            .collect();
        if domains.is_empty() {
            domains.push("*".to_string());
        }
        domains.dedup();
        domains
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(flatten)]
    pub source: SslSource,
    /// SNI names the filter chain matches; falls back to the virtual
    /// service domains.
    #[serde(default)]
    pub sni_domains: Vec<String>,
}

/// Where the certificate for a TLS virtual service comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslSource {
    SecretRef(String),
    SslFiles(SslFiles),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SslFiles {
    pub tls_cert: String,
    pub tls_key: String,
    #[serde(default)]
    pub root_ca: Option<String>,
}

impl SslSource {
    /// Stable identity used to group virtual services into filter chains.
    pub fn chain_key(&self) -> String {
        match self {
            SslSource::SecretRef(secret) => format!("secret:{}", secret),
            SslSource::SslFiles(files) => format!("files:{}:{}", files.tls_cert, files.tls_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(flatten)]
    pub matcher: Matcher,
    #[serde(flatten)]
    pub destination: RouteDestination,
    /// Opaque settings interpreted by the route extensions plugin.
    #[serde(default)]
    pub extensions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    RequestMatcher(RequestMatcher),
    EventMatcher(EventMatcher),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMatcher {
    pub path: Option<PathMatcher>,
    /// Header name to value; values wrapped in `/.../` are treated as regexes.
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub verbs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatcher {
    Prefix(String),
    Exact(String),
    Regex(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMatcher {
    pub event_type: String,
}

/// Exactly one kind of destination per route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDestination {
    SingleDestination(Destination),
    MultipleDestinations(Vec<WeightedDestination>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedDestination {
    #[serde(flatten)]
    pub destination: Destination,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Upstream(UpstreamDestination),
    Function(FunctionDestination),
}

impl Destination {
    pub fn upstream_name(&self) -> &str {
        match self {
            Destination::Upstream(dest) => &dest.name,
            Destination::Function(dest) => &dest.upstream_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpstreamDestination {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionDestination {
    pub upstream_name: String,
    pub function_name: String,
}

impl Route {
    /// Every destination this route can send traffic to.
    pub fn destinations(&self) -> Vec<&Destination> {
        match &self.destination {
            RouteDestination::SingleDestination(dest) => vec![dest],
            RouteDestination::MultipleDestinations(weighted) => {
                weighted.iter().map(|w| &w.destination).collect()
            }
        }
    }
}

/// A named set of listeners; the unit proxies identify as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub bind_port: u32,
    #[serde(default)]
    pub virtual_services: Vec<String>,
    /// Attribute names merged, in order, into `extensions`.
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Reusable listener settings shared between roles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// The kinds of objects that receive a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Upstream,
    VirtualService,
    Role,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Upstream => write!(f, "upstream"),
            ObjectKind::VirtualService => write!(f, "virtual service"),
            ObjectKind::Role => write!(f, "role"),
        }
    }
}

/// Identifies one configuration object by kind and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub name: String,
}

impl ObjectRef {
    pub fn upstream(name: impl Into<String>) -> Self {
        Self { kind: ObjectKind::Upstream, name: name.into() }
    }

    pub fn virtual_service(name: impl Into<String>) -> Self {
        Self { kind: ObjectKind::VirtualService, name: name.into() }
    }

    pub fn role(name: impl Into<String>) -> Self {
        Self { kind: ObjectKind::Role, name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_YAML: &str = r#"
upstreams:
  - name: svc-a
    type: static
    spec:
      hosts:
        - addr: 10.0.0.1
          port: 80
virtual_services:
  - name: vs-a
    domains: ["a.com"]
    routes:
      - request_matcher:
          path:
            prefix: /
        single_destination:
          upstream:
            name: svc-a
      - event_matcher:
          event_type: order.created
        multiple_destinations:
          - function:
              upstream_name: svc-a
              function_name: handler
            weight: 3
    ssl_config:
      secret_ref: a-cert
roles:
  - name: ingress
    listeners:
      - name: http
        bind_port: 8080
        virtual_services: [vs-a]
"#;

    #[test]
    fn parses_yaml_config() {
        let cfg: Config = serde_yaml::from_str(CONFIG_YAML).expect("parse config");

        assert_eq!(cfg.upstreams[0].upstream_type, "static");
        let vs = cfg.virtual_service("vs-a").expect("vs-a");
        assert_eq!(vs.routes.len(), 2);
        assert!(matches!(vs.routes[0].matcher, Matcher::RequestMatcher(_)));
        assert!(matches!(
            &vs.routes[0].destination,
            RouteDestination::SingleDestination(Destination::Upstream(u)) if u.name == "svc-a"
        ));
        match &vs.routes[1].destination {
            RouteDestination::MultipleDestinations(weighted) => {
                assert_eq!(weighted[0].weight, 3);
                assert_eq!(weighted[0].destination.upstream_name(), "svc-a");
            }
            other => panic!("unexpected destination {:?}", other),
        }
        assert_eq!(
            vs.ssl_config.as_ref().map(|ssl| &ssl.source),
            Some(&SslSource::SecretRef("a-cert".to_string()))
        );
        assert_eq!(cfg.roles[0].listeners[0].bind_address, "0.0.0.0");
    }

    #[test]
    fn effective_domains_default_to_wildcard() {
        let vs = VirtualService { name: "default".into(), ..Default::default() };
        assert_eq!(vs.effective_domains(), vec!["*".to_string()]);

        let vs = VirtualService {
            name: "blank".into(),
            domains: vec![String::new()],
            ..Default::default()
        };
        assert_eq!(vs.effective_domains(), vec!["*".to_string()]);
    }
}
