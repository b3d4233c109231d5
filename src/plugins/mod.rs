//! # Translator plugins
//!
//! Every translation step beyond the skeleton (clusters, virtual hosts,
//! listeners) is delegated to plugins. A plugin advertises its capabilities
//! once, when the [`PluginRegistry`] is built, by returning itself from the
//! matching accessor on [`Plugin`].

use std::collections::BTreeMap;
use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::ListenerFilter;
use envoy_types::pb::envoy::config::route::v3::Route as EnvoyRoute;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpFilter;
use envoy_types::pb::google::protobuf::Struct;
use serde_json::Value;

use crate::endpoints::DiscoveryOptions;
use crate::errors::Result;
use crate::model::{Config, Files, Function, Listener, Role, Route, SecretMap, Upstream, VirtualService};
use crate::watchers::EndpointDiscovery;

mod functional;
mod matcher;
mod registry;
mod route_extensions;
mod route_initializer;
mod static_upstream;

pub use functional::{FunctionalProcessor, FUNCTIONS_METADATA_KEY};
pub use matcher::{MatcherPlugin, EVENT_TYPE_HEADER};
pub use registry::{DependencyExtractor, PluginRegistry, Registered};
pub use route_extensions::{RouteExtensions, RouteExtensionsPlugin};
pub use route_initializer::{RouteInitializer, FUNCTION_ROUTER_METADATA_KEY};
pub use static_upstream::{StaticUpstreamPlugin, StaticUpstreamSpec, STATIC_UPSTREAM_TYPE};

/// Secret and file refs a plugin needs for a given config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub secret_refs: Vec<String>,
    pub file_refs: Vec<String>,
}

impl Dependencies {
    pub fn merge(&mut self, other: Dependencies) {
        self.secret_refs.extend(other.secret_refs);
        self.file_refs.extend(other.file_refs);
    }

    /// Sort and drop duplicate refs.
    pub fn normalize(&mut self) {
        self.secret_refs.sort();
        self.secret_refs.dedup();
        self.file_refs.sort();
        self.file_refs.dedup();
    }
}

/// Ordered HTTP filter stages; filters are sorted by stage then by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    PreInAuth,
    InAuth,
    PostInAuth,
    PreOutAuth,
    OutAuth,
}

#[derive(Debug, Clone)]
pub struct StagedHttpFilter {
    pub filter: HttpFilter,
    pub stage: Stage,
}

#[derive(Debug, Clone)]
pub struct StagedListenerFilter {
    pub filter: ListenerFilter,
    pub stage: Stage,
}

/// Inputs for [`UpstreamPlugin::process_upstream`]. Only the secrets and
/// files the plugin declared as dependencies are present.
#[derive(Debug, Clone, Default)]
pub struct UpstreamPluginParams {
    pub secrets: SecretMap,
    pub files: Files,
}

pub struct RoutePluginParams<'a> {
    pub upstreams: &'a [Upstream],
    pub virtual_service: &'a VirtualService,
}

pub struct FunctionPluginParams<'a> {
    pub upstream: &'a Upstream,
}

/// Inputs for listener-level plugins. `extensions` is the listener's own
/// extension map with its role attributes merged in.
pub struct ListenerPluginParams<'a> {
    pub config: &'a Config,
    pub role: &'a Role,
    pub listener: &'a Listener,
    pub extensions: &'a BTreeMap<String, Value>,
}

/// Base contract every plugin implements.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Secret and file refs this plugin reads for `cfg`.
    fn dependencies(&self, _cfg: &Config) -> Option<Dependencies> {
        None
    }

    fn upstream_plugin(self: Arc<Self>) -> Option<Arc<dyn UpstreamPlugin>> {
        None
    }

    fn route_plugin(self: Arc<Self>) -> Option<Arc<dyn RoutePlugin>> {
        None
    }

    fn function_plugin(self: Arc<Self>) -> Option<Arc<dyn FunctionPlugin>> {
        None
    }

    fn http_filter_plugin(self: Arc<Self>) -> Option<Arc<dyn HttpFilterPlugin>> {
        None
    }

    fn listener_filter_plugin(self: Arc<Self>) -> Option<Arc<dyn ListenerFilterPlugin>> {
        None
    }

    fn endpoint_discovery_plugin(self: Arc<Self>) -> Option<Arc<dyn EndpointDiscoveryPlugin>> {
        None
    }
}

pub trait UpstreamPlugin: Send + Sync {
    fn process_upstream(
        &self,
        params: &UpstreamPluginParams,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<()>;
}

pub trait RoutePlugin: Send + Sync {
    fn process_route(
        &self,
        params: &RoutePluginParams<'_>,
        route: &Route,
        out: &mut EnvoyRoute,
    ) -> Result<()>;
}

/// Understands the function specs of one family of upstreams.
pub trait FunctionPlugin: Send + Sync {
    /// `Ok(None)` means the function does not belong to this plugin.
    fn parse_function_spec(
        &self,
        params: &FunctionPluginParams<'_>,
        function: &Function,
    ) -> Result<Option<Struct>>;
}

pub trait HttpFilterPlugin: Send + Sync {
    fn http_filters(&self, params: &ListenerPluginParams<'_>) -> Result<Vec<StagedHttpFilter>>;
}

pub trait ListenerFilterPlugin: Send + Sync {
    fn listener_filters(
        &self,
        params: &ListenerPluginParams<'_>,
    ) -> Result<Vec<StagedListenerFilter>>;
}

/// Builds an endpoint discovery backend; consumed by the endpoint aggregator.
pub trait EndpointDiscoveryPlugin: Send + Sync {
    fn setup_endpoint_discovery(
        &self,
        opts: &DiscoveryOptions,
    ) -> Result<Arc<dyn EndpointDiscovery>>;
}
