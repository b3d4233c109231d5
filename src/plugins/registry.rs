use std::sync::Arc;

use tracing::debug;

use super::{
    Dependencies, EndpointDiscoveryPlugin, FunctionPlugin, FunctionalProcessor, HttpFilterPlugin,
    ListenerFilterPlugin, MatcherPlugin, Plugin, RouteExtensionsPlugin, RouteInitializer,
    RoutePlugin, StaticUpstreamPlugin, UpstreamPlugin,
};
use crate::model::Config;

/// Computes the secret and file refs a config depends on.
pub trait DependencyExtractor: Send + Sync {
    fn dependencies(&self, cfg: &Config) -> Dependencies;
}

/// A capability together with the plugin that provides it.
pub struct Registered<T: ?Sized> {
    pub plugin: Arc<dyn Plugin>,
    pub capability: Arc<T>,
}

impl<T: ?Sized> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self { plugin: Arc::clone(&self.plugin), capability: Arc::clone(&self.capability) }
    }
}

/// The ordered plugin pipeline shared by the translator, the emitter and the
/// endpoint aggregator.
///
/// Order: route initializer, core plugins (matcher, route extensions, static
/// upstream), caller plugins, then the functional upstream processor so that
/// every upstream plugin has run before function specs are parsed.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    upstream: Vec<Registered<dyn UpstreamPlugin>>,
    route: Vec<Registered<dyn RoutePlugin>>,
    http_filter: Vec<Registered<dyn HttpFilterPlugin>>,
    listener_filter: Vec<Registered<dyn ListenerFilterPlugin>>,
    discovery: Vec<Registered<dyn EndpointDiscoveryPlugin>>,
}

impl PluginRegistry {
    pub fn new(caller_plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut ordered: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(RouteInitializer),
            Arc::new(MatcherPlugin),
            Arc::new(RouteExtensionsPlugin),
            Arc::new(StaticUpstreamPlugin),
        ];
        ordered.extend(caller_plugins);

        let function_plugins: Vec<Arc<dyn FunctionPlugin>> =
            ordered.iter().filter_map(|p| Arc::clone(p).function_plugin()).collect();
        ordered.push(Arc::new(FunctionalProcessor::new(function_plugins)));

        let mut registry = Self {
            plugins: Vec::with_capacity(ordered.len()),
            upstream: Vec::new(),
            route: Vec::new(),
            http_filter: Vec::new(),
            listener_filter: Vec::new(),
            discovery: Vec::new(),
        };
        for plugin in ordered {
            registry.register(plugin);
        }
        registry
    }

    fn register(&mut self, plugin: Arc<dyn Plugin>) {
        debug!(plugin = plugin.name(), "Registering plugin");
        if let Some(capability) = Arc::clone(&plugin).upstream_plugin() {
            self.upstream.push(Registered { plugin: Arc::clone(&plugin), capability });
        }
        if let Some(capability) = Arc::clone(&plugin).route_plugin() {
            self.route.push(Registered { plugin: Arc::clone(&plugin), capability });
        }
        if let Some(capability) = Arc::clone(&plugin).http_filter_plugin() {
            self.http_filter.push(Registered { plugin: Arc::clone(&plugin), capability });
        }
        if let Some(capability) = Arc::clone(&plugin).listener_filter_plugin() {
            self.listener_filter.push(Registered { plugin: Arc::clone(&plugin), capability });
        }
        if let Some(capability) = Arc::clone(&plugin).endpoint_discovery_plugin() {
            self.discovery.push(Registered { plugin: Arc::clone(&plugin), capability });
        }
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn upstream_plugins(&self) -> &[Registered<dyn UpstreamPlugin>] {
        &self.upstream
    }

    pub fn route_plugins(&self) -> &[Registered<dyn RoutePlugin>] {
        &self.route
    }

    pub fn http_filter_plugins(&self) -> &[Registered<dyn HttpFilterPlugin>] {
        &self.http_filter
    }

    pub fn listener_filter_plugins(&self) -> &[Registered<dyn ListenerFilterPlugin>] {
        &self.listener_filter
    }

    pub fn discovery_plugins(&self) -> &[Registered<dyn EndpointDiscoveryPlugin>] {
        &self.discovery
    }
}

impl DependencyExtractor for PluginRegistry {
    fn dependencies(&self, cfg: &Config) -> Dependencies {
        let mut deps = Dependencies::default();
        for plugin in &self.plugins {
            if let Some(plugin_deps) = plugin.dependencies(cfg) {
                deps.merge(plugin_deps);
            }
        }
        deps.normalize();
        deps
    }
}
