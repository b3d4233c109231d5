use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption,
};
use envoy_types::pb::envoy::config::route::v3::{
    route, route_action::HostRewriteSpecifier, Route as EnvoyRoute, RetryPolicy,
};
use envoy_types::pb::google::protobuf::UInt32Value;
use serde::{Deserialize, Serialize};

use super::{Plugin, RoutePlugin, RoutePluginParams};
use crate::errors::{Error, Result};
use crate::model::Route;
use crate::xds::proto::seconds;

const NAME: &str = "route_extensions";

const DEFAULT_RETRY_ON: &str = "5xx,connect-failure,refused-stream";

/// The settings accepted in a route's `extensions` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteExtensions {
    pub prefix_rewrite: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_on: Option<String>,
    pub add_request_headers: Vec<RequestHeader>,
    pub host_rewrite: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub append: bool,
}

/// Applies [`RouteExtensions`] to the route action built by the route
/// initializer.
pub struct RouteExtensionsPlugin;

impl Plugin for RouteExtensionsPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn route_plugin(self: Arc<Self>) -> Option<Arc<dyn RoutePlugin>> {
        Some(self)
    }
}

impl RoutePlugin for RouteExtensionsPlugin {
    fn process_route(
        &self,
        _params: &RoutePluginParams<'_>,
        route: &Route,
        out: &mut EnvoyRoute,
    ) -> Result<()> {
        let Some(raw) = route.extensions.as_ref() else {
            return Ok(());
        };
        let extensions: RouteExtensions = serde_json::from_value(raw.clone())
            .map_err(|e| Error::plugin(NAME, format!("invalid route extensions: {}", e)))?;

        for header in &extensions.add_request_headers {
            let append_action = if header.append {
                HeaderAppendAction::AppendIfExistsOrAdd
            } else {
                HeaderAppendAction::OverwriteIfExistsOrAdd
            };
            out.request_headers_to_add.push(HeaderValueOption {
                header: Some(HeaderValue {
                    key: header.key.clone(),
                    value: header.value.clone(),
                    ..Default::default()
                }),
                append_action: append_action as i32,
                ..Default::default()
            });
        }

        let Some(route::Action::Route(action)) = out.action.as_mut() else {
            return Err(Error::plugin(NAME, "route has no forwarding action to extend"));
        };
        if let Some(prefix) = &extensions.prefix_rewrite {
            action.prefix_rewrite = prefix.clone();
        }
        if let Some(timeout) = extensions.timeout_seconds {
            action.timeout = Some(seconds(timeout));
        }
        if let Some(host) = &extensions.host_rewrite {
            action.host_rewrite_specifier = Some(HostRewriteSpecifier::HostRewriteLiteral(host.clone()));
        }
        if extensions.max_retries.is_some() || extensions.retry_on.is_some() {
            action.retry_policy = Some(RetryPolicy {
                retry_on: extensions.retry_on.clone().unwrap_or_else(|| DEFAULT_RETRY_ON.to_string()),
                num_retries: extensions.max_retries.map(|value| UInt32Value { value }),
                ..Default::default()
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, Matcher, RequestMatcher, RouteDestination, UpstreamDestination, VirtualService};
    use envoy_types::pb::envoy::config::route::v3::RouteAction;
    use serde_json::json;

    fn route(extensions: serde_json::Value) -> Route {
        Route {
            matcher: Matcher::RequestMatcher(RequestMatcher::default()),
            destination: RouteDestination::SingleDestination(Destination::Upstream(
                UpstreamDestination { name: "svc".into() },
            )),
            extensions: Some(extensions),
        }
    }

    fn apply(route: &Route) -> Result<EnvoyRoute> {
        let vs = VirtualService::default();
        let mut out = EnvoyRoute {
            action: Some(route::Action::Route(RouteAction::default())),
            ..Default::default()
        };
        RouteExtensionsPlugin.process_route(
            &RoutePluginParams { upstreams: &[], virtual_service: &vs },
            route,
            &mut out,
        )?;
        Ok(out)
    }

    #[test]
    fn extensions_shape_the_route_action() {
        let out = apply(&route(json!({
            "prefix_rewrite": "/v2",
            "timeout_seconds": 30,
            "max_retries": 3,
            "host_rewrite": "internal.svc",
            "add_request_headers": [{"key": "x-origin", "value": "edge"}]
        })))
        .expect("extensions");

        let Some(route::Action::Route(action)) = out.action else { panic!("missing action") };
        assert_eq!(action.prefix_rewrite, "/v2");
        assert_eq!(action.timeout.map(|t| t.seconds), Some(30));
        let retry = action.retry_policy.expect("retry policy");
        assert_eq!(retry.retry_on, DEFAULT_RETRY_ON);
        assert_eq!(retry.num_retries.map(|n| n.value), Some(3));
        assert_eq!(
            action.host_rewrite_specifier,
            Some(HostRewriteSpecifier::HostRewriteLiteral("internal.svc".into()))
        );
        assert_eq!(out.request_headers_to_add.len(), 1);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = apply(&route(json!({"circuit_breaker": true}))).unwrap_err();
        assert!(matches!(err, Error::Plugin { plugin: "route_extensions", .. }));
    }
}
