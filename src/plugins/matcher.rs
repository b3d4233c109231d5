use std::sync::Arc;

use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, query_parameter_matcher::QueryParameterMatchSpecifier,
    route_match::PathSpecifier, HeaderMatcher, QueryParameterMatcher, Route as EnvoyRoute,
    RouteMatch,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};
use regex::Regex;

use super::{Plugin, RoutePlugin, RoutePluginParams};
use crate::errors::{Error, Result};
use crate::model::{EventMatcher, Matcher, PathMatcher, RequestMatcher, Route};

const NAME: &str = "matcher";

/// Header carrying the event type for event-matched routes.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

const METHOD_HEADER: &str = ":method";

/// Translates request and event matchers into envoy route matches.
pub struct MatcherPlugin;

impl Plugin for MatcherPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn route_plugin(self: Arc<Self>) -> Option<Arc<dyn RoutePlugin>> {
        Some(self)
    }
}

impl RoutePlugin for MatcherPlugin {
    fn process_route(
        &self,
        _params: &RoutePluginParams<'_>,
        route: &Route,
        out: &mut EnvoyRoute,
    ) -> Result<()> {
        out.r#match = Some(match &route.matcher {
            Matcher::RequestMatcher(matcher) => request_match(matcher)?,
            Matcher::EventMatcher(matcher) => event_match(matcher),
        });
        Ok(())
    }
}

fn request_match(matcher: &RequestMatcher) -> Result<RouteMatch> {
    let path_specifier = match &matcher.path {
        None => PathSpecifier::Prefix("/".to_string()),
        Some(PathMatcher::Prefix(prefix)) => PathSpecifier::Prefix(prefix.clone()),
        Some(PathMatcher::Exact(path)) => PathSpecifier::Path(path.clone()),
        Some(PathMatcher::Regex(regex)) => PathSpecifier::SafeRegex(regex_matcher(regex)?),
    };

    let mut headers = Vec::with_capacity(matcher.headers.len() + 1);
    for (name, value) in &matcher.headers {
        headers.push(header_matcher(name, string_matcher(value)?));
    }
    match matcher.verbs.as_slice() {
        [] => {}
        [verb] => headers.push(header_matcher(METHOD_HEADER, exact(verb))),
        verbs => {
            let alternatives: Vec<String> = verbs.iter().map(|v| regex::escape(v)).collect();
            let pattern = format!("^({})$", alternatives.join("|"));
            headers.push(header_matcher(METHOD_HEADER, regex_string_matcher(&pattern)?));
        }
    }

    let mut query_parameters = Vec::with_capacity(matcher.query_params.len());
    for (name, value) in &matcher.query_params {
        query_parameters.push(QueryParameterMatcher {
            name: name.clone(),
            query_parameter_match_specifier: Some(QueryParameterMatchSpecifier::StringMatch(
                string_matcher(value)?,
            )),
            ..Default::default()
        });
    }

    Ok(RouteMatch {
        path_specifier: Some(path_specifier),
        headers,
        query_parameters,
        ..Default::default()
    })
}

fn event_match(matcher: &EventMatcher) -> RouteMatch {
    RouteMatch {
        path_specifier: Some(PathSpecifier::Prefix("/".to_string())),
        headers: vec![header_matcher(EVENT_TYPE_HEADER, exact(&matcher.event_type))],
        ..Default::default()
    }
}

fn header_matcher(name: &str, matcher: StringMatcher) -> HeaderMatcher {
    HeaderMatcher {
        name: name.to_string(),
        header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(matcher)),
        ..Default::default()
    }
}

/// Values wrapped in slashes (`/.../`) are regexes; anything else matches exactly.
fn string_matcher(value: &str) -> Result<StringMatcher> {
    match value.strip_prefix('/').and_then(|v| v.strip_suffix('/')) {
        Some(pattern) if !pattern.is_empty() => regex_string_matcher(pattern),
        _ => Ok(exact(value)),
    }
}

fn exact(value: &str) -> StringMatcher {
    StringMatcher { match_pattern: Some(MatchPattern::Exact(value.to_string())), ..Default::default() }
}

fn regex_string_matcher(pattern: &str) -> Result<StringMatcher> {
    Ok(StringMatcher {
        match_pattern: Some(MatchPattern::SafeRegex(regex_matcher(pattern)?)),
        ..Default::default()
    })
}

fn regex_matcher(pattern: &str) -> Result<RegexMatcher> {
    Regex::new(pattern)
        .map_err(|e| Error::plugin(NAME, format!("invalid regex {:?}: {}", pattern, e)))?;
    Ok(RegexMatcher { regex: pattern.to_string(), ..Default::default() })
}
