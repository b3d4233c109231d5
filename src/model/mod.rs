//! # Configuration and discovery model
//!
//! The declarative objects users write (upstreams, virtual services, roles,
//! attributes) and the facts discovered for them at runtime.

mod config;
mod discovery;

pub use config::{
    Attribute, Config, Destination, EventMatcher, Function, FunctionDestination, Listener,
    Matcher, Metadata, ObjectKind, ObjectRef, PathMatcher, RequestMatcher, Role, Route,
    RouteDestination, SslConfig, SslFiles, SslSource, Status, StatusState, Upstream,
    UpstreamDestination, VirtualService, WeightedDestination,
};
pub use discovery::{Endpoint, EndpointGroups, FileContents, Files, Secret, SecretMap};
