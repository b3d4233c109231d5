//! Helpers for building envoy-types protobuf values.

use envoy_types::pb::envoy::config::core::v3::{
    address, config_source, data_source, socket_address, Address, AggregatedConfigSource,
    ApiVersion, ConfigSource, DataSource, Metadata, SocketAddress,
};
use envoy_types::pb::envoy::config::listener::v3::{filter, Filter};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter, HttpConnectionManager, HttpFilter,
};
use envoy_types::pb::google::protobuf::{value::Kind, Any, Duration, ListValue, Struct, Value};
use prost::Message;

use super::{
    HTTP_CONNECTION_MANAGER_FILTER, HTTP_CONNECTION_MANAGER_TYPE_URL, ROUTER_FILTER,
    ROUTER_TYPE_URL,
};

/// Encode `msg` into an `Any` carrying `type_url`.
pub fn any_from_message<M: Message>(type_url: impl Into<String>, msg: &M) -> Any {
    Any { type_url: type_url.into(), value: msg.encode_to_vec() }
}

pub fn seconds(value: u64) -> Duration {
    Duration { seconds: value as i64, nanos: 0 }
}

pub fn socket_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            protocol: socket_address::Protocol::Tcp as i32,
            ..Default::default()
        })),
    }
}

pub fn string_value(s: impl Into<String>) -> Value {
    Value { kind: Some(Kind::StringValue(s.into())) }
}

pub fn struct_value(s: Struct) -> Value {
    Value { kind: Some(Kind::StructValue(s)) }
}

pub fn list_value(values: Vec<Value>) -> Value {
    Value { kind: Some(Kind::ListValue(ListValue { values })) }
}

pub fn number_value(n: f64) -> Value {
    Value { kind: Some(Kind::NumberValue(n)) }
}

pub fn inline_string(s: impl Into<String>) -> DataSource {
    DataSource { specifier: Some(data_source::Specifier::InlineString(s.into())), ..Default::default() }
}

/// Config source pointing back at the aggregated stream the proxy already has.
pub fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
            AggregatedConfigSource::default(),
        )),
        resource_api_version: ApiVersion::V3 as i32,
        ..Default::default()
    }
}

pub fn router_http_filter() -> HttpFilter {
    HttpFilter {
        name: ROUTER_FILTER.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(any_from_message(
            ROUTER_TYPE_URL,
            &Router::default(),
        ))),
        ..Default::default()
    }
}

/// An HTTP connection manager network filter. The router filter is always
/// appended after `http_filters`.
pub fn http_connection_manager_filter(
    stat_prefix: &str,
    route_specifier: RouteSpecifier,
    mut http_filters: Vec<HttpFilter>,
) -> Filter {
    http_filters.push(router_http_filter());
    let hcm = HttpConnectionManager {
        codec_type: CodecType::Auto as i32,
        stat_prefix: stat_prefix.to_string(),
        route_specifier: Some(route_specifier),
        http_filters,
        ..Default::default()
    };
    Filter {
        name: HTTP_CONNECTION_MANAGER_FILTER.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any_from_message(
            HTTP_CONNECTION_MANAGER_TYPE_URL,
            &hcm,
        ))),
    }
}

/// Build a `Struct` from key/value pairs.
pub fn struct_from_pairs<I, K>(pairs: I) -> Struct
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    Struct { fields: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect() }
}

/// Convert a JSON value into a protobuf `Value`.
pub fn json_to_value(v: &serde_json::Value) -> Value {
    let kind = match v {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(arr) => {
            Kind::ListValue(ListValue { values: arr.iter().map(json_to_value).collect() })
        }
        serde_json::Value::Object(obj) => Kind::StructValue(Struct {
            fields: obj.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect(),
        }),
    };
    Value { kind: Some(kind) }
}

/// Convert a JSON object into a protobuf `Struct`; non-objects become empty.
pub fn json_to_struct(value: &serde_json::Value) -> Struct {
    match value {
        serde_json::Value::Object(obj) => Struct {
            fields: obj.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect(),
        },
        _ => Struct::default(),
    }
}

/// Insert `value` under `key` in the filter metadata, creating the metadata
/// block when absent.
pub fn set_filter_metadata(metadata: &mut Option<Metadata>, key: &str, value: Struct) {
    metadata.get_or_insert_with(Metadata::default).filter_metadata.insert(key.to_string(), value);
}
