//! Policy input construction
//!
//! The input document mirrors the protojson encoding of the check request
//! (`attributes` with camelCase keys, empty fields omitted) and adds the
//! pre-parsed views policies usually need:
//!
//! - `parsed_path`: path segments after percent-decoding
//! - `parsed_query`: query parameters, each mapped to a list of values
//! - `parsed_body`: JSON and form bodies, and gRPC bodies when a descriptor
//!   set is configured
//! - `truncated_body`: whether the proxy sent less than `content-length`
//! - `version`: encoding and protocol version of the request

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat};
use envoy_types::ext_authz::v3::pb::CheckRequest;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::core::v3::{Address, Metadata};
use envoy_types::pb::envoy::service::auth::v3::attribute_context::{HttpRequest, Peer, Request};
use envoy_types::pb::envoy::service::auth::v3::AttributeContext;
use percent_encoding::percent_decode_str;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{ExtAuthzError, Result};
use crate::wkt::struct_to_json;

/// Protocol version of the incoming check call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    /// `envoy.service.auth.v2`
    V2,
    /// `envoy.service.auth.v3`
    V3,
}

impl ApiVersion {
    /// Version label reported in the input document
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V2 => "v2",
            ApiVersion::V3 => "v3",
        }
    }
}

const GRPC_FRAME_HEADER_LEN: usize = 5;

/// Build the policy input for a check request
pub fn request_to_input(
    request: &CheckRequest,
    version: ApiVersion,
    descriptors: Option<&DescriptorPool>,
    skip_body_parse: bool,
) -> Result<Value> {
    let mut input = Map::new();
    let http = request
        .attributes
        .as_ref()
        .and_then(|a| a.request.as_ref())
        .and_then(|r| r.http.as_ref());

    if let Some(attributes) = &request.attributes {
        input.insert("attributes".to_string(), attributes_json(attributes));
    }

    let path = http.map(|h| h.path.as_str()).unwrap_or_default();
    let (parsed_path, parsed_query) = parse_path_and_query(path)?;
    input.insert("parsed_path".to_string(), parsed_path);
    input.insert("parsed_query".to_string(), parsed_query);

    if !skip_body_parse {
        if let Some(http) = http {
            let (parsed_body, truncated) = parse_body(http, descriptors)?;
            input.insert("parsed_body".to_string(), parsed_body.unwrap_or(Value::Null));
            input.insert("truncated_body".to_string(), Value::Bool(truncated));
        }
    }

    input.insert(
        "version".to_string(),
        json!({"encoding": "protojson", "ext_authz": version.as_str()}),
    );

    Ok(Value::Object(input))
}

fn parse_path_and_query(path: &str) -> Result<(Value, Value)> {
    let without_fragment = path.split_once('#').map_or(path, |(p, _)| p);
    let (raw_path, raw_query) = without_fragment
        .split_once('?')
        .unwrap_or((without_fragment, ""));

    let decoded = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|e| ExtAuthzError::input_conversion(format!("invalid request path: {}", e)))?;
    let segments: Vec<Value> = decoded
        .trim_start_matches('/')
        .split('/')
        .map(|s| Value::String(s.to_string()))
        .collect();

    Ok((Value::Array(segments), multi_map(raw_query.as_bytes())))
}

fn multi_map(encoded: &[u8]) -> Value {
    let mut out: Map<String, Value> = Map::new();
    for (key, value) in url::form_urlencoded::parse(encoded) {
        let entry = out
            .entry(key.into_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(value.into_owned()));
        }
    }
    Value::Object(out)
}

fn header<'a>(http: &'a HttpRequest, name: &str) -> Option<&'a str> {
    http.headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_body(
    http: &HttpRequest,
    descriptors: Option<&DescriptorPool>,
) -> Result<(Option<Value>, bool)> {
    let data: &[u8] = if http.raw_body.is_empty() {
        http.body.as_bytes()
    } else {
        &http.raw_body
    };

    let truncated = match header(http, "content-length") {
        Some(len) => {
            let len: usize = len.trim().parse().map_err(|_| {
                ExtAuthzError::input_conversion(format!("invalid content-length header {:?}", len))
            })?;
            len > data.len()
        }
        None => false,
    };

    if data.is_empty() {
        return Ok((None, truncated));
    }

    let content_type = header(http, "content-type").unwrap_or_default();

    if content_type.contains("application/json") {
        if truncated {
            return Ok((None, true));
        }
        let body = serde_json::from_slice(data).map_err(|e| {
            ExtAuthzError::input_conversion(format!("body is not valid JSON: {}", e))
        })?;
        return Ok((Some(body), false));
    }

    if content_type.contains("application/x-www-form-urlencoded") {
        return Ok((Some(multi_map(data)), truncated));
    }

    if content_type.contains("application/grpc") {
        let Some(pool) = descriptors else {
            return Ok((None, truncated));
        };
        return parse_grpc_body(pool, &http.path, data, truncated);
    }

    debug!(content_type, "Request body not parsed");
    Ok((None, truncated))
}

fn grpc_input_type(pool: &DescriptorPool, path: &str) -> Option<MessageDescriptor> {
    let (service, method) = path.trim_start_matches('/').split_once('/')?;
    let service = pool.get_service_by_name(service)?;
    let method = service.methods().find(|m| m.name() == method)?;
    Some(method.input())
}

fn parse_grpc_body(
    pool: &DescriptorPool,
    path: &str,
    data: &[u8],
    truncated: bool,
) -> Result<(Option<Value>, bool)> {
    if truncated {
        return Ok((None, true));
    }
    let Some(message) = grpc_input_type(pool, path) else {
        warn!(path, "No descriptor found for gRPC method");
        return Ok((None, false));
    };
    if data.len() < GRPC_FRAME_HEADER_LEN {
        return Err(ExtAuthzError::input_conversion(
            "gRPC body shorter than the frame header",
        ));
    }
    if data[0] != 0 {
        debug!(path, "Compressed gRPC body not parsed");
        return Ok((None, false));
    }

    let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let payload = &data[GRPC_FRAME_HEADER_LEN..];
    if payload.len() < len {
        return Ok((None, true));
    }

    let msg = DynamicMessage::decode(message, &payload[..len]).map_err(|e| {
        ExtAuthzError::input_conversion(format!("failed to decode gRPC body: {}", e))
    })?;
    let body = serde_json::to_value(&msg).map_err(|e| {
        ExtAuthzError::input_conversion(format!("failed to encode gRPC body: {}", e))
    })?;
    Ok((Some(body), false))
}

/// Builder for protojson-style objects that omit default values
#[derive(Default)]
struct Obj(Map<String, Value>);

impl Obj {
    fn str(mut self, key: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.0.insert(key.to_string(), Value::String(value.to_string()));
        }
        self
    }

    fn map(mut self, key: &str, value: &HashMap<String, String>) -> Self {
        if !value.is_empty() {
            let map = value
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            self.0.insert(key.to_string(), Value::Object(map));
        }
        self
    }

    fn value(mut self, key: &str, value: Option<Value>) -> Self {
        if let Some(value) = value {
            self.0.insert(key.to_string(), value);
        }
        self
    }

    fn build(self) -> Value {
        Value::Object(self.0)
    }
}

fn attributes_json(attrs: &AttributeContext) -> Value {
    Obj::default()
        .value("source", attrs.source.as_ref().map(peer_json))
        .value("destination", attrs.destination.as_ref().map(peer_json))
        .value("request", attrs.request.as_ref().map(request_json))
        .map("contextExtensions", &attrs.context_extensions)
        .value(
            "metadataContext",
            attrs.metadata_context.as_ref().map(metadata_json),
        )
        .value(
            "tlsSession",
            attrs
                .tls_session
                .as_ref()
                .map(|tls| Obj::default().str("sni", &tls.sni).build()),
        )
        .build()
}

fn peer_json(peer: &Peer) -> Value {
    Obj::default()
        .value("address", peer.address.as_ref().map(address_json))
        .str("service", &peer.service)
        .map("labels", &peer.labels)
        .str("principal", &peer.principal)
        .str("certificate", &peer.certificate)
        .build()
}

fn address_json(address: &Address) -> Value {
    match &address.address {
        Some(AddressKind::SocketAddress(sa)) => {
            let port = match &sa.port_specifier {
                Some(PortSpecifier::PortValue(port)) => Some(json!({"portValue": port})),
                Some(PortSpecifier::NamedPort(name)) => Some(json!({"namedPort": name})),
                None => None,
            };
            let mut socket = Obj::default()
                .str("address", &sa.address)
                .str("resolverName", &sa.resolver_name);
            if let Some(Value::Object(port)) = port {
                socket.0.extend(port);
            }
            json!({"socketAddress": socket.build()})
        }
        Some(AddressKind::Pipe(pipe)) => {
            json!({"pipe": Obj::default().str("path", &pipe.path).build()})
        }
        _ => json!({}),
    }
}

fn request_json(request: &Request) -> Value {
    let time = request.time.as_ref().and_then(|ts| {
        DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
    });
    Obj::default()
        .value("time", time)
        .value("http", request.http.as_ref().map(http_json))
        .build()
}

fn http_json(http: &HttpRequest) -> Value {
    let size = (http.size != 0).then(|| Value::String(http.size.to_string()));
    let raw_body =
        (!http.raw_body.is_empty()).then(|| Value::String(STANDARD.encode(&http.raw_body)));
    Obj::default()
        .str("id", &http.id)
        .str("method", &http.method)
        .map("headers", &http.headers)
        .str("path", &http.path)
        .str("host", &http.host)
        .str("scheme", &http.scheme)
        .str("query", &http.query)
        .str("fragment", &http.fragment)
        .value("size", size)
        .str("protocol", &http.protocol)
        .str("body", &http.body)
        .value("rawBody", raw_body)
        .build()
}

fn metadata_json(metadata: &Metadata) -> Value {
    let filters: Map<String, Value> = metadata
        .filter_metadata
        .iter()
        .map(|(k, v)| (k.clone(), struct_to_json(v)))
        .collect();
    if filters.is_empty() {
        return json!({});
    }
    json!({"filterMetadata": filters})
}
