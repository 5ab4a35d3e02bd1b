//! Decision to wire response translation
//!
//! A decision is either a bare boolean, an object carrying the allow bit
//! plus response mutations, or anything else (which denies). Every field of
//! an object decision is extracted independently; the first malformed field
//! fails the whole translation and no response payload is produced.

use envoy_types::ext_authz::v3::pb::CheckResponse;
use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::auth::v3::check_response::HttpResponse;
use envoy_types::pb::envoy::service::auth::v3::{DeniedHttpResponse, OkHttpResponse};
use envoy_types::pb::google::protobuf::Struct;
use envoy_types::pb::google::rpc::Status as RpcStatus;
use serde_json::{Map, Value};
use tonic::Code;
use tracing::warn;

use crate::error::{ExtAuthzError, Result};
use crate::wkt::json_to_struct;

/// Key holding the allow bit of an object decision
pub const ALLOWED_KEY: &str = "allowed";
/// Accepted alias of [`ALLOWED_KEY`]
pub const ALLOW_ALIAS: &str = "allow";

/// Interpreted policy decision
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Bare allow/deny
    Scalar(bool),
    /// Allow bit plus response mutations
    Structured(Map<String, Value>),
    /// Any other value; always denies
    Other(Value),
}

impl From<Value> for Decision {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(allowed) => Decision::Scalar(allowed),
            Value::Object(map) => Decision::Structured(map),
            other => Decision::Other(other),
        }
    }
}

impl Decision {
    /// Read the allow bit
    pub fn is_allowed(&self) -> Result<bool> {
        match self {
            Decision::Scalar(allowed) => Ok(*allowed),
            Decision::Structured(map) => {
                let value = map
                    .get(ALLOWED_KEY)
                    .or_else(|| map.get(ALLOW_ALIAS))
                    .ok_or_else(|| {
                        ExtAuthzError::response_shaping(
                            "unable to determine evaluation result due to missing \"allowed\" key",
                        )
                    })?;
                value.as_bool().ok_or_else(|| {
                    ExtAuthzError::response_shaping(format!(
                        "expected boolean \"allowed\" value, got {}",
                        value
                    ))
                })
            }
            Decision::Other(value) => {
                warn!(decision = %value, "Decision is neither boolean nor object, denying");
                Ok(false)
            }
        }
    }
}

/// Build the v3 check response for a decision
pub fn shape_response(decision: &Decision) -> Result<CheckResponse> {
    let allowed = decision
        .is_allowed()
        .map_err(|e| e.context("failed to get response status"))?;

    let code = if allowed {
        Code::Ok
    } else {
        Code::PermissionDenied
    };
    let mut resp = CheckResponse {
        status: Some(rpc_status(code, "")),
        ..Default::default()
    };

    let Decision::Structured(map) = decision else {
        return Ok(resp);
    };

    let headers = header_options(map.get("headers"))
        .map_err(|e| e.context("failed to get response headers"))?;

    resp.dynamic_metadata = dynamic_metadata(map.get("dynamic_metadata"))
        .map_err(|e| e.context("failed to get dynamic metadata"))?;

    if allowed {
        let headers_to_remove = string_list(map.get("request_headers_to_remove"))
            .map_err(|e| e.context("failed to get request headers to remove"))?;
        let response_headers_to_add = header_options(map.get("response_headers_to_add"))
            .map_err(|e| e.context("failed to get response headers to send to client"))?;

        resp.http_response = Some(HttpResponse::OkResponse(OkHttpResponse {
            headers,
            headers_to_remove,
            response_headers_to_add,
            ..Default::default()
        }));
    } else {
        let body = body(map.get("body")).map_err(|e| e.context("failed to get response body"))?;
        let status = http_status(map.get("http_status"))
            .map_err(|e| e.context("failed to get response http status"))?;

        resp.http_response = Some(HttpResponse::DeniedResponse(DeniedHttpResponse {
            status: Some(status),
            headers,
            body,
        }));
    }

    Ok(resp)
}

/// Force a non-OK response to allow with an empty ok-branch
pub fn apply_dry_run(resp: &mut CheckResponse) {
    let is_ok = resp
        .status
        .as_ref()
        .is_some_and(|s| s.code == Code::Ok as i32);
    if !is_ok {
        resp.status = Some(rpc_status(Code::Ok, ""));
        resp.http_response = Some(HttpResponse::OkResponse(OkHttpResponse::default()));
    }
}

/// Build a `google.rpc.Status`
pub fn rpc_status(code: Code, message: &str) -> RpcStatus {
    RpcStatus {
        code: code as i32,
        message: message.to_string(),
        ..Default::default()
    }
}

fn header_option(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn push_headers(out: &mut Vec<HeaderValueOption>, headers: &Map<String, Value>) -> Result<()> {
    for (key, value) in headers {
        match value {
            Value::String(v) => out.push(header_option(key, v)),
            Value::Array(values) => {
                for v in values {
                    let v = v.as_str().ok_or_else(|| {
                        ExtAuthzError::response_shaping(format!(
                            "type assertion error, expected string value for header {:?}",
                            key
                        ))
                    })?;
                    out.push(header_option(key, v));
                }
            }
            other => {
                return Err(ExtAuthzError::response_shaping(format!(
                    "type assertion error, expected string or array of strings for header {:?}, got {}",
                    key, other
                )))
            }
        }
    }
    Ok(())
}

fn header_options(value: Option<&Value>) -> Result<Vec<HeaderValueOption>> {
    let mut out = Vec::new();
    match value {
        None => {}
        Some(Value::Object(headers)) => push_headers(&mut out, headers)?,
        Some(Value::Array(items)) => {
            for item in items {
                let headers = item.as_object().ok_or_else(|| {
                    ExtAuthzError::response_shaping(format!(
                        "type assertion error, expected headers object, got {}",
                        item
                    ))
                })?;
                push_headers(&mut out, headers)?;
            }
        }
        Some(other) => {
            return Err(ExtAuthzError::response_shaping(format!(
                "type assertion error, expected headers to be an object or an array of objects, got {}",
                other
            )))
        }
    }
    Ok(out)
}

fn string_list(value: Option<&Value>) -> Result<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ExtAuthzError::response_shaping(format!(
                        "type assertion error, expected string, got {}",
                        item
                    ))
                })
            })
            .collect(),
        Some(other) => Err(ExtAuthzError::response_shaping(format!(
            "type assertion error, expected array of strings, got {}",
            other
        ))),
    }
}

fn body(value: Option<&Value>) -> Result<String> {
    match value {
        None => Ok(String::new()),
        Some(Value::String(body)) => Ok(body.clone()),
        Some(other) => Err(ExtAuthzError::response_shaping(format!(
            "type assertion error, expected string body, got {}",
            other
        ))),
    }
}

fn http_status(value: Option<&Value>) -> Result<HttpStatus> {
    let Some(value) = value else {
        return Ok(HttpStatus {
            code: StatusCode::Forbidden as i32,
        });
    };

    let code = value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| {
            ExtAuthzError::response_shaping(format!(
                "type assertion error, expected numeric http status, got {}",
                value
            ))
        })?;

    i32::try_from(code)
        .ok()
        .and_then(|code| StatusCode::try_from(code).ok())
        .map(|code| HttpStatus { code: code as i32 })
        .ok_or_else(|| {
            ExtAuthzError::response_shaping(format!("Invalid HTTP status code {}", code))
        })
}

fn dynamic_metadata(value: Option<&Value>) -> Result<Option<Struct>> {
    match value {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(json_to_struct(map))),
        Some(other) => Err(ExtAuthzError::response_shaping(format!(
            "type assertion error, expected dynamic_metadata to be an object, got {}",
            other
        ))),
    }
}
