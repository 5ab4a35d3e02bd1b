//! Wire definitions for the legacy `envoy.service.auth.v2` external
//! authorization API.
//!
//! The v3 messages come from `envoy-types`. Envoy still speaks v2 to older
//! deployments, so this crate carries the subset of the v2 schema the
//! authorization service answers with. Field numbers match
//! `envoy/service/auth/v2/external_auth.proto`.
//!
//! # Request compatibility
//!
//! The v3 `AttributeContext` kept every v2 field number when it was
//! migrated, so a v2 `CheckRequest` decodes directly into the v3 attribute
//! type. This lets the v2 entry point hand its request to the v3 pipeline
//! without a translation step.
//!
//! ```text
//! v2 CheckRequest { attributes = 1 }  ──decode──►  v3 AttributeContext
//! v3 CheckResponse                   ──shim────►  v2 CheckResponse
//! ```

#![deny(missing_docs)]

/// `envoy.service.auth.v2` messages and the generated gRPC service.
pub mod v2 {
    use envoy_types::pb::envoy::service::auth::v3::AttributeContext;
    use envoy_types::pb::google::rpc::Status;

    /// Check request sent by a v2 Envoy filter.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CheckRequest {
        /// Request attributes observed by the proxy.
        #[prost(message, optional, tag = "1")]
        pub attributes: Option<AttributeContext>,
    }

    /// Check response returned to a v2 Envoy filter.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CheckResponse {
        /// gRPC status; `OK` allows the request.
        #[prost(message, optional, tag = "1")]
        pub status: Option<Status>,
        /// HTTP attributes for the allow or deny branch.
        #[prost(oneof = "check_response::HttpResponse", tags = "2, 3")]
        pub http_response: Option<check_response::HttpResponse>,
    }

    /// Nested types for [`CheckResponse`].
    pub mod check_response {
        /// Exactly one of the denied or ok branches.
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum HttpResponse {
            /// Attributes for a denied request.
            #[prost(message, tag = "2")]
            DeniedResponse(super::DeniedHttpResponse),
            /// Attributes for an allowed request.
            #[prost(message, tag = "3")]
            OkResponse(super::OkHttpResponse),
        }
    }

    /// HTTP attributes for a denied response.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DeniedHttpResponse {
        /// HTTP status sent to the downstream client.
        #[prost(message, optional, tag = "1")]
        pub status: Option<HttpStatus>,
        /// Headers sent to the downstream client.
        #[prost(message, repeated, tag = "2")]
        pub headers: Vec<HeaderValueOption>,
        /// Response body sent to the downstream client.
        #[prost(string, tag = "3")]
        pub body: String,
    }

    /// HTTP attributes for an ok response.
    ///
    /// v2 has no equivalent of the v3 `headers_to_remove` or
    /// `response_headers_to_add` fields.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct OkHttpResponse {
        /// Headers added to the upstream request.
        #[prost(message, repeated, tag = "2")]
        pub headers: Vec<HeaderValueOption>,
    }

    /// `envoy.api.v2.core.HeaderValueOption`
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HeaderValueOption {
        /// Header name and value.
        #[prost(message, optional, tag = "1")]
        pub header: Option<HeaderValue>,
        /// Append to existing values instead of overwriting.
        #[prost(message, optional, tag = "2")]
        pub append: Option<bool>,
    }

    /// `envoy.api.v2.core.HeaderValue`
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HeaderValue {
        /// Header name.
        #[prost(string, tag = "1")]
        pub key: String,
        /// Header value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// `envoy.type.HttpStatus`
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HttpStatus {
        /// HTTP status code.
        #[prost(enumeration = "StatusCode", tag = "1")]
        pub code: i32,
    }

    /// `envoy.type.StatusCode`
    #[allow(missing_docs)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum StatusCode {
        Empty = 0,
        Continue = 100,
        Ok = 200,
        Created = 201,
        Accepted = 202,
        NonAuthoritativeInformation = 203,
        NoContent = 204,
        ResetContent = 205,
        PartialContent = 206,
        MultiStatus = 207,
        AlreadyReported = 208,
        ImUsed = 226,
        MultipleChoices = 300,
        MovedPermanently = 301,
        Found = 302,
        SeeOther = 303,
        NotModified = 304,
        UseProxy = 305,
        TemporaryRedirect = 307,
        PermanentRedirect = 308,
        BadRequest = 400,
        Unauthorized = 401,
        PaymentRequired = 402,
        Forbidden = 403,
        NotFound = 404,
        MethodNotAllowed = 405,
        NotAcceptable = 406,
        ProxyAuthenticationRequired = 407,
        RequestTimeout = 408,
        Conflict = 409,
        Gone = 410,
        LengthRequired = 411,
        PreconditionFailed = 412,
        PayloadTooLarge = 413,
        UriTooLong = 414,
        UnsupportedMediaType = 415,
        RangeNotSatisfiable = 416,
        ExpectationFailed = 417,
        MisdirectedRequest = 421,
        UnprocessableEntity = 422,
        Locked = 423,
        FailedDependency = 424,
        UpgradeRequired = 426,
        PreconditionRequired = 428,
        TooManyRequests = 429,
        RequestHeaderFieldsTooLarge = 431,
        InternalServerError = 500,
        NotImplemented = 501,
        BadGateway = 502,
        ServiceUnavailable = 503,
        GatewayTimeout = 504,
        HttpVersionNotSupported = 505,
        VariantAlsoNegotiates = 506,
        InsufficientStorage = 507,
        LoopDetected = 508,
        NotExtended = 510,
        NetworkAuthenticationRequired = 511,
    }

    #[allow(missing_docs)]
    mod generated {
        include!(concat!(
            env!("OUT_DIR"),
            "/envoy.service.auth.v2.Authorization.rs"
        ));
    }

    pub use generated::authorization_client;
    pub use generated::authorization_server;
}

#[cfg(test)]
mod tests {
    use super::v2::*;
    use envoy_types::pb::envoy::service::auth::v3::attribute_context::{HttpRequest, Request};
    use envoy_types::pb::envoy::service::auth::v3::AttributeContext;
    use prost::Message;

    #[test]
    fn v2_request_decodes_into_v3_attributes() {
        let request = CheckRequest {
            attributes: Some(AttributeContext {
                request: Some(Request {
                    http: Some(HttpRequest {
                        method: "GET".to_string(),
                        path: "/people".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };

        let bytes = request.encode_to_vec();
        let decoded = CheckRequest::decode(bytes.as_slice()).unwrap();
        let http = decoded.attributes.unwrap().request.unwrap().http.unwrap();
        assert_eq!(http.method, "GET");
        assert_eq!(http.path, "/people");
    }

    #[test]
    fn status_code_rejects_unknown_values() {
        assert_eq!(StatusCode::try_from(403).ok(), Some(StatusCode::Forbidden));
        assert!(StatusCode::try_from(299).is_err());
    }

    #[test]
    fn oneof_branch_survives_encoding() {
        let response = CheckResponse {
            status: None,
            http_response: Some(check_response::HttpResponse::DeniedResponse(
                DeniedHttpResponse {
                    status: Some(HttpStatus {
                        code: StatusCode::Unauthorized as i32,
                    }),
                    headers: vec![],
                    body: "nope".to_string(),
                },
            )),
        };

        let decoded = CheckResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, response);
    }
}
