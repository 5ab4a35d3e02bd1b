//! Envoy ext_authz gRPC services
//!
//! The v3 service drives the decision pipeline; the v2 service wraps the v3
//! one and downgrades its responses.

use std::sync::Arc;
use std::time::Duration;

use envoy_types::ext_authz::v3::pb::{Authorization, CheckRequest, CheckResponse};
use extauthz_proto::v2;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{error, warn};

use crate::input::ApiVersion;
use crate::pipeline::DecisionPipeline;
use crate::shim::v2_response;

/// `envoy.service.auth.v3.Authorization`
pub struct AuthzService {
    pipeline: Arc<DecisionPipeline>,
}

impl AuthzService {
    /// Create the service around a pipeline
    pub fn new(pipeline: Arc<DecisionPipeline>) -> Self {
        Self { pipeline }
    }

    /// Pipeline answering check calls
    pub fn pipeline(&self) -> &Arc<DecisionPipeline> {
        &self.pipeline
    }

    /// Run the pipeline to completion on its own task
    ///
    /// The caller's future may be dropped when the client cancels; the
    /// spawned task still finalizes the call.
    async fn decide(
        &self,
        request: CheckRequest,
        version: ApiVersion,
        deadline: Option<Instant>,
    ) -> Result<CheckResponse, Status> {
        let pipeline = self.pipeline.clone();
        let outcome =
            tokio::spawn(async move { pipeline.check(&request, version, deadline).await })
                .await
                .map_err(|e| {
                    error!(error = %e, "Check task failed");
                    Status::internal(format!("check task failed: {}", e))
                })?;

        outcome.map_err(|e| {
            warn!(error = %e, "Authorization check error");
            Status::from(e)
        })
    }
}

#[tonic::async_trait]
impl Authorization for AuthzService {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let deadline = grpc_deadline(request.metadata());
        let resp = self
            .decide(request.into_inner(), ApiVersion::V3, deadline)
            .await?;
        Ok(Response::new(resp))
    }
}

/// `envoy.service.auth.v2.Authorization`, delegating to the v3 service
pub struct AuthzServiceV2 {
    v3: Arc<AuthzService>,
}

impl AuthzServiceV2 {
    /// Wrap a v3 service
    pub fn new(v3: Arc<AuthzService>) -> Self {
        Self { v3 }
    }
}

#[tonic::async_trait]
impl v2::authorization_server::Authorization for AuthzServiceV2 {
    async fn check(
        &self,
        request: Request<v2::CheckRequest>,
    ) -> Result<Response<v2::CheckResponse>, Status> {
        let deadline = grpc_deadline(request.metadata());
        let request = CheckRequest {
            attributes: request.into_inner().attributes,
        };
        let resp = self.v3.decide(request, ApiVersion::V2, deadline).await?;
        Ok(Response::new(v2_response(resp)))
    }
}

/// Deadline carried by the `grpc-timeout` request header
pub fn grpc_deadline(metadata: &MetadataMap) -> Option<Instant> {
    let value = metadata.get("grpc-timeout")?.to_str().ok()?;
    parse_grpc_timeout(value).map(|timeout| Instant::now() + timeout)
}

fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::decision_log::{DecisionLogEntry, DecisionLogger, TracingDecisionLogger};
    use crate::engine::RegoEngine;
    use crate::error::{ExtAuthzError, Result};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use envoy_types::pb::envoy::service::auth::v3::attribute_context::{HttpRequest, Request as AttrRequest};
    use envoy_types::pb::envoy::service::auth::v3::AttributeContext;
    use std::collections::HashMap;
    use tonic::Code;

    const POLICY: &str = r#"
package envoy.authz

import rego.v1

default allow := false

allow if input.attributes.request.http.method == "GET"

result := {
    "allowed": allow,
    "headers": {"x-ext-auth-allow": "yes"},
    "response_headers_to_add": {"x-served-by": "extauthz"},
}
"#;

    /// Logger that waits before recording, optionally failing
    #[derive(Default)]
    struct SlowLogger {
        delay: Duration,
        fail: bool,
        entries: Mutex<Vec<DecisionLogEntry>>,
    }

    #[async_trait]
    impl DecisionLogger for SlowLogger {
        async fn log(&self, entry: &DecisionLogEntry) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.entries.lock().push(entry.clone());
            if self.fail {
                return Err(ExtAuthzError::logging("audit sink unavailable"));
            }
            Ok(())
        }
    }

    fn service_with(
        yaml: &str,
        logger: Arc<dyn DecisionLogger>,
    ) -> (Arc<AuthzService>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_policy("authz.rego", POLICY);
        let config = Config::from_bytes(yaml.as_bytes()).unwrap();
        let pipeline = DecisionPipeline::new(
            &config,
            store.clone(),
            Arc::new(RegoEngine::new(store.clone())),
            logger,
        );
        (Arc::new(AuthzService::new(Arc::new(pipeline))), store)
    }

    fn service(yaml: &str) -> Arc<AuthzService> {
        service_with(yaml, Arc::new(TracingDecisionLogger)).0
    }

    fn attributes(method: &str) -> AttributeContext {
        AttributeContext {
            request: Some(AttrRequest {
                http: Some(HttpRequest {
                    method: method.to_string(),
                    path: "/people".to_string(),
                    headers: HashMap::from([("host".to_string(), "example.com".to_string())]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("5u"), Some(Duration::from_micros(5)));
        assert_eq!(parse_grpc_timeout("m"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("1234567890S"), None);
    }

    #[test]
    fn test_deadline_from_metadata() {
        let mut metadata = MetadataMap::new();
        assert!(grpc_deadline(&metadata).is_none());

        metadata.insert("grpc-timeout", "5S".parse().unwrap());
        let deadline = grpc_deadline(&metadata).unwrap();
        assert!(deadline > Instant::now());
    }

    #[tokio::test]
    async fn test_v3_check() {
        let svc = service("");

        let resp = Authorization::check(
            svc.as_ref(),
            Request::new(CheckRequest {
                attributes: Some(attributes("GET")),
            }),
        )
        .await
        .unwrap()
        .into_inner();
        assert_eq!(resp.status.unwrap().code, Code::Ok as i32);

        let resp = Authorization::check(
            svc.as_ref(),
            Request::new(CheckRequest {
                attributes: Some(attributes("DELETE")),
            }),
        )
        .await
        .unwrap()
        .into_inner();
        assert_eq!(resp.status.unwrap().code, Code::PermissionDenied as i32);
    }

    #[tokio::test]
    async fn test_v2_check_delegates_and_downgrades() {
        let v2_svc = AuthzServiceV2::new(service("path: envoy/authz/result"));

        let resp = v2::authorization_server::Authorization::check(
            &v2_svc,
            Request::new(v2::CheckRequest {
                attributes: Some(attributes("GET")),
            }),
        )
        .await
        .unwrap()
        .into_inner();

        assert_eq!(resp.status.unwrap().code, Code::Ok as i32);
        match resp.http_response {
            Some(v2::check_response::HttpResponse::OkResponse(ok)) => {
                assert_eq!(ok.headers.len(), 1);
                assert_eq!(ok.headers[0].header.as_ref().unwrap().key, "x-ext-auth-allow");
            }
            other => panic!("expected ok response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_errors_become_grpc_status() {
        let svc = service("path: envoy/authz/missing");

        let status = Authorization::check(
            svc.as_ref(),
            Request::new(CheckRequest {
                attributes: Some(attributes("GET")),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("undefined decision"));
    }

    #[tokio::test]
    async fn test_cancelled_call_still_finalizes() {
        let logger = Arc::new(SlowLogger {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let (svc, store) = service_with("", logger.clone());

        let call = Authorization::check(
            svc.as_ref(),
            Request::new(CheckRequest {
                attributes: Some(attributes("GET")),
            }),
        );
        let outcome = tokio::time::timeout(Duration::from_millis(20), call).await;
        assert!(outcome.is_err(), "call should still be in flight");

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.commits() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(logger.entries.lock().len(), 1);
        assert_eq!(store.open_transactions(), 0);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_v2_carries_logging_failure_status() {
        let logger = Arc::new(SlowLogger {
            fail: true,
            ..Default::default()
        });
        let (svc, _store) = service_with("", logger);
        let v2_svc = AuthzServiceV2::new(svc);

        let resp = v2::authorization_server::Authorization::check(
            &v2_svc,
            Request::new(v2::CheckRequest {
                attributes: Some(attributes("GET")),
            }),
        )
        .await
        .unwrap()
        .into_inner();

        let status = resp.status.unwrap();
        assert_eq!(status.code, Code::Unknown as i32);
        assert_eq!(status.message, "decision logging failed: audit sink unavailable");
    }
}
