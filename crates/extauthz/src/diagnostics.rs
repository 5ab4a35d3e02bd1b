//! Diagnostic HTTP endpoints
//!
//! - `GET /health` → 200 while the gRPC listener is serving, 503 otherwise
//! - `GET /metrics` → OpenMetrics text exposition of the registry

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{ExtAuthzError, Result};
use crate::lifecycle::Readiness;
use crate::metrics;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Shared state for the diagnostic handlers
#[derive(Clone)]
pub struct DiagnosticState {
    registry: Arc<Registry>,
    readiness: watch::Receiver<Readiness>,
}

impl DiagnosticState {
    /// Serve `registry` and report `readiness`
    pub fn new(registry: Arc<Registry>, readiness: watch::Receiver<Readiness>) -> Self {
        Self {
            registry,
            readiness,
        }
    }
}

/// Build the diagnostic router
pub fn diagnostic_routes(state: DiagnosticState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

/// Bind the diagnostic address
pub async fn bind_diagnostics(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind diagnostic address");
        ExtAuthzError::listener(format!("unable to bind diagnostic address {}: {}", addr, e))
    })
}

/// Serve the diagnostic endpoints on a bound listener
pub async fn serve_diagnostics(listener: TcpListener, state: DiagnosticState) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Diagnostic server started");
    }

    axum::serve(listener, diagnostic_routes(state))
        .await
        .map_err(|e| {
            error!(error = %e, "Diagnostic server error");
            ExtAuthzError::listener(e.to_string())
        })
}

async fn health(State(state): State<DiagnosticState>) -> (StatusCode, &'static str) {
    match *state.readiness.borrow() {
        Readiness::Ok => (StatusCode::OK, "ok"),
        Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

async fn metrics_text(State(state): State<DiagnosticState>) -> Response {
    match metrics::encode(&state.registry) {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AuthzMetrics;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state(readiness: Readiness) -> (DiagnosticState, watch::Sender<Readiness>) {
        let mut registry = Registry::default();
        AuthzMetrics::new(&mut registry).observe_check(Duration::from_millis(3));
        let (tx, rx) = watch::channel(readiness);
        (DiagnosticState::new(Arc::new(registry), rx), tx)
    }

    #[tokio::test]
    async fn test_health_follows_readiness() {
        let (s, tx) = state(Readiness::NotReady);
        assert_eq!(health(State(s.clone())).await.0, StatusCode::SERVICE_UNAVAILABLE);

        tx.send_replace(Readiness::Ok);
        assert_eq!(health(State(s)).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_taken_port_fails_to_bind() {
        let first = bind_diagnostics("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind_diagnostics(taken).await.unwrap_err();
        assert!(matches!(err, ExtAuthzError::Listener { .. }));
        assert!(err.to_string().contains(&taken.to_string()));
    }

    #[tokio::test]
    async fn test_serves_health_over_http() {
        let listener = bind_diagnostics("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (s, _tx) = state(Readiness::Ok);
        let server = tokio::spawn(serve_diagnostics(listener, s));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");

        server.abort();
    }

    #[tokio::test]
    async fn test_metrics_exposes_histogram() {
        let (s, _tx) = state(Readiness::Ok);
        let resp = metrics_text(State(s)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            OPENMETRICS_CONTENT_TYPE
        );
    }
}
