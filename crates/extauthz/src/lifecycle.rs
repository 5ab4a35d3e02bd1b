//! Plugin lifecycle
//!
//! Owns the gRPC server for both protocol versions, the readiness state and
//! the link between policy recompilation and the prepared-query cache.

use std::net::SocketAddr;
use std::sync::Arc;

use envoy_types::ext_authz::v3::pb::AuthorizationServer;
use extauthz_proto::v2::authorization_server::AuthorizationServer as AuthorizationServerV2;
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tracing::{debug, error, info};

use crate::config::ResolvedConfig;
use crate::decision_log::DecisionLogger;
use crate::engine::{BuiltinCache, RegoEngine};
use crate::error::{ExtAuthzError, Result};
use crate::listener::{BoundListener, ListenAddr};
use crate::metrics::AuthzMetrics;
use crate::pipeline::DecisionPipeline;
use crate::reflection::reflection_service;
use crate::server::{AuthzService, AuthzServiceV2};
use crate::store::MemoryStore;

/// Readiness reported to health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Not serving
    NotReady,
    /// Listener bound and serving
    Ok,
}

/// A running server
#[derive(Debug)]
pub struct ServerHandle {
    /// Bound TCP address, if listening on TCP
    pub tcp_addr: Option<SocketAddr>,
    /// Serve task; completes after `stop` or a listener failure
    pub task: JoinHandle<Result<()>>,
}

/// The external authorization plugin
pub struct ExtAuthzPlugin {
    config: ResolvedConfig,
    service: Arc<AuthzService>,
    readiness: Arc<watch::Sender<Readiness>>,
    shutdown: watch::Sender<bool>,
}

impl ExtAuthzPlugin {
    /// Build the plugin over a policy store
    ///
    /// Starts `NotReady`. When performance metrics are enabled the latency
    /// histogram is registered in `registry`.
    pub fn new(
        config: ResolvedConfig,
        store: Arc<MemoryStore>,
        logger: Arc<dyn DecisionLogger>,
        registry: &mut Registry,
    ) -> Self {
        let engine = Arc::new(RegoEngine::new(store.clone()));
        let mut pipeline = DecisionPipeline::new(&config, store.clone(), engine, logger)
            .with_builtin_cache(Arc::new(BuiltinCache::default()));
        if config.config.enable_performance_metrics {
            pipeline = pipeline.with_metrics(AuthzMetrics::new(registry));
        }

        let cache = pipeline.prepared_cache();
        store.register_trigger(Box::new(move |generation| {
            debug!(generation, "Policies recompiled, resetting prepared query");
            cache.invalidate();
        }));

        let (readiness, _) = watch::channel(Readiness::NotReady);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            service: Arc::new(AuthzService::new(Arc::new(pipeline))),
            readiness: Arc::new(readiness),
            shutdown,
        }
    }

    /// Current readiness
    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Subscribe to readiness changes
    pub fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    /// The v3 service, for embedding in another server
    pub fn service(&self) -> Arc<AuthzService> {
        self.service.clone()
    }

    /// Bind the configured address and serve in the background
    pub async fn start(&self) -> Result<ServerHandle> {
        let addr = ListenAddr::parse(&self.config.config.addr).map_err(|e| {
            self.set_readiness(Readiness::NotReady);
            e
        })?;

        info!(
            addr = %addr,
            query = %self.config.config.query,
            path = %self.config.config.path,
            dry_run = self.config.config.dry_run,
            enable_reflection = self.config.config.enable_reflection,
            "Starting gRPC server."
        );

        let listener = addr.bind().await.map_err(|e| {
            error!(error = %e, "Unable to create listener.");
            self.set_readiness(Readiness::NotReady);
            e
        })?;
        let tcp_addr = listener.tcp_addr();

        let router = self.router()?;
        self.shutdown.send_replace(false);
        self.set_readiness(Readiness::Ok);

        let readiness = self.readiness.clone();
        let mut stop = self.shutdown.subscribe();
        let signal = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };

        let task = tokio::spawn(async move {
            let served = match listener {
                BoundListener::Tcp(l) => {
                    router
                        .serve_with_incoming_shutdown(TcpListenerStream::new(l), signal)
                        .await
                }
                BoundListener::Unix(l) => {
                    router
                        .serve_with_incoming_shutdown(UnixListenerStream::new(l), signal)
                        .await
                }
            };
            readiness.send_replace(Readiness::NotReady);
            match served {
                Ok(()) => {
                    info!("Listener exited.");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "Listener failed.");
                    Err(ExtAuthzError::listener(e.to_string()))
                }
            }
        });

        Ok(ServerHandle { tcp_addr, task })
    }

    /// Stop serving and mark the plugin not ready
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.set_readiness(Readiness::NotReady);
    }

    fn set_readiness(&self, state: Readiness) {
        self.readiness.send_replace(state);
    }

    fn router(&self) -> Result<tonic::transport::server::Router> {
        let recv = self.config.config.grpc_max_recv_msg_size;
        let send = self.config.config.grpc_max_send_msg_size;

        let v3 = AuthorizationServer::from_arc(self.service.clone())
            .max_decoding_message_size(recv)
            .max_encoding_message_size(send);
        let v2 = AuthorizationServerV2::new(AuthzServiceV2::new(self.service.clone()))
            .max_decoding_message_size(recv)
            .max_encoding_message_size(send);

        let reflection = if self.config.config.enable_reflection {
            Some(reflection_service()?)
        } else {
            None
        };

        Ok(Server::builder()
            .add_service(v2)
            .add_service(v3)
            .add_optional_service(reflection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::decision_log::TracingDecisionLogger;
    use crate::engine::PolicyEngine;

    fn plugin(yaml: &str, store: Arc<MemoryStore>) -> ExtAuthzPlugin {
        let config = Config::from_bytes(yaml.as_bytes()).unwrap();
        ExtAuthzPlugin::new(
            config,
            store,
            Arc::new(TracingDecisionLogger),
            &mut Registry::default(),
        )
    }

    #[tokio::test]
    async fn test_readiness_follows_lifecycle() {
        let p = plugin("addr: 127.0.0.1:0", Arc::new(MemoryStore::new()));
        assert_eq!(p.readiness(), Readiness::NotReady);

        let handle = p.start().await.unwrap();
        assert_eq!(p.readiness(), Readiness::Ok);
        assert!(handle.tcp_addr.is_some());

        p.stop();
        assert_eq!(p.readiness(), Readiness::NotReady);
        handle.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_address_is_fatal() {
        let p = plugin("addr: http://127.0.0.1:0", Arc::new(MemoryStore::new()));
        let err = p.start().await.unwrap_err();
        assert!(matches!(err, ExtAuthzError::Listener { .. }));
        assert_eq!(p.readiness(), Readiness::NotReady);
    }

    #[tokio::test]
    async fn test_policy_change_resets_prepared_query() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_policy("a.rego", "package envoy.authz\n\ndefault allow := true\n");
        let p = plugin("", store.clone());

        let pipeline = p.service().pipeline().clone();
        let engine = RegoEngine::new(store.clone());
        let cache = pipeline.prepared_cache();
        cache
            .get_or_compile(|| engine.prepare(pipeline.entry_point()))
            .await
            .unwrap();
        assert!(cache.is_initialized());

        store.upsert_policy("a.rego", "package envoy.authz\n\ndefault allow := false\n");
        assert!(!cache.is_initialized());
    }
}
