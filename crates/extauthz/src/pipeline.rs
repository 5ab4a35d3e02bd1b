//! Per-call decision pipeline
//!
//! Each check call runs through the same sequence:
//!
//! ```text
//! start context ─► open transaction ─► deadline check ─► build input
//!     ─► convert input ─► evaluate ─► shape response ─► dry-run
//!     ─► finalize (log, close, status override) ─► latency metric
//! ```
//!
//! Any step after the transaction is opened may fail; the failure is carried
//! to a single `finalize` call that consumes the evaluation context, so the
//! audit entry and transaction close happen exactly once per call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use envoy_types::ext_authz::v3::pb::{CheckRequest, CheckResponse};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use prost_reflect::DescriptorPool;
use serde_json::Value;
use tokio::time::Instant;
use tonic::Code;
use tracing::{debug, error, instrument, warn, Span};

use crate::config::ResolvedConfig;
use crate::context::{DecisionIdGenerator, EvalContext, UuidGenerator, TIMER_INPUT_PARSE};
use crate::decision_log::{DecisionLogEntry, DecisionLogger};
use crate::engine::{BuiltinCache, InputValue, PolicyEngine, PreparedQueryCache};
use crate::error::{ExtAuthzError, Result};
use crate::input::{request_to_input, ApiVersion};
use crate::metrics::{AuthzMetrics, Timer};
use crate::query::EntryPoint;
use crate::response::{apply_dry_run, rpc_status, shape_response, Decision};
use crate::store::{Store, Transaction};

/// Outcome of the fallible part of a call
struct Stage {
    input: Option<Value>,
    result: Result<CheckResponse>,
}

/// What finalization leaves behind for the caller
struct Finalized {
    status_override: Option<RpcStatus>,
    decision: Option<Value>,
    metrics: BTreeMap<String, u64>,
    txn_id: Option<u64>,
}

/// Orchestrates one authorization decision per check call
pub struct DecisionPipeline {
    store: Arc<dyn Store>,
    engine: Arc<dyn PolicyEngine>,
    logger: Arc<dyn DecisionLogger>,
    ids: Arc<dyn DecisionIdGenerator>,
    prepared: Arc<PreparedQueryCache>,
    builtin_cache: Arc<BuiltinCache>,
    metrics: Option<AuthzMetrics>,
    entry_point: EntryPoint,
    path: String,
    query: String,
    dry_run: bool,
    skip_body_parse: bool,
    descriptors: Option<DescriptorPool>,
}

impl DecisionPipeline {
    /// Create a pipeline for a resolved configuration
    pub fn new(
        config: &ResolvedConfig,
        store: Arc<dyn Store>,
        engine: Arc<dyn PolicyEngine>,
        logger: Arc<dyn DecisionLogger>,
    ) -> Self {
        Self {
            store,
            engine,
            logger,
            ids: Arc::new(UuidGenerator),
            prepared: Arc::new(PreparedQueryCache::new()),
            builtin_cache: Arc::new(BuiltinCache::default()),
            metrics: None,
            entry_point: config.entry_point.clone(),
            path: config.config.path.clone(),
            query: config.config.query.clone(),
            dry_run: config.config.dry_run,
            skip_body_parse: config.config.skip_request_body_parse,
            descriptors: config.descriptors.clone(),
        }
    }

    /// Use a different decision id source
    pub fn with_id_generator(mut self, ids: Arc<dyn DecisionIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Record per-call latency
    pub fn with_metrics(mut self, metrics: AuthzMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share a builtin result cache across pipelines
    pub fn with_builtin_cache(mut self, cache: Arc<BuiltinCache>) -> Self {
        self.builtin_cache = cache;
        self
    }

    /// Compiled entry point cache; reset it when policies change
    pub fn prepared_cache(&self) -> Arc<PreparedQueryCache> {
        self.prepared.clone()
    }

    /// Entry point evaluated for every call
    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry_point
    }

    /// Decide one check call
    ///
    /// `deadline` is the caller's deadline, if it sent one. Errors before a
    /// transaction is open are returned without an audit entry.
    #[instrument(skip_all, fields(decision_id = tracing::field::Empty, version = version.as_str()))]
    pub async fn check(
        &self,
        request: &CheckRequest,
        version: ApiVersion,
        deadline: Option<Instant>,
    ) -> Result<CheckResponse> {
        let timer = Timer::start();

        let mut ctx = EvalContext::start(self.ids.as_ref()).map_err(|e| {
            error!(error = %e, "Unable to start new evaluation.");
            e
        })?;
        Span::current().record("decision_id", ctx.decision_id.as_str());

        let txn = self.store.new_transaction().await.map_err(|e| {
            error!(error = %e, "Unable to start new storage transaction.");
            e
        })?;
        ctx.txn_id = Some(txn.id());

        let mut input = None;
        let result = self
            .evaluate(&mut ctx, &txn, request, version, deadline, &mut input)
            .await;
        let mut stage = Stage { input, result };

        if self.dry_run {
            if let Ok(resp) = stage.result.as_mut() {
                apply_dry_run(resp);
            }
        }

        let finalized = self.finalize(ctx, txn, &stage).await;

        let mut result = stage.result;
        if let (Ok(resp), Some(status)) = (result.as_mut(), finalized.status_override) {
            resp.status = Some(status);
        }

        let elapsed = timer.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_check(elapsed);
        }

        debug!(
            query = %self.entry_point,
            dry_run = self.dry_run,
            decision = ?finalized.decision,
            error = ?result.as_ref().err().map(ToString::to_string),
            txn = ?finalized.txn_id,
            metrics = ?finalized.metrics,
            total_decision_time = ?elapsed,
            "Returning policy decision."
        );

        result
    }

    async fn evaluate(
        &self,
        ctx: &mut EvalContext,
        txn: &Transaction,
        request: &CheckRequest,
        version: ApiVersion,
        deadline: Option<Instant>,
        input: &mut Option<Value>,
    ) -> Result<CheckResponse> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ExtAuthzError::timeout("context deadline exceeded"));
        }

        ctx.metrics.start(TIMER_INPUT_PARSE);
        let doc = input.insert(request_to_input(
            request,
            version,
            self.descriptors.as_ref(),
            self.skip_body_parse,
        )?);
        let value = InputValue::from_document(doc)?;
        ctx.metrics.stop(TIMER_INPUT_PARSE);

        let prepared = self
            .prepared
            .get_or_compile(|| self.engine.prepare(&self.entry_point))
            .await?;
        let evaluation = prepared.eval(&value, txn, &self.builtin_cache).await?;

        for (name, nanos) in evaluation.metrics {
            ctx.metrics.record(&name, Duration::from_nanos(nanos));
        }
        ctx.nd_builtin_cache = evaluation.nd_builtin_cache;

        let decision = evaluation
            .decision
            .ok_or_else(|| ExtAuthzError::evaluation("undefined decision"))?;
        ctx.decision = Some(decision.clone());

        shape_response(&Decision::from(decision))
    }

    async fn finalize(&self, mut ctx: EvalContext, txn: Transaction, stage: &Stage) -> Finalized {
        ctx.metrics.stop_all();
        let metrics = ctx.metrics.all();
        let error = stage.result.as_ref().err();

        let entry = DecisionLogEntry {
            decision_id: ctx.decision_id.clone(),
            timestamp: ctx.started_at,
            path: (!self.path.is_empty()).then(|| self.path.clone()),
            query: (!self.query.is_empty()).then(|| self.query.clone()),
            input: stage.input.clone(),
            result: ctx.decision.clone(),
            error: error.map(ToString::to_string),
            txn_id: ctx.txn_id,
            metrics: metrics.clone(),
            nd_builtin_cache: ctx.nd_builtin_cache.take(),
        };
        let logged = self.logger.log(&entry).await;

        let abort = error.is_some_and(ExtAuthzError::aborts_transaction);
        if let Err(e) = self.store.close(txn, abort).await {
            warn!(error = %e, txn = ?ctx.txn_id, "Failed to close storage transaction");
        }

        let status_override = logged.err().map(|e| {
            error!(decision_id = %ctx.decision_id, error = %e, "Failed to log decision");
            rpc_status(Code::Unknown, &e.to_string())
        });

        Finalized {
            status_override,
            decision: ctx.decision,
            metrics,
            txn_id: ctx.txn_id,
        }
    }
}
