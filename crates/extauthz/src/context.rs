//! Per-call evaluation context

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// Wall time spent in the check handler
pub const TIMER_SERVER_HANDLER: &str = "timer_server_handler_ns";
/// Time spent building and converting the policy input
pub const TIMER_INPUT_PARSE: &str = "timer_rego_input_parse_ns";
/// Time spent evaluating the entry point
pub const TIMER_QUERY_EVAL: &str = "timer_rego_query_eval_ns";

/// Source of decision ids
pub trait DecisionIdGenerator: Send + Sync {
    /// Produce a new, unique decision id
    fn next_id(&self) -> Result<String>;
}

/// Random UUID v4 decision ids
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl DecisionIdGenerator for UuidGenerator {
    fn next_id(&self) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// Named timers collected during one call
#[derive(Debug, Default, Clone)]
pub struct EvalMetrics {
    running: BTreeMap<String, Instant>,
    recorded: BTreeMap<String, Duration>,
}

impl EvalMetrics {
    /// Start (or restart) a timer
    pub fn start(&mut self, name: &str) {
        self.running.insert(name.to_string(), Instant::now());
    }

    /// Stop a running timer and record its duration
    ///
    /// Stopping a timer that is not running is a no-op.
    pub fn stop(&mut self, name: &str) -> Option<Duration> {
        let started = self.running.remove(name)?;
        let elapsed = started.elapsed();
        self.record(name, elapsed);
        Some(elapsed)
    }

    /// Add a duration to a timer
    pub fn record(&mut self, name: &str, elapsed: Duration) {
        *self.recorded.entry(name.to_string()).or_default() += elapsed;
    }

    /// Stop every timer that is still running
    pub fn stop_all(&mut self) {
        let names: Vec<String> = self.running.keys().cloned().collect();
        for name in names {
            self.stop(&name);
        }
    }

    /// Recorded timers in nanoseconds
    pub fn all(&self) -> BTreeMap<String, u64> {
        self.recorded
            .iter()
            .map(|(k, v)| (k.clone(), v.as_nanos() as u64))
            .collect()
    }
}

/// State owned by exactly one in-flight check call
#[derive(Debug)]
pub struct EvalContext {
    /// Unique id reported in the decision log
    pub decision_id: String,
    /// Id of the store transaction, once acquired
    pub txn_id: Option<u64>,
    /// When the call started
    pub started_at: DateTime<Utc>,
    /// Raw decision value, once evaluated
    pub decision: Option<Value>,
    /// Per-call timers
    pub metrics: EvalMetrics,
    /// Non-deterministic builtin results captured during evaluation
    pub nd_builtin_cache: Option<Value>,
}

impl EvalContext {
    /// Start a context with a fresh decision id
    pub fn start(ids: &dyn DecisionIdGenerator) -> Result<Self> {
        let mut metrics = EvalMetrics::default();
        metrics.start(TIMER_SERVER_HANDLER);
        Ok(Self {
            decision_id: ids.next_id()?,
            txn_id: None,
            started_at: Utc::now(),
            decision: None,
            metrics,
            nd_builtin_cache: None,
        })
    }
}
