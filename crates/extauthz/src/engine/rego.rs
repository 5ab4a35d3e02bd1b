//! Rego policy engine backed by regorus

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{BuiltinCache, Evaluation, InputValue, PolicyEngine, PreparedQuery};
use crate::context::TIMER_QUERY_EVAL;
use crate::error::{ExtAuthzError, Result};
use crate::query::EntryPoint;
use crate::store::{MemoryStore, Transaction};

/// Engine that compiles the policy modules held by a [`MemoryStore`]
pub struct RegoEngine {
    store: Arc<MemoryStore>,
}

impl RegoEngine {
    /// Create an engine reading modules from the store
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Parse every module into a fresh interpreter
    pub fn compile(modules: &BTreeMap<String, String>) -> Result<regorus::Engine> {
        let mut engine = regorus::Engine::new();
        for (id, source) in modules {
            engine
                .add_policy(id.clone(), source.clone())
                .map(|_| ())
                .map_err(|e| ExtAuthzError::evaluation(format!("{}: {}", id, e)))?;
        }
        Ok(engine)
    }

    /// Check that `query` compiles against the loaded modules
    ///
    /// Runs the query once over an empty input and data document; the
    /// result is discarded and only errors are kept.
    pub fn validate(engine: &regorus::Engine, query: &str) -> Result<()> {
        let mut scratch = engine.clone();
        scratch.set_input(regorus::Value::new_object());
        scratch
            .eval_query(query.to_string(), false)
            .map(|_| ())
            .map_err(|e| ExtAuthzError::evaluation(format!("{}: {}", query, e)))
    }
}

#[async_trait]
impl PolicyEngine for RegoEngine {
    #[instrument(skip(self), fields(query = %entry_point))]
    async fn prepare(&self, entry_point: &EntryPoint) -> Result<Arc<dyn PreparedQuery>> {
        let modules = self.store.modules();
        let generation = self.store.generation();
        let query = entry_point.to_string();
        let engine = {
            let query = query.clone();
            tokio::task::spawn_blocking(move || {
                let engine = RegoEngine::compile(&modules)?;
                RegoEngine::validate(&engine, &query)?;
                Ok::<_, ExtAuthzError>(engine)
            })
            .await
            .map_err(|e| ExtAuthzError::evaluation(e.to_string()))??
        };

        debug!(generation, "Prepared query compiled");
        Ok(Arc::new(RegoQuery {
            engine: Mutex::new(engine),
            query,
        }))
    }
}

struct RegoQuery {
    engine: Mutex<regorus::Engine>,
    query: String,
}

#[async_trait]
impl PreparedQuery for RegoQuery {
    async fn eval(
        &self,
        input: &InputValue,
        txn: &Transaction,
        _builtin_cache: &BuiltinCache,
    ) -> Result<Evaluation> {
        let mut engine = self.engine.lock().clone();
        let data = to_rego(txn.data())?;
        let input = input.as_value().clone();
        let query = self.query.clone();

        let (decision, elapsed) = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let decision = evaluate(&mut engine, data, input, query);
            (decision, started.elapsed())
        })
        .await
        .map_err(|e| ExtAuthzError::evaluation(e.to_string()))?;

        let mut metrics = BTreeMap::new();
        metrics.insert(TIMER_QUERY_EVAL.to_string(), elapsed.as_nanos() as u64);

        Ok(Evaluation {
            decision: decision?,
            metrics,
            nd_builtin_cache: None,
        })
    }
}

fn to_rego(value: &Value) -> Result<regorus::Value> {
    let json =
        serde_json::to_string(value).map_err(|e| ExtAuthzError::evaluation(e.to_string()))?;
    regorus::Value::from_json_str(&json).map_err(|e| ExtAuthzError::evaluation(e.to_string()))
}

fn from_rego(value: &regorus::Value) -> Result<Value> {
    let json = value
        .to_json_str()
        .map_err(|e| ExtAuthzError::evaluation(e.to_string()))?;
    serde_json::from_str(&json).map_err(|e| ExtAuthzError::evaluation(e.to_string()))
}

fn evaluate(
    engine: &mut regorus::Engine,
    data: regorus::Value,
    input: regorus::Value,
    query: String,
) -> Result<Option<Value>> {
    engine
        .add_data(data)
        .map_err(|e| ExtAuthzError::evaluation(e.to_string()))?;
    engine.set_input(input);

    let results = engine
        .eval_query(query, false)
        .map_err(|e| ExtAuthzError::evaluation(e.to_string()))?;

    let Some(value) = results
        .result
        .first()
        .and_then(|r| r.expressions.first())
        .map(|e| &e.value)
    else {
        return Ok(None);
    };
    if matches!(value, regorus::Value::Undefined) {
        return Ok(None);
    }
    from_rego(value).map(Some)
}
