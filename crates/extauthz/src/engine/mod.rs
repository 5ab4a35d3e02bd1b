//! Policy evaluation contract
//!
//! The decision pipeline compiles the entry point once through a
//! [`PolicyEngine`] and evaluates the resulting [`PreparedQuery`] for every
//! call. Compiled queries are cached in a [`PreparedQueryCache`] that is
//! reset whenever the policy modules change.

mod cache;
mod rego;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ExtAuthzError, Result};
use crate::query::EntryPoint;
use crate::store::Transaction;

pub use cache::{BuiltinCache, PreparedQueryCache};
pub use rego::RegoEngine;

/// Policy input converted into the engine's value representation
#[derive(Debug, Clone)]
pub struct InputValue(regorus::Value);

impl InputValue {
    /// Convert an input document
    pub fn from_document(doc: &Value) -> Result<Self> {
        let json = serde_json::to_string(doc)
            .map_err(|e| ExtAuthzError::value_conversion(e.to_string()))?;
        regorus::Value::from_json_str(&json)
            .map(Self)
            .map_err(|e| ExtAuthzError::value_conversion(e.to_string()))
    }

    /// Engine representation of the input
    pub fn as_value(&self) -> &regorus::Value {
        &self.0
    }
}

/// Result of evaluating a prepared query
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Value of the entry point, `None` when undefined
    pub decision: Option<Value>,
    /// Engine-specific timers in nanoseconds
    pub metrics: BTreeMap<String, u64>,
    /// Snapshot of non-deterministic builtin results, when recorded
    pub nd_builtin_cache: Option<Value>,
}

/// Compiles entry points against the current policy set
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Compile the entry point into an evaluable query
    async fn prepare(&self, entry_point: &EntryPoint) -> Result<Arc<dyn PreparedQuery>>;
}

/// An entry point compiled against one version of the policy set
#[async_trait]
pub trait PreparedQuery: Send + Sync {
    /// Evaluate against an input inside a transaction
    async fn eval(
        &self,
        input: &InputValue,
        txn: &Transaction,
        builtin_cache: &BuiltinCache,
    ) -> Result<Evaluation>;
}
