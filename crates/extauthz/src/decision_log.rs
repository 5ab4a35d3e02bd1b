//! Decision audit log
//!
//! Exactly one entry is emitted per check call that acquired a
//! transaction, whether the call succeeded or failed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::error::{ExtAuthzError, Result};

/// Tracing target decision entries are emitted on
pub const DECISION_LOG_TARGET: &str = "decision_log";

/// One audited decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionLogEntry {
    /// Unique id of the call
    pub decision_id: String,
    /// When the call started
    pub timestamp: DateTime<Utc>,
    /// Entry point path, set when the entry point was configured by path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Entry point query, set when configured with the deprecated query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Policy input, if it was built
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Raw decision, if evaluation produced one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Terminal error of the call, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Store transaction id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<u64>,
    /// Timers in nanoseconds
    pub metrics: BTreeMap<String, u64>,
    /// Non-deterministic builtin results recorded during evaluation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nd_builtin_cache: Option<Value>,
}

/// Audit sink for decisions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DecisionLogger: Send + Sync {
    /// Record one decision
    async fn log(&self, entry: &DecisionLogEntry) -> Result<()>;
}

/// Writes decisions as structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDecisionLogger;

#[async_trait]
impl DecisionLogger for TracingDecisionLogger {
    async fn log(&self, entry: &DecisionLogEntry) -> Result<()> {
        let json = serde_json::to_string(entry).map_err(|e| ExtAuthzError::logging(e.to_string()))?;
        info!(
            target: DECISION_LOG_TARGET,
            decision_id = %entry.decision_id,
            entry = %json,
            "Decision Log"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> DecisionLogEntry {
        DecisionLogEntry {
            decision_id: "c1f3a3f6-3d1f-4a34-9a8c-6d3c0e6b8b53".to_string(),
            timestamp: Utc::now(),
            path: Some("envoy/authz/allow".to_string()),
            query: None,
            input: Some(json!({"parsed_path": ["api"]})),
            result: Some(json!(false)),
            error: None,
            txn_id: Some(7),
            metrics: BTreeMap::from([("timer_rego_query_eval_ns".to_string(), 1200)]),
            nd_builtin_cache: None,
        }
    }

    #[test]
    fn test_entry_serialization_skips_empty_fields() {
        let json = serde_json::to_value(entry()).unwrap();
        assert_eq!(json["path"], "envoy/authz/allow");
        assert_eq!(json["result"], false);
        assert_eq!(json["txn_id"], 7);
        assert!(json.get("query").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("nd_builtin_cache").is_none());
    }

    #[tokio::test]
    async fn test_tracing_logger_accepts_entries() {
        TracingDecisionLogger.log(&entry()).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_logger_failure() {
        let mut logger = MockDecisionLogger::new();
        logger
            .expect_log()
            .times(1)
            .returning(|_| Err(ExtAuthzError::logging("sink unavailable")));

        let err = logger.log(&entry()).await.unwrap_err();
        assert_eq!(err.to_string(), "decision logging failed: sink unavailable");
    }
}
