//! Envoy external authorization backed by Rego policies
//!
//! Answers Envoy `Authorization/Check` calls (v2 and v3) by evaluating a
//! configured policy entry point against the request, writing one audit
//! entry per call and shaping the decision into the proxy's response.

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod decision_log;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod input;
pub mod lifecycle;
pub mod listener;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod reflection;
pub mod response;
pub mod server;
pub mod shim;
pub mod store;
pub mod telemetry;
pub mod watcher;
pub mod wkt;

pub use config::{Config, ResolvedConfig};
pub use decision_log::{DecisionLogEntry, DecisionLogger, TracingDecisionLogger};
pub use error::{ExtAuthzError, Result};
pub use lifecycle::{ExtAuthzPlugin, Readiness, ServerHandle};
pub use pipeline::DecisionPipeline;
pub use store::MemoryStore;
