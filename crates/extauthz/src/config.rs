//! Plugin configuration
//!
//! Configuration is read from YAML or JSON with kebab-case keys. Defaults are
//! applied first and user-supplied values are overlaid on top. Validation
//! resolves the entry point once, so nothing is re-parsed per request.

use std::path::Path;

use prost_reflect::DescriptorPool;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExtAuthzError, Result};
use crate::query::EntryPoint;

/// Default listener address
pub const DEFAULT_ADDR: &str = ":9191";
/// Default entry point path
pub const DEFAULT_PATH: &str = "envoy/authz/allow";
/// Default maximum inbound message size (4 MiB, the gRPC default)
pub const DEFAULT_MAX_RECV_MSG_SIZE: usize = 4 * 1024 * 1024;
/// Default maximum outbound message size
pub const DEFAULT_MAX_SEND_MSG_SIZE: usize = i32::MAX as usize;

/// Raw plugin configuration as written by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Listener address (`host:port`, `grpc://`, `unix://`)
    pub addr: String,
    /// Deprecated entry point query; use `path` instead
    pub query: String,
    /// Entry point path under the root document
    pub path: String,
    /// Compute and log decisions but always allow
    pub dry_run: bool,
    /// Register the gRPC reflection service
    pub enable_reflection: bool,
    /// Path to a binary `FileDescriptorSet` for decoding gRPC bodies
    pub proto_descriptor: String,
    /// Maximum inbound message size in bytes
    pub grpc_max_recv_msg_size: usize,
    /// Maximum outbound message size in bytes
    pub grpc_max_send_msg_size: usize,
    /// Do not parse request bodies into the policy input
    pub skip_request_body_parse: bool,
    /// Record per-call latency in a histogram
    pub enable_performance_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            query: String::new(),
            path: String::new(),
            dry_run: false,
            enable_reflection: false,
            proto_descriptor: String::new(),
            grpc_max_recv_msg_size: DEFAULT_MAX_RECV_MSG_SIZE,
            grpc_max_send_msg_size: DEFAULT_MAX_SEND_MSG_SIZE,
            skip_request_body_parse: false,
            enable_performance_metrics: false,
        }
    }
}

/// Validated configuration with the entry point resolved
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Configuration with defaults applied (`path` is filled in when no
    /// query was given)
    pub config: Config,
    /// Compiled entry point reference
    pub entry_point: EntryPoint,
    /// Descriptor registry for decoding gRPC request bodies
    pub descriptors: Option<DescriptorPool>,
}

impl Config {
    /// Parse and validate configuration bytes
    ///
    /// Empty input yields the defaults.
    pub fn from_bytes(bytes: &[u8]) -> Result<ResolvedConfig> {
        let config = if bytes.iter().all(u8::is_ascii_whitespace) {
            Config::default()
        } else {
            serde_yaml::from_slice(bytes)
                .map_err(|e| ExtAuthzError::config(format!("malformed configuration: {}", e)))?
        };
        config.resolve()
    }

    /// Validate the configuration and resolve the entry point
    pub fn resolve(mut self) -> Result<ResolvedConfig> {
        if !self.path.is_empty() && !self.query.is_empty() {
            return Err(ExtAuthzError::config(
                "specify a value for only the \"path\" field",
            ));
        }

        let entry_point = if !self.query.is_empty() {
            EntryPoint::parse(&self.query)?
        } else {
            if self.path.is_empty() {
                self.path = DEFAULT_PATH.to_string();
            }
            let entry_point = EntryPoint::from_path(&self.path);
            // Round-trip through the parser so a bad path fails at load time
            EntryPoint::parse(&entry_point.to_string())?
        };

        let descriptors = if self.proto_descriptor.is_empty() {
            None
        } else {
            Some(load_descriptor_set(Path::new(&self.proto_descriptor))?)
        };

        debug!(entry_point = %entry_point, "Resolved plugin configuration");

        Ok(ResolvedConfig {
            config: self,
            entry_point,
            descriptors,
        })
    }
}

/// Read a binary `FileDescriptorSet` into a descriptor registry
pub fn load_descriptor_set(path: &Path) -> Result<DescriptorPool> {
    let bytes = std::fs::read(path).map_err(|e| {
        ExtAuthzError::config(format!(
            "failed to read proto descriptor {}: {}",
            path.display(),
            e
        ))
    })?;
    DescriptorPool::decode(bytes.as_slice()).map_err(|e| {
        ExtAuthzError::config(format!(
            "failed to parse proto descriptor {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::RefTerm;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let resolved = Config::from_bytes(b"").unwrap();
        assert_eq!(resolved.config.addr, ":9191");
        assert_eq!(resolved.config.path, DEFAULT_PATH);
        assert!(!resolved.config.dry_run);
        assert_eq!(resolved.config.grpc_max_recv_msg_size, 4 * 1024 * 1024);
        assert_eq!(resolved.config.grpc_max_send_msg_size, i32::MAX as usize);
        assert_eq!(resolved.entry_point.to_string(), "data.envoy.authz.allow");
        assert!(resolved.descriptors.is_none());
    }

    #[test]
    fn test_overlay_keeps_unset_defaults() {
        let resolved = Config::from_bytes(
            br#"{"addr": "unix:///tmp/authz.sock", "dry-run": true, "path": "istio/authz/allow"}"#,
        )
        .unwrap();
        assert_eq!(resolved.config.addr, "unix:///tmp/authz.sock");
        assert!(resolved.config.dry_run);
        assert!(!resolved.config.enable_reflection);
        assert_eq!(resolved.config.grpc_max_recv_msg_size, DEFAULT_MAX_RECV_MSG_SIZE);
        assert_eq!(resolved.entry_point.to_string(), "data.istio.authz.allow");
    }

    #[test]
    fn test_yaml_config() {
        let yaml = "addr: 127.0.0.1:9292\nenable-performance-metrics: true\nskip-request-body-parse: true\n";
        let resolved = Config::from_bytes(yaml.as_bytes()).unwrap();
        assert_eq!(resolved.config.addr, "127.0.0.1:9292");
        assert!(resolved.config.enable_performance_metrics);
        assert!(resolved.config.skip_request_body_parse);
    }

    #[test]
    fn test_path_and_query_are_equivalent() {
        let by_path = Config::from_bytes(br#"{"path": "foo/bar"}"#).unwrap();
        let by_query = Config::from_bytes(br#"{"query": "data.foo.bar"}"#).unwrap();
        assert_eq!(by_path.entry_point, by_query.entry_point);
        assert_eq!(by_query.config.path, "");
    }

    #[test]
    fn test_path_segments_may_contain_brackets() {
        let resolved = Config::from_bytes(br#"{"path": "foo/a]b"}"#).unwrap();
        assert_eq!(resolved.entry_point.to_string(), r#"data.foo["a]b"]"#);
        assert_eq!(
            resolved.entry_point.terms()[1],
            RefTerm::Key("a]b".to_string())
        );
    }

    #[test]
    fn test_path_and_query_together_rejected() {
        let err = Config::from_bytes(br#"{"path": "foo/bar", "query": "data.foo.bar"}"#)
            .unwrap_err();
        assert!(matches!(err, ExtAuthzError::Config { .. }));
        assert!(err.to_string().contains("only the \"path\" field"));
    }

    #[test]
    fn test_unparseable_query_rejected() {
        let err = Config::from_bytes(br#"{"query": "data.foo["}"#).unwrap_err();
        assert!(matches!(err, ExtAuthzError::Config { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_bytes(br#"{"adress": ":9000"}"#).is_err());
    }

    #[test]
    fn test_missing_descriptor_is_fatal() {
        let err = Config::from_bytes(br#"{"proto-descriptor": "/does/not/exist.pb"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("failed to read proto descriptor"));
    }

    #[test]
    fn test_garbage_descriptor_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\xff\xff\xff not a descriptor").unwrap();

        let err = load_descriptor_set(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse proto descriptor"));
    }

    #[test]
    fn test_empty_descriptor_set_loads() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let pool = load_descriptor_set(file.path()).unwrap();
        assert_eq!(pool.services().count(), 0);
    }
}
