//! Prometheus metrics for the check handler

use std::time::{Duration, Instant};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Name of the check latency histogram
pub const REQUEST_DURATION_METRIC: &str = "grpc_request_duration_seconds";

/// Bucket bounds of the check latency histogram, in seconds
pub const REQUEST_DURATION_BUCKETS: [f64; 11] = [
    1e-6, 5e-6, 1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 3e-3, 5e-3, 0.1, 1.0,
];

/// Label value used for the v2 and v3 check handlers
pub const CHECK_HANDLER: &str = "check";

/// Labels of the latency histogram
#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct HandlerLabels {
    /// gRPC handler name
    pub handler: String,
}

/// Check handler metrics
#[derive(Debug, Clone)]
pub struct AuthzMetrics {
    request_duration: Family<HandlerLabels, Histogram>,
}

impl AuthzMetrics {
    /// Create the metrics and register them
    pub fn new(registry: &mut Registry) -> Self {
        let request_duration = Family::<HandlerLabels, Histogram>::new_with_constructor(
            duration_histogram as fn() -> Histogram,
        );
        registry.register(
            REQUEST_DURATION_METRIC,
            "A histogram of duration for requests",
            request_duration.clone(),
        );
        Self { request_duration }
    }

    /// Record the wall-clock time of one check call
    pub fn observe_check(&self, elapsed: Duration) {
        self.request_duration
            .get_or_create(&HandlerLabels {
                handler: CHECK_HANDLER.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }
}

fn duration_histogram() -> Histogram {
    Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied())
}

/// Render a registry in the Prometheus text format
pub fn encode(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    prometheus_client::encoding::text::encode(&mut out, registry)?;
    Ok(out)
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_latency_is_exported() {
        let mut registry = Registry::default();
        let metrics = AuthzMetrics::new(&mut registry);

        metrics.observe_check(Duration::from_micros(250));
        metrics.observe_check(Duration::from_millis(2));

        let text = encode(&registry).unwrap();
        assert!(text.contains("grpc_request_duration_seconds_count{handler=\"check\"} 2"));
        assert!(text.contains("le=\"0.003\""));
        assert!(text.contains("A histogram of duration for requests"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
