//! Prometheus metrics for the cio-agent
//!
//! Provides metrics for monitoring block-device operations, backend health,
//! and agent performance.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total block-device operations by type and status
    pub const DEVICE_OPERATIONS_TOTAL: &str = "cio_agent_operations_total";
    /// Histogram: Duration of block-device operations in seconds
    pub const DEVICE_OPERATION_DURATION_SECONDS: &str = "cio_agent_operation_duration_seconds";
    /// Gauge: Number of volumes belonging to this cluster
    pub const CLUSTER_VOLUMES_TOTAL: &str = "cio_agent_cluster_volumes_total";
    /// Counter: Number of rate-limited operations
    pub const RATE_LIMITED_TOTAL: &str = "cio_agent_rate_limited_total";
    /// Gauge: Current concurrent operations in progress
    pub const CONCURRENT_OPS: &str = "cio_agent_concurrent_ops";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a block-device operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::DEVICE_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::DEVICE_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Set the number of volumes owned by this cluster
pub fn set_cluster_volumes(count: usize) {
    gauge!(names::CLUSTER_VOLUMES_TOTAL).set(count as f64);
}

/// Record a rate-limited operation
pub fn record_rate_limited(operation: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Set the current number of concurrent operations
pub fn set_concurrent_ops(count: usize) {
    gauge!(names::CONCURRENT_OPS).set(count as f64);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }
}
