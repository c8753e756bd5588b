use std::time::Duration;

use crate::error::ClusterError;

/// Lifecycle metrics for one cluster; `cluster` labels every series.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClusterMetrics {
    cluster: String,
}

impl ClusterMetrics {
    pub(crate) fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// Latency and outcome of an `initialize` or `run` call.
    pub(crate) fn record_call<T>(
        &self,
        operation: &'static str,
        elapsed: Duration,
        result: &Result<T, ClusterError>,
    ) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        metrics::histogram!(
            "cluster.run.latency_ms",
            "cluster" => self.cluster.clone(),
            "operation" => operation,
            "outcome" => outcome
        )
        .record(elapsed.as_secs_f64() * 1_000.0);
        if let Err(err) = result {
            metrics::counter!(
                "cluster.run.errors_total",
                "cluster" => self.cluster.clone(),
                "operation" => operation,
                "error_kind" => err.kind().as_str()
            )
            .increment(1);
        }
    }

    pub(crate) fn record_deadline_exceeded(&self, operation: &'static str) {
        metrics::counter!(
            "cluster.run.deadline_exceeded_total",
            "cluster" => self.cluster.clone(),
            "operation" => operation
        )
        .increment(1);
    }

    pub(crate) fn set_inflight_workers(&self, count: usize) {
        metrics::gauge!(
            "cluster.workers.in_flight",
            "cluster" => self.cluster.clone()
        )
        .set(count as f64);
    }

    pub(crate) fn record_shutdown(&self, wedged: bool) {
        metrics::counter!(
            "cluster.shutdown_total",
            "cluster" => self.cluster.clone(),
            "wedged" => if wedged { "true" } else { "false" }
        )
        .increment(1);
    }
}
