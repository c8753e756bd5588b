use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which step of a session is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Init,
    Run,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Init => "init",
            StepKind::Run => "run",
        }
    }
}

#[derive(Debug)]
pub(crate) struct ExecutorMetrics {
    item: Arc<str>,
    step: StepKind,
}

impl ExecutorMetrics {
    pub(crate) fn new(item: &str, step: StepKind) -> Arc<Self> {
        Arc::new(Self {
            item: Arc::from(item),
            step,
        })
    }

    fn item(&self) -> &str {
        self.item.as_ref()
    }

    pub(crate) fn track_node(self: &Arc<Self>, node: &str) -> NodeRunGuard {
        let item_label = self.item().to_string();
        let node_label = node.to_string();
        metrics::gauge!(
            "cluster.executor.active_nodes",
            "item" => item_label,
            "node" => node_label,
            "step" => self.step.as_str()
        )
        .increment(1.0);
        NodeRunGuard {
            metrics: Arc::clone(self),
            node: node.to_string(),
            start: Instant::now(),
        }
    }

    pub(crate) fn record_node_error(self: &Arc<Self>, node: &str, error_kind: &str) {
        let item_label = self.item().to_string();
        let node_label = node.to_string();
        let error_label = error_kind.to_string();
        metrics::counter!(
            "cluster.executor.node_errors_total",
            "item" => item_label,
            "node" => node_label,
            "step" => self.step.as_str(),
            "error_kind" => error_label
        )
        .increment(1);
    }

    pub(crate) fn record_step(self: &Arc<Self>, elapsed: Duration, outcome: &'static str) {
        let item_label = self.item().to_string();
        metrics::histogram!(
            "cluster.executor.step_latency_ms",
            "item" => item_label.clone(),
            "step" => self.step.as_str(),
            "outcome" => outcome
        )
        .record(elapsed.as_secs_f64() * 1_000.0);
        metrics::counter!(
            "cluster.executor.steps_total",
            "item" => item_label,
            "step" => self.step.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Publishes node latency and decrements the active gauge when dropped, so a
/// kernel abandoned mid-flight still balances the gauge.
pub(crate) struct NodeRunGuard {
    metrics: Arc<ExecutorMetrics>,
    node: String,
    start: Instant,
}

impl Drop for NodeRunGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64() * 1_000.0;
        let item_label = self.metrics.item().to_string();
        let node_label = self.node.clone();
        let step_label = self.metrics.step.as_str();
        metrics::histogram!(
            "cluster.executor.node_latency_ms",
            "item" => item_label.clone(),
            "node" => node_label.clone(),
            "step" => step_label
        )
        .record(elapsed);
        metrics::gauge!(
            "cluster.executor.active_nodes",
            "item" => item_label,
            "node" => node_label,
            "step" => step_label
        )
        .decrement(1.0);
    }
}
