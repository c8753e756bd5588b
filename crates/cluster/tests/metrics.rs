//! Installs the global metrics recorder, so it lives in its own binary.

use std::time::Duration;

use anyhow::Result;
use cluster::{Cluster, ClusterConfig};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use testing_harness_graphs::{dequeue_only_graph, init_test_tracing};

#[tokio::test]
async fn deadline_overruns_are_counted() -> Result<()> {
    init_test_tracing();
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    metrics::set_global_recorder(recorder).expect("install recorder");

    let mut cluster =
        Cluster::provisioned(ClusterConfig::new(Duration::from_millis(100), 1, 0))?;
    let item = dequeue_only_graph()?;
    cluster.initialize(item.clone()).await?;
    let err = cluster
        .run(&item.graph, &item.feeds, &item.fetches)
        .await
        .expect_err("dequeue blocks");
    assert!(err.is_deadline_exceeded());
    cluster.shutdown().await?;

    let mut overruns = 0;
    let mut run_errors = 0;
    let mut shutdowns = 0;
    for (key, _unit, _desc, value) in snapshotter.snapshot().into_vec() {
        let key = key.key();
        let operation = key
            .labels()
            .find(|label| label.key() == "operation")
            .map(|label| label.value().to_string());
        match (key.name(), value) {
            ("cluster.run.deadline_exceeded_total", DebugValue::Counter(count)) => {
                assert_eq!(operation.as_deref(), Some("run"));
                overruns += count;
            }
            ("cluster.run.errors_total", DebugValue::Counter(count)) => run_errors += count,
            ("cluster.shutdown_total", DebugValue::Counter(count)) => shutdowns += count,
            _ => {}
        }
    }
    assert_eq!(overruns, 1);
    assert_eq!(run_errors, 1);
    assert_eq!(shutdowns, 1);
    Ok(())
}
