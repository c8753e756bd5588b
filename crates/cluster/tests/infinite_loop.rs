//! Runs in its own binary: the spinning worker outlives the cluster and is only
//! reclaimed when the process exits.

use std::time::{Duration, Instant};

use anyhow::Result;
use cluster::{Cluster, ClusterConfig, ClusterState};
use testing_harness_graphs::{infinite_loop_graph, init_test_tracing};

#[tokio::test]
async fn infinite_loop_wedges_the_cluster() -> Result<()> {
    init_test_tracing();
    let config = ClusterConfig::new(Duration::from_millis(300), 1, 0)
        .with_shutdown_grace(Duration::from_millis(100));
    let mut cluster = Cluster::provisioned(config)?;
    let item = infinite_loop_graph()?;
    cluster.initialize(item.clone()).await?;

    let started = Instant::now();
    let err = cluster
        .run(&item.graph, &item.feeds, &item.fetches)
        .await
        .expect_err("loop never exits");
    assert!(err.is_deadline_exceeded(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(cluster.inflight_workers(), 1);

    // The spinning worker from the first call does not block a second call.
    let started = Instant::now();
    let err = cluster
        .run(&item.graph, &item.feeds, &item.fetches)
        .await
        .expect_err("loop never exits");
    assert!(err.is_deadline_exceeded(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(cluster.inflight_workers(), 2);

    let started = Instant::now();
    let err = cluster.shutdown().await.expect_err("worker cannot drain");
    assert!(err.is_unavailable(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(cluster.state(), ClusterState::Shutdown { wedged: true });

    let again = cluster.shutdown().await.expect_err("still wedged");
    assert_eq!(again.to_string(), err.to_string());
    assert!(cluster.run_item().await.expect_err("wedged").is_unavailable());
    Ok(())
}
