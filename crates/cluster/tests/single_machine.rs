use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use cluster::{Cluster, ClusterConfig, ClusterError, ClusterState, ErrorKind, ExecutionReport};
use graph_core::{Feed, GraphBuilder, Shape, Tensor, WorkItem};
use proptest::prelude::*;
use testing_harness_graphs::{
    OPTIMIZATION_GRAPH_OPS, TrivialGraphConfig, TrivialGraphYielder, counting_loop_graph,
    dequeue_only_graph, init_test_tracing, lookup_table_graph, optimization_graph, trivial_graph,
    variable_init_graph,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const NUM_CPUS: u32 = 3;

fn cluster() -> Cluster {
    init_test_tracing();
    Cluster::provisioned(ClusterConfig::new(TIMEOUT, NUM_CPUS, 0)).expect("provision cluster")
}

fn comparable(mut report: ExecutionReport) -> ExecutionReport {
    report.clear_timings();
    report
}

#[tokio::test]
async fn cost_model() -> Result<()> {
    let mut cluster = cluster();
    let config = TrivialGraphConfig::new(4, 1, 10).with_devices(cluster.device_names());
    let item = TrivialGraphYielder::new(config).next_item()?;
    cluster.initialize(item.clone()).await?;

    let started = Instant::now();
    let outcome = cluster.run(&item.graph, &item.feeds, &item.fetches).await?;
    let elapsed = started.elapsed();

    let report = &outcome.report;
    assert!(report.len() >= 4, "only {} records", report.len());
    let user: Vec<_> = report.user_nodes().collect();
    assert_eq!(user.len(), 5);
    for record in user {
        assert_eq!(record.outputs.len(), 1, "{}", record.name);
        let output = &record.outputs[0];
        assert!(output.size_bytes >= 8, "{}", record.name);
        assert_eq!(output.shape, Shape::new(vec![10, 1]), "{}", record.name);
        assert!(
            Duration::from_micros(record.compute_cost_micros) <= elapsed,
            "{} took longer than the run",
            record.name
        );
    }
    let placed = report.record("Layer_1/n_0").expect("stage record");
    assert!(placed.device.ends_with("/device:CPU:1"), "{}", placed.device);
    Ok(())
}

#[tokio::test]
async fn queue_runs_are_reproducible() -> Result<()> {
    let mut cluster = cluster();
    let config = TrivialGraphConfig::new(4, 1, 10)
        .with_queue(true)
        .with_devices(cluster.device_names());
    let item = trivial_graph("queue", &config)?;
    cluster.initialize(item.clone()).await?;

    let first = cluster.run(&item.graph, &item.feeds, &item.fetches).await?;
    let second = cluster.run(&item.graph, &item.feeds, &item.fetches).await?;
    assert!(first.report.contains("queue/enqueue"));
    assert!(first.report.contains("queue/dequeue"));
    assert_eq!(comparable(first.report), comparable(second.report));
    Ok(())
}

#[tokio::test]
async fn optimizer_disabled_reports_every_authored_op() -> Result<()> {
    init_test_tracing();
    let mut cluster = Cluster::new(ClusterConfig::new(TIMEOUT, NUM_CPUS, 0));
    cluster.disable_optimizer(true);
    cluster.provision()?;
    let item = optimization_graph()?;
    cluster.initialize(item.clone()).await?;
    let outcome = cluster.run_item().await?;

    let names: BTreeSet<&str> = outcome.report.user_node_names().into_iter().collect();
    let expected: BTreeSet<&str> = OPTIMIZATION_GRAPH_OPS.into_iter().collect();
    assert_eq!(names, expected);
    Ok(())
}

#[tokio::test]
async fn optimizer_folds_and_prunes() -> Result<()> {
    let mut cluster = cluster();
    let item = optimization_graph()?;
    cluster.initialize(item).await?;
    let outcome = cluster.run_item().await?;

    let names = outcome.report.user_node_names();
    assert!(names.len() < OPTIMIZATION_GRAPH_OPS.len(), "nothing optimized: {names:?}");
    assert!(names.contains(&"assert_valid"));
    assert!(!names.contains(&"zero"));
    Ok(())
}

#[tokio::test]
async fn feeding_a_folded_value_needs_the_optimizer_off() -> Result<()> {
    let mut builder = GraphBuilder::new();
    builder.op("c", "Const").attr("value", Tensor::scalar_f32(2.0)).finish()?;
    builder.op("y", "Square").input("c").finish()?;
    let item = WorkItem::new("folded", builder.build()).with_fetch("y");
    let feeds = [Feed::new("c", Tensor::scalar_f32(3.0))];

    let mut optimized = cluster();
    optimized.initialize(item.clone()).await?;
    let err = optimized
        .run(&item.graph, &feeds, &item.fetches)
        .await
        .expect_err("c was folded into y");
    assert_eq!(err.kind(), ErrorKind::Configuration, "{err}");
    let outcome = optimized.run_item().await?;
    assert_eq!(outcome.value("y"), Some(&Tensor::scalar_f32(4.0)));

    let mut plain = cluster();
    plain.disable_optimizer(true);
    plain.initialize(item.clone()).await?;
    let outcome = plain.run(&item.graph, &feeds, &item.fetches).await?;
    assert_eq!(outcome.value("y"), Some(&Tensor::scalar_f32(9.0)));
    Ok(())
}

#[tokio::test]
async fn blocked_dequeue_times_out_twice() -> Result<()> {
    init_test_tracing();
    let mut cluster =
        Cluster::provisioned(ClusterConfig::new(Duration::from_millis(200), NUM_CPUS, 0))?;
    let item = dequeue_only_graph()?;
    cluster.initialize(item.clone()).await?;

    for attempt in 0..2 {
        let err = cluster
            .run(&item.graph, &item.feeds, &item.fetches)
            .await
            .expect_err("dequeue never completes");
        assert!(err.is_deadline_exceeded(), "attempt {attempt}: {err}");
    }
    cluster.shutdown().await?;
    assert_eq!(cluster.state(), ClusterState::Shutdown { wedged: false });
    Ok(())
}

#[tokio::test]
async fn variable_initializer_is_reported() -> Result<()> {
    let mut cluster = cluster();
    let item = variable_init_graph()?;
    let init = cluster.initialize(item).await?;
    assert!(init.contains("init"));

    let outcome = cluster.run_item().await?;
    assert!(outcome.report.contains("init"));
    assert!(outcome.report.contains("v"));
    let value = outcome.value("v").expect("variable fetched");
    assert_eq!(value.shape(), &Shape::new(vec![10, 1]));
    Ok(())
}

#[tokio::test]
async fn table_memory_is_attributed_to_initializer() -> Result<()> {
    let mut cluster = cluster();
    let item = lookup_table_graph()?;
    cluster.initialize(item).await?;
    let outcome = cluster.run_item().await?;
    assert_eq!(outcome.value("table_lookup"), Some(&Tensor::scalar_i64(456)));

    let report = &outcome.report;
    let init = report.record("initialize_table").expect("initializer record");
    assert!(init.host_persistent_memory >= 4 * 2 * 8);
    assert_eq!(init.device_persistent_memory, 0);
    let handle = report.record("hash_table").expect("handle record");
    assert_eq!(handle.host_persistent_memory, 0);
    assert_eq!(handle.device_persistent_memory, 0);
    Ok(())
}

#[tokio::test]
async fn counting_loop_terminates() -> Result<()> {
    let mut cluster = cluster();
    cluster.initialize(counting_loop_graph(3)?).await?;
    let outcome = cluster.run_item().await?;
    assert_eq!(outcome.value("while/Exit"), Some(&Tensor::scalar_i32(3)));
    Ok(())
}

#[tokio::test]
async fn items_can_be_rebound() -> Result<()> {
    let mut cluster = cluster();
    let mut yielder =
        TrivialGraphYielder::new(TrivialGraphConfig::new(3, 2, 10).with_devices(cluster.device_names()));
    for _ in 0..3 {
        let item = yielder.next_item()?;
        cluster.initialize(item.clone()).await?;
        assert_eq!(cluster.bound_item().map(|bound| bound.id.as_str()), Some(item.id.as_str()));
        let first = cluster.run(&item.graph, &item.feeds, &item.fetches).await?;
        let second = cluster.run(&item.graph, &item.feeds, &item.fetches).await?;
        assert_eq!(first.report.user_nodes().count(), 1 + 3 * 2);
        assert_eq!(comparable(first.report), comparable(second.report));
    }
    Ok(())
}

#[tokio::test]
async fn lifecycle_misuse() -> Result<()> {
    init_test_tracing();
    let mut cluster = Cluster::new(ClusterConfig::new(TIMEOUT, NUM_CPUS, 0));
    let item = variable_init_graph()?;

    let err = cluster.run(&item.graph, &[], &item.fetches).await.expect_err("not provisioned");
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    cluster.provision()?;
    let err = cluster.provision().expect_err("provisioned twice");
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    let err = cluster.run(&item.graph, &[], &item.fetches).await.expect_err("not initialized");
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    cluster.initialize(item.clone()).await?;
    let other = counting_loop_graph(1)?;
    let err = cluster
        .run(&other.graph, &[], &other.fetches)
        .await
        .expect_err("graph mismatch");
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    let err = cluster
        .run(&item.graph, &[], &["missing".to_string()])
        .await
        .expect_err("unknown fetch");
    assert_eq!(err.kind(), ErrorKind::Configuration);

    cluster.shutdown().await?;
    cluster.shutdown().await?;
    let err = cluster.run(&item.graph, &[], &item.fetches).await.expect_err("after shutdown");
    assert!(err.is_unavailable());
    let err = cluster.initialize(item).await.expect_err("after shutdown");
    assert!(err.is_unavailable());
    Ok(())
}

#[tokio::test]
async fn invalid_items_fail_initialize() -> Result<()> {
    let mut cluster = cluster();

    let mut builder = GraphBuilder::new();
    builder
        .op("x", "Const")
        .attr("value", Tensor::scalar_f32(1.0))
        .device("/gpu:0")
        .finish()?;
    let on_gpu = WorkItem::new("gpu", builder.build()).with_fetch("x");
    let err = cluster.initialize(on_gpu).await.expect_err("no gpu provisioned");
    assert!(matches!(err, ClusterError::UnknownDevice { .. }), "{err}");

    let mut builder = GraphBuilder::new();
    builder.op("y", "Square").input("missing").finish()?;
    let dangling = WorkItem::new("dangling", builder.build()).with_fetch("y");
    let err = cluster.initialize(dangling).await.expect_err("dangling input");
    match err {
        ClusterError::InvalidGraph { diagnostics } => {
            assert!(diagnostics.iter().any(|diag| diag.code.code == "GRAPH201"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cluster.state(), ClusterState::Provisioned);
    Ok(())
}

#[tokio::test]
async fn failing_assert_reports_the_node() -> Result<()> {
    let mut cluster = cluster();
    let mut builder = GraphBuilder::new();
    builder
        .op("flag", "Const")
        .attr("value", Tensor::scalar_bool(false))
        .finish()?;
    builder.op("check", "Assert").input("flag").finish()?;
    let item = WorkItem::new("assert", builder.build()).with_fetch("check");
    cluster.initialize(item).await?;
    let err = cluster.run_item().await.expect_err("assert fails");
    assert!(matches!(&err, ClusterError::NodeFailed { node, .. } if node == "check"), "{err}");
    assert_eq!(err.kind(), ErrorKind::Execution);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn staged_graphs_report_every_stage(stages in 1usize..6, width in 1usize..3) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let report = runtime.block_on(async {
            let mut cluster = cluster();
            let config = TrivialGraphConfig::new(stages, width, 10).with_devices(cluster.device_names());
            let item = trivial_graph("prop", &config).unwrap();
            cluster.initialize(item).await.unwrap();
            let outcome = cluster.run_item().await.unwrap();
            cluster.shutdown().await.unwrap();
            outcome.report
        });
        prop_assert_eq!(report.user_nodes().count(), 1 + stages * width);
        for stage in 0..stages {
            let name = format!("Layer_{stage}/n_0");
            prop_assert!(report.contains(&name));
        }
    }
}
