//! Work item generators and test setup shared by the cluster test suites.

use std::sync::Once;

use anyhow::{Context, Result};
use graph_core::{DType, GraphBuilder, QueueRunner, Shape, Tensor, WorkItem};

/// Parameters of the staged `AddN` graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrivialGraphConfig {
    /// Number of stages after the random source.
    pub num_stages: usize,
    /// Operations per stage; each sums every output of the previous stage.
    pub width: usize,
    /// Rows of the `[tensor_size, 1]` payload.
    pub tensor_size: i64,
    /// Route the last stage through a FIFO queue fed by a queue runner.
    pub insert_queue: bool,
    /// Devices assigned round-robin to stage operations. Empty leaves
    /// placement to the cluster.
    pub device_names: Vec<String>,
}

impl TrivialGraphConfig {
    pub fn new(num_stages: usize, width: usize, tensor_size: i64) -> Self {
        Self {
            num_stages,
            width,
            tensor_size,
            insert_queue: false,
            device_names: Vec::new(),
        }
    }

    pub fn with_queue(mut self, insert_queue: bool) -> Self {
        self.insert_queue = insert_queue;
        self
    }

    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_names = devices.into_iter().map(Into::into).collect();
        self
    }
}

/// Yields a fresh staged graph on every call, each with its own item id.
#[derive(Debug, Clone)]
pub struct TrivialGraphYielder {
    config: TrivialGraphConfig,
    produced: usize,
}

impl TrivialGraphYielder {
    pub fn new(config: TrivialGraphConfig) -> Self {
        Self {
            config,
            produced: 0,
        }
    }

    pub fn next_item(&mut self) -> Result<WorkItem> {
        let id = format!("trivial_{}", self.produced);
        self.produced += 1;
        trivial_graph(&id, &self.config)
    }
}

/// Build the staged graph: a random `[tensor_size, 1]` source, then
/// `num_stages` layers of `AddN` named `Layer_<stage>/n_<index>`.
pub fn trivial_graph(id: &str, config: &TrivialGraphConfig) -> Result<WorkItem> {
    anyhow::ensure!(config.num_stages > 0, "at least one stage is required");
    anyhow::ensure!(config.width > 0, "stages need at least one operation");

    let mut builder = GraphBuilder::new();
    let device = |slot: usize| -> String {
        if config.device_names.is_empty() {
            String::new()
        } else {
            config.device_names[slot % config.device_names.len()].clone()
        }
    };

    builder
        .op("x", "RandomNormal")
        .attr("dtype", DType::Float32)
        .attr("shape", Shape::new(vec![config.tensor_size, 1]))
        .device(device(0))
        .finish()
        .context("adding random source")?;

    let mut previous = vec!["x".to_string()];
    for stage in 0..config.num_stages {
        let mut current = Vec::with_capacity(config.width);
        for index in 0..config.width {
            let name = format!("Layer_{stage}/n_{index}");
            let mut op = builder
                .op(&name, "AddN")
                .device(device(stage * config.width + index));
            for input in &previous {
                op = op.input(input);
            }
            op.finish()
                .with_context(|| format!("adding stage operation `{name}`"))?;
            current.push(name);
        }
        previous = current;
    }

    if !config.insert_queue {
        let mut item = WorkItem::new(id, builder.build());
        for fetch in previous {
            item = item.with_fetch(fetch);
        }
        return Ok(item);
    }

    builder
        .op("queue", "FIFOQueue")
        .attr("component_types", vec![DType::Float32])
        .device(device(0))
        .finish()
        .context("adding queue")?;
    builder
        .op("queue/enqueue", "QueueEnqueue")
        .input("queue")
        .input(&previous[0])
        .device(device(0))
        .finish()
        .context("adding enqueue")?;
    builder
        .op("queue/dequeue", "QueueDequeue")
        .input("queue")
        .attr("component_types", vec![DType::Float32])
        .device(device(0))
        .finish()
        .context("adding dequeue")?;
    Ok(WorkItem::new(id, builder.build())
        .with_fetch("queue/dequeue")
        .with_queue_runner(QueueRunner::new("queue", ["queue/enqueue"])))
}

/// Names of every operation in [`optimization_graph`].
pub const OPTIMIZATION_GRAPH_OPS: [&str; 12] = [
    "zero",
    "one",
    "add",
    "square",
    "new_shape",
    "reshaped",
    "final_shape",
    "expected_shape",
    "valid",
    "all_dims",
    "all_valid",
    "assert_valid",
];

/// A graph whose value can be fully precomputed, ending in an `Assert` on
/// the reshaped result's shape.
pub fn optimization_graph() -> Result<WorkItem> {
    let mut b = GraphBuilder::new().default_device("/cpu:0");
    b.op("zero", "Const")
        .attr("value", Tensor::filled_f32(&[2, 3], 0.0)?)
        .finish()?;
    b.op("one", "Const")
        .attr("value", Tensor::filled_f32(&[2, 3], 1.0)?)
        .finish()?;
    b.op("add", "Add").input("zero").input("one").finish()?;
    b.op("square", "Square").input("add").finish()?;
    b.op("new_shape", "Const")
        .attr("value", Tensor::vector_i32(&[3, -1]))
        .finish()?;
    b.op("reshaped", "Reshape")
        .input("square")
        .input("new_shape")
        .finish()?;
    b.op("final_shape", "Shape").input("reshaped").finish()?;
    b.op("expected_shape", "Const")
        .attr("value", Tensor::vector_i32(&[3, 2]))
        .finish()?;
    b.op("valid", "Equal")
        .input("final_shape")
        .input("expected_shape")
        .finish()?;
    b.op("all_dims", "Const")
        .attr("value", Tensor::vector_i32(&[0]))
        .finish()?;
    b.op("all_valid", "All")
        .input("valid")
        .input("all_dims")
        .finish()?;
    b.op("assert_valid", "Assert")
        .input("all_valid")
        .input("final_shape")
        .finish()?;
    Ok(WorkItem::new("graph_optimizations", b.build()).with_fetch("assert_valid"))
}

/// Dequeue from a queue nobody feeds; blocks forever.
pub fn dequeue_only_graph() -> Result<WorkItem> {
    let mut b = GraphBuilder::new();
    b.op("queue", "FIFOQueue")
        .attr("component_types", vec![DType::Int32])
        .finish()?;
    b.op("dequeue", "QueueDequeue")
        .input("queue")
        .attr("component_types", vec![DType::Int32])
        .finish()?;
    Ok(WorkItem::new("timeouts", b.build()).with_fetch("dequeue"))
}

/// A `while (true)` loop over a random value; never terminates.
pub fn infinite_loop_graph() -> Result<WorkItem> {
    let mut b = GraphBuilder::new();
    b.op("shape", "Const")
        .attr("dtype", DType::Int32)
        .attr("value", Tensor::vector_i32(&[1]))
        .finish()?;
    b.op("random", "RandomUniform")
        .attr("dtype", DType::Float32)
        .input("shape")
        .finish()?;
    b.op("while/Enter", "Enter")
        .attr("frame_name", "while/while/")
        .input("random")
        .finish()?;
    b.op("while/Merge", "Merge")
        .input("while/Enter")
        .input("while/NextIteration")
        .finish()?;
    b.op("always_true", "Const")
        .attr("dtype", DType::Bool)
        .attr("value", Tensor::scalar_bool(true))
        .input("^while/Merge")
        .finish()?;
    b.op("while/LoopCond", "LoopCond").input("always_true").finish()?;
    b.op("while/Switch", "Switch")
        .input("while/Merge")
        .input("while/LoopCond")
        .finish()?;
    b.op("while/Identity", "Identity")
        .input("while/Switch:1")
        .finish()?;
    b.op("while/NextIteration", "NextIteration")
        .input("while/Identity")
        .finish()?;
    b.op("while/Exit", "Exit").input("while/Switch").finish()?;
    Ok(WorkItem::new("infinite_loop", b.build()).with_fetch("while/Exit"))
}

/// `i = 0; while i < limit { i += 1 }`, fetching the final `i`.
pub fn counting_loop_graph(limit: i32) -> Result<WorkItem> {
    let mut b = GraphBuilder::new();
    b.op("zero", "Const").attr("value", Tensor::scalar_i32(0)).finish()?;
    b.op("limit", "Const")
        .attr("value", Tensor::scalar_i32(limit))
        .finish()?;
    b.op("while/Enter", "Enter")
        .attr("frame_name", "while/while/")
        .input("zero")
        .finish()?;
    b.op("while/Enter_1", "Enter")
        .attr("frame_name", "while/while/")
        .attr("is_constant", true)
        .input("limit")
        .finish()?;
    b.op("while/Merge", "Merge")
        .input("while/Enter")
        .input("while/NextIteration")
        .finish()?;
    b.op("while/Less", "Less")
        .input("while/Merge")
        .input("while/Enter_1")
        .finish()?;
    b.op("while/LoopCond", "LoopCond").input("while/Less").finish()?;
    b.op("while/Switch", "Switch")
        .input("while/Merge")
        .input("while/LoopCond")
        .finish()?;
    b.op("while/Identity", "Identity")
        .input("while/Switch:1")
        .finish()?;
    b.op("while/add/y", "Const")
        .attr("value", Tensor::scalar_i32(1))
        .input("^while/Identity")
        .finish()?;
    b.op("while/add", "Add")
        .input("while/Identity")
        .input("while/add/y")
        .finish()?;
    b.op("while/NextIteration", "NextIteration")
        .input("while/add")
        .finish()?;
    b.op("while/Exit", "Exit").input("while/Switch").finish()?;
    Ok(WorkItem::new("counting_loop", b.build()).with_fetch("while/Exit"))
}

/// A `[10, 1]` variable assigned from a random initialiser by the `init` op.
pub fn variable_init_graph() -> Result<WorkItem> {
    let batch_size = 10;
    let mut b = GraphBuilder::new();
    b.op("x", "RandomNormal")
        .attr("dtype", DType::Float32)
        .attr("shape", Shape::new(vec![batch_size, 1]))
        .finish()?;
    b.op("v", "Variable")
        .attr("dtype", DType::Float32)
        .attr("shape", Shape::new(vec![batch_size, 1]))
        .finish()?;
    b.op("init", "Assign").input("v").input("x").finish()?;
    Ok(WorkItem::new("initialization_memory", b.build())
        .with_init_op("init")
        .with_fetch("v"))
}

/// A two-entry `int64 -> int64` table populated by `initialize_table` and
/// queried for a missing key.
pub fn lookup_table_graph() -> Result<WorkItem> {
    let mut b = GraphBuilder::new();
    b.op("hash_table", "HashTable")
        .attr("key_dtype", DType::Int64)
        .attr("value_dtype", DType::Int64)
        .finish()?;
    b.op("table_keys", "Const")
        .attr("dtype", DType::Int64)
        .attr("value", Tensor::from_i64(&[2], vec![123, 321])?)
        .finish()?;
    b.op("table_values", "Const")
        .attr("dtype", DType::Int64)
        .attr("value", Tensor::from_i64(&[2], vec![789, 987])?)
        .finish()?;
    b.op("initialize_table", "InitializeTable")
        .attr("Tkey", DType::Int64)
        .attr("Tval", DType::Int64)
        .input("hash_table")
        .input("table_keys")
        .input("table_values")
        .finish()?;
    b.op("query", "Const")
        .attr("dtype", DType::Int64)
        .attr("value", Tensor::scalar_i64(0))
        .finish()?;
    b.op("default_table_value", "Const")
        .attr("dtype", DType::Int64)
        .attr("value", Tensor::scalar_i64(456))
        .finish()?;
    b.op("table_lookup", "LookupTableFind")
        .attr("Tin", DType::Int64)
        .attr("Tout", DType::Int64)
        .input("hash_table")
        .input("query")
        .input("default_table_value")
        .finish()?;
    Ok(WorkItem::new("persistent_memory", b.build())
        .with_init_op("initialize_table")
        .with_fetch("table_lookup"))
}

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_graph_places_stages_round_robin() {
        let config = TrivialGraphConfig::new(4, 1, 10).with_devices(["/cpu:0", "/cpu:1", "/cpu:2"]);
        let item = trivial_graph("t", &config).expect("graph");
        let devices: Vec<_> = item
            .graph
            .operations()
            .iter()
            .filter(|op| op.kind() == "AddN")
            .map(|op| op.device().to_string())
            .collect();
        assert_eq!(devices, vec!["/cpu:0", "/cpu:1", "/cpu:2", "/cpu:0"]);
        assert_eq!(item.fetches, vec!["Layer_3/n_0"]);
    }

    #[test]
    fn queue_variant_adds_runner_and_fetches_dequeue() {
        let item = trivial_graph("q", &TrivialGraphConfig::new(2, 2, 10).with_queue(true))
            .expect("graph");
        assert_eq!(item.fetches, vec!["queue/dequeue"]);
        assert_eq!(item.queue_runners[0].enqueue_ops, vec!["queue/enqueue"]);
        let layer = item.graph.operation("Layer_1/n_0").expect("stage");
        assert_eq!(layer.data_inputs().count(), 2);
    }

    #[test]
    fn yielder_issues_distinct_ids() {
        let mut yielder = TrivialGraphYielder::new(TrivialGraphConfig::new(1, 1, 10));
        let first = yielder.next_item().expect("first");
        let second = yielder.next_item().expect("second");
        assert_ne!(first.id, second.id);
        assert_eq!(first.graph, second.graph);
    }

    #[test]
    fn optimization_graph_names_match() {
        let item = optimization_graph().expect("graph");
        let names: Vec<_> = item.graph.operations().iter().map(|op| op.name()).collect();
        assert_eq!(names, OPTIMIZATION_GRAPH_OPS);
    }
}
