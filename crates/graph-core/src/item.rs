use serde::{Deserialize, Serialize};

use crate::ir::Graph;
use crate::tensor::Tensor;

/// Value supplied for an operation output at run time. `name` uses the same
/// `op` / `op:port` syntax as data inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub name: String,
    pub value: Tensor,
}

impl Feed {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Operations that keep a queue supplied while fetches run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRunner {
    pub queue: String,
    pub enqueue_ops: Vec<String>,
}

impl QueueRunner {
    pub fn new(queue: impl Into<String>, enqueue_ops: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            queue: queue.into(),
            enqueue_ops: enqueue_ops.into_iter().map(Into::into).collect(),
        }
    }
}

/// Unit of work bound to a cluster: a graph plus what to feed, fetch and
/// initialise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub graph: Graph,
    #[serde(default)]
    pub feeds: Vec<Feed>,
    #[serde(default)]
    pub fetches: Vec<String>,
    #[serde(default)]
    pub init_ops: Vec<String>,
    #[serde(default)]
    pub queue_runners: Vec<QueueRunner>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, graph: Graph) -> Self {
        Self {
            id: id.into(),
            graph,
            ..Self::default()
        }
    }

    pub fn with_fetch(mut self, name: impl Into<String>) -> Self {
        self.fetches.push(name.into());
        self
    }

    pub fn with_feed(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.feeds.push(Feed::new(name, value));
        self
    }

    pub fn with_init_op(mut self, name: impl Into<String>) -> Self {
        self.init_ops.push(name.into());
        self
    }

    pub fn with_queue_runner(mut self, runner: QueueRunner) -> Self {
        self.queue_runners.push(runner);
        self
    }
}
