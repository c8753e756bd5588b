//! A work item bound to a device set, with the resources its steps share.

use std::sync::Arc;

use graph_core::{DeviceName, Feed, Graph, GraphError, InputParseError, Tensor, TensorRef};
use graph_plan::ValidatedItem;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cost::ExecutionReport;
use crate::devices::DeviceRegistry;
use crate::executor::{ExecutionError, StepContext, StepOutcome, execute_step};
use crate::kernels::KernelRegistry;
use crate::metrics::StepKind;
use crate::optimizer::{OptimizationSummary, optimize};
use crate::plan::{PlanError, PlanRequest, build_plan};
use crate::resources::ResourceManager;

/// Failures surfaced by a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("invalid tensor reference `{name}`: {source}")]
    InvalidReference {
        name: String,
        #[source]
        source: InputParseError,
    },
    #[error("feed `{name}` targets a value folded into constants when the item was bound")]
    FoldedFeed { name: String },
    #[error("session is closed")]
    Closed,
}

struct SessionInner {
    item: ValidatedItem,
    graph: Graph,
    optimization: OptimizationSummary,
    host: DeviceName,
    kernels: Arc<KernelRegistry>,
    resources: Arc<ResourceManager>,
    cancellation: CancellationToken,
    init_report: Mutex<Option<ExecutionReport>>,
}

/// Cheaply clonable handle to a bound work item. Steps may run on any thread.
#[derive(Clone)]
pub struct ExecutionSession {
    inner: Arc<SessionInner>,
}

impl ExecutionSession {
    /// Bind `item`, optionally rewriting its graph first. The session's
    /// cancellation token is a child of `parent`.
    #[instrument(skip_all, fields(item = %item.item().id))]
    pub async fn create(
        item: ValidatedItem,
        devices: &DeviceRegistry,
        kernels: Arc<KernelRegistry>,
        run_optimizer: bool,
        parent: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let host = devices.host();
        let (graph, optimization) = if run_optimizer {
            optimize(&item, &kernels, &host).await?
        } else {
            (item.graph().clone(), OptimizationSummary::default())
        };
        debug!(ops = graph.len(), folded = optimization.folded.len(), "session bound");
        Ok(Self {
            inner: Arc::new(SessionInner {
                item,
                graph,
                optimization,
                host,
                kernels,
                resources: Arc::new(ResourceManager::new()),
                cancellation: parent.child_token(),
                init_report: Mutex::new(None),
            }),
        })
    }

    pub fn item(&self) -> &ValidatedItem {
        &self.inner.item
    }

    /// The graph steps execute, after optimization.
    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    pub fn optimization(&self) -> &OptimizationSummary {
        &self.inner.optimization
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }

    /// Token cancelled when the session closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Report of the last successful initialisation step.
    pub fn init_report(&self) -> Option<ExecutionReport> {
        self.inner.init_report.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.resources.is_closed()
    }

    /// Run the item's init ops once. Items without init ops produce an empty
    /// report.
    #[instrument(skip_all, fields(item = %self.inner.item.item().id))]
    pub async fn initialize(
        &self,
        cancellation: CancellationToken,
    ) -> Result<ExecutionReport, SessionError> {
        self.ensure_open()?;
        let init_ops = &self.inner.item.item().init_ops;
        let report = if init_ops.is_empty() {
            ExecutionReport::default()
        } else {
            let outcome = self
                .step(StepKind::Init, &[], &[], init_ops, cancellation)
                .await?;
            outcome.report
        };
        info!(records = report.len(), "initialization finished");
        *self.inner.init_report.lock() = Some(report.clone());
        Ok(report)
    }

    /// Execute one step. `feeds` override the item's own feeds by name and may
    /// not target values the optimizer folded away. Queue
    /// runner enqueue ops run alongside the fetches, and the returned report
    /// includes the initialisation records.
    #[instrument(skip_all, fields(item = %self.inner.item.item().id, fetches = fetches.len()))]
    pub async fn run(
        &self,
        feeds: &[Feed],
        fetches: &[String],
        cancellation: CancellationToken,
    ) -> Result<StepOutcome, SessionError> {
        self.ensure_open()?;
        let frozen = &self.inner.optimization.frozen;
        if let Some(feed) = feeds.iter().find(|feed| {
            TensorRef::parse(&feed.name).is_ok_and(|tensor| frozen.contains(&tensor.node))
        }) {
            return Err(SessionError::FoldedFeed {
                name: feed.name.clone(),
            });
        }
        let mut merged: Vec<(TensorRef, Tensor)> = Vec::new();
        for feed in self.inner.item.item().feeds.iter().chain(feeds) {
            let tensor = parse_ref(&feed.name)?;
            match merged.iter_mut().find(|(existing, _)| *existing == tensor) {
                Some(slot) => slot.1 = feed.value.clone(),
                None => merged.push((tensor, feed.value.clone())),
            }
        }
        let fetches = fetches
            .iter()
            .map(|name| parse_ref(name))
            .collect::<Result<Vec<_>, _>>()?;
        let targets: Vec<String> = self
            .inner
            .item
            .item()
            .queue_runners
            .iter()
            .flat_map(|runner| runner.enqueue_ops.iter().cloned())
            .filter(|op| self.inner.graph.contains(op))
            .collect();

        let mut outcome = self
            .step(StepKind::Run, &merged, &fetches, &targets, cancellation)
            .await?;
        if let Some(init) = self.inner.init_report.lock().as_ref() {
            outcome.report.merge_init(init);
        }
        Ok(outcome)
    }

    /// Cancel in-flight steps and release every resource. Idempotent.
    pub fn close(&self) {
        self.inner.cancellation.cancel();
        self.inner.resources.close();
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    async fn step(
        &self,
        step: StepKind,
        feeds: &[(TensorRef, Tensor)],
        fetches: &[TensorRef],
        targets: &[String],
        cancellation: CancellationToken,
    ) -> Result<StepOutcome, SessionError> {
        let plan = build_plan(&PlanRequest {
            graph: &self.inner.graph,
            placements: self.inner.item.placements(),
            host: &self.inner.host,
            kernels: &self.inner.kernels,
            feeds,
            fetches,
            targets,
        })?;
        let ctx = StepContext {
            item: self.inner.item.item().id.clone(),
            step,
            resources: Arc::clone(&self.inner.resources),
            cancellation,
        };
        Ok(execute_step(&plan, &ctx).await?)
    }
}

fn parse_ref(name: &str) -> Result<TensorRef, SessionError> {
    TensorRef::parse(name).map_err(|source| SessionError::InvalidReference {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use graph_core::{DType, GraphBuilder, WorkItem};
    use graph_plan::validate;

    use super::*;
    use crate::devices::PlacementTarget;

    async fn session(item: WorkItem) -> ExecutionSession {
        let devices = DeviceRegistry::provision(2, 0, 16).expect("devices");
        let kernels = Arc::new(KernelRegistry::with_builtin_kernels());
        let validated = validate(
            &item,
            &PlacementTarget {
                devices: &devices,
                kernels: &kernels,
            },
        )
        .expect("valid");
        ExecutionSession::create(validated, &devices, kernels, true, &CancellationToken::new())
            .await
            .expect("session")
    }

    fn variable_item() -> WorkItem {
        let mut b = GraphBuilder::new().default_device("/cpu:0");
        b.op("x", "Const")
            .attr("value", Tensor::filled_f32(&[10, 1], 0.5).unwrap())
            .finish()
            .unwrap();
        b.op("v", "Variable")
            .attr("dtype", DType::Float32)
            .attr("shape", graph_core::Shape::new(vec![10, 1]))
            .finish()
            .unwrap();
        b.op("init", "Assign").input("v").input("x").finish().unwrap();
        WorkItem::new("variables", b.build())
            .with_init_op("init")
            .with_fetch("v")
    }

    #[tokio::test]
    async fn init_state_survives_into_runs() {
        let session = session(variable_item()).await;
        let init = session
            .initialize(session.cancellation().child_token())
            .await
            .expect("init");
        assert_eq!(init.record("init").unwrap().host_persistent_memory, 40);

        let outcome = session
            .run(&[], &["v".to_string()], session.cancellation().child_token())
            .await
            .expect("run");
        assert_eq!(outcome.value("v"), Some(&Tensor::filled_f32(&[10, 1], 0.5).unwrap()));
        assert_eq!(outcome.report.user_node_names(), vec!["x", "init", "v"]);
        assert_eq!(outcome.report.record("init").unwrap().compute_cost_micros, 0);
    }

    #[tokio::test]
    async fn closed_sessions_refuse_work() {
        let session = session(variable_item()).await;
        session.close();
        assert!(session.cancellation().is_cancelled());
        let result = session
            .run(&[], &["v".to_string()], CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn run_feeds_override_item_feeds() {
        let mut b = GraphBuilder::new().default_device("/cpu:0");
        b.op("x", "Placeholder").attr("dtype", DType::Float32).finish().unwrap();
        b.op("y", "Square").input("x").finish().unwrap();
        let item = WorkItem::new("feeds", b.build())
            .with_fetch("y")
            .with_feed("x", Tensor::scalar_f32(2.0));
        let session = session(item).await;

        let default = session
            .run(&[], &["y".to_string()], CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(default.value("y"), Some(&Tensor::scalar_f32(4.0)));
        let overridden = session
            .run(
                &[Feed::new("x", Tensor::scalar_f32(5.0))],
                &["y".to_string()],
                CancellationToken::new(),
            )
            .await
            .expect("run");
        assert_eq!(overridden.value("y"), Some(&Tensor::scalar_f32(25.0)));
    }

    #[tokio::test]
    async fn feeds_into_folded_constants_are_rejected() {
        let mut b = GraphBuilder::new().default_device("/cpu:0");
        b.op("c", "Const").attr("value", Tensor::scalar_f32(2.0)).finish().unwrap();
        b.op("y", "Square").input("c").finish().unwrap();
        let session = session(WorkItem::new("folded", b.build()).with_fetch("y")).await;
        assert_eq!(session.optimization().folded, vec!["y"]);

        let result = session
            .run(
                &[Feed::new("c", Tensor::scalar_f32(5.0))],
                &["y".to_string()],
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(SessionError::FoldedFeed { ref name }) if name == "c"));

        let folded = session
            .run(&[], &["y".to_string()], CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(folded.value("y"), Some(&Tensor::scalar_f32(4.0)));
    }
}
