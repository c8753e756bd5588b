//! Bounded local execution cluster.
//!
//! A [`Cluster`] provisions a fixed set of virtual devices, binds one work
//! item at a time and runs it under a wall-clock deadline, returning fetched
//! values together with a per-operation [`ExecutionReport`]. Work that blocks
//! or loops forever is abandoned on its worker thread; the cluster itself
//! stays responsive and reports the condition through [`ClusterError`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use cluster_exec::{DeviceRegistry, ExecutionSession, KernelRegistry, PlacementTarget};
use graph_core::{Feed, Graph, WorkItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

mod config;
mod error;
mod guard;
mod metrics;

pub use cluster_exec::{
    ExecutionReport, FetchedTensor, OpCostRecord, OutputInfo, StepOutcome, StepStats,
};
pub use config::ClusterConfig;
pub use error::{ClusterError, ErrorKind};

use guard::{GuardError, InflightTracker, TimeoutGuard};
use metrics::ClusterMetrics;

static NEXT_CLUSTER_ID: AtomicUsize = AtomicUsize::new(0);

/// Lifecycle position of a [`Cluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Unprovisioned,
    Provisioned,
    Initialized,
    /// Terminal. `wedged` is set when workers were still running at shutdown.
    Shutdown { wedged: bool },
}

/// Fixed-size local cluster that runs one bound work item under a deadline.
pub struct Cluster {
    config: ClusterConfig,
    state: ClusterState,
    kernels: Arc<KernelRegistry>,
    devices: Option<DeviceRegistry>,
    session: Option<ExecutionSession>,
    optimizer_enabled: bool,
    root: CancellationToken,
    inflight: InflightTracker,
    guard: TimeoutGuard,
    metrics: ClusterMetrics,
    /// Reason recorded when shutdown found workers still running.
    wedged_reason: Option<String>,
}

impl Cluster {
    /// Create an unprovisioned cluster with the built-in kernels.
    pub fn new(config: ClusterConfig) -> Self {
        let metrics = ClusterMetrics::new(format!(
            "cluster-{}",
            NEXT_CLUSTER_ID.fetch_add(1, Ordering::Relaxed)
        ));
        let inflight = InflightTracker::new();
        Self {
            optimizer_enabled: !config.disable_optimizer,
            config,
            state: ClusterState::Unprovisioned,
            kernels: Arc::new(KernelRegistry::with_builtin_kernels()),
            devices: None,
            session: None,
            root: CancellationToken::new(),
            guard: TimeoutGuard::new(inflight.clone(), metrics.clone()),
            inflight,
            metrics,
            wedged_reason: None,
        }
    }

    /// Create and provision a cluster in one step.
    pub fn provisioned(config: ClusterConfig) -> Result<Self, ClusterError> {
        let mut cluster = Self::new(config);
        cluster.provision()?;
        Ok(cluster)
    }

    /// Replace the kernel registry. Only valid before a work item is bound.
    pub fn with_kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = Arc::new(kernels);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    /// Fully qualified names of the provisioned devices, CPUs first.
    pub fn device_names(&self) -> Vec<String> {
        self.devices
            .as_ref()
            .map(|devices| {
                devices
                    .device_names()
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The currently bound work item, if any.
    pub fn bound_item(&self) -> Option<&WorkItem> {
        self.session.as_ref().map(|session| session.item().item())
    }

    /// Workers that have not finished yet, including abandoned ones.
    pub fn inflight_workers(&self) -> usize {
        self.inflight.count()
    }

    /// Turn graph rewriting off (or back on). Applies from the next
    /// provisioning.
    pub fn disable_optimizer(&mut self, disable: bool) {
        self.config.disable_optimizer = disable;
    }

    /// Allocate the configured devices.
    #[instrument(skip_all, fields(cpus = self.config.num_cpu_devices, gpus = self.config.num_gpu_devices))]
    pub fn provision(&mut self) -> Result<(), ClusterError> {
        match self.state {
            ClusterState::Unprovisioned => {}
            ClusterState::Shutdown { .. } => return Err(self.unavailable()),
            ClusterState::Provisioned | ClusterState::Initialized => {
                return Err(ClusterError::FailedPrecondition(
                    "cluster is already provisioned".into(),
                ));
            }
        }
        self.config.validate()?;
        let devices = DeviceRegistry::provision(
            self.config.num_cpu_devices,
            self.config.num_gpu_devices,
            self.config.max_devices_per_kind,
        )?;
        info!(devices = devices.len(), "cluster provisioned");
        self.devices = Some(devices);
        self.optimizer_enabled = !self.config.disable_optimizer;
        self.state = ClusterState::Provisioned;
        Ok(())
    }

    /// Bind `item` and run its init ops once. Replaces any previously bound
    /// item, releasing that item's resources first.
    #[instrument(skip_all, fields(item = %item.id))]
    pub async fn initialize(&mut self, item: WorkItem) -> Result<ExecutionReport, ClusterError> {
        let started = Instant::now();
        let result = self.initialize_inner(item).await;
        self.metrics.record_call("initialize", started.elapsed(), &result);
        result
    }

    async fn initialize_inner(&mut self, item: WorkItem) -> Result<ExecutionReport, ClusterError> {
        let devices = match (&self.state, &self.devices) {
            (ClusterState::Shutdown { .. }, _) => return Err(self.unavailable()),
            (ClusterState::Provisioned | ClusterState::Initialized, Some(devices)) => {
                devices.clone()
            }
            _ => {
                return Err(ClusterError::FailedPrecondition(
                    "initialize requires a provisioned cluster".into(),
                ));
            }
        };

        let validated = graph_plan::validate(
            &item,
            &PlacementTarget {
                devices: &devices,
                kernels: &self.kernels,
            },
        )
        .map_err(ClusterError::from_diagnostics)?;
        for warning in validated.warnings() {
            warn!(%warning, "work item validation warning");
        }

        if let Some(previous) = self.session.take() {
            debug!(item = %previous.item().item().id, "releasing previously bound item");
            previous.close();
        }
        self.state = ClusterState::Provisioned;

        let token = self.root.child_token();
        let kernels = Arc::clone(&self.kernels);
        let optimize = self.optimizer_enabled;
        let parent = token.clone();
        let outcome = self
            .guard
            .run("initialize", self.config.timeout, token, move || async move {
                let session =
                    ExecutionSession::create(validated, &devices, kernels, optimize, &parent)
                        .await?;
                let report = session
                    .initialize(session.cancellation().child_token())
                    .await?;
                Ok::<_, cluster_exec::SessionError>((session, report))
            })
            .await
            .map_err(|err| self.guard_error("initialize", err))?;

        let (session, report) = outcome?;
        self.session = Some(session);
        self.state = ClusterState::Initialized;
        info!(records = report.len(), "work item initialized");
        Ok(report)
    }

    /// Execute `fetches` of the bound item under the configured deadline.
    /// `graph` must be the bound item's graph.
    #[instrument(skip_all, fields(fetches = fetches.len()))]
    pub async fn run(
        &mut self,
        graph: &Graph,
        feeds: &[Feed],
        fetches: &[String],
    ) -> Result<StepOutcome, ClusterError> {
        let started = Instant::now();
        let result = self.run_inner(graph, feeds, fetches).await;
        self.metrics.record_call("run", started.elapsed(), &result);
        result
    }

    /// Run the bound item with its own graph, feeds and fetches.
    pub async fn run_item(&mut self) -> Result<StepOutcome, ClusterError> {
        let item = self.bound_item().cloned().ok_or_else(|| match self.state {
            ClusterState::Shutdown { .. } => self.unavailable(),
            _ => ClusterError::FailedPrecondition("no work item is bound".into()),
        })?;
        self.run(&item.graph, &item.feeds, &item.fetches).await
    }

    async fn run_inner(
        &mut self,
        graph: &Graph,
        feeds: &[Feed],
        fetches: &[String],
    ) -> Result<StepOutcome, ClusterError> {
        let session = match (&self.state, &self.session) {
            (ClusterState::Shutdown { .. }, _) => return Err(self.unavailable()),
            (ClusterState::Initialized, Some(session)) => session.clone(),
            _ => {
                return Err(ClusterError::FailedPrecondition(
                    "run requires an initialized cluster".into(),
                ));
            }
        };
        if session.item().graph() != graph {
            return Err(ClusterError::FailedPrecondition(
                "graph differs from the initialized work item".into(),
            ));
        }

        let token = session.cancellation().child_token();
        let feeds = feeds.to_vec();
        let fetches = fetches.to_vec();
        let step_token = token.clone();
        let outcome = self
            .guard
            .run("run", self.config.timeout, token, move || async move {
                session.run(&feeds, &fetches, step_token).await
            })
            .await
            .map_err(|err| self.guard_error("run", err))?;
        Ok(outcome?)
    }

    /// Release the bound item and devices and wait up to the shutdown grace
    /// for workers to drain. The cluster is unusable afterwards; if workers
    /// are still running the call and every later call fail with
    /// `Unavailable`.
    #[instrument(skip_all)]
    pub async fn shutdown(&mut self) -> Result<(), ClusterError> {
        match self.state {
            ClusterState::Shutdown { wedged: false } => return Ok(()),
            ClusterState::Shutdown { wedged: true } => return Err(self.unavailable()),
            _ => {}
        }
        self.release();
        let drained = self.inflight.wait_idle(self.config.shutdown_grace).await;
        self.state = ClusterState::Shutdown { wedged: !drained };
        self.metrics.record_shutdown(!drained);
        if drained {
            info!("cluster shut down");
            return Ok(());
        }
        let workers = self.inflight.count();
        error!(
            workers,
            grace = ?self.config.shutdown_grace,
            "workers did not drain; cluster is wedged"
        );
        self.wedged_reason = Some(format!(
            "{workers} worker(s) still running {:?} after shutdown; the cluster is wedged",
            self.config.shutdown_grace
        ));
        Err(self.unavailable())
    }

    fn release(&mut self) {
        self.root.cancel();
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.devices = None;
    }

    fn unavailable(&self) -> ClusterError {
        ClusterError::Unavailable(
            self.wedged_reason
                .clone()
                .unwrap_or_else(|| "cluster has been shut down".into()),
        )
    }

    fn guard_error(&self, operation: &'static str, err: GuardError) -> ClusterError {
        match err {
            GuardError::Elapsed(timeout) => {
                self.metrics.record_deadline_exceeded(operation);
                ClusterError::DeadlineExceeded { operation, timeout }
            }
            GuardError::Spawn(_) | GuardError::WorkerLost => {
                ClusterError::Unavailable(format!("{operation} worker failed: {err}"))
            }
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !matches!(self.state, ClusterState::Shutdown { .. }) {
            self.release();
        }
    }
}
