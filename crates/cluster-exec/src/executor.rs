//! Dataflow execution of a [`StepPlan`].
//!
//! Every edge carries tokens: a live value, a control signal or a dead marker
//! from an untaken `Switch` branch. A node fires once all of its input slots
//! hold a token, except `Merge`, which consumes its entry inputs in rounds.
//! Loop-invariant values are latched so every iteration sees them. The step ends
//! when no node can fire and no kernel is in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use graph_core::Tensor;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::cost::{CostCollector, ExecutionReport};
use crate::kernels::{KernelContext, KernelError, KernelOutput};
use crate::metrics::{ExecutorMetrics, StepKind};
use crate::plan::{CONTROL_FLOW_KINDS, PlanNode, StepPlan};
use crate::resources::ResourceManager;

/// Failures that abort a step.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("operation `{node}` failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: KernelError,
    },
    #[error("fetch `{0}` was never produced")]
    MissingFetch(String),
}

impl ExecutionError {
    pub fn kind_label(&self) -> &'static str {
        match self {
            ExecutionError::NodeFailed { source, .. } => source.kind_label(),
            ExecutionError::MissingFetch(_) => "missing_fetch",
        }
    }
}

/// Ambient state shared by every kernel of a step.
#[derive(Clone)]
pub struct StepContext {
    pub item: String,
    pub step: StepKind,
    pub resources: Arc<ResourceManager>,
    pub cancellation: CancellationToken,
}

/// One fetched output. Operations without outputs yield `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedTensor {
    pub name: String,
    pub value: Option<Tensor>,
}

/// Fetched values plus the cost report of a completed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub fetched: Vec<FetchedTensor>,
    pub report: ExecutionReport,
}

impl StepOutcome {
    pub fn value(&self, name: &str) -> Option<&Tensor> {
        self.fetched
            .iter()
            .find(|fetched| fetched.name == name)
            .and_then(|fetched| fetched.value.as_ref())
    }
}

#[derive(Debug, Clone)]
enum Token {
    Value(Tensor),
    Control,
    Dead,
}

#[derive(Debug, Default)]
struct Slot {
    pending: VecDeque<Token>,
    /// Loop invariants keep their token for every iteration.
    sticky: bool,
    latched: Option<Token>,
    from_next_iteration: bool,
}

impl Slot {
    fn is_ready(&self) -> bool {
        self.latched.is_some() || !self.pending.is_empty()
    }

    fn push(&mut self, token: Token) {
        if self.sticky {
            self.latched = Some(token);
        } else {
            self.pending.push_back(token);
        }
    }

    fn take(&mut self) -> Option<Token> {
        match &self.latched {
            Some(token) => Some(token.clone()),
            None => self.pending.pop_front(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Merge,
    Exit,
    Regular,
}

enum Firing {
    Live {
        inputs: Vec<Tensor>,
        input_index: Option<usize>,
    },
    Dead,
}

struct NodeState {
    role: Role,
    num_data: usize,
    slots: Vec<Slot>,
    in_flight: bool,
    fired: bool,
}

impl NodeState {
    fn try_take(&mut self) -> Option<Firing> {
        if self.in_flight {
            return None;
        }
        if self.slots.is_empty() || self.slots.iter().all(|slot| slot.sticky) {
            if self.fired || !self.slots.iter().all(Slot::is_ready) {
                return None;
            }
            self.fired = true;
            return Some(self.take_all());
        }
        match self.role {
            Role::Merge => self.take_merge(),
            Role::Exit | Role::Regular => {
                if self.slots.iter().all(Slot::is_ready) {
                    Some(self.take_all())
                } else {
                    None
                }
            }
        }
    }

    fn take_all(&mut self) -> Firing {
        let tokens: Vec<Token> = self.slots.iter_mut().filter_map(Slot::take).collect();
        if tokens.iter().any(|token| matches!(token, Token::Dead)) {
            return Firing::Dead;
        }
        let inputs = tokens
            .into_iter()
            .take(self.num_data)
            .filter_map(|token| match token {
                Token::Value(value) => Some(value),
                Token::Control | Token::Dead => None,
            })
            .collect();
        Firing::Live {
            inputs,
            input_index: None,
        }
    }

    /// Back-edge values fire as they arrive and dead back-edge tokens are
    /// dropped. Entry inputs are consumed one round at a time, one token per
    /// slot: the round is live if any of its tokens is, dead otherwise.
    fn take_merge(&mut self) -> Option<Firing> {
        let (data, control) = self.slots.split_at_mut(self.num_data);
        for (index, slot) in data.iter_mut().enumerate() {
            if !slot.from_next_iteration {
                continue;
            }
            while let Some(token) = slot.take() {
                if let Token::Value(value) = token {
                    return Some(Firing::Live {
                        inputs: vec![value],
                        input_index: Some(index),
                    });
                }
            }
        }

        let mut entries = data.iter().filter(|slot| !slot.from_next_iteration).peekable();
        entries.peek()?;
        if !entries.all(Slot::is_ready) || !control.iter().all(Slot::is_ready) {
            return None;
        }
        let mut firing = Firing::Dead;
        for (index, slot) in data.iter_mut().enumerate() {
            if slot.from_next_iteration {
                continue;
            }
            if let Some(Token::Value(value)) = slot.take()
                && matches!(firing, Firing::Dead)
            {
                firing = Firing::Live {
                    inputs: vec![value],
                    input_index: Some(index),
                };
            }
        }
        let control_dead = control
            .iter_mut()
            .filter_map(Slot::take)
            .any(|token| matches!(token, Token::Dead));
        Some(if control_dead { Firing::Dead } else { firing })
    }
}

/// Operations whose value is the same in every loop iteration: constant
/// `Enter`s and stateless operations fed only by such values. They run once
/// per step and their outputs are reused by every iteration.
fn loop_invariants(nodes: &[PlanNode]) -> Vec<bool> {
    let mut invariant: Vec<bool> = nodes
        .iter()
        .map(|node| {
            node.kind() == "Enter" && node.op.attr_bool_or("is_constant", false).unwrap_or(false)
        })
        .collect();
    loop {
        let mut changed = false;
        for (index, node) in nodes.iter().enumerate() {
            if invariant[index]
                || CONTROL_FLOW_KINDS.contains(&node.kind())
                || !node.kernel.is_stateless()
                || (node.data_inputs.is_empty() && node.control_inputs.is_empty())
            {
                continue;
            }
            let fed_by_invariants = node
                .data_inputs
                .iter()
                .map(|(source, _)| *source)
                .chain(node.control_inputs.iter().copied())
                .all(|source| invariant[source]);
            if fed_by_invariants {
                invariant[index] = true;
                changed = true;
            }
        }
        if !changed {
            return invariant;
        }
    }
}

struct Completion {
    index: usize,
    started_at: Duration,
    elapsed: Duration,
    result: Result<KernelOutput, KernelError>,
}

/// Run `plan` until it is quiescent and collect the fetches.
#[instrument(skip_all, fields(item = %ctx.item, step = ctx.step.as_str(), nodes = plan.len()))]
pub async fn execute_step(plan: &StepPlan, ctx: &StepContext) -> Result<StepOutcome, ExecutionError> {
    let metrics = ExecutorMetrics::new(&ctx.item, ctx.step);
    let started = Instant::now();
    let result = drive(plan, ctx, &metrics).await;
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics.record_step(started.elapsed(), outcome);
    debug!(elapsed = ?started.elapsed(), outcome, "step finished");
    result
}

async fn drive(
    plan: &StepPlan,
    ctx: &StepContext,
    metrics: &Arc<ExecutorMetrics>,
) -> Result<StepOutcome, ExecutionError> {
    let nodes = plan.nodes();
    let invariant = loop_invariants(nodes);
    let mut states: Vec<NodeState> = nodes
        .iter()
        .map(|node| {
            let role = match node.kind() {
                "Merge" => Role::Merge,
                "Exit" => Role::Exit,
                _ => Role::Regular,
            };
            let latches = role == Role::Regular;
            let mut slots: Vec<Slot> = node
                .data_inputs
                .iter()
                .map(|(source, _)| Slot {
                    sticky: latches && invariant[*source],
                    from_next_iteration: nodes[*source].kind() == "NextIteration",
                    ..Slot::default()
                })
                .collect();
            slots.extend(node.control_inputs.iter().map(|&source| Slot {
                sticky: latches && invariant[source],
                ..Slot::default()
            }));
            NodeState {
                role,
                num_data: node.data_inputs.len(),
                slots,
                in_flight: false,
                fired: false,
            }
        })
        .collect();

    let mut data_consumers: Vec<Vec<Vec<(usize, usize)>>> = nodes
        .iter()
        .map(|node| vec![Vec::new(); node.num_outputs])
        .collect();
    let mut control_consumers: Vec<Vec<(usize, usize)>> = vec![Vec::new(); nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for (slot, (source, port)) in node.data_inputs.iter().enumerate() {
            if let Some(consumers) = data_consumers[*source].get_mut(*port) {
                consumers.push((index, slot));
            }
        }
        for (offset, source) in node.control_inputs.iter().enumerate() {
            control_consumers[*source].push((index, node.data_inputs.len() + offset));
        }
    }

    let value_fetches: HashSet<usize> = plan
        .fetches()
        .iter()
        .filter(|fetch| fetch.yields_value)
        .map(|fetch| fetch.node)
        .collect();
    let mut fetched_values: HashMap<usize, Tensor> = HashMap::new();
    let mut executed: HashSet<usize> = HashSet::new();

    let step_start = Instant::now();
    let mut collector = CostCollector::new();
    let mut ready: VecDeque<usize> = (0..nodes.len()).collect();
    let mut running: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();

    let deliver = |states: &mut Vec<NodeState>,
                   ready: &mut VecDeque<usize>,
                   index: usize,
                   outputs: Option<&[Option<Tensor>]>| {
        if outputs.is_none() && states[index].role == Role::Exit {
            return;
        }
        for (port, consumers) in data_consumers[index].iter().enumerate() {
            let token = outputs
                .and_then(|values| values.get(port).cloned().flatten())
                .map_or(Token::Dead, Token::Value);
            for (consumer, slot) in consumers {
                states[*consumer].slots[*slot].push(token.clone());
                ready.push_back(*consumer);
            }
        }
        let token = if outputs.is_some() { Token::Control } else { Token::Dead };
        for (consumer, slot) in &control_consumers[index] {
            states[*consumer].slots[*slot].push(token.clone());
            ready.push_back(*consumer);
        }
    };

    loop {
        while let Some(index) = ready.pop_front() {
            let Some(firing) = states[index].try_take() else {
                continue;
            };
            let node = &nodes[index];
            match firing {
                Firing::Dead => {
                    trace!(node = node.name(), "dead input, skipping kernel");
                    deliver(&mut states, &mut ready, index, None);
                    ready.push_back(index);
                }
                Firing::Live { inputs, input_index } => {
                    states[index].in_flight = true;
                    let mut kernel_ctx = KernelContext::new(
                        Arc::clone(&node.op),
                        inputs,
                        node.device.clone(),
                        Arc::clone(&ctx.resources),
                        ctx.cancellation.clone(),
                    );
                    if let Some(input_index) = input_index {
                        kernel_ctx = kernel_ctx.with_input_index(input_index);
                    }
                    let kernel = Arc::clone(&node.kernel);
                    let guard = metrics.track_node(node.name());
                    let started_at = step_start.elapsed();
                    running.push(Box::pin(async move {
                        let start = Instant::now();
                        let result = kernel.compute(kernel_ctx).await;
                        drop(guard);
                        Completion {
                            index,
                            started_at,
                            elapsed: start.elapsed(),
                            result,
                        }
                    }));
                }
            }
        }

        let Some(completion) = running.next().await else {
            break;
        };
        let index = completion.index;
        let node = &nodes[index];
        states[index].in_flight = false;
        let output = match completion.result {
            Ok(output) if output.outputs.len() == node.num_outputs => output,
            Ok(output) => {
                let source = KernelError::invalid(format!(
                    "produced {} outputs, expected {}",
                    output.outputs.len(),
                    node.num_outputs
                ));
                metrics.record_node_error(node.name(), source.kind_label());
                return Err(ExecutionError::NodeFailed {
                    node: node.name().to_string(),
                    source,
                });
            }
            Err(source) => {
                debug!(node = node.name(), error = %source, "kernel failed");
                metrics.record_node_error(node.name(), source.kind_label());
                return Err(ExecutionError::NodeFailed {
                    node: node.name().to_string(),
                    source,
                });
            }
        };
        trace!(node = node.name(), elapsed = ?completion.elapsed, "kernel finished");
        collector.record(
            index,
            node.name(),
            &node.device,
            &output.outputs,
            completion.started_at,
            completion.elapsed,
            output.persistent_bytes,
        );
        executed.insert(index);
        if value_fetches.contains(&index)
            && let Some(Some(value)) = output.outputs.first()
        {
            fetched_values.insert(index, value.clone());
        }
        deliver(&mut states, &mut ready, index, Some(&output.outputs));
        ready.push_back(index);
    }

    let mut fetched = Vec::with_capacity(plan.fetches().len());
    for fetch in plan.fetches() {
        let value = if fetch.yields_value {
            match fetched_values.get(&fetch.node) {
                Some(value) => Some(value.clone()),
                None => return Err(ExecutionError::MissingFetch(fetch.name.clone())),
            }
        } else if executed.contains(&fetch.node) {
            None
        } else {
            return Err(ExecutionError::MissingFetch(fetch.name.clone()));
        };
        fetched.push(FetchedTensor {
            name: fetch.name.clone(),
            value,
        });
    }

    Ok(StepOutcome {
        fetched,
        report: collector.finish(),
    })
}
