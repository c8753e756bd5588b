//! Rewrites applied once when a work item is bound: dead-node pruning and
//! constant folding.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use graph_core::{DeviceName, Graph, GraphError, Operation, Tensor};
use graph_plan::ValidatedItem;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::kernels::{KernelContext, KernelRegistry};
use crate::resources::ResourceManager;

/// What the optimizer changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationSummary {
    /// Operations removed because no fetch, init op or queue runner needs them.
    pub pruned: Vec<String>,
    /// Operations replaced by a `Const` holding their value.
    pub folded: Vec<String>,
    /// Operations whose value was baked into a folded constant. Feeding them
    /// later would not reach the folded consumers.
    pub frozen: BTreeSet<String>,
}

/// Operations the rewritten graph must keep.
fn roots(item: &ValidatedItem) -> BTreeSet<String> {
    let mut roots: BTreeSet<String> = item
        .fetches()
        .iter()
        .map(|fetch| fetch.node.clone())
        .collect();
    let work = item.item();
    roots.extend(work.init_ops.iter().cloned());
    for runner in &work.queue_runners {
        roots.insert(runner.queue.clone());
        roots.extend(runner.enqueue_ops.iter().cloned());
    }
    roots
}

/// Drop every operation not reachable backwards from `roots`. Order is kept.
pub fn prune(graph: &Graph, roots: &BTreeSet<String>) -> Result<(Graph, Vec<String>), GraphError> {
    let mut keep: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
    while let Some(name) = stack.pop() {
        if !keep.insert(name) {
            continue;
        }
        if let Some(op) = graph.operation(name) {
            stack.extend(op.inputs().iter().map(|input| input.node()));
        }
    }
    let mut pruned_graph = Graph::new();
    let mut pruned = Vec::new();
    for op in graph.operations() {
        if keep.contains(op.name()) {
            pruned_graph.add(op.clone())?;
        } else {
            pruned.push(op.name().to_string());
        }
    }
    Ok((pruned_graph, pruned))
}

/// Prune, fold constants to a fixed point, then prune what folding orphaned.
#[instrument(skip_all, fields(item = %item.item().id, ops = item.graph().len()))]
pub async fn optimize(
    item: &ValidatedItem,
    kernels: &KernelRegistry,
    host: &DeviceName,
) -> Result<(Graph, OptimizationSummary), GraphError> {
    let roots = roots(item);
    let (graph, mut pruned) = prune(item.graph(), &roots)?;

    let fed: HashSet<&str> = item.feeds().iter().map(|feed| feed.node.as_str()).collect();
    let mut ops: Vec<Operation> = graph.operations().to_vec();
    let mut constants: HashMap<String, Tensor> = ops
        .iter()
        .filter(|op| {
            op.kind() == "Const"
                && !fed.contains(op.name())
                && op.control_inputs().next().is_none()
        })
        .filter_map(|op| {
            op.attr_tensor("value")
                .ok()
                .map(|value| (op.name().to_string(), value.clone()))
        })
        .collect();
    let mut folded = Vec::new();
    let mut frozen = BTreeSet::new();

    loop {
        let mut changed = false;
        for slot in ops.iter_mut() {
            let Some(inputs) = foldable_inputs(slot, kernels, &constants, &fed) else {
                continue;
            };
            let Some(kernel) = kernels.kernel(slot.kind()) else {
                continue;
            };
            let device = item.placement(slot.name()).cloned().unwrap_or_else(|| host.clone());
            let ctx = KernelContext::new(
                Arc::new(slot.clone()),
                inputs,
                device,
                Arc::new(ResourceManager::new()),
                CancellationToken::new(),
            );
            let value = match kernel.compute(ctx).await {
                Ok(output) => match output.outputs.into_iter().next().flatten() {
                    Some(value) => value,
                    None => continue,
                },
                Err(err) => {
                    debug!(op = slot.name(), error = %err, "leaving operation unfolded");
                    continue;
                }
            };
            debug!(op = slot.name(), kind = slot.kind(), "folded into constant");
            let replacement = Operation::new(slot.name(), "Const")
                .with_attr("dtype", value.dtype())
                .with_attr("value", value.clone())
                .with_device(slot.device());
            frozen.extend(slot.data_inputs().map(|input| input.node.clone()));
            constants.insert(slot.name().to_string(), value);
            folded.push(slot.name().to_string());
            *slot = replacement;
            changed = true;
        }
        if !changed {
            break;
        }
    }

    let mut folded_graph = Graph::new();
    for op in ops {
        folded_graph.add(op)?;
    }
    let (graph, orphaned) = prune(&folded_graph, &roots)?;
    pruned.extend(orphaned);
    debug!(
        pruned = pruned.len(),
        folded = folded.len(),
        remaining = graph.len(),
        "optimization finished"
    );
    Ok((
        graph,
        OptimizationSummary {
            pruned,
            folded,
            frozen,
        },
    ))
}

/// Constant inputs of `op` when it can be evaluated ahead of time.
fn foldable_inputs(
    op: &Operation,
    kernels: &KernelRegistry,
    constants: &HashMap<String, Tensor>,
    fed: &HashSet<&str>,
) -> Option<Vec<Tensor>> {
    if op.kind() == "Const" || fed.contains(op.name()) || op.control_inputs().next().is_some() {
        return None;
    }
    let kernel = kernels.kernel(op.kind())?;
    if !kernel.is_stateless() || kernel.num_outputs(op) != 1 {
        return None;
    }
    let inputs: Option<Vec<Tensor>> = op
        .data_inputs()
        .map(|input| {
            if input.port != 0 {
                return None;
            }
            constants.get(&input.node).cloned()
        })
        .collect();
    inputs.filter(|inputs| !inputs.is_empty())
}
