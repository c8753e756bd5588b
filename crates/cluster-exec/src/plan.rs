//! Lowering of a bound graph into the node table one step executes.
//!
//! Feeds become `_arg_*` sources, fetched tensors get `_retval_*` sinks and
//! edges between devices get `_xfer_*` transfers. Only the backward closure of
//! the fetches and extra targets is kept.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use graph_core::{DeviceName, Graph, InputRef, Operation, Tensor, TensorRef};
use thiserror::Error;

use crate::kernels::{ARG_KIND, KernelRegistry, OpKernel, RETVAL_KIND, TRANSFER_KIND};

/// Kinds that drive loop frames; edges touching them never get transfers.
pub(crate) const CONTROL_FLOW_KINDS: &[&str] = &["Enter", "Exit", "Merge", "Switch", "NextIteration", "LoopCond"];

/// Errors raised while lowering a graph for execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("operation `{0}` is not part of the executed graph")]
    UnknownOperation(String),
    #[error("no kernel registered for `{kind}` (operation `{op}`)")]
    MissingKernel { op: String, kind: String },
    #[error("cannot fetch `{name}`: {reason}")]
    InvalidFetch { name: String, reason: String },
    #[error("injected operation `{0}` collides with an existing name")]
    NameCollision(String),
}

/// One executable node of a step.
pub struct PlanNode {
    pub op: Arc<Operation>,
    pub kernel: Arc<dyn OpKernel>,
    pub device: DeviceName,
    pub num_outputs: usize,
    /// `(source node, output port)` per data input, in input order.
    pub data_inputs: Vec<(usize, usize)>,
    pub control_inputs: Vec<usize>,
}

impl PlanNode {
    pub fn name(&self) -> &str {
        self.op.name()
    }

    pub fn kind(&self) -> &str {
        self.op.kind()
    }
}

/// A requested output: a `_retval` node for tensors, or the operation itself
/// when it produces nothing and is only run for its effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    pub name: String,
    pub node: usize,
    pub yields_value: bool,
}

/// Node table for one step.
pub struct StepPlan {
    nodes: Vec<PlanNode>,
    fetches: Vec<FetchSpec>,
}

impl StepPlan {
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn fetches(&self) -> &[FetchSpec] {
        &self.fetches
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.name() == name)
    }
}

/// Inputs for [`build_plan`].
pub struct PlanRequest<'a> {
    pub graph: &'a Graph,
    pub placements: &'a BTreeMap<String, DeviceName>,
    pub host: &'a DeviceName,
    pub kernels: &'a KernelRegistry,
    pub feeds: &'a [(TensorRef, Tensor)],
    pub fetches: &'a [TensorRef],
    /// Operations run for their effect, whether or not they are fetched.
    pub targets: &'a [String],
}

struct Builder<'a> {
    request: &'a PlanRequest<'a>,
    nodes: Vec<PlanNode>,
    names: HashSet<String>,
}

impl<'a> Builder<'a> {
    fn push(
        &mut self,
        op: Operation,
        device: DeviceName,
        data_inputs: Vec<(usize, usize)>,
    ) -> Result<usize, PlanError> {
        if !self.names.insert(op.name().to_string()) {
            return Err(PlanError::NameCollision(op.name().to_string()));
        }
        let kernel = self
            .request
            .kernels
            .kernel(op.kind())
            .ok_or_else(|| PlanError::MissingKernel {
                op: op.name().to_string(),
                kind: op.kind().to_string(),
            })?;
        let num_outputs = kernel.num_outputs(&op);
        self.nodes.push(PlanNode {
            op: Arc::new(op),
            kernel,
            device,
            num_outputs,
            data_inputs,
            control_inputs: Vec::new(),
        });
        Ok(self.nodes.len() - 1)
    }

    fn device_of(&self, name: &str) -> DeviceName {
        self.request
            .placements
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.request.host.clone())
    }
}

/// Lower `request.graph` into the nodes needed for the requested fetches and
/// targets.
pub fn build_plan(request: &PlanRequest<'_>) -> Result<StepPlan, PlanError> {
    let mut builder = Builder {
        request,
        nodes: Vec::new(),
        names: request
            .graph
            .operations()
            .iter()
            .map(|op| op.name().to_string())
            .collect(),
    };

    let mut fed: HashMap<&TensorRef, usize> = HashMap::new();
    for (tensor, value) in request.feeds {
        let op = Operation::new(format!("_arg_{}_{}", tensor.node, tensor.port), ARG_KIND)
            .with_attr("value", value.clone());
        let device = builder.device_of(&tensor.node);
        let index = builder.push(op, device, Vec::new())?;
        fed.insert(tensor, index);
    }

    let first_user = builder.nodes.len();
    let user_index: HashMap<&str, usize> = request
        .graph
        .operations()
        .iter()
        .enumerate()
        .map(|(offset, op)| (op.name(), first_user + offset))
        .collect();
    for op in request.graph.operations() {
        let device = builder.device_of(op.name());
        let kernel = request
            .kernels
            .kernel(op.kind())
            .ok_or_else(|| PlanError::MissingKernel {
                op: op.name().to_string(),
                kind: op.kind().to_string(),
            })?;
        builder.nodes.push(PlanNode {
            num_outputs: kernel.num_outputs(op),
            op: Arc::new(op.clone()),
            kernel,
            device,
            data_inputs: Vec::new(),
            control_inputs: Vec::new(),
        });
    }

    let resolve = |tensor: &TensorRef| -> Result<(usize, usize), PlanError> {
        if let Some(index) = fed.get(tensor) {
            return Ok((*index, 0));
        }
        user_index
            .get(tensor.node.as_str())
            .map(|index| (*index, tensor.port))
            .ok_or_else(|| PlanError::UnknownOperation(tensor.node.clone()))
    };

    let mut transfers: HashMap<(usize, usize, DeviceName), usize> = HashMap::new();
    for (offset, op) in request.graph.operations().iter().enumerate() {
        let target = first_user + offset;
        let target_device = builder.nodes[target].device.clone();
        let mut data_inputs = Vec::new();
        let mut control_inputs = Vec::new();
        for input in op.inputs() {
            match input {
                InputRef::Data(tensor) => {
                    let (source, port) = resolve(tensor)?;
                    let crosses = builder.nodes[source].device != target_device
                        && !CONTROL_FLOW_KINDS.contains(&builder.nodes[source].kind())
                        && !CONTROL_FLOW_KINDS.contains(&op.kind());
                    if !crosses {
                        data_inputs.push((source, port));
                        continue;
                    }
                    let key = (source, port, target_device.clone());
                    let transfer = match transfers.get(&key) {
                        Some(index) => *index,
                        None => {
                            let name = format!(
                                "_xfer_{}_{port}_to_{}{}",
                                builder.nodes[source].name(),
                                target_device.kind,
                                target_device.index
                            );
                            let index = builder.push(
                                Operation::new(name, TRANSFER_KIND),
                                target_device.clone(),
                                vec![(source, port)],
                            )?;
                            transfers.insert(key, index);
                            index
                        }
                    };
                    data_inputs.push((transfer, 0));
                }
                InputRef::Control(name) => {
                    let source = user_index
                        .get(name.as_str())
                        .ok_or_else(|| PlanError::UnknownOperation(name.clone()))?;
                    control_inputs.push(*source);
                }
            }
        }
        builder.nodes[target].data_inputs = data_inputs;
        builder.nodes[target].control_inputs = control_inputs;
    }

    let mut fetches = Vec::new();
    let mut retvals: HashMap<&TensorRef, usize> = HashMap::new();
    for tensor in request.fetches {
        let (source, port) = resolve(tensor)?;
        let arity = builder.nodes[source].num_outputs;
        if arity == 0 {
            if tensor.port != 0 {
                return Err(PlanError::InvalidFetch {
                    name: tensor.to_string(),
                    reason: "operation produces no outputs".into(),
                });
            }
            fetches.push(FetchSpec {
                name: tensor.to_string(),
                node: source,
                yields_value: false,
            });
            continue;
        }
        if port >= arity {
            return Err(PlanError::InvalidFetch {
                name: tensor.to_string(),
                reason: format!("operation has {arity} outputs"),
            });
        }
        let node = match retvals.get(tensor) {
            Some(index) => *index,
            None => {
                let op = Operation::new(
                    format!("_retval_{}_{}", tensor.node, tensor.port),
                    RETVAL_KIND,
                );
                let device = builder.nodes[source].device.clone();
                let index = builder.push(op, device, vec![(source, port)])?;
                retvals.insert(tensor, index);
                index
            }
        };
        fetches.push(FetchSpec {
            name: tensor.to_string(),
            node,
            yields_value: true,
        });
    }

    let mut roots: Vec<usize> = fetches.iter().map(|fetch| fetch.node).collect();
    for target in request.targets {
        let index = user_index
            .get(target.as_str())
            .ok_or_else(|| PlanError::UnknownOperation(target.clone()))?;
        roots.push(*index);
    }

    Ok(retain_closure(builder.nodes, fetches, &roots))
}

/// Keep only `roots` and everything they transitively depend on, preserving
/// node order.
fn retain_closure(nodes: Vec<PlanNode>, fetches: Vec<FetchSpec>, roots: &[usize]) -> StepPlan {
    let mut keep = vec![false; nodes.len()];
    let mut stack: Vec<usize> = roots.to_vec();
    while let Some(index) = stack.pop() {
        if std::mem::replace(&mut keep[index], true) {
            continue;
        }
        let node = &nodes[index];
        stack.extend(node.data_inputs.iter().map(|(source, _)| *source));
        stack.extend(node.control_inputs.iter().copied());
    }

    let mut remap = vec![usize::MAX; nodes.len()];
    let mut next = 0;
    for (index, kept) in keep.iter().enumerate() {
        if *kept {
            remap[index] = next;
            next += 1;
        }
    }

    let nodes = nodes
        .into_iter()
        .enumerate()
        .filter(|(index, _)| keep[*index])
        .map(|(_, mut node)| {
            for (source, _) in &mut node.data_inputs {
                *source = remap[*source];
            }
            for source in &mut node.control_inputs {
                *source = remap[*source];
            }
            node
        })
        .collect();
    let fetches = fetches
        .into_iter()
        .map(|fetch| FetchSpec {
            node: remap[fetch.node],
            ..fetch
        })
        .collect();
    StepPlan { nodes, fetches }
}

#[cfg(test)]
mod tests {
    use graph_core::{DeviceKind, GraphBuilder};

    use super::*;

    fn cpu(index: u32) -> DeviceName {
        DeviceName::local(DeviceKind::Cpu, index)
    }

    fn placements(graph: &Graph) -> BTreeMap<String, DeviceName> {
        graph
            .operations()
            .iter()
            .map(|op| {
                let device = DeviceName::parse(op.device()).expect("device");
                (op.name().to_string(), device)
            })
            .collect()
    }

    fn two_device_graph() -> Graph {
        let mut builder = GraphBuilder::new();
        builder
            .op("a", "Const")
            .attr("value", Tensor::scalar_f32(1.0))
            .device("/cpu:0")
            .finish()
            .expect("a");
        builder
            .op("b", "Identity")
            .input("a")
            .device("/cpu:1")
            .finish()
            .expect("b");
        builder
            .op("unused", "Const")
            .attr("value", Tensor::scalar_f32(1.0))
            .finish()
            .expect("unused");
        builder
            .op("check", "NoOp")
            .input("^b")
            .finish()
            .expect("check");
        builder.build()
    }

    #[test]
    fn inserts_plumbing_and_prunes_unreached_nodes() {
        let graph = two_device_graph();
        let placements = placements(&graph);
        let kernels = KernelRegistry::with_builtin_kernels();
        let plan = build_plan(&PlanRequest {
            graph: &graph,
            placements: &placements,
            host: &cpu(0),
            kernels: &kernels,
            feeds: &[],
            fetches: &[TensorRef::new("b", 0), TensorRef::new("check", 0)],
            targets: &[],
        })
        .expect("plan");

        let names: Vec<_> = plan.nodes().iter().map(PlanNode::name).collect();
        assert_eq!(names, vec!["a", "b", "check", "_xfer_a_0_to_CPU1", "_retval_b_0"]);
        assert_eq!(plan.fetches()[0].node, 4);
        assert!(plan.fetches()[0].yields_value);
        assert_eq!(plan.fetches()[1].node, 2);
        assert!(!plan.fetches()[1].yields_value);
        assert_eq!(plan.nodes()[1].data_inputs, vec![(3, 0)]);
    }

    #[test]
    fn feeds_replace_their_producers() {
        let graph = two_device_graph();
        let placements = placements(&graph);
        let kernels = KernelRegistry::with_builtin_kernels();
        let plan = build_plan(&PlanRequest {
            graph: &graph,
            placements: &placements,
            host: &cpu(0),
            kernels: &kernels,
            feeds: &[(TensorRef::new("b", 0), Tensor::scalar_f32(4.0))],
            fetches: &[TensorRef::new("b", 0)],
            targets: &[],
        })
        .expect("plan");
        let names: Vec<_> = plan.nodes().iter().map(PlanNode::name).collect();
        assert_eq!(names, vec!["_arg_b_0", "_retval_b_0"]);
    }

    #[test]
    fn rejects_out_of_range_fetch_ports() {
        let graph = two_device_graph();
        let placements = placements(&graph);
        let kernels = KernelRegistry::with_builtin_kernels();
        let result = build_plan(&PlanRequest {
            graph: &graph,
            placements: &placements,
            host: &cpu(0),
            kernels: &kernels,
            feeds: &[],
            fetches: &[TensorRef::new("b", 1)],
            targets: &[],
        });
        assert!(matches!(result, Err(PlanError::InvalidFetch { .. })));
    }
}
