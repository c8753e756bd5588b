//! Operation kernels and the registry that resolves them by kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use graph_core::{AttrError, DType, DeviceName, Operation, ResourceKind, Tensor, TensorError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::resources::ResourceManager;

mod basic;
mod control;
mod math;
mod queue;
mod random;
mod state;

/// Kind of the feed placeholder injected for every fed tensor.
pub const ARG_KIND: &str = "_Arg";
/// Kind of the identity injected for every fetched tensor.
pub const RETVAL_KIND: &str = "_Retval";
/// Kind of the identity injected on cross-device edges.
pub const TRANSFER_KIND: &str = "_Transfer";

/// Result alias used by kernels.
pub type KernelResult<T> = Result<T, KernelError>;

/// Failures raised while computing an operation.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Attr(#[from] AttrError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("session resources are closed")]
    Unavailable,
}

impl KernelError {
    pub fn invalid(message: impl Into<String>) -> Self {
        KernelError::InvalidArgument(message.into())
    }

    /// Stable label used for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            KernelError::InvalidArgument(_) => "invalid_argument",
            KernelError::Attr(_) => "attribute",
            KernelError::Tensor(_) => "tensor",
            KernelError::FailedPrecondition(_) => "failed_precondition",
            KernelError::OutOfRange(_) => "out_of_range",
            KernelError::Cancelled => "cancelled",
            KernelError::Unavailable => "unavailable",
        }
    }
}

/// Everything a kernel sees for one execution.
#[derive(Clone)]
pub struct KernelContext {
    op: Arc<Operation>,
    inputs: Vec<Tensor>,
    input_index: Option<usize>,
    device: DeviceName,
    resources: Arc<ResourceManager>,
    cancellation: CancellationToken,
}

impl KernelContext {
    pub fn new(
        op: Arc<Operation>,
        inputs: Vec<Tensor>,
        device: DeviceName,
        resources: Arc<ResourceManager>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            op,
            inputs,
            input_index: None,
            device,
            resources,
            cancellation,
        }
    }

    /// Record which data input delivered the value (used by `Merge`).
    pub fn with_input_index(mut self, index: usize) -> Self {
        self.input_index = Some(index);
        self
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn device(&self) -> &DeviceName {
        &self.device
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input_index(&self) -> Option<usize> {
        self.input_index
    }

    /// Raw input, without dereferencing variable handles.
    pub fn input(&self, index: usize) -> KernelResult<&Tensor> {
        self.inputs.get(index).ok_or_else(|| {
            KernelError::invalid(format!(
                "operation `{}` expects at least {} inputs, got {}",
                self.op.name(),
                index + 1,
                self.inputs.len()
            ))
        })
    }

    /// Input value; variable handles are read through the resource manager.
    pub fn input_value(&self, index: usize) -> KernelResult<Tensor> {
        let tensor = self.input(index)?;
        match tensor.as_resource() {
            Some(handle) if handle.kind == ResourceKind::Variable => {
                self.resources.read_variable(&handle.name)
            }
            _ => Ok(tensor.clone()),
        }
    }

    /// Input that must carry a handle to a resource of `kind`.
    pub fn resource_input(&self, index: usize, kind: ResourceKind) -> KernelResult<String> {
        let tensor = self.input(index)?;
        match tensor.as_resource() {
            Some(handle) if handle.kind == kind => Ok(handle.name.clone()),
            _ => Err(KernelError::invalid(format!(
                "input {index} of `{}` must be a {kind:?} handle, got {}",
                self.op.name(),
                tensor.dtype()
            ))),
        }
    }

    /// Shared resource name: the `shared_name` attribute when set, otherwise
    /// the operation name.
    pub fn shared_name(&self) -> String {
        match self.op.attr_str("shared_name") {
            Ok(name) if !name.is_empty() => name.to_string(),
            _ => self.op.name().to_string(),
        }
    }

    pub(crate) fn expect_dtype(&self, tensor: &Tensor, dtype: DType) -> KernelResult<()> {
        if tensor.dtype() == dtype {
            Ok(())
        } else {
            Err(KernelError::invalid(format!(
                "operation `{}` expected {dtype}, got {}",
                self.op.name(),
                tensor.dtype()
            )))
        }
    }
}

/// Produced values plus any state retained beyond the step.
#[derive(Debug, Default)]
pub struct KernelOutput {
    /// One entry per output port; `None` marks a dead output.
    pub outputs: Vec<Option<Tensor>>,
    /// Bytes retained by session resources as a result of this execution.
    pub persistent_bytes: u64,
}

impl KernelOutput {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn single(tensor: Tensor) -> Self {
        Self {
            outputs: vec![Some(tensor)],
            persistent_bytes: 0,
        }
    }

    pub fn many(tensors: Vec<Tensor>) -> Self {
        Self {
            outputs: tensors.into_iter().map(Some).collect(),
            persistent_bytes: 0,
        }
    }

    pub fn with_persistent_bytes(mut self, bytes: u64) -> Self {
        self.persistent_bytes = bytes;
        self
    }
}

/// Executable implementation of an operation kind.
#[async_trait]
pub trait OpKernel: Send + Sync {
    /// Number of output ports the operation produces.
    fn num_outputs(&self, _op: &Operation) -> usize {
        1
    }

    /// Whether the kernel may be evaluated ahead of time when all inputs are
    /// constant.
    fn is_stateless(&self) -> bool {
        false
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput>;
}

/// Errors produced when registering kernels.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("kernel `{0}` already registered")]
    Duplicate(&'static str),
}

/// Registry mapping operation kinds to kernels.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<&'static str, Arc<dyn OpKernel>>,
}

impl KernelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// Registry populated with every built-in kernel.
    pub fn with_builtin_kernels() -> Self {
        let mut registry = Self::new();
        for (kind, kernel) in builtin_kernels() {
            // Built-in kinds are distinct.
            let _ = registry.register(kind, kernel);
        }
        registry
    }

    /// Register a kernel for `kind`.
    pub fn register(
        &mut self,
        kind: &'static str,
        kernel: Arc<dyn OpKernel>,
    ) -> Result<(), RegistryError> {
        if self.kernels.contains_key(kind) {
            return Err(RegistryError::Duplicate(kind));
        }
        self.kernels.insert(kind, kernel);
        Ok(())
    }

    /// Lookup a kernel by operation kind.
    pub fn kernel(&self, kind: &str) -> Option<Arc<dyn OpKernel>> {
        self.kernels.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kernels.contains_key(kind)
    }
}

fn builtin_kernels() -> Vec<(&'static str, Arc<dyn OpKernel>)> {
    let mut kernels: Vec<(&'static str, Arc<dyn OpKernel>)> = vec![
        ("Const", Arc::new(basic::ConstKernel)),
        (ARG_KIND, Arc::new(basic::ConstKernel)),
        ("Placeholder", Arc::new(basic::PlaceholderKernel)),
        ("Identity", Arc::new(basic::IdentityKernel)),
        (RETVAL_KIND, Arc::new(basic::IdentityKernel)),
        (TRANSFER_KIND, Arc::new(basic::TransferKernel)),
        ("NoOp", Arc::new(basic::NoOpKernel)),
        ("Sign", Arc::new(math::UnaryKernel::Sign)),
        ("Square", Arc::new(math::UnaryKernel::Square)),
        ("Add", Arc::new(math::BinaryKernel::Add)),
        ("Mul", Arc::new(math::BinaryKernel::Mul)),
        ("Equal", Arc::new(math::BinaryKernel::Equal)),
        ("Less", Arc::new(math::BinaryKernel::Less)),
        ("AddN", Arc::new(math::AddNKernel)),
        ("Reshape", Arc::new(math::ReshapeKernel)),
        ("Shape", Arc::new(math::ShapeKernel)),
        ("All", Arc::new(math::AllKernel)),
        ("Assert", Arc::new(math::AssertKernel)),
        ("RandomUniform", Arc::new(random::RandomKernel::Uniform)),
        ("RandomNormal", Arc::new(random::RandomKernel::Normal)),
        ("Assign", Arc::new(state::AssignKernel)),
        ("Enter", Arc::new(control::ForwardKernel)),
        ("Exit", Arc::new(control::ForwardKernel)),
        ("NextIteration", Arc::new(control::ForwardKernel)),
        ("LoopCond", Arc::new(control::LoopCondKernel)),
        ("Merge", Arc::new(control::MergeKernel)),
        ("Switch", Arc::new(control::SwitchKernel)),
        ("FIFOQueue", Arc::new(queue::FifoQueueKernel)),
        ("QueueClose", Arc::new(queue::QueueCloseKernel)),
    ];
    for kind in ["Variable", "VariableV2"] {
        kernels.push((kind, Arc::new(state::VariableKernel)));
    }
    for kind in ["HashTable", "HashTableV2"] {
        kernels.push((kind, Arc::new(state::HashTableKernel)));
    }
    for kind in ["InitializeTable", "InitializeTableV2"] {
        kernels.push((kind, Arc::new(state::InitializeTableKernel)));
    }
    for kind in ["LookupTableFind", "LookupTableFindV2"] {
        kernels.push((kind, Arc::new(state::LookupTableFindKernel)));
    }
    for kind in ["QueueEnqueue", "QueueEnqueueV2"] {
        kernels.push((kind, Arc::new(queue::QueueEnqueueKernel)));
    }
    for kind in ["QueueDequeue", "QueueDequeueV2"] {
        kernels.push((kind, Arc::new(queue::QueueDequeueKernel)));
    }
    kernels
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Run a kernel against fresh resources on the first CPU.
    pub async fn run_kernel(
        registry: &KernelRegistry,
        op: Operation,
        inputs: Vec<Tensor>,
        resources: Arc<ResourceManager>,
    ) -> KernelResult<KernelOutput> {
        let kernel = registry.kernel(op.kind()).expect("kernel registered");
        let ctx = KernelContext::new(
            Arc::new(op),
            inputs,
            DeviceName::local(graph_core::DeviceKind::Cpu, 0),
            resources,
            CancellationToken::new(),
        );
        kernel.compute(ctx).await
    }

    pub fn only(output: KernelOutput) -> Tensor {
        output
            .outputs
            .into_iter()
            .next()
            .flatten()
            .expect("live output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl OpKernel for Echo {
        async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
            Ok(KernelOutput::single(ctx.input(0)?.clone()))
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = KernelRegistry::new();
        registry.register("Echo", Arc::new(Echo)).expect("first");
        assert_eq!(
            registry.register("Echo", Arc::new(Echo)).unwrap_err(),
            RegistryError::Duplicate("Echo")
        );
    }

    #[test]
    fn builtins_cover_loop_and_state_kinds() {
        let registry = KernelRegistry::with_builtin_kernels();
        for kind in [
            "Enter",
            "Merge",
            "Switch",
            "LoopCond",
            "NextIteration",
            "Exit",
            "HashTable",
            "InitializeTable",
            "FIFOQueue",
            "QueueDequeue",
            "VariableV2",
            "Assign",
            RETVAL_KIND,
        ] {
            assert!(registry.contains(kind), "{kind} missing");
        }
    }
}
