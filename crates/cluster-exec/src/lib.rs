//! Execution layer of the local cluster: kernels, per-session resources,
//! step planning, the dataflow executor and cost accounting.

pub mod cost;
pub mod devices;
pub mod executor;
pub mod kernels;
mod metrics;
pub mod optimizer;
pub mod plan;
pub mod resources;
pub mod session;

pub use cost::{CostCollector, ExecutionReport, OpCostRecord, OutputInfo, StepStats};
pub use devices::{Device, DeviceError, DeviceRegistry, PlacementTarget};
pub use executor::{ExecutionError, FetchedTensor, StepContext, StepOutcome, execute_step};
pub use kernels::{
    KernelContext, KernelError, KernelOutput, KernelRegistry, KernelResult, OpKernel,
    RegistryError,
};
pub use metrics::StepKind;
pub use optimizer::{OptimizationSummary, optimize, prune};
pub use plan::{FetchSpec, PlanError, PlanNode, PlanRequest, StepPlan, build_plan};
pub use resources::{FifoQueue, LookupTable, ResourceManager};
pub use session::{ExecutionSession, SessionError};
