//! Core types, diagnostics, and graph IR structures for the local cluster.

mod builder;
mod device;
mod diagnostics;
mod ir;
mod item;
pub mod tensor;

pub use builder::{GraphBuilder, GraphBuilderError, OpHandle, OperationBuilder};
pub use device::{DeviceKind, DeviceName, DeviceNameError, LOCAL_JOB};
pub use diagnostics::{
    DIAGNOSTIC_CODES, Diagnostic, DiagnosticCode, Severity, diagnostic_code, diagnostic_codes,
};
pub use ir::*;
pub use item::{Feed, QueueRunner, WorkItem};
pub use serde_json;
pub use tensor::{
    DType, ResourceHandle, ResourceKind, Shape, Tensor, TensorData, TensorError,
};

/// Convenient prelude re-exporting the most commonly used items.
pub mod prelude {
    pub use crate::builder::{GraphBuilder, GraphBuilderError, OpHandle};
    pub use crate::device::{DeviceKind, DeviceName};
    pub use crate::ir::{AttrValue, Graph, InputRef, Operation, TensorRef, is_plumbing_name};
    pub use crate::item::{Feed, QueueRunner, WorkItem};
    pub use crate::tensor::{DType, Shape, Tensor};
}
