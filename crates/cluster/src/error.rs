use std::time::Duration;

use cluster_exec::{DeviceError, ExecutionError, KernelError, SessionError};
use graph_core::Diagnostic;
use thiserror::Error;

/// Coarse classification of [`ClusterError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad configuration or work item; retrying will not help.
    Configuration,
    DeadlineExceeded,
    /// The cluster was shut down or is wedged.
    Unavailable,
    /// The call is not valid in the current lifecycle state.
    FailedPrecondition,
    /// An operation failed while executing.
    Execution,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::Execution => "execution",
        }
    }
}

/// Errors returned by the cluster's public operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("work item failed validation: {}", join(.diagnostics))]
    InvalidGraph { diagnostics: Vec<Diagnostic> },
    #[error("work item references unavailable devices: {}", join(.diagnostics))]
    UnknownDevice { diagnostics: Vec<Diagnostic> },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{operation} did not finish within {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("operation `{node}` failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: KernelError,
    },
    #[error("fetch `{0}` was never produced")]
    MissingFetch(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::InvalidConfig(_)
            | ClusterError::InvalidGraph { .. }
            | ClusterError::UnknownDevice { .. }
            | ClusterError::InvalidArgument(_) => ErrorKind::Configuration,
            ClusterError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            ClusterError::Unavailable(_) => ErrorKind::Unavailable,
            ClusterError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            ClusterError::NodeFailed { .. } | ClusterError::MissingFetch(_) => ErrorKind::Execution,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.kind() == ErrorKind::DeadlineExceeded
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    pub(crate) fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let device_codes = ["GRAPH202", "GRAPH203"];
        if diagnostics
            .iter()
            .any(|diag| device_codes.contains(&diag.code.code))
        {
            ClusterError::UnknownDevice { diagnostics }
        } else {
            ClusterError::InvalidGraph { diagnostics }
        }
    }
}

impl From<DeviceError> for ClusterError {
    fn from(err: DeviceError) -> Self {
        ClusterError::InvalidConfig(err.to_string())
    }
}

impl From<SessionError> for ClusterError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Execution(ExecutionError::NodeFailed { node, source }) => {
                ClusterError::NodeFailed { node, source }
            }
            SessionError::Execution(ExecutionError::MissingFetch(name)) => {
                ClusterError::MissingFetch(name)
            }
            SessionError::Plan(err) => ClusterError::InvalidArgument(err.to_string()),
            SessionError::InvalidReference { .. } | SessionError::FoldedFeed { .. } => {
                ClusterError::InvalidArgument(err.to_string())
            }
            SessionError::Graph(err) => ClusterError::FailedPrecondition(err.to_string()),
            SessionError::Closed => ClusterError::Unavailable("session closed".into()),
        }
    }
}

fn join(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
