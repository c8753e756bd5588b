use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Canonical diagnostic severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Initialization must halt.
    Error,
    /// Execution may proceed.
    Warn,
}

/// Structured metadata for a diagnostic emitted by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticCode {
    /// Stable identifier (e.g. `GRAPH200`).
    pub code: &'static str,
    /// Primary subsystem or producer of the diagnostic.
    pub subsystem: &'static str,
    pub default_severity: Severity,
    /// Short human-readable description.
    pub summary: &'static str,
}

/// Concrete diagnostic emitted during validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: &'static DiagnosticCode,
    /// Long form message presented to the user.
    pub message: String,
    /// Operation or work-item field the diagnostic points at.
    pub location: Option<String>,
}

impl Diagnostic {
    pub fn new(code: &'static DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.code.default_severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.code, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {location})")?;
        }
        Ok(())
    }
}

/// Public accessor for the registry.
pub fn diagnostic_codes() -> &'static [DiagnosticCode] {
    &DIAGNOSTIC_CODES
}

/// Look up a registered code by identifier.
pub fn diagnostic_code(code: &str) -> Option<&'static DiagnosticCode> {
    DIAGNOSTIC_CODES.iter().find(|entry| entry.code == code)
}

/// Canonical diagnostic registry used across the workspace.
pub static DIAGNOSTIC_CODES: Lazy<Vec<DiagnosticCode>> = Lazy::new(|| {
    vec![
        DiagnosticCode {
            code: "GRAPH200",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Cycle detected outside a NextIteration back edge",
        },
        DiagnosticCode {
            code: "GRAPH201",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Input references an operation missing from the graph",
        },
        DiagnosticCode {
            code: "GRAPH202",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Operation is placed on a device the cluster does not provide",
        },
        DiagnosticCode {
            code: "GRAPH203",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Device placement string is malformed",
        },
        DiagnosticCode {
            code: "GRAPH204",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Fetch references an unknown operation",
        },
        DiagnosticCode {
            code: "GRAPH205",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Duplicate operation name encountered in graph",
        },
        DiagnosticCode {
            code: "GRAPH206",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Feed references an unknown operation",
        },
        DiagnosticCode {
            code: "GRAPH207",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Init op references an unknown operation",
        },
        DiagnosticCode {
            code: "GRAPH208",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Queue runner references an unknown operation",
        },
        DiagnosticCode {
            code: "GRAPH209",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Fetch or feed name is not a valid tensor reference",
        },
        DiagnosticCode {
            code: "GRAPH210",
            subsystem: "validation",
            default_severity: Severity::Error,
            summary: "Operation kind has no registered kernel",
        },
        DiagnosticCode {
            code: "GRAPH211",
            subsystem: "validation",
            default_severity: Severity::Warn,
            summary: "Work item requests no fetches",
        },
    ]
});
