use std::collections::BTreeSet;

use crate::ir::{AttrValue, Graph, GraphError, InputParseError, InputRef, Operation};

/// Errors produced by the graph builder.
#[derive(Debug, thiserror::Error)]
pub enum GraphBuilderError {
    /// Attempted to add an operation with a duplicate name.
    #[error("operation `{0}` already exists in graph")]
    DuplicateOperation(String),
    /// An input string could not be parsed.
    #[error("operation `{op}` has an invalid input: {source}")]
    InvalidInput {
        op: String,
        #[source]
        source: InputParseError,
    },
    /// Graph assembly rejected the operation.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Handle referencing an operation added to the builder.
#[derive(Debug, Clone)]
pub struct OpHandle {
    name: String,
}

impl OpHandle {
    /// Access the operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference output `port` of this operation as an input string.
    pub fn output(&self, port: usize) -> String {
        if port == 0 {
            self.name.clone()
        } else {
            format!("{}:{port}", self.name)
        }
    }

    /// Reference this operation as a control dependency.
    pub fn control(&self) -> String {
        format!("^{}", self.name)
    }
}

/// Builder used by tests and harnesses to assemble graphs.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    names: BTreeSet<String>,
    default_device: String,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device applied to every operation that does not pick one explicitly.
    pub fn default_device(mut self, device: impl Into<String>) -> Self {
        self.default_device = device.into();
        self
    }

    /// Start a new operation; call [`OperationBuilder::finish`] to add it.
    pub fn op<'a>(
        &'a mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> OperationBuilder<'a> {
        let name = name.into();
        let device = self.default_device.clone();
        OperationBuilder {
            builder: self,
            op: Operation::new(name, kind).with_device(device),
            error: None,
        }
    }

    fn insert(&mut self, op: Operation) -> Result<OpHandle, GraphBuilderError> {
        let name = op.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(GraphBuilderError::DuplicateOperation(name));
        }
        self.graph.add(op)?;
        Ok(OpHandle { name })
    }

    /// Finalise and return the constructed graph.
    pub fn build(self) -> Graph {
        self.graph
    }
}

/// In-progress operation tied to a [`GraphBuilder`].
pub struct OperationBuilder<'a> {
    builder: &'a mut GraphBuilder,
    op: Operation,
    error: Option<GraphBuilderError>,
}

impl OperationBuilder<'_> {
    /// Add a data (`name`, `name:port`) or control (`^name`) input.
    pub fn input(mut self, raw: impl AsRef<str>) -> Self {
        if self.error.is_some() {
            return self;
        }
        match InputRef::parse(raw.as_ref()) {
            Ok(input) => self.op = self.op.with_input_ref(input),
            Err(source) => {
                self.error = Some(GraphBuilderError::InvalidInput {
                    op: self.op.name().to_string(),
                    source,
                })
            }
        }
        self
    }

    /// Add a control dependency on `name`.
    pub fn control_input(mut self, name: impl Into<String>) -> Self {
        self.op = self.op.with_input_ref(InputRef::Control(name.into()));
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.op = self.op.with_attr(key, value);
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.op = self.op.with_device(device);
        self
    }

    pub fn finish(self) -> Result<OpHandle, GraphBuilderError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.builder.insert(self.op)
    }
}
