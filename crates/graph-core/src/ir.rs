use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::{DType, Shape, Tensor};

/// Prefix marking an input as a control (ordering-only) dependency.
pub const CONTROL_INPUT_PREFIX: char = '^';

/// Prefix reserved for operations injected by the runtime.
pub const PLUMBING_PREFIX: char = '_';

/// Returns `true` for names reserved for runtime-injected plumbing operations:
/// either the name itself or one of its `/`-separated scopes starts with `_`.
pub fn is_plumbing_name(name: &str) -> bool {
    name.starts_with(PLUMBING_PREFIX) || name.contains("/_")
}

/// Reference to one output of an operation (`name` or `name:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorRef {
    pub node: String,
    pub port: usize,
}

impl TensorRef {
    pub fn new(node: impl Into<String>, port: usize) -> Self {
        Self {
            node: node.into(),
            port,
        }
    }

    /// Parse `name` or `name:port`.
    pub fn parse(raw: &str) -> Result<Self, InputParseError> {
        if raw.is_empty() {
            return Err(InputParseError::Empty);
        }
        match raw.rsplit_once(':') {
            Some((node, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                if node.is_empty() {
                    return Err(InputParseError::Malformed(raw.to_string()));
                }
                let port = port
                    .parse()
                    .map_err(|_| InputParseError::Malformed(raw.to_string()))?;
                Ok(Self::new(node, port))
            }
            Some(_) => Err(InputParseError::Malformed(raw.to_string())),
            None => Ok(Self::new(raw, 0)),
        }
    }
}

impl fmt::Display for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            f.write_str(&self.node)
        } else {
            write!(f, "{}:{}", self.node, self.port)
        }
    }
}

/// Errors produced when parsing input references.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputParseError {
    #[error("input reference is empty")]
    Empty,
    #[error("malformed input reference `{0}`")]
    Malformed(String),
}

/// Ordered input of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InputRef {
    /// Data edge carrying the referenced output.
    Data(TensorRef),
    /// Ordering-only dependency on the named operation.
    Control(String),
}

impl InputRef {
    pub fn parse(raw: &str) -> Result<Self, InputParseError> {
        match raw.strip_prefix(CONTROL_INPUT_PREFIX) {
            Some("") => Err(InputParseError::Malformed(raw.to_string())),
            Some(node) => Ok(InputRef::Control(node.to_string())),
            None => TensorRef::parse(raw).map(InputRef::Data),
        }
    }

    /// Name of the source operation.
    pub fn node(&self) -> &str {
        match self {
            InputRef::Data(tensor) => &tensor.node,
            InputRef::Control(node) => node,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, InputRef::Control(_))
    }
}

impl TryFrom<String> for InputRef {
    type Error = InputParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        InputRef::parse(&value)
    }
}

impl From<InputRef> for String {
    fn from(value: InputRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputRef::Data(tensor) => tensor.fmt(f),
            InputRef::Control(node) => write!(f, "{CONTROL_INPUT_PREFIX}{node}"),
        }
    }
}

/// Typed attribute value. Kernels validate attributes lazily, on first use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Type(DType),
    Shape(Shape),
    Tensor(Tensor),
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    IntList(Vec<i64>),
    TypeList(Vec<DType>),
}

impl AttrValue {
    fn kind_label(&self) -> &'static str {
        match self {
            AttrValue::Type(_) => "type",
            AttrValue::Shape(_) => "shape",
            AttrValue::Tensor(_) => "tensor",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Bool(_) => "bool",
            AttrValue::Str(_) => "string",
            AttrValue::IntList(_) => "int_list",
            AttrValue::TypeList(_) => "type_list",
        }
    }
}

impl From<DType> for AttrValue {
    fn from(value: DType) -> Self {
        AttrValue::Type(value)
    }
}

impl From<Shape> for AttrValue {
    fn from(value: Shape) -> Self {
        AttrValue::Shape(value)
    }
}

impl From<Tensor> for AttrValue {
    fn from(value: Tensor) -> Self {
        AttrValue::Tensor(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f32> for AttrValue {
    fn from(value: f32) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(value: Vec<i64>) -> Self {
        AttrValue::IntList(value)
    }
}

impl From<Vec<DType>> for AttrValue {
    fn from(value: Vec<DType>) -> Self {
        AttrValue::TypeList(value)
    }
}

/// Attribute lookup failures surfaced when a kernel consumes an attribute.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AttrError {
    #[error("operation `{op}` is missing attribute `{attr}`")]
    Missing { op: String, attr: String },
    #[error("attribute `{attr}` of operation `{op}` is {actual}, expected {expected}")]
    WrongType {
        op: String,
        attr: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// A named computational step. Fields are fixed once the operation is added to
/// a [`Graph`]; the `with_*` helpers only apply while constructing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    name: String,
    kind: String,
    #[serde(default)]
    inputs: Vec<InputRef>,
    #[serde(default)]
    attrs: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    device: String,
}

impl Operation {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            inputs: Vec::new(),
            attrs: BTreeMap::new(),
            device: String::new(),
        }
    }

    /// Append an input parsed from `name`, `name:port` or `^name`.
    pub fn with_input(mut self, raw: &str) -> Result<Self, InputParseError> {
        self.inputs.push(InputRef::parse(raw)?);
        Ok(self)
    }

    pub fn with_input_ref(mut self, input: InputRef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn inputs(&self) -> &[InputRef] {
        &self.inputs
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    /// Data inputs in declaration order.
    pub fn data_inputs(&self) -> impl Iterator<Item = &TensorRef> {
        self.inputs.iter().filter_map(|input| match input {
            InputRef::Data(tensor) => Some(tensor),
            InputRef::Control(_) => None,
        })
    }

    /// Names of control dependencies in declaration order.
    pub fn control_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|input| match input {
            InputRef::Control(node) => Some(node.as_str()),
            InputRef::Data(_) => None,
        })
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    fn required_attr(&self, key: &str) -> Result<&AttrValue, AttrError> {
        self.attrs.get(key).ok_or_else(|| AttrError::Missing {
            op: self.name.clone(),
            attr: key.to_string(),
        })
    }

    fn wrong_type(&self, key: &str, expected: &'static str, actual: &AttrValue) -> AttrError {
        AttrError::WrongType {
            op: self.name.clone(),
            attr: key.to_string(),
            expected,
            actual: actual.kind_label(),
        }
    }

    pub fn attr_dtype(&self, key: &str) -> Result<DType, AttrError> {
        match self.required_attr(key)? {
            AttrValue::Type(dtype) => Ok(*dtype),
            other => Err(self.wrong_type(key, "type", other)),
        }
    }

    pub fn attr_tensor(&self, key: &str) -> Result<&Tensor, AttrError> {
        match self.required_attr(key)? {
            AttrValue::Tensor(tensor) => Ok(tensor),
            other => Err(self.wrong_type(key, "tensor", other)),
        }
    }

    pub fn attr_int(&self, key: &str) -> Result<i64, AttrError> {
        match self.required_attr(key)? {
            AttrValue::Int(value) => Ok(*value),
            other => Err(self.wrong_type(key, "int", other)),
        }
    }

    pub fn attr_str(&self, key: &str) -> Result<&str, AttrError> {
        match self.required_attr(key)? {
            AttrValue::Str(value) => Ok(value),
            other => Err(self.wrong_type(key, "string", other)),
        }
    }

    pub fn attr_shape(&self, key: &str) -> Result<&Shape, AttrError> {
        match self.required_attr(key)? {
            AttrValue::Shape(shape) => Ok(shape),
            other => Err(self.wrong_type(key, "shape", other)),
        }
    }

    /// Optional boolean attribute with a default when absent.
    pub fn attr_bool_or(&self, key: &str, default: bool) -> Result<bool, AttrError> {
        match self.attrs.get(key) {
            None => Ok(default),
            Some(AttrValue::Bool(value)) => Ok(*value),
            Some(other) => Err(self.wrong_type(key, "bool", other)),
        }
    }

    /// Optional integer attribute with a default when absent.
    pub fn attr_int_or(&self, key: &str, default: i64) -> Result<i64, AttrError> {
        match self.attrs.get(key) {
            None => Ok(default),
            Some(AttrValue::Int(value)) => Ok(*value),
            Some(other) => Err(self.wrong_type(key, "int", other)),
        }
    }
}

/// Errors raised while assembling a graph.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("operation `{0}` already exists in graph")]
    DuplicateOperation(String),
    #[error("operation `{op}`: {source}")]
    InvalidInput {
        op: String,
        #[source]
        source: InputParseError,
    },
    #[error("operation name must not be empty")]
    EmptyName,
}

/// Set of operations, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    operations: Vec<Operation>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation, rejecting duplicate names.
    pub fn add(&mut self, op: Operation) -> Result<(), GraphError> {
        if op.name.is_empty() {
            return Err(GraphError::EmptyName);
        }
        if self.contains(&op.name) {
            return Err(GraphError::DuplicateOperation(op.name));
        }
        self.operations.push(op);
        Ok(())
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operation(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Rebuild the graph with every operation pinned to `device`.
    pub fn placed_on(self, device: &str) -> Self {
        Self {
            operations: self
                .operations
                .into_iter()
                .map(|op| op.with_device(device))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_control_inputs() {
        assert_eq!(
            InputRef::parse("while/Switch:1").unwrap(),
            InputRef::Data(TensorRef::new("while/Switch", 1))
        );
        assert_eq!(
            InputRef::parse("random").unwrap(),
            InputRef::Data(TensorRef::new("random", 0))
        );
        assert_eq!(
            InputRef::parse("^while/Merge").unwrap(),
            InputRef::Control("while/Merge".to_string())
        );
        assert!(InputRef::parse("^").is_err());
        assert!(InputRef::parse("op:x").is_err());
        assert!(InputRef::parse(":1").is_err());
    }

    #[test]
    fn plumbing_names_are_detected() {
        assert!(is_plumbing_name("_retval_y_0"));
        assert!(is_plumbing_name("stage/_send_0"));
        assert!(!is_plumbing_name("hash_table"));
        assert!(!is_plumbing_name("while/Exit"));
    }

    #[test]
    fn attributes_are_validated_on_use() {
        let op = Operation::new("c", "Const")
            .with_attr("dtype", DType::Int64)
            .with_attr("N", 2i64);
        assert_eq!(op.attr_dtype("dtype").unwrap(), DType::Int64);
        assert!(matches!(
            op.attr_dtype("N"),
            Err(AttrError::WrongType {
                expected: "type",
                actual: "int",
                ..
            })
        ));
        assert!(matches!(op.attr_tensor("value"), Err(AttrError::Missing { .. })));
        assert!(op.attr_bool_or("is_constant", false).is_ok());
    }

    #[test]
    fn graph_rejects_duplicate_names() {
        let mut graph = Graph::new();
        graph.add(Operation::new("a", "NoOp")).unwrap();
        let err = graph.add(Operation::new("a", "NoOp")).unwrap_err();
        assert_eq!(err, GraphError::DuplicateOperation("a".to_string()));
    }

    #[test]
    fn inputs_serialize_as_strings() {
        let op = Operation::new("y", "Identity")
            .with_input("x:1")
            .unwrap()
            .with_input("^init")
            .unwrap();
        let json = serde_json::to_value(&op).expect("serialize op");
        assert_eq!(json["inputs"], serde_json::json!(["x:1", "^init"]));
        let back: Operation = serde_json::from_value(json).expect("deserialize op");
        assert_eq!(back, op);
    }
}
