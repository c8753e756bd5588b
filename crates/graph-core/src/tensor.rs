use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type carried by a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// 32-bit IEEE float.
    Float32,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// Boolean stored as one byte.
    Bool,
    /// Variable-length UTF-8 string.
    String,
    /// Handle to a session-owned resource (variable, table, queue).
    Resource,
}

impl DType {
    /// Width of one element in bytes. Strings report zero; their payload is
    /// accounted from the string lengths instead.
    pub fn size_bytes(self) -> u64 {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Int64 | DType::Resource => 8,
            DType::Bool => 1,
            DType::String => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Bool => "bool",
            DType::String => "string",
            DType::Resource => "resource",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered dimension sizes. `-1` marks an unknown dimension and only appears in
/// declared shapes (attributes), never in produced tensors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(pub Vec<i64>);

impl Shape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when every dimension is known.
    pub fn is_fully_defined(&self) -> bool {
        self.0.iter().all(|dim| *dim >= 0)
    }

    /// Number of elements, or `None` when a dimension is unknown.
    pub fn num_elements(&self) -> Option<u64> {
        self.0.iter().try_fold(1u64, |acc, dim| {
            u64::try_from(*dim).ok().map(|dim| acc.saturating_mul(dim))
        })
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

/// Kind of session-owned resource a handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Variable,
    Table,
    Queue,
}

/// Reference to a resource living in the execution session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    /// Shared name of the resource (defaults to the creating operation's name).
    pub name: String,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Flat element storage of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum TensorData {
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Bool(Vec<bool>),
    String(Vec<String>),
    Resource(Vec<ResourceHandle>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Float32(_) => DType::Float32,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Int64(_) => DType::Int64,
            TensorData::Bool(_) => DType::Bool,
            TensorData::String(_) => DType::String,
            TensorData::Resource(_) => DType::Resource,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Float32(values) => values.len(),
            TensorData::Int32(values) => values.len(),
            TensorData::Int64(values) => values.len(),
            TensorData::Bool(values) => values.len(),
            TensorData::String(values) => values.len(),
            TensorData::Resource(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors raised when constructing or reshaping tensors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {shape} holds {expected} elements but {actual} were supplied")]
    LengthMismatch {
        shape: Shape,
        expected: u64,
        actual: usize,
    },
    #[error("shape {0} is not fully defined")]
    UndefinedShape(Shape),
    #[error("cannot reshape {from} elements into {to}")]
    Reshape { from: u64, to: Shape },
}

/// Dense tensor value. Kernels treat it as an opaque payload apart from dtype,
/// shape and byte-size accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking the element count against the shape.
    pub fn new(shape: impl Into<Shape>, data: TensorData) -> Result<Self, TensorError> {
        let shape = shape.into();
        let expected = shape
            .num_elements()
            .ok_or_else(|| TensorError::UndefinedShape(shape.clone()))?;
        if expected != data.len() as u64 {
            return Err(TensorError::LengthMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::scalar(TensorData::Float32(vec![value]))
    }

    pub fn scalar_i32(value: i32) -> Self {
        Self::scalar(TensorData::Int32(vec![value]))
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self::scalar(TensorData::Int64(vec![value]))
    }

    pub fn scalar_bool(value: bool) -> Self {
        Self::scalar(TensorData::Bool(vec![value]))
    }

    pub fn resource(handle: ResourceHandle) -> Self {
        Self::scalar(TensorData::Resource(vec![handle]))
    }

    fn scalar(data: TensorData) -> Self {
        Self {
            shape: Shape::scalar(),
            data,
        }
    }

    /// Tensor of the given fully-defined shape with every element set to `value`.
    pub fn filled_f32(dims: &[i64], value: f32) -> Result<Self, TensorError> {
        let count = element_count(dims)?;
        Self::new(dims, TensorData::Float32(vec![value; count]))
    }

    pub fn from_f32(dims: &[i64], values: Vec<f32>) -> Result<Self, TensorError> {
        Self::new(dims, TensorData::Float32(values))
    }

    pub fn from_i32(dims: &[i64], values: Vec<i32>) -> Result<Self, TensorError> {
        Self::new(dims, TensorData::Int32(values))
    }

    pub fn from_i64(dims: &[i64], values: Vec<i64>) -> Result<Self, TensorError> {
        Self::new(dims, TensorData::Int64(values))
    }

    pub fn from_bool(dims: &[i64], values: Vec<bool>) -> Result<Self, TensorError> {
        Self::new(dims, TensorData::Bool(values))
    }

    /// Rank-1 int32 vector, handy for shape operands.
    pub fn vector_i32(values: &[i32]) -> Self {
        Self {
            shape: Shape::new(vec![values.len() as i64]),
            data: TensorData::Int32(values.to_vec()),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// Lower bound of the payload size in bytes.
    pub fn byte_size(&self) -> u64 {
        match &self.data {
            TensorData::String(values) => values.iter().map(|value| value.len() as u64).sum(),
            data => data.len() as u64 * data.dtype().size_bytes(),
        }
    }

    /// Reinterpret the elements under a new shape. A single `-1` dimension is
    /// inferred from the element count.
    pub fn reshape(self, dims: &[i64]) -> Result<Self, TensorError> {
        let total = self.data.len() as u64;
        let known: u64 = dims
            .iter()
            .filter(|dim| **dim >= 0)
            .map(|dim| *dim as u64)
            .product();
        let unknown = dims.iter().filter(|dim| **dim < 0).count();
        let resolved: Vec<i64> = match unknown {
            0 => dims.to_vec(),
            1 if known > 0 && total % known == 0 => dims
                .iter()
                .map(|dim| if *dim < 0 { (total / known) as i64 } else { *dim })
                .collect(),
            _ => {
                return Err(TensorError::Reshape {
                    from: total,
                    to: Shape::from(dims),
                });
            }
        };
        let target = Shape::new(resolved);
        if target.num_elements() != Some(total) {
            return Err(TensorError::Reshape {
                from: total,
                to: target,
            });
        }
        Ok(Self {
            shape: target,
            data: self.data,
        })
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::Float32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::Int32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::Int64(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match &self.data {
            TensorData::Bool(values) => Some(values),
            _ => None,
        }
    }

    /// Single resource handle carried by a scalar resource tensor.
    pub fn as_resource(&self) -> Option<&ResourceHandle> {
        match &self.data {
            TensorData::Resource(values) if values.len() == 1 => values.first(),
            _ => None,
        }
    }

    /// Integer elements widened to `i64`, for shape and index operands.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match &self.data {
            TensorData::Int32(values) => Some(values.iter().map(|v| i64::from(*v)).collect()),
            TensorData::Int64(values) => Some(values.clone()),
            _ => None,
        }
    }
}

fn element_count(dims: &[i64]) -> Result<usize, TensorError> {
    Shape::from(dims)
        .num_elements()
        .map(|count| count as usize)
        .ok_or_else(|| TensorError::UndefinedShape(Shape::from(dims)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_tracks_dtype_width() {
        let floats = Tensor::filled_f32(&[10, 1], 0.0).unwrap();
        assert_eq!(floats.byte_size(), 40);
        let longs = Tensor::from_i64(&[2], vec![123, 321]).unwrap();
        assert_eq!(longs.byte_size(), 16);
        let strings = Tensor::new(
            vec![2],
            TensorData::String(vec!["ab".into(), "cde".into()]),
        )
        .unwrap();
        assert_eq!(strings.byte_size(), 5);
    }

    #[test]
    fn reshape_infers_single_unknown_dimension() {
        let tensor = Tensor::filled_f32(&[2, 3], 1.0).unwrap();
        let reshaped = tensor.reshape(&[3, -1]).unwrap();
        assert_eq!(reshaped.shape().dims(), &[3, 2]);
    }

    #[test]
    fn reshape_rejects_incompatible_shape() {
        let tensor = Tensor::filled_f32(&[2, 3], 1.0).unwrap();
        let err = tensor.reshape(&[4, -1]).unwrap_err();
        assert!(matches!(err, TensorError::Reshape { from: 6, .. }));
    }

    #[test]
    fn new_checks_element_count() {
        let err = Tensor::from_i32(&[3], vec![1, 2]).unwrap_err();
        assert_eq!(
            err,
            TensorError::LengthMismatch {
                shape: Shape::new(vec![3]),
                expected: 3,
                actual: 2
            }
        );
    }
}
