use async_trait::async_trait;
use graph_core::{DType, Operation, Shape, Tensor, TensorData};

use super::{KernelContext, KernelError, KernelOutput, KernelResult, OpKernel};

/// Element-wise single-input arithmetic.
pub enum UnaryKernel {
    Sign,
    Square,
}

#[async_trait]
impl OpKernel for UnaryKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let input = ctx.input_value(0)?;
        let data = match (self, input.data()) {
            (UnaryKernel::Sign, TensorData::Float32(v)) => TensorData::Float32(
                v.iter()
                    .map(|x| if *x == 0.0 { 0.0 } else { x.signum() })
                    .collect(),
            ),
            (UnaryKernel::Sign, TensorData::Int32(v)) => {
                TensorData::Int32(v.iter().map(|x| x.signum()).collect())
            }
            (UnaryKernel::Sign, TensorData::Int64(v)) => {
                TensorData::Int64(v.iter().map(|x| x.signum()).collect())
            }
            (UnaryKernel::Square, TensorData::Float32(v)) => {
                TensorData::Float32(v.iter().map(|x| x * x).collect())
            }
            (UnaryKernel::Square, TensorData::Int32(v)) => {
                TensorData::Int32(v.iter().map(|x| x.wrapping_mul(*x)).collect())
            }
            (UnaryKernel::Square, TensorData::Int64(v)) => {
                TensorData::Int64(v.iter().map(|x| x.wrapping_mul(*x)).collect())
            }
            (_, other) => return Err(unsupported(&ctx, other.dtype())),
        };
        Ok(KernelOutput::single(Tensor::new(input.shape().clone(), data)?))
    }
}

/// Element-wise two-input operations; a single-element operand broadcasts.
pub enum BinaryKernel {
    Add,
    Mul,
    Equal,
    Less,
}

#[async_trait]
impl OpKernel for BinaryKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let lhs = ctx.input_value(0)?;
        let rhs = ctx.input_value(1)?;
        if lhs.dtype() != rhs.dtype() {
            return Err(KernelError::invalid(format!(
                "operation `{}` mixes {} and {}",
                ctx.op().name(),
                lhs.dtype(),
                rhs.dtype()
            )));
        }
        let shape = broadcast_shape(&ctx, &lhs, &rhs)?;
        let data = match (self, lhs.data(), rhs.data()) {
            (BinaryKernel::Add, TensorData::Float32(a), TensorData::Float32(b)) => {
                TensorData::Float32(zip_map(a, b, |x, y| x + y))
            }
            (BinaryKernel::Add, TensorData::Int32(a), TensorData::Int32(b)) => {
                TensorData::Int32(zip_map(a, b, i32::wrapping_add))
            }
            (BinaryKernel::Add, TensorData::Int64(a), TensorData::Int64(b)) => {
                TensorData::Int64(zip_map(a, b, i64::wrapping_add))
            }
            (BinaryKernel::Mul, TensorData::Float32(a), TensorData::Float32(b)) => {
                TensorData::Float32(zip_map(a, b, |x, y| x * y))
            }
            (BinaryKernel::Mul, TensorData::Int32(a), TensorData::Int32(b)) => {
                TensorData::Int32(zip_map(a, b, i32::wrapping_mul))
            }
            (BinaryKernel::Mul, TensorData::Int64(a), TensorData::Int64(b)) => {
                TensorData::Int64(zip_map(a, b, i64::wrapping_mul))
            }
            (BinaryKernel::Equal, TensorData::Float32(a), TensorData::Float32(b)) => {
                TensorData::Bool(zip_map(a, b, |x, y| x == y))
            }
            (BinaryKernel::Equal, TensorData::Int32(a), TensorData::Int32(b)) => {
                TensorData::Bool(zip_map(a, b, |x, y| x == y))
            }
            (BinaryKernel::Equal, TensorData::Int64(a), TensorData::Int64(b)) => {
                TensorData::Bool(zip_map(a, b, |x, y| x == y))
            }
            (BinaryKernel::Equal, TensorData::Bool(a), TensorData::Bool(b)) => {
                TensorData::Bool(zip_map(a, b, |x, y| x == y))
            }
            (BinaryKernel::Less, TensorData::Float32(a), TensorData::Float32(b)) => {
                TensorData::Bool(zip_map(a, b, |x, y| x < y))
            }
            (BinaryKernel::Less, TensorData::Int32(a), TensorData::Int32(b)) => {
                TensorData::Bool(zip_map(a, b, |x, y| x < y))
            }
            (BinaryKernel::Less, TensorData::Int64(a), TensorData::Int64(b)) => {
                TensorData::Bool(zip_map(a, b, |x, y| x < y))
            }
            (_, other, _) => return Err(unsupported(&ctx, other.dtype())),
        };
        Ok(KernelOutput::single(Tensor::new(shape, data)?))
    }
}

/// Sum of N same-shaped inputs.
pub struct AddNKernel;

#[async_trait]
impl OpKernel for AddNKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let mut sum = ctx.input_value(0)?;
        for index in 1..ctx.num_inputs() {
            let next = ctx.input_value(index)?;
            if next.shape() != sum.shape() {
                return Err(KernelError::invalid(format!(
                    "AddN `{}` inputs disagree on shape: {} vs {}",
                    ctx.op().name(),
                    sum.shape(),
                    next.shape()
                )));
            }
            let data = match (sum.data(), next.data()) {
                (TensorData::Float32(a), TensorData::Float32(b)) => {
                    TensorData::Float32(zip_map(a, b, |x, y| x + y))
                }
                (TensorData::Int32(a), TensorData::Int32(b)) => {
                    TensorData::Int32(zip_map(a, b, i32::wrapping_add))
                }
                (TensorData::Int64(a), TensorData::Int64(b)) => {
                    TensorData::Int64(zip_map(a, b, i64::wrapping_add))
                }
                (other, _) => return Err(unsupported(&ctx, other.dtype())),
            };
            sum = Tensor::new(sum.shape().clone(), data)?;
        }
        Ok(KernelOutput::single(sum))
    }
}

pub struct ReshapeKernel;

#[async_trait]
impl OpKernel for ReshapeKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let input = ctx.input_value(0)?;
        let dims = int_vector(&ctx, &ctx.input_value(1)?)?;
        Ok(KernelOutput::single(input.reshape(&dims)?))
    }
}

pub struct ShapeKernel;

#[async_trait]
impl OpKernel for ShapeKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let input = ctx.input_value(0)?;
        let dims = input.shape().dims().to_vec();
        let rank = [dims.len() as i64];
        let out_type = ctx.op().attr_dtype("out_type").unwrap_or(DType::Int32);
        let shape = match out_type {
            DType::Int64 => Tensor::from_i64(&rank, dims)?,
            _ => Tensor::from_i32(&rank, dims.into_iter().map(|d| d as i32).collect())?,
        };
        Ok(KernelOutput::single(shape))
    }
}

/// Logical AND over the listed axes.
pub struct AllKernel;

#[async_trait]
impl OpKernel for AllKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let input = ctx.input_value(0)?;
        let values = input
            .as_bool()
            .ok_or_else(|| unsupported(&ctx, input.dtype()))?;
        let axes = int_vector(&ctx, &ctx.input_value(1)?)?;
        let keep_dims = ctx.op().attr_bool_or("keep_dims", false)?;
        let dims = input.shape().dims();
        let rank = dims.len() as i64;

        let mut reduced = vec![false; dims.len()];
        for axis in axes {
            let normalized = if axis < 0 { axis + rank } else { axis };
            if !(0..rank).contains(&normalized) {
                return Err(KernelError::invalid(format!(
                    "axis {axis} out of range for rank {rank}"
                )));
            }
            reduced[normalized as usize] = true;
        }

        let out_dims: Vec<i64> = dims
            .iter()
            .zip(&reduced)
            .filter_map(|(dim, is_reduced)| match (is_reduced, keep_dims) {
                (false, _) => Some(*dim),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect();
        let kept_dims: Vec<i64> = dims
            .iter()
            .zip(&reduced)
            .map(|(dim, is_reduced)| if *is_reduced { 1 } else { *dim })
            .collect();
        let out_len: i64 = kept_dims.iter().product();
        let mut out = vec![true; out_len.max(0) as usize];
        for (flat, value) in values.iter().enumerate() {
            let mut remainder = flat as i64;
            let mut out_index = 0i64;
            let mut stride = 1i64;
            for axis in (0..dims.len()).rev() {
                let coord = remainder % dims[axis];
                remainder /= dims[axis];
                if !reduced[axis] {
                    out_index += coord * stride;
                }
                stride *= kept_dims[axis];
            }
            out[out_index as usize] &= *value;
        }
        Ok(KernelOutput::single(Tensor::from_bool(&out_dims, out)?))
    }
}

/// Fails the step when its condition is false.
pub struct AssertKernel;

#[async_trait]
impl OpKernel for AssertKernel {
    fn num_outputs(&self, _op: &Operation) -> usize {
        0
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let condition = ctx.input_value(0)?;
        let holds = condition
            .as_bool()
            .ok_or_else(|| unsupported(&ctx, condition.dtype()))?
            .iter()
            .all(|value| *value);
        if holds {
            return Ok(KernelOutput::none());
        }
        let mut data = Vec::new();
        for index in 1..ctx.num_inputs() {
            let tensor = ctx.input_value(index)?;
            data.push(format!("{}{}", tensor.dtype(), tensor.shape()));
        }
        Err(KernelError::invalid(format!(
            "assertion `{}` failed; data: [{}]",
            ctx.op().name(),
            data.join(", ")
        )))
    }
}

fn unsupported(ctx: &KernelContext, dtype: DType) -> KernelError {
    KernelError::invalid(format!(
        "operation `{}` ({}) does not support {dtype}",
        ctx.op().name(),
        ctx.op().kind()
    ))
}

fn int_vector(ctx: &KernelContext, tensor: &Tensor) -> KernelResult<Vec<i64>> {
    tensor.to_i64_vec().ok_or_else(|| {
        KernelError::invalid(format!(
            "operation `{}` expects an integer operand, got {}",
            ctx.op().name(),
            tensor.dtype()
        ))
    })
}

fn broadcast_shape(ctx: &KernelContext, lhs: &Tensor, rhs: &Tensor) -> KernelResult<Shape> {
    if lhs.shape() == rhs.shape() {
        Ok(lhs.shape().clone())
    } else if rhs.num_elements() == 1 {
        Ok(lhs.shape().clone())
    } else if lhs.num_elements() == 1 {
        Ok(rhs.shape().clone())
    } else {
        Err(KernelError::invalid(format!(
            "operation `{}` cannot broadcast {} with {}",
            ctx.op().name(),
            lhs.shape(),
            rhs.shape()
        )))
    }
}

fn zip_map<T: Copy, U>(lhs: &[T], rhs: &[T], f: impl Fn(T, T) -> U) -> Vec<U> {
    let len = lhs.len().max(rhs.len());
    (0..len)
        .map(|i| {
            let a = if lhs.len() == 1 { lhs[0] } else { lhs[i] };
            let b = if rhs.len() == 1 { rhs[0] } else { rhs[i] };
            f(a, b)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernels::KernelRegistry;
    use crate::kernels::test_support::{only, run_kernel};
    use crate::resources::ResourceManager;

    async fn eval(kind: &str, inputs: Vec<Tensor>) -> KernelResult<KernelOutput> {
        let registry = KernelRegistry::with_builtin_kernels();
        run_kernel(
            &registry,
            Operation::new("op", kind),
            inputs,
            Arc::new(ResourceManager::new()),
        )
        .await
    }

    #[tokio::test]
    async fn add_then_square_then_reshape() {
        let zero = Tensor::filled_f32(&[2, 3], 0.0).unwrap();
        let one = Tensor::filled_f32(&[2, 3], 1.0).unwrap();
        let add = only(eval("Add", vec![zero, one]).await.expect("add"));
        let square = only(eval("Square", vec![add]).await.expect("square"));
        let reshaped = only(
            eval("Reshape", vec![square, Tensor::vector_i32(&[3, -1])])
                .await
                .expect("reshape"),
        );
        assert_eq!(reshaped.shape().dims(), &[3, 2]);
        let shape = only(eval("Shape", vec![reshaped]).await.expect("shape"));
        assert_eq!(shape, Tensor::vector_i32(&[3, 2]));
    }

    #[tokio::test]
    async fn equal_then_all_over_axis_zero() {
        let valid = only(
            eval(
                "Equal",
                vec![Tensor::vector_i32(&[3, 2]), Tensor::vector_i32(&[3, 2])],
            )
            .await
            .expect("equal"),
        );
        let all = only(
            eval("All", vec![valid, Tensor::vector_i32(&[0])])
                .await
                .expect("all"),
        );
        assert_eq!(all, Tensor::scalar_bool(true));
    }

    #[tokio::test]
    async fn all_reduces_inner_axis() {
        let input = Tensor::from_bool(&[2, 2], vec![true, false, true, true]).unwrap();
        let all = only(
            eval("All", vec![input, Tensor::vector_i32(&[1])])
                .await
                .expect("all"),
        );
        assert_eq!(all, Tensor::from_bool(&[2], vec![false, true]).unwrap());
    }

    #[tokio::test]
    async fn assert_false_fails_the_kernel() {
        let result = eval(
            "Assert",
            vec![Tensor::scalar_bool(false), Tensor::vector_i32(&[3, 2])],
        )
        .await;
        assert!(matches!(result, Err(KernelError::InvalidArgument(msg)) if msg.contains("int32[2]")));
        let ok = eval("Assert", vec![Tensor::scalar_bool(true)])
            .await
            .expect("assert true");
        assert!(ok.outputs.is_empty());
    }

    #[tokio::test]
    async fn add_n_and_sign() {
        let a = Tensor::from_f32(&[2], vec![-1.0, 2.0]).unwrap();
        let sum = only(
            eval("AddN", vec![a.clone(), a.clone(), a])
                .await
                .expect("addn"),
        );
        assert_eq!(sum.as_f32(), Some(&[-3.0, 6.0][..]));
        let sign = only(eval("Sign", vec![sum]).await.expect("sign"));
        assert_eq!(sign.as_f32(), Some(&[-1.0, 1.0][..]));
    }

    #[tokio::test]
    async fn dtype_mismatch_is_rejected() {
        let result = eval("Add", vec![Tensor::scalar_f32(1.0), Tensor::scalar_i32(1)]).await;
        assert!(matches!(result, Err(KernelError::InvalidArgument(_))));
    }
}
