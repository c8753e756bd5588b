use async_trait::async_trait;
use graph_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{KernelContext, KernelError, KernelOutput, KernelResult, OpKernel};

/// Random initialisers. Shape comes from the first input when present,
/// otherwise from the `shape` attribute; a non-zero `seed` makes the output
/// reproducible.
pub enum RandomKernel {
    Uniform,
    Normal,
}

#[async_trait]
impl OpKernel for RandomKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let dims = if ctx.num_inputs() > 0 {
            let shape = ctx.input_value(0)?;
            shape.to_i64_vec().ok_or_else(|| {
                KernelError::invalid(format!(
                    "`{}` expects an integer shape, got {}",
                    ctx.op().name(),
                    shape.dtype()
                ))
            })?
        } else {
            ctx.op().attr_shape("shape")?.dims().to_vec()
        };
        let dtype = ctx.op().attr_dtype("dtype").unwrap_or(DType::Float32);
        if dtype != DType::Float32 {
            return Err(KernelError::invalid(format!(
                "`{}` only produces float32, requested {dtype}",
                ctx.op().name()
            )));
        }
        if dims.iter().any(|dim| *dim < 0) {
            return Err(KernelError::invalid(format!(
                "`{}` requires a defined shape",
                ctx.op().name()
            )));
        }
        let count = dims
            .iter()
            .try_fold(1usize, |acc, dim| {
                usize::try_from(*dim).ok().and_then(|dim| acc.checked_mul(dim))
            })
            .filter(|count| {
                count
                    .checked_mul(size_of::<f32>())
                    .is_some_and(|bytes| bytes <= isize::MAX as usize)
            })
            .ok_or_else(|| {
                KernelError::invalid(format!(
                    "`{}` shape {dims:?} has too many elements",
                    ctx.op().name()
                ))
            })?;

        let seed = ctx.op().attr_int_or("seed", 0)?;
        let mut rng = if seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed as u64)
        };
        let values = match self {
            RandomKernel::Uniform => (0..count).map(|_| rng.gen_range(0.0f32..1.0)).collect(),
            RandomKernel::Normal => (0..count).map(|_| standard_normal(&mut rng)).collect(),
        };
        Ok(KernelOutput::single(Tensor::from_f32(&dims, values)?))
    }
}

/// Box-Muller transform over two uniform samples.
fn standard_normal(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use graph_core::{Operation, Shape};

    use crate::kernels::KernelRegistry;
    use crate::kernels::test_support::{only, run_kernel};
    use crate::resources::ResourceManager;

    use super::*;

    #[tokio::test]
    async fn normal_uses_shape_attribute_and_seed() {
        let registry = KernelRegistry::with_builtin_kernels();
        let op = Operation::new("x", "RandomNormal")
            .with_attr("shape", Shape::new(vec![10, 1]))
            .with_attr("seed", 7i64);
        let first = only(
            run_kernel(&registry, op.clone(), vec![], Arc::new(ResourceManager::new()))
                .await
                .expect("first"),
        );
        let second = only(
            run_kernel(&registry, op, vec![], Arc::new(ResourceManager::new()))
                .await
                .expect("second"),
        );
        assert_eq!(first.shape().dims(), &[10, 1]);
        assert_eq!(first.byte_size(), 40);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn uniform_reads_shape_input() {
        let registry = KernelRegistry::with_builtin_kernels();
        let out = only(
            run_kernel(
                &registry,
                Operation::new("random", "RandomUniform"),
                vec![Tensor::vector_i32(&[1])],
                Arc::new(ResourceManager::new()),
            )
            .await
            .expect("uniform"),
        );
        let values = out.as_f32().expect("float output");
        assert_eq!(values.len(), 1);
        assert!((0.0..1.0).contains(&values[0]));
    }

    #[tokio::test]
    async fn oversized_shapes_are_rejected() {
        let registry = KernelRegistry::with_builtin_kernels();
        for shape in [vec![i64::MAX, 4], vec![1 << 62]] {
            let op =
                Operation::new("random", "RandomUniform").with_attr("shape", Shape::new(shape));
            let err = run_kernel(&registry, op, vec![], Arc::new(ResourceManager::new()))
                .await
                .expect_err("too many elements");
            assert!(matches!(err, KernelError::InvalidArgument(_)), "{err}");
        }
        let op =
            Operation::new("random", "RandomUniform").with_attr("shape", Shape::new(vec![3, -1]));
        assert!(
            run_kernel(&registry, op, vec![], Arc::new(ResourceManager::new()))
                .await
                .is_err()
        );
    }
}
