use async_trait::async_trait;
use graph_core::Operation;

use super::{KernelContext, KernelError, KernelOutput, KernelResult, OpKernel};

/// Emits the `value` attribute. Also backs injected feed placeholders.
pub struct ConstKernel;

#[async_trait]
impl OpKernel for ConstKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let value = ctx.op().attr_tensor("value")?;
        if let Ok(dtype) = ctx.op().attr_dtype("dtype") {
            ctx.expect_dtype(value, dtype)?;
        }
        Ok(KernelOutput::single(value.clone()))
    }
}

pub struct PlaceholderKernel;

#[async_trait]
impl OpKernel for PlaceholderKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        Err(KernelError::invalid(format!(
            "placeholder `{}` must be fed",
            ctx.op().name()
        )))
    }
}

/// Forwards its first input, reading variables through their handle.
pub struct IdentityKernel;

#[async_trait]
impl OpKernel for IdentityKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        Ok(KernelOutput::single(ctx.input_value(0)?))
    }
}

/// Moves a value between devices; handles pass through untouched.
pub struct TransferKernel;

#[async_trait]
impl OpKernel for TransferKernel {
    fn is_stateless(&self) -> bool {
        true
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        Ok(KernelOutput::single(ctx.input(0)?.clone()))
    }
}

pub struct NoOpKernel;

#[async_trait]
impl OpKernel for NoOpKernel {
    fn num_outputs(&self, _op: &Operation) -> usize {
        0
    }

    async fn compute(&self, _ctx: KernelContext) -> KernelResult<KernelOutput> {
        Ok(KernelOutput::none())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use graph_core::{DType, Tensor};

    use super::*;
    use crate::kernels::KernelRegistry;
    use crate::kernels::test_support::{only, run_kernel};
    use crate::resources::ResourceManager;

    #[tokio::test]
    async fn const_checks_declared_dtype_lazily() {
        let registry = KernelRegistry::with_builtin_kernels();
        let resources = Arc::new(ResourceManager::new());
        let good = Operation::new("c", "Const")
            .with_attr("dtype", DType::Float32)
            .with_attr("value", Tensor::scalar_f32(2.0));
        let out = run_kernel(&registry, good, vec![], resources.clone())
            .await
            .expect("const");
        assert_eq!(only(out), Tensor::scalar_f32(2.0));

        let mismatched = Operation::new("c", "Const")
            .with_attr("dtype", DType::Int32)
            .with_attr("value", Tensor::scalar_f32(2.0));
        assert!(matches!(
            run_kernel(&registry, mismatched, vec![], resources.clone()).await,
            Err(KernelError::InvalidArgument(_))
        ));

        let missing = Operation::new("c", "Const");
        assert!(matches!(
            run_kernel(&registry, missing, vec![], resources).await,
            Err(KernelError::Attr(_))
        ));
    }

    #[tokio::test]
    async fn identity_reads_variables() {
        let registry = KernelRegistry::with_builtin_kernels();
        let resources = Arc::new(ResourceManager::new());
        resources
            .assign_variable("v", Tensor::scalar_i64(4))
            .expect("assign");
        let handle = Tensor::resource(graph_core::ResourceHandle::new(
            graph_core::ResourceKind::Variable,
            "v",
        ));
        let out = run_kernel(
            &registry,
            Operation::new("read", "Identity"),
            vec![handle],
            resources,
        )
        .await
        .expect("identity");
        assert_eq!(only(out), Tensor::scalar_i64(4));
    }
}
