use async_trait::async_trait;
use graph_core::{AttrValue, Operation, ResourceHandle, ResourceKind, Tensor};

use super::{KernelContext, KernelOutput, KernelResult, OpKernel};

fn component_count(op: &Operation) -> usize {
    match op.attr("component_types") {
        Some(AttrValue::TypeList(types)) if !types.is_empty() => types.len(),
        _ => 1,
    }
}

/// Creates (or reuses) a FIFO queue and emits its handle.
pub struct FifoQueueKernel;

#[async_trait]
impl OpKernel for FifoQueueKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let capacity = ctx.op().attr_int_or("capacity", -1)?;
        let capacity = usize::try_from(capacity).ok().filter(|cap| *cap > 0);
        let name = ctx.shared_name();
        ctx.resources()
            .queue(&name, component_count(ctx.op()), capacity)?;
        Ok(KernelOutput::single(Tensor::resource(ResourceHandle::new(
            ResourceKind::Queue,
            name,
        ))))
    }
}

/// Pushes its remaining inputs as one tuple; blocks while the queue is full.
pub struct QueueEnqueueKernel;

#[async_trait]
impl OpKernel for QueueEnqueueKernel {
    fn num_outputs(&self, _op: &Operation) -> usize {
        0
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let name = ctx.resource_input(0, ResourceKind::Queue)?;
        let queue = ctx.resources().existing_queue(&name)?;
        let mut tuple = Vec::with_capacity(ctx.num_inputs().saturating_sub(1));
        for index in 1..ctx.num_inputs() {
            tuple.push(ctx.input_value(index)?);
        }
        queue.enqueue(tuple, &ctx.token()).await?;
        Ok(KernelOutput::none())
    }
}

/// Pops one tuple; blocks until an element arrives, the queue closes or the
/// step is cancelled.
pub struct QueueDequeueKernel;

#[async_trait]
impl OpKernel for QueueDequeueKernel {
    fn num_outputs(&self, op: &Operation) -> usize {
        component_count(op)
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let name = ctx.resource_input(0, ResourceKind::Queue)?;
        let queue = ctx.resources().existing_queue(&name)?;
        let tuple = queue.dequeue(&ctx.token()).await?;
        ctx.resources().ensure_open()?;
        Ok(KernelOutput::many(tuple))
    }
}

pub struct QueueCloseKernel;

#[async_trait]
impl OpKernel for QueueCloseKernel {
    fn num_outputs(&self, _op: &Operation) -> usize {
        0
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let name = ctx.resource_input(0, ResourceKind::Queue)?;
        ctx.resources().existing_queue(&name)?.close();
        Ok(KernelOutput::none())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use graph_core::DType;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::kernels::test_support::{only, run_kernel};
    use crate::kernels::{KernelContext, KernelError, KernelRegistry};
    use crate::resources::ResourceManager;

    fn queue_op() -> Operation {
        Operation::new("queue", "FIFOQueue").with_attr("component_types", vec![DType::Int32])
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips_a_tuple() {
        let registry = KernelRegistry::with_builtin_kernels();
        let resources = Arc::new(ResourceManager::new());
        let handle = only(
            run_kernel(&registry, queue_op(), vec![], resources.clone())
                .await
                .expect("queue"),
        );
        run_kernel(
            &registry,
            Operation::new("enqueue", "QueueEnqueue"),
            vec![handle.clone(), Tensor::scalar_i32(3)],
            resources.clone(),
        )
        .await
        .expect("enqueue");
        let value = only(
            run_kernel(
                &registry,
                Operation::new("dequeue", "QueueDequeue")
                    .with_attr("component_types", vec![DType::Int32]),
                vec![handle],
                resources,
            )
            .await
            .expect("dequeue"),
        );
        assert_eq!(value, Tensor::scalar_i32(3));
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_waits_for_cancellation() {
        let registry = KernelRegistry::with_builtin_kernels();
        let resources = Arc::new(ResourceManager::new());
        let handle = only(
            run_kernel(&registry, queue_op(), vec![], resources.clone())
                .await
                .expect("queue"),
        );
        let token = CancellationToken::new();
        let kernel = registry.kernel("QueueDequeue").expect("dequeue kernel");
        let ctx = KernelContext::new(
            Arc::new(Operation::new("dequeue", "QueueDequeue")),
            vec![handle],
            graph_core::DeviceName::local(graph_core::DeviceKind::Cpu, 0),
            resources,
            token.clone(),
        );
        let pending = tokio::spawn(async move { kernel.compute(ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        token.cancel();
        let result = pending.await.expect("join");
        assert!(matches!(result, Err(KernelError::Cancelled)));
    }
}
