use async_trait::async_trait;
use graph_core::{Operation, Tensor};

use super::{KernelContext, KernelError, KernelOutput, KernelResult, OpKernel};

/// `Enter`, `Exit` and `NextIteration`: forward the value unchanged. Frame
/// bookkeeping lives in the executor.
pub struct ForwardKernel;

#[async_trait]
impl OpKernel for ForwardKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        Ok(KernelOutput::single(ctx.input(0)?.clone()))
    }
}

/// Forwards a scalar boolean predicate.
pub struct LoopCondKernel;

#[async_trait]
impl OpKernel for LoopCondKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let pred = ctx.input_value(0)?;
        predicate(&ctx, &pred)?;
        Ok(KernelOutput::single(pred))
    }
}

/// Emits whichever input arrived, plus the index of that input.
pub struct MergeKernel;

#[async_trait]
impl OpKernel for MergeKernel {
    fn num_outputs(&self, _op: &Operation) -> usize {
        2
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let index = ctx.input_index().unwrap_or(0);
        let value = ctx.input(0)?.clone();
        Ok(KernelOutput::many(vec![
            value,
            Tensor::scalar_i32(index as i32),
        ]))
    }
}

/// Routes data to port 1 when the predicate holds, port 0 otherwise; the other
/// port is dead.
pub struct SwitchKernel;

#[async_trait]
impl OpKernel for SwitchKernel {
    fn num_outputs(&self, _op: &Operation) -> usize {
        2
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let data = ctx.input(0)?.clone();
        let pred = ctx.input_value(1)?;
        let outputs = if predicate(&ctx, &pred)? {
            vec![None, Some(data)]
        } else {
            vec![Some(data), None]
        };
        Ok(KernelOutput {
            outputs,
            persistent_bytes: 0,
        })
    }
}

fn predicate(ctx: &KernelContext, pred: &Tensor) -> KernelResult<bool> {
    match pred.as_bool() {
        Some([value]) => Ok(*value),
        _ => Err(KernelError::invalid(format!(
            "`{}` expects a scalar bool predicate, got {}{}",
            ctx.op().name(),
            pred.dtype(),
            pred.shape()
        ))),
    }
}
