use async_trait::async_trait;
use graph_core::{Operation, ResourceHandle, ResourceKind, Tensor};

use super::{KernelContext, KernelError, KernelOutput, KernelResult, OpKernel};

/// Declares a variable and emits its handle. Handles retain nothing themselves.
pub struct VariableKernel;

#[async_trait]
impl OpKernel for VariableKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let name = ctx.shared_name();
        ctx.resources().declare_variable(&name)?;
        Ok(KernelOutput::single(Tensor::resource(ResourceHandle::new(
            ResourceKind::Variable,
            name,
        ))))
    }
}

/// Stores its second input into the variable behind the first.
pub struct AssignKernel;

#[async_trait]
impl OpKernel for AssignKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let name = ctx.resource_input(0, ResourceKind::Variable)?;
        let value = ctx.input_value(1)?;
        if ctx.op().attr_bool_or("validate_shape", true)?
            && let Ok(declared) = ctx.op().attr_shape("shape")
            && declared.is_fully_defined()
            && declared != value.shape()
        {
            return Err(KernelError::invalid(format!(
                "assign `{}` expected shape {declared}, got {}",
                ctx.op().name(),
                value.shape()
            )));
        }
        let bytes = value.byte_size();
        ctx.resources().assign_variable(&name, value.clone())?;
        Ok(KernelOutput::single(value).with_persistent_bytes(bytes))
    }
}

/// Creates (or reuses) a hash table and emits its handle.
pub struct HashTableKernel;

#[async_trait]
impl OpKernel for HashTableKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let key = ctx.op().attr_dtype("key_dtype")?;
        let value = ctx.op().attr_dtype("value_dtype")?;
        let name = ctx.shared_name();
        let table = ctx.resources().table(&name, key, value)?;
        if table.key_dtype() != key || table.value_dtype() != value {
            return Err(KernelError::invalid(format!(
                "table `{name}` already exists with {} -> {}",
                table.key_dtype(),
                table.value_dtype()
            )));
        }
        Ok(KernelOutput::single(Tensor::resource(ResourceHandle::new(
            ResourceKind::Table,
            name,
        ))))
    }
}

/// Populates a table from key and value tensors.
pub struct InitializeTableKernel;

#[async_trait]
impl OpKernel for InitializeTableKernel {
    fn num_outputs(&self, _op: &Operation) -> usize {
        0
    }

    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let name = ctx.resource_input(0, ResourceKind::Table)?;
        let keys = ctx.input_value(1)?;
        let values = ctx.input_value(2)?;
        let table = ctx.resources().existing_table(&name)?;
        let retained = table.initialize(&keys, &values)?;
        Ok(KernelOutput::none().with_persistent_bytes(retained))
    }
}

pub struct LookupTableFindKernel;

#[async_trait]
impl OpKernel for LookupTableFindKernel {
    async fn compute(&self, ctx: KernelContext) -> KernelResult<KernelOutput> {
        let name = ctx.resource_input(0, ResourceKind::Table)?;
        let keys = ctx.input_value(1)?;
        let default = ctx.input_value(2)?;
        let table = ctx.resources().existing_table(&name)?;
        Ok(KernelOutput::single(table.find(&keys, &default)?))
    }
}
