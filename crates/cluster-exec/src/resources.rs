//! Session-owned state: variables, lookup tables and queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use graph_core::{DType, Tensor, TensorData};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::kernels::{KernelError, KernelResult};

/// Container for every resource created while a work item is bound.
///
/// Once [`ResourceManager::close`] runs, stateful kernels fail with
/// [`KernelError::Unavailable`] instead of touching state, and blocked queue
/// operations wake up.
#[derive(Default)]
pub struct ResourceManager {
    closed: AtomicBool,
    variables: Mutex<HashMap<String, Option<Tensor>>>,
    tables: Mutex<HashMap<String, Arc<LookupTable>>>,
    queues: Mutex<HashMap<String, Arc<FifoQueue>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Gate used by stateful kernels before touching resources.
    pub fn ensure_open(&self) -> KernelResult<()> {
        if self.is_closed() {
            Err(KernelError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Close the manager, closing every queue and dropping stored values.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queues: Vec<_> = self.queues.lock().drain().map(|(_, queue)| queue).collect();
        for queue in queues {
            queue.close();
        }
        let tables = self.tables.lock().drain().count();
        let variables = self.variables.lock().drain().count();
        debug!(tables, variables, "session resources released");
    }

    /// Declare a variable; existing variables keep their value.
    pub fn declare_variable(&self, name: &str) -> KernelResult<()> {
        self.ensure_open()?;
        self.variables.lock().entry(name.to_string()).or_insert(None);
        Ok(())
    }

    pub fn assign_variable(&self, name: &str, value: Tensor) -> KernelResult<()> {
        self.ensure_open()?;
        self.variables.lock().insert(name.to_string(), Some(value));
        Ok(())
    }

    pub fn read_variable(&self, name: &str) -> KernelResult<Tensor> {
        self.ensure_open()?;
        match self.variables.lock().get(name) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(KernelError::FailedPrecondition(format!(
                "variable `{name}` is not initialized"
            ))),
            None => Err(KernelError::FailedPrecondition(format!(
                "variable `{name}` does not exist"
            ))),
        }
    }

    /// Fetch the table called `name`, creating it on first use.
    pub fn table(&self, name: &str, key: DType, value: DType) -> KernelResult<Arc<LookupTable>> {
        self.ensure_open()?;
        let mut tables = self.tables.lock();
        let table = tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LookupTable::new(key, value)));
        Ok(Arc::clone(table))
    }

    pub fn existing_table(&self, name: &str) -> KernelResult<Arc<LookupTable>> {
        self.ensure_open()?;
        self.tables.lock().get(name).cloned().ok_or_else(|| {
            KernelError::FailedPrecondition(format!("table `{name}` does not exist"))
        })
    }

    /// Fetch the queue called `name`, creating it on first use.
    pub fn queue(&self, name: &str, components: usize, capacity: Option<usize>) -> KernelResult<Arc<FifoQueue>> {
        self.ensure_open()?;
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FifoQueue::new(components, capacity)));
        Ok(Arc::clone(queue))
    }

    pub fn existing_queue(&self, name: &str) -> KernelResult<Arc<FifoQueue>> {
        self.ensure_open()?;
        self.queues.lock().get(name).cloned().ok_or_else(|| {
            KernelError::FailedPrecondition(format!("queue `{name}` does not exist"))
        })
    }
}

/// Hash table keyed by scalar integers or strings.
pub struct LookupTable {
    key_dtype: DType,
    value_dtype: DType,
    entries: Mutex<Option<HashMap<TableKey, TableValue>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
enum TableValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Str(String),
}

impl LookupTable {
    fn new(key_dtype: DType, value_dtype: DType) -> Self {
        Self {
            key_dtype,
            value_dtype,
            entries: Mutex::new(None),
        }
    }

    pub fn key_dtype(&self) -> DType {
        self.key_dtype
    }

    pub fn value_dtype(&self) -> DType {
        self.value_dtype
    }

    /// Replace the table contents and return the bytes retained: the bucket
    /// array holds twice as many slots as entries.
    pub fn initialize(&self, keys: &Tensor, values: &Tensor) -> KernelResult<u64> {
        let keys = table_keys(keys, self.key_dtype)?;
        let values = table_values(values, self.value_dtype)?;
        if keys.len() != values.len() {
            return Err(KernelError::invalid(format!(
                "table initialised with {} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        let count = keys.len() as u64;
        let slot_bytes = self.key_dtype.size_bytes().max(8) + self.value_dtype.size_bytes().max(8);
        *self.entries.lock() = Some(keys.into_iter().zip(values).collect());
        Ok(count * slot_bytes * 2)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up every key, using `default` for misses.
    pub fn find(&self, keys: &Tensor, default: &Tensor) -> KernelResult<Tensor> {
        let guard = self.entries.lock();
        let entries = guard
            .as_ref()
            .ok_or_else(|| KernelError::FailedPrecondition("table is not initialized".into()))?;
        let fallback = table_values(default, self.value_dtype)?
            .into_iter()
            .next()
            .ok_or_else(|| KernelError::invalid("default value must not be empty"))?;
        let found: Vec<TableValue> = table_keys(keys, self.key_dtype)?
            .iter()
            .map(|key| entries.get(key).cloned().unwrap_or_else(|| fallback.clone()))
            .collect();
        Ok(Tensor::new(keys.shape().clone(), values_data(found, self.value_dtype))?)
    }
}

fn values_data(values: Vec<TableValue>, dtype: DType) -> TensorData {
    match dtype {
        DType::Int32 => TensorData::Int32(
            values
                .into_iter()
                .filter_map(|value| match value {
                    TableValue::Int32(v) => Some(v),
                    _ => None,
                })
                .collect(),
        ),
        DType::Int64 => TensorData::Int64(
            values
                .into_iter()
                .filter_map(|value| match value {
                    TableValue::Int64(v) => Some(v),
                    _ => None,
                })
                .collect(),
        ),
        DType::Float32 => TensorData::Float32(
            values
                .into_iter()
                .filter_map(|value| match value {
                    TableValue::Float32(v) => Some(v),
                    _ => None,
                })
                .collect(),
        ),
        _ => TensorData::String(
            values
                .into_iter()
                .filter_map(|value| match value {
                    TableValue::Str(v) => Some(v),
                    _ => None,
                })
                .collect(),
        ),
    }
}

fn table_keys(keys: &Tensor, dtype: DType) -> KernelResult<Vec<TableKey>> {
    if keys.dtype() != dtype {
        return Err(KernelError::invalid(format!(
            "table keys must be {dtype}, got {}",
            keys.dtype()
        )));
    }
    match keys.data() {
        TensorData::Int32(values) => Ok(values.iter().map(|v| TableKey::Int(i64::from(*v))).collect()),
        TensorData::Int64(values) => Ok(values.iter().map(|v| TableKey::Int(*v)).collect()),
        TensorData::String(values) => Ok(values.iter().cloned().map(TableKey::Str).collect()),
        _ => Err(KernelError::invalid(format!("unsupported table key type {dtype}"))),
    }
}

fn table_values(values: &Tensor, dtype: DType) -> KernelResult<Vec<TableValue>> {
    if values.dtype() != dtype {
        return Err(KernelError::invalid(format!(
            "table values must be {dtype}, got {}",
            values.dtype()
        )));
    }
    match values.data() {
        TensorData::Int32(values) => Ok(values.iter().copied().map(TableValue::Int32).collect()),
        TensorData::Int64(values) => Ok(values.iter().copied().map(TableValue::Int64).collect()),
        TensorData::Float32(values) => Ok(values.iter().copied().map(TableValue::Float32).collect()),
        TensorData::String(values) => Ok(values.iter().cloned().map(TableValue::Str).collect()),
        _ => Err(KernelError::invalid(format!("unsupported table value type {dtype}"))),
    }
}

struct QueueState {
    items: VecDeque<Vec<Tensor>>,
    closed: bool,
}

/// First-in first-out queue of tensor tuples.
pub struct FifoQueue {
    components: usize,
    capacity: Option<usize>,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl FifoQueue {
    fn new(components: usize, capacity: Option<usize>) -> Self {
        Self {
            components,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Append a tuple, waiting while the queue is full.
    pub async fn enqueue(
        &self,
        tuple: Vec<Tensor>,
        cancellation: &CancellationToken,
    ) -> KernelResult<()> {
        if tuple.len() != self.components {
            return Err(KernelError::invalid(format!(
                "queue expects {} components, got {}",
                self.components,
                tuple.len()
            )));
        }
        let mut tuple = Some(tuple);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(KernelError::FailedPrecondition("queue is closed".into()));
                }
                let full = self.capacity.is_some_and(|cap| state.items.len() >= cap);
                if !full && let Some(tuple) = tuple.take() {
                    state.items.push_back(tuple);
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancellation.cancelled() => return Err(KernelError::Cancelled),
            }
        }
    }

    /// Remove the oldest tuple, waiting until one is available.
    pub async fn dequeue(&self, cancellation: &CancellationToken) -> KernelResult<Vec<Tensor>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(tuple) = state.items.pop_front() {
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(tuple);
                }
                if state.closed {
                    return Err(KernelError::OutOfRange("queue is closed and empty".into()));
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancellation.cancelled() => return Err(KernelError::Cancelled),
            }
        }
    }
}
