//! Per-operation cost accounting and the execution report handed to callers.

use std::collections::BTreeMap;
use std::time::Duration;

use graph_core::{DType, DeviceName, Shape, Tensor, is_plumbing_name};
use serde::{Deserialize, Serialize};

/// Size and shape of one produced output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    /// Lower bound of the payload size in bytes.
    pub size_bytes: u64,
    pub shape: Shape,
    pub dtype: DType,
}

impl OutputInfo {
    pub fn of(tensor: &Tensor) -> Self {
        Self {
            size_bytes: tensor.byte_size(),
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
        }
    }
}

/// Cost facts for one executed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCostRecord {
    pub name: String,
    pub device: String,
    pub outputs: Vec<OutputInfo>,
    /// Accumulated kernel time in microseconds.
    pub compute_cost_micros: u64,
    pub host_persistent_memory: u64,
    pub device_persistent_memory: u64,
}

impl OpCostRecord {
    pub fn is_plumbing(&self) -> bool {
        is_plumbing_name(&self.name)
    }
}

/// Fine-grained timing of one operation within a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    pub name: String,
    /// Offset of the first execution from the start of the step.
    pub start_micros: u64,
    /// Total time spent in the kernel across executions.
    pub duration_micros: u64,
    pub executions: u64,
}

/// Ordered cost records for one step, plus optional timing detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    records: Vec<OpCostRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    step_stats: Vec<StepStats>,
}

impl ExecutionReport {
    pub fn records(&self) -> &[OpCostRecord] {
        &self.records
    }

    pub fn step_stats(&self) -> &[StepStats] {
        &self.step_stats
    }

    pub fn record(&self, name: &str) -> Option<&OpCostRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.record(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of user-authored operations, skipping injected plumbing.
    pub fn user_nodes(&self) -> impl Iterator<Item = &OpCostRecord> {
        self.records.iter().filter(|record| !record.is_plumbing())
    }

    /// Names of user-authored operations, in report order.
    pub fn user_node_names(&self) -> Vec<&str> {
        self.user_nodes().map(|record| record.name.as_str()).collect()
    }

    /// Zero compute costs and drop timing detail so reports can be compared.
    pub fn clear_timings(&mut self) {
        for record in &mut self.records {
            record.compute_cost_micros = 0;
        }
        self.step_stats.clear();
    }

    /// Fold the records of an earlier initialisation step into this report.
    ///
    /// Operations only seen during initialisation are prepended with zero
    /// compute cost; for operations present in both, persistent memory keeps
    /// the larger figure.
    pub fn merge_init(&mut self, init: &ExecutionReport) {
        let mut prefix = Vec::new();
        for init_record in &init.records {
            match self.records.iter_mut().find(|r| r.name == init_record.name) {
                Some(record) => {
                    record.host_persistent_memory = record
                        .host_persistent_memory
                        .max(init_record.host_persistent_memory);
                    record.device_persistent_memory = record
                        .device_persistent_memory
                        .max(init_record.device_persistent_memory);
                }
                None => prefix.push(OpCostRecord {
                    compute_cost_micros: 0,
                    ..init_record.clone()
                }),
            }
        }
        if !prefix.is_empty() {
            prefix.append(&mut self.records);
            self.records = prefix;
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Default)]
struct Entry {
    name: String,
    device: String,
    outputs: Vec<Option<OutputInfo>>,
    compute: Duration,
    first_start: Duration,
    executions: u64,
    host_persistent: u64,
    device_persistent: u64,
}

/// Accumulates cost facts while a step executes. Slots are indexed by the
/// operation's position in the executed plan so the report order is stable.
#[derive(Debug, Default)]
pub struct CostCollector {
    entries: BTreeMap<usize, Entry>,
}

impl CostCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution of the operation at plan position `index`.
    /// Repeated executions accumulate compute time and keep the latest
    /// outputs; dead output ports keep whatever was seen before.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        index: usize,
        name: &str,
        device: &DeviceName,
        outputs: &[Option<Tensor>],
        started_at: Duration,
        elapsed: Duration,
        persistent_bytes: u64,
    ) {
        let entry = self.entries.entry(index).or_insert_with(|| Entry {
            name: name.to_string(),
            device: device.to_string(),
            first_start: started_at,
            ..Entry::default()
        });
        if entry.outputs.len() < outputs.len() {
            entry.outputs.resize(outputs.len(), None);
        }
        for (slot, output) in entry.outputs.iter_mut().zip(outputs) {
            if let Some(tensor) = output {
                *slot = Some(OutputInfo::of(tensor));
            }
        }
        entry.compute += elapsed;
        entry.executions += 1;
        if persistent_bytes > 0 {
            if device.kind.is_host() {
                entry.host_persistent = entry.host_persistent.max(persistent_bytes);
            } else {
                entry.device_persistent = entry.device_persistent.max(persistent_bytes);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for entry in self.entries.into_values() {
            let dtype_hint = entry
                .outputs
                .iter()
                .flatten()
                .map(|info| info.dtype)
                .next()
                .unwrap_or(DType::Float32);
            report.step_stats.push(StepStats {
                name: entry.name.clone(),
                start_micros: micros(entry.first_start),
                duration_micros: micros(entry.compute),
                executions: entry.executions,
            });
            report.records.push(OpCostRecord {
                name: entry.name,
                device: entry.device,
                outputs: entry
                    .outputs
                    .into_iter()
                    .map(|info| {
                        info.unwrap_or(OutputInfo {
                            size_bytes: 0,
                            shape: Shape::scalar(),
                            dtype: dtype_hint,
                        })
                    })
                    .collect(),
                compute_cost_micros: micros(entry.compute),
                host_persistent_memory: entry.host_persistent,
                device_persistent_memory: entry.device_persistent,
            });
        }
        report
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
