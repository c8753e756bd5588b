use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Provisioning parameters of a [`Cluster`](crate::Cluster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Wall-clock deadline applied to every `initialize` and `run` call.
    #[serde(with = "millis")]
    pub timeout: Duration,
    pub num_cpu_devices: u32,
    pub num_gpu_devices: u32,
    /// Upper bound on devices of any one kind.
    pub max_devices_per_kind: u32,
    /// How long `shutdown` waits for in-flight workers to drain.
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
    pub disable_optimizer: bool,
}

impl ClusterConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_NUM_CPU_DEVICES: u32 = 1;
    pub const DEFAULT_NUM_GPU_DEVICES: u32 = 0;
    pub const DEFAULT_MAX_DEVICES_PER_KIND: u32 = 16;
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

    /// Configuration with `timeout` and the given device counts.
    pub fn new(timeout: Duration, num_cpu_devices: u32, num_gpu_devices: u32) -> Self {
        Self {
            timeout,
            num_cpu_devices,
            num_gpu_devices,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cpu_devices(mut self, count: u32) -> Self {
        self.num_cpu_devices = count;
        self
    }

    pub fn with_gpu_devices(mut self, count: u32) -> Self {
        self.num_gpu_devices = count;
        self
    }

    pub fn with_max_devices_per_kind(mut self, limit: u32) -> Self {
        self.max_devices_per_kind = limit;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_optimizer_disabled(mut self, disabled: bool) -> Self {
        self.disable_optimizer = disabled;
        self
    }

    /// Reject settings no cluster can be provisioned with. Device limits are
    /// checked when the devices are allocated.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.timeout.is_zero() {
            return Err(ClusterError::InvalidConfig("timeout must be positive".into()));
        }
        if self.max_devices_per_kind == 0 {
            return Err(ClusterError::InvalidConfig(
                "max_devices_per_kind must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            num_cpu_devices: Self::DEFAULT_NUM_CPU_DEVICES,
            num_gpu_devices: Self::DEFAULT_NUM_GPU_DEVICES,
            max_devices_per_kind: Self::DEFAULT_MAX_DEVICES_PER_KIND,
            shutdown_grace: Self::DEFAULT_SHUTDOWN_GRACE,
            disable_optimizer: false,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
