//! Fixed set of virtual compute devices.

use graph_core::{DeviceKind, DeviceName};
use graph_plan::ExecutionTarget;
use thiserror::Error;

use crate::kernels::KernelRegistry;

/// Errors raised while allocating devices.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("at least one CPU device is required")]
    NoHostDevice,
    #[error("requested {requested} {kind} devices, at most {limit} are available")]
    TooMany {
        kind: DeviceKind,
        requested: u32,
        limit: u32,
    },
}

/// One provisioned device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: DeviceName,
}

impl Device {
    pub fn name(&self) -> &DeviceName {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.name.kind
    }
}

/// Devices provisioned for a cluster. The set never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Allocate `num_cpu` CPU devices and `num_gpu` GPU devices, each count
    /// bounded by `max_per_kind`.
    pub fn provision(num_cpu: u32, num_gpu: u32, max_per_kind: u32) -> Result<Self, DeviceError> {
        if num_cpu == 0 {
            return Err(DeviceError::NoHostDevice);
        }
        for (kind, requested) in [(DeviceKind::Cpu, num_cpu), (DeviceKind::Gpu, num_gpu)] {
            if requested > max_per_kind {
                return Err(DeviceError::TooMany {
                    kind,
                    requested,
                    limit: max_per_kind,
                });
            }
        }
        let devices = (0..num_cpu)
            .map(|index| DeviceName::local(DeviceKind::Cpu, index))
            .chain((0..num_gpu).map(|index| DeviceName::local(DeviceKind::Gpu, index)))
            .map(|name| Device { name })
            .collect();
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Fully qualified names of every device, CPUs first.
    pub fn device_names(&self) -> Vec<DeviceName> {
        self.devices.iter().map(|device| device.name.clone()).collect()
    }

    pub fn contains(&self, name: &DeviceName) -> bool {
        self.devices.iter().any(|device| &device.name == name)
    }

    pub fn count(&self, kind: DeviceKind) -> usize {
        self.devices.iter().filter(|device| device.kind() == kind).count()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The device unplaced operations land on.
    pub fn host(&self) -> DeviceName {
        DeviceName::local(DeviceKind::Cpu, 0)
    }
}

/// Validation view over the provisioned devices and registered kernels.
pub struct PlacementTarget<'a> {
    pub devices: &'a DeviceRegistry,
    pub kernels: &'a KernelRegistry,
}

impl ExecutionTarget for PlacementTarget<'_> {
    fn has_device(&self, device: &DeviceName) -> bool {
        self.devices.contains(device)
    }

    fn supports_kind(&self, kind: &str) -> bool {
        self.kernels.contains(kind)
    }
}
