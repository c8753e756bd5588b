use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job name of every device in a local cluster.
pub const LOCAL_JOB: &str = "localhost";

/// Kind of virtual compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    #[serde(rename = "CPU")]
    Cpu,
    #[serde(rename = "GPU")]
    Gpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
        }
    }

    /// Memory attached to this kind of device is counted as host memory.
    pub fn is_host(self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }
}

impl FromStr for DeviceKind {
    type Err = DeviceNameError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_uppercase().as_str() {
            "CPU" => Ok(DeviceKind::Cpu),
            "GPU" => Ok(DeviceKind::Gpu),
            _ => Err(DeviceNameError::UnknownKind(raw.to_string())),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised when parsing a placement string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceNameError {
    #[error("unknown device kind `{0}`")]
    UnknownKind(String),
    #[error("malformed device name `{0}`")]
    Malformed(String),
}

/// Fully qualified device name, e.g. `/job:localhost/replica:0/task:0/device:CPU:0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceName {
    pub job: String,
    pub replica: u32,
    pub task: u32,
    pub kind: DeviceKind,
    pub index: u32,
}

impl DeviceName {
    /// Device `kind:index` of the local job.
    pub fn local(kind: DeviceKind, index: u32) -> Self {
        Self {
            job: LOCAL_JOB.to_string(),
            replica: 0,
            task: 0,
            kind,
            index,
        }
    }

    /// Resolve a placement string. Empty strings place on the first CPU; any
    /// omitted component takes the local default. Accepted forms include
    /// `/cpu:0`, `/device:GPU:1` and the fully qualified name.
    pub fn parse(raw: &str) -> Result<Self, DeviceNameError> {
        let malformed = || DeviceNameError::Malformed(raw.to_string());
        let mut name = Self::local(DeviceKind::Cpu, 0);
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(name);
        }
        let body = trimmed.strip_prefix('/').ok_or_else(malformed)?;
        for segment in body.split('/') {
            let (key, value) = segment.split_once(':').ok_or_else(malformed)?;
            match key.to_ascii_lowercase().as_str() {
                "job" if !value.is_empty() => name.job = value.to_string(),
                "replica" => name.replica = value.parse().map_err(|_| malformed())?,
                "task" => name.task = value.parse().map_err(|_| malformed())?,
                "device" => {
                    let (kind, index) = value.split_once(':').ok_or_else(malformed)?;
                    name.kind = kind.parse()?;
                    name.index = index.parse().map_err(|_| malformed())?;
                }
                "cpu" | "gpu" => {
                    name.kind = key.parse()?;
                    name.index = value.parse().map_err(|_| malformed())?;
                }
                _ => return Err(malformed()),
            }
        }
        Ok(name)
    }
}

impl FromStr for DeviceName {
    type Err = DeviceNameError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for DeviceName {
    type Error = DeviceNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceName> for String {
    fn from(value: DeviceName) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/job:{}/replica:{}/task:{}/device:{}:{}",
            self.job, self.replica, self.task, self.kind, self.index
        )
    }
}
