// Typed snapshot of a driver context
//
// Key invariants:
// - the "hypervisor" tag is checked before any other field, so a snapshot
//   written by another backend always fails with WrongDriver
// - encode() output is accepted by decode() for the same backend

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::hypervisor::driver::PersistedMap;
use crate::hypervisor::error::HypervisorError;

pub const PERSIST_VERSION: u32 = 1;

fn default_version() -> u32 {
    PERSIST_VERSION
}

/// Position of the QEMU log tailer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileState {
    pub name: PathBuf,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuState {
    #[serde(rename = "qmpSock")]
    pub qmp_sock: PathBuf,
    pub pid: i32,
    pub log: LogFileState,
    #[serde(default = "default_version")]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibvirtState {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XenState {
    pub domid: i32,
    #[serde(default = "default_version")]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hypervisor", rename_all = "lowercase")]
pub enum PersistedState {
    Qemu(QemuState),
    Libvirt(LibvirtState),
    Xen(XenState),
}

impl PersistedState {
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Qemu(_) => "qemu",
            Self::Libvirt(_) => "libvirt",
            Self::Xen(_) => "xen",
        }
    }

    /// Decode a snapshot that must belong to the `expected` backend.
    pub fn decode(map: &PersistedMap, expected: &str) -> Result<Self, HypervisorError> {
        let found = map
            .get("hypervisor")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if found != expected {
            return Err(HypervisorError::WrongDriver {
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }

        serde_json::from_value(serde_json::Value::Object(map.clone()))
            .map_err(|e| HypervisorError::InvalidPersistedState(e.to_string()))
    }

    pub fn encode(&self) -> Result<PersistedMap, HypervisorError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(other) => Err(HypervisorError::InvalidPersistedState(format!(
                "snapshot is not an object: {}",
                other
            ))),
            Err(e) => Err(HypervisorError::InvalidPersistedState(e.to_string())),
        }
    }
}
