use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::hypervisor::constants::PCI_ADDR_FROM;
use crate::hypervisor::context::VmContext;
use crate::hypervisor::error::HypervisorError;
use crate::hypervisor::events::{ErrorSender, EventSender, InterfaceCreated, VmEvent};

/// Driver state as stored by the daemon between restarts
pub type PersistedMap = serde_json::Map<String, serde_json::Value>;

/// A block device to attach to the guest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskDescriptor {
    pub name: String,
    pub filename: String,
    pub format: String,
    pub fstype: String,
    pub device_name: String,
    pub scsi_id: u32,
    pub scsi_addr: String,
    pub docker_volume: bool,
    /// rbd keys: user, keyring, monitors, bytespersec, iops
    pub options: HashMap<String, String>,
}

/// Host end of a guest NIC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostNicInfo {
    pub id: String,
    /// Tap fd to pass to the hypervisor, 0 when the tap is opened by name
    pub fd: i32,
    pub device: String,
    pub mac: String,
    pub bridge: String,
    pub gateway: String,
}

/// Guest end of a NIC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestNicInfo {
    pub device: String,
    pub ipaddr: String,
    pub index: u32,
    pub busaddr: u32,
}

/// Hypervisor backend
///
/// One instance per process. Drivers own no VM state; everything per-VM
/// lives in the [`DriverContext`] they create.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Returns the backend name ("qemu", "libvirt", "xen")
    fn name(&self) -> &'static str;

    /// Create a fresh per-VM context. Never fails and starts nothing.
    fn init_context(&self, home_dir: &Path) -> Arc<dyn DriverContext>;

    /// Rebuild a per-VM context from a [`DriverContext::dump`] snapshot
    async fn load_context(
        &self,
        persisted: &PersistedMap,
    ) -> Result<Arc<dyn DriverContext>, HypervisorError>;

    fn supports_lazy_mode(&self) -> bool {
        false
    }

    /// First PCI slot free for hotplugged devices
    fn pci_addr_from(&self) -> u32 {
        PCI_ADDR_FROM
    }
}

/// Per-VM driver state
///
/// Lifecycle failures are posted to `ctx.hub`. Device operations answer on
/// their `result` channel only, and scalar operations on their oneshot.
#[async_trait]
pub trait DriverContext: Send + Sync {
    /// Start the hypervisor; failures post `VmStartFail`
    async fn launch(&self, ctx: &VmContext);

    /// Re-attach watchers to an already running VM
    async fn associate(&self, ctx: &VmContext);

    fn dump(&self) -> Result<PersistedMap, HypervisorError>;

    async fn add_disk(
        &self,
        ctx: &VmContext,
        source_type: &str,
        disk: &DiskDescriptor,
        result: EventSender,
    );

    async fn remove_disk(
        &self,
        ctx: &VmContext,
        disk: &DiskDescriptor,
        callback: Option<VmEvent>,
        result: EventSender,
    );

    async fn add_nic(
        &self,
        ctx: &VmContext,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        result: EventSender,
    );

    async fn remove_nic(
        &self,
        ctx: &VmContext,
        iface: &InterfaceCreated,
        callback: Option<VmEvent>,
        result: EventSender,
    );

    async fn set_cpus(&self, ctx: &VmContext, cpus: u32, result: ErrorSender);

    async fn add_mem(&self, ctx: &VmContext, slot: u32, size_mb: u64, result: ErrorSender);

    async fn save(&self, ctx: &VmContext, path: &Path, result: ErrorSender);

    async fn pause(&self, ctx: &VmContext, pause: bool, result: ErrorSender);

    /// Graceful stop; `VmExit` follows
    async fn shutdown(&self, ctx: &VmContext);

    /// Forceful stop; `VmKilled` follows
    async fn kill(&self, ctx: &VmContext);

    /// Release driver resources after the VM is gone
    async fn close(&self);
}
