// Per-VM context
//
// A VmContext pairs the generic VM description (boot config, socket paths,
// event hub) with the driver-specific DriverContext. The pairing is fixed
// at construction.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::hypervisor::constants::{
    CONSOLE_SOCK_NAME, DEFAULT_CPUS, DEFAULT_INITRD, DEFAULT_KERNEL, DEFAULT_MEMORY_MB,
    HYPER_SOCK_NAME, SHARE_DIR_TAG, TTY_SOCK_NAME,
};
use crate::hypervisor::driver::{
    DiskDescriptor, DriverContext, GuestNicInfo, HostNicInfo, HypervisorDriver, PersistedMap,
};
use crate::hypervisor::error::HypervisorError;
use crate::hypervisor::events::{self, ErrorSender, EventSender, Hub, HubReceiver, InterfaceCreated, VmEvent};

/// How a VM boots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub cpu: u32,
    /// Memory in MiB
    pub memory: u32,
    pub hot_add_cpu_mem: bool,
    pub boot_to_be_template: bool,
    pub boot_from_template: bool,
    pub memory_path: String,
    pub devices_state_path: String,
    pub kernel: String,
    pub initrd: String,
    pub bios: String,
    pub cbfs: String,
    pub enable_vsock: bool,
    pub enable_vhost_user: bool,
    // QoS, kilobytes/s
    pub inbound_average: String,
    pub inbound_peak: String,
    pub outbound_average: String,
    pub outbound_peak: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPUS,
            memory: DEFAULT_MEMORY_MB,
            hot_add_cpu_mem: false,
            boot_to_be_template: false,
            boot_from_template: false,
            memory_path: String::new(),
            devices_state_path: String::new(),
            kernel: DEFAULT_KERNEL.to_string(),
            initrd: DEFAULT_INITRD.to_string(),
            bios: String::new(),
            cbfs: String::new(),
            enable_vsock: false,
            enable_vhost_user: false,
            inbound_average: String::new(),
            inbound_peak: String::new(),
            outbound_average: String::new(),
            outbound_peak: String::new(),
        }
    }
}

impl BootConfig {
    /// Boot from firmware images instead of kernel + initrd
    pub fn uses_firmware(&self) -> bool {
        !self.bios.is_empty() && !self.cbfs.is_empty()
    }

    pub fn has_bandwidth_limits(&self) -> bool {
        !(self.inbound_average.is_empty()
            && self.inbound_peak.is_empty()
            && self.outbound_average.is_empty()
            && self.outbound_peak.is_empty())
    }
}

/// One running (or about to run) VM
pub struct VmContext {
    pub id: String,
    pub boot: BootConfig,
    pub home_dir: PathBuf,
    pub hyper_sock_name: PathBuf,
    pub tty_sock_name: PathBuf,
    pub console_sock_name: PathBuf,
    pub share_dir: PathBuf,
    /// vsock context id, 0 when vsock is off
    pub guest_cid: u32,
    pub hub: Hub,
    driver: &'static str,
    dctx: Arc<dyn DriverContext>,
    cpus: Arc<AtomicU32>,
    next_pci: AtomicU32,
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .field("home_dir", &self.home_dir)
            .field("guest_cid", &self.guest_cid)
            .finish()
    }
}

impl VmContext {
    /// Fresh context; nothing is started until [`VmContext::launch`].
    pub fn new(
        id: impl Into<String>,
        boot: BootConfig,
        home_dir: impl Into<PathBuf>,
        driver: &dyn HypervisorDriver,
    ) -> (Self, HubReceiver) {
        let home_dir = home_dir.into();
        let dctx = driver.init_context(&home_dir);
        Self::assemble(id.into(), boot, home_dir, driver, dctx)
    }

    /// Context for a VM that outlived a daemon restart.
    pub async fn load(
        id: impl Into<String>,
        boot: BootConfig,
        home_dir: impl Into<PathBuf>,
        driver: &dyn HypervisorDriver,
        persisted: &PersistedMap,
    ) -> Result<(Self, HubReceiver), HypervisorError> {
        let dctx = driver.load_context(persisted).await?;
        Ok(Self::assemble(id.into(), boot, home_dir.into(), driver, dctx))
    }

    fn assemble(
        id: String,
        boot: BootConfig,
        home_dir: PathBuf,
        driver: &dyn HypervisorDriver,
        dctx: Arc<dyn DriverContext>,
    ) -> (Self, HubReceiver) {
        let (hub, rx) = events::channel();
        let ctx = Self {
            id,
            hyper_sock_name: home_dir.join(HYPER_SOCK_NAME),
            tty_sock_name: home_dir.join(TTY_SOCK_NAME),
            console_sock_name: home_dir.join(CONSOLE_SOCK_NAME),
            share_dir: home_dir.join(SHARE_DIR_TAG),
            cpus: Arc::new(AtomicU32::new(boot.cpu)),
            boot,
            home_dir,
            guest_cid: 0,
            hub,
            driver: driver.name(),
            dctx,
            next_pci: AtomicU32::new(driver.pci_addr_from()),
        };
        (ctx, rx)
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver
    }

    pub fn driver_context(&self) -> &Arc<dyn DriverContext> {
        &self.dctx
    }

    /// Current vCPU count, raised by successful hotplug
    pub fn current_cpus(&self) -> u32 {
        self.cpus.load(Ordering::SeqCst)
    }

    /// Shared handle on the vCPU count, for callbacks that outlive a borrow
    pub(crate) fn cpu_counter(&self) -> Arc<AtomicU32> {
        self.cpus.clone()
    }

    /// Hand out the next free PCI slot.
    pub fn next_pci_addr(&self) -> u32 {
        self.next_pci.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn launch(&self) {
        self.dctx.launch(self).await
    }

    pub async fn associate(&self) {
        self.dctx.associate(self).await
    }

    pub fn dump(&self) -> Result<PersistedMap, HypervisorError> {
        self.dctx.dump()
    }

    pub async fn add_disk(&self, source_type: &str, disk: &DiskDescriptor, result: EventSender) {
        self.dctx.add_disk(self, source_type, disk, result).await
    }

    pub async fn remove_disk(
        &self,
        disk: &DiskDescriptor,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        self.dctx.remove_disk(self, disk, callback, result).await
    }

    pub async fn add_nic(&self, host: &HostNicInfo, guest: &GuestNicInfo, result: EventSender) {
        self.dctx.add_nic(self, host, guest, result).await
    }

    pub async fn remove_nic(
        &self,
        iface: &InterfaceCreated,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        self.dctx.remove_nic(self, iface, callback, result).await
    }

    pub async fn set_cpus(&self, cpus: u32, result: ErrorSender) {
        self.dctx.set_cpus(self, cpus, result).await
    }

    pub async fn add_mem(&self, slot: u32, size_mb: u64, result: ErrorSender) {
        self.dctx.add_mem(self, slot, size_mb, result).await
    }

    pub async fn save(&self, path: &Path, result: ErrorSender) {
        self.dctx.save(self, path, result).await
    }

    pub async fn pause(&self, pause: bool, result: ErrorSender) {
        self.dctx.pause(self, pause, result).await
    }

    pub async fn shutdown(&self) {
        self.dctx.shutdown(self).await
    }

    pub async fn kill(&self) {
        self.dctx.kill(self).await
    }

    pub async fn close(&self) {
        self.dctx.close().await
    }
}
