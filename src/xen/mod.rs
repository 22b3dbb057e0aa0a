//! Xen backend
//!
//! VMs are HVM domains created through a [`Toolstack`]. Each launched or
//! associated domain gets a watcher task that reports its death to the shared
//! [`DomainTable`]; the table turns that into the VM's `VmExit`.

pub mod domains;
pub mod xl;

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hypervisor::constants::{HYPER_CHANNEL_NAME, TTY_CHANNEL_NAME};
use crate::hypervisor::context::VmContext;
use crate::hypervisor::disk::xvd_id_to_name;
use crate::hypervisor::driver::{
    DiskDescriptor, DriverContext, GuestNicInfo, HostNicInfo, HypervisorDriver, PersistedMap,
};
use crate::hypervisor::error::HypervisorError;
use crate::hypervisor::events::{self, ErrorSender, EventSender, InterfaceCreated, VmEvent};
use crate::hypervisor::persist::{PersistedState, XenState, PERSIST_VERSION};
use crate::metrics;

pub use domains::DomainTable;
pub use xl::{DiskSpec, DomainConfig, NicSpec, Toolstack, XenInfo, XlToolstack};

const MIN_XEN_VERSION: (u32, u32) = (4, 5);
/// Slot of the virtio-serial controller in the device model
const XEN_SERIAL_PCI_ADDR: u32 = 0x04;
const XEN_KERNEL_CMDLINE: &str = "console=ttyS0 pci=nomsi";
const INVALID_DOMID: i32 = -1;

pub struct XenDriver {
    toolstack: Arc<dyn Toolstack>,
    table: DomainTable,
    info: XenInfo,
}

impl std::fmt::Debug for XenDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XenDriver").field("info", &self.info).finish()
    }
}

impl XenDriver {
    /// Check the host can run HVM guests and start the domain table.
    pub async fn initialize(toolstack: Box<dyn Toolstack>) -> Result<Self, HypervisorError> {
        let info = toolstack.info().await?;
        if (info.major, info.minor) < MIN_XEN_VERSION {
            return Err(HypervisorError::Xen(format!(
                "Xen version is not new enough ({}.{}), need {}.{} or higher",
                info.major, info.minor, MIN_XEN_VERSION.0, MIN_XEN_VERSION.1
            )));
        }
        if !info.supports_hvm() {
            return Err(HypervisorError::Xen(format!(
                "Xen installation does not support HVM, current capabilities: {}",
                info.capabilities
            )));
        }
        info!(major = info.major, minor = info.minor, "xen toolstack ready");

        let (table, _task) = DomainTable::spawn();
        Ok(Self {
            toolstack: Arc::from(toolstack),
            table,
            info,
        })
    }

    pub fn info(&self) -> &XenInfo {
        &self.info
    }

    fn context(&self, domid: i32) -> XenContext {
        XenContext {
            toolstack: self.toolstack.clone(),
            table: self.table.clone(),
            domid: AtomicI32::new(domid),
            watcher: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HypervisorDriver for XenDriver {
    fn name(&self) -> &'static str {
        "xen"
    }

    fn init_context(&self, _home_dir: &Path) -> Arc<dyn DriverContext> {
        Arc::new(self.context(INVALID_DOMID))
    }

    async fn load_context(
        &self,
        persisted: &PersistedMap,
    ) -> Result<Arc<dyn DriverContext>, HypervisorError> {
        let state = match PersistedState::decode(persisted, self.name())? {
            PersistedState::Xen(state) => state,
            other => {
                return Err(HypervisorError::WrongDriver {
                    expected: "xen".to_string(),
                    found: other.driver_name().to_string(),
                })
            }
        };
        if state.domid <= 0 {
            return Err(HypervisorError::InvalidPersistedState(format!(
                "loaded wrong domid {}",
                state.domid
            )));
        }
        match self.toolstack.domain_exists(state.domid).await {
            Ok(true) => Ok(Arc::new(self.context(state.domid))),
            Ok(false) | Err(_) => Err(HypervisorError::Xen(format!(
                "cannot load domain {}, not exist",
                state.domid
            ))),
        }
    }
}

/// Device-model arguments for the agent channels and the 9p share.
pub fn device_model_args(ctx: &VmContext) -> Vec<String> {
    vec![
        "-device".to_string(),
        format!(
            "virtio-serial-pci,id=virtio-serial0,bus=pci.0,addr={}",
            XEN_SERIAL_PCI_ADDR
        ),
        "-chardev".to_string(),
        format!(
            "socket,id=charch0,path={},server,nowait",
            ctx.hyper_sock_name.display()
        ),
        "-device".to_string(),
        format!(
            "virtserialport,bus=virtio-serial0.0,nr=1,chardev=charch0,id=channel0,name={}",
            HYPER_CHANNEL_NAME
        ),
        "-chardev".to_string(),
        format!(
            "socket,id=charch1,path={},server,nowait",
            ctx.tty_sock_name.display()
        ),
        "-device".to_string(),
        format!(
            "virtserialport,bus=virtio-serial0.0,nr=2,chardev=charch1,id=channel1,name={}",
            TTY_CHANNEL_NAME
        ),
        "-fsdev".to_string(),
        format!(
            "local,id=virtio9p,path={},security_model=none",
            ctx.share_dir.display()
        ),
        "-device".to_string(),
        "virtio-9p-pci,fsdev=virtio9p,mount_tag=share_dir".to_string(),
    ]
}

pub fn domain_config(ctx: &VmContext) -> DomainConfig {
    DomainConfig {
        name: ctx.id.clone(),
        kernel: ctx.boot.kernel.clone(),
        initrd: ctx.boot.initrd.clone(),
        cmdline: XEN_KERNEL_CMDLINE.to_string(),
        max_vcpus: ctx.boot.cpu,
        max_memory_mb: ctx.boot.memory,
        console: format!("unix:{},server,nowait", ctx.console_sock_name.display()),
        extra: device_model_args(ctx),
    }
}

/// `xx:xx:xx:xx:xx:xx`
fn valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Per-VM Xen state: the domid, -1 until the domain exists
pub struct XenContext {
    toolstack: Arc<dyn Toolstack>,
    table: DomainTable,
    domid: AtomicI32,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl XenContext {
    pub fn domid(&self) -> i32 {
        self.domid.load(Ordering::SeqCst)
    }

    /// Register the domain and watch for its death.
    async fn watch(&self, ctx: &VmContext, domid: i32) {
        self.table.register(domid, ctx.hub.clone()).await;
        let toolstack = self.toolstack.clone();
        let table = self.table.clone();
        let vm = ctx.id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = toolstack.wait_for_death(domid).await {
                warn!(%vm, domid, error = %e, "watching xen domain failed");
            }
            table.died(domid).await;
        });
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_watching(&self) {
        if let Some(task) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn running_domid(&self) -> Result<i32, HypervisorError> {
        match self.domid() {
            domid if domid > 0 => Ok(domid),
            _ => Err(HypervisorError::DomainNotFound),
        }
    }
}

#[async_trait]
impl DriverContext for XenContext {
    async fn launch(&self, ctx: &VmContext) {
        let config = domain_config(ctx);
        debug!(vm = %ctx.id, config = %config.to_xl_config(), "xen domain config");

        let domid = match self.toolstack.create_domain(&config).await {
            Ok(domid) => domid,
            Err(e) => {
                metrics::VM_START_FAILURES_TOTAL.with_label_values(&["xen"]).inc();
                error!(vm = %ctx.id, error = %e, "failed to start a xen domain");
                ctx.hub
                    .post(VmEvent::VmStartFail {
                        message: format!("failed to start a xen domain: {}", e),
                    })
                    .await;
                return;
            }
        };

        metrics::VMS_LAUNCHED_TOTAL.with_label_values(&["xen"]).inc();
        info!(vm = %ctx.id, domid, "xen domain started");
        self.domid.store(domid, Ordering::SeqCst);
        self.watch(ctx, domid).await;
    }

    async fn associate(&self, ctx: &VmContext) {
        match self.running_domid() {
            Ok(domid) => {
                info!(vm = %ctx.id, domid, "associated xen domain");
                self.watch(ctx, domid).await;
            }
            Err(_) => warn!(vm = %ctx.id, "no xen domain to associate"),
        }
    }

    fn dump(&self) -> Result<PersistedMap, HypervisorError> {
        let domid = self.domid();
        if domid <= 0 {
            return Err(HypervisorError::NotRunning(format!(
                "Dom id is invalid: {}",
                domid
            )));
        }
        PersistedState::Xen(XenState {
            domid,
            version: PERSIST_VERSION,
        })
        .encode()
    }

    async fn add_disk(
        &self,
        _ctx: &VmContext,
        source_type: &str,
        disk: &DiskDescriptor,
        result: EventSender,
    ) {
        let target = xvd_id_to_name(disk.scsi_id);
        let inserted = VmEvent::BlockdevInserted {
            name: disk.name.clone(),
            source_type: source_type.to_string(),
            device_name: target.clone(),
            scsi_id: disk.scsi_id,
            scsi_addr: String::new(),
        };
        let outcome = match self.running_domid() {
            Ok(domid) => {
                let spec = DiskSpec::new(&disk.filename, target, &disk.format);
                debug!(domid, spec = %spec.to_xl_spec(), "attach xen disk");
                self.toolstack.disk_attach(domid, &spec).await
            }
            Err(e) => Err(e),
        };
        events::device_respond("disk", result, Some(inserted))(outcome)
    }

    async fn remove_disk(
        &self,
        _ctx: &VmContext,
        disk: &DiskDescriptor,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        let outcome = match self.running_domid() {
            Ok(domid) => {
                let spec = DiskSpec::new(&disk.filename, xvd_id_to_name(disk.scsi_id), &disk.format);
                self.toolstack.disk_detach(domid, &spec).await
            }
            Err(e) => Err(e),
        };
        events::device_respond("disk", result, callback)(outcome)
    }

    async fn add_nic(
        &self,
        _ctx: &VmContext,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        result: EventSender,
    ) {
        let inserted = VmEvent::NetDevInserted {
            id: host.id.clone(),
            index: guest.index,
            device_name: guest.device.clone(),
            address: guest.busaddr,
            tap_fd: host.fd,
        };
        let domid = match self.running_domid() {
            Ok(domid) => domid,
            Err(e) => {
                events::device_respond("nic", result, Some(inserted))(Err(e));
                return;
            }
        };
        if !valid_mac(&host.mac) {
            events::device_respond("nic", result, Some(inserted))(Err(HypervisorError::Xen(
                format!("failed to parse mac address {}", host.mac),
            )));
            return;
        }

        let nic = NicSpec {
            mac: host.mac.clone(),
            bridge: host.bridge.clone(),
            ip: guest.ipaddr.clone(),
            vifname: format!("vif{}.{}", domid, guest.index),
        };
        if let Err(e) = self.toolstack.nic_attach(domid, &nic).await {
            events::device_respond("nic", result, Some(inserted))(Err(e));
            return;
        }
        if let Err(e) = self.toolstack.add_to_bridge(&nic.vifname, &nic.bridge).await {
            error!(vif = %nic.vifname, bridge = %nic.bridge, error = %e, "fail to add vif to bridge");
            if let Err(detach) = self.toolstack.nic_detach(domid, &nic.mac).await {
                warn!(mac = %nic.mac, error = %detach, "detach nic after failure");
            }
            events::device_respond("nic", result, Some(inserted))(Err(e));
            return;
        }
        debug!(domid, vif = %nic.vifname, "xen nic inserted");
        events::device_respond("nic", result, Some(inserted))(Ok(()))
    }

    async fn remove_nic(
        &self,
        _ctx: &VmContext,
        iface: &InterfaceCreated,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        let outcome = match self.running_domid() {
            Ok(domid) => self.toolstack.nic_detach(domid, &iface.mac_addr).await,
            Err(e) => Err(e),
        };
        events::device_respond("nic", result, callback)(outcome)
    }

    async fn set_cpus(&self, _ctx: &VmContext, _cpus: u32, result: ErrorSender) {
        events::reply(
            result,
            Err(HypervisorError::Unsupported {
                operation: "cpu hotplug",
                driver: "xen",
            }),
        )
    }

    async fn add_mem(&self, _ctx: &VmContext, _slot: u32, _size_mb: u64, result: ErrorSender) {
        events::reply(
            result,
            Err(HypervisorError::Unsupported {
                operation: "memory hotplug",
                driver: "xen",
            }),
        )
    }

    async fn save(&self, _ctx: &VmContext, _path: &Path, result: ErrorSender) {
        events::reply(
            result,
            Err(HypervisorError::Unsupported {
                operation: "save",
                driver: "xen",
            }),
        )
    }

    async fn pause(&self, _ctx: &VmContext, _pause: bool, result: ErrorSender) {
        events::reply(result, Err(HypervisorError::PauseUnsupported("xen")))
    }

    async fn shutdown(&self, ctx: &VmContext) {
        let Ok(domid) = self.running_domid() else {
            warn!(vm = %ctx.id, "shutdown without xen domain");
            return;
        };
        match self.toolstack.destroy_domain(domid).await {
            // VmExit comes from the table, racing the watcher is harmless
            Ok(()) => self.table.died(domid).await,
            Err(e) => error!(vm = %ctx.id, domid, error = %e, "destroy xen domain failed"),
        }
    }

    async fn kill(&self, ctx: &VmContext) {
        let success = match self.running_domid() {
            Ok(domid) => {
                self.table.unregister(domid).await;
                self.stop_watching();
                match self.toolstack.destroy_domain(domid).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(vm = %ctx.id, domid, error = %e, "destroy xen domain failed");
                        false
                    }
                }
            }
            Err(_) => false,
        };
        ctx.hub.post(VmEvent::VmKilled { success }).await;
    }

    async fn close(&self) {
        let domid = self.domid.swap(INVALID_DOMID, Ordering::SeqCst);
        self.stop_watching();
        if domid > 0 {
            self.table.unregister(domid).await;
        }
    }
}
