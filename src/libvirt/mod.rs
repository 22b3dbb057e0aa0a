//! libvirt backend
//!
//! The VM is a transient libvirt domain named after the VM id. All calls go
//! through one shared [`LibvirtConnection`] guarded by an async mutex; domain
//! and secret lookups reconnect and retry once when libvirtd went away.

pub mod connection;
pub mod xml;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::hypervisor::constants::KVM_DEVICE;
use crate::hypervisor::context::VmContext;
use crate::hypervisor::disk::{scsi_addr_string, scsi_id_to_name};
use crate::hypervisor::driver::{
    DiskDescriptor, DriverContext, GuestNicInfo, HostNicInfo, HypervisorDriver, PersistedMap,
};
use crate::hypervisor::error::HypervisorError;
use crate::hypervisor::events::{self, ErrorSender, EventSender, InterfaceCreated, VmEvent};
use crate::hypervisor::persist::{LibvirtState, PersistedState, PERSIST_VERSION};
use crate::metrics;

pub use connection::{LibvirtConnection, VirtConnection};

/// libvirt puts its memballoon at 0x05, so hotplug starts one slot later.
const LIBVIRT_PCI_ADDR_FROM: u32 = 0x06;
const MEMORY_STATS_PERIOD_SECS: u32 = 1;

type Connection = Box<dyn LibvirtConnection>;

/// Reconnect when the connection died. A live connection means the failure
/// was real and is not worth a retry.
async fn check_connection(conn: &mut Connection) -> Result<(), HypervisorError> {
    if conn.is_alive().await {
        return Err(HypervisorError::Libvirt("connection is alive".to_string()));
    }
    debug!("libvirt disconnected, reconnect");
    conn.reconnect().await
}

/// Whether to retry after `err`: only when a reconnect went through.
async fn recovered(conn: &mut Connection, err: &HypervisorError) -> bool {
    match check_connection(conn).await {
        Ok(()) => true,
        Err(res) => {
            error!(error = %err, check = %res, "libvirt call failed");
            false
        }
    }
}

#[derive(Clone)]
struct Libvirtd {
    conn: Arc<tokio::sync::Mutex<Connection>>,
}

impl Libvirtd {
    async fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        let mut conn = self.conn.lock().await;
        match conn.domain_exists(name).await {
            Err(e) if recovered(&mut conn, &e).await => conn.domain_exists(name).await,
            other => other,
        }
    }

    async fn lookup_ceph_secret(&self, usage: &str) -> Result<Option<String>, HypervisorError> {
        let mut conn = self.conn.lock().await;
        match conn.lookup_ceph_secret(usage).await {
            Err(e) if recovered(&mut conn, &e).await => conn.lookup_ceph_secret(usage).await,
            other => other,
        }
    }

    async fn define_secret(&self, xml: &str) -> Result<String, HypervisorError> {
        let mut conn = self.conn.lock().await;
        match conn.define_secret(xml).await {
            Err(e) if recovered(&mut conn, &e).await => conn.define_secret(xml).await,
            other => other,
        }
    }

    async fn set_secret_value(&self, uuid: &str, value: &str) -> Result<(), HypervisorError> {
        let mut conn = self.conn.lock().await;
        match conn.set_secret_value(uuid, value).await {
            Err(e) if recovered(&mut conn, &e).await => conn.set_secret_value(uuid, value).await,
            other => other,
        }
    }
}

pub struct LibvirtDriver {
    libvirtd: Libvirtd,
    qemu_executable: Option<PathBuf>,
}

impl LibvirtDriver {
    /// Take over `conn`, reconnecting it once if it is not alive.
    pub async fn connect(
        mut conn: Connection,
        qemu_executable: Option<PathBuf>,
    ) -> Result<Self, HypervisorError> {
        if !conn.is_alive().await {
            conn.reconnect().await.map_err(|e| {
                error!(error = %e, "fail to connect to libvirtd");
                e
            })?;
        }
        Ok(Self {
            libvirtd: Libvirtd {
                conn: Arc::new(tokio::sync::Mutex::new(conn)),
            },
            qemu_executable,
        })
    }

    fn context(&self, domain: Option<String>) -> LibvirtContext {
        LibvirtContext {
            libvirtd: self.libvirtd.clone(),
            qemu_executable: self.qemu_executable.clone(),
            domain: Mutex::new(domain),
        }
    }
}

#[async_trait]
impl HypervisorDriver for LibvirtDriver {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    fn init_context(&self, _home_dir: &Path) -> Arc<dyn DriverContext> {
        Arc::new(self.context(None))
    }

    async fn load_context(
        &self,
        persisted: &PersistedMap,
    ) -> Result<Arc<dyn DriverContext>, HypervisorError> {
        let state = match PersistedState::decode(persisted, self.name())? {
            PersistedState::Libvirt(state) => state,
            other => {
                return Err(HypervisorError::WrongDriver {
                    expected: "libvirt".to_string(),
                    found: other.driver_name().to_string(),
                })
            }
        };
        match self.libvirtd.domain_exists(&state.name).await {
            Ok(true) => Ok(Arc::new(self.context(Some(state.name)))),
            Ok(false) | Err(_) => Err(HypervisorError::Libvirt(format!(
                "cannot find domain whose name is {}",
                state.name
            ))),
        }
    }

    fn pci_addr_from(&self) -> u32 {
        LIBVIRT_PCI_ADDR_FROM
    }
}

/// Per-VM libvirt state: the domain name once the domain exists
pub struct LibvirtContext {
    libvirtd: Libvirtd,
    qemu_executable: Option<PathBuf>,
    domain: Mutex<Option<String>>,
}

impl LibvirtContext {
    pub fn domain(&self) -> Option<String> {
        self.domain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_domain(&self, domain: Option<String>) {
        *self.domain.lock().unwrap_or_else(PoisonError::into_inner) = domain;
    }

    async fn start_failed(&self, ctx: &VmContext, message: String) {
        metrics::VM_START_FAILURES_TOTAL
            .with_label_values(&["libvirt"])
            .inc();
        error!(vm = %ctx.id, error = %message, "launch libvirt domain failed");
        ctx.hub.post(VmEvent::VmStartFail { message }).await;
    }

    /// Ceph secret for an rbd volume, defined on first use.
    async fn disk_secret_uuid(&self, disk: &DiskDescriptor) -> Result<Option<String>, HypervisorError> {
        if !disk.filename.starts_with("rbd:") {
            return Ok(None);
        }
        if disk.options.is_empty() {
            return Err(HypervisorError::Libvirt(
                "Volume options is required for rbd".to_string(),
            ));
        }
        let user = disk.options.get("user").map(String::as_str).unwrap_or("");
        let usage = format!("client.{}", user);
        match self.libvirtd.lookup_ceph_secret(&usage).await {
            Ok(Some(uuid)) => return Ok(Some(uuid)),
            Ok(None) => debug!(%usage, "defining ceph secret"),
            Err(e) => warn!(%usage, error = %e, "lookup ceph secret failed, defining a new one"),
        }
        let uuid = self
            .libvirtd
            .define_secret(&xml::ceph_secret_xml(user))
            .await?;
        let keyring = disk.options.get("keyring").map(String::as_str).unwrap_or("");
        self.libvirtd.set_secret_value(&uuid, keyring).await?;
        Ok(Some(uuid))
    }
}

#[async_trait]
impl DriverContext for LibvirtContext {
    async fn launch(&self, ctx: &VmContext) {
        let Some(qemu) = crate::qemu::find_executable(self.qemu_executable.as_deref()) else {
            self.start_failed(ctx, "cannot find qemu-system-x86_64 binary".to_string())
                .await;
            return;
        };

        let emulator = xml::emulator_for(&ctx.boot, &qemu);
        if ctx.boot.boot_to_be_template {
            if let Err(e) = xml::write_template_wrapper(&emulator, &ctx.boot, &qemu).await {
                self.start_failed(ctx, format!("create template wrapper failed: {}", e))
                    .await;
                return;
            }
        }

        let domain_xml = xml::domain_xml(ctx, &emulator, Path::new(KVM_DEVICE).exists());
        debug!(vm = %ctx.id, xml = %domain_xml, "domain xml");

        let created = self
            .libvirtd
            .conn
            .lock()
            .await
            .create_domain(&domain_xml, ctx.boot.boot_from_template)
            .await;
        if let Err(e) = created {
            self.start_failed(ctx, e.to_string()).await;
            return;
        }

        metrics::VMS_LAUNCHED_TOTAL.with_label_values(&["libvirt"]).inc();
        info!(vm = %ctx.id, paused = ctx.boot.boot_from_template, "libvirt domain created");
        self.set_domain(Some(ctx.id.clone()));

        let conn = self.libvirtd.conn.lock().await;
        if let Err(e) = conn
            .set_memory_stats_period(&ctx.id, MEMORY_STATS_PERIOD_SECS)
            .await
        {
            error!(vm = %ctx.id, error = %e, "set memory stats period failed");
        }
    }

    async fn associate(&self, ctx: &VmContext) {
        match self.domain() {
            Some(name) if name == ctx.id => info!(vm = %ctx.id, "associated libvirt domain"),
            Some(name) => error!(
                domain = %name,
                vm = %ctx.id,
                "domain name is not equal to context id"
            ),
            None => warn!(vm = %ctx.id, "no libvirt domain to associate"),
        }
    }

    fn dump(&self) -> Result<PersistedMap, HypervisorError> {
        let name = self
            .domain()
            .ok_or_else(|| HypervisorError::NotRunning("domain is invalid".to_string()))?;
        PersistedState::Libvirt(LibvirtState {
            name,
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
        let Some(domain) = self.domain() else {
            events::device_respond("disk", result, None)(Err(HypervisorError::DomainNotFound));
            return;
        };

        let prepared = match self.disk_secret_uuid(disk).await {
            Ok(secret) => xml::disk_xml(disk, secret.as_deref())
                .and_then(|xml| Ok((xml, scsi_addr_string(disk.scsi_id)?))),
            Err(e) => Err(e),
        };
        let (disk_xml, scsi_addr) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                events::device_respond("disk", result, None)(Err(e));
                return;
            }
        };
        debug!(disk = %disk.name, xml = %disk_xml, "attach disk");

        let attached = self
            .libvirtd
            .conn
            .lock()
            .await
            .attach_device(&domain, &disk_xml)
            .await;
        match attached {
            Ok(()) => events::device_respond(
                "disk",
                result,
                Some(VmEvent::BlockdevInserted {
                    name: disk.name.clone(),
                    source_type: source_type.to_string(),
                    device_name: scsi_id_to_name(disk.scsi_id),
                    scsi_id: disk.scsi_id,
                    scsi_addr,
                }),
            )(Ok(())),
            Err(e) => events::device_respond("disk", result, None)(Err(e)),
        }
    }

    async fn remove_disk(
        &self,
        _ctx: &VmContext,
        disk: &DiskDescriptor,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        let Some(domain) = self.domain() else {
            events::device_respond("disk", result, None)(Err(HypervisorError::DomainNotFound));
            return;
        };
        let secret = match self.disk_secret_uuid(disk).await {
            Ok(secret) => secret,
            Err(e) => {
                events::device_respond("disk", result, None)(Err(e));
                return;
            }
        };
        let outcome = match xml::disk_xml(disk, secret.as_deref()) {
            Ok(disk_xml) => {
                self.libvirtd
                    .conn
                    .lock()
                    .await
                    .detach_device(&domain, &disk_xml)
                    .await
            }
            Err(e) => Err(e),
        };
        events::device_respond("disk", result, callback)(outcome)
    }

    async fn add_nic(
        &self,
        ctx: &VmContext,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        result: EventSender,
    ) {
        let Some(domain) = self.domain() else {
            events::device_respond("nic", result, None)(Err(HypervisorError::DomainNotFound));
            return;
        };
        let nic_xml = xml::nic_xml(&host.bridge, &host.device, &host.mac, guest.busaddr, &ctx.boot);
        debug!(nic = %host.id, xml = %nic_xml, "attach nic");

        let attached = self
            .libvirtd
            .conn
            .lock()
            .await
            .attach_device(&domain, &nic_xml)
            .await;
        match attached {
            Ok(()) => events::device_respond(
                "nic",
                result,
                Some(VmEvent::NetDevInserted {
                    id: host.id.clone(),
                    index: guest.index,
                    device_name: guest.device.clone(),
                    address: guest.busaddr,
                    tap_fd: host.fd,
                }),
            )(Ok(())),
            Err(e) => events::device_respond("nic", result, None)(Err(e)),
        }
    }

    async fn remove_nic(
        &self,
        ctx: &VmContext,
        iface: &InterfaceCreated,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        let Some(domain) = self.domain() else {
            events::device_respond("nic", result, None)(Err(HypervisorError::DomainNotFound));
            return;
        };
        let nic_xml = xml::nic_xml(
            &iface.bridge,
            &iface.host_device,
            &iface.mac_addr,
            iface.pci_addr,
            &ctx.boot,
        );
        let outcome = self
            .libvirtd
            .conn
            .lock()
            .await
            .detach_device(&domain, &nic_xml)
            .await;
        events::device_respond("nic", result, callback)(outcome)
    }

    async fn set_cpus(&self, ctx: &VmContext, cpus: u32, result: ErrorSender) {
        debug!(vm = %ctx.id, cpus, "setcpus");
        let Some(domain) = self.domain() else {
            events::reply(result, Err(HypervisorError::DomainNotFound));
            return;
        };
        let current = ctx.current_cpus();
        if cpus < current {
            events::reply(
                result,
                Err(HypervisorError::CannotReduceCpus {
                    current,
                    requested: cpus,
                }),
            );
            return;
        }
        if cpus == current {
            events::reply(result, Ok(()));
            return;
        }

        let outcome = self
            .libvirtd
            .conn
            .lock()
            .await
            .set_vcpus(&domain, cpus)
            .await;
        if outcome.is_ok() {
            ctx.cpu_counter().store(cpus, Ordering::SeqCst);
        }
        events::reply(result, outcome)
    }

    async fn add_mem(&self, _ctx: &VmContext, slot: u32, size_mb: u64, result: ErrorSender) {
        let Some(domain) = self.domain() else {
            events::reply(result, Err(HypervisorError::DomainNotFound));
            return;
        };
        let memory_xml = xml::memory_xml(size_mb);
        debug!(slot, xml = %memory_xml, "attach memory");
        let outcome = self
            .libvirtd
            .conn
            .lock()
            .await
            .attach_device(&domain, &memory_xml)
            .await;
        events::reply(result, outcome)
    }

    async fn save(&self, ctx: &VmContext, path: &Path, result: ErrorSender) {
        debug!(vm = %ctx.id, path = %path.display(), "save domain");
        let conn = self.libvirtd.conn.lock().await;
        if ctx.boot.boot_to_be_template {
            if let Err(e) = conn
                .monitor_command(&ctx.id, "migrate_set_capability bypass-shared-memory on")
                .await
            {
                events::reply(result, Err(e));
                return;
            }
        }
        // a libvirt managed save would add its own header and stop the domain
        let outcome = conn
            .monitor_command(&ctx.id, &format!("migrate exec:cat>{}", path.display()))
            .await
            .map(drop);
        events::reply(result, outcome)
    }

    async fn pause(&self, _ctx: &VmContext, pause: bool, result: ErrorSender) {
        let Some(domain) = self.domain() else {
            events::reply(result, Err(HypervisorError::DomainNotFound));
            return;
        };
        let conn = self.libvirtd.conn.lock().await;
        let outcome = if pause {
            conn.suspend_domain(&domain).await
        } else {
            conn.resume_domain(&domain).await
        };
        events::reply(result, outcome)
    }

    async fn shutdown(&self, ctx: &VmContext) {
        if let Some(domain) = self.domain() {
            if let Err(e) = self.libvirtd.conn.lock().await.destroy_domain(&domain).await {
                warn!(vm = %ctx.id, error = %e, "destroy domain failed");
            }
        }
        ctx.hub.post(VmEvent::VmExit).await;
    }

    async fn kill(&self, ctx: &VmContext) {
        let success = match self.domain() {
            Some(domain) => match self.libvirtd.conn.lock().await.destroy_domain(&domain).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(vm = %ctx.id, error = %e, "destroy domain failed");
                    false
                }
            },
            None => {
                warn!(vm = %ctx.id, "no domain to be killed");
                false
            }
        };
        ctx.hub.post(VmEvent::VmKilled { success }).await;
    }

    async fn close(&self) {
        self.set_domain(None);
    }
}
