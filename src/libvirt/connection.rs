//! libvirtd connection
//!
//! [`LibvirtConnection`] is the narrow set of libvirt calls the driver makes.
//! [`VirtConnection`] implements it with the `virt` bindings; device changes
//! are applied to the live domain only.

use async_trait::async_trait;
use tracing::{debug, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as VirtError, ErrorNumber};
use virt::secret::Secret;
use virt::sys;

use crate::hypervisor::error::HypervisorError;

#[async_trait]
pub trait LibvirtConnection: Send + Sync {
    async fn is_alive(&self) -> bool;

    /// Re-open the connection after libvirtd went away.
    async fn reconnect(&mut self) -> Result<(), HypervisorError>;

    async fn create_domain(&self, xml: &str, paused: bool) -> Result<(), HypervisorError>;

    /// `Ok(false)` when libvirtd answered and has no such domain.
    async fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError>;

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError>;

    async fn suspend_domain(&self, name: &str) -> Result<(), HypervisorError>;

    async fn resume_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Live-attach a device described by `xml`.
    async fn attach_device(&self, name: &str, xml: &str) -> Result<(), HypervisorError>;

    /// Live-detach a device described by `xml`.
    async fn detach_device(&self, name: &str, xml: &str) -> Result<(), HypervisorError>;

    async fn set_vcpus(&self, name: &str, cpus: u32) -> Result<(), HypervisorError>;

    async fn set_memory_stats_period(&self, name: &str, seconds: u32) -> Result<(), HypervisorError>;

    /// Run a human monitor command inside the domain's QEMU.
    async fn monitor_command(&self, name: &str, hmp: &str) -> Result<String, HypervisorError>;

    /// UUID of the ceph secret whose usage is `usage`, if defined.
    async fn lookup_ceph_secret(&self, usage: &str) -> Result<Option<String>, HypervisorError>;

    /// Define a secret and return its UUID.
    async fn define_secret(&self, xml: &str) -> Result<String, HypervisorError>;

    async fn set_secret_value(&self, uuid: &str, value: &str) -> Result<(), HypervisorError>;
}

fn libvirt_error(op: &str, e: VirtError) -> HypervisorError {
    HypervisorError::Libvirt(format!("{} failed: {}", op, e))
}

/// libvirtd through the `virt` bindings
pub struct VirtConnection {
    uri: String,
    conn: Connect,
}

impl VirtConnection {
    pub fn open(uri: impl Into<String>) -> Result<Self, HypervisorError> {
        let uri = uri.into();
        debug!(%uri, "connecting to libvirtd");
        let conn = Connect::open(Some(uri.as_str())).map_err(|e| {
            HypervisorError::Libvirt(format!("fail to connect to libvirtd {}: {}", uri, e))
        })?;
        Ok(Self { uri, conn })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn lookup(&self, name: &str) -> Result<Domain, HypervisorError> {
        Domain::lookup_by_name(&self.conn, name).map_err(|e| libvirt_error("lookup domain", e))
    }
}

#[async_trait]
impl LibvirtConnection for VirtConnection {
    async fn is_alive(&self) -> bool {
        self.conn.is_alive().unwrap_or(false)
    }

    async fn reconnect(&mut self) -> Result<(), HypervisorError> {
        let conn = Connect::open(Some(self.uri.as_str())).map_err(|e| {
            HypervisorError::Libvirt(format!("fail to connect to libvirtd {}: {}", self.uri, e))
        })?;
        let mut stale = std::mem::replace(&mut self.conn, conn);
        if let Err(e) = stale.close() {
            warn!(uri = %self.uri, error = %e, "close stale libvirt connection failed");
        }
        Ok(())
    }

    async fn create_domain(&self, xml: &str, paused: bool) -> Result<(), HypervisorError> {
        let flags = if paused { sys::VIR_DOMAIN_START_PAUSED } else { 0 };
        Domain::create_xml(&self.conn, xml, flags)
            .map(drop)
            .map_err(|e| libvirt_error("create domain", e))
    }

    async fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        match Domain::lookup_by_name(&self.conn, name) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorNumber::NoDomain => Ok(false),
            Err(e) => Err(libvirt_error("lookup domain", e)),
        }
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.lookup(name)?
            .destroy()
            .map(drop)
            .map_err(|e| libvirt_error("destroy domain", e))
    }

    async fn suspend_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.lookup(name)?
            .suspend()
            .map(drop)
            .map_err(|e| libvirt_error("suspend domain", e))
    }

    async fn resume_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.lookup(name)?
            .resume()
            .map(drop)
            .map_err(|e| libvirt_error("resume domain", e))
    }

    async fn attach_device(&self, name: &str, xml: &str) -> Result<(), HypervisorError> {
        self.lookup(name)?
            .attach_device_flags(xml, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)
            .map(drop)
            .map_err(|e| libvirt_error("attach device", e))
    }

    async fn detach_device(&self, name: &str, xml: &str) -> Result<(), HypervisorError> {
        self.lookup(name)?
            .detach_device_flags(xml, sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE)
            .map(drop)
            .map_err(|e| libvirt_error("detach device", e))
    }

    async fn set_vcpus(&self, name: &str, cpus: u32) -> Result<(), HypervisorError> {
        self.lookup(name)?
            .set_vcpus_flags(cpus, sys::VIR_DOMAIN_VCPU_LIVE)
            .map(drop)
            .map_err(|e| libvirt_error("set vcpus", e))
    }

    async fn set_memory_stats_period(&self, name: &str, seconds: u32) -> Result<(), HypervisorError> {
        let period = i32::try_from(seconds)
            .map_err(|_| HypervisorError::Libvirt(format!("memory stats period {} too long", seconds)))?;
        self.lookup(name)?
            .set_memory_stats_period(period, sys::VIR_DOMAIN_AFFECT_LIVE)
            .map(drop)
            .map_err(|e| libvirt_error("set memory stats period", e))
    }

    async fn monitor_command(&self, name: &str, hmp: &str) -> Result<String, HypervisorError> {
        self.lookup(name)?
            .qemu_monitor_command(hmp, sys::VIR_DOMAIN_QEMU_MONITOR_COMMAND_HMP)
            .map_err(|e| libvirt_error("qemu monitor command", e))
    }

    async fn lookup_ceph_secret(&self, usage: &str) -> Result<Option<String>, HypervisorError> {
        match Secret::lookup_by_usage(&self.conn, sys::VIR_SECRET_USAGE_TYPE_CEPH as i32, usage) {
            Ok(secret) => secret
                .get_uuid_string()
                .map(Some)
                .map_err(|e| libvirt_error("get secret uuid", e)),
            Err(e) if e.code() == ErrorNumber::NoSecret => Ok(None),
            Err(e) => Err(libvirt_error("lookup secret", e)),
        }
    }

    async fn define_secret(&self, xml: &str) -> Result<String, HypervisorError> {
        Secret::define_xml(&self.conn, xml, 0)
            .and_then(|secret| secret.get_uuid_string())
            .map_err(|e| libvirt_error("define secret", e))
    }

    async fn set_secret_value(&self, uuid: &str, value: &str) -> Result<(), HypervisorError> {
        Secret::lookup_by_uuid_string(&self.conn, uuid)
            .and_then(|secret| secret.set_value(value.as_bytes(), 0))
            .map(drop)
            .map_err(|e| libvirt_error("set secret value", e))
    }
}
