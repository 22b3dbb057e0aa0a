// Driver selection by name
//
// "" means "pick the best available": xen when the toolstack answers,
// otherwise qemu.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::HypervisorConfig;
use crate::hypervisor::constants::KVM_DEVICE;
use crate::hypervisor::driver::HypervisorDriver;
use crate::hypervisor::error::HypervisorError;
use crate::libvirt::{LibvirtDriver, VirtConnection};
use crate::qemu::{self, QemuDriver};
use crate::xen::{XenDriver, XlToolstack};

/// Driver names accepted by [`probe`]
pub const DRIVER_NAMES: &[&str] = &["", "qemu", "kvm", "qemu-kvm", "libvirt", "xen", "vbox"];

pub async fn probe(
    name: &str,
    config: &HypervisorConfig,
) -> Result<Arc<dyn HypervisorDriver>, HypervisorError> {
    debug!(driver = name, "probing hypervisor driver");
    match name {
        "libvirt" => {
            let conn = VirtConnection::open(&config.libvirt_uri)?;
            let driver = LibvirtDriver::connect(Box::new(conn), config.qemu_executable.clone())
                .await?;
            info!(uri = %config.libvirt_uri, "using libvirt driver");
            Ok(Arc::new(driver))
        }
        "kvm" | "qemu-kvm" => {
            if !Path::new(KVM_DEVICE).exists() {
                return Err(HypervisorError::DriverUnavailable(name.to_string()));
            }
            probe_qemu(config)
        }
        "xen" => probe_xen().await,
        "" => match probe_xen().await {
            Ok(driver) => Ok(driver),
            Err(e) => {
                debug!(error = %e, "xen not available, falling back to qemu");
                probe_qemu(config)
            }
        },
        "qemu" => probe_qemu(config),
        "vbox" => Err(HypervisorError::DriverUnavailable("vbox".to_string())),
        other => Err(HypervisorError::UnsupportedDriver(other.to_string())),
    }
}

fn probe_qemu(config: &HypervisorConfig) -> Result<Arc<dyn HypervisorDriver>, HypervisorError> {
    let exe = qemu::find_executable(config.qemu_executable.as_deref()).ok_or_else(|| {
        warn!("can not find qemu executable");
        HypervisorError::DriverUnavailable("qemu".to_string())
    })?;
    info!(executable = %exe.display(), "using qemu driver");
    Ok(Arc::new(
        QemuDriver::new(exe)
            .with_log_dir(config.qemu_log_dir.clone())
            .with_vsock(config.enable_vsock),
    ))
}

async fn probe_xen() -> Result<Arc<dyn HypervisorDriver>, HypervisorError> {
    let driver = XenDriver::initialize(Box::new(XlToolstack::new())).await?;
    info!("using xen driver");
    Ok(Arc::new(driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_unknown_driver_rejected() {
        let err = probe("bhyve", &HypervisorConfig::default()).await.err();
        assert_eq!(
            err,
            Some(HypervisorError::UnsupportedDriver("bhyve".to_string()))
        );
    }

    #[tokio::test]
    async fn test_vbox_unavailable() {
        let err = probe("vbox", &HypervisorConfig::default()).await.err();
        assert_eq!(err, Some(HypervisorError::DriverUnavailable("vbox".to_string())));
    }

    #[tokio::test]
    async fn test_qemu_with_missing_executable() {
        let config = HypervisorConfig {
            qemu_executable: Some(PathBuf::from("/nonexistent/qemu-system-x86_64")),
            ..Default::default()
        };
        let err = probe("qemu", &config).await.err();
        assert_eq!(err, Some(HypervisorError::DriverUnavailable("qemu".to_string())));
    }

    #[tokio::test]
    async fn test_qemu_with_configured_executable() {
        let exe = tempfile::NamedTempFile::new().unwrap();
        let config = HypervisorConfig {
            qemu_executable: Some(exe.path().to_path_buf()),
            ..Default::default()
        };
        let driver = probe("qemu", &config).await.unwrap();
        assert_eq!(driver.name(), "qemu");
    }
}
