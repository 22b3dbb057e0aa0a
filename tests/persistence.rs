// Driver state snapshots: dump, load and driver mismatch

use async_trait::async_trait;
use hyperpod_orchestrator::hypervisor::{
    BootConfig, HypervisorDriver, HypervisorError, PersistedMap, VmContext,
};
use hyperpod_orchestrator::qemu::QemuDriver;
use hyperpod_orchestrator::xen::{DiskSpec, DomainConfig, NicSpec, Toolstack, XenDriver, XenInfo};
use serde_json::{json, Value};
use std::collections::HashSet;

fn as_map(value: Value) -> PersistedMap {
    value.as_object().cloned().unwrap()
}

fn qemu_state(pid: i64) -> PersistedMap {
    as_map(json!({
        "hypervisor": "qemu",
        "qmpSock": "/run/hyper/vm-1/qmp.sock",
        "pid": pid,
        "log": {"name": "/var/log/hyper/qemu/vm-1.log", "offset": 4096},
    }))
}

/// A Xen host with a fixed set of running domains
struct StaticXen {
    domains: HashSet<i32>,
}

fn untouched() -> HypervisorError {
    HypervisorError::Xen("not used by persistence tests".to_string())
}

#[async_trait]
impl Toolstack for StaticXen {
    async fn info(&self) -> Result<XenInfo, HypervisorError> {
        XenInfo::parse("xen_major : 4\nxen_minor : 8\nxen_caps : xen-3.0-x86_64 hvm-3.0-x86_64\n")
    }

    async fn create_domain(&self, _config: &DomainConfig) -> Result<i32, HypervisorError> {
        Err(untouched())
    }

    async fn domain_exists(&self, domid: i32) -> Result<bool, HypervisorError> {
        Ok(self.domains.contains(&domid))
    }

    async fn destroy_domain(&self, _domid: i32) -> Result<(), HypervisorError> {
        Err(untouched())
    }

    async fn wait_for_death(&self, _domid: i32) -> Result<(), HypervisorError> {
        std::future::pending().await
    }

    async fn disk_attach(&self, _domid: i32, _disk: &DiskSpec) -> Result<(), HypervisorError> {
        Err(untouched())
    }

    async fn disk_detach(&self, _domid: i32, _disk: &DiskSpec) -> Result<(), HypervisorError> {
        Err(untouched())
    }

    async fn nic_attach(&self, _domid: i32, _nic: &NicSpec) -> Result<(), HypervisorError> {
        Err(untouched())
    }

    async fn nic_detach(&self, _domid: i32, _mac: &str) -> Result<(), HypervisorError> {
        Err(untouched())
    }

    async fn add_to_bridge(&self, _ifname: &str, _bridge: &str) -> Result<(), HypervisorError> {
        Err(untouched())
    }
}

async fn xen_driver() -> XenDriver {
    let toolstack = StaticXen {
        domains: HashSet::from([7]),
    };
    XenDriver::initialize(Box::new(toolstack)).await.unwrap()
}

#[tokio::test]
async fn test_qemu_rejects_foreign_snapshots() {
    let driver = QemuDriver::new("/usr/bin/qemu-system-x86_64");

    let err = driver
        .load_context(&as_map(json!({"hypervisor": "libvirt", "name": "vm-1"})))
        .await
        .err();
    assert_eq!(
        err,
        Some(HypervisorError::WrongDriver {
            expected: "qemu".to_string(),
            found: "libvirt".to_string(),
        })
    );

    // the tag is checked even when the rest would be a valid qemu snapshot
    let mut untagged = qemu_state(1);
    untagged.remove("hypervisor");
    assert!(matches!(
        driver.load_context(&untagged).await.err(),
        Some(HypervisorError::WrongDriver { found, .. }) if found.is_empty()
    ));
}

#[tokio::test]
async fn test_qemu_rejects_malformed_snapshot() {
    let driver = QemuDriver::new("/usr/bin/qemu-system-x86_64");
    let mut state = qemu_state(1);
    state.insert("pid".to_string(), json!("not-a-pid"));
    assert!(matches!(
        driver.load_context(&state).await.err(),
        Some(HypervisorError::InvalidPersistedState(_))
    ));

    state.remove("pid");
    assert!(matches!(
        driver.load_context(&state).await.err(),
        Some(HypervisorError::InvalidPersistedState(_))
    ));
}

#[tokio::test]
async fn test_qemu_dump_load_round_trip() {
    let driver = QemuDriver::new("/usr/bin/qemu-system-x86_64");
    // our own pid stands in for a live qemu
    let state = qemu_state(i64::from(std::process::id()));

    let (ctx, _events) =
        VmContext::load("vm-1", BootConfig::default(), "/run/hyper/vm-1", &driver, &state)
            .await
            .unwrap();
    let dumped = ctx.dump().unwrap();

    assert_eq!(dumped["hypervisor"], "qemu");
    assert_eq!(dumped["qmpSock"], "/run/hyper/vm-1/qmp.sock");
    assert_eq!(dumped["pid"], json!(std::process::id()));
    assert_eq!(dumped["log"]["name"], "/var/log/hyper/qemu/vm-1.log");
    assert_eq!(dumped["log"]["offset"], 4096);
    assert_eq!(dumped["version"], 1);

    let reloaded = driver.load_context(&dumped).await.unwrap();
    assert_eq!(reloaded.dump().unwrap(), dumped);
}

#[tokio::test]
async fn test_qemu_dump_of_dead_process() {
    let driver = QemuDriver::new("/usr/bin/qemu-system-x86_64");
    // pid_max on Linux stays below this
    let ctx = driver.load_context(&qemu_state(4_194_305)).await.unwrap();
    assert!(matches!(ctx.dump(), Err(HypervisorError::NotRunning(_))));
}

#[tokio::test]
async fn test_xen_dump_load_round_trip() {
    let driver = xen_driver().await;
    let state = as_map(json!({"hypervisor": "xen", "domid": 7}));

    let ctx = driver.load_context(&state).await.unwrap();
    let dumped = ctx.dump().unwrap();
    assert_eq!(dumped, as_map(json!({"hypervisor": "xen", "domid": 7, "version": 1})));
    assert!(driver.load_context(&dumped).await.is_ok());
}

#[tokio::test]
async fn test_xen_rejects_bad_snapshots() {
    let driver = xen_driver().await;

    assert_eq!(
        driver.load_context(&qemu_state(1)).await.err(),
        Some(HypervisorError::WrongDriver {
            expected: "xen".to_string(),
            found: "qemu".to_string(),
        })
    );
    assert_eq!(
        driver
            .load_context(&as_map(json!({"hypervisor": "xen", "domid": 0})))
            .await
            .err(),
        Some(HypervisorError::InvalidPersistedState(
            "loaded wrong domid 0".to_string()
        ))
    );
    assert_eq!(
        driver
            .load_context(&as_map(json!({"hypervisor": "xen", "domid": 9})))
            .await
            .err(),
        Some(HypervisorError::Xen(
            "cannot load domain 9, not exist".to_string()
        ))
    );
}
