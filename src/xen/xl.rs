// Xen toolstack access
//
// The driver only needs a handful of domain and device operations. `XlToolstack`
// runs them through the `xl` CLI; domain configs are handed over in scratch
// files.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hypervisor::error::HypervisorError;

const XL: &str = "xl";
const IP: &str = "ip";
const DEATH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What `xl info` reports that the driver cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XenInfo {
    pub major: u32,
    pub minor: u32,
    pub capabilities: String,
}

impl XenInfo {
    /// Parse the `key : value` lines of `xl info`.
    pub fn parse(output: &str) -> Result<Self, HypervisorError> {
        let field = |key: &str| {
            output.lines().find_map(|line| {
                let (k, v) = line.split_once(':')?;
                (k.trim() == key).then(|| v.trim().to_string())
            })
        };
        let number = |key: &str| -> Result<u32, HypervisorError> {
            field(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| HypervisorError::Xen(format!("xl info has no valid {}", key)))
        };
        Ok(Self {
            major: number("xen_major")?,
            minor: number("xen_minor")?,
            capabilities: field("xen_caps").unwrap_or_default(),
        })
    }

    pub fn supports_hvm(&self) -> bool {
        self.capabilities
            .split_whitespace()
            .any(|cap| cap.starts_with("hvm-"))
    }
}

/// HVM guest definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    pub name: String,
    pub kernel: String,
    pub initrd: String,
    pub cmdline: String,
    pub max_vcpus: u32,
    pub max_memory_mb: u32,
    /// QEMU `-serial` target for the guest console
    pub console: String,
    /// Extra device-model arguments
    pub extra: Vec<String>,
}

impl DomainConfig {
    /// The config file `xl create` reads.
    pub fn to_xl_config(&self) -> String {
        let quote = |s: &str| format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""));
        let mut cfg = String::new();
        let _ = writeln!(cfg, "name = {}", quote(&self.name));
        let _ = writeln!(cfg, "builder = \"hvm\"");
        let _ = writeln!(cfg, "kernel = {}", quote(&self.kernel));
        let _ = writeln!(cfg, "ramdisk = {}", quote(&self.initrd));
        let _ = writeln!(cfg, "cmdline = {}", quote(&self.cmdline));
        let _ = writeln!(cfg, "vcpus = {}", self.max_vcpus);
        let _ = writeln!(cfg, "memory = {}", self.max_memory_mb);
        let _ = writeln!(cfg, "serial = {}", quote(&self.console));
        let _ = writeln!(cfg, "on_poweroff = \"destroy\"");
        let _ = writeln!(cfg, "on_reboot = \"destroy\"");
        let _ = writeln!(cfg, "on_crash = \"destroy\"");
        let extra: Vec<String> = self.extra.iter().map(|a| quote(a)).collect();
        let _ = writeln!(cfg, "device_model_args_hvm = [ {} ]", extra.join(", "));
        cfg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskBackend {
    Phy,
    Tap,
}

impl DiskBackend {
    /// Block devices go through `phy`, image files through `tap`.
    pub fn for_source(source: &str) -> Self {
        if source.starts_with("/dev/") {
            Self::Phy
        } else {
            Self::Tap
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Phy => "phy",
            Self::Tap => "tap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub source: String,
    /// Guest device, `xvdX`
    pub target: String,
    pub backend: DiskBackend,
    /// `raw` or `qcow2`
    pub format: &'static str,
}

impl DiskSpec {
    pub fn new(source: &str, target: String, format: &str) -> Self {
        Self {
            source: source.to_string(),
            target,
            backend: DiskBackend::for_source(source),
            format: match format {
                "qcow" | "qcow2" => "qcow2",
                _ => "raw",
            },
        }
    }

    /// `xl block-attach` disk spec string
    pub fn to_xl_spec(&self) -> String {
        format!(
            "format={},vdev={},access=rw,backendtype={},target={}",
            self.format,
            self.target,
            self.backend.as_str(),
            self.source
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    pub mac: String,
    pub bridge: String,
    pub ip: String,
    pub vifname: String,
}

#[async_trait]
pub trait Toolstack: Send + Sync {
    async fn info(&self) -> Result<XenInfo, HypervisorError>;

    /// Create and start the domain; returns its domid.
    async fn create_domain(&self, config: &DomainConfig) -> Result<i32, HypervisorError>;

    async fn domain_exists(&self, domid: i32) -> Result<bool, HypervisorError>;

    async fn destroy_domain(&self, domid: i32) -> Result<(), HypervisorError>;

    /// Resolve once `domid` is gone.
    async fn wait_for_death(&self, domid: i32) -> Result<(), HypervisorError>;

    async fn disk_attach(&self, domid: i32, disk: &DiskSpec) -> Result<(), HypervisorError>;

    async fn disk_detach(&self, domid: i32, disk: &DiskSpec) -> Result<(), HypervisorError>;

    async fn nic_attach(&self, domid: i32, nic: &NicSpec) -> Result<(), HypervisorError>;

    async fn nic_detach(&self, domid: i32, mac: &str) -> Result<(), HypervisorError>;

    /// Enslave `ifname` to `bridge` and bring it up.
    async fn add_to_bridge(&self, ifname: &str, bridge: &str) -> Result<(), HypervisorError>;
}

#[derive(Debug, Clone)]
pub struct XlToolstack {
    xl: PathBuf,
    ip: PathBuf,
    scratch_dir: PathBuf,
    death_poll: Duration,
}

impl Default for XlToolstack {
    fn default() -> Self {
        Self::new()
    }
}

impl XlToolstack {
    pub fn new() -> Self {
        Self {
            xl: PathBuf::from(XL),
            ip: PathBuf::from(IP),
            scratch_dir: std::env::temp_dir(),
            death_poll: DEATH_POLL_INTERVAL,
        }
    }

    pub fn with_programs(mut self, xl: impl Into<PathBuf>, ip: impl Into<PathBuf>) -> Self {
        self.xl = xl.into();
        self.ip = ip.into();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_death_poll(mut self, interval: Duration) -> Self {
        self.death_poll = interval;
        self
    }

    async fn run(program: &Path, args: &[&str]) -> Result<std::process::Output, HypervisorError> {
        debug!(program = %program.display(), ?args, "toolstack");
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| HypervisorError::Xen(format!("failed to run {}: {}", program.display(), e)))
    }

    async fn checked(program: &Path, args: &[&str]) -> Result<String, HypervisorError> {
        let output = Self::run(program, args).await?;
        if !output.status.success() {
            return Err(HypervisorError::Xen(format!(
                "{} {} failed: {}",
                program.display(),
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn xl(&self, args: &[&str]) -> Result<String, HypervisorError> {
        Self::checked(&self.xl, args).await
    }
}

#[async_trait]
impl Toolstack for XlToolstack {
    async fn info(&self) -> Result<XenInfo, HypervisorError> {
        XenInfo::parse(&self.xl(&["info"]).await?)
    }

    async fn create_domain(&self, config: &DomainConfig) -> Result<i32, HypervisorError> {
        let path = self
            .scratch_dir
            .join(format!("hyperpod-{}.cfg", Uuid::new_v4()));
        tokio::fs::write(&path, config.to_xl_config())
            .await
            .map_err(|e| HypervisorError::Xen(format!("write {} failed: {}", path.display(), e)))?;
        let created = self.xl(&["create", &path.display().to_string()]).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(file = %path.display(), error = %e, "remove domain config failed");
        }
        created?;

        let domid = self.xl(&["domid", &config.name]).await?;
        domid
            .trim()
            .parse()
            .map_err(|_| HypervisorError::Xen(format!("unexpected domid {:?}", domid.trim())))
    }

    async fn domain_exists(&self, domid: i32) -> Result<bool, HypervisorError> {
        let output = Self::run(&self.xl, &["list", &domid.to_string()]).await?;
        Ok(output.status.success())
    }

    async fn destroy_domain(&self, domid: i32) -> Result<(), HypervisorError> {
        self.xl(&["destroy", &domid.to_string()]).await.map(drop)
    }

    async fn wait_for_death(&self, domid: i32) -> Result<(), HypervisorError> {
        while self.domain_exists(domid).await? {
            tokio::time::sleep(self.death_poll).await;
        }
        Ok(())
    }

    async fn disk_attach(&self, domid: i32, disk: &DiskSpec) -> Result<(), HypervisorError> {
        self.xl(&["block-attach", &domid.to_string(), &disk.to_xl_spec()])
            .await
            .map(drop)
    }

    async fn disk_detach(&self, domid: i32, disk: &DiskSpec) -> Result<(), HypervisorError> {
        self.xl(&["block-detach", &domid.to_string(), &disk.target])
            .await
            .map(drop)
    }

    async fn nic_attach(&self, domid: i32, nic: &NicSpec) -> Result<(), HypervisorError> {
        let mut args = vec![
            "network-attach".to_string(),
            domid.to_string(),
            format!("mac={}", nic.mac),
            format!("bridge={}", nic.bridge),
            format!("vifname={}", nic.vifname),
        ];
        if !nic.ip.is_empty() {
            args.push(format!("ip={}", nic.ip));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.xl(&args).await.map(drop)
    }

    async fn nic_detach(&self, domid: i32, mac: &str) -> Result<(), HypervisorError> {
        self.xl(&["network-detach", &domid.to_string(), mac])
            .await
            .map(drop)
    }

    async fn add_to_bridge(&self, ifname: &str, bridge: &str) -> Result<(), HypervisorError> {
        Self::checked(&self.ip, &["link", "set", "dev", ifname, "master", bridge]).await?;
        Self::checked(&self.ip, &["link", "set", "dev", ifname, "up"])
            .await
            .map(drop)
    }
}
