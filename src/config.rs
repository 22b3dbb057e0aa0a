// Configuration File Support
//
// TOML configuration with environment variable overrides, loaded from the XDG
// config directory: ~/.config/hyperpod/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::hypervisor::constants::{
    BASE_DIR, DEFAULT_CPUS, DEFAULT_INITRD, DEFAULT_KERNEL, DEFAULT_MEMORY_MB, LIBVIRT_URI,
    QEMU_LOG_DIR,
};
use crate::hypervisor::loader::DRIVER_NAMES;
use crate::logging::{LogFormat, LogLevel, LoggingConfig};

const MIN_MEMORY_MB: u32 = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub logging: LogConfig,
    pub hypervisor: HypervisorConfig,
    pub network: NetworkConfig,
    pub metrics: MetricsConfig,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    /// plain, json
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

/// `[hypervisor]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Driver name for `probe`; empty picks xen when available, else qemu
    pub driver: String,
    /// Parent of the per-VM home directories
    pub base_dir: PathBuf,
    /// QEMU binary; searched on PATH when unset
    pub qemu_executable: Option<PathBuf>,
    pub qemu_log_dir: PathBuf,
    pub libvirt_uri: String,
    pub kernel: String,
    pub initrd: String,
    pub default_cpus: u32,
    pub default_memory_mb: u32,
    pub enable_vsock: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            base_dir: PathBuf::from(BASE_DIR),
            qemu_executable: None,
            qemu_log_dir: PathBuf::from(QEMU_LOG_DIR),
            libvirt_uri: LIBVIRT_URI.to_string(),
            kernel: DEFAULT_KERNEL.to_string(),
            initrd: DEFAULT_INITRD.to_string(),
            default_cpus: DEFAULT_CPUS,
            default_memory_mb: DEFAULT_MEMORY_MB,
            enable_vsock: false,
        }
    }
}

/// `[network]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge: String,
    pub bridge_ip: String,
    pub disable_iptables: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: "hyper0".to_string(),
            bridge_ip: "192.168.123.0/24".to_string(),
            disable_iptables: false,
        }
    }
}

/// `[metrics]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load from the default path; a missing file means defaults.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load from `path`, apply environment overrides and validate.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!(path = %path.display(), "Loaded configuration");
            config
        } else {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `~/.config/hyperpod/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("sh", "hyperpod", "hyperpod") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("hyperpod")
                .join("config.toml")
        }
    }

    /// Environment variables take precedence over config file values:
    /// - HYPERPOD_LOG_LEVEL, HYPERPOD_LOG_FORMAT
    /// - HYPERPOD_DRIVER, HYPERPOD_BASE_DIR, HYPERPOD_QEMU
    /// - HYPERPOD_BRIDGE, HYPERPOD_DISABLE_IPTABLES
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = lookup("HYPERPOD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("HYPERPOD_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(driver) = lookup("HYPERPOD_DRIVER") {
            self.hypervisor.driver = driver;
        }
        if let Some(dir) = lookup("HYPERPOD_BASE_DIR") {
            self.hypervisor.base_dir = PathBuf::from(dir);
        }
        if let Some(qemu) = lookup("HYPERPOD_QEMU") {
            self.hypervisor.qemu_executable = Some(PathBuf::from(qemu));
        }

        if let Some(bridge) = lookup("HYPERPOD_BRIDGE") {
            self.network.bridge = bridge;
        }
        if let Some(disable) = lookup("HYPERPOD_DISABLE_IPTABLES") {
            self.network.disable_iptables = disable.parse().unwrap_or(self.network.disable_iptables);
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!("{}. Must be one of: trace, debug, info, warn, error", e))?;
        self.logging
            .format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!("{}. Must be one of: plain, json", e))?;

        if !DRIVER_NAMES.contains(&self.hypervisor.driver.as_str()) {
            anyhow::bail!("Unknown hypervisor driver: {}", self.hypervisor.driver);
        }
        if self.hypervisor.default_cpus == 0 {
            anyhow::bail!("VM cpu count must be > 0");
        }
        if self.hypervisor.default_memory_mb < MIN_MEMORY_MB {
            anyhow::bail!("VM memory must be at least {} MB", MIN_MEMORY_MB);
        }

        if !self.network.disable_iptables && self.network.bridge.is_empty() {
            anyhow::bail!("Bridge name is required unless iptables is disabled");
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Logging settings for [`LoggingConfig::init`]
    pub fn logging_config(&self) -> Result<LoggingConfig> {
        Ok(LoggingConfig {
            level: self.logging.level.parse().map_err(anyhow::Error::msg)?,
            format: self.logging.format.parse().map_err(anyhow::Error::msg)?,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.hypervisor.driver, "");
        assert_eq!(config.hypervisor.base_dir, PathBuf::from("/var/run/hyper"));
        assert_eq!(config.hypervisor.libvirt_uri, "qemu:///system");
        assert_eq!(config.hypervisor.default_cpus, 1);
        assert_eq!(config.hypervisor.default_memory_mb, 128);
        assert_eq!(config.network.bridge, "hyper0");
        assert_eq!(config.network.bridge_ip, "192.168.123.0/24");
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hypervisor.driver = "bhyve".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hypervisor.default_cpus = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hypervisor.default_memory_mb = 32;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_bridge_needs_iptables_disabled() {
        let mut config = Config::default();
        config.network.bridge.clear();
        assert!(config.validate().is_err());
        config.network.disable_iptables = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("missing.toml"));
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[hypervisor]
driver = "libvirt"
qemu_executable = "/opt/qemu/bin/qemu-system-x86_64"
libvirt_uri = "qemu+ssh://host/system"
default_cpus = 2

[network]
bridge = "br-pods"

[metrics]
enabled = true
port = 9100
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let content = fs::read_to_string(temp_file.path()).unwrap();
        let config: Config = toml::from_str(&content).unwrap();
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.hypervisor.driver, "libvirt");
        assert_eq!(
            config.hypervisor.qemu_executable,
            Some(PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"))
        );
        assert_eq!(config.hypervisor.default_cpus, 2);
        // unset keys keep their defaults
        assert_eq!(config.hypervisor.default_memory_mb, 128);
        assert_eq!(config.network.bridge, "br-pods");
        assert_eq!(config.network.bridge_ip, "192.168.123.0/24");
        assert_eq!(config.metrics.port, 9100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[logging\nlevel = \"debug\"\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = Config::default().apply_overrides(lookup(&[
            ("HYPERPOD_LOG_LEVEL", "trace"),
            ("HYPERPOD_DRIVER", "qemu"),
            ("HYPERPOD_BASE_DIR", "/tmp/hyper"),
            ("HYPERPOD_QEMU", "/usr/local/bin/qemu"),
            ("HYPERPOD_BRIDGE", "br0"),
            ("HYPERPOD_DISABLE_IPTABLES", "true"),
        ]));
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.hypervisor.driver, "qemu");
        assert_eq!(config.hypervisor.base_dir, PathBuf::from("/tmp/hyper"));
        assert_eq!(
            config.hypervisor.qemu_executable,
            Some(PathBuf::from("/usr/local/bin/qemu"))
        );
        assert_eq!(config.network.bridge, "br0");
        assert!(config.network.disable_iptables);
    }

    #[test]
    fn test_unparsable_bool_override_is_ignored() {
        let config =
            Config::default().apply_overrides(lookup(&[("HYPERPOD_DISABLE_IPTABLES", "maybe")]));
        assert!(!config.network.disable_iptables);
    }

    #[test]
    fn test_logging_config() {
        let mut config = Config::default();
        config.logging.level = "warn".to_string();
        config.logging.format = "json".to_string();
        let logging = config.logging_config().unwrap();
        assert_eq!(logging.level, LogLevel::Warn);
        assert_eq!(logging.format, LogFormat::Json);
    }

    #[test]
    fn test_config_path() {
        assert!(Config::config_path().ends_with("config.toml"));
    }
}
