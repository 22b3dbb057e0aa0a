// Well-known paths and numbers shared by every backend.
//
// The guest agent looks the virtio-serial ports up by name, so the channel
// names below must never change.

pub const BASE_DIR: &str = "/var/run/hyper";
pub const HYPER_SOCK_NAME: &str = "hyper.sock";
pub const TTY_SOCK_NAME: &str = "tty.sock";
pub const CONSOLE_SOCK_NAME: &str = "console.sock";
pub const SHARE_DIR_TAG: &str = "share_dir";

pub const HYPER_CHANNEL_NAME: &str = "sh.hyper.channel.0";
pub const TTY_CHANNEL_NAME: &str = "sh.hyper.channel.1";

pub const DEFAULT_KERNEL: &str = "/var/lib/hyper/kernel";
pub const DEFAULT_INITRD: &str = "/var/lib/hyper/hyper-initrd.img";
pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_MEMORY_MB: u32 = 128;
pub const DEFAULT_MAX_CPUS: u32 = 8;
pub const DEFAULT_MAX_MEM_MB: u32 = 32768;

/// First PCI slot handed out for hotplugged devices.
pub const PCI_ADDR_FROM: u32 = 0x05;

pub const KERNEL_CMDLINE: &str = "console=ttyS0 panic=1 no_timer_check";
pub const KVM_DEVICE: &str = "/dev/kvm";

pub const QMP_SOCK_NAME: &str = "qmp.sock";
pub const QEMU_PID_FILE: &str = "pidfile";
pub const QEMU_LOG_DIR: &str = "/var/log/hyper/qemu";
pub const QEMU_SYSTEM_EXE: &str = "qemu-system-x86_64";

pub const LIBVIRT_URI: &str = "qemu:///system";
