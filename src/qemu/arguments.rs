// QEMU command line
//
// Socket paths and channel names here are the contract with the guest agent;
// the virtio-serial ports must keep their names.

use std::path::Path;

use crate::hypervisor::constants::{
    DEFAULT_MAX_CPUS, DEFAULT_MAX_MEM_MB, HYPER_CHANNEL_NAME, KERNEL_CMDLINE, SHARE_DIR_TAG,
    TTY_CHANNEL_NAME,
};
use crate::hypervisor::context::VmContext;

/// Arguments for booting `ctx`, without the daemonize/pidfile/log tail.
pub fn build(ctx: &VmContext, qmp_sock: &Path, kvm: bool) -> Vec<String> {
    let boot = &ctx.boot;
    let mut args: Vec<String> = Vec::with_capacity(64);
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    let hotplug = boot.hot_add_cpu_mem || boot.boot_to_be_template || boot.boot_from_template;
    let (machine, mem, smp) = if hotplug {
        (
            "pc-i440fx-2.1",
            format!(
                "size={},slots=1,maxmem={}M",
                boot.memory, DEFAULT_MAX_MEM_MB
            ),
            format!("cpus={},maxcpus={}", boot.cpu, DEFAULT_MAX_CPUS),
        )
    } else {
        ("pc-i440fx-2.0", boot.memory.to_string(), boot.cpu.to_string())
    };

    if kvm {
        push(&[
            "-machine",
            &format!("{},accel=kvm,usb=off", machine),
            "-global",
            "kvm-pit.lost_tick_policy=discard",
            "-cpu",
            "host",
        ]);
    } else {
        push(&["-machine", &format!("{},usb=off", machine), "-cpu", "core2duo"]);
    }

    let kernel_boot = [
        "-kernel",
        boot.kernel.as_str(),
        "-initrd",
        boot.initrd.as_str(),
        "-append",
        KERNEL_CMDLINE,
    ];
    match (boot.bios.is_empty(), boot.cbfs.is_empty()) {
        (false, false) => push(&[
            "-drive",
            &format!("if=pflash,file={},readonly=on", boot.bios),
            "-drive",
            &format!("if=pflash,file={},readonly=on", boot.cbfs),
        ]),
        (false, true) => {
            push(&["-bios", &boot.bios]);
            push(&kernel_boot);
        }
        (true, false) => push(&["-drive", &format!("if=pflash,file={},readonly=on", boot.cbfs)]),
        (true, true) => push(&kernel_boot),
    }

    push(&[
        "-realtime",
        "mlock=off",
        "-no-user-config",
        "-nodefaults",
        "-no-hpet",
        "-rtc",
        "base=utc,driftfix=slew",
        "-no-reboot",
        "-display",
        "none",
        "-boot",
        "strict=on",
        "-m",
        &mem,
        "-smp",
        &smp,
    ]);

    if boot.boot_to_be_template || boot.boot_from_template {
        let mut object = format!(
            "memory-backend-file,id=hyper-template-memory,size={}M,mem-path={}",
            boot.memory, boot.memory_path
        );
        object.push_str(if boot.boot_to_be_template {
            ",share=on"
        } else {
            ",share=off"
        });
        push(&[
            "-object",
            &object,
            "-numa",
            &format!(
                "node,nodeid=0,cpus=0-{},memdev=hyper-template-memory",
                DEFAULT_MAX_CPUS - 1
            ),
        ]);
        if boot.boot_from_template {
            push(&[
                "-S",
                "-incoming",
                &format!("exec:cat {}", boot.devices_state_path),
            ]);
        }
    } else if boot.hot_add_cpu_mem {
        push(&[
            "-numa",
            &format!(
                "node,nodeid=0,cpus=0-{},mem={}",
                DEFAULT_MAX_CPUS - 1,
                boot.memory
            ),
        ]);
    }

    push(&[
        "-qmp",
        &format!("unix:{},server,nowait", qmp_sock.display()),
        "-serial",
        &format!("unix:{},server,nowait", ctx.console_sock_name.display()),
        "-device",
        "virtio-serial-pci,id=virtio-serial0,bus=pci.0,addr=0x2",
        "-device",
        "virtio-scsi-pci,id=scsi0,bus=pci.0,addr=0x3",
        "-chardev",
        &format!(
            "socket,id=charch0,path={},server,nowait",
            ctx.hyper_sock_name.display()
        ),
        "-device",
        &format!(
            "virtserialport,bus=virtio-serial0.0,nr=1,chardev=charch0,id=channel0,name={}",
            HYPER_CHANNEL_NAME
        ),
        "-chardev",
        &format!(
            "socket,id=charch1,path={},server,nowait",
            ctx.tty_sock_name.display()
        ),
        "-device",
        &format!(
            "virtserialport,bus=virtio-serial0.0,nr=2,chardev=charch1,id=channel1,name={}",
            TTY_CHANNEL_NAME
        ),
        "-fsdev",
        &format!(
            "local,id=virtio9p,path={},security_model=none",
            ctx.share_dir.display()
        ),
        "-device",
        &format!("virtio-9p-pci,fsdev=virtio9p,mount_tag={}", SHARE_DIR_TAG),
    ]);

    args
}

/// `-device` value for a vhost-vsock PCI device
pub fn vsock_device(addr: u32, guest_cid: u32) -> String {
    format!(
        "vhost-vsock-pci,id=vsock0,bus=pci.0,addr={:x},guest-cid={}",
        addr, guest_cid
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::context::BootConfig;
    use crate::qemu::QemuDriver;

    fn context(boot: BootConfig) -> VmContext {
        let driver = QemuDriver::new("qemu-system-x86_64");
        VmContext::new("vm-test", boot, "/run/hyper/vm-test", &driver).0
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_default_kvm_boot() {
        let ctx = context(BootConfig::default());
        let args = build(&ctx, Path::new("/run/hyper/vm-test/qmp.sock"), true);
        assert_eq!(value_after(&args, "-machine"), vec!["pc-i440fx-2.0,accel=kvm,usb=off"]);
        assert_eq!(value_after(&args, "-cpu"), vec!["host"]);
        assert_eq!(value_after(&args, "-m"), vec!["128"]);
        assert_eq!(value_after(&args, "-smp"), vec!["1"]);
        assert_eq!(
            value_after(&args, "-append"),
            vec!["console=ttyS0 panic=1 no_timer_check"]
        );
        assert_eq!(
            value_after(&args, "-qmp"),
            vec!["unix:/run/hyper/vm-test/qmp.sock,server,nowait"]
        );
        assert!(args.iter().any(|a| a.ends_with("name=sh.hyper.channel.0")));
        assert!(args.iter().any(|a| a.ends_with("name=sh.hyper.channel.1")));
        assert!(args.iter().any(|a| a == "virtio-9p-pci,fsdev=virtio9p,mount_tag=share_dir"));
    }

    #[tokio::test]
    async fn test_hotplug_without_kvm() {
        let ctx = context(BootConfig {
            cpu: 2,
            memory: 512,
            hot_add_cpu_mem: true,
            ..Default::default()
        });
        let args = build(&ctx, Path::new("/q"), false);
        assert_eq!(value_after(&args, "-machine"), vec!["pc-i440fx-2.1,usb=off"]);
        assert_eq!(value_after(&args, "-cpu"), vec!["core2duo"]);
        assert_eq!(value_after(&args, "-m"), vec!["size=512,slots=1,maxmem=32768M"]);
        assert_eq!(value_after(&args, "-smp"), vec!["cpus=2,maxcpus=8"]);
        assert_eq!(value_after(&args, "-numa"), vec!["node,nodeid=0,cpus=0-7,mem=512"]);
        assert!(!args.iter().any(|a| a == "-global"));
    }

    #[tokio::test]
    async fn test_boot_from_template() {
        let ctx = context(BootConfig {
            boot_from_template: true,
            memory_path: "/tpl/memory".into(),
            devices_state_path: "/tpl/state".into(),
            ..Default::default()
        });
        let args = build(&ctx, Path::new("/q"), true);
        assert_eq!(
            value_after(&args, "-object"),
            vec!["memory-backend-file,id=hyper-template-memory,size=128M,mem-path=/tpl/memory,share=off"]
        );
        assert_eq!(value_after(&args, "-incoming"), vec!["exec:cat /tpl/state"]);
        assert!(args.iter().any(|a| a == "-S"));
    }

    #[tokio::test]
    async fn test_firmware_boot() {
        let ctx = context(BootConfig {
            bios: "/fw/bios.bin".into(),
            cbfs: "/fw/cbfs.rom".into(),
            ..Default::default()
        });
        let args = build(&ctx, Path::new("/q"), true);
        assert_eq!(
            value_after(&args, "-drive"),
            vec![
                "if=pflash,file=/fw/bios.bin,readonly=on",
                "if=pflash,file=/fw/cbfs.rom,readonly=on"
            ]
        );
        assert!(!args.iter().any(|a| a == "-kernel"));
    }

    #[test]
    fn test_vsock_device() {
        assert_eq!(
            vsock_device(0x0b, 3),
            "vhost-vsock-pci,id=vsock0,bus=pci.0,addr=b,guest-cid=3"
        );
    }
}
