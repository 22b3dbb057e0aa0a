// libvirt XML documents
//
// Key invariants:
// - Every text value and attribute goes through `escape`.
// - Device addresses here must agree with the QEMU command line: virtio-serial
//   at slot 0x02, virtio-scsi at 0x03, 9p share at 0x04, balloon at 0x05.

use std::path::{Path, PathBuf};

use crate::hypervisor::constants::{
    DEFAULT_MAX_CPUS, DEFAULT_MAX_MEM_MB, HYPER_CHANNEL_NAME, KERNEL_CMDLINE, SHARE_DIR_TAG,
    TTY_CHANNEL_NAME,
};
use crate::hypervisor::context::{BootConfig, VmContext};
use crate::hypervisor::disk::{scsi_id_to_addr, scsi_id_to_name};
use crate::hypervisor::driver::DiskDescriptor;
use crate::hypervisor::error::HypervisorError;

pub const TEMPLATE_WRAPPER_NAME: &str = "libvirt-qemu-template-wrapper.sh";
const CEPH_MONITOR_PORT: &str = "6789";

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn pci_address(slot: &str) -> String {
    format!(
        "<address type='pci' domain='0x0000' bus='0x00' slot='{}' function='0x00'/>",
        slot
    )
}

fn unix_source(path: &Path) -> String {
    format!(
        "<source mode='bind' path='{}'/>",
        escape(&path.display().to_string())
    )
}

/// Where the template wrapper lives: next to the template memory file.
pub fn template_wrapper_path(boot: &BootConfig) -> PathBuf {
    Path::new(&boot.memory_path)
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .join(TEMPLATE_WRAPPER_NAME)
}

/// Emulator for `boot`: the template wrapper for template boots, else `qemu`.
pub fn emulator_for(boot: &BootConfig, qemu: &Path) -> PathBuf {
    if boot.boot_to_be_template || boot.boot_from_template {
        template_wrapper_path(boot)
    } else {
        qemu.to_path_buf()
    }
}

/// Domain definition for `ctx`.
pub fn domain_xml(ctx: &VmContext, emulator: &Path, kvm: bool) -> String {
    let boot = &ctx.boot;
    let mut xml = String::with_capacity(4096);

    xml.push_str(&format!(
        "<domain type='{}'><name>{}</name><memory unit='MiB'>{}</memory>",
        if kvm { "kvm" } else { "qemu" },
        escape(&ctx.id),
        boot.memory
    ));

    let (machine, vcpu_max) = if boot.hot_add_cpu_mem {
        xml.push_str(&format!(
            "<maxMemory slots='1' unit='MiB'>{}</maxMemory>",
            DEFAULT_MAX_MEM_MB
        ));
        ("pc-i440fx-2.1", DEFAULT_MAX_CPUS)
    } else {
        ("pc-i440fx-2.0", boot.cpu)
    };
    xml.push_str(&format!(
        "<vcpu placement='static' current='{}'>{}</vcpu>",
        boot.cpu, vcpu_max
    ));

    xml.push_str(&format!(
        "<os supported='yes'><type arch='x86_64' machine='{}'>hvm</type>",
        machine
    ));
    if boot.uses_firmware() {
        xml.push_str(&format!(
            "<loader readonly='yes' type='pflash'>{}</loader><nvram>{}</nvram>",
            escape(&boot.bios),
            escape(&boot.cbfs)
        ));
    } else {
        xml.push_str(&format!(
            "<kernel>{}</kernel><initrd>{}</initrd><cmdline>{}</cmdline>",
            escape(&boot.kernel),
            escape(&boot.initrd),
            KERNEL_CMDLINE
        ));
    }
    xml.push_str("</os><features><acpi/></features>");

    if kvm {
        xml.push_str("<cpu mode='host-passthrough'>");
    } else {
        xml.push_str(
            "<cpu mode='host-model' match='exact'><model fallback='allow'>core2duo</model>",
        );
    }
    if boot.hot_add_cpu_mem {
        // older libvirt always reads the cell size as KiB
        xml.push_str(&format!(
            "<numa><cell id='0' cpus='0-{}' memory='{}' unit='KiB'/></numa>",
            DEFAULT_MAX_CPUS - 1,
            u64::from(boot.memory) * 1024
        ));
    }
    xml.push_str("</cpu>");

    xml.push_str(
        "<on_poweroff>destroy</on_poweroff><on_reboot>destroy</on_reboot><on_crash>destroy</on_crash>",
    );

    xml.push_str(&format!(
        "<devices><emulator>{}</emulator>",
        escape(&emulator.display().to_string())
    ));
    xml.push_str("<controller type='pci' index='0' model='pci-root'/>");
    xml.push_str(&format!(
        "<controller type='virtio-serial' index='0'>{}</controller>",
        pci_address("0x02")
    ));
    xml.push_str(&format!(
        "<controller type='scsi' index='0' model='virtio-scsi'>{}</controller>",
        pci_address("0x03")
    ));
    xml.push_str("<controller type='usb' model='none'/>");
    xml.push_str(&format!(
        "<filesystem type='mount' accessmode='squash'><driver type='path'/>\
         <source dir='{}'/><target dir='{}'/>{}</filesystem>",
        escape(&ctx.share_dir.display().to_string()),
        SHARE_DIR_TAG,
        pci_address("0x04")
    ));
    for (sock, name) in [
        (&ctx.hyper_sock_name, HYPER_CHANNEL_NAME),
        (&ctx.tty_sock_name, TTY_CHANNEL_NAME),
    ] {
        xml.push_str(&format!(
            "<channel type='unix'>{}<target type='virtio' name='{}'/></channel>",
            unix_source(sock),
            name
        ));
    }
    xml.push_str(&format!(
        "<console type='unix'>{}<target type='serial' port='0'/></console>",
        unix_source(&ctx.console_sock_name)
    ));
    xml.push_str(&format!(
        "<memballoon model='virtio'>{}</memballoon>",
        pci_address("0x05")
    ));
    xml.push_str("</devices><seclabel type='none'/></domain>");
    xml
}

/// Hot-pluggable SCSI disk. Ceph volumes (`rbd:` filenames) become network
/// disks authenticated with `secret_uuid`.
pub fn disk_xml(disk: &DiskDescriptor, secret_uuid: Option<&str>) -> Result<String, HypervisorError> {
    let (target, unit) = scsi_id_to_addr(disk.scsi_id)?;
    let mut xml = String::with_capacity(512);

    match disk.filename.strip_prefix("rbd:") {
        Some(name) => {
            if disk.options.is_empty() {
                return Err(HypervisorError::Libvirt(
                    "Volume options is required for rbd".to_string(),
                ));
            }
            xml.push_str(&format!(
                "<disk type='network' device='disk'><source protocol='rbd' name='{}'>",
                escape(name)
            ));
            let monitors = disk.options.get("monitors").map(String::as_str).unwrap_or("");
            for monitor in monitors.split(';').filter(|m| !m.is_empty()) {
                let (host, port) = match monitor.split_once(':') {
                    Some((host, port)) if !port.contains(':') => (host, port),
                    _ => (monitor, CEPH_MONITOR_PORT),
                };
                xml.push_str(&format!(
                    "<host name='{}' port='{}'/>",
                    escape(host),
                    escape(port)
                ));
            }
            xml.push_str("</source>");
        }
        None => {
            xml.push_str(&format!(
                "<disk type='file' device='disk'><driver type='{}'/><source file='{}'/>",
                escape(&disk.format),
                escape(&disk.filename)
            ));
        }
    }

    xml.push_str(&format!(
        "<target dev='{}' bus='scsi'/><address type='drive' controller='0' bus='0' target='{}' unit='{}'/>",
        scsi_id_to_name(disk.scsi_id),
        target,
        unit
    ));

    if disk.filename.starts_with("rbd:") {
        let user = disk.options.get("user").map(String::as_str).unwrap_or("");
        xml.push_str(&format!(
            "<auth username='{}'><secret type='ceph' uuid='{}'/></auth>",
            escape(user),
            escape(secret_uuid.unwrap_or(""))
        ));
        let limit = |key: &str| {
            disk.options
                .get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
        };
        let bytes = limit("bytespersec");
        let iops = limit("iops");
        if bytes.is_some() || iops.is_some() {
            xml.push_str("<iotune>");
            if let Some(bytes) = bytes {
                xml.push_str(&format!("<total_bytes_sec>{}</total_bytes_sec>", bytes));
            }
            if let Some(iops) = iops {
                xml.push_str(&format!("<total_iops_sec>{}</total_iops_sec>", iops));
            }
            xml.push_str("</iotune>");
        }
    }

    xml.push_str("</disk>");
    Ok(xml)
}

/// Bridged virtio NIC at PCI slot `addr`, with the boot config's QoS.
pub fn nic_xml(bridge: &str, device: &str, mac: &str, addr: u32, boot: &BootConfig) -> String {
    let mut xml = String::with_capacity(512);
    xml.push_str(&format!(
        "<interface type='bridge'><mac address='{}'/><source bridge='{}'/>",
        escape(mac),
        escape(bridge)
    ));
    if !device.is_empty() {
        xml.push_str(&format!("<target dev='{}'/>", escape(device)));
    }
    xml.push_str(&format!(
        "<model type='virtio'/><address type='pci' domain='0x0000' bus='0x00' slot='0x{:x}' function='0x0'/>",
        addr
    ));
    if !boot.inbound_average.is_empty() || !boot.outbound_average.is_empty() {
        xml.push_str("<bandwidth>");
        if !boot.inbound_average.is_empty() {
            xml.push_str(&format!(
                "<inbound average='{}' peak='{}'/>",
                escape(&boot.inbound_average),
                escape(&boot.inbound_peak)
            ));
        }
        if !boot.outbound_average.is_empty() {
            xml.push_str(&format!(
                "<outbound average='{}' peak='{}'/>",
                escape(&boot.outbound_average),
                escape(&boot.outbound_peak)
            ));
        }
        xml.push_str("</bandwidth>");
    }
    xml.push_str("</interface>");
    xml
}

pub fn memory_xml(size_mb: u64) -> String {
    format!(
        "<memory model='dimm'><target><size unit='MiB'>{}</size><node>0</node></target></memory>",
        size_mb
    )
}

/// Persistent ceph secret for `client.<username>`
pub fn ceph_secret_xml(username: &str) -> String {
    format!(
        "<secret ephemeral='no' private='no'><usage type='ceph'><name>client.{}</name></usage></secret>",
        escape(username)
    )
}

/// QEMU wrapper that swaps the hot-add numa node for the template memory
/// backend, and restores device state when a saved state exists.
pub fn template_wrapper_script(boot: &BootConfig, qemu: &Path) -> String {
    format!(
        r#"#!/bin/bash

# qemu wrapper for libvirt driver for templating
# Do NOT modify

memsize="{memsize}"
mempath="{mempath}"
maxcpuid="{maxcpuid}"
statepath="{statepath}"
qemupath="{qemupath}"

argv=()

while true
do
	arg="$1"
	shift || break

	if [ "x${{arg}}" = "x-numa" ]; then
		if [ "next_arg=$1" != "next_arg=node,nodeid=0,cpus=0-${{maxcpuid}},mem=${{memsize}}" ]; then
			echo "unexpected numa argument: $1" >&2
			exit 1
		fi

		if [ -e "${{statepath}}" ]; then
			argv+=("-incoming" "exec:cat $statepath")
			share=off
		else
			share=on
		fi

		argv+=("-object" "memory-backend-file,id=hyper-template-memory,size=${{memsize}}M,mem-path=${{mempath}},share=${{share}}")
		argv+=("-numa" "node,nodeid=0,cpus=0-${{maxcpuid}},memdev=hyper-template-memory")
		shift
	else
		argv+=("${{arg}}")
	fi
done

exec "${{qemupath}}" "${{argv[@]}}"
"#,
        memsize = boot.memory,
        mempath = boot.memory_path,
        maxcpuid = DEFAULT_MAX_CPUS - 1,
        statepath = boot.devices_state_path,
        qemupath = qemu.display(),
    )
}

/// Write the template wrapper with mode 0700.
pub async fn write_template_wrapper(
    path: &Path,
    boot: &BootConfig,
    qemu: &Path,
) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, template_wrapper_script(boot, qemu)).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}
