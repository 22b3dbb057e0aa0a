//! QMP command lists for hotplug and lifecycle operations
//!
//! Builders here are pure; `QemuContext` wraps their output in a
//! [`QmpSession`](crate::qemu::handler::QmpSession) with a respond callback.

use serde_json::json;
use std::collections::HashMap;
use std::path::Path;

use crate::hypervisor::disk::scsi_id_to_addr;
use crate::hypervisor::driver::{GuestNicInfo, HostNicInfo};
use crate::hypervisor::error::HypervisorError;
use crate::qemu::qmp::QmpCommand;

pub fn quit() -> Vec<QmpCommand> {
    vec![QmpCommand::new("quit")]
}

pub fn pause(pause: bool) -> Vec<QmpCommand> {
    vec![QmpCommand::new(if pause { "stop" } else { "cont" })]
}

/// Append rbd auth and monitor hosts to a `rbd:` filename.
pub fn rbd_filename(filename: &str, options: &HashMap<String, String>) -> String {
    let mut filename = filename.to_string();
    let user = options.get("user").map(String::as_str).unwrap_or_default();
    let keyring = options.get("keyring").map(String::as_str).unwrap_or_default();
    if !user.is_empty() && !keyring.is_empty() {
        filename.push_str(&format!(":id={}:key={}", user, keyring));
    }

    if let Some(monitors) = options.get("monitors") {
        for (i, monitor) in monitors.split(';').enumerate() {
            let monitor = monitor.replace(':', "\\:");
            if i == 0 {
                filename.push_str(":mon_host=");
            } else {
                filename.push(';');
            }
            filename.push_str(&monitor);
        }
    }
    filename
}

pub fn disk_add(filename: &str, format: &str, id: u32) -> Result<Vec<QmpCommand>, HypervisorError> {
    let (target, unit) = scsi_id_to_addr(id)?;
    Ok(vec![
        QmpCommand::hmp(format!(
            "drive_add dummy file={},if=none,id=drive{},format={},cache=writeback",
            filename, id, format
        )),
        QmpCommand::with_args(
            "device_add",
            json!({
                "driver": "scsi-hd",
                "bus": "scsi0.0",
                "scsi-id": target,
                "lun": unit,
                "drive": format!("drive{}", id),
                "id": format!("scsi-disk{}", id),
            }),
        ),
    ])
}

pub fn disk_del(id: u32) -> Vec<QmpCommand> {
    vec![
        QmpCommand::hmp(format!("drive_del drive{}", id)),
        QmpCommand::with_args("device_del", json!({ "id": format!("scsi-disk{}", id) })),
    ]
}

/// NIC hotplug: vhost-user, then fd passing, then a named tap.
pub fn nic_add(
    vhost_user: bool,
    home_dir: &Path,
    host: &HostNicInfo,
    guest: &GuestNicInfo,
) -> Vec<QmpCommand> {
    let mut commands = Vec::with_capacity(3);
    if vhost_user {
        let chardev = format!("{}-chardev", guest.device);
        commands.push(QmpCommand::with_args(
            "chardev-add",
            json!({
                "id": chardev,
                "backend": {
                    "type": "socket",
                    "data": {
                        "addr": {
                            "type": "unix",
                            "data": { "path": home_dir.join(&host.id).to_string_lossy() },
                        },
                        "wait": false,
                        "server": true,
                    },
                },
            }),
        ));
        commands.push(QmpCommand::with_args(
            "netdev_add",
            json!({
                "type": "vhost-user",
                "id": guest.device,
                "chardev": chardev,
                "vhostforce": true,
            }),
        ));
    } else if host.fd > 0 {
        let fdname = format!("fd{}", guest.device);
        commands.push(
            QmpCommand::with_args("getfd", json!({ "fdname": fdname })).with_fd(host.fd),
        );
        commands.push(QmpCommand::with_args(
            "netdev_add",
            json!({ "type": "tap", "id": guest.device, "fd": fdname }),
        ));
    } else if !host.device.is_empty() {
        commands.push(QmpCommand::with_args(
            "netdev_add",
            json!({
                "type": "tap",
                "id": guest.device,
                "ifname": host.device,
                "script": "no",
            }),
        ));
    }

    commands.push(QmpCommand::with_args(
        "device_add",
        json!({
            "driver": "virtio-net-pci",
            "netdev": guest.device,
            "mac": host.mac,
            "bus": "pci.0",
            "addr": format!("0x{:x}", guest.busaddr),
            "id": guest.device,
        }),
    ));
    commands
}

pub fn nic_del(device: &str) -> Vec<QmpCommand> {
    vec![
        QmpCommand::with_args("device_del", json!({ "id": device })),
        QmpCommand::with_args("netdev_del", json!({ "id": device })),
    ]
}

/// `cpu-add` for every id in `current..target`
pub fn cpu_add(current: u32, target: u32) -> Vec<QmpCommand> {
    (current..target)
        .map(|id| QmpCommand::with_args("cpu-add", json!({ "id": id })))
        .collect()
}

pub fn mem_add(slot: u32, size_mb: u64) -> Vec<QmpCommand> {
    vec![
        QmpCommand::with_args(
            "object-add",
            json!({
                "qom-type": "memory-backend-ram",
                "id": format!("mem{}", slot),
                "props": { "size": size_mb << 20 },
            }),
        ),
        QmpCommand::with_args(
            "device_add",
            json!({
                "driver": "pc-dimm",
                "id": format!("dimm{}", slot),
                "memdev": format!("mem{}", slot),
            }),
        ),
    ]
}

pub fn save(path: &Path, to_be_template: bool) -> Vec<QmpCommand> {
    let mut commands = Vec::with_capacity(2);
    if to_be_template {
        commands.push(QmpCommand::with_args(
            "migrate-set-capabilities",
            json!({
                "capabilities": [
                    { "capability": "bypass-shared-memory", "state": true },
                ],
            }),
        ));
    }
    commands.push(QmpCommand::with_args(
        "migrate",
        json!({ "uri": format!("exec:cat>{}", path.display()) }),
    ));
    commands
}
