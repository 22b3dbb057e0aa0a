// Deterministic device naming
//
// Key invariants:
// - scsi_id_to_addr(id) == (id / 256, id % 256) for 0 <= id <= 65535
// - distinct ids always produce distinct names

use crate::hypervisor::error::HypervisorError;

pub const SCSI_ID_MAX: u32 = 256 * 256 - 1;

/// Spreadsheet-style name for a disk index: a..z, aa..az, ba..
pub fn disk_id_to_name(id: u32) -> String {
    let ch = char::from(b'a' + (id % 26) as u8);
    if id < 26 {
        return ch.to_string();
    }
    let mut name = disk_id_to_name(id / 26 - 1);
    name.push(ch);
    name
}

pub fn scsi_id_to_name(id: u32) -> String {
    format!("sd{}", disk_id_to_name(id))
}

pub fn xvd_id_to_name(id: u32) -> String {
    format!("xvd{}", disk_id_to_name(id))
}

/// Split a SCSI id into (target, unit).
pub fn scsi_id_to_addr(id: u32) -> Result<(u32, u32), HypervisorError> {
    if id > SCSI_ID_MAX {
        return Err(HypervisorError::ScsiIdOverflow(id));
    }
    Ok((id / 256, id % 256))
}

/// "target:unit" form reported in block device events.
pub fn scsi_addr_string(id: u32) -> Result<String, HypervisorError> {
    let (target, unit) = scsi_id_to_addr(id)?;
    Ok(format!("{}:{}", target, unit))
}
