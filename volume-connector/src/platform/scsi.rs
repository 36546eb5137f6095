//! SCSI block device helpers

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::{CommandSpec, Executor};
use crate::host::{HostIo, device_name};

/// sysfs directory of a block device: `/dev/sdb` -> `/sys/block/sdb`.
pub fn sysfs_block_dir(device: &Path) -> PathBuf {
    Path::new("/sys/block").join(device_name(device))
}

/// World Wide Name of a SCSI disk.
///
/// Read from `/sys/block/<dev>/device/wwid`; falls back to `scsi_id` when the
/// attribute is missing (older kernels, some HBAs).
pub async fn wwn(exec: &dyn Executor, host: &dyn HostIo, device: &Path) -> Option<String> {
    let wwid_path = sysfs_block_dir(device).join("device/wwid");
    if let Some(wwid) = host.read_trimmed(&wwid_path) {
        return Some(wwid);
    }

    let cmd = CommandSpec::new("scsi_id")
        .args(["--page", "0x83", "--whitelisted"])
        .arg(device.to_string_lossy());
    match exec.execute(&cmd).await {
        Ok(out) => {
            let wwn = out.stdout.trim();
            (!wwn.is_empty()).then(|| wwn.to_string())
        }
        Err(e) => {
            debug!(device = %device.display(), error = %e, "scsi_id failed");
            None
        }
    }
}

/// Device-mapper holders of a device (`dm-3`, ...).
pub fn holders(host: &dyn HostIo, device: &Path) -> Vec<String> {
    host.read_dir_names(&sysfs_block_dir(device).join("holders"))
        .unwrap_or_default()
        .into_iter()
        .filter(|name| name.starts_with("dm-"))
        .collect()
}

/// Size of a block device in bytes.
pub async fn size_bytes(exec: &dyn Executor, device: &Path) -> Result<u64> {
    let out = exec
        .execute(
            &CommandSpec::new("blockdev")
                .arg("--getsize64")
                .arg(device.to_string_lossy()),
        )
        .await?;
    out.stdout.trim().parse::<u64>().map_err(|e| {
        crate::error::ConnectorError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected blockdev output '{}': {}", out.stdout.trim(), e),
        ))
    })
}

/// Ask the kernel to re-read the capacity of a SCSI disk.
pub async fn rescan(exec: &dyn Executor, device: &Path) -> Result<()> {
    let path = sysfs_block_dir(device).join("device/rescan");
    exec.execute(&CommandSpec::write_sysfs(path.to_string_lossy(), "1"))
        .await?;
    Ok(())
}

/// Flush and delete a single-path SCSI device.
///
/// A flush failure aborts the removal unless `force` is set, in which case
/// it is returned as a warning and the delete is still issued.
pub async fn remove_device(
    exec: &dyn Executor,
    host: &dyn HostIo,
    device: &Path,
    force: bool,
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    let delete = sysfs_block_dir(device).join("device/delete");
    if !host.exists(&delete) {
        debug!(device = %device.display(), "Device already gone, nothing to remove");
        return Ok(warnings);
    }

    let flush = CommandSpec::new("blockdev")
        .arg("--flushbufs")
        .arg(device.to_string_lossy());
    if let Err(e) = exec.execute(&flush).await {
        if !force {
            return Err(e.into());
        }
        warn!(device = %device.display(), error = %e, "Flush failed, removing anyway");
        warnings.push(format!("flush of {} failed: {}", device.display(), e));
    }

    info!(device = %device.display(), "Removing SCSI device");
    exec.execute(&CommandSpec::write_sysfs(delete.to_string_lossy(), "1"))
        .await?;
    Ok(warnings)
}
