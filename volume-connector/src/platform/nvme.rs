//! NVMe subsystem and namespace discovery

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::host::HostIo;

const SUBSYSTEM_CLASS: &str = "/sys/class/nvme-subsystem";
const CONTROLLER_CLASS: &str = "/sys/class/nvme";
const NATIVE_MULTIPATH_PARAM: &str = "/sys/module/nvme_core/parameters/multipath";

/// Check if NVMe native multipath is enabled.
///
/// When it is, the kernel merges controller paths into one namespace device
/// and dm-multipath must not be layered on top.
pub fn native_multipath_enabled(host: &dyn HostIo) -> bool {
    host.read_trimmed(Path::new(NATIVE_MULTIPATH_PARAM))
        .is_some_and(|v| v == "Y" || v == "1")
}

/// Check if a device name is an NVMe namespace (nvmeXnY) and not a
/// controller (nvmeX) or a per-path node (nvmeXcYnZ).
pub fn is_namespace_device(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };

    let ctrl_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if ctrl_len == 0 {
        return false;
    }
    let Some(ns) = rest[ctrl_len..].strip_prefix('n') else {
        return false;
    };
    !ns.is_empty() && ns.chars().all(|c| c.is_ascii_digit())
}

/// Subsystem directories whose `subsysnqn` equals `nqn`.
pub fn subsystems_for_nqn(host: &dyn HostIo, nqn: &str) -> Vec<PathBuf> {
    let root = Path::new(SUBSYSTEM_CLASS);
    host.read_dir_names(root)
        .unwrap_or_default()
        .into_iter()
        .map(|name| root.join(name))
        .filter(|dir| {
            host.read_trimmed(&dir.join("subsysnqn"))
                .is_some_and(|found| found == nqn)
        })
        .collect()
}

/// Namespace block devices exported by subsystem `nqn`.
///
/// With native multipath the namespace sits directly under the subsystem
/// directory. Without it each controller of the subsystem carries its own
/// namespace node under `/sys/class/nvme/<ctrl>`.
pub fn namespace_devices(host: &dyn HostIo, nqn: &str) -> Vec<PathBuf> {
    let mut devices = Vec::new();
    for subsystem in subsystems_for_nqn(host, nqn) {
        let entries = host.read_dir_names(&subsystem).unwrap_or_default();
        for entry in &entries {
            if is_namespace_device(entry) {
                devices.push(Path::new("/dev").join(entry));
            } else if is_controller(entry) {
                let ctrl_dir = Path::new(CONTROLLER_CLASS).join(entry);
                for ns in host.read_dir_names(&ctrl_dir).unwrap_or_default() {
                    if is_namespace_device(&ns) {
                        devices.push(Path::new("/dev").join(ns));
                    }
                }
            }
        }
    }
    devices.sort();
    devices.dedup();
    debug!(nqn = %nqn, devices = ?devices, "NVMe namespaces for subsystem");
    devices
}

/// Controllers (`nvme0`, `nvme1`) connected to subsystem `nqn`.
pub fn controllers_for_nqn(host: &dyn HostIo, nqn: &str) -> Vec<String> {
    subsystems_for_nqn(host, nqn)
        .iter()
        .flat_map(|s| host.read_dir_names(s).unwrap_or_default())
        .filter(|name| is_controller(name))
        .collect()
}

fn is_controller(name: &str) -> bool {
    name.strip_prefix("nvme")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}
