//! Fibre Channel HBA enumeration and SCSI target rescans
//!
//! HBAs are read from `/sys/class/fc_host`. A rescan writes
//! `"<channel> <target> <lun>"` into `/sys/class/scsi_host/<host>/scan`; the
//! channel and target numbers come from the `fc_transport` entries whose
//! `port_name` matches one of the volume's target WWPNs, with `-` wildcards
//! when no such entry exists yet.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::{CommandSpec, Executor};
use crate::host::HostIo;

const FC_HOST_CLASS: &str = "/sys/class/fc_host";

/// A Fibre Channel host bus adapter port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcHba {
    /// SCSI host name, e.g. `host5`
    pub host: String,
    /// Port WWPN, lowercase hex without `0x`
    pub port_name: String,
    pub node_name: String,
    pub port_state: String,
}

impl FcHba {
    pub fn is_online(&self) -> bool {
        self.port_state.eq_ignore_ascii_case("online")
    }

    /// Host number, e.g. `5` for `host5`.
    pub fn host_number(&self) -> &str {
        self.host.trim_start_matches("host")
    }
}

/// `0x500A0982...` -> `500a0982...`
pub fn normalize_wwn(wwn: &str) -> String {
    let trimmed = wwn.trim();
    trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .replace(':', "")
        .to_lowercase()
}

/// All FC HBAs present on the host.
pub fn list_hbas(host: &dyn HostIo) -> Vec<FcHba> {
    let root = Path::new(FC_HOST_CLASS);
    host.read_dir_names(root)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|name| {
            let dir = root.join(&name);
            let port_name = host.read_trimmed(&dir.join("port_name"))?;
            Some(FcHba {
                port_name: normalize_wwn(&port_name),
                node_name: host
                    .read_trimmed(&dir.join("node_name"))
                    .map(|n| normalize_wwn(&n))
                    .unwrap_or_default(),
                port_state: host
                    .read_trimmed(&dir.join("port_state"))
                    .unwrap_or_default(),
                host: name,
            })
        })
        .collect()
}

/// Online HBAs allowed by `initiator_target_map` (all online HBAs when absent).
pub fn usable_hbas(
    host: &dyn HostIo,
    initiator_target_map: Option<&HashMap<String, Vec<String>>>,
) -> Vec<FcHba> {
    list_hbas(host)
        .into_iter()
        .filter(FcHba::is_online)
        .filter(|hba| match initiator_target_map {
            Some(map) => map.keys().any(|k| normalize_wwn(k) == hba.port_name),
            None => true,
        })
        .collect()
}

/// `(channel, target)` pairs on `hba` whose remote port is one of `target_wwns`.
fn matching_targets(host: &dyn HostIo, hba: &FcHba, target_wwns: &[String]) -> Vec<(String, String)> {
    let pattern = format!("/sys/class/fc_transport/target{}:*", hba.host_number());
    let mut found = Vec::new();
    for dir in host.glob(&pattern) {
        let Some(port) = host.read_trimmed(&dir.join("port_name")) else {
            continue;
        };
        if !target_wwns.iter().any(|t| normalize_wwn(t) == normalize_wwn(&port)) {
            continue;
        }
        // target5:0:3 -> channel 0, target 3
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut parts = name.trim_start_matches("target").split(':').skip(1);
        if let (Some(channel), Some(target)) = (parts.next(), parts.next()) {
            found.push((channel.to_string(), target.to_string()));
        }
    }
    found
}

/// Rescan `hbas` for `lun` on the given target ports.
pub async fn rescan_hosts(
    exec: &dyn Executor,
    host: &dyn HostIo,
    hbas: &[FcHba],
    target_wwns: &[String],
    lun: u32,
) -> Result<()> {
    for hba in hbas {
        let mut targets = matching_targets(host, hba, target_wwns);
        if targets.is_empty() {
            debug!(hba = %hba.host, "No known target ports, wildcard scan");
            targets.push(("-".to_string(), "-".to_string()));
        }

        let scan = format!("/sys/class/scsi_host/{}/scan", hba.host);
        for (channel, target) in targets {
            let value = format!("{} {} {}", channel, target, lun);
            info!(hba = %hba.host, scan = %value, "Rescanning FC host");
            if let Err(e) = exec
                .execute(&CommandSpec::write_sysfs(scan.clone(), value))
                .await
            {
                warn!(hba = %hba.host, error = %e, "FC rescan failed");
            }
        }
    }
    Ok(())
}

/// udev by-path patterns for `lun` behind each target WWPN.
pub fn device_path_patterns(target_wwns: &[String], lun: u32) -> Vec<String> {
    target_wwns
        .iter()
        .map(|wwn| {
            format!(
                "/dev/disk/by-path/*-fc-0x{}-lun-{}",
                normalize_wwn(wwn),
                lun
            )
        })
        .collect()
}

/// Port names of online HBAs, for host property reporting.
pub fn online_port_names(host: &dyn HostIo) -> (Vec<String>, Vec<String>) {
    let hbas: Vec<FcHba> = list_hbas(host).into_iter().filter(FcHba::is_online).collect();
    let wwpns = hbas.iter().map(|h| h.port_name.clone()).collect();
    let wwnns = hbas.iter().map(|h| h.node_name.clone()).collect();
    (wwpns, wwnns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeExecutor, FakeHost};

    fn fake_fc_host() -> std::sync::Arc<FakeHost> {
        let host = FakeHost::new();
        host.add_file("/sys/class/fc_host/host5/port_name", "0x10000090fa1b2c3d\n")
            .add_file("/sys/class/fc_host/host5/node_name", "0x20000090fa1b2c3d\n")
            .add_file("/sys/class/fc_host/host5/port_state", "Online\n")
            .add_file("/sys/class/fc_host/host6/port_name", "0x10000090fa1b2c3e\n")
            .add_file("/sys/class/fc_host/host6/port_state", "Linkdown\n")
            .add_file(
                "/sys/class/fc_transport/target5:0:2/port_name",
                "0x500a0982aabbccdd\n",
            );
        host
    }

    #[test]
    fn test_normalize_wwn() {
        assert_eq!(normalize_wwn("0x500A0982AABBCCDD"), "500a0982aabbccdd");
        assert_eq!(normalize_wwn("50:0a:09:82:aa:bb:cc:dd"), "500a0982aabbccdd");
    }

    #[test]
    fn test_list_and_filter_hbas() {
        let host = fake_fc_host();
        let all = list_hbas(host.as_ref());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].port_name, "10000090fa1b2c3d");

        let usable = usable_hbas(host.as_ref(), None);
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].host_number(), "5");

        let mut map = HashMap::new();
        map.insert("0x10000090fa1b2c3e".to_string(), vec![]);
        assert!(usable_hbas(host.as_ref(), Some(&map)).is_empty());

        let (wwpns, wwnns) = online_port_names(host.as_ref());
        assert_eq!(wwpns, vec!["10000090fa1b2c3d"]);
        assert_eq!(wwnns, vec!["20000090fa1b2c3d"]);
    }

    #[tokio::test]
    async fn test_rescan_uses_known_target_or_wildcard() {
        let host = fake_fc_host();
        let exec = FakeExecutor::new();
        let hbas = usable_hbas(host.as_ref(), None);

        rescan_hosts(
            exec.as_ref(),
            host.as_ref(),
            &hbas,
            &["500a0982aabbccdd".to_string()],
            1,
        )
        .await
        .unwrap();
        rescan_hosts(
            exec.as_ref(),
            host.as_ref(),
            &hbas,
            &["500a0982ffffffff".to_string()],
            1,
        )
        .await
        .unwrap();

        let calls = exec.calls();
        assert_eq!(calls[0].rendered(), "tee -a /sys/class/scsi_host/host5/scan");
        assert_eq!(calls[0].stdin.as_deref(), Some("0 2 1"));
        assert_eq!(calls[1].stdin.as_deref(), Some("- - 1"));
    }

    #[test]
    fn test_device_path_patterns() {
        assert_eq!(
            device_path_patterns(&["0x500A0982AABBCCDD".to_string()], 3),
            vec!["/dev/disk/by-path/*-fc-0x500a0982aabbccdd-lun-3"]
        );
    }
}
