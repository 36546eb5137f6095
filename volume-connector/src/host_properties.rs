//! Initiator-side identity of this host
//!
//! What a storage backend needs to export a volume to us. Sources that are
//! missing (no iSCSI initiator installed, no FC HBAs) are left out.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConnectorConfig;
use crate::executor::{CommandSpec, Executor};
use crate::host::HostIo;
use crate::platform::fc;

const ISCSI_INITIATOR_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
const NVME_HOSTNQN_FILE: &str = "/etc/nvme/hostnqn";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// iSCSI initiator IQN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    /// NVMe host NQN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nqn: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wwpns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wwnns: Vec<String>,
    pub multipath: bool,
}

/// `InitiatorName=iqn...` line of the open-iscsi initiator file.
fn parse_initiator_name(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .find_map(|l| l.strip_prefix("InitiatorName="))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

async fn host_nqn(exec: &dyn Executor, host: &dyn HostIo) -> Option<String> {
    if let Some(nqn) = host.read_trimmed(Path::new(NVME_HOSTNQN_FILE)).filter(|n| !n.is_empty()) {
        return Some(nqn);
    }
    match exec
        .execute(&CommandSpec::new("nvme").arg("show-hostnqn").unprivileged())
        .await
    {
        Ok(out) => Some(out.stdout.trim().to_string()).filter(|n| n.starts_with("nqn.")),
        Err(e) => {
            debug!(error = %e, "No NVMe host NQN");
            None
        }
    }
}

/// Collect the properties of this host.
pub async fn host_properties(
    exec: &dyn Executor,
    host: &dyn HostIo,
    config: &ConnectorConfig,
) -> HostProperties {
    let hostname = hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string());
    let initiator = host
        .read_to_string(Path::new(ISCSI_INITIATOR_FILE))
        .ok()
        .and_then(|c| parse_initiator_name(&c));
    let (wwpns, wwnns) = fc::online_port_names(host);

    HostProperties {
        hostname,
        initiator,
        nqn: host_nqn(exec, host).await,
        wwpns,
        wwnns,
        multipath: config.use_multipath,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeExecutor, FakeHost};

    #[test]
    fn test_parse_initiator_name() {
        let contents = "## DO NOT EDIT\n#InitiatorName=iqn.old\nInitiatorName=iqn.1993-08.org.debian:01:abc\n";
        assert_eq!(
            parse_initiator_name(contents).as_deref(),
            Some("iqn.1993-08.org.debian:01:abc")
        );
        assert_eq!(parse_initiator_name("InitiatorName=\n"), None);
    }

    #[tokio::test]
    async fn test_collects_available_sources() {
        let host = FakeHost::new();
        host.add_file(ISCSI_INITIATOR_FILE, "InitiatorName=iqn.2024-01.test:host1\n")
            .add_file("/sys/class/fc_host/host5/port_name", "0x10000090fa1b2c3d\n")
            .add_file("/sys/class/fc_host/host5/node_name", "0x20000090fa1b2c3d\n")
            .add_file("/sys/class/fc_host/host5/port_state", "Online\n");
        let exec = FakeExecutor::new();
        exec.respond(&["nvme", "show-hostnqn"], "nqn.2014-08.org.nvmexpress:uuid:1234\n");
        let config = ConnectorConfig {
            use_multipath: true,
            ..Default::default()
        };

        let props = host_properties(exec.as_ref(), host.as_ref(), &config).await;
        assert_eq!(props.initiator.as_deref(), Some("iqn.2024-01.test:host1"));
        assert_eq!(props.nqn.as_deref(), Some("nqn.2014-08.org.nvmexpress:uuid:1234"));
        assert_eq!(props.wwpns, vec!["10000090fa1b2c3d"]);
        assert!(props.multipath);
        assert!(!exec.calls()[0].privileged);
    }

    #[tokio::test]
    async fn test_missing_sources_are_omitted() {
        let host = FakeHost::new();
        let exec = FakeExecutor::new();
        exec.fail(&["nvme"], 127, "nvme: command not found");

        let props = host_properties(exec.as_ref(), host.as_ref(), &ConnectorConfig::default()).await;
        assert!(props.initiator.is_none());
        assert!(props.nqn.is_none());
        let json = serde_json::to_value(&props).unwrap();
        assert!(json.get("wwpns").is_none());
        assert!(json.get("initiator").is_none());
    }
}
