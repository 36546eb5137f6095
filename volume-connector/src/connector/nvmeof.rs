//! NVMe over Fabrics connector (`nvme-cli`)
//!
//! The subsystem NQN identifies the volume. Connect issues `nvme connect`
//! once per portal and waits for the subsystem's namespace block devices.
//! With native NVMe multipath the kernel merges the controller paths into a
//! single `nvmeXnY` node and dm-multipath is never layered on top.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{ConnectorContext, Transport, describe, present_devices, preferred_paths};
use crate::error::{ConnectorError, Result};
use crate::executor::CommandSpec;
use crate::platform::{nvme, scsi};
use crate::properties::{ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport};
use crate::types::{Endpoint, Protocol, is_nvme_qualified_name};

const DEFAULT_TRANSPORT: &str = "tcp";
const TRANSPORTS: &[&str] = &["tcp", "rdma", "fc"];

/// One controller address of the subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmePortal {
    pub address: Endpoint,
    pub transport: String,
}

/// Validated NVMe-oF connection properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeofTarget {
    pub nqn: String,
    pub portals: Vec<NvmePortal>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> std::result::Result<u16, String> {
        match self {
            PortValue::Number(n) => Ok(*n),
            PortValue::Text(s) => s.parse().map_err(|_| format!("invalid port '{}'", s)),
        }
    }
}

/// `{"address": .., "port": .., "transport": ..}` or `[address, port, transport]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPortal {
    Object {
        address: String,
        #[serde(default)]
        port: Option<PortValue>,
        #[serde(default)]
        transport: Option<String>,
    },
    Triple(String, PortValue, String),
}

#[derive(Debug, Deserialize)]
struct RawNvmeofProperties {
    #[serde(alias = "target_nqn")]
    nqn: String,
    #[serde(default)]
    portals: Vec<RawPortal>,
    #[serde(default)]
    target_portal: Option<String>,
    #[serde(default)]
    target_port: Option<PortValue>,
    #[serde(default)]
    transport_type: Option<String>,
}

fn portal(
    address: &str,
    port: Option<&PortValue>,
    transport: Option<&str>,
) -> std::result::Result<NvmePortal, String> {
    let default_port = Protocol::Nvmeof.default_port().unwrap_or(4420);
    let mut endpoint = Endpoint::parse(address, default_port).map_err(|e| e.to_string())?;
    if let Some(port) = port {
        endpoint.port = port.to_port()?;
    }
    let transport = transport.unwrap_or(DEFAULT_TRANSPORT).to_lowercase();
    if !TRANSPORTS.contains(&transport.as_str()) {
        return Err(format!("unsupported NVMe transport '{}'", transport));
    }
    Ok(NvmePortal {
        address: endpoint,
        transport,
    })
}

impl RawNvmeofProperties {
    fn validate(self) -> std::result::Result<NvmeofTarget, String> {
        if !is_nvme_qualified_name(&self.nqn) {
            return Err(format!("'{}' is not an NVMe qualified name", self.nqn));
        }
        let mut portals = self
            .portals
            .iter()
            .map(|p| match p {
                RawPortal::Object {
                    address,
                    port,
                    transport,
                } => portal(address, port.as_ref(), transport.as_deref()),
                RawPortal::Triple(address, port, transport) => {
                    portal(address, Some(port), Some(transport))
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if portals.is_empty()
            && let Some(address) = self.target_portal.as_deref()
        {
            portals.push(portal(
                address,
                self.target_port.as_ref(),
                self.transport_type.as_deref(),
            )?);
        }
        if portals.is_empty() {
            return Err("missing portals".to_string());
        }
        Ok(NvmeofTarget {
            nqn: self.nqn,
            portals,
        })
    }
}

/// NVMe-oF transport.
#[derive(Debug, Clone)]
pub struct NvmeofConnector {
    ctx: ConnectorContext,
}

impl NvmeofConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    async fn connect_portal(&self, nqn: &str, portal: &NvmePortal) -> Result<()> {
        let port = portal.address.port.to_string();
        let cmd = CommandSpec::new("nvme").args([
            "connect",
            "-t",
            &portal.transport,
            "-a",
            &portal.address.host,
            "-s",
            &port,
            "-n",
            nqn,
        ]);
        match self.ctx.run(cmd).await {
            Ok(_) => {
                info!(nqn = %nqn, portal = %portal.address, "NVMe connect successful");
                Ok(())
            }
            Err(ConnectorError::Command(e)) if e.mentions("already connected") => {
                info!(nqn = %nqn, portal = %portal.address, "NVMe controller already connected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn devices(&self, target: &NvmeofTarget) -> Vec<PathBuf> {
        nvme::namespace_devices(self.ctx.host.as_ref(), &target.nqn)
    }

    fn dm_multipath(&self, props: &ConnectionProperties) -> bool {
        !nvme::native_multipath_enabled(self.ctx.host.as_ref())
            && self.ctx.multipath_threshold(Protocol::Nvmeof, props).is_some()
    }
}

#[async_trait]
impl Transport for NvmeofConnector {
    type Target = NvmeofTarget;

    fn protocol(&self) -> Protocol {
        Protocol::Nvmeof
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn parse(&self, props: &ConnectionProperties) -> Result<NvmeofTarget> {
        props
            .parse::<RawNvmeofProperties>(Protocol::Nvmeof)?
            .validate()
            .map_err(|reason| ConnectorError::invalid(Protocol::Nvmeof, reason))
    }

    fn lock_key(&self, target: &NvmeofTarget) -> String {
        format!("nvmeof:{}", target.nqn)
    }

    async fn connect(&self, target: &NvmeofTarget, props: &ConnectionProperties) -> Result<DeviceInfo> {
        let mut connected = 0;
        let mut last_error = None;
        for portal in &target.portals {
            match self.connect_portal(&target.nqn, portal).await {
                Ok(()) => connected += 1,
                Err(e) if target.portals.len() > 1 => {
                    warn!(portal = %portal.address, error = %e, "NVMe connect failed for portal (continuing with other portals)");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if connected == 0
            && let Some(e) = last_error
        {
            return Err(e);
        }

        let wanted = if self.dm_multipath(props) {
            self.ctx
                .paths_wanted(Protocol::Nvmeof, props, target.portals.len())
        } else {
            1
        };
        let devices = self
            .ctx
            .scanner
            .wait_until_count(&target.nqn, wanted, |_| {
                let found = self.devices(target);
                async move { Ok(found) }
            })
            .await?;

        if self.dm_multipath(props) {
            return describe(&self.ctx, Protocol::Nvmeof, props, &devices).await;
        }
        Ok(DeviceInfo {
            paths: devices.clone(),
            ..DeviceInfo::new(devices[0].clone())
        })
    }

    async fn disconnect(
        &self,
        target: &NvmeofTarget,
        device_info: Option<&DeviceInfo>,
        options: &DisconnectOptions,
    ) -> Result<DisconnectReport> {
        let mut devices = self.devices(target);
        if let Some(info) = device_info {
            for path in info.all_paths().into_iter().filter(|p| self.ctx.host.exists(p)) {
                if !devices.contains(&path) {
                    devices.push(path);
                }
            }
        }
        let controllers = nvme::controllers_for_nqn(self.ctx.host.as_ref(), &target.nqn);
        if devices.is_empty() && controllers.is_empty() {
            return Ok(DisconnectReport::nothing_attached());
        }

        let mut warnings = Vec::new();
        let mut maps = Vec::new();
        for device in devices.iter().filter(|d| nvme::is_namespace_device(&d.to_string_lossy())) {
            if let Some(map) = self.ctx.multipath.find_map(device, None)
                && !maps.contains(&map)
            {
                maps.push(map);
            }
        }
        for map in &maps {
            if let Err(e) = self.ctx.multipath.flush(map).await {
                if !options.force {
                    return Err(e);
                }
                warnings.push(format!("flush of {} failed: {}", map.display(), e));
            }
        }

        let cmd = CommandSpec::new("nvme").args(["disconnect", "-n", &target.nqn]);
        match self.ctx.run(cmd).await {
            Ok(_) => info!(nqn = %target.nqn, "NVMe disconnect successful"),
            Err(ConnectorError::Command(e))
                if e.mentions("not found") || e.mentions("No subsystem") =>
            {
                info!(nqn = %target.nqn, "NVMe subsystem was not connected");
            }
            Err(e) if options.force || options.ignore_errors => {
                warnings.push(format!("disconnect of {} failed: {}", target.nqn, e));
            }
            Err(e) => return Err(e),
        }

        let mut all = maps;
        all.extend(devices);
        let remaining = self.ctx.scanner.wait_for_removal(&all).await;
        let removed = all.into_iter().filter(|p| !remaining.contains(p)).collect();
        DisconnectReport::conclude(removed, remaining, warnings, options)
    }

    async fn extend_volume(&self, target: &NvmeofTarget) -> Result<u64> {
        let devices = present_devices(&self.ctx, &target.nqn, &self.devices(target))?;
        for ctrl in nvme::controllers_for_nqn(self.ctx.host.as_ref(), &target.nqn) {
            self.ctx
                .run(CommandSpec::new("nvme").args(["ns-rescan", &format!("/dev/{}", ctrl)]))
                .await?;
        }

        let sized = match self.ctx.multipath.find_map(&devices[0], None) {
            Some(map) => {
                self.ctx
                    .multipath
                    .resize(&crate::host::device_name(&map))
                    .await?;
                map
            }
            None => devices[0].clone(),
        };
        let size = scsi::size_bytes(self.ctx.exec.as_ref(), &sized).await?;
        info!(device = %sized.display(), size, "NVMe volume extended");
        Ok(size)
    }

    async fn get_volume_paths(
        &self,
        target: &NvmeofTarget,
        props: &ConnectionProperties,
    ) -> Result<Vec<PathBuf>> {
        let devices = self.devices(target);
        if !self.dm_multipath(props) {
            return Ok(devices);
        }
        Ok(preferred_paths(&self.ctx, Protocol::Nvmeof, props, devices).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connector;
    use crate::error::ErrorKind;
    use crate::properties::CleanupStatus;
    use crate::testutils::{FakeHost, TestBed};
    use serde_json::json;
    use std::sync::Arc;

    const NQN: &str = "nqn.2024-01.org.example:vol1";
    const SUBSYS: &str = "/sys/class/nvme-subsystem/nvme-subsys0";

    fn props() -> ConnectionProperties {
        ConnectionProperties::from_value(json!({
            "nqn": NQN,
            "portals": [
                {"address": "10.0.0.7", "port": 4420, "transport": "tcp"},
                ["10.0.0.8", "4420", "tcp"]
            ]
        }))
        .unwrap()
    }

    fn connector(bed: &TestBed) -> Connector {
        Connector::Nvmeof(NvmeofConnector::new(bed.context()))
    }

    fn attach_native(host: &FakeHost) {
        host.add_file("/sys/module/nvme_core/parameters/multipath", "Y\n")
            .add_file(format!("{}/subsysnqn", SUBSYS), NQN)
            .add_file(format!("{}/nvme0/state", SUBSYS), "live")
            .add_file(format!("{}/nvme1/state", SUBSYS), "live")
            .add_file(format!("{}/nvme0n1/size", SUBSYS), "2097152")
            .add_device("/dev/nvme0n1");
    }

    fn detach(host: &FakeHost) {
        host.remove(SUBSYS).remove("/dev/nvme0n1");
    }

    #[test]
    fn test_parse_portal_forms() {
        let bed = TestBed::new();
        let c = NvmeofConnector::new(bed.context());
        let target = c.parse(&props()).unwrap();
        assert_eq!(target.portals.len(), 2);
        assert_eq!(target.portals[1].address, Endpoint::new("10.0.0.8", 4420));
        assert_eq!(c.lock_key(&target), format!("nvmeof:{}", NQN));

        let single = ConnectionProperties::new()
            .with("target_nqn", NQN)
            .with("target_portal", "10.0.0.9")
            .with("transport_type", "RDMA");
        let target = c.parse(&single).unwrap();
        assert_eq!(target.portals[0].transport, "rdma");
        assert_eq!(target.portals[0].address.port, 4420);

        for bad in [
            json!({"nqn": NQN}),
            json!({"nqn": "vol1", "target_portal": "10.0.0.9"}),
            json!({"nqn": NQN, "portals": [{"address": "10.0.0.9", "transport": "udp"}]}),
        ] {
            let props = ConnectionProperties::from_value(bad).unwrap();
            assert_eq!(c.parse(&props).unwrap_err().kind(), ErrorKind::BadRequest);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_native_multipath_single_device() {
        let bed = TestBed::new();
        let host = bed.host.clone();
        bed.exec
            .fail(&["nvme", "connect", "10.0.0.8"], 1, "Failed to write to /dev/nvme-fabrics: Connection refused")
            .on(&["nvme", "connect"], move |_| attach_native(&host));

        let info = connector(&bed).connect(&props().with("multipath", true)).await.unwrap();
        assert_eq!(info.path, PathBuf::from("/dev/nvme0n1"));
        assert!(info.multipath_id.is_none());
        assert_eq!(bed.exec.count(&["nvme", "connect"]), 2);
        assert_eq!(bed.exec.count(&["multipath"]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_already_connected() {
        let bed = TestBed::new();
        attach_native(&bed.host);
        bed.exec
            .fail(&["nvme", "connect"], 114, "Failed to write to /dev/nvme-fabrics: Operation already in progress: already connected");

        let c = connector(&bed);
        let first = c.connect(&props()).await.unwrap();
        let second = c.connect(&props()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_portals_failing_is_an_error() {
        let bed = TestBed::new();
        bed.exec.fail(&["nvme", "connect"], 1, "Connection refused");
        let err = connector(&bed).connect(&props()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Command(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_repeat() {
        let bed = TestBed::new();
        attach_native(&bed.host);
        let host: Arc<FakeHost> = bed.host.clone();
        bed.exec.on(&["nvme", "disconnect"], move |_| detach(&host));

        let c = connector(&bed);
        let report = c
            .disconnect(&props(), None, &DisconnectOptions::default())
            .await
            .unwrap();
        assert_eq!(report.status, CleanupStatus::Confirmed);
        assert_eq!(report.removed, vec![PathBuf::from("/dev/nvme0n1")]);
        assert_eq!(
            bed.exec.commands(),
            vec![format!("nvme disconnect -n {}", NQN)]
        );

        let report = c
            .disconnect(&props(), None, &DisconnectOptions::default())
            .await
            .unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(bed.exec.count(&["nvme", "disconnect"]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_rescans_controllers() {
        let bed = TestBed::new();
        attach_native(&bed.host);
        bed.exec.respond(&["blockdev", "--getsize64"], "4294967296\n");

        let size = connector(&bed).extend_volume(&props()).await.unwrap();
        assert_eq!(size, 4294967296);
        assert_eq!(bed.exec.count(&["nvme", "ns-rescan"]), 2);
    }
}
