//! Fibre Channel and FCoE connector
//!
//! There is no login step: the fabric already presents the LUN, so connect
//! is a rescan of the usable HBAs followed by a wait for the udev by-path
//! links. FCoE differs only in how the HBAs came up, which is outside this
//! crate, so both protocols share this implementation.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{
    ConnectorContext, Transport, describe, extend_scsi_devices, present_devices, preferred_paths,
    remove_scsi_devices,
};
use crate::error::{ConnectorError, Result};
use crate::platform::fc;
use crate::properties::{ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport};
use crate::types::Protocol;

/// Validated FC connection properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibreChannelTarget {
    /// Target port WWPNs, normalized
    pub wwns: Vec<String>,
    pub lun: u32,
    /// Initiator WWPN -> target WWPNs it is zoned to
    pub initiator_target_map: Option<HashMap<String, Vec<String>>>,
}

impl FibreChannelTarget {
    fn identifier(&self) -> String {
        format!("{} lun {}", self.wwns.join(","), self.lun)
    }

    fn patterns(&self) -> Vec<String> {
        fc::device_path_patterns(&self.wwns, self.lun)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFcProperties {
    #[serde(default, alias = "target_wwns")]
    target_wwn: Option<OneOrMany>,
    #[serde(alias = "lun")]
    target_lun: u32,
    #[serde(default)]
    initiator_target_map: Option<HashMap<String, Vec<String>>>,
}

fn is_wwn(s: &str) -> bool {
    s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// FC/FCoE transport.
#[derive(Debug, Clone)]
pub struct FibreChannelConnector {
    ctx: ConnectorContext,
    protocol: Protocol,
}

impl FibreChannelConnector {
    /// `protocol` is [`Protocol::FibreChannel`] or [`Protocol::Fcoe`].
    pub fn new(ctx: ConnectorContext, protocol: Protocol) -> Self {
        Self { ctx, protocol }
    }

    fn attached_devices(&self, target: &FibreChannelTarget) -> Vec<PathBuf> {
        let scanner = &self.ctx.scanner;
        scanner.resolve(&scanner.glob_all(&target.patterns()))
    }
}

#[async_trait]
impl Transport for FibreChannelConnector {
    type Target = FibreChannelTarget;

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn parse(&self, props: &ConnectionProperties) -> Result<FibreChannelTarget> {
        let raw: RawFcProperties = props.parse(self.protocol)?;
        let wwns: Vec<String> = raw
            .target_wwn
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .map(|w| fc::normalize_wwn(w))
            .collect();
        if wwns.is_empty() {
            return Err(ConnectorError::invalid(self.protocol, "missing target_wwn"));
        }
        if let Some(bad) = wwns.iter().find(|w| !is_wwn(w)) {
            return Err(ConnectorError::invalid(
                self.protocol,
                format!("'{}' is not a WWPN", bad),
            ));
        }
        Ok(FibreChannelTarget {
            wwns,
            lun: raw.target_lun,
            initiator_target_map: raw.initiator_target_map,
        })
    }

    fn lock_key(&self, target: &FibreChannelTarget) -> String {
        let mut wwns = target.wwns.clone();
        wwns.sort();
        wwns.dedup();
        format!("fc:{}:{}", wwns.join(","), target.lun)
    }

    async fn connect(
        &self,
        target: &FibreChannelTarget,
        props: &ConnectionProperties,
    ) -> Result<DeviceInfo> {
        let hbas = fc::usable_hbas(self.ctx.host.as_ref(), target.initiator_target_map.as_ref());
        if hbas.is_empty() {
            return Err(ConnectorError::NoFibreChannelHosts);
        }
        debug!(hbas = hbas.len(), "Usable FC host adapters");

        // One path per HBA and target port at most
        let wanted = self
            .ctx
            .paths_wanted(self.protocol, props, hbas.len() * target.wwns.len());
        let patterns = target.patterns();
        let (ctx, hbas, patterns) = (&self.ctx, &hbas, &patterns);
        let found = self
            .ctx
            .scanner
            .wait_until_count(&target.identifier(), wanted, |_| async move {
                let found = ctx.scanner.glob_all(patterns);
                if found.len() < wanted {
                    fc::rescan_hosts(
                        ctx.exec.as_ref(),
                        ctx.host.as_ref(),
                        hbas,
                        &target.wwns,
                        target.lun,
                    )
                    .await?;
                }
                Ok(found)
            })
            .await?;

        let devices = self.ctx.scanner.resolve(&found);
        describe(&self.ctx, self.protocol, props, &devices).await
    }

    async fn disconnect(
        &self,
        target: &FibreChannelTarget,
        device_info: Option<&DeviceInfo>,
        options: &DisconnectOptions,
    ) -> Result<DisconnectReport> {
        let mut devices = self.attached_devices(target);
        if let Some(info) = device_info {
            for path in info.paths.iter().filter(|p| self.ctx.host.exists(p)) {
                if !devices.contains(path) {
                    devices.push(path.clone());
                }
            }
        }
        if devices.is_empty() {
            return Ok(DisconnectReport::nothing_attached());
        }

        let (removed, remaining, warnings) =
            remove_scsi_devices(&self.ctx, &devices, options).await?;
        DisconnectReport::conclude(removed, remaining, warnings, options)
    }

    async fn extend_volume(&self, target: &FibreChannelTarget) -> Result<u64> {
        let found = self.ctx.scanner.glob_all(&target.patterns());
        let devices = present_devices(&self.ctx, &target.identifier(), &found)?;
        extend_scsi_devices(&self.ctx, &devices).await
    }

    async fn get_volume_paths(
        &self,
        target: &FibreChannelTarget,
        props: &ConnectionProperties,
    ) -> Result<Vec<PathBuf>> {
        let devices = self.attached_devices(target);
        Ok(preferred_paths(&self.ctx, self.protocol, props, devices).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connector;
    use crate::error::ErrorKind;
    use crate::properties::CleanupStatus;
    use crate::testutils::TestBed;
    use serde_json::json;

    const TARGET: &str = "500a0982aabbccdd";
    const LINK_A: &str = "/dev/disk/by-path/pci-0000:05:00.0-fc-0x500a0982aabbccdd-lun-1";
    const LINK_B: &str = "/dev/disk/by-path/pci-0000:05:00.1-fc-0x500a0982aabbccdd-lun-1";

    fn props() -> ConnectionProperties {
        ConnectionProperties::from_value(json!({
            "target_wwn": ["0x500A0982AABBCCDD"],
            "target_lun": 1
        }))
        .unwrap()
    }

    fn with_hba(bed: &TestBed) {
        bed.host
            .add_file("/sys/class/fc_host/host5/port_name", "0x10000090fa1b2c3d\n")
            .add_file("/sys/class/fc_host/host5/port_state", "Online\n");
    }

    fn connector(bed: &TestBed) -> Connector {
        Connector::FibreChannel(FibreChannelConnector::new(bed.context(), Protocol::FibreChannel))
    }

    #[test]
    fn test_parse_accepts_single_or_list() {
        let bed = TestBed::new();
        let fc = FibreChannelConnector::new(bed.context(), Protocol::Fcoe);
        let target = fc.parse(&props()).unwrap();
        assert_eq!(target.wwns, vec![TARGET]);
        assert_eq!(fc.lock_key(&target), format!("fc:{}:1", TARGET));

        let single = ConnectionProperties::new()
            .with("target_wwn", "50:0a:09:82:aa:bb:cc:dd")
            .with("lun", 1);
        assert_eq!(fc.parse(&single).unwrap(), target);

        let bad = ConnectionProperties::new().with("target_wwn", "xyz").with("target_lun", 1);
        assert_eq!(fc.parse(&bad).unwrap_err().kind(), ErrorKind::BadRequest);
        let missing = ConnectionProperties::new().with("target_lun", 1);
        assert_eq!(fc.parse(&missing).unwrap_err().kind(), ErrorKind::BadRequest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_hbas() {
        let bed = TestBed::new();
        let err = connector(&bed).connect(&props()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NoFibreChannelHosts));
        assert!(bed.exec.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rescans_until_lun_appears() {
        let bed = TestBed::new();
        with_hba(&bed);
        bed.host.add_file("/sys/block/sdc/device/wwid", "naa.600a0b80");
        let host = bed.host.clone();
        bed.exec
            .fail_times(&["tee", "/sys/class/scsi_host/host5/scan"], 1, 1, "busy")
            .on(&["tee", "/sys/class/scsi_host/host5/scan"], move |_| {
                host.add_device("/dev/sdc").add_link(LINK_A, "/dev/sdc");
            });

        let info = connector(&bed).connect(&props()).await.unwrap();
        assert_eq!(info.path, PathBuf::from("/dev/sdc"));
        assert_eq!(bed.exec.count(&["tee", "/sys/class/scsi_host/host5/scan"]), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_with_context() {
        let bed = TestBed::new();
        with_hba(&bed);
        let err = connector(&bed).connect(&props()).await.unwrap_err();
        match err {
            ConnectorError::DeviceNotFound {
                identifier,
                attempts,
                ..
            } => {
                assert!(identifier.contains(TARGET));
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_aggregates_two_paths() {
        let bed = TestBed::new();
        with_hba(&bed);
        bed.host
            .add_scsi_disk(LINK_A, "sdc", "3600a0b80")
            .add_scsi_disk(LINK_B, "sdd", "3600a0b80");
        let host = bed.host.clone();
        bed.exec.on(&["multipath", "/dev/sdc"], move |_| {
            host.add_device("/dev/dm-0")
                .add_link("/dev/disk/by-id/dm-uuid-mpath-3600a0b80", "/dev/dm-0")
                .add_link("/dev/mapper/mpatha", "/dev/dm-0");
        });
        let props = props().with("multipath", true);

        let info = connector(&bed).connect(&props).await.unwrap();
        assert_eq!(info.path, PathBuf::from("/dev/mapper/mpatha"));
        assert_eq!(info.paths.len(), 2);
        assert_eq!(info.multipath_id.as_deref(), Some("3600a0b80"));

        let paths = connector(&bed).get_volume_paths(&props).await.unwrap();
        assert_eq!(paths, vec![PathBuf::from("/dev/mapper/mpatha")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rescans_until_second_hba_path_appears() {
        let bed = TestBed::new();
        with_hba(&bed);
        bed.host
            .add_file("/sys/class/fc_host/host6/port_name", "0x10000090fa1b2c3e\n")
            .add_file("/sys/class/fc_host/host6/port_state", "Online\n")
            .add_file("/sys/block/sdc/device/wwid", "3600a0b80")
            .add_file("/sys/block/sdd/device/wwid", "3600a0b80")
            .add_device("/dev/dm-0")
            .add_link("/dev/disk/by-id/dm-uuid-mpath-3600a0b80", "/dev/dm-0")
            .add_link("/dev/mapper/mpatha", "/dev/dm-0");
        // Each rescan round brings up one more path
        let host = bed.host.clone();
        let rounds = std::sync::atomic::AtomicUsize::new(0);
        bed.exec.on(&["tee", "/sys/class/scsi_host/host5/scan"], move |_| {
            match rounds.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                0 => {
                    host.add_device("/dev/sdc").add_link(LINK_A, "/dev/sdc");
                }
                1 => {
                    host.add_device("/dev/sdd").add_link(LINK_B, "/dev/sdd");
                }
                _ => {}
            }
        });

        let info = connector(&bed)
            .connect(&props().with("multipath", true))
            .await
            .unwrap();
        assert_eq!(info.path, PathBuf::from("/dev/mapper/mpatha"));
        assert_eq!(
            info.paths,
            vec![PathBuf::from("/dev/sdc"), PathBuf::from("/dev/sdd")]
        );
        assert_eq!(bed.exec.count(&["tee", "/sys/class/scsi_host/host5/scan"]), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_flushes_map_then_removes_paths() {
        let bed = TestBed::new();
        bed.host
            .add_scsi_disk(LINK_A, "sdc", "3600a0b80")
            .add_file("/sys/block/sdc/device/delete", "")
            .add_link("/dev/disk/by-id/dm-uuid-mpath-3600a0b80", "/dev/dm-0")
            .add_device("/dev/dm-0");
        let host = bed.host.clone();
        bed.exec.on(&["multipath", "-f"], move |_| {
            host.remove("/dev/dm-0")
                .remove("/dev/disk/by-id/dm-uuid-mpath-3600a0b80");
        });
        let host = bed.host.clone();
        bed.exec.on(&["tee", "/sys/block/sdc/device/delete"], move |_| {
            host.remove("/dev/sdc").remove(LINK_A);
        });

        let report = connector(&bed)
            .disconnect(&props(), None, &DisconnectOptions::default())
            .await
            .unwrap();
        assert_eq!(report.status, CleanupStatus::Confirmed);
        let commands = bed.exec.commands();
        let flush = commands.iter().position(|c| c.starts_with("multipath -f")).unwrap();
        let delete = commands
            .iter()
            .position(|c| c.contains("/sys/block/sdc/device/delete"))
            .unwrap();
        assert!(flush < delete);

        // Nothing left: second disconnect is a no-op
        let report = connector(&bed)
            .disconnect(&props(), None, &DisconnectOptions::default())
            .await
            .unwrap();
        assert!(report.removed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_aborts_unless_forced() {
        let bed = TestBed::new();
        bed.host
            .add_scsi_disk(LINK_A, "sdc", "3600a0b80")
            .add_file("/sys/block/sdc/device/delete", "")
            .add_link("/dev/disk/by-id/dm-uuid-mpath-3600a0b80", "/dev/dm-0")
            .add_device("/dev/dm-0");
        bed.exec.fail(&["multipath", "-f"], 1, "map in use");

        let err = connector(&bed)
            .disconnect(&props(), None, &DisconnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Command(_)));
        assert_eq!(bed.exec.count(&["tee"]), 0);

        let host = bed.host.clone();
        bed.exec.on(&["tee", "/sys/block/sdc/device/delete"], move |_| {
            host.remove("/dev/sdc").remove(LINK_A).remove("/dev/dm-0");
        });
        let forced = DisconnectOptions {
            force: true,
            ..Default::default()
        };
        let report = connector(&bed)
            .disconnect(&props(), None, &forced)
            .await
            .unwrap();
        assert_eq!(report.status, CleanupStatus::ConfirmedWithWarnings);
        assert!(report.warnings[0].contains("map in use"));
    }
}
