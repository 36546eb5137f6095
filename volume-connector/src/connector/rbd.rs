//! Ceph RBD connector (kernel `rbd` client)

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{ConnectorContext, Transport, present_devices};
use crate::error::{ConnectorError, Result};
use crate::executor::CommandSpec;
use crate::platform::scsi;
use crate::properties::{ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport};
use crate::types::Protocol;

/// Validated RBD connection properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbdTarget {
    pub pool: String,
    pub image: String,
    /// Monitor addresses, `host:port`
    pub monitors: Vec<String>,
    pub auth_username: Option<String>,
    pub cluster_name: Option<String>,
}

impl RbdTarget {
    fn image_spec(&self) -> String {
        format!("{}/{}", self.pool, self.image)
    }

    /// udev link created for a mapped image.
    fn link(&self) -> PathBuf {
        PathBuf::from(format!("/dev/rbd/{}/{}", self.pool, self.image))
    }
}

#[derive(Debug, Deserialize)]
struct RawRbdProperties {
    name: String,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    auth_username: Option<String>,
    #[serde(default)]
    cluster_name: Option<String>,
}

impl RawRbdProperties {
    fn validate(self) -> std::result::Result<RbdTarget, String> {
        let (pool, image) = match self.name.split_once('/') {
            Some((pool, image)) if !pool.is_empty() && !image.is_empty() && !image.contains('/') => {
                (pool.to_string(), image.to_string())
            }
            _ => return Err(format!("name '{}' is not 'pool/image'", self.name)),
        };
        if !self.ports.is_empty() && self.ports.len() != self.hosts.len() {
            return Err(format!(
                "{} hosts but {} ports",
                self.hosts.len(),
                self.ports.len()
            ));
        }
        let monitors = self
            .hosts
            .iter()
            .enumerate()
            .map(|(i, host)| match self.ports.get(i) {
                Some(port) => format!("{}:{}", host, port),
                None => host.clone(),
            })
            .collect();
        Ok(RbdTarget {
            pool,
            image,
            monitors,
            auth_username: self.auth_username,
            cluster_name: self.cluster_name,
        })
    }
}

/// Find the device of `pool/image` in `rbd showmapped --format json` output.
///
/// Newer releases print an array of mappings, older ones an object keyed by
/// mapping id.
fn mapped_device(showmapped: &str, pool: &str, image: &str) -> Result<Option<PathBuf>> {
    if showmapped.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(showmapped)?;
    let mappings: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    };
    Ok(mappings
        .into_iter()
        .find(|m| {
            m.get("pool").and_then(Value::as_str) == Some(pool)
                && m.get("name").and_then(Value::as_str) == Some(image)
        })
        .and_then(|m| m.get("device").and_then(Value::as_str))
        .map(PathBuf::from))
}

/// RBD transport.
#[derive(Debug, Clone)]
pub struct RbdConnector {
    ctx: ConnectorContext,
}

impl RbdConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    /// Common `rbd` options for the cluster and user.
    fn rbd(&self, target: &RbdTarget) -> CommandSpec {
        let mut cmd = CommandSpec::new("rbd");
        if let Some(cluster) = &target.cluster_name {
            cmd = cmd.args(["--cluster", cluster]);
        }
        if let Some(user) = &target.auth_username {
            cmd = cmd.args(["--id", user]);
        }
        if !target.monitors.is_empty() {
            cmd = cmd.args(["--mon_host", &target.monitors.join(",")]);
        }
        cmd
    }

    async fn mapped(&self, target: &RbdTarget) -> Result<Option<PathBuf>> {
        let out = self
            .ctx
            .run(self.rbd(target).args(["showmapped", "--format", "json"]))
            .await?;
        mapped_device(&out.stdout, &target.pool, &target.image)
    }
}

#[async_trait]
impl Transport for RbdConnector {
    type Target = RbdTarget;

    fn protocol(&self) -> Protocol {
        Protocol::Rbd
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn parse(&self, props: &ConnectionProperties) -> Result<RbdTarget> {
        props
            .parse::<RawRbdProperties>(Protocol::Rbd)?
            .validate()
            .map_err(|reason| ConnectorError::invalid(Protocol::Rbd, reason))
    }

    fn lock_key(&self, target: &RbdTarget) -> String {
        format!("rbd:{}", target.image_spec())
    }

    async fn connect(&self, target: &RbdTarget, props: &ConnectionProperties) -> Result<DeviceInfo> {
        let device = match self.mapped(target).await? {
            Some(device) => {
                info!(image = %target.image_spec(), device = %device.display(), "RBD image already mapped");
                device
            }
            None => {
                let mut map = self.rbd(target).args(["map", &target.image_spec()]);
                if props.access_mode().is_read_only() {
                    map = map.arg("--read-only");
                }
                let out = self.ctx.run(map).await?;
                let printed = out.stdout.trim();
                info!(image = %target.image_spec(), device = %printed, "RBD image mapped");
                let found = self
                    .ctx
                    .scanner
                    .wait_for_any(&target.image_spec(), &[target.link()])
                    .await?;
                self.ctx
                    .host
                    .canonicalize(&found[0])
                    .unwrap_or_else(|_| found[0].clone())
            }
        };

        Ok(DeviceInfo {
            paths: vec![device],
            ..DeviceInfo::new(target.link())
        })
    }

    async fn disconnect(
        &self,
        target: &RbdTarget,
        _device_info: Option<&DeviceInfo>,
        options: &DisconnectOptions,
    ) -> Result<DisconnectReport> {
        let Some(device) = self.mapped(target).await? else {
            debug!(image = %target.image_spec(), "RBD image not mapped");
            return Ok(DisconnectReport::nothing_attached());
        };

        let mut warnings = Vec::new();
        let unmap = self
            .rbd(target)
            .args(["unmap", &device.to_string_lossy()]);
        match self.ctx.run(unmap).await {
            Ok(_) => info!(image = %target.image_spec(), device = %device.display(), "RBD image unmapped"),
            Err(ConnectorError::Command(e)) if e.mentions("not mapped") => {}
            Err(e) if options.force || options.ignore_errors => {
                warnings.push(format!("unmap of {} failed: {}", device.display(), e));
            }
            Err(e) => return Err(e),
        }

        let remaining = self.ctx.scanner.wait_for_removal(std::slice::from_ref(&device)).await;
        let removed = if remaining.is_empty() { vec![device] } else { Vec::new() };
        DisconnectReport::conclude(removed, remaining, warnings, options)
    }

    async fn extend_volume(&self, target: &RbdTarget) -> Result<u64> {
        // The kernel client picks up the new size on its own
        let devices = present_devices(&self.ctx, &target.image_spec(), &[target.link()])?;
        scsi::size_bytes(self.ctx.exec.as_ref(), &devices[0]).await
    }

    async fn get_volume_paths(
        &self,
        target: &RbdTarget,
        _props: &ConnectionProperties,
    ) -> Result<Vec<PathBuf>> {
        Ok(self.ctx.scanner.present(&[target.link()]))
    }
}
