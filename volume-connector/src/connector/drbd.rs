//! DRBD connector (`drbdadm`)
//!
//! The caller may ship the resource definition with the request; it is
//! written to a temporary file that lives for the duration of the command.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::info;

use super::{ConnectorContext, Transport, present_devices};
use crate::error::{ConnectorError, Result};
use crate::executor::CommandSpec;
use crate::platform::scsi;
use crate::properties::{ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport};
use crate::types::Protocol;

/// Validated DRBD connection properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrbdTarget {
    pub device: PathBuf,
    pub resource: String,
    /// Resource configuration text, if supplied by the caller
    pub config: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDrbdProperties {
    #[serde(alias = "device_path")]
    device: PathBuf,
    #[serde(alias = "name")]
    resource: String,
    #[serde(default)]
    config: Option<String>,
}

/// DRBD transport.
#[derive(Debug, Clone)]
pub struct DrbdConnector {
    ctx: ConnectorContext,
}

impl DrbdConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    /// Run `drbdadm <action> <resource>`, pointing it at the caller's
    /// configuration when there is one.
    async fn drbdadm(&self, target: &DrbdTarget, action: &str) -> Result<()> {
        let mut cmd = CommandSpec::new("drbdadm");
        // Keeps the file until the command has finished
        let _config_file = match &target.config {
            Some(config) => {
                let file = write_config(config)?;
                cmd = cmd.args(["-c", &file.path().to_string_lossy()]);
                Some(file)
            }
            None => None,
        };
        self.ctx.run(cmd.args([action, &target.resource])).await?;
        Ok(())
    }
}

fn write_config(config: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("drbd-")
        .suffix(".res")
        .tempfile()?;
    file.write_all(config.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[async_trait]
impl Transport for DrbdConnector {
    type Target = DrbdTarget;

    fn protocol(&self) -> Protocol {
        Protocol::Drbd
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn parse(&self, props: &ConnectionProperties) -> Result<DrbdTarget> {
        let raw: RawDrbdProperties = props.parse(Protocol::Drbd)?;
        if raw.resource.is_empty() || raw.resource.contains(char::is_whitespace) {
            return Err(ConnectorError::invalid(
                Protocol::Drbd,
                format!("invalid resource name '{}'", raw.resource),
            ));
        }
        if !raw.device.is_absolute() {
            return Err(ConnectorError::invalid(
                Protocol::Drbd,
                format!("device '{}' is not absolute", raw.device.display()),
            ));
        }
        Ok(DrbdTarget {
            device: raw.device,
            resource: raw.resource,
            config: raw.config,
        })
    }

    fn lock_key(&self, target: &DrbdTarget) -> String {
        format!("drbd:{}", target.resource)
    }

    async fn connect(&self, target: &DrbdTarget, _props: &ConnectionProperties) -> Result<DeviceInfo> {
        self.drbdadm(target, "adjust").await?;
        info!(resource = %target.resource, "DRBD resource adjusted");
        self.ctx
            .scanner
            .wait_for_any(&target.resource, std::slice::from_ref(&target.device))
            .await?;
        Ok(DeviceInfo::new(target.device.clone()))
    }

    async fn disconnect(
        &self,
        target: &DrbdTarget,
        _device_info: Option<&DeviceInfo>,
        options: &DisconnectOptions,
    ) -> Result<DisconnectReport> {
        let mut warnings = Vec::new();
        match self.drbdadm(target, "down").await {
            Ok(()) => info!(resource = %target.resource, "DRBD resource down"),
            Err(e) if options.force || options.ignore_errors => {
                warnings.push(format!("drbdadm down {} failed: {}", target.resource, e));
            }
            Err(e) => return Err(e),
        }
        DisconnectReport::conclude(Vec::new(), Vec::new(), warnings, options)
    }

    async fn extend_volume(&self, target: &DrbdTarget) -> Result<u64> {
        let devices = present_devices(&self.ctx, &target.resource, std::slice::from_ref(&target.device))?;
        self.drbdadm(target, "resize").await?;
        scsi::size_bytes(self.ctx.exec.as_ref(), &devices[0]).await
    }

    async fn get_volume_paths(
        &self,
        target: &DrbdTarget,
        _props: &ConnectionProperties,
    ) -> Result<Vec<PathBuf>> {
        Ok(self.ctx.scanner.present(std::slice::from_ref(&target.device)))
    }
}
