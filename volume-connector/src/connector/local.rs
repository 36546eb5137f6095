//! Local block device connector
//!
//! The device is already on the host; connect only checks it is there.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use super::{ConnectorContext, Transport, present_devices};
use crate::error::{ConnectorError, Result};
use crate::platform::scsi;
use crate::properties::{ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport};
use crate::types::Protocol;

/// Validated local connection properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub device_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawLocalProperties {
    #[serde(alias = "path")]
    device_path: PathBuf,
}

/// Local transport.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    ctx: ConnectorContext,
}

impl LocalConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Transport for LocalConnector {
    type Target = LocalTarget;

    fn protocol(&self) -> Protocol {
        Protocol::Local
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn parse(&self, props: &ConnectionProperties) -> Result<LocalTarget> {
        let raw: RawLocalProperties = props.parse(Protocol::Local)?;
        if !raw.device_path.is_absolute() {
            return Err(ConnectorError::invalid(
                Protocol::Local,
                format!("device_path '{}' is not absolute", raw.device_path.display()),
            ));
        }
        Ok(LocalTarget {
            device_path: raw.device_path,
        })
    }

    fn lock_key(&self, target: &LocalTarget) -> String {
        format!("local:{}", target.device_path.display())
    }

    async fn connect(&self, target: &LocalTarget, _props: &ConnectionProperties) -> Result<DeviceInfo> {
        let identifier = target.device_path.display().to_string();
        present_devices(&self.ctx, &identifier, std::slice::from_ref(&target.device_path))?;
        Ok(DeviceInfo::new(target.device_path.clone()))
    }

    async fn disconnect(
        &self,
        _target: &LocalTarget,
        _device_info: Option<&DeviceInfo>,
        _options: &DisconnectOptions,
    ) -> Result<DisconnectReport> {
        Ok(DisconnectReport::nothing_attached())
    }

    async fn extend_volume(&self, target: &LocalTarget) -> Result<u64> {
        let identifier = target.device_path.display().to_string();
        let devices = present_devices(&self.ctx, &identifier, std::slice::from_ref(&target.device_path))?;
        scsi::size_bytes(self.ctx.exec.as_ref(), &devices[0]).await
    }

    async fn get_volume_paths(
        &self,
        target: &LocalTarget,
        _props: &ConnectionProperties,
    ) -> Result<Vec<PathBuf>> {
        Ok(self.ctx.scanner.present(std::slice::from_ref(&target.device_path)))
    }
}
