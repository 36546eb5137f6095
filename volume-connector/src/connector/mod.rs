//! Volume connectors
//!
//! A [`Connector`] attaches and detaches volumes of one transport protocol.
//! The set of protocols is closed, so connectors are an enum over the
//! transport implementations rather than trait objects.
//!
//! Every transport implements [`Transport`], which only knows how to drive
//! its own tooling. The shared contract lives here:
//!
//! 1. Properties are parsed and validated first; a bad request never reaches
//!    the executor.
//! 2. Mutating operations take the host-wide lock for the volume's key and
//!    hold it until they return (including on error or cancellation).
//! 3. Every operation is timed and counted through [`crate::metrics`].

mod drbd;
mod fibre_channel;
mod iscsi;
mod local;
mod nvmeof;
mod rbd;

pub use drbd::{DrbdConnector, DrbdTarget};
pub use fibre_channel::{FibreChannelConnector, FibreChannelTarget};
pub use iscsi::{IscsiConnector, IscsiTarget};
pub use local::{LocalConnector, LocalTarget};
pub use nvmeof::{NvmeofConnector, NvmeofTarget};
pub use rbd::{RbdConnector, RbdTarget};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Span, debug, field, info, instrument, warn};

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, Result};
use crate::executor::{CommandSpec, ExecError, ExecOutput, Executor};
use crate::host::HostIo;
use crate::lock::LockManager;
use crate::metrics::OperationTimer;
use crate::multipath::MultipathManager;
use crate::properties::{ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport};
use crate::retry::RetryError;
use crate::scanner::DeviceScanner;
use crate::types::Protocol;

/// Everything a connector needs from its environment.
///
/// Cheap to clone: the executor, host and config are shared.
#[derive(Clone)]
pub struct ConnectorContext {
    pub exec: Arc<dyn Executor>,
    pub host: Arc<dyn HostIo>,
    pub config: Arc<ConnectorConfig>,
    pub locks: LockManager,
    pub scanner: DeviceScanner,
    pub multipath: MultipathManager,
}

impl std::fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl ConnectorContext {
    pub fn new(exec: Arc<dyn Executor>, host: Arc<dyn HostIo>, config: Arc<ConnectorConfig>) -> Self {
        let scanner = DeviceScanner::new(host.clone(), config.scan_policy());
        let multipath = MultipathManager::new(exec.clone(), host.clone(), scanner.clone());
        Self {
            locks: LockManager::from_config(&config),
            exec,
            host,
            config,
            scanner,
            multipath,
        }
    }

    /// Run a host command once.
    pub async fn run(&self, cmd: CommandSpec) -> Result<ExecOutput> {
        Ok(self.exec.execute(&cmd).await?)
    }

    /// Run a host command, retrying failures `is_transient` accepts under
    /// the configured command policy.
    pub async fn run_retrying<R>(&self, operation: &str, cmd: CommandSpec, is_transient: R) -> Result<ExecOutput>
    where
        R: Fn(&ExecError) -> bool,
    {
        self.config
            .command_policy()
            .run(operation, is_transient, |_| self.exec.execute(&cmd))
            .await
            .map_err(|e: RetryError<ExecError>| ConnectorError::Command(e.into_inner()))
    }

    /// Aggregation threshold for this call, `None` when multipath is off.
    pub fn multipath_threshold(&self, protocol: Protocol, props: &ConnectionProperties) -> Option<usize> {
        if props.multipath().unwrap_or(self.config.use_multipath) {
            self.config.multipath_thresholds.for_protocol(protocol)
        } else {
            None
        }
    }

    /// Paths to wait for out of `expected` before aggregating: the
    /// multipath threshold when the volume can reach it, otherwise one.
    pub fn paths_wanted(&self, protocol: Protocol, props: &ConnectionProperties, expected: usize) -> usize {
        match self.multipath_threshold(protocol, props) {
            Some(threshold) if expected >= threshold => threshold,
            _ => 1,
        }
    }
}

/// Transport-specific half of a connector.
///
/// Implementations assume the shared contract described in the module docs
/// has already been applied: the target is validated and the lock is held.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Validated, typed form of the connection properties.
    type Target: Send + Sync;

    fn protocol(&self) -> Protocol;

    fn context(&self) -> &ConnectorContext;

    fn parse(&self, props: &ConnectionProperties) -> Result<Self::Target>;

    /// Host-wide lock key; operations on targets sharing a key serialize.
    fn lock_key(&self, target: &Self::Target) -> String;

    async fn connect(&self, target: &Self::Target, props: &ConnectionProperties) -> Result<DeviceInfo>;

    async fn disconnect(
        &self,
        target: &Self::Target,
        device_info: Option<&DeviceInfo>,
        options: &DisconnectOptions,
    ) -> Result<DisconnectReport>;

    /// Re-read the size of an attached volume; returns the new size in bytes.
    async fn extend_volume(&self, target: &Self::Target) -> Result<u64>;

    /// Non-mutating lookup of the devices currently present.
    async fn get_volume_paths(
        &self,
        target: &Self::Target,
        props: &ConnectionProperties,
    ) -> Result<Vec<PathBuf>>;
}

/// A connector for one protocol.
#[derive(Debug)]
pub enum Connector {
    Iscsi(IscsiConnector),
    /// Native FC and FCoE share sysfs mechanics
    FibreChannel(FibreChannelConnector),
    Nvmeof(NvmeofConnector),
    Rbd(RbdConnector),
    Local(LocalConnector),
    Drbd(DrbdConnector),
}

macro_rules! dispatch {
    ($self:ident, $t:ident => $body:expr) => {
        match $self {
            Connector::Iscsi($t) => $body,
            Connector::FibreChannel($t) => $body,
            Connector::Nvmeof($t) => $body,
            Connector::Rbd($t) => $body,
            Connector::Local($t) => $body,
            Connector::Drbd($t) => $body,
        }
    };
}

impl Connector {
    pub fn protocol(&self) -> Protocol {
        dispatch!(self, t => t.protocol())
    }

    /// Validate `props` for this protocol without touching the host.
    pub fn validate(&self, props: &ConnectionProperties) -> Result<()> {
        dispatch!(self, t => t.parse(props).map(|_| ()))
    }

    /// Lock key `props` maps to.
    pub fn lock_key(&self, props: &ConnectionProperties) -> Result<String> {
        dispatch!(self, t => t.parse(props).map(|target| t.lock_key(&target)))
    }

    /// Attach the volume and wait for its device.
    ///
    /// Calling it again for an attached volume returns the same device.
    pub async fn connect(&self, props: &ConnectionProperties) -> Result<DeviceInfo> {
        dispatch!(self, t => connect(t, props).await)
    }

    /// Detach the volume. Safe on volumes that were never (fully) attached.
    pub async fn disconnect(
        &self,
        props: &ConnectionProperties,
        device_info: Option<&DeviceInfo>,
        options: &DisconnectOptions,
    ) -> Result<DisconnectReport> {
        dispatch!(self, t => disconnect(t, props, device_info, options).await)
    }

    /// Pick up a size change of an attached volume.
    pub async fn extend_volume(&self, props: &ConnectionProperties) -> Result<u64> {
        dispatch!(self, t => extend_volume(t, props).await)
    }

    /// Device paths of the volume currently present on the host.
    pub async fn get_volume_paths(&self, props: &ConnectionProperties) -> Result<Vec<PathBuf>> {
        dispatch!(self, t => get_volume_paths(t, props).await)
    }
}

/// Reject properties declaring a different protocol than the connector's.
fn check_declared_protocol(expected: Protocol, props: &ConnectionProperties) -> Result<()> {
    match props.protocol()? {
        Some(declared) if !same_family(declared, expected) => Err(ConnectorError::invalid(
            expected,
            format!("properties are for {}", declared),
        )),
        _ => Ok(()),
    }
}

fn same_family(a: Protocol, b: Protocol) -> bool {
    a == b
        || matches!(
            (a, b),
            (Protocol::FibreChannel, Protocol::Fcoe) | (Protocol::Fcoe, Protocol::FibreChannel)
        )
}

fn validated<T: Transport>(t: &T, props: &ConnectionProperties) -> Result<T::Target> {
    check_declared_protocol(t.protocol(), props)?;
    t.parse(props)
}

#[instrument(skip_all, fields(protocol = %t.protocol(), key = field::Empty))]
async fn connect<T: Transport>(t: &T, props: &ConnectionProperties) -> Result<DeviceInfo> {
    let timer = OperationTimer::new("connect", t.protocol());
    let result = connect_locked(t, props).await;
    timer.finish(&result);
    result
}

async fn connect_locked<T: Transport>(t: &T, props: &ConnectionProperties) -> Result<DeviceInfo> {
    let target = validated(t, props)?;
    let key = t.lock_key(&target);
    Span::current().record("key", key.as_str());

    let _lock = t.context().locks.acquire(&key).await?;
    let info = t.connect(&target, props).await?;
    debug!(path = %info.path.display(), "Volume connected");
    Ok(info.for_request(props))
}

#[instrument(skip_all, fields(protocol = %t.protocol(), key = field::Empty))]
async fn disconnect<T: Transport>(
    t: &T,
    props: &ConnectionProperties,
    device_info: Option<&DeviceInfo>,
    options: &DisconnectOptions,
) -> Result<DisconnectReport> {
    let timer = OperationTimer::new("disconnect", t.protocol());
    let result = disconnect_locked(t, props, device_info, options).await;
    timer.finish(&result);
    result
}

async fn disconnect_locked<T: Transport>(
    t: &T,
    props: &ConnectionProperties,
    device_info: Option<&DeviceInfo>,
    options: &DisconnectOptions,
) -> Result<DisconnectReport> {
    let target = validated(t, props)?;
    let key = t.lock_key(&target);
    Span::current().record("key", key.as_str());

    let _lock = t.context().locks.acquire(&key).await?;
    let report = t.disconnect(&target, device_info, options).await?;
    for warning in &report.warnings {
        warn!(warning = %warning, "Disconnect completed with warning");
    }
    Ok(report)
}

#[instrument(skip_all, fields(protocol = %t.protocol(), key = field::Empty))]
async fn extend_volume<T: Transport>(t: &T, props: &ConnectionProperties) -> Result<u64> {
    let timer = OperationTimer::new("extend_volume", t.protocol());
    let result = extend_locked(t, props).await;
    timer.finish(&result);
    result
}

async fn extend_locked<T: Transport>(t: &T, props: &ConnectionProperties) -> Result<u64> {
    let target = validated(t, props)?;
    let key = t.lock_key(&target);
    Span::current().record("key", key.as_str());

    let _lock = t.context().locks.acquire(&key).await?;
    t.extend_volume(&target).await
}

async fn get_volume_paths<T: Transport>(t: &T, props: &ConnectionProperties) -> Result<Vec<PathBuf>> {
    let target = validated(t, props)?;
    t.get_volume_paths(&target, props).await
}

/// Canonical single-path devices behind `paths`, or
/// [`ConnectorError::VolumePathsNotFound`] when none are present.
pub(crate) fn present_devices(ctx: &ConnectorContext, identifier: &str, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let devices = ctx.scanner.resolve(&ctx.scanner.present(paths));
    if devices.is_empty() {
        return Err(ConnectorError::VolumePathsNotFound(identifier.to_string()));
    }
    Ok(devices)
}

/// Tear down SCSI-backed devices: multipath maps first, then single paths,
/// then wait for all of them to disappear.
pub(crate) async fn remove_scsi_devices(
    ctx: &ConnectorContext,
    devices: &[PathBuf],
    options: &DisconnectOptions,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>, Vec<String>)> {
    let mut warnings = Vec::new();
    let mut maps: Vec<PathBuf> = Vec::new();

    for device in devices {
        let wwn = crate::platform::scsi::wwn(ctx.exec.as_ref(), ctx.host.as_ref(), device).await;
        if let Some(map) = ctx.multipath.find_map(device, wwn.as_deref())
            && !maps.contains(&map)
        {
            maps.push(map);
        }
    }

    for map in &maps {
        if let Err(e) = ctx.multipath.flush(map).await {
            if !options.force {
                return Err(e);
            }
            warn!(map = %map.display(), error = %e, "Multipath flush failed, continuing");
            warnings.push(format!("flush of {} failed: {}", map.display(), e));
        }
    }

    for device in devices {
        match crate::platform::scsi::remove_device(ctx.exec.as_ref(), ctx.host.as_ref(), device, options.force)
            .await
        {
            Ok(w) => warnings.extend(w),
            Err(e) if options.force || options.ignore_errors => {
                warn!(device = %device.display(), error = %e, "Device removal failed, continuing");
                warnings.push(format!("removal of {} failed: {}", device.display(), e));
            }
            Err(e) => return Err(e),
        }
    }

    let mut all: Vec<PathBuf> = maps;
    all.extend(devices.iter().cloned());
    let remaining = ctx.scanner.wait_for_removal(&all).await;
    let removed = all.into_iter().filter(|p| !remaining.contains(p)).collect();
    Ok((removed, remaining, warnings))
}

/// Rescan SCSI `devices` after a resize, grow the map above them if any,
/// and return the new size in bytes.
pub(crate) async fn extend_scsi_devices(ctx: &ConnectorContext, devices: &[PathBuf]) -> Result<u64> {
    let Some(first) = devices.first() else {
        return Err(ConnectorError::VolumePathsNotFound("no devices to extend".to_string()));
    };
    for device in devices {
        crate::platform::scsi::rescan(ctx.exec.as_ref(), device).await?;
    }

    let wwn = crate::platform::scsi::wwn(ctx.exec.as_ref(), ctx.host.as_ref(), first).await;
    let sized = match ctx.multipath.find_map(first, wwn.as_deref()) {
        Some(map) => {
            let id = wwn.unwrap_or_else(|| crate::host::device_name(&map));
            ctx.multipath.resize(&id).await?;
            map
        }
        None => first.clone(),
    };
    let size = crate::platform::scsi::size_bytes(ctx.exec.as_ref(), &sized).await?;
    info!(device = %sized.display(), size, "Volume extended");
    Ok(size)
}

/// The existing multipath map over `devices` when multipath applies to this
/// call, else `devices` unchanged. Never creates a map.
pub(crate) async fn preferred_paths(
    ctx: &ConnectorContext,
    protocol: Protocol,
    props: &ConnectionProperties,
    devices: Vec<PathBuf>,
) -> Vec<PathBuf> {
    let Some(threshold) = ctx.multipath_threshold(protocol, props) else {
        return devices;
    };
    let Some(first) = devices.first() else {
        return devices;
    };
    if devices.len() < threshold {
        return devices;
    }
    let wwn = crate::platform::scsi::wwn(ctx.exec.as_ref(), ctx.host.as_ref(), first).await;
    match ctx.multipath.find_map(first, wwn.as_deref()) {
        Some(map) => vec![map],
        None => devices,
    }
}

/// Single-path devices plus the map above them, as a [`DeviceInfo`].
pub(crate) async fn describe(
    ctx: &ConnectorContext,
    protocol: Protocol,
    props: &ConnectionProperties,
    devices: &[PathBuf],
) -> Result<DeviceInfo> {
    let threshold = ctx.multipath_threshold(protocol, props);
    let agg = ctx.multipath.aggregate(devices, threshold).await?;
    Ok(DeviceInfo {
        multipath_id: agg.multipath_id,
        scsi_wwn: agg.wwn,
        paths: agg.members,
        ..DeviceInfo::new(agg.path)
    })
}
