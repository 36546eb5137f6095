//! dm-multipath aggregation
//!
//! Single-path devices that share a SCSI WWN are the same backing volume.
//! When enough of them are present and multipath tooling is running, the
//! aggregated `dm` device is returned instead of any single path. Without
//! tooling the first single path is used; multipath improves availability
//! but an attach works without it.
//!
//! Teardown order matters: the map is flushed with `multipath -f` before the
//! single paths underneath it are deleted, otherwise a stale map keeps the
//! WWN busy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::{CommandSpec, Executor};
use crate::host::{HostIo, device_name};
use crate::platform::scsi;
use crate::scanner::DeviceScanner;

const MAPPER_DIR: &str = "/dev/mapper";

/// Outcome of aggregating a set of candidate paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregated {
    /// Device the caller should use
    pub path: PathBuf,
    /// Set when `path` is a multipath map
    pub multipath_id: Option<String>,
    pub wwn: Option<String>,
    /// Single-path devices backing `path`
    pub members: Vec<PathBuf>,
}

impl Aggregated {
    fn single(path: PathBuf, wwn: Option<String>) -> Self {
        Self {
            members: vec![path.clone()],
            path,
            multipath_id: None,
            wwn,
        }
    }
}

/// Finds, creates, flushes and resizes dm-multipath maps.
#[derive(Clone)]
pub struct MultipathManager {
    exec: Arc<dyn Executor>,
    host: Arc<dyn HostIo>,
    scanner: DeviceScanner,
}

impl std::fmt::Debug for MultipathManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipathManager").finish_non_exhaustive()
    }
}

impl MultipathManager {
    pub fn new(exec: Arc<dyn Executor>, host: Arc<dyn HostIo>, scanner: DeviceScanner) -> Self {
        Self {
            exec,
            host,
            scanner,
        }
    }

    /// Whether multipathd is running and answering.
    pub async fn is_available(&self) -> bool {
        let cmd = CommandSpec::new("multipathd").args(["show", "status"]);
        match self.exec.execute(&cmd).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "multipathd not available, using single paths");
                false
            }
        }
    }

    /// Existing map holding `device`, looked up by WWN then by sysfs holders.
    pub fn find_map(&self, device: &Path, wwn: Option<&str>) -> Option<PathBuf> {
        if let Some(wwn) = wwn {
            let by_id = PathBuf::from(format!("/dev/disk/by-id/dm-uuid-mpath-{}", wwn));
            if self.host.exists(&by_id) {
                let dm = self.host.canonicalize(&by_id).unwrap_or_else(|_| by_id.clone());
                return Some(self.mapper_name(&dm).unwrap_or(by_id));
            }
        }

        let holder = scsi::holders(self.host.as_ref(), device).into_iter().next()?;
        let dm = Path::new("/dev").join(&holder);
        let path = self.mapper_name(&dm).unwrap_or(dm);
        info!(
            original = %device.display(),
            multipath = %path.display(),
            "Device is multipathed, using dm device"
        );
        Some(path)
    }

    /// `/dev/mapper/<name>` entry pointing at `dm`.
    fn mapper_name(&self, dm: &Path) -> Option<PathBuf> {
        let names = self.host.read_dir_names(Path::new(MAPPER_DIR)).ok()?;
        names
            .into_iter()
            .map(|n| Path::new(MAPPER_DIR).join(n))
            .find(|p| self.host.canonicalize(p).is_ok_and(|t| t.as_path() == dm))
    }

    /// Collapse `devices` (canonical single paths) into the device to use.
    ///
    /// `threshold` is the minimum number of correlated paths that triggers
    /// aggregation; `None` disables it (protocol without multipath support
    /// or multipath not requested).
    pub async fn aggregate(&self, devices: &[PathBuf], threshold: Option<usize>) -> Result<Aggregated> {
        let Some(first) = devices.first().cloned() else {
            return Err(crate::error::ConnectorError::VolumePathsNotFound(
                "no candidate devices".to_string(),
            ));
        };
        let wwn = scsi::wwn(self.exec.as_ref(), self.host.as_ref(), &first).await;

        let mut members = Vec::with_capacity(devices.len());
        for device in devices {
            if device == &first {
                members.push(device.clone());
                continue;
            }
            let other = scsi::wwn(self.exec.as_ref(), self.host.as_ref(), device).await;
            if wwn.is_some() && other.is_some() && other != wwn {
                warn!(
                    device = %device.display(),
                    expected = ?wwn,
                    found = ?other,
                    "Path belongs to a different volume, ignoring"
                );
                continue;
            }
            members.push(device.clone());
        }

        let Some(threshold) = threshold else {
            return Ok(Aggregated::single(first, wwn));
        };
        if members.len() < threshold || !self.is_available().await {
            debug!(paths = members.len(), threshold, "Not aggregating");
            return Ok(Aggregated {
                members,
                ..Aggregated::single(first, wwn)
            });
        }

        if let Some(map) = self.find_map(&first, wwn.as_deref()) {
            return Ok(self.aggregated(map, wwn, members));
        }

        // multipathd has not picked the paths up yet; ask it to and wait
        if let Some(wwn) = wwn.as_deref() {
            let add = CommandSpec::new("multipath").args(["-a", wwn]);
            if let Err(e) = self.exec.execute(&add).await {
                debug!(error = %e, "multipath -a failed");
            }
        }
        let create = CommandSpec::new("multipath").arg(first.to_string_lossy());
        if let Err(e) = self.exec.execute(&create).await {
            debug!(error = %e, "multipath map creation failed");
        }

        let identifier = format!("multipath map for {}", first.display());
        let found = self
            .scanner
            .wait_until(&identifier, |_| {
                let map = self.find_map(&first, wwn.as_deref());
                async move { Ok(map.into_iter().collect()) }
            })
            .await;

        match found {
            Ok(mut maps) => Ok(self.aggregated(maps.remove(0), wwn, members)),
            Err(e) => {
                warn!(error = %e, device = %first.display(), "No multipath map, using single path");
                Ok(Aggregated {
                    members,
                    ..Aggregated::single(first, wwn)
                })
            }
        }
    }

    fn aggregated(&self, map: PathBuf, wwn: Option<String>, members: Vec<PathBuf>) -> Aggregated {
        let id = wwn.clone().unwrap_or_else(|| device_name(&map));
        info!(map = %map.display(), paths = members.len(), "Using multipath device");
        Aggregated {
            path: map,
            multipath_id: Some(id),
            wwn,
            members,
        }
    }

    /// Flush outstanding I/O and remove the map.
    pub async fn flush(&self, map: &Path) -> Result<()> {
        info!(map = %map.display(), "Flushing multipath map");
        let cmd = CommandSpec::new("multipath")
            .arg("-f")
            .arg(map.to_string_lossy());
        self.exec.execute(&cmd).await?;
        Ok(())
    }

    /// Grow a map after its paths were rescanned.
    pub async fn resize(&self, map_id: &str) -> Result<()> {
        let cmd = CommandSpec::new("multipathd").args(["resize", "map", map_id]);
        self.exec.execute(&cmd).await?;
        Ok(())
    }
}
