//! Device scanner
//!
//! The kernel gives no notification when a device node shows up after a
//! login or rescan, so discovery is a bounded poll over `/dev` and `/sys`
//! paths. Every probe is a pure read through [`HostIo`]; a probe may be
//! paired with a host command (e.g. an FC rescan) by using
//! [`DeviceScanner::wait_until`] directly.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::host::HostIo;
use crate::retry::{RetryError, RetryPolicy};

/// Outcome of a single probe that did not find enough.
enum ProbeMiss {
    NotYet,
    /// Some paths, fewer than wanted
    Partial(Vec<PathBuf>),
    Failed(ConnectorError),
}

impl fmt::Display for ProbeMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMiss::NotYet => f.write_str("device not present yet"),
            ProbeMiss::Partial(paths) => write!(f, "only {} path(s) present", paths.len()),
            ProbeMiss::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Polls the host for devices under a [`RetryPolicy`].
#[derive(Clone)]
pub struct DeviceScanner {
    host: Arc<dyn HostIo>,
    policy: RetryPolicy,
}

impl fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceScanner")
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeviceScanner {
    pub fn new(host: Arc<dyn HostIo>, policy: RetryPolicy) -> Self {
        Self { host, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn host(&self) -> &Arc<dyn HostIo> {
        &self.host
    }

    /// Poll `probe` until it reports at least one path.
    ///
    /// An empty result is a miss and is retried. An error from `probe` ends
    /// the wait immediately. Exhaustion yields
    /// [`ConnectorError::DeviceNotFound`] carrying `identifier`.
    pub async fn wait_until<F, Fut>(&self, identifier: &str, probe: F) -> Result<Vec<PathBuf>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Vec<PathBuf>>>,
    {
        self.wait_until_count(identifier, 1, probe).await
    }

    /// Poll `probe` until it reports at least `wanted` paths.
    ///
    /// Finding some but fewer paths keeps the poll going. If the policy runs
    /// out after a partial find, the paths of the last probe are returned;
    /// only finding nothing at all is [`ConnectorError::DeviceNotFound`].
    pub async fn wait_until_count<F, Fut>(
        &self,
        identifier: &str,
        wanted: usize,
        mut probe: F,
    ) -> Result<Vec<PathBuf>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Vec<PathBuf>>>,
    {
        let wanted = wanted.max(1);
        let result = self
            .policy
            .run(
                "device_scan",
                |miss: &ProbeMiss| matches!(miss, ProbeMiss::NotYet | ProbeMiss::Partial(_)),
                |attempt| {
                    let fut = probe(attempt);
                    async move {
                        match fut.await {
                            Ok(paths) if paths.is_empty() => Err(ProbeMiss::NotYet),
                            Ok(paths) if paths.len() < wanted => Err(ProbeMiss::Partial(paths)),
                            Ok(paths) => Ok(paths),
                            Err(e) => Err(ProbeMiss::Failed(e)),
                        }
                    }
                },
            )
            .await;

        match result {
            Ok(paths) => {
                info!(identifier = %identifier, paths = ?paths, "Found device");
                Ok(paths)
            }
            Err(RetryError::Exhausted {
                last: ProbeMiss::Partial(paths),
                ..
            }) => {
                warn!(
                    identifier = %identifier,
                    found = paths.len(),
                    wanted,
                    "Not every path showed up, continuing with those found"
                );
                Ok(paths)
            }
            Err(RetryError::Exhausted {
                attempts, elapsed, ..
            }) => Err(ConnectorError::DeviceNotFound {
                identifier: identifier.to_string(),
                attempts,
                elapsed,
            }),
            Err(RetryError::Fatal(ProbeMiss::Failed(e))) => Err(e),
            Err(RetryError::Fatal(ProbeMiss::NotYet | ProbeMiss::Partial(_))) => {
                Err(ConnectorError::DeviceNotFound {
                    identifier: identifier.to_string(),
                    attempts: 1,
                    elapsed: Default::default(),
                })
            }
        }
    }

    /// Wait until at least one of `candidates` exists and return those that do.
    pub async fn wait_for_any(
        &self,
        identifier: &str,
        candidates: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        self.wait_for_paths(identifier, candidates, 1).await
    }

    /// Wait until `wanted` of `candidates` exist and return those that do.
    ///
    /// Paths of one volume often appear at different times (one per portal
    /// or HBA), so stopping at the first would hide the others from
    /// multipath aggregation.
    pub async fn wait_for_paths(
        &self,
        identifier: &str,
        candidates: &[PathBuf],
        wanted: usize,
    ) -> Result<Vec<PathBuf>> {
        debug!(
            identifier = %identifier,
            candidates = candidates.len(),
            wanted,
            "Waiting for device"
        );
        self.wait_until_count(identifier, wanted, |_| {
            let found = self.present(candidates);
            async move { Ok(found) }
        })
        .await
    }

    /// Wait until at least one path matches one of the glob `patterns`.
    pub async fn wait_for_glob(&self, identifier: &str, patterns: &[String]) -> Result<Vec<PathBuf>> {
        debug!(identifier = %identifier, patterns = ?patterns, "Waiting for device");
        self.wait_until(identifier, |_| {
            let found = self.glob_all(patterns);
            async move { Ok(found) }
        })
        .await
    }

    /// Which of `candidates` exist right now.
    pub fn present(&self, candidates: &[PathBuf]) -> Vec<PathBuf> {
        candidates
            .iter()
            .filter(|p| self.host.exists(p))
            .cloned()
            .collect()
    }

    /// Union of glob matches, sorted and deduplicated.
    pub fn glob_all(&self, patterns: &[String]) -> Vec<PathBuf> {
        let found: BTreeSet<PathBuf> = patterns
            .iter()
            .flat_map(|p| self.host.glob(p))
            .collect();
        found.into_iter().collect()
    }

    /// Canonical device nodes behind `paths`, deduplicated, in input order.
    pub fn resolve(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut seen = BTreeSet::new();
        paths
            .iter()
            .filter_map(|p| self.host.canonicalize(p).ok())
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    /// Wait for every path in `paths` to disappear.
    ///
    /// Returns the paths still present once the policy is exhausted; an
    /// empty vector means removal is confirmed.
    pub async fn wait_for_removal(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        if paths.is_empty() {
            return Vec::new();
        }
        let result = self
            .policy
            .run(
                "device_removal",
                |_: &RemainingPaths| true,
                |_| {
                    let remaining = self.present(paths);
                    async move {
                        if remaining.is_empty() {
                            Ok(())
                        } else {
                            Err(RemainingPaths(remaining))
                        }
                    }
                },
            )
            .await;

        match result {
            Ok(()) => {
                debug!(paths = ?paths, "Device removal confirmed");
                Vec::new()
            }
            Err(e) => {
                let remaining = e.into_inner().0;
                warn!(remaining = ?remaining, "Devices still present after removal wait");
                remaining
            }
        }
    }
}

struct RemainingPaths(Vec<PathBuf>);

impl fmt::Display for RemainingPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "still present: {:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeHost;
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::Instant;

    fn scanner(host: Arc<FakeHost>, attempts: u32) -> DeviceScanner {
        DeviceScanner::new(
            host,
            RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1), attempts),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_present_probes_exactly_n_times() {
        let host = FakeHost::new();
        let s = scanner(host.clone(), 4);
        let target = PathBuf::from("/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.test:vol1-lun-0");

        let start = Instant::now();
        let err = s
            .wait_for_any("iqn.test:vol1 lun 0", std::slice::from_ref(&target))
            .await
            .unwrap_err();

        assert_eq!(host.probes(&target), 4);
        match err {
            ConnectorError::DeviceNotFound {
                identifier,
                attempts,
                elapsed,
            } => {
                assert_eq!(identifier, "iqn.test:vol1 lun 0");
                assert_eq!(attempts, 4);
                // 100 + 200 + 400 ms between four probes
                assert_eq!(elapsed, Duration::from_millis(700));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_present_on_kth_probe_stops_there() {
        let host = FakeHost::new();
        let link = PathBuf::from("/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.test:vol1-lun-0");
        host.add_device("/dev/sdb");
        host.add_link_on_probe(&link, "/dev/sdb", 3);
        let s = scanner(host.clone(), 10);

        let found = s.wait_for_any("vol1", std::slice::from_ref(&link)).await.unwrap();
        assert_eq!(found, vec![link.clone()]);
        assert_eq!(host.probes(&link), 3);
        assert_eq!(s.resolve(&found), vec![PathBuf::from("/dev/sdb")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_late_paths() {
        let host = FakeHost::new();
        let a = PathBuf::from("/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.test:vol1-lun-0");
        let b = PathBuf::from("/dev/disk/by-path/ip-10.0.0.6:3260-iscsi-iqn.test:vol1-lun-0");
        host.add_device("/dev/sdb").add_device("/dev/sdc");
        host.add_link_on_probe(&a, "/dev/sdb", 1);
        host.add_link_on_probe(&b, "/dev/sdc", 3);
        let s = scanner(host.clone(), 10);

        let found = s.wait_for_paths("vol1", &[a.clone(), b.clone()], 2).await.unwrap();
        assert_eq!(found, vec![a.clone(), b.clone()]);
        assert_eq!(host.probes(&b), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_find_returns_what_showed_up() {
        let host = FakeHost::new();
        let a = PathBuf::from("/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.test:vol1-lun-0");
        let b = PathBuf::from("/dev/disk/by-path/ip-10.0.0.6:3260-iscsi-iqn.test:vol1-lun-0");
        host.add_device("/dev/sdb").add_link(&a, "/dev/sdb");
        let s = scanner(host.clone(), 4);

        let start = Instant::now();
        let found = s.wait_for_paths("vol1", &[a.clone(), b.clone()], 2).await.unwrap();
        assert_eq!(found, vec![a]);
        assert_eq!(host.probes(&b), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_is_not_retried() {
        let s = scanner(FakeHost::new(), 10);
        let mut calls = 0;
        let err = s
            .wait_until("fc", |_| {
                calls += 1;
                async { Err(ConnectorError::NoFibreChannelHosts) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NoFibreChannelHosts));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_glob_collects_all_paths() {
        let host = FakeHost::new();
        host.add_scsi_disk(
            "/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.test:vol1-lun-0",
            "sdb",
            "naa.1",
        );
        host.add_scsi_disk(
            "/dev/disk/by-path/ip-10.0.0.6:3260-iscsi-iqn.test:vol1-lun-0",
            "sdc",
            "naa.1",
        );
        let s = scanner(host, 3);

        let found = s
            .wait_for_glob("vol1", &["/dev/disk/by-path/ip-*-iscsi-iqn.test:vol1-lun-0".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(
            s.resolve(&found),
            vec![PathBuf::from("/dev/sdb"), PathBuf::from("/dev/sdc")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_removal() {
        let host = FakeHost::new();
        host.add_device("/dev/sdb");
        let s = scanner(host.clone(), 3);

        let remaining = s.wait_for_removal(&[PathBuf::from("/dev/sdb")]).await;
        assert_eq!(remaining, vec![PathBuf::from("/dev/sdb")]);
        assert_eq!(host.probes(Path::new("/dev/sdb")), 3);

        host.remove("/dev/sdb");
        assert!(s.wait_for_removal(&[PathBuf::from("/dev/sdb")]).await.is_empty());
        assert!(s.wait_for_removal(&[]).await.is_empty());
    }
}
