//! Connector configuration
//!
//! Built once by the embedding process and shared (behind an `Arc`) by every
//! connector the factory creates. All fields have defaults so a partial JSON
//! document is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::types::Protocol;

/// Default directory for per-volume lock files
pub const DEFAULT_LOCK_PATH: &str = "/var/lib/volume-connector/locks";

/// Minimum number of candidate paths that triggers multipath aggregation.
///
/// `None` for a protocol means its devices are never aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipathThresholds {
    pub iscsi: Option<usize>,
    pub fibre_channel: Option<usize>,
    pub nvmeof: Option<usize>,
}

impl Default for MultipathThresholds {
    fn default() -> Self {
        Self {
            iscsi: Some(2),
            fibre_channel: Some(2),
            nvmeof: Some(2),
        }
    }
}

impl MultipathThresholds {
    pub fn for_protocol(&self, protocol: Protocol) -> Option<usize> {
        match protocol {
            Protocol::Iscsi => self.iscsi,
            Protocol::FibreChannel | Protocol::Fcoe => self.fibre_channel,
            Protocol::Nvmeof => self.nvmeof,
            Protocol::Rbd | Protocol::Local | Protocol::Drbd => None,
        }
    }
}

/// Execution context shared by all connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Argument prefix for privileged commands (e.g. `["sudo"]`)
    pub root_helper: Vec<String>,
    /// Aggregate paths into dm-multipath devices when tooling is present
    pub use_multipath: bool,
    /// Device probes before giving up
    pub device_scan_attempts: u32,
    /// First wait between probes, doubled after each miss
    pub device_scan_interval_ms: u64,
    /// Upper bound for the wait between probes
    pub device_scan_max_interval_ms: u64,
    /// Optional wall-clock bound on a whole scan
    pub device_scan_deadline_ms: Option<u64>,
    /// Attempts for host commands that race kernel/driver catch-up
    pub command_retries: u32,
    /// Wait between command retries
    pub command_retry_interval_ms: u64,
    /// Per-command timeout
    pub command_timeout_secs: u64,
    /// Directory holding per-volume lock files
    pub lock_path: PathBuf,
    /// Bound on waiting for a volume lock
    pub lock_timeout_secs: u64,
    /// Poll interval while a lock is held elsewhere
    pub lock_poll_interval_ms: u64,
    pub multipath_thresholds: MultipathThresholds,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            root_helper: vec!["sudo".to_string()],
            use_multipath: false,
            device_scan_attempts: 5,
            device_scan_interval_ms: 1000,
            device_scan_max_interval_ms: 8000,
            device_scan_deadline_ms: None,
            command_retries: 3,
            command_retry_interval_ms: 2000,
            command_timeout_secs: 120,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            lock_timeout_secs: 300,
            lock_poll_interval_ms: 100,
            multipath_thresholds: MultipathThresholds::default(),
        }
    }
}

impl ConnectorConfig {
    /// Load a JSON configuration file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Policy for waiting on devices to appear or disappear.
    pub fn scan_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(self.device_scan_interval_ms),
            Duration::from_millis(self.device_scan_max_interval_ms),
            self.device_scan_attempts,
        );
        match self.device_scan_deadline_ms {
            Some(ms) => policy.with_deadline(Duration::from_millis(ms)),
            None => policy,
        }
    }

    /// Policy for host commands known to race asynchronous kernel state.
    pub fn command_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_millis(self.command_retry_interval_ms),
            self.command_retries,
        )
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
