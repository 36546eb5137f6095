//! Host-wide per-volume locks
//!
//! Each lock key maps to a file under the lock directory, locked with
//! `flock(2)`. Separate opens of the same file conflict even inside one
//! process, so the same primitive serializes concurrent tasks, threads and
//! processes. Keys are independent: volumes with different keys never wait
//! on each other.
//!
//! The lock is released when the [`VolumeLock`] guard is dropped, which also
//! covers early returns and cancelled futures.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, Result};
use crate::metrics;

/// Longest readable prefix kept in a lock file name
const MAX_NAME_PREFIX: usize = 64;

/// Issues [`VolumeLock`]s from a lock directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

/// A held lock. Dropping it releases the lock.
pub struct VolumeLock {
    key: String,
    _flock: Flock<File>,
}

impl std::fmt::Debug for VolumeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeLock").field("key", &self.key).finish()
    }
}

impl VolumeLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        debug!(key = %self.key, "Released volume lock");
    }
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            poll_interval,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(
            config.lock_path.clone(),
            config.lock_timeout(),
            config.lock_poll_interval(),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`: a readable prefix plus a hash of the full key.
    pub fn lock_file(&self, key: &str) -> PathBuf {
        let readable: String = key
            .chars()
            .take(MAX_NAME_PREFIX)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir
            .join(format!("vc-{}-{}.lock", readable, &digest[..16]))
    }

    /// Take the lock without waiting. `Ok(None)` if someone else holds it.
    pub fn try_acquire(&self, key: &str) -> Result<Option<VolumeLock>> {
        let map_err = |source: io::Error| ConnectorError::Lock {
            key: key.to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(map_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_file(key))
            .map_err(map_err)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(VolumeLock {
                key: key.to_string(),
                _flock: flock,
            })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(map_err(io::Error::from(errno))),
        }
    }

    /// Block until `key` is free or the configured timeout passes.
    pub async fn acquire(&self, key: &str) -> Result<VolumeLock> {
        let start = Instant::now();
        let mut announced = false;

        loop {
            if let Some(lock) = self.try_acquire(key)? {
                let waited = start.elapsed();
                metrics::record_lock_wait(waited);
                debug!(key = %key, waited_ms = waited.as_millis() as u64, "Acquired volume lock");
                return Ok(lock);
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                return Err(ConnectorError::LockTimeout {
                    key: key.to_string(),
                    waited,
                });
            }

            if !announced {
                info!(key = %key, "Volume lock held by another operation, waiting");
                announced = true;
            }

            let remaining = self.timeout - waited;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}
