//! Read-only view of host device state
//!
//! Discovery is done by probing `/dev` and `/sys` paths. All probes go
//! through [`HostIo`] so tests can describe a host in memory; nothing here
//! mutates the host (mutation goes through the executor).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Platform I/O surface used for device discovery.
pub trait HostIo: Send + Sync {
    /// Whether `path` exists (following symlinks).
    fn exists(&self, path: &Path) -> bool;

    /// Expand a glob pattern. Unreadable entries are skipped.
    fn glob(&self, pattern: &str) -> Vec<PathBuf>;

    /// Read a (pseudo-filesystem) file.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Resolve symlinks, e.g. `/dev/disk/by-path/...` to `/dev/sdb`.
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Names of the entries of a directory.
    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Read a file and trim surrounding whitespace, `None` if unreadable.
    fn read_trimmed(&self, path: &Path) -> Option<String> {
        self.read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// [`HostIo`] backed by the real filesystem.
#[derive(Debug, Clone, Default)]
pub struct SystemHost;

impl HostIo for SystemHost {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        match glob::glob(pattern) {
            Ok(paths) => paths.flatten().collect(),
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "Invalid glob pattern");
                Vec::new()
            }
        }
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(path)?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Kernel name of a device path: `/dev/sdb` -> `sdb`.
pub fn device_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
