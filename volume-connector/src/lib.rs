//! Host-side block volume attach/detach library
//!
//! Attaches remote block volumes (iSCSI, Fibre Channel/FCoE, NVMe-oF, Ceph
//! RBD, DRBD) or local devices to this host and detaches them again, on
//! behalf of an orchestrator that only knows the volume's connection
//! properties.
//!
//! This library provides:
//! - [`Connector`]s with `connect`, `disconnect`, `extend_volume` and
//!   `get_volume_paths`, built by the [`ConnectorFactory`]
//! - Device discovery with bounded retries ([`DeviceScanner`])
//! - dm-multipath aggregation ([`MultipathManager`])
//! - Host-wide per-volume locking ([`LockManager`])
//! - A privileged command executor seam ([`Executor`]) so tests run without
//!   root or real storage

pub mod config;
pub mod connector;
pub mod error;
pub mod executor;
pub mod factory;
pub mod host;
pub mod host_properties;
pub mod lock;
pub mod metrics;
pub mod multipath;
pub mod platform;
pub mod properties;
pub mod retry;
pub mod scanner;
pub mod types;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;

pub use config::ConnectorConfig;
pub use connector::{Connector, ConnectorContext, Transport};
pub use error::{ConnectorError, ErrorKind, Result};
pub use executor::{CommandSpec, ExecError, ExecOutput, Executor, ProcessExecutor};
pub use factory::ConnectorFactory;
pub use host::{HostIo, SystemHost};
pub use host_properties::{HostProperties, host_properties};
pub use lock::{LockManager, VolumeLock};
pub use multipath::MultipathManager;
pub use properties::{
    CleanupStatus, ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport,
};
pub use retry::{Backoff, RetryPolicy};
pub use scanner::DeviceScanner;
pub use types::{AccessMode, Endpoint, Protocol};
