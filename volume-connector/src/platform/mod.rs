//! Linux host helpers shared by connectors
//!
//! Reads go through [`HostIo`](crate::host::HostIo), writes to sysfs control
//! files and tool invocations go through the
//! [`Executor`](crate::executor::Executor).
//!
//! - [`scsi`]: WWN lookup, single-path removal, rescan and size of SCSI disks
//! - [`fc`]: Fibre Channel HBA enumeration and target rescans
//! - [`nvme`]: NVMe subsystem and namespace discovery

pub mod fc;
pub mod nvme;
pub mod scsi;
