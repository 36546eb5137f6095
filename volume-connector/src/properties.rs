//! Connection properties, device descriptors and disconnect results
//!
//! [`ConnectionProperties`] is the wire contract with the orchestrator: a
//! JSON object whose shape depends on the protocol. Unknown fields are
//! ignored. Each connector deserializes the fields it needs into its own
//! typed target with [`ConnectionProperties::parse`], which turns any
//! missing or mistyped field into [`ConnectorError::InvalidProperties`]
//! before the host is touched.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConnectorError, Result};
use crate::types::{AccessMode, Protocol};

/// Per-call description of one volume attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionProperties(Map<String, Value>);

impl ConnectionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ConnectorError::invalid(
                "properties",
                format!("expected a JSON object, got {}", other),
            )),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Builder-style insert, mostly for tests and callers assembling properties.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Declared protocol, if the caller included one.
    pub fn protocol(&self) -> Result<Option<Protocol>> {
        match self.get_str("protocol") {
            None => Ok(None),
            Some(name) => name
                .parse()
                .map(Some)
                .map_err(|e: crate::types::ProtocolParseError| {
                    ConnectorError::UnsupportedProtocol(e.0)
                }),
        }
    }

    /// Per-call multipath override.
    pub fn multipath(&self) -> Option<bool> {
        self.0.get("multipath").and_then(Value::as_bool)
    }

    /// Requested access mode, `rw` unless `access_mode` says `ro`.
    ///
    /// RBD maps the image read-only on the host. SCSI and NVMe transports
    /// have no initiator-side switch; the target export decides there.
    pub fn access_mode(&self) -> AccessMode {
        self.0
            .get("access_mode")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether the caller will layer encryption on the attached device.
    pub fn encrypted(&self) -> bool {
        self.0
            .get("encrypted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Deserialize into a connector's typed target.
    pub fn parse<T: DeserializeOwned>(&self, protocol: Protocol) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| ConnectorError::invalid(protocol, e.to_string()))
    }
}

impl From<Map<String, Value>> for ConnectionProperties {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device to use: the multipath map when aggregated, else a single path
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipath_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scsi_wwn: Option<String>,
    /// Single-path devices backing `path`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
}

impl DeviceInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            multipath_id: None,
            scsi_wwn: None,
            paths: Vec::new(),
            access_mode: AccessMode::default(),
            encrypted: false,
        }
    }

    /// Copy the caller-facing flags from the request.
    pub fn for_request(mut self, props: &ConnectionProperties) -> Self {
        self.access_mode = props.access_mode();
        self.encrypted = props.encrypted();
        self
    }

    /// Every device node this descriptor refers to, map first.
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut all = vec![self.path.clone()];
        all.extend(self.paths.iter().filter(|p| **p != self.path).cloned());
        all
    }
}

/// Knobs for [`crate::Connector::disconnect`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectOptions {
    /// Keep tearing down after a failed flush
    pub force: bool,
    /// Report unconfirmed cleanup instead of failing
    pub ignore_errors: bool,
}

/// How far a disconnect got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    /// All devices are gone
    Confirmed,
    /// All devices are gone, some steps failed along the way
    ConfirmedWithWarnings,
    /// Some devices are still present
    Unconfirmed,
}

/// Result of a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReport {
    pub status: CleanupStatus,
    pub removed: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl DisconnectReport {
    /// Nothing to clean up.
    pub fn nothing_attached() -> Self {
        Self {
            status: CleanupStatus::Confirmed,
            removed: Vec::new(),
            remaining: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Build the report from what the teardown observed.
    ///
    /// Devices still present are a [`ConnectorError::CleanupUnconfirmed`]
    /// unless `options.ignore_errors` is set.
    pub fn conclude(
        removed: Vec<PathBuf>,
        remaining: Vec<PathBuf>,
        warnings: Vec<String>,
        options: &DisconnectOptions,
    ) -> Result<Self> {
        let status = if !remaining.is_empty() {
            if !options.ignore_errors {
                return Err(ConnectorError::CleanupUnconfirmed { remaining });
            }
            CleanupStatus::Unconfirmed
        } else if warnings.is_empty() {
            CleanupStatus::Confirmed
        } else {
            CleanupStatus::ConfirmedWithWarnings
        };
        Ok(Self {
            status,
            removed,
            remaining,
            warnings,
        })
    }

    pub fn is_confirmed(&self) -> bool {
        self.status != CleanupStatus::Unconfirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Target {
        target_iqn: String,
        #[serde(default)]
        target_lun: u32,
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let props = ConnectionProperties::from_value(json!({
            "target_iqn": "iqn.test:vol1",
            "target_lun": 2,
            "volume_id": "abc",
            "qos_specs": {"read_iops": 100}
        }))
        .unwrap();
        let t: Target = props.parse(Protocol::Iscsi).unwrap();
        assert_eq!(t.target_iqn, "iqn.test:vol1");
        assert_eq!(t.target_lun, 2);
    }

    #[test]
    fn test_missing_or_mistyped_field_is_bad_request() {
        let props = ConnectionProperties::new().with("target_lun", 0);
        let err = props.parse::<Target>(Protocol::Iscsi).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.to_string().contains("target_iqn"));

        let props = ConnectionProperties::new()
            .with("target_iqn", "iqn.test:vol1")
            .with("target_lun", "zero");
        assert!(props.parse::<Target>(Protocol::Iscsi).is_err());

        assert!(ConnectionProperties::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_common_accessors() {
        let props = ConnectionProperties::from_json(
            r#"{"protocol": "fc", "multipath": true, "access_mode": "ro", "encrypted": true}"#,
        )
        .unwrap();
        assert_eq!(props.protocol().unwrap(), Some(Protocol::FibreChannel));
        assert_eq!(props.multipath(), Some(true));
        assert!(props.access_mode().is_read_only());
        assert!(props.encrypted());

        let props = ConnectionProperties::new();
        assert_eq!(props.protocol().unwrap(), None);
        assert_eq!(props.multipath(), None);
        assert_eq!(props.access_mode(), AccessMode::ReadWrite);

        let props = ConnectionProperties::new().with("protocol", "scaleio");
        assert_eq!(props.protocol().unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_device_info_serialization() {
        let info = DeviceInfo::new("/dev/sdb");
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"path": "/dev/sdb", "access_mode": "rw"})
        );

        let info = DeviceInfo {
            multipath_id: Some("3600a".into()),
            scsi_wwn: Some("3600a".into()),
            paths: vec!["/dev/sdb".into(), "/dev/sdc".into()],
            ..DeviceInfo::new("/dev/mapper/mpatha")
        };
        assert_eq!(info.all_paths().len(), 3);
        let back: DeviceInfo =
            serde_json::from_value(serde_json::to_value(&info).unwrap()).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_disconnect_report_conclude() {
        let opts = DisconnectOptions::default();
        let r = DisconnectReport::conclude(vec!["/dev/sdb".into()], vec![], vec![], &opts).unwrap();
        assert_eq!(r.status, CleanupStatus::Confirmed);

        let r = DisconnectReport::conclude(vec![], vec![], vec!["flush failed".into()], &opts)
            .unwrap();
        assert_eq!(r.status, CleanupStatus::ConfirmedWithWarnings);
        assert!(r.is_confirmed());

        let err = DisconnectReport::conclude(vec![], vec!["/dev/sdb".into()], vec![], &opts)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::CleanupUnconfirmed { .. }));

        let lenient = DisconnectOptions {
            ignore_errors: true,
            ..Default::default()
        };
        let r = DisconnectReport::conclude(vec![], vec!["/dev/sdb".into()], vec![], &lenient)
            .unwrap();
        assert_eq!(r.status, CleanupStatus::Unconfirmed);
        assert!(!r.is_confirmed());
    }
}
