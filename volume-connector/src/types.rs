//! Type-safe wrappers for connection parameters.
//!
//! These types are parsed at the connection-properties boundary so the
//! connectors only ever see validated values.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// Protocol
// ============================================================================

/// Transport protocol of a volume.
///
/// Closed set: every value has exactly one connector variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Iscsi,
    #[serde(alias = "fc")]
    FibreChannel,
    /// Fibre Channel over Ethernet, discovered like native FC
    Fcoe,
    #[serde(alias = "nvme")]
    Nvmeof,
    #[serde(alias = "ceph")]
    Rbd,
    Local,
    Drbd,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::Iscsi,
        Protocol::FibreChannel,
        Protocol::Fcoe,
        Protocol::Nvmeof,
        Protocol::Rbd,
        Protocol::Local,
        Protocol::Drbd,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Iscsi => "iscsi",
            Protocol::FibreChannel => "fibre_channel",
            Protocol::Fcoe => "fcoe",
            Protocol::Nvmeof => "nvmeof",
            Protocol::Rbd => "rbd",
            Protocol::Local => "local",
            Protocol::Drbd => "drbd",
        }
    }

    /// Default target port, for protocols addressed by host:port.
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Protocol::Iscsi => Some(3260),
            Protocol::Nvmeof => Some(4420),
            Protocol::Rbd => Some(6789),
            _ => None,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "iscsi" => Ok(Protocol::Iscsi),
            "fibre_channel" | "fibrechannel" | "fc" => Ok(Protocol::FibreChannel),
            "fcoe" | "fibre_channel_over_ethernet" => Ok(Protocol::Fcoe),
            "nvmeof" | "nvme" => Ok(Protocol::Nvmeof),
            "rbd" | "ceph" => Ok(Protocol::Rbd),
            "local" => Ok(Protocol::Local),
            "drbd" => Ok(Protocol::Drbd),
            _ => Err(ProtocolParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown protocol name.
#[derive(Debug, Clone)]
pub struct ProtocolParseError(pub String);

impl Display for ProtocolParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol '{}'", self.0)
    }
}

impl std::error::Error for ProtocolParseError {}

// ============================================================================
// AccessMode
// ============================================================================

/// Requested access to the attached volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
}

impl AccessMode {
    pub const fn is_read_only(self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadWrite => write!(f, "rw"),
            AccessMode::ReadOnly => write!(f, "ro"),
        }
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// A storage target endpoint (host:port).
///
/// The host can be an IP address (v4 or v6) or a hostname - no resolution is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host address (IP or hostname, not resolved)
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint with explicit host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse "host:port", "[v6]:port" or a bare host.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, EndpointParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointParseError(s.to_string()));
        }

        // Handle IPv6 with brackets: [::1]:port
        if s.starts_with('[') {
            if let Some(bracket_end) = s.find(']') {
                let host = &s[1..bracket_end];
                let rest = &s[bracket_end + 1..];

                if rest.is_empty() {
                    return Ok(Endpoint::new(host, default_port));
                } else if let Some(port_str) = rest.strip_prefix(':') {
                    let port = port_str
                        .parse::<u16>()
                        .map_err(|_| EndpointParseError(s.to_string()))?;
                    return Ok(Endpoint::new(host, port));
                }
            }
            return Err(EndpointParseError(s.to_string()));
        }

        // More than one colon without brackets is a bare IPv6 address
        if s.matches(':').count() > 1 {
            return Ok(Endpoint::new(s, default_port));
        }

        if let Some(colon_idx) = s.rfind(':') {
            let potential_host = &s[..colon_idx];
            let potential_port = &s[colon_idx + 1..];

            if let Ok(port) = potential_port.parse::<u16>()
                && !potential_host.is_empty()
            {
                return Ok(Endpoint::new(potential_host, port));
            }
        }

        Ok(Endpoint::new(s, default_port))
    }

    fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// "host:port", bracketing IPv6 hosts, as iscsiadm and udev spell portals.
    pub fn to_portal_string(&self) -> String {
        if self.is_ipv6() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_portal_string())
    }
}

/// Error returned when parsing an invalid endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParseError(String);

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid endpoint '{}': expected 'host:port' or 'host'", self.0)
    }
}

impl std::error::Error for EndpointParseError {}

/// Parse a list of endpoints, each entry optionally comma-separated.
///
/// - `["10.0.0.1:3260", "10.0.0.2:3260"]` and `["10.0.0.1:3260,10.0.0.2:3260"]`
///   both give two endpoints
/// - `"[::1]:3260"` is IPv6 with port
pub fn parse_endpoints<S: AsRef<str>>(
    items: &[S],
    default_port: u16,
) -> Result<Vec<Endpoint>, EndpointParseError> {
    let mut endpoints = Vec::new();
    for item in items {
        for part in item.as_ref().split(',') {
            if part.trim().is_empty() {
                continue;
            }
            endpoints.push(Endpoint::parse(part, default_port)?);
        }
    }
    if endpoints.is_empty() {
        return Err(EndpointParseError(String::new()));
    }
    Ok(endpoints)
}

// ============================================================================
// Qualified names
// ============================================================================

/// Longest iSCSI or NVMe qualified name, in bytes
const MAX_QUALIFIED_NAME_LEN: usize = 223;

// Only the naming authority prefix is checked; targets in the wild use
// free-form names after it
static ISCSI_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(iqn|eui|naa)\.\S+$").expect("Invalid regex pattern"));

static NVME_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^nqn\.\S+$").expect("Invalid regex pattern"));

/// `iqn.`, `eui.` or `naa.` name without whitespace.
pub fn is_iscsi_name(name: &str) -> bool {
    name.len() <= MAX_QUALIFIED_NAME_LEN && ISCSI_NAME.is_match(name)
}

/// `nqn.` name without whitespace.
pub fn is_nvme_qualified_name(name: &str) -> bool {
    name.len() <= MAX_QUALIFIED_NAME_LEN && NVME_NAME.is_match(name)
}
