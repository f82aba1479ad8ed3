use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use url::Url;

/// A control endpoint announced over SSDP.
/// Records are keyed by `usn`; the registry keeps at most one per USN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Device description URL, used to reach the control endpoint
    pub location: Url,

    /// Service type, e.g. "urn:schemas-upnp-org:service:WANIPConnection:1"
    pub service_type: String,

    /// Unique service name of the announcing device/service instance
    pub usn: String,

    /// Time of the most recent announcement for this USN
    pub last_seen: DateTime<Utc>,
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Name as used in UPnP `NewProtocol` arguments
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a port mapping, as served by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingStatus {
    pub protocol: Protocol,
    pub internal_port: u16,

    /// Port actually assigned by the gateway; may differ from the requested one
    pub external_port: u16,

    /// Externally visible address, if the gateway has reported one
    pub external_address: Option<IpAddr>,

    pub active: bool,

    /// Lease expiry; `None` while inactive
    pub expires_at: Option<DateTime<Utc>>,
}
