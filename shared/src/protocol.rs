/// UPnP service type for IP-routed WAN connections
pub const WAN_IP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// UPnP service type for PPP WAN connections (DSL routers)
pub const WAN_PPP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

/// SSDP multicast group and port
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";
pub const SSDP_PORT: u16 = 1900;

/// API path prefix
pub const API_PREFIX: &str = "/v1";
