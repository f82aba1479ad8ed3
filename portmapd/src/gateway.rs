use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no default gateway found")]
    NoGateway,
    #[error("failed to query routing table: {0}")]
    Io(#[from] std::io::Error),
    #[error("default gateway lookup is not supported on this platform")]
    Unsupported,
}

/// Default-route gateway address(es) from the local routing table
#[cfg(target_os = "linux")]
pub fn default_gateways() -> Result<Vec<IpAddr>, GatewayError> {
    let table = std::fs::read_to_string("/proc/net/route")?;
    parse_proc_net_route(&table)
}

#[cfg(target_os = "macos")]
pub fn default_gateways() -> Result<Vec<IpAddr>, GatewayError> {
    let output = std::process::Command::new("/sbin/route")
        .args(["-n", "get", "0.0.0.0"])
        .output()?;
    parse_route_get(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn default_gateways() -> Result<Vec<IpAddr>, GatewayError> {
    Err(GatewayError::Unsupported)
}

/// Parse `/proc/net/route`: whitespace-separated columns with a header row;
/// Destination, Gateway and Mask are little-endian hex.
#[cfg_attr(not(any(target_os = "linux", test)), allow(dead_code))]
fn parse_proc_net_route(table: &str) -> Result<Vec<IpAddr>, GatewayError> {
    const RTF_GATEWAY: u32 = 0x2;

    let gateways: Vec<IpAddr> = table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let destination = u32::from_str_radix(fields[1], 16).ok()?;
            let gateway = u32::from_str_radix(fields[2], 16).ok()?;
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            let mask = u32::from_str_radix(fields[7], 16).ok()?;
            if destination != 0 || mask != 0 || flags & RTF_GATEWAY == 0 || gateway == 0 {
                return None;
            }
            Some(IpAddr::V4(Ipv4Addr::from(gateway.to_le_bytes())))
        })
        .collect();

    if gateways.is_empty() {
        return Err(GatewayError::NoGateway);
    }
    Ok(gateways)
}

/// Parse `route -n get 0.0.0.0` output, which looks like:
///
/// ```text
///    route to: default
/// destination: default
///        mask: default
///     gateway: 192.168.1.1
/// ```
#[cfg_attr(not(any(target_os = "macos", test)), allow(dead_code))]
fn parse_route_get(output: &str) -> Result<Vec<IpAddr>, GatewayError> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("gateway:"), Some(addr)) => addr.parse::<IpAddr>().ok(),
                _ => None,
            }
        })
        .next()
        .map(|gw| vec![gw])
        .ok_or(GatewayError::NoGateway)
}
