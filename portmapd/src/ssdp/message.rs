use shared::protocol::SSDP_MULTICAST_ADDR;

/// Seconds a device may wait before answering an M-SEARCH
const MX_SECS: u32 = 2;

/// One parsed announcement. Fields are raw header values; the registry
/// validates them on ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpEvent {
    pub usn: String,
    pub st: String,
    pub location: String,
}

pub fn build_msearch(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {MX_SECS}\r\n\
         ST: {search_target}\r\n\
         \r\n"
    )
}

/// Parse an M-SEARCH response or a NOTIFY ssdp:alive datagram.
///
/// Returns `None` for anything else: M-SEARCH requests from other control
/// points, ssdp:byebye, non-2xx responses, or messages missing USN, ST/NT
/// or LOCATION.
pub fn parse_datagram(datagram: &str) -> Option<SsdpEvent> {
    let mut lines = datagram.lines();
    let start_line = lines.next()?.trim();

    let is_response = start_line.starts_with("HTTP/");
    let is_notify = start_line.starts_with("NOTIFY ");
    if is_response {
        let status = start_line.split_whitespace().nth(1)?;
        if status != "200" {
            return None;
        }
    } else if !is_notify {
        return None;
    }

    let mut usn = None;
    let mut st = None;
    let mut location = None;
    let mut nts = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match name.trim().to_ascii_uppercase().as_str() {
            "USN" => usn = Some(value.to_string()),
            "ST" if is_response => st = Some(value.to_string()),
            "NT" if is_notify => st = Some(value.to_string()),
            "LOCATION" => location = Some(value.to_string()),
            "NTS" => nts = Some(value.to_string()),
            _ => {}
        }
    }

    if is_notify && nts.as_deref() != Some("ssdp:alive") {
        return None;
    }

    Some(SsdpEvent {
        usn: usn?,
        st: st?,
        location: location?,
    })
}
