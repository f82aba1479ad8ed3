use thiserror::Error;
use url::Url;
use xmltree::{Element, EmitterConfig, Namespace, XMLNode};
use anyhow::{Context, Result};
use shared::protocol::{WAN_IP_CONNECTION, WAN_PPP_CONNECTION};

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// UPnP error response (`<UPnPError>` inside a SOAP fault)
#[derive(Debug, Error)]
#[error("UPnP error {code}: {description}")]
pub struct SoapFault {
    pub code: u16,
    pub description: String,
}

/// Control endpoint of a WAN connection service, from a device description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPoint {
    pub control_url: Url,
    pub service_type: String,
}

fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

/// Trimmed text of a named child, `None` if missing or empty
fn child_text(element: &Element, name: &str) -> Option<String> {
    let text = element.get_child(name)?.get_text()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn prefixed(prefix: &str, name: &str) -> Element {
    let mut element = Element::new(name);
    element.prefix = Some(prefix.to_string());
    element
}

/// Build a SOAP request envelope for `action` on `service_type`
pub fn envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> Result<String> {
    let mut call = prefixed("u", action);
    let mut call_ns = Namespace::empty();
    call_ns.put("u", service_type);
    call.namespaces = Some(call_ns);
    for (name, value) in args {
        let mut arg = Element::new(name);
        if !value.is_empty() {
            arg.children.push(XMLNode::Text(value.clone()));
        }
        call.children.push(XMLNode::Element(arg));
    }

    let mut body = prefixed("s", "Body");
    body.children.push(XMLNode::Element(call));

    let mut root = prefixed("s", "Envelope");
    let mut root_ns = Namespace::empty();
    root_ns.put("s", SOAP_ENVELOPE_NS);
    root.namespaces = Some(root_ns);
    root.attributes
        .insert("s:encodingStyle".to_string(), SOAP_ENCODING.to_string());
    root.children.push(XMLNode::Element(body));

    let mut out = Vec::new();
    root.write_with_config(&mut out, EmitterConfig::new().perform_indent(false))
        .context("Failed to serialize SOAP envelope")?;
    String::from_utf8(out).context("SOAP envelope is not UTF-8")
}

/// `SOAPAction` header value
pub fn soap_action(service_type: &str, action: &str) -> String {
    format!("\"{service_type}#{action}\"")
}

/// Decode a UPnP fault from an error response body, if it carries one
pub fn parse_fault(body: &str) -> Option<SoapFault> {
    let root = Element::parse(body.as_bytes()).ok()?;
    let error = root
        .get_child("Body")?
        .get_child("Fault")?
        .get_child("detail")?
        .get_child("UPnPError")?;
    let code = child_text(error, "errorCode")?.parse().ok()?;
    let description = child_text(error, "errorDescription").unwrap_or_default();
    Some(SoapFault { code, description })
}

/// Named output argument of a successful `<action>Response`
pub fn response_arg(body: &str, action: &str, name: &str) -> Result<Option<String>> {
    let root = Element::parse(body.as_bytes()).context("Failed to parse SOAP response")?;
    let expected = format!("{action}Response");
    let response = root
        .get_child("Body")
        .and_then(|b| child_elements(b).find(|e| e.name == expected))
        .with_context(|| format!("SOAP response has no {expected}"))?;
    Ok(child_text(response, name))
}

/// Every `<service>` of a device and its embedded devices, depth first
fn collect_services<'a>(device: &'a Element, out: &mut Vec<&'a Element>) {
    if let Some(list) = device.get_child("serviceList") {
        out.extend(child_elements(list).filter(|e| e.name == "service"));
    }
    if let Some(list) = device.get_child("deviceList") {
        for embedded in child_elements(list).filter(|e| e.name == "device") {
            collect_services(embedded, out);
        }
    }
}

/// Find the WANIPConnection (or WANPPPConnection) service in a device
/// description and resolve its control URL against `URLBase` or the
/// description's own location.
pub fn find_control_point(description: &str, location: &Url) -> Result<ControlPoint> {
    let root = Element::parse(description.as_bytes())
        .with_context(|| format!("Failed to parse device description at {location}"))?;

    let base = match child_text(&root, "URLBase") {
        Some(base) => Url::parse(&base).with_context(|| format!("Invalid URLBase {base:?}"))?,
        None => location.clone(),
    };

    let device = root
        .get_child("device")
        .with_context(|| format!("Device description at {location} has no device"))?;
    let mut services = Vec::new();
    collect_services(device, &mut services);

    for wanted in [WAN_IP_CONNECTION, WAN_PPP_CONNECTION] {
        let Some(service) = services
            .iter()
            .find(|s| child_text(s, "serviceType").as_deref() == Some(wanted))
        else {
            continue;
        };
        let control = child_text(service, "controlURL")
            .with_context(|| format!("{wanted} has no controlURL"))?;
        let control_url = base
            .join(&control)
            .with_context(|| format!("Invalid controlURL {control:?}"))?;
        return Ok(ControlPoint {
            control_url,
            service_type: wanted.to_string(),
        });
    }

    anyhow::bail!("No WAN connection service in device description at {location}")
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_envelope_escapes_arguments() {
        let body = envelope(
            WAN_IP_CONNECTION,
            "AddPortMapping",
            &[
                ("NewExternalPort", "51000".to_string()),
                ("NewPortMappingDescription", "a<b>&c".to_string()),
            ],
        )
        .unwrap();
        assert!(body.contains("&lt;"));
        assert!(body.contains("&amp;"));
        assert!(body.contains("<NewExternalPort>51000</NewExternalPort>"));

        let root = Element::parse(body.as_bytes()).unwrap();
        assert_eq!(root.name, "Envelope");
        assert_eq!(root.namespace.as_deref(), Some(SOAP_ENVELOPE_NS));
        let call = root.get_child("Body").unwrap().get_child("AddPortMapping").unwrap();
        assert_eq!(call.namespace.as_deref(), Some(WAN_IP_CONNECTION));
        assert_eq!(
            child_text(call, "NewPortMappingDescription").as_deref(),
            Some("a<b>&c")
        );
        assert_eq!(
            soap_action(WAN_IP_CONNECTION, "AddPortMapping"),
            "\"urn:schemas-upnp-org:service:WANIPConnection:1#AddPortMapping\""
        );
    }

    #[test]
    fn test_response_arg() {
        let body = response("GetExternalIPAddress", "<NewExternalIPAddress>203.0.113.7</NewExternalIPAddress>");
        assert_eq!(
            response_arg(&body, "GetExternalIPAddress", "NewExternalIPAddress").unwrap().as_deref(),
            Some("203.0.113.7")
        );
        assert_eq!(response_arg(&body, "GetExternalIPAddress", "NewReservedPort").unwrap(), None);
        assert!(response_arg(&body, "AddPortMapping", "NewReservedPort").is_err());
        assert!(response_arg("<html>oops", "AddPortMapping", "NewReservedPort").is_err());
    }

    #[test]
    fn test_parse_fault() {
        let fault = parse_fault(&fault(718, "ConflictInMappingEntry")).unwrap();
        assert_eq!(fault.code, 718);
        assert_eq!(fault.description, "ConflictInMappingEntry");
        assert!(parse_fault("<html>oops</html>").is_none());
    }

    #[test]
    fn test_find_control_point_in_nested_device() {
        let location = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();
        let cp = find_control_point(ROOT_DESC, &location).unwrap();
        assert_eq!(cp.control_url.as_str(), "http://192.168.1.1:5000/ctl/IPConn");
        assert_eq!(cp.service_type, WAN_IP_CONNECTION);
    }

    #[test]
    fn test_find_control_point_prefers_url_base() {
        let desc = ROOT_DESC.replacen(
            "<device>",
            "<URLBase>http://192.168.1.254:49000/</URLBase><device>",
            1,
        );
        let location = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();
        let cp = find_control_point(&desc, &location).unwrap();
        assert_eq!(cp.control_url.as_str(), "http://192.168.1.254:49000/ctl/IPConn");
    }

    #[test]
    fn test_find_control_point_reads_cdata_and_attributes() {
        let desc = ROOT_DESC
            .replace("<controlURL>/ctl/IPConn</controlURL>", "<controlURL><![CDATA[/ctl/IPConn2]]></controlURL>")
            .replace("<service>", "<service id=\"x\"><!-- vendor -->");
        let location = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();
        let cp = find_control_point(&desc, &location).unwrap();
        assert_eq!(cp.control_url.as_str(), "http://192.168.1.1:5000/ctl/IPConn2");
    }

    #[test]
    fn test_find_control_point_ppp_fallback_and_missing() {
        let location = Url::parse("http://10.0.0.1/desc.xml").unwrap();
        let ppp = ROOT_DESC.replace("WANIPConnection", "WANPPPConnection");
        let cp = find_control_point(&ppp, &location).unwrap();
        assert_eq!(cp.service_type, WAN_PPP_CONNECTION);

        let none = ROOT_DESC.replace("WANIPConnection", "WANCommonInterfaceConfig");
        assert!(find_control_point(&none, &location).is_err());
        assert!(find_control_point("not xml", &location).is_err());
    }
}
