use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tokio::net::UdpSocket;
use url::Url;
use anyhow::{Context, Result};
use shared::types::Protocol;
use crate::upnp::soap::{self, ControlPoint};

/// Remote port-mapping operations against a gateway, addressed by the
/// service's description URL as announced over SSDP.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Add or renew a mapping. Returns the external port the gateway
    /// actually assigned.
    async fn add_mapping(
        &self,
        location: &Url,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        name: &str,
        lease: Duration,
    ) -> Result<u16>;

    async fn remove_mapping(&self, location: &Url, protocol: Protocol, external_port: u16) -> Result<()>;

    async fn external_address(&self, location: &Url) -> Result<IpAddr>;
}

/// UPnP IGD client speaking SOAP over HTTP.
///
/// The description document is fetched once per location; the resolved
/// control URL is cached.
pub struct SoapClient {
    http: reqwest::Client,
    control_points: DashMap<Url, ControlPoint>,
}

impl SoapClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            control_points: DashMap::new(),
        }
    }

    async fn control_point(&self, location: &Url) -> Result<ControlPoint> {
        if let Some(cp) = self.control_points.get(location) {
            return Ok(cp.clone());
        }

        let description = self
            .http
            .get(location.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to fetch device description {location}"))?
            .text()
            .await
            .context("Failed to read device description")?;

        let cp = soap::find_control_point(&description, location)?;
        tracing::debug!("Control URL for {} is {}", location, cp.control_url);
        self.control_points.insert(location.clone(), cp.clone());
        Ok(cp)
    }

    async fn call(&self, location: &Url, action: &str, args: &[(&str, String)]) -> Result<String> {
        let cp = self.control_point(location).await?;
        let body = soap::envelope(&cp.service_type, action, args)?;
        let soap_action = soap::soap_action(&cp.service_type, action);

        let response = self
            .http
            .post(cp.control_url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("text/xml; charset=\"utf-8\""))
            .header("SOAPAction", soap_action)
            .body(body)
            .send()
            .await
            .with_context(|| format!("{action} request to {} failed", cp.control_url))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read {action} response"))?;

        if !status.is_success() {
            if let Some(fault) = soap::parse_fault(&text) {
                return Err(anyhow::Error::new(fault).context(format!("{action} rejected")));
            }
            anyhow::bail!("{action} failed with HTTP {status}");
        }
        Ok(text)
    }
}

#[async_trait]
impl ControlClient for SoapClient {
    async fn add_mapping(
        &self,
        location: &Url,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        name: &str,
        lease: Duration,
    ) -> Result<u16> {
        let cp = self.control_point(location).await?;
        let internal_client = local_address_towards(&cp.control_url).await?;
        let external_port = if external_port == 0 { internal_port } else { external_port };

        let body = self
            .call(
                location,
                "AddPortMapping",
                &[
                    ("NewRemoteHost", String::new()),
                    ("NewExternalPort", external_port.to_string()),
                    ("NewProtocol", protocol.to_string()),
                    ("NewInternalPort", internal_port.to_string()),
                    ("NewInternalClient", internal_client.to_string()),
                    ("NewEnabled", "1".to_string()),
                    ("NewPortMappingDescription", name.to_string()),
                    ("NewLeaseDuration", lease.as_secs().min(u32::MAX as u64).to_string()),
                ],
            )
            .await?;

        // IGDv2 gateways may report the port they reserved instead
        let assigned = soap::response_arg(&body, "AddPortMapping", "NewReservedPort")?
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(external_port);
        Ok(assigned)
    }

    async fn remove_mapping(&self, location: &Url, protocol: Protocol, external_port: u16) -> Result<()> {
        self.call(
            location,
            "DeletePortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn external_address(&self, location: &Url) -> Result<IpAddr> {
        let body = self.call(location, "GetExternalIPAddress", &[]).await?;
        let address = soap::response_arg(&body, "GetExternalIPAddress", "NewExternalIPAddress")?
            .context("Response has no NewExternalIPAddress")?;
        address
            .parse()
            .with_context(|| format!("Gateway returned invalid address {address:?}"))
    }
}

/// Local address the OS would use to reach the gateway; this is the
/// `NewInternalClient` the mapping forwards to.
async fn local_address_towards(url: &Url) -> Result<IpAddr> {
    let host = url.host_str().context("Control URL has no host")?;
    let port = url.port_or_known_default().unwrap_or(80);
    let remote = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {host}"))?
        .next()
        .with_context(|| format!("No address for {host}"))?;

    let bind: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind).await.context("Failed to bind probe socket")?;
    socket
        .connect(remote)
        .await
        .with_context(|| format!("No route to {remote}"))?;
    Ok(socket.local_addr()?.ip())
}
