use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::protocol::{SSDP_MULTICAST_ADDR, SSDP_PORT};
use crate::config::DiscoveryConfig;
use crate::ssdp::message::{self, SsdpEvent};

/// Discovery broadcaster consumed by the registry.
///
/// `open` initializes the transport and returns the announcement stream; the
/// stream closes when the transport shuts down. Broadcasting is toggled
/// independently and both toggles are idempotent.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    async fn open(&self) -> Result<flume::Receiver<SsdpEvent>>;
    fn start_broadcast(&self);
    fn stop_broadcast(&self);
    fn rebroadcast_interval(&self) -> Duration;
}

/// SSDP control point: periodically multicasts M-SEARCH requests and
/// reports the unicast replies.
///
/// Replies arrive on the ephemeral socket the requests were sent from, so no
/// membership in the multicast group (and no bind to port 1900) is needed.
/// Unsolicited NOTIFY traffic is therefore not seen; re-broadcasting covers it.
pub struct SsdpClient {
    config: DiscoveryConfig,
    gateways: Vec<IpAddr>,
    broadcasting: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl SsdpClient {
    pub fn new(config: DiscoveryConfig, gateways: Vec<IpAddr>) -> Self {
        let (broadcasting, _) = watch::channel(false);
        Self {
            config,
            gateways,
            broadcasting,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop both socket tasks; the event stream closes afterwards
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn targets(&self) -> Result<Vec<SocketAddr>> {
        let mut targets = vec![SSDP_MULTICAST_ADDR
            .parse::<SocketAddr>()
            .context("Invalid SSDP multicast address")?];
        if self.config.unicast_gateways {
            targets.extend(
                self.gateways
                    .iter()
                    .filter(|ip| ip.is_ipv4())
                    .map(|ip| SocketAddr::new(*ip, SSDP_PORT)),
            );
        }
        Ok(targets)
    }
}

#[async_trait]
impl DiscoveryTransport for SsdpClient {
    async fn open(&self) -> Result<flume::Receiver<SsdpEvent>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind SSDP socket")?;
        socket
            .set_multicast_ttl_v4(2)
            .context("Failed to set multicast TTL")?;
        let socket = Arc::new(socket);
        let targets = self.targets()?;

        tracing::info!(
            "SSDP client bound to {}",
            socket.local_addr().context("SSDP socket has no local address")?
        );

        let (tx, rx) = flume::bounded(256);

        tokio::spawn(broadcast_loop(
            Arc::clone(&socket),
            targets,
            self.config.search_targets.clone(),
            self.config.rebroadcast_interval(),
            self.broadcasting.subscribe(),
            self.cancel.clone(),
        ));
        tokio::spawn(receive_loop(socket, tx, self.cancel.clone()));

        Ok(rx)
    }

    fn start_broadcast(&self) {
        if !self.broadcasting.send_replace(true) {
            tracing::info!("SSDP broadcast started");
        }
    }

    fn stop_broadcast(&self) {
        if self.broadcasting.send_replace(false) {
            tracing::info!("SSDP broadcast stopped");
        }
    }

    fn rebroadcast_interval(&self) -> Duration {
        self.config.rebroadcast_interval()
    }
}

async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    targets: Vec<SocketAddr>,
    search_targets: Vec<String>,
    interval: Duration,
    mut enabled: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            res = enabled.wait_for(|on| *on) => {
                if res.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }

        for st in &search_targets {
            let request = message::build_msearch(st);
            for target in &targets {
                if let Err(e) = socket.send_to(request.as_bytes(), target).await {
                    tracing::warn!("Failed to send M-SEARCH to {}: {}", target, e);
                }
            }
        }
        tracing::debug!("Sent M-SEARCH for {} target(s)", search_targets.len());

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            // Broadcast was toggled; re-check before sending again
            _ = enabled.changed() => {}
            _ = cancel.cancelled() => break,
        }
    }
}

/// Pause after a failed receive
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);
/// Consecutive failed receives before the socket is given up on
const MAX_RECV_ERRORS: u32 = 50;

/// Tracks consecutive receive failures
#[derive(Debug, Default)]
struct RecvErrors {
    consecutive: u32,
}

impl RecvErrors {
    /// Record a failure. Returns how long to pause, or `None` to give up.
    fn record(&mut self) -> Option<Duration> {
        self.consecutive += 1;
        (self.consecutive < MAX_RECV_ERRORS).then_some(RECV_ERROR_PAUSE)
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    tx: flume::Sender<SsdpEvent>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 2048];
    let mut errors = RecvErrors::default();

    loop {
        let res = tokio::select! {
            res = socket.recv_from(&mut buf) => res,
            _ = cancel.cancelled() => break,
        };
        let (len, src) = match res {
            Ok(received) => {
                errors.reset();
                received
            }
            Err(e) => {
                tracing::warn!("SSDP receive error: {}", e);
                let Some(pause) = errors.record() else {
                    tracing::error!("Giving up on SSDP socket after {} errors", MAX_RECV_ERRORS);
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(pause) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
        };

        let datagram = String::from_utf8_lossy(&buf[..len]);
        let Some(event) = message::parse_datagram(&datagram) else {
            tracing::debug!("Ignoring SSDP datagram from {}", src);
            continue;
        };

        tracing::debug!("SSDP {} at {} from {}", event.st, event.location, src);
        if tx.send_async(event).await.is_err() {
            break;
        }
    }

    tracing::info!("SSDP client shutting down");
}
