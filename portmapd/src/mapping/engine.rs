use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::protocol::{WAN_IP_CONNECTION, WAN_PPP_CONNECTION};
use shared::types::{DiscoveredService, MappingStatus, Protocol};
use crate::clock::{Clock, SystemClock};
use crate::config::MappingConfig;
use crate::mapping::backoff::Backoff;
use crate::ssdp::registry::ServiceRegistry;
use crate::upnp::client::ControlClient;

/// What to map. Fixed for the lifetime of a [`Mapping`].
#[derive(Debug, Clone)]
pub struct MappingRequest {
    pub protocol: Protocol,
    pub internal_port: u16,
    /// 0 lets the control client pick
    pub external_port: u16,
    pub name: String,
    pub lifetime: Duration,
    pub renew_interval: Duration,
    pub idle_poll: Duration,
}

impl From<&MappingConfig> for MappingRequest {
    fn from(config: &MappingConfig) -> Self {
        Self {
            protocol: config.protocol,
            internal_port: config.internal_port,
            external_port: config.external_port,
            name: config.name.clone(),
            lifetime: config.lifetime(),
            renew_interval: config.renew_interval(),
            idle_poll: config.idle_poll(),
        }
    }
}

#[derive(Debug, Default)]
struct MappingState {
    /// Port the gateway actually assigned; starts as the requested one
    external_port: u16,
    /// Last address reported by the gateway, kept after expiry
    external_address: Option<IpAddr>,
    /// `None` while inactive
    expire_time: Option<DateTime<Utc>>,
    /// Last value delivered to the change channel
    notified: Option<IpAddr>,
}

impl MappingState {
    /// The address is only meaningful while the lease is held
    fn effective_address(&self) -> Option<IpAddr> {
        self.expire_time.and(self.external_address)
    }
}

struct Shared {
    request: MappingRequest,
    state: Mutex<MappingState>,
    changes: mpsc::Sender<()>,
}

impl Shared {
    fn new(request: MappingRequest) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (changes, rx) = mpsc::channel(1);
        let state = MappingState {
            external_port: request.external_port,
            ..MappingState::default()
        };
        let shared = Arc::new(Self {
            request,
            state: Mutex::new(state),
            changes,
        });
        (shared, rx)
    }

    fn is_active(&self) -> bool {
        self.state.lock().expire_time.is_some()
    }

    fn set_inactive(&self) {
        self.state.lock().expire_time = None;
        self.notify();
    }

    /// Signal the change channel if the effective external address moved
    /// since the last signal. At most one signal is pending; further changes
    /// before the consumer drains it are coalesced.
    fn notify(&self) {
        let mut state = self.state.lock();
        let current = state.effective_address();
        if state.notified == current {
            return;
        }
        state.notified = current;
        drop(state);

        match current {
            Some(addr) => tracing::info!("External address is now {}", addr),
            None => tracing::info!("External address withdrawn"),
        }
        let _ = self.changes.try_send(());
    }
}

/// A port mapping kept alive by a background task.
///
/// The task discovers control services through the registry, renews the
/// lease every `renew_interval`, backs off on failure and gives up when the
/// backoff is exhausted. [`delete`](Mapping::delete) removes the mapping and
/// stops the task; it cannot be undone.
pub struct Mapping {
    shared: Arc<Shared>,
    abort: CancellationToken,
    done: CancellationToken,
}

impl Mapping {
    /// Spawn the mapping task. The returned receiver yields a signal whenever
    /// the external address changes; re-read the state on wake.
    pub fn start(
        request: MappingRequest,
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn ControlClient>,
        backoff: Box<dyn Backoff>,
    ) -> (Self, mpsc::Receiver<()>) {
        Self::start_with_clock(request, registry, client, backoff, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        request: MappingRequest,
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn ControlClient>,
        backoff: Box<dyn Backoff>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::Receiver<()>) {
        let (shared, changes) = Shared::new(request);
        let abort = CancellationToken::new();

        let worker = Worker {
            shared: Arc::clone(&shared),
            registry,
            client,
            backoff,
            clock,
            abort: abort.clone(),
        };
        let done = CancellationToken::new();
        let finished = done.clone();
        tokio::spawn(async move {
            let _finished = finished.drop_guard();
            worker.run().await;
        });

        let mapping = Self {
            shared,
            abort,
            done,
        };
        (mapping, changes)
    }

    pub fn external_address(&self) -> Option<IpAddr> {
        self.shared.state.lock().external_address
    }

    pub fn external_port(&self) -> u16 {
        self.shared.state.lock().external_port
    }

    pub fn expire_time(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().expire_time
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn status(&self) -> MappingStatus {
        let state = self.shared.state.lock();
        MappingStatus {
            protocol: self.shared.request.protocol,
            internal_port: self.shared.request.internal_port,
            external_port: state.external_port,
            external_address: state.external_address,
            active: state.expire_time.is_some(),
            expires_at: state.expire_time,
        }
    }

    /// Ask the task to remove the mapping and stop
    pub fn delete(&self) {
        self.abort.cancel();
    }

    /// Wait for the task to stop, either after `delete` or on its own once
    /// retries are exhausted. Cancel-safe.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }
}

struct Worker {
    shared: Arc<Shared>,
    registry: Arc<ServiceRegistry>,
    client: Arc<dyn ControlClient>,
    backoff: Box<dyn Backoff>,
    clock: Arc<dyn Clock>,
    abort: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let request = self.shared.request.clone();
        let mut aborting = false;

        loop {
            if aborting && !self.shared.is_active() {
                break;
            }

            // An empty registry counts as a failed attempt
            let services = self.candidates();
            let ok = if services.is_empty() {
                tracing::debug!("No control service discovered");
                false
            } else {
                self.try_services(&services, aborting).await
            };
            if aborting {
                self.shared.set_inactive();
                break;
            }

            let delay = if ok {
                self.backoff.reset();
                request.renew_interval
            } else {
                self.expire_if_lapsed();
                match self.backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            "Failed to map {} port {}, retrying in {:?}",
                            request.protocol,
                            request.internal_port,
                            delay
                        );
                        delay
                    }
                    None => {
                        tracing::warn!(
                            "Giving up on {} port {} after repeated failures",
                            request.protocol,
                            request.internal_port
                        );
                        self.shared.set_inactive();
                        break;
                    }
                }
            };

            self.shared.notify();

            tokio::select! {
                _ = self.abort.cancelled() => {
                    aborting = true;
                    self.try_services(&services, true).await;
                    self.shared.set_inactive();
                }
                _ = self.pause(delay, services.is_empty()) => {}
            }
        }

        tracing::info!("Stopped mapping {} port {}", request.protocol, request.internal_port);
    }

    /// Sleep for `delay`. While no service is known, wake early as soon as
    /// one is discovered, checking every `idle_poll`.
    async fn pause(&self, delay: Duration, discovering: bool) {
        if !discovering {
            tokio::time::sleep(delay).await;
            return;
        }
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep((deadline - now).min(self.shared.request.idle_poll)).await;
            if !self.candidates().is_empty() {
                return;
            }
        }
    }

    /// Drop a lease the gateway can no longer be holding
    fn expire_if_lapsed(&self) {
        let now = self.clock.now();
        let lapsed = matches!(self.shared.state.lock().expire_time, Some(t) if t <= now);
        if lapsed {
            tracing::warn!(
                "Lease for {} port {} lapsed without renewal",
                self.shared.request.protocol,
                self.shared.request.internal_port
            );
            self.shared.set_inactive();
        }
    }

    fn candidates(&self) -> Vec<DiscoveredService> {
        let mut services = self.registry.services_by_type(WAN_IP_CONNECTION);
        services.extend(self.registry.services_by_type(WAN_PPP_CONNECTION));
        services
    }

    /// Try each service in turn until one succeeds
    async fn try_services(&self, services: &[DiscoveredService], destroy: bool) -> bool {
        for svc in services {
            let ok = if destroy {
                self.try_unmap(svc).await
            } else {
                self.try_map(svc).await
            };
            if ok {
                return true;
            }
        }
        false
    }

    async fn try_unmap(&self, svc: &DiscoveredService) -> bool {
        if !self.shared.is_active() {
            return true;
        }
        let request = &self.shared.request;
        let external_port = self.shared.state.lock().external_port;

        match self
            .client
            .remove_mapping(&svc.location, request.protocol, external_port)
            .await
        {
            Ok(()) => {
                tracing::info!("Removed {} mapping for port {} at {}", request.protocol, external_port, svc.location);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to remove mapping at {}: {:#}", svc.location, e);
                false
            }
        }
    }

    async fn try_map(&self, svc: &DiscoveredService) -> bool {
        let request = &self.shared.request;
        let requested_port = self.shared.state.lock().external_port;

        let assigned_port = match self
            .client
            .add_mapping(
                &svc.location,
                request.protocol,
                request.internal_port,
                requested_port,
                &request.name,
                request.lifetime,
            )
            .await
        {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!("Mapping via {} failed: {:#}", svc.location, e);
                return false;
            }
        };

        let lifetime = chrono::Duration::from_std(request.lifetime).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let was_active = {
            let mut state = self.shared.state.lock();
            let was_active = state.expire_time.is_some();
            state.expire_time = Some(
                self.clock
                    .now()
                    .checked_add_signed(lifetime)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );
            state.external_port = assigned_port;
            was_active
        };
        if was_active {
            tracing::debug!("Renewed {} mapping {} -> {}", request.protocol, assigned_port, request.internal_port);
        } else {
            tracing::info!(
                "Mapped {} port {} -> {} via {}",
                request.protocol,
                assigned_port,
                request.internal_port,
                svc.location
            );
        }

        // The mapping stands even if the address lookup fails
        match self.client.external_address(&svc.location).await {
            Ok(addr) => self.shared.state.lock().external_address = Some(addr),
            Err(e) => tracing::warn!("Failed to get external address from {}: {:#}", svc.location, e),
        }
        true
    }
}
