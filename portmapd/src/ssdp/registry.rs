use std::sync::Arc;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use anyhow::{Context, Result};
use url::Url;
use shared::types::DiscoveredService;
use crate::clock::{Clock, SystemClock};
use crate::ssdp::client::DiscoveryTransport;
use crate::ssdp::message::SsdpEvent;

/// Latest announcement per USN, fed by a discovery transport.
///
/// A repeat announcement for a known USN refreshes `last_seen` only; the
/// location and service type of the first announcement are kept. Records are
/// never removed; queries skip those not seen within three re-broadcast
/// intervals.
///
/// Queries iterate the shard-locked map without a global lock, so a scan may
/// miss an insert that races with it. Callers treat an empty result as
/// "retry later".
pub struct ServiceRegistry {
    by_usn: DashMap<String, DiscoveredService>,
    transport: Arc<dyn DiscoveryTransport>,
    clock: Arc<dyn Clock>,
    started: OnceCell<()>,
}

impl ServiceRegistry {
    pub fn new(transport: Arc<dyn DiscoveryTransport>) -> Arc<Self> {
        Self::with_clock(transport, Arc::new(SystemClock))
    }

    pub fn with_clock(transport: Arc<dyn DiscoveryTransport>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            by_usn: DashMap::new(),
            transport,
            clock,
            started: OnceCell::new(),
        })
    }

    /// Open the transport and spawn the ingestion loop (first call only),
    /// then enable broadcasting. Transport initialization failure is returned
    /// to the caller; a later call retries it.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.started
            .get_or_try_init(|| async {
                let rx = self
                    .transport
                    .open()
                    .await
                    .context("Failed to initialize discovery transport")?;

                let registry = Arc::clone(self);
                tokio::spawn(async move { registry.ingest_loop(rx).await });

                Ok::<_, anyhow::Error>(())
            })
            .await?;

        self.transport.start_broadcast();
        Ok(())
    }

    pub fn stop(&self) {
        self.transport.stop_broadcast();
    }

    async fn ingest_loop(&self, rx: flume::Receiver<SsdpEvent>) {
        while let Ok(event) = rx.recv_async().await {
            self.ingest(event);
        }
        tracing::info!("Discovery stream closed, registry ingestion stopped");
    }

    /// Record one announcement. Malformed events are dropped.
    pub fn ingest(&self, event: SsdpEvent) {
        if event.usn.is_empty() || event.st.is_empty() {
            tracing::debug!("Dropping announcement without USN or ST");
            return;
        }
        let location = match Url::parse(&event.location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                tracing::debug!("Dropping {}: bad location {:?}", event.usn, event.location);
                return;
            }
        };

        let now = self.clock.now();
        let usn = event.usn.clone();
        self.by_usn
            .entry(event.usn)
            .and_modify(|svc| svc.last_seen = now)
            .or_insert_with(|| {
                tracing::info!("Discovered {} at {}", event.st, location);
                DiscoveredService {
                    location,
                    service_type: event.st,
                    usn,
                    last_seen: now,
                }
            });
    }

    /// Live services of the given type, as copies. Order is unspecified.
    pub fn services_by_type(&self, service_type: &str) -> Vec<DiscoveredService> {
        self.live_services(|svc| svc.service_type == service_type)
    }

    /// Every live service regardless of type
    pub fn all_services(&self) -> Vec<DiscoveredService> {
        self.live_services(|_| true)
    }

    fn live_services(&self, filter: impl Fn(&DiscoveredService) -> bool) -> Vec<DiscoveredService> {
        let window = chrono::Duration::from_std(self.transport.rebroadcast_interval() * 3)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let limit = self.clock.now() - window;

        self.by_usn
            .iter()
            .filter(|entry| entry.last_seen > limit && filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of stored records, live or not
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_usn.len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{event, FakeTransport};
    use super::*;
    use crate::clock::testing::ManualClock;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use shared::protocol::{WAN_IP_CONNECTION, WAN_PPP_CONNECTION};

    fn registry_with_clock() -> (Arc<ServiceRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let registry = ServiceRegistry::with_clock(FakeTransport::new(), clock.clone());
        (registry, clock)
    }

    #[test]
    fn test_one_record_per_usn() {
        let (registry, clock) = registry_with_clock();

        registry.ingest(event("uuid:a", WAN_IP_CONNECTION, "http://192.168.1.1:5000/a.xml"));
        clock.advance(chrono::Duration::seconds(10));
        registry.ingest(event("uuid:a", WAN_PPP_CONNECTION, "http://192.168.1.1:6000/b.xml"));
        registry.ingest(event("uuid:a", WAN_IP_CONNECTION, "http://192.168.1.1:7000/c.xml"));

        assert_eq!(registry.len(), 1);
        let services = registry.services_by_type(WAN_IP_CONNECTION);
        assert_eq!(services.len(), 1);
        // First-seen location and type are kept, last_seen is refreshed
        assert_eq!(services[0].location.as_str(), "http://192.168.1.1:5000/a.xml");
        assert_eq!(services[0].last_seen, clock.now());
        assert!(registry.services_by_type(WAN_PPP_CONNECTION).is_empty());
    }

    #[test]
    fn test_query_filters_by_type() {
        let (registry, _) = registry_with_clock();

        registry.ingest(event("uuid:a", WAN_IP_CONNECTION, "http://10.0.0.1/a.xml"));
        registry.ingest(event("uuid:b", WAN_IP_CONNECTION, "http://10.0.0.2/b.xml"));
        registry.ingest(event("uuid:c", WAN_PPP_CONNECTION, "http://10.0.0.3/c.xml"));

        assert_eq!(registry.services_by_type(WAN_IP_CONNECTION).len(), 2);
        assert_eq!(registry.services_by_type(WAN_PPP_CONNECTION).len(), 1);
        assert!(registry.services_by_type("urn:unknown").is_empty());
        assert_eq!(registry.all_services().len(), 3);
    }

    #[test]
    fn test_stale_services_are_hidden_not_removed() {
        let (registry, clock) = registry_with_clock();

        registry.ingest(event("uuid:old", WAN_IP_CONNECTION, "http://10.0.0.1/a.xml"));
        clock.advance(chrono::Duration::seconds(60));
        registry.ingest(event("uuid:new", WAN_IP_CONNECTION, "http://10.0.0.2/b.xml"));

        // Window is 3 x 30s; "old" is now 60s old, still live
        assert_eq!(registry.services_by_type(WAN_IP_CONNECTION).len(), 2);

        clock.advance(chrono::Duration::seconds(31));
        let live = registry.services_by_type(WAN_IP_CONNECTION);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].usn, "uuid:new");
        assert_eq!(registry.len(), 2);

        // A fresh announcement brings it back
        registry.ingest(event("uuid:old", WAN_IP_CONNECTION, "http://10.0.0.1/a.xml"));
        assert_eq!(registry.services_by_type(WAN_IP_CONNECTION).len(), 2);
    }

    #[test]
    fn test_query_never_returns_expired_records() {
        let (registry, clock) = registry_with_clock();
        let window = chrono::Duration::seconds(90);

        for i in 0..20 {
            registry.ingest(event(&format!("uuid:{i}"), WAN_IP_CONNECTION, "http://10.0.0.1/d.xml"));
            clock.advance(chrono::Duration::seconds(7));

            let now = clock.now();
            for svc in registry.services_by_type(WAN_IP_CONNECTION) {
                assert!(now - svc.last_seen < window, "{} is stale", svc.usn);
            }
        }
    }

    #[test]
    fn test_malformed_events_dropped() {
        let (registry, _) = registry_with_clock();

        registry.ingest(event("", WAN_IP_CONNECTION, "http://10.0.0.1/a.xml"));
        registry.ingest(event("uuid:a", "", "http://10.0.0.1/a.xml"));
        registry.ingest(event("uuid:b", WAN_IP_CONNECTION, "not a url"));
        registry.ingest(event("uuid:c", WAN_IP_CONNECTION, "ftp://10.0.0.1/a.xml"));

        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_concurrent_ingest_keeps_one_record() {
        const WRITERS: usize = 8;
        const ROUNDS: usize = 200;
        let (registry, _) = registry_with_clock();
        let barrier = std::sync::Barrier::new(WRITERS);

        std::thread::scope(|scope| {
            for i in 0..WRITERS {
                let registry = &registry;
                let barrier = &barrier;
                scope.spawn(move || {
                    for round in 0..ROUNDS {
                        // Every writer hits the same fresh USN at once
                        barrier.wait();
                        registry.ingest(event(
                            &format!("uuid:round{round}"),
                            WAN_IP_CONNECTION,
                            &format!("http://10.0.0.{i}/d.xml"),
                        ));
                    }
                });
            }
        });

        assert_eq!(registry.len(), ROUNDS);
        let services = registry.services_by_type(WAN_IP_CONNECTION);
        assert_eq!(services.len(), ROUNDS);
        let usns: std::collections::HashSet<_> = services.iter().map(|s| s.usn.as_str()).collect();
        assert_eq!(usns.len(), ROUNDS);
        for svc in &services {
            let host = svc.location.host_str().unwrap();
            assert!((0..WRITERS).any(|i| host == format!("10.0.0.{i}")));
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_ingests() {
        let transport = FakeTransport::new();
        let registry = ServiceRegistry::new(transport.clone());

        registry.start().await.unwrap();
        registry.start().await.unwrap();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert!(transport.broadcasting.load(Ordering::SeqCst));

        let tx = transport.sender().unwrap();
        tx.send_async(event("uuid:gw", WAN_IP_CONNECTION, "http://192.168.1.1/d.xml"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.services_by_type(WAN_IP_CONNECTION).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("announcement was not ingested");

        registry.stop();
        assert!(!transport.broadcasting.load(Ordering::SeqCst));
        transport.close();
    }

    #[tokio::test]
    async fn test_start_propagates_transport_failure() {
        let transport = FakeTransport::new();
        transport.fail_open.store(true, Ordering::SeqCst);
        let registry = ServiceRegistry::new(transport.clone());

        let err = registry.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("socket unavailable"));
        assert!(!transport.broadcasting.load(Ordering::SeqCst));
    }
}
