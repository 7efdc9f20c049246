//! Subscription registry and scanner fan-out.
//!
//! Maps subscription keys to the host stream that receives their results.
//! Emission and removal both happen under the registry lock, so a stop is
//! observed by the host only after any in-flight emission for its key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use beacon_types::{Beacon, ConfigurableDevice, Nearable, Region, RegionKey};

use crate::cache::ObservationCache;
use crate::codec::{self, RegionState};
use crate::error::{Error, Result};
use crate::responder::ResponderHandle;

/// Kind of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Periodic ranging of a region.
    Ranging,
    /// Enter/exit monitoring of a region.
    Monitoring,
    /// Configurable device discovery.
    Discovery,
    /// Nearable discovery.
    Nearable,
}

impl SubscriptionKind {
    /// Lowercase name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ranging => "ranging",
            Self::Monitoring => "monitoring",
            Self::Discovery => "discovery",
            Self::Nearable => "nearable",
        }
    }
}

/// Key of a subscription. Ranging and monitoring are keyed by region fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// Ranging of the region with this fingerprint.
    Ranging(RegionKey),
    /// Monitoring of the region with this fingerprint.
    Monitoring(RegionKey),
    /// Device discovery.
    Discovery,
    /// Nearable discovery.
    Nearable,
}

impl SubscriptionKey {
    /// Kind of the subscription.
    pub fn kind(&self) -> SubscriptionKind {
        match self {
            Self::Ranging(_) => SubscriptionKind::Ranging,
            Self::Monitoring(_) => SubscriptionKind::Monitoring,
            Self::Discovery => SubscriptionKind::Discovery,
            Self::Nearable => SubscriptionKind::Nearable,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ranging(key) | Self::Monitoring(key) => write!(f, "{}:{key}", self.kind().as_str()),
            Self::Discovery => f.write_str("discovery"),
            Self::Nearable => f.write_str("nearable"),
        }
    }
}

/// An active subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscription key.
    pub key: SubscriptionKey,
    /// The region, for ranging and monitoring.
    pub region: Option<Region>,
    /// Host stream receiving results.
    pub sink: ResponderHandle,
}

/// Outcome of [`SubscriptionRegistry::subscribe`].
#[derive(Debug)]
pub enum Registration {
    /// A new subscription was created.
    Inserted,
    /// The key was already ranged; the existing sink was kept.
    Kept,
    /// The key was already monitored; the previous subscription was replaced.
    Replaced(Subscription),
}

/// Registry of active subscriptions.
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionKey, Subscription>>,
    cache: Arc<ObservationCache>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry").finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry writing ranging results into `cache`.
    pub fn new(cache: Arc<ObservationCache>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Register a subscription.
    ///
    /// Ranging keeps the first sink, monitoring keeps the last. Discovery and
    /// nearable streams cannot be shared and fail with
    /// [`Error::AlreadySubscribed`].
    pub async fn subscribe(&self, subscription: Subscription) -> Result<Registration> {
        let mut entries = self.entries.lock().await;
        let key = subscription.key.clone();
        let Some(existing) = entries.get(&key) else {
            info!(key = %key, responder = subscription.sink.id(), "subscribed");
            entries.insert(key, subscription);
            return Ok(Registration::Inserted);
        };

        match key.kind() {
            SubscriptionKind::Ranging => {
                debug!(key = %key, kept = existing.sink.id(), "duplicate ranging subscribe ignored");
                Ok(Registration::Kept)
            }
            SubscriptionKind::Monitoring => {
                info!(key = %key, responder = subscription.sink.id(), "monitoring re-registered");
                let previous = entries.insert(key.clone(), subscription);
                Ok(previous.map_or(Registration::Inserted, Registration::Replaced))
            }
            kind @ (SubscriptionKind::Discovery | SubscriptionKind::Nearable) => {
                Err(Error::AlreadySubscribed {
                    kind: kind.as_str(),
                    key: key.to_string(),
                })
            }
        }
    }

    /// Remove a subscription and close its stream with a terminal no-result.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<Subscription> {
        let mut entries = self.entries.lock().await;
        let subscription = entries
            .remove(key)
            .ok_or_else(|| Error::not_subscribed(key.kind().as_str(), key.to_string()))?;
        subscription.sink.no_result();
        info!(key = %key, "unsubscribed");
        Ok(subscription)
    }

    /// Remove a subscription and fail its stream.
    pub async fn abort(&self, key: &SubscriptionKey, err: &Error) -> Option<Subscription> {
        let subscription = self.entries.lock().await.remove(key)?;
        subscription.sink.fail(err);
        info!(key = %key, error = %err, "subscription aborted");
        Some(subscription)
    }

    /// Drop every subscription without telling the host.
    pub async fn clear(&self) -> Vec<Subscription> {
        let drained: Vec<Subscription> = self.entries.lock().await.drain().map(|(_, s)| s).collect();
        for subscription in &drained {
            subscription.sink.revoke();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "subscriptions cleared");
        }
        drained
    }

    /// Whether a subscription exists for the key.
    pub async fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// The sink registered for the key.
    pub async fn sink(&self, key: &SubscriptionKey) -> Option<ResponderHandle> {
        self.entries.lock().await.get(key).map(|s| s.sink.clone())
    }

    /// The subscription registered for the key.
    pub async fn get(&self, key: &SubscriptionKey) -> Option<Subscription> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Number of active subscriptions.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no subscription is active.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    // --- Fan-out ---

    /// Handle a ranging callback: refresh the cache, then stream to the region's sink.
    pub async fn on_ranged(&self, region: &Region, beacons: Vec<Beacon>) {
        self.cache.replace_beacons(beacons.clone()).await;

        let key = SubscriptionKey::Ranging(region.key());
        let entries = self.entries.lock().await;
        let Some(subscription) = entries.get(&key) else {
            debug!(key = %key, "no ranging sink, dropping batch");
            return;
        };
        let region = subscription.region.as_ref().unwrap_or(region);
        subscription
            .sink
            .emit(codec::encode_ranging(region, &beacons), true);
    }

    /// Handle a monitoring edge.
    pub async fn on_region_state(&self, region: &Region, state: RegionState) {
        let key = SubscriptionKey::Monitoring(region.key());
        let entries = self.entries.lock().await;
        let Some(subscription) = entries.get(&key) else {
            debug!(key = %key, state = state.as_str(), "no monitoring sink, dropping event");
            return;
        };
        let region = subscription.region.as_ref().unwrap_or(region);
        subscription
            .sink
            .emit(codec::encode_region(region, Some(state)), true);
    }

    /// Handle a discovery callback.
    pub async fn on_discovered(&self, devices: Vec<ConfigurableDevice>) {
        let payload = codec::encode_discovery(&devices);
        self.cache.replace_devices(devices).await;

        let entries = self.entries.lock().await;
        match entries.get(&SubscriptionKey::Discovery) {
            Some(subscription) => {
                subscription.sink.emit(payload, true);
            }
            None => debug!("no discovery sink, dropping devices"),
        }
    }

    /// Handle a nearable callback.
    pub async fn on_nearables(&self, nearables: &[Nearable]) {
        let entries = self.entries.lock().await;
        match entries.get(&SubscriptionKey::Nearable) {
            Some(subscription) => {
                subscription
                    .sink
                    .emit(codec::encode_nearables(nearables), true);
            }
            None => debug!("no nearable sink, dropping nearables"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::{Status, responder_channel};
    use beacon_types::MacAddress;
    use beacon_types::uuid::ESTIMOTE_PROXIMITY_UUID;

    fn registry() -> (SubscriptionRegistry, Arc<ObservationCache>) {
        let cache = Arc::new(ObservationCache::new());
        (SubscriptionRegistry::new(Arc::clone(&cache)), cache)
    }

    fn region() -> Region {
        Region::with_uuid("office", ESTIMOTE_PROXIMITY_UUID)
    }

    fn ranging(region: &Region, sink: ResponderHandle) -> Subscription {
        Subscription {
            key: SubscriptionKey::Ranging(region.key()),
            region: Some(region.clone()),
            sink,
        }
    }

    fn monitoring(region: &Region, sink: ResponderHandle) -> Subscription {
        Subscription {
            key: SubscriptionKey::Monitoring(region.key()),
            region: Some(region.clone()),
            sink,
        }
    }

    fn beacon() -> Beacon {
        Beacon::new(
            ESTIMOTE_PROXIMITY_UUID,
            1,
            2,
            MacAddress::new([1, 2, 3, 4, 5, 6]),
            -70,
            -59,
        )
    }

    #[tokio::test]
    async fn test_ranging_first_writer_wins() {
        let (registry, _) = registry();
        let (first, _rx1) = responder_channel();
        let (second, _rx2) = responder_channel();

        let r = registry.subscribe(ranging(&region(), first.clone())).await.unwrap();
        assert!(matches!(r, Registration::Inserted));
        let r = registry.subscribe(ranging(&region(), second)).await.unwrap();
        assert!(matches!(r, Registration::Kept));

        let key = SubscriptionKey::Ranging(region().key());
        assert!(registry.sink(&key).await.unwrap().same_as(&first));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_monitoring_last_writer_wins() {
        let (registry, _) = registry();
        let (first, _rx1) = responder_channel();
        let (second, _rx2) = responder_channel();

        registry.subscribe(monitoring(&region(), first.clone())).await.unwrap();
        let r = registry.subscribe(monitoring(&region(), second.clone())).await.unwrap();
        match r {
            Registration::Replaced(previous) => assert!(previous.sink.same_as(&first)),
            other => panic!("expected replacement, got {other:?}"),
        }

        let key = SubscriptionKey::Monitoring(region().key());
        assert!(registry.sink(&key).await.unwrap().same_as(&second));
    }

    #[tokio::test]
    async fn test_discovery_cannot_be_shared() {
        let (registry, _) = registry();
        let (a, _rx1) = responder_channel();
        let (b, _rx2) = responder_channel();
        let sub = |sink| Subscription {
            key: SubscriptionKey::Discovery,
            region: None,
            sink,
        };
        registry.subscribe(sub(a)).await.unwrap();
        let err = registry.subscribe(sub(b)).await.unwrap_err();
        assert_eq!(err.code(), "AlreadySubscribed");
    }

    #[tokio::test]
    async fn test_unsubscribe_missing_key() {
        let (registry, _) = registry();
        let err = registry
            .unsubscribe(&SubscriptionKey::Ranging(region().key()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotSubscribed");
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_terminal_no_result() {
        let (registry, _) = registry();
        let (sink, mut rx) = responder_channel();
        registry.subscribe(ranging(&region(), sink)).await.unwrap();

        registry.on_ranged(&region(), vec![beacon()]).await;
        registry
            .unsubscribe(&SubscriptionKey::Ranging(region().key()))
            .await
            .unwrap();
        registry.on_ranged(&region(), vec![beacon()]).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.status, Status::Ok);
        assert!(first.keep_callback);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.status, Status::NoResult);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ranged_replaces_cache_even_without_sink() {
        let (registry, cache) = registry();
        registry.on_ranged(&region(), vec![beacon()]).await;
        assert_eq!(cache.beacons().await.len(), 1);
        registry.on_ranged(&Region::any("other"), Vec::new()).await;
        assert!(cache.beacons().await.is_empty());
    }

    #[tokio::test]
    async fn test_ranged_payload_uses_subscribed_region() {
        let (registry, _) = registry();
        let (sink, mut rx) = responder_channel();
        registry.subscribe(ranging(&region(), sink)).await.unwrap();

        let scanner_region = Region::with_uuid("scanner-side", ESTIMOTE_PROXIMITY_UUID);
        registry.on_ranged(&scanner_region, vec![beacon()]).await;

        let payload = rx.try_recv().unwrap().payload.unwrap();
        assert_eq!(payload["region"]["identifier"], "office");
        assert_eq!(payload["beacons"][0]["minor"], 2);
    }

    #[tokio::test]
    async fn test_region_state_emissions() {
        let (registry, _) = registry();
        let (sink, mut rx) = responder_channel();
        registry.subscribe(monitoring(&region(), sink)).await.unwrap();

        registry.on_region_state(&region(), RegionState::Inside).await;
        registry.on_region_state(&region(), RegionState::Outside).await;

        assert_eq!(rx.try_recv().unwrap().payload.unwrap()["state"], "inside");
        assert_eq!(rx.try_recv().unwrap().payload.unwrap()["state"], "outside");
    }

    #[tokio::test]
    async fn test_abort_and_clear() {
        let (registry, _) = registry();
        let (a, mut rx_a) = responder_channel();
        let (b, mut rx_b) = responder_channel();
        registry.subscribe(ranging(&region(), a)).await.unwrap();
        registry.subscribe(monitoring(&region(), b.clone())).await.unwrap();

        registry
            .abort(&SubscriptionKey::Ranging(region().key()), &Error::RadioOff)
            .await
            .unwrap();
        assert_eq!(rx_a.try_recv().unwrap().status, Status::Error);

        let cleared = registry.clear().await;
        assert_eq!(cleared.len(), 1);
        assert!(b.is_finished());
        assert!(rx_b.try_recv().is_err());
        assert!(registry.is_empty().await);
    }
}
