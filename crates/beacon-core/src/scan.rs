//! Scan session: lifecycle of the single shared scanner.
//!
//! The first attach binds the scanner (service-ready handshake). Attaches
//! that arrive while the handshake is in flight are queued and started once
//! the scanner is ready. The last detach releases the scanner.
//!
//! Failures to start or stop an individual scan are logged and do not affect
//! the subscription. A failed handshake aborts every queued subscription
//! through the registry, so the scanner runs exactly when at least one
//! subscription exists.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use beacon_types::Region;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventDispatcher};
use crate::registry::{SubscriptionKey, SubscriptionRegistry};
use crate::traits::BeaconScanner;

/// Lifecycle phase of the scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Scanner released.
    Idle,
    /// Handshake in flight.
    Starting,
    /// Scanner bound and accepting start/stop calls.
    Ready,
}

/// What the scanner must be doing for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    /// Ranging a region.
    Ranging(Region),
    /// Monitoring a region.
    Monitoring(Region),
    /// Discovering configurable devices.
    Discovery,
    /// Discovering nearables.
    Nearable,
}

impl Attachment {
    /// Subscription key this attachment serves.
    pub fn key(&self) -> SubscriptionKey {
        match self {
            Self::Ranging(region) => SubscriptionKey::Ranging(region.key()),
            Self::Monitoring(region) => SubscriptionKey::Monitoring(region.key()),
            Self::Discovery => SubscriptionKey::Discovery,
            Self::Nearable => SubscriptionKey::Nearable,
        }
    }
}

struct SessionState {
    phase: SessionPhase,
    /// Incremented on every handshake and reset so a stale handshake can
    /// recognise that it was superseded.
    epoch: u64,
    active: HashMap<SubscriptionKey, Attachment>,
    pending: VecDeque<Attachment>,
}

/// Owner of the shared scanner.
pub struct ScanSession {
    scanner: Arc<dyn BeaconScanner>,
    registry: Arc<SubscriptionRegistry>,
    events: EventDispatcher,
    state: Mutex<SessionState>,
}

impl fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSession").finish_non_exhaustive()
    }
}

impl ScanSession {
    /// Create an idle session.
    pub fn new(
        scanner: Arc<dyn BeaconScanner>,
        registry: Arc<SubscriptionRegistry>,
        events: EventDispatcher,
    ) -> Self {
        Self {
            scanner,
            registry,
            events,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Idle,
                epoch: 0,
                active: HashMap::new(),
                pending: VecDeque::new(),
            }),
        }
    }

    /// Current phase.
    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Whether the scanner is bound or binding.
    pub async fn is_running(&self) -> bool {
        self.phase().await != SessionPhase::Idle
    }

    /// Number of attachments, active or queued.
    pub async fn attachment_count(&self) -> usize {
        let state = self.state.lock().await;
        state.active.len() + state.pending.len()
    }

    /// Attach a subscription to the scanner.
    ///
    /// Re-attaching a monitored region swaps the region on the scanner.
    pub async fn attach(&self, attachment: Attachment) -> Result<()> {
        let key = attachment.key();
        let mut state = self.state.lock().await;

        if let Some(slot) = state.pending.iter_mut().find(|a| a.key() == key) {
            *slot = attachment;
            return Ok(());
        }
        if let Some(current) = state.active.get(&key).cloned() {
            if current != attachment {
                self.swap(&current, &attachment).await;
                state.active.insert(key, attachment);
            }
            return Ok(());
        }

        match state.phase {
            SessionPhase::Ready => {
                self.start(&attachment).await;
                state.active.insert(key, attachment);
                Ok(())
            }
            SessionPhase::Starting => {
                debug!(key = %key, "scanner not ready, queueing attach");
                state.pending.push_back(attachment);
                Ok(())
            }
            SessionPhase::Idle => {
                state.phase = SessionPhase::Starting;
                state.epoch += 1;
                let epoch = state.epoch;
                state.pending.push_back(attachment);
                drop(state);
                self.handshake(epoch).await
            }
        }
    }

    /// Detach a subscription. The last detach releases the scanner.
    pub async fn detach(&self, key: &SubscriptionKey) {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.pending.iter().position(|a| a.key() == *key) {
            state.pending.remove(pos);
            debug!(key = %key, "queued attach withdrawn");
            return;
        }
        let Some(attachment) = state.active.remove(key) else {
            return;
        };
        self.stop(&attachment).await;

        if state.active.is_empty() && state.pending.is_empty() && state.phase == SessionPhase::Ready
        {
            self.release(&mut state).await;
        }
    }

    /// Drop every attachment and release the scanner.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.pending.clear();
        let active: Vec<Attachment> = state.active.drain().map(|(_, a)| a).collect();
        for attachment in &active {
            self.stop(attachment).await;
        }
        state.epoch += 1;
        match state.phase {
            SessionPhase::Ready => self.release(&mut state).await,
            SessionPhase::Starting => {
                // The in-flight handshake sees the new epoch and unbinds.
                state.phase = SessionPhase::Idle;
            }
            SessionPhase::Idle => {}
        }
    }

    async fn handshake(&self, epoch: u64) -> Result<()> {
        info!("binding scanner");
        let result = self.scanner.connect().await;
        let mut state = self.state.lock().await;

        if state.epoch != epoch {
            debug!("handshake superseded by reset");
            if result.is_ok() && state.phase == SessionPhase::Idle {
                if let Err(e) = self.scanner.disconnect().await {
                    warn!(error = %e, "failed to release superseded scanner");
                }
            }
            return Err(Error::Cancelled);
        }

        if let Err(err) = result {
            warn!(error = %err, "scanner handshake failed");
            state.phase = SessionPhase::Idle;
            let dropped: Vec<Attachment> = state.pending.drain(..).collect();
            drop(state);
            for attachment in dropped {
                self.registry.abort(&attachment.key(), &err).await;
            }
            return Err(err);
        }

        state.phase = SessionPhase::Ready;
        self.events.send(EngineEvent::SessionStarted);
        info!(queued = state.pending.len(), "scanner ready");

        while let Some(attachment) = state.pending.pop_front() {
            self.start(&attachment).await;
            state.active.insert(attachment.key(), attachment);
        }
        if state.active.is_empty() {
            self.release(&mut state).await;
        }
        Ok(())
    }

    async fn release(&self, state: &mut SessionState) {
        if let Err(e) = self.scanner.disconnect().await {
            warn!(error = %e, "failed to release scanner");
        }
        state.phase = SessionPhase::Idle;
        self.events.send(EngineEvent::SessionStopped);
        info!("scanner released");
    }

    async fn start(&self, attachment: &Attachment) {
        let result = match attachment {
            Attachment::Ranging(region) => self.scanner.start_ranging(region).await,
            Attachment::Monitoring(region) => self.scanner.start_monitoring(region).await,
            Attachment::Discovery => self.scanner.start_discovery().await,
            Attachment::Nearable => self.scanner.start_nearable_discovery().await,
        };
        match result {
            Ok(()) => debug!(key = %attachment.key(), "scan started"),
            Err(e) => warn!(key = %attachment.key(), error = %e, "failed to start scan"),
        }
    }

    async fn stop(&self, attachment: &Attachment) {
        let result = match attachment {
            Attachment::Ranging(region) => self.scanner.stop_ranging(region).await,
            Attachment::Monitoring(region) => {
                self.scanner.stop_monitoring(&region.identifier).await
            }
            Attachment::Discovery => self.scanner.stop_discovery().await,
            Attachment::Nearable => self.scanner.stop_nearable_discovery().await,
        };
        match result {
            Ok(()) => debug!(key = %attachment.key(), "scan stopped"),
            Err(e) => warn!(key = %attachment.key(), error = %e, "failed to stop scan"),
        }
    }

    async fn swap(&self, current: &Attachment, next: &Attachment) {
        debug!(key = %next.key(), "replacing attached region");
        self.stop(current).await;
        self.start(next).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObservationCache;
    use crate::mock::MockScanner;
    use crate::registry::Subscription;
    use crate::responder::{Status, responder_channel};
    use beacon_types::uuid::ESTIMOTE_PROXIMITY_UUID;
    use std::time::Duration;

    fn session(scanner: Arc<MockScanner>) -> (ScanSession, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(ObservationCache::new())));
        let session = ScanSession::new(scanner, Arc::clone(&registry), EventDispatcher::default());
        (session, registry)
    }

    fn region(id: &str, major: u16) -> Region {
        Region::with_uuid(id, ESTIMOTE_PROXIMITY_UUID).major(major)
    }

    #[tokio::test]
    async fn test_first_attach_binds_last_detach_releases() {
        let scanner = Arc::new(MockScanner::new());
        let (session, _) = session(Arc::clone(&scanner));
        assert_eq!(session.phase().await, SessionPhase::Idle);

        session.attach(Attachment::Ranging(region("a", 1))).await.unwrap();
        session.attach(Attachment::Discovery).await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::Ready);
        assert_eq!(scanner.connect_count(), 1);
        assert_eq!(scanner.ranging_regions().await.len(), 1);
        assert!(scanner.is_discovering());

        session.detach(&SubscriptionKey::Discovery).await;
        assert!(session.is_running().await);
        session
            .detach(&SubscriptionKey::Ranging(region("a", 1).key()))
            .await;
        assert_eq!(session.phase().await, SessionPhase::Idle);
        assert_eq!(scanner.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_attaches_queue_during_handshake() {
        let scanner = Arc::new(MockScanner::new());
        scanner.set_connect_latency(Duration::from_millis(50));
        let (session, _) = session(Arc::clone(&scanner));
        let session = Arc::new(session);

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.attach(Attachment::Ranging(region("a", 1))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.phase().await, SessionPhase::Starting);

        session.attach(Attachment::Nearable).await.unwrap();
        assert_eq!(session.attachment_count().await, 2);
        assert!(!scanner.is_discovering_nearables());

        first.await.unwrap().unwrap();
        assert_eq!(session.phase().await, SessionPhase::Ready);
        assert!(scanner.is_discovering_nearables());
        assert_eq!(scanner.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_aborts_queued_subscriptions() {
        let scanner = Arc::new(MockScanner::new());
        scanner.set_fail_connect(true);
        let (session, registry) = session(Arc::clone(&scanner));

        let (sink, mut rx) = responder_channel();
        let region = region("a", 1);
        registry
            .subscribe(Subscription {
                key: SubscriptionKey::Ranging(region.key()),
                region: Some(region.clone()),
                sink,
            })
            .await
            .unwrap();

        let err = session.attach(Attachment::Ranging(region)).await.unwrap_err();
        assert_eq!(err.code(), "ScannerError");
        assert_eq!(session.phase().await, SessionPhase::Idle);
        assert!(registry.is_empty().await);
        assert_eq!(rx.try_recv().unwrap().status, Status::Error);
    }

    #[tokio::test]
    async fn test_monitoring_reattach_swaps_region() {
        let scanner = Arc::new(MockScanner::new());
        let (session, _) = session(Arc::clone(&scanner));

        session.attach(Attachment::Monitoring(region("first", 3))).await.unwrap();
        session.attach(Attachment::Monitoring(region("second", 3))).await.unwrap();

        let monitored = scanner.monitored_identifiers().await;
        assert_eq!(monitored, vec!["second".to_string()]);
        assert_eq!(session.attachment_count().await, 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_not_fatal() {
        let scanner = Arc::new(MockScanner::new());
        scanner.set_fail_starts(true);
        let (session, _) = session(Arc::clone(&scanner));

        session.attach(Attachment::Discovery).await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::Ready);
        assert_eq!(session.attachment_count().await, 1);
    }

    #[tokio::test]
    async fn test_reset_releases_scanner() {
        let scanner = Arc::new(MockScanner::new());
        let (session, _) = session(Arc::clone(&scanner));
        session.attach(Attachment::Ranging(region("a", 1))).await.unwrap();
        session.attach(Attachment::Ranging(region("b", 2))).await.unwrap();

        session.reset().await;
        assert_eq!(session.phase().await, SessionPhase::Idle);
        assert_eq!(session.attachment_count().await, 0);
        assert!(scanner.ranging_regions().await.is_empty());
        assert_eq!(scanner.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_during_handshake_unbinds_afterwards() {
        let scanner = Arc::new(MockScanner::new());
        scanner.set_connect_latency(Duration::from_millis(50));
        let (session, _) = session(Arc::clone(&scanner));
        let session = Arc::new(session);

        let attach = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.attach(Attachment::Discovery).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.reset().await;

        let err = attach.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(session.phase().await, SessionPhase::Idle);
        assert!(!scanner.is_discovering());
        assert_eq!(scanner.disconnect_count(), 1);
    }
}
