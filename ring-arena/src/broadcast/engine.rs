//! TTL-bounded flood with delayed local handling and cancellation
//!
//! Each node keeps three concurrent tables keyed by broadcast id:
//! - `seen`: ids this node already forwarded; an id is forwarded at most once
//! - `cancelled`: ids somebody already answered; only ever grows
//! - `pending`: responder tasks still waiting out their jitter
//!
//! The receiver loop relays first and only then schedules local handling
//! after a random delay, so that a fast responder's cancel notice can reach
//! slower peers before they act.

use std::net::IpAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::{oneshot, Semaphore};

use super::envelope::{BroadcastEnvelope, BroadcastId, BroadcastKind, CancelNotice, CancelReason, Datagram};
use super::transport::DatagramTransport;
use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::stats::StatsTracker;

/// What a local handler did with an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderOutcome {
    /// Not for us
    NoMatch,
    /// We answered and nobody else should: flood a cancel notice
    Claimed,
    /// We answered but others may answer too (ASK_ONLINE)
    Answered,
}

/// Local handling of a flooded request, run after the jitter delay
pub trait BroadcastResponder: Send + Sync {
    fn respond<'a>(&'a self, envelope: &'a BroadcastEnvelope) -> BoxFuture<'a, ResponderOutcome>;
}

/// Tunables of the flood
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub default_ttl: u32,
    pub jitter_ms: Range<u64>,
    pub responder_pool_size: usize,
    /// Seed addresses used while the node has no neighbor
    pub bootstrap: Vec<IpAddr>,
}

impl BroadcastSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            default_ttl: config.default_ttl,
            jitter_ms: config.jitter_min_ms..config.jitter_max_ms.max(config.jitter_min_ms + 1),
            responder_pool_size: config.responder_pool_size.max(1),
            bootstrap: config.bootstrap.clone(),
        }
    }
}

pub struct BroadcastEngine {
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn DatagramTransport>,
    settings: BroadcastSettings,
    stats: Arc<StatsTracker>,
    seen: DashSet<BroadcastId>,
    cancelled: DashSet<BroadcastId>,
    handled: DashSet<BroadcastId>,
    pending: DashMap<BroadcastId, oneshot::Sender<()>>,
    permits: Arc<Semaphore>,
}

impl BroadcastEngine {
    pub fn new(
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn DatagramTransport>,
        settings: BroadcastSettings,
        stats: Arc<StatsTracker>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.responder_pool_size));
        Self {
            directory,
            transport,
            settings,
            stats,
            seen: DashSet::new(),
            cancelled: DashSet::new(),
            handled: DashSet::new(),
            pending: DashMap::new(),
            permits,
        }
    }

    /// Fresh envelope originated by this node with the default ttl
    pub fn envelope(&self, kind: BroadcastKind) -> BroadcastEnvelope {
        BroadcastEnvelope::new(kind, self.directory.local(), self.settings.default_ttl)
    }

    pub fn is_cancelled(&self, id: &BroadcastId) -> bool {
        self.cancelled.contains(id)
    }

    pub fn has_seen(&self, id: &BroadcastId) -> bool {
        self.seen.contains(id)
    }

    /// Number of responder tasks still waiting out their delay
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forward an envelope to every neighbor
    ///
    /// Dropped when its ttl is exhausted or when this node already forwarded
    /// the same id. Returns whether it went out.
    pub async fn send(&self, envelope: BroadcastEnvelope) -> bool {
        if envelope.ttl == 0 {
            tracing::trace!("Broadcast '{}' dropped: ttl exhausted", envelope.id);
            self.stats.record_drop();
            return false;
        }
        if !self.seen.insert(envelope.id.clone()) {
            tracing::trace!("Broadcast '{}' dropped: already forwarded", envelope.id);
            self.stats.record_drop();
            return false;
        }
        self.transmit(&Datagram::Envelope(envelope)).await;
        true
    }

    /// Unicast one datagram to each neighbor address, or to the seeds when alone
    async fn transmit(&self, datagram: &Datagram) {
        let bytes = match datagram.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Node '{}' cannot encode datagram: {}", self.directory.local_id(), e);
                return;
            }
        };
        let mut targets = self.directory.neighbor_addresses();
        if targets.is_empty() {
            let local = self.transport.local_addr();
            targets = self
                .settings
                .bootstrap
                .iter()
                .copied()
                .filter(|addr| *addr != local)
                .collect();
        }
        for addr in targets {
            match self.transport.send_to(&bytes, addr).await {
                Ok(()) => self.stats.add_output_bytes(bytes.len()),
                Err(e) => tracing::debug!("Node '{}' datagram to {} failed: {}", self.directory.local_id(), addr, e),
            }
        }
    }

    /// Originate a cancel notice for `id`
    pub async fn cancel(&self, id: &BroadcastId, reason: CancelReason) {
        let notice = CancelNotice {
            broadcast_id: id.clone(),
            reason,
            responder: self.directory.local_id().clone(),
        };
        self.on_cancel(notice).await;
    }

    /// Inbound cancel: suppress local handling and pass the notice on
    ///
    /// The notice is re-flooded only the first time this node observes the id,
    /// which is what stops notices from circulating forever.
    pub async fn on_cancel(&self, notice: CancelNotice) {
        let first = self.cancelled.insert(notice.broadcast_id.clone());
        if let Some((_, stop)) = self.pending.remove(&notice.broadcast_id) {
            let _ = stop.send(());
        }
        if first {
            tracing::debug!(
                "Node '{}' broadcast '{}' cancelled by '{}' ({:?})",
                self.directory.local_id(),
                notice.broadcast_id,
                notice.responder,
                notice.reason
            );
            self.transmit(&Datagram::Cancel(notice)).await;
        }
    }

    /// Inbound envelope: relay, then schedule local handling
    pub async fn on_envelope(self: &Arc<Self>, envelope: BroadcastEnvelope, responder: &Arc<dyn BroadcastResponder>) {
        if self.cancelled.contains(&envelope.id) {
            self.stats.record_cancelled_drop();
            return;
        }
        if envelope.ttl > 1 && self.send(envelope.relayed()).await {
            self.stats.record_relay();
        }
        if &envelope.originator == self.directory.local_id() {
            return;
        }
        if !self.handled.insert(envelope.id.clone()) {
            return;
        }
        self.schedule(envelope, responder.clone());
    }

    fn schedule(self: &Arc<Self>, envelope: BroadcastEnvelope, responder: Arc<dyn BroadcastResponder>) {
        let delay = Duration::from_millis(rand::rng().random_range(self.settings.jitter_ms.clone()));
        let (stop, stopped) = oneshot::channel();
        self.pending.insert(envelope.id.clone(), stop);
        let engine = self.clone();
        tokio::spawn(async move {
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = stopped => true,
            };
            if interrupted || engine.cancelled.contains(&envelope.id) {
                engine.pending.remove(&envelope.id);
                engine.stats.record_responder_abort();
                tracing::trace!("Node '{}' responder for '{}' aborted", engine.directory.local_id(), envelope.id);
                return;
            }
            let Ok(_permit) = engine.permits.clone().acquire_owned().await else {
                return;
            };
            engine.pending.remove(&envelope.id);
            if engine.cancelled.contains(&envelope.id) {
                engine.stats.record_responder_abort();
                return;
            }
            match responder.respond(&envelope).await {
                ResponderOutcome::NoMatch => {}
                ResponderOutcome::Answered => engine.stats.record_response(),
                ResponderOutcome::Claimed => {
                    engine.stats.record_response();
                    engine.cancel(&envelope.id, CancelReason::Responded).await;
                }
            }
        });
    }

    /// Decode and dispatch one raw datagram; malformed input is dropped
    pub async fn on_datagram(self: &Arc<Self>, bytes: &[u8], from: IpAddr, responder: &Arc<dyn BroadcastResponder>) {
        self.stats.add_input_bytes(bytes.len());
        match Datagram::decode(bytes) {
            Ok(Datagram::Envelope(envelope)) => self.on_envelope(envelope, responder).await,
            Ok(Datagram::Cancel(notice)) => self.on_cancel(notice).await,
            Err(e) => {
                tracing::debug!("Node '{}' dropped datagram from {}: {}", self.directory.local_id(), from, e);
            }
        }
    }

    /// Receiver loop
    ///
    /// Runs forever; stop it by aborting the task. Errors are logged and
    /// never end the loop.
    pub async fn run(self: Arc<Self>, responder: Arc<dyn BroadcastResponder>) {
        tracing::info!("Node '{}' broadcast receiver started", self.directory.local_id());
        loop {
            match self.transport.recv_from().await {
                Ok((bytes, from)) => self.on_datagram(&bytes, from, &responder).await,
                Err(e) => {
                    tracing::warn!("Node '{}' receive failed: {}", self.directory.local_id(), e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::envelope::PAYLOAD_TARGET;
    use crate::directory::NeighborRole;
    use crate::loopback::LoopbackNetwork;
    use crate::types::{PeerDescriptor, PeerId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers LOOKUP_PEER when the target is the local id
    struct TargetMatcher {
        local: PeerId,
        calls: AtomicUsize,
    }

    impl BroadcastResponder for TargetMatcher {
        fn respond<'a>(&'a self, envelope: &'a BroadcastEnvelope) -> BoxFuture<'a, ResponderOutcome> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if envelope.entry(PAYLOAD_TARGET) == Some(self.local.as_str()) {
                    ResponderOutcome::Claimed
                } else {
                    ResponderOutcome::NoMatch
                }
            })
        }
    }

    struct TestNode {
        engine: Arc<BroadcastEngine>,
        directory: Arc<PeerDirectory>,
        stats: Arc<StatsTracker>,
        responder: Arc<TargetMatcher>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Drop for TestNode {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    fn descriptor(id: &str, octet: u8) -> PeerDescriptor {
        PeerDescriptor {
            id: PeerId::from_name(id).unwrap(),
            name: id.to_lowercase(),
            address: IpAddr::from([127, 0, 0, octet]),
            port: 7000,
            service: "go".to_string(),
            rank: 0,
        }
    }

    fn node(network: &Arc<LoopbackNetwork>, id: &str, octet: u8, jitter_ms: Range<u64>) -> TestNode {
        let local = descriptor(id, octet);
        let directory = Arc::new(PeerDirectory::new(local.clone()));
        let stats = Arc::new(StatsTracker::new());
        let settings = BroadcastSettings {
            default_ttl: 3,
            jitter_ms,
            responder_pool_size: 2,
            bootstrap: Vec::new(),
        };
        let transport = Arc::new(network.datagram_endpoint(local.address));
        let engine = Arc::new(BroadcastEngine::new(directory.clone(), transport, settings, stats.clone()));
        let responder = Arc::new(TargetMatcher {
            local: local.id.clone(),
            calls: AtomicUsize::new(0),
        });
        let task = tokio::spawn(engine.clone().run(responder.clone()));
        TestNode {
            engine,
            directory,
            stats,
            responder,
            task,
        }
    }

    fn link(a: &TestNode, b: &TestNode) {
        let (pa, pb) = (a.directory.local().clone(), b.directory.local().clone());
        a.directory.update(|t| {
            let role = if t.get(NeighborRole::Successor1).is_none() {
                NeighborRole::Successor1
            } else {
                NeighborRole::Predecessor1
            };
            t.set(role, Some(pb));
        });
        b.directory.update(|t| {
            let role = if t.get(NeighborRole::Successor1).is_none() {
                NeighborRole::Successor1
            } else {
                NeighborRole::Predecessor1
            };
            t.set(role, Some(pa));
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_send_drops_exhausted_and_repeated() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "A", 1, 10..20);

        let mut env = a.engine.envelope(BroadcastKind::AskOnline);
        env.ttl = 0;
        assert!(!a.engine.send(env).await);

        let env = a.engine.envelope(BroadcastKind::AskOnline);
        assert!(a.engine.send(env.clone()).await);
        assert!(!a.engine.send(env).await);
        assert_eq!(a.stats.get_stats().dropped, 2);
    }

    /// A (ttl 3) has neighbors X and Y and looks up Y. Y answers quickly and
    /// cancels; X waits longer and must never run its handler.
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_lookup_cancel_suppresses_slow_peer() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "A", 1, 10..20);
        let x = node(&network, "X", 2, 300..400);
        let y = node(&network, "Y", 3, 10..20);
        link(&a, &x);
        link(&a, &y);

        let env = a
            .engine
            .envelope(BroadcastKind::LookupPeer)
            .with_entry(PAYLOAD_TARGET, "Y");
        let id = env.id.clone();
        assert!(a.engine.send(env).await);

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(y.responder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(y.stats.get_stats().responses, 1);
        assert_eq!(x.responder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(x.stats.get_stats().responders_aborted, 1);
        assert_eq!(x.engine.pending_count(), 0);
        for n in [&a, &x, &y] {
            assert!(n.engine.is_cancelled(&id));
        }
        // the originator never handles its own flood
        assert_eq!(a.responder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_cancelled_id_is_never_handled() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "A", 1, 10..20);
        let responder: Arc<dyn BroadcastResponder> = a.responder.clone();
        let origin = descriptor("O", 9);

        let env = BroadcastEnvelope::new(BroadcastKind::LookupPeer, &origin, 3).with_entry(PAYLOAD_TARGET, "A");
        a.engine
            .on_cancel(CancelNotice {
                broadcast_id: env.id.clone(),
                reason: CancelReason::Timeout,
                responder: origin.id.clone(),
            })
            .await;
        a.engine.on_envelope(env.clone(), &responder).await;
        a.engine.on_envelope(env.relayed(), &responder).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(a.responder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(a.stats.get_stats().cancelled_dropped, 2);
        assert!(!a.engine.has_seen(&env.id));
    }

    /// N never saw the original flood but still passes the notice to M, once
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_cancel_forwarded_without_original() {
        let network = LoopbackNetwork::new();
        let n = node(&network, "N", 1, 10..20);
        let m = node(&network, "M", 2, 10..20);
        link(&n, &m);
        let origin = descriptor("O", 9);
        let env = BroadcastEnvelope::new(BroadcastKind::LookupPeer, &origin, 3);
        let notice = CancelNotice {
            broadcast_id: env.id.clone(),
            reason: CancelReason::Responded,
            responder: origin.id.clone(),
        };

        n.engine.on_cancel(notice.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!n.engine.has_seen(&env.id));
        assert!(m.engine.is_cancelled(&env.id));
        let sent = n.stats.get_stats().output_bytes;
        let received = m.stats.get_stats().input_bytes;
        assert!(sent > 0);

        n.engine.on_cancel(notice).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(n.stats.get_stats().output_bytes, sent);
        assert_eq!(m.stats.get_stats().input_bytes, received);
    }

    /// Diamond A-B-D, A-C-D: D gets the flood twice but relays and handles it once
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_relay_at_most_once_per_id() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "A", 1, 10..20);
        let b = node(&network, "B", 2, 10..20);
        let c = node(&network, "C", 3, 10..20);
        let d = node(&network, "D", 4, 10..20);
        link(&a, &b);
        link(&a, &c);
        link(&b, &d);
        link(&c, &d);

        let env = a.engine.envelope(BroadcastKind::LookupPeer).with_entry(PAYLOAD_TARGET, "nobody");
        a.engine.send(env).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(d.stats.get_stats().relayed, 1);
        assert_eq!(d.responder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.responder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.responder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_lonely_node_uses_bootstrap() {
        let network = LoopbackNetwork::new();
        let seed = node(&network, "S", 2, 10..20);
        let local = descriptor("N", 1);
        let directory = Arc::new(PeerDirectory::new(local.clone()));
        let settings = BroadcastSettings {
            default_ttl: 2,
            jitter_ms: 10..20,
            responder_pool_size: 1,
            bootstrap: vec![seed.directory.local().address],
        };
        let engine = BroadcastEngine::new(
            directory,
            Arc::new(network.datagram_endpoint(local.address)),
            settings,
            Arc::new(StatsTracker::new()),
        );
        engine.send(engine.envelope(BroadcastKind::Join)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seed.responder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_malformed_datagram_is_ignored() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "A", 1, 10..20);
        let responder: Arc<dyn BroadcastResponder> = a.responder.clone();
        a.engine
            .on_datagram(b"{\"schema\":1,\"kind\":\"bogus\"}", IpAddr::from([127, 0, 0, 5]), &responder)
            .await;
        assert_eq!(a.engine.pending_count(), 0);
        assert!(a.stats.get_stats().input_bytes > 0);
    }
}
