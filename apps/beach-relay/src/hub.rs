//! The registry of live connections.
//!
//! A single task owns the live set. Admission, eviction, fan-out and
//! snapshots all arrive as commands on one mailbox and are applied one at a
//! time, so membership changes are linearized with broadcasts and commands
//! from any one producer are applied in the order it sent them.

use std::{collections::HashMap, sync::Arc};

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    admission::{AdmissionError, AdmissionPolicy, AdmissionRequest, AlwaysAdmit},
    connection::{ConnectionId, EnqueueError, Outbound, Payload},
};

const MAILBOX_DEPTH: usize = 64;

enum Command {
    Register { id: ConnectionId, outbound: Outbound },
    Unregister(ConnectionId),
    Dispatch(Payload),
    Snapshot(oneshot::Sender<HubSnapshot>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub admitted: u64,
    /// Every removal from the live set, for any reason.
    pub evicted: u64,
    pub backpressure_evictions: u64,
    pub dispatched: u64,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub live: usize,
    pub members: Vec<ConnectionId>,
    pub stats: HubStats,
}

pub struct Hub {
    live: HashMap<ConnectionId, Outbound>,
    mailbox: mpsc::Receiver<Command>,
    stats: HubStats,
}

/// Cloneable front door to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    mailbox: mpsc::Sender<Command>,
    admission: Arc<dyn AdmissionPolicy>,
}

impl Hub {
    pub fn new(admission: Arc<dyn AdmissionPolicy>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let hub = Self {
            live: HashMap::new(),
            mailbox: rx,
            stats: HubStats::default(),
        };
        (
            hub,
            HubHandle {
                mailbox: tx,
                admission,
            },
        )
    }

    /// Starts the event loop on the current runtime.
    pub fn spawn(admission: Arc<dyn AdmissionPolicy>) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(admission);
        (handle, tokio::spawn(hub.run()))
    }

    /// A running hub that admits every peer.
    pub fn spawn_default() -> HubHandle {
        Self::spawn(Arc::new(AlwaysAdmit)).0
    }

    /// Runs until every [`HubHandle`] is gone.
    pub async fn run(mut self) {
        info!("hub event loop started");
        while let Some(command) = self.mailbox.recv().await {
            match command {
                Command::Register { id, outbound } => self.register(id, outbound),
                Command::Unregister(id) => self.unregister(id),
                Command::Dispatch(payload) => self.dispatch(payload),
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        info!(live = self.live.len(), "hub event loop stopped");
    }

    fn register(&mut self, id: ConnectionId, outbound: Outbound) {
        if self.live.insert(id, outbound).is_some() {
            warn!(connection_id = %id, "connection registered twice; replaced queue");
        } else {
            self.stats.admitted += 1;
            counter!("beach_relay_connections_admitted_total").increment(1);
        }
        debug!(connection_id = %id, live = self.live.len(), "connection admitted");
        self.record_live();
    }

    fn unregister(&mut self, id: ConnectionId) {
        // Dropping the outbound handle closes the queue; the writer drains
        // what is left and stops.
        if self.live.remove(&id).is_some() {
            self.stats.evicted += 1;
            counter!("beach_relay_connections_evicted_total", "reason" => "closed").increment(1);
            debug!(connection_id = %id, live = self.live.len(), "connection evicted");
            self.record_live();
        }
    }

    fn dispatch(&mut self, payload: Payload) {
        let mut delivered = 0u64;
        let mut full = 0u64;
        let mut closed = 0u64;

        self.live
            .retain(|id, outbound| match outbound.try_enqueue(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(EnqueueError::Full) => {
                    warn!(connection_id = %id, "outbound queue full; evicting slow peer");
                    full += 1;
                    false
                }
                Err(EnqueueError::Closed) => {
                    debug!(connection_id = %id, "writer gone; evicting connection");
                    closed += 1;
                    false
                }
            });

        self.stats.dispatched += 1;
        self.stats.deliveries += delivered;
        self.stats.evicted += full + closed;
        self.stats.backpressure_evictions += full;

        counter!("beach_relay_payloads_dispatched_total").increment(1);
        counter!("beach_relay_deliveries_total").increment(delivered);
        if full > 0 {
            counter!("beach_relay_backpressure_evictions_total").increment(full);
            counter!("beach_relay_connections_evicted_total", "reason" => "backpressure")
                .increment(full);
        }
        if closed > 0 {
            counter!("beach_relay_connections_evicted_total", "reason" => "writer_gone")
                .increment(closed);
        }
        if full + closed > 0 {
            self.record_live();
        }
    }

    fn snapshot(&self) -> HubSnapshot {
        let mut members: Vec<ConnectionId> = self.live.keys().copied().collect();
        members.sort();
        HubSnapshot {
            live: members.len(),
            members,
            stats: self.stats,
        }
    }

    fn record_live(&self) {
        gauge!("beach_relay_connections_live").set(self.live.len() as f64);
    }
}

impl HubHandle {
    /// Runs the configured admission policy. Call before upgrading a peer.
    pub async fn authorize(&self, request: &AdmissionRequest) -> Result<(), AdmissionError> {
        self.admission.admit(request).await
    }

    /// Fire-and-forget: the connection becomes a broadcast target once the
    /// hub processes the command.
    pub async fn admit(&self, id: ConnectionId, outbound: Outbound) {
        self.send(Command::Register { id, outbound }).await;
    }

    /// Removes the connection and closes its queue. A no-op for non-members.
    pub async fn evict(&self, id: ConnectionId) {
        self.send(Command::Unregister(id)).await;
    }

    /// Fans `payload` out to every connection live when the hub handles it,
    /// the sender included.
    pub async fn dispatch(&self, payload: Payload) {
        self.send(Command::Dispatch(payload)).await;
    }

    /// `None` when the hub task has stopped.
    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (reply, response) = oneshot::channel();
        if self.mailbox.send(Command::Snapshot(reply)).await.is_err() {
            return None;
        }
        response.await.ok()
    }

    async fn send(&self, command: Command) {
        if self.mailbox.send(command).await.is_err() {
            debug!("hub stopped; command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{outbound_queue, OutboundQueue};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::collections::BTreeSet;

    async fn join(hub: &HubHandle, capacity: usize) -> (ConnectionId, OutboundQueue) {
        let id = ConnectionId::new();
        let (outbound, queue) = outbound_queue(capacity);
        hub.admit(id, outbound).await;
        (id, queue)
    }

    async fn snapshot(hub: &HubHandle) -> HubSnapshot {
        hub.snapshot().await.expect("hub running")
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_reaches_every_peer_including_sender() {
        let hub = Hub::spawn_default();
        let (_, mut a) = join(&hub, 8).await;
        let (_, mut b) = join(&hub, 8).await;
        let (_, mut c) = join(&hub, 8).await;

        // A's reader would dispatch this; the hub does not know the origin.
        hub.dispatch(Payload::text("offer:1")).await;
        let snap = snapshot(&hub).await;
        assert_eq!(snap.live, 3);
        assert_eq!(snap.stats.deliveries, 3);

        for queue in [&mut a, &mut b, &mut c] {
            assert_eq!(
                queue.recv_batch().await,
                Some(vec![Payload::text("offer:1")])
            );
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_queue_is_evicted_within_the_same_dispatch() {
        let hub = Hub::spawn_default();
        let (fast_id, mut fast) = join(&hub, 8).await;
        let (slow_id, mut slow) = join(&hub, 1).await;

        hub.dispatch(Payload::text("offer:1")).await;
        hub.dispatch(Payload::text("answer:1")).await;
        let snap = snapshot(&hub).await;

        assert_eq!(snap.members, vec![fast_id]);
        assert!(!snap.members.contains(&slow_id));
        assert_eq!(snap.stats.backpressure_evictions, 1);
        assert_eq!(snap.stats.evicted, 1);
        assert_eq!(snap.stats.deliveries, 3);

        assert_eq!(
            fast.recv_batch().await,
            Some(vec![Payload::text("offer:1"), Payload::text("answer:1")])
        );
        // the slow peer keeps what was queued before eviction, then sees closure
        assert_eq!(slow.recv_batch().await, Some(vec![Payload::text("offer:1")]));
        assert_eq!(slow.recv_batch().await, None);

        hub.dispatch(Payload::text("candidate:1")).await;
        assert_eq!(snapshot(&hub).await.stats.deliveries, 4);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dead_writer_is_evicted_on_next_dispatch() {
        let hub = Hub::spawn_default();
        let (_, queue) = join(&hub, 8).await;
        drop(queue);

        hub.dispatch(Payload::text("offer:1")).await;
        let snap = snapshot(&hub).await;
        assert_eq!(snap.live, 0);
        assert_eq!(snap.stats.evicted, 1);
        assert_eq!(snap.stats.backpressure_evictions, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn evict_is_idempotent() {
        let hub = Hub::spawn_default();
        let (id, mut queue) = join(&hub, 8).await;
        let (other, _other_queue) = join(&hub, 8).await;

        hub.evict(id).await;
        let once = snapshot(&hub).await;
        hub.evict(id).await;
        let twice = snapshot(&hub).await;

        assert_eq!(once.members, vec![other]);
        assert_eq!(twice.members, once.members);
        assert_eq!(twice.stats, once.stats);
        assert_eq!(queue.recv_batch().await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn evicting_unknown_connection_is_a_no_op() {
        let hub = Hub::spawn_default();
        hub.evict(ConnectionId::new()).await;
        let snap = snapshot(&hub).await;
        assert_eq!(snap.live, 0);
        assert_eq!(snap.stats, HubStats::default());
    }

    #[test_timeout::tokio_timeout_test]
    async fn dispatch_with_no_members_is_counted_but_delivers_nothing() {
        let hub = Hub::spawn_default();
        hub.dispatch(Payload::binary(vec![1u8, 2, 3])).await;
        let snap = snapshot(&hub).await;
        assert_eq!(snap.stats.dispatched, 1);
        assert_eq!(snap.stats.deliveries, 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn concurrent_membership_changes_settle_to_sequential_result() {
        let hub = Hub::spawn_default();
        let mut producers = Vec::new();

        for _ in 0..16 {
            let hub = hub.clone();
            producers.push(tokio::spawn(async move {
                let mut kept = Vec::new();
                let mut queues: Vec<OutboundQueue> = Vec::new();
                for n in 0..32 {
                    // roomy enough for every dispatch in the test, so nobody
                    // is evicted for backpressure
                    let (id, queue) = join(&hub, 16 * 32).await;
                    if n % 2 == 0 {
                        hub.evict(id).await;
                    } else {
                        kept.push(id);
                        queues.push(queue);
                    }
                    hub.dispatch(Payload::text(format!("tick:{n}"))).await;
                }
                (kept, queues)
            }));
        }

        let mut expected = BTreeSet::new();
        let mut held = Vec::new();
        for producer in producers {
            let (kept, queues) = producer.await.unwrap();
            expected.extend(kept);
            held.push(queues);
        }

        let snap = snapshot(&hub).await;
        let members: BTreeSet<ConnectionId> = snap.members.into_iter().collect();
        assert_eq!(members, expected);
        assert_eq!(snap.stats.admitted, 16 * 32);
        assert_eq!(snap.stats.evicted, 16 * 16);
        assert_eq!(snap.stats.dispatched, 16 * 32);
    }

    #[test_timeout::timeout]
    fn hub_metrics_reach_the_prometheus_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let (mut hub, _handle) = Hub::new(Arc::new(AlwaysAdmit));
            let (outbound, _queue) = outbound_queue(8);
            hub.register(ConnectionId::new(), outbound);
            hub.dispatch(Payload::text("offer:1"));
        });

        let rendered = handle.render();
        assert!(rendered.contains("beach_relay_connections_admitted_total 1"), "{rendered}");
        assert!(rendered.contains("beach_relay_payloads_dispatched_total 1"), "{rendered}");
        assert!(rendered.contains("beach_relay_deliveries_total 1"), "{rendered}");
        assert!(rendered.contains("beach_relay_connections_live"), "{rendered}");
    }

    #[test_timeout::tokio_timeout_test]
    async fn snapshot_reports_stopped_hub() {
        let (hub, handle) = Hub::new(Arc::new(AlwaysAdmit));
        drop(hub);
        assert!(handle.snapshot().await.is_none());
    }
}
