use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use signal_wire::{SeenCache, SignalMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::Pid;
use crate::channel::{InboundMessage, ScKind, SignallingChannel};
use crate::error::RouterError;
use crate::health::ChannelHealthMonitor;

/// Tracks per-peer and peer-to-peer signalling channels and routes, forwards,
/// and floods signalling messages between them. Present on an HTTPListener
/// in Relay role; operates on any SC it has been given via
/// [`RelayRouter::attach`] or [`RelayRouter::track_relay`].
pub struct RelayRouter {
    peer_table: RwLock<HashMap<Pid, Arc<SignallingChannel>>>,
    relay_list: RwLock<Vec<Arc<SignallingChannel>>>,
    seen_cache: SeenCache,
    health: Arc<ChannelHealthMonitor>,
}

impl RelayRouter {
    /// `seen_cache_ttl` and `channel_closed_timeout` come from
    /// [`crate::config::TransportConfig`]; both fall back to their usual
    /// defaults via [`SeenCache::default`] /
    /// [`crate::health::CHANNEL_CLOSED_TIMEOUT`] when a caller wants those.
    pub fn new(seen_cache_ttl: Duration, channel_closed_timeout: Duration) -> Arc<Self> {
        let router = Arc::new(Self {
            peer_table: RwLock::new(HashMap::new()),
            relay_list: RwLock::new(Vec::new()),
            seen_cache: SeenCache::new(seen_cache_ttl),
            health: ChannelHealthMonitor::new(channel_closed_timeout),
        });

        let cleanup_router = router.clone();
        router
            .health
            .spawn(move |sc| cleanup_router.untrack(&sc));

        router
    }

    /// Registers `sc` with the router and spawns the task draining its
    /// inbound queue for the SC's lifetime — the per-SC state machine's
    /// `attached` state. Call [`RelayRouter::track_relay`] in addition for a
    /// `RelaySC` (the `relayed` state).
    pub fn attach(
        self: &Arc<Self>,
        sc: Arc<SignallingChannel>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        self.health.watch(sc.clone());
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(inbound_msg) = inbound.recv().await {
                router.handle_message(&sc, inbound_msg).await;
            }
            if sc.mark_cleaned_up() {
                router.untrack(&sc);
            }
        });
    }

    /// Adds `sc` to `relayList` — the `attached → relayed` transition for a
    /// `RelaySC`.
    pub fn track_relay(&self, sc: Arc<SignallingChannel>) {
        self.relay_list.write().push(sc);
    }

    async fn handle_message(self: &Arc<Self>, sc: &Arc<SignallingChannel>, inbound: InboundMessage) {
        let InboundMessage { raw, message } = inbound;
        match message {
            SignalMessage::JoinRequest { peer_id } => self.handle_join(sc, peer_id),
            other => self.forward(sc, &raw, &other).await,
        }
    }

    /// JoinRequest handling: on the first `JoinRequest{peerId}` on a
    /// `PeerSC`, set `peerTable[peerId] = sc` (newest registration wins). A
    /// `JoinRequest` on a `RelaySC` is a protocol violation: reported and
    /// dropped, never propagated.
    fn handle_join(&self, sc: &Arc<SignallingChannel>, peer_id: String) {
        match sc.kind() {
            ScKind::Relay => {
                warn!(error = %RouterError::JoinOnRelaySc, %peer_id, "dropping JoinRequest");
            }
            ScKind::Peer { .. } => {
                let pid = Pid::from(peer_id);
                debug!(%pid, "peer joined");
                self.peer_table.write().insert(pid, sc.clone());
            }
        }
    }

    /// Forwarding algorithm for any message other than `JoinRequest` arriving
    /// on `from`: dedup via the seen-cache, route directly if the
    /// destination has joined this relay, otherwise flood to every other
    /// known relay (first-hop loop prevention; the seen-cache kills deeper
    /// cycles).
    async fn forward(&self, from: &Arc<SignallingChannel>, raw: &[u8], message: &SignalMessage) {
        if self.seen_cache.observe(raw) {
            return;
        }

        let Some(dst) = message.dst() else {
            return;
        };

        if let Some(target) = self.peer_table.read().get(&Pid::from(dst)).cloned() {
            if let Err(err) = target.send_raw(raw.to_vec()).await {
                warn!(
                    error = %RouterError::ForwardFailed(dst.to_string(), err.to_string()),
                    "forward to peerTable entry failed"
                );
            }
            return;
        }

        let relays: Vec<_> = self
            .relay_list
            .read()
            .iter()
            .filter(|rsc| !Arc::ptr_eq(rsc, from))
            .cloned()
            .collect();

        for rsc in relays {
            if let Err(err) = rsc.send_raw(raw.to_vec()).await {
                warn!(
                    error = %RouterError::ForwardFailed(dst.to_string(), err.to_string()),
                    "forward across relayList failed, continuing fan-out"
                );
            }
        }
    }

    /// Untracking: removes `sc` from both tables. `closed` is terminal and
    /// releases all table entries.
    pub fn untrack(&self, sc: &Arc<SignallingChannel>) {
        self.peer_table.write().retain(|_, v| !Arc::ptr_eq(v, sc));
        self.relay_list.write().retain(|v| !Arc::ptr_eq(v, sc));
    }

    pub fn peer_count(&self) -> usize {
        self.peer_table.read().len()
    }

    pub fn relay_count(&self) -> usize {
        self.relay_list.read().len()
    }

    pub fn find_peer(&self, pid: &Pid) -> Option<Arc<SignallingChannel>> {
        self.peer_table.read().get(pid).cloned()
    }

    pub fn close(&self) {
        self.health.stop();
        self.peer_table.write().clear();
        self.relay_list.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopEngine;
    use signal_wire::{Signal, SignalKind};
    use tokio::time::{timeout, Duration};

    /// Attaches one half of an in-memory channel pair to `router`, returning
    /// the attached (relay-side) handle plus the peer-side handle and its
    /// inbound receiver, so tests can both send as the peer and observe
    /// whatever the router forwards back to it.
    fn attached_pair(
        router: &Arc<RelayRouter>,
        kind: ScKind,
    ) -> (Arc<SignallingChannel>, Arc<SignallingChannel>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (a, b) = LoopEngine::connected_pair();
        let (sc, inbound) = SignallingChannel::spawn(kind.clone(), a);
        router.attach(sc.clone(), inbound);
        let (peer_sc, peer_inbound) = SignallingChannel::spawn(kind, b);
        (sc, peer_sc, peer_inbound)
    }

    async fn join(sc: &Arc<SignallingChannel>, peer_id: &str) {
        sc.send_message(&SignalMessage::JoinRequest { peer_id: peer_id.to_string() })
            .await
            .unwrap();
        // The router drains its inbound queue on a background task; give it
        // a tick to process the JoinRequest before asserting on peer_table.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn join_request_registers_peer_table_entry() {
        let router = RelayRouter::new(Duration::from_secs(30), Duration::from_secs(5));
        let (_relay_side, peer_side, _inbound) = attached_pair(&router, ScKind::Peer { remote_pid: None });

        join(&peer_side, "P1").await;

        assert_eq!(router.peer_count(), 1);
        assert!(router.find_peer(&Pid::new("P1")).is_some());
    }

    #[tokio::test]
    async fn newest_join_request_wins_for_the_same_pid() {
        let router = RelayRouter::new(Duration::from_secs(30), Duration::from_secs(5));
        let (_first_relay_side, first_peer_side, _first_inbound) =
            attached_pair(&router, ScKind::Peer { remote_pid: None });
        let (second_relay_side, second_peer_side, _second_inbound) =
            attached_pair(&router, ScKind::Peer { remote_pid: None });

        join(&first_peer_side, "P1").await;
        join(&second_peer_side, "P1").await;

        let routed = router.find_peer(&Pid::new("P1")).unwrap();
        assert!(Arc::ptr_eq(&routed, &second_relay_side));
    }

    #[tokio::test]
    async fn join_request_on_relay_sc_is_dropped_not_routed() {
        let router = RelayRouter::new(Duration::from_secs(30), Duration::from_secs(5));
        let (_relay_side, peer_side, _inbound) = attached_pair(&router, ScKind::Relay);

        join(&peer_side, "P1").await;

        assert_eq!(router.peer_count(), 0);
    }

    #[tokio::test]
    async fn forwards_directly_to_a_known_peer_table_entry() {
        let router = RelayRouter::new(Duration::from_secs(30), Duration::from_secs(5));
        let (_p1_relay_side, p1_peer_side, _p1_inbound) =
            attached_pair(&router, ScKind::Peer { remote_pid: None });
        let (_p2_relay_side, p2_peer_side, mut p2_inbound) =
            attached_pair(&router, ScKind::Peer { remote_pid: None });

        join(&p2_peer_side, "P2").await;

        let offer = SignalMessage::ConnectRequest {
            src: "P1".to_string(),
            dst: "P2".to_string(),
            signal: Signal { kind: SignalKind::Offer, payload: vec![1, 2, 3] },
        };
        p1_peer_side.send_message(&offer).await.unwrap();

        let forwarded = timeout(Duration::from_secs(1), p2_inbound.recv())
            .await
            .expect("forward did not arrive within timeout")
            .expect("inbound channel closed");
        assert_eq!(forwarded.message, offer);
    }

    #[tokio::test]
    async fn floods_to_relay_list_excluding_the_sender_when_destination_unknown() {
        let router = RelayRouter::new(Duration::from_secs(30), Duration::from_secs(5));
        let (from_relay_side, from_peer_side, mut from_inbound) = attached_pair(&router, ScKind::Relay);
        router.track_relay(from_relay_side);

        let (neighbour_relay_side, _neighbour_peer_side, mut neighbour_inbound) =
            attached_pair(&router, ScKind::Relay);
        router.track_relay(neighbour_relay_side);

        assert_eq!(router.relay_count(), 2);

        let request = SignalMessage::ConnectRequest {
            src: "P1".to_string(),
            dst: "NOWHERE".to_string(),
            signal: Signal { kind: SignalKind::Offer, payload: vec![9] },
        };
        from_peer_side.send_message(&request).await.unwrap();

        let flooded = timeout(Duration::from_secs(1), neighbour_inbound.recv())
            .await
            .expect("flood did not reach the only other relay within timeout")
            .expect("inbound channel closed");
        assert_eq!(flooded.message, request);

        // First-hop loop prevention: `from`'s own SC must not receive its
        // own flood echoed back.
        assert!(timeout(Duration::from_millis(100), from_inbound.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn untrack_removes_sc_from_both_tables() {
        let router = RelayRouter::new(Duration::from_secs(30), Duration::from_secs(5));
        let (relay_side, peer_side, _inbound) = attached_pair(&router, ScKind::Peer { remote_pid: None });
        join(&peer_side, "P1").await;
        assert_eq!(router.peer_count(), 1);

        router.untrack(&relay_side);
        assert_eq!(router.peer_count(), 0);
    }

    #[tokio::test]
    async fn close_clears_both_tables_and_stops_health_monitor() {
        let router = RelayRouter::new(Duration::from_secs(30), Duration::from_secs(5));
        let (_relay_side, peer_side, _inbound) = attached_pair(&router, ScKind::Peer { remote_pid: None });
        join(&peer_side, "P1").await;

        router.close();
        assert_eq!(router.peer_count(), 0);
        assert_eq!(router.relay_count(), 0);
    }
}
