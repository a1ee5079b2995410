//! An in-memory stand-in for the peer engine, used only by this workspace's
//! own tests. Not part of the published API surface in spirit — downstream
//! crates bring their own `PeerEngine` implementation — but kept as a
//! regular public module so integration tests under `tests/` can reach it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use signal_wire::{Signal, SignalKind};

use crate::engine::{
    ChannelReceiver, ChannelSender, ChannelState, DataChannel, EngineError, EngineEvent,
    EngineOptions, PeerEngine, PeerSession,
};

struct MpscSender {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl ChannelSender for MpscSender {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::from("channel closed"));
        }
        self.tx
            .as_ref()
            .ok_or_else(|| EngineError::from("channel closed"))?
            .send(bytes)
            .map_err(|_| EngineError::from("channel closed"))
    }

    fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::SeqCst) {
            ChannelState::Closed
        } else {
            ChannelState::Open
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MpscReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelReceiver for MpscReceiver {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Builds one connected, in-memory duplex channel pair.
pub fn loop_channel_pair() -> (DataChannel, DataChannel) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();

    let a = DataChannel {
        tx: Box::new(MpscSender {
            tx: Some(tx_a),
            closed: Arc::new(AtomicBool::new(false)),
        }),
        rx: Box::new(MpscReceiver { rx: rx_a }),
    };
    let b = DataChannel {
        tx: Box::new(MpscSender {
            tx: Some(tx_b),
            closed: Arc::new(AtomicBool::new(false)),
        }),
        rx: Box::new(MpscReceiver { rx: rx_b }),
    };
    (a, b)
}

struct PendingHandshake {
    app_peer_half: Option<DataChannel>,
    sc_peer_half: Option<DataChannel>,
}

/// Rendezvous point for [`LoopSession`]s. Initiator and receiver sessions
/// find each other through the offer's payload, which this mock uses purely
/// as a handshake id — never interpreted by production dial/listen code,
/// which treats `Signal::payload` as opaque bytes throughout.
#[derive(Default)]
pub struct LoopEngine {
    pending: Mutex<HashMap<u64, PendingHandshake>>,
    counter: AtomicU64,
    self_weak: Mutex<Weak<LoopEngine>>,
}

impl LoopEngine {
    pub fn new() -> Arc<Self> {
        let engine = Arc::new(Self::default());
        *engine.self_weak.lock() = Arc::downgrade(&engine);
        engine
    }

    /// Convenience for tests that only need two bare connected channels,
    /// without going through the initiator/receiver handshake.
    pub fn connected_pair() -> (DataChannel, DataChannel) {
        loop_channel_pair()
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn strong_self(&self) -> Arc<LoopEngine> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("LoopEngine dropped while a session was still being created")
    }
}

enum Role {
    Initiator,
    Receiver,
}

pub struct LoopSession {
    engine: Arc<LoopEngine>,
    id: Option<u64>,
    role: Role,
    app_dc: Option<DataChannel>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl PeerSession for LoopSession {
    async fn feed_signal(&mut self, signal: Signal) -> Result<(), EngineError> {
        match self.role {
            Role::Initiator => {
                if signal.kind == SignalKind::Answer {
                    let _ = self.events_tx.send(EngineEvent::Ready);
                }
                Ok(())
            }
            Role::Receiver => {
                if !signal.is_offer() {
                    return Ok(());
                }
                let id = u64::from_le_bytes(
                    signal.payload[..8]
                        .try_into()
                        .map_err(|_| EngineError::from("malformed handshake payload"))?,
                );
                let app_peer_half = {
                    let mut pending = self.engine.pending_lock();
                    let entry = pending.entry(id).or_insert_with(|| PendingHandshake {
                        app_peer_half: None,
                        sc_peer_half: None,
                    });
                    entry.app_peer_half.take()
                };
                self.app_dc = app_peer_half;
                self.id = Some(id);
                let _ = self
                    .events_tx
                    .send(EngineEvent::LocalSignal(Signal {
                        kind: SignalKind::Answer,
                        payload: signal.payload,
                    }));
                let _ = self.events_tx.send(EngineEvent::Ready);
                Ok(())
            }
        }
    }

    async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    async fn create_data_channel(&mut self) -> Result<DataChannel, EngineError> {
        let id = self
            .id
            .ok_or_else(|| EngineError::from("no handshake in progress"))?;
        let mut pending = self.engine.pending_lock();
        let entry = pending.entry(id).or_insert_with(|| PendingHandshake {
            app_peer_half: None,
            sc_peer_half: None,
        });
        if let Some(peer_half) = entry.sc_peer_half.take() {
            return Ok(peer_half);
        }
        let (mine, theirs) = loop_channel_pair();
        entry.sc_peer_half = Some(theirs);
        Ok(mine)
    }

    fn take_application_channel(&mut self) -> Option<DataChannel> {
        self.app_dc.take()
    }

    async fn close(&mut self) {
        if let Some(mut dc) = self.app_dc.take() {
            dc.tx.close().await;
        }
    }
}

impl LoopEngine {
    fn pending_lock(&self) -> parking_lot::MutexGuard<'_, HashMap<u64, PendingHandshake>> {
        self.pending.lock()
    }
}

impl PeerEngine for LoopEngine {
    async fn create_initiator(
        &self,
        _options: EngineOptions,
    ) -> Result<Box<dyn PeerSession>, EngineError> {
        let id = self.next_id();
        let (app_self, app_peer) = loop_channel_pair();
        self.pending_lock().insert(
            id,
            PendingHandshake {
                app_peer_half: Some(app_peer),
                sc_peer_half: None,
            },
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(EngineEvent::LocalSignal(Signal {
            kind: SignalKind::Offer,
            payload: id.to_le_bytes().to_vec(),
        }));

        Ok(Box::new(LoopSession {
            engine: self.strong_self(),
            id: Some(id),
            role: Role::Initiator,
            app_dc: Some(app_self),
            events: events_rx,
            events_tx,
        }))
    }

    async fn create_receiver(
        &self,
        _options: EngineOptions,
    ) -> Result<Box<dyn PeerSession>, EngineError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Box::new(LoopSession {
            engine: self.strong_self(),
            id: None,
            role: Role::Receiver,
            app_dc: None,
            events: events_rx,
            events_tx,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initiator_and_receiver_reach_ready_and_share_app_channel() {
        let engine = LoopEngine::new();
        let mut initiator = engine.create_initiator(EngineOptions::default()).await.unwrap();
        let mut receiver = engine.create_receiver(EngineOptions::default()).await.unwrap();

        let offer = match initiator.next_event().await.unwrap() {
            EngineEvent::LocalSignal(signal) => signal,
            other => panic!("expected LocalSignal, got {other:?}"),
        };

        receiver.feed_signal(offer).await.unwrap();
        let answer = match receiver.next_event().await.unwrap() {
            EngineEvent::LocalSignal(signal) => signal,
            other => panic!("expected LocalSignal, got {other:?}"),
        };
        assert!(matches!(
            receiver.next_event().await,
            Some(EngineEvent::Ready)
        ));

        initiator.feed_signal(answer).await.unwrap();
        assert!(matches!(
            initiator.next_event().await,
            Some(EngineEvent::Ready)
        ));

        let mut initiator_dc = initiator.take_application_channel().unwrap();
        let mut receiver_dc = receiver.take_application_channel().unwrap();

        initiator_dc.tx.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(receiver_dc.rx.recv().await, Some(b"hello".to_vec()));
    }
}
