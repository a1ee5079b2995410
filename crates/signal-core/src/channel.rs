use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use signal_wire::{decode_message, SignalMessage};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::address::Pid;
use crate::engine::{ChannelSender, ChannelState, DataChannel, EngineError};

/// Which of the two roles a signalling channel connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScKind {
    /// Connects a Peer to its Relay. `remote_pid` is known up front when
    /// this node is the one dialing out; on the accepting side it is
    /// unknown until the first `JoinRequest` arrives, so it starts `None`.
    Peer { remote_pid: Option<Pid> },
    /// Connects two Relay nodes.
    Relay,
}

/// A decoded inbound signalling message together with the exact bytes it
/// was decoded from. Routers must forward `raw` unchanged, never a
/// re-serialised form, so the seen-cache digest matches across every hop.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub raw: Vec<u8>,
    pub message: SignalMessage,
}

/// An auxiliary data channel carrying [`SignalMessage`]s.
///
/// Sending is multi-writer (an async mutex guards the underlying sender so
/// dial/listen/router code can all hold a clone of the `Arc`); receiving is
/// single-reader by construction — [`SignallingChannel::spawn`] consumes the
/// receive half into a background pump task and hands back an mpsc receiver
/// of decoded messages instead of the raw channel.
pub struct SignallingChannel {
    kind: ScKind,
    sender: Mutex<Box<dyn ChannelSender>>,
    state: RwLock<ChannelState>,
    cleaned_up: AtomicBool,
}

impl SignallingChannel {
    /// Spawns the pump task owning `channel.rx` and returns the channel
    /// handle plus a receiver of messages successfully decoded from it.
    /// The receiver yields `None` once the underlying stream ends — the
    /// owner (dial engine, router, or listener) treats that as the SC's
    /// close handler and must perform its own table cleanup, then call
    /// [`SignallingChannel::mark_cleaned_up`].
    ///
    /// Decode failures are logged and dropped, never surfaced to the
    /// caller: a malformed message must not crash the listener.
    pub fn spawn(
        kind: ScKind,
        channel: DataChannel,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let sc = Arc::new(Self {
            kind,
            sender: Mutex::new(channel.tx),
            state: RwLock::new(ChannelState::Open),
            cleaned_up: AtomicBool::new(false),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let pump_sc = sc.clone();
        tokio::spawn(async move {
            let mut rx = channel.rx;
            while let Some(raw) = rx.recv().await {
                match decode_message(&raw) {
                    Ok(message) => {
                        if out_tx.send(InboundMessage { raw, message }).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "dropping malformed signalling message"),
                }
            }
            debug!("signalling channel receive loop ended");
            *pump_sc.state.write() = ChannelState::Closed;
        });

        (sc, out_rx)
    }

    pub fn kind(&self) -> &ScKind {
        &self.kind
    }

    /// The last state observed by the receive pump (`Open` until the
    /// underlying stream ends, then `Closed`).
    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The engine's own, independently reported state — polled by the
    /// health monitor, since the whole point of that monitor is that this
    /// can report `Closed` without the receive stream ever ending.
    pub async fn engine_reported_state(&self) -> ChannelState {
        self.sender.lock().await.state()
    }

    /// Atomically claims responsibility for this SC's cleanup. Returns
    /// `true` exactly once, to whichever caller — the normal close-handler
    /// path or the periodic health check — observes closure first.
    pub fn mark_cleaned_up(&self) -> bool {
        self.cleaned_up
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.sender.lock().await.send(bytes).await
    }

    pub async fn send_message(&self, message: &SignalMessage) -> Result<(), EngineError> {
        let bytes = signal_wire::encode_message(message);
        self.send_raw(bytes).await
    }

    pub async fn close(&self) {
        self.sender.lock().await.close().await;
        *self.state.write() = ChannelState::Closed;
    }
}
