//! The transport facade. Orchestrates this node's role (Peer vs Relay),
//! filters addresses before they reach the dial or listen engines, and owns
//! the lifetimes of the dial engine, the listen engines it creates, and the
//! relay router when this node is a Relay.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::address::{Address, Pid};
use crate::config::{NodeType, TransportConfig};
use crate::connection::Connection;
use crate::dial::{DialEngine, DialOptions};
use crate::engine::PeerEngine;
use crate::error::{DialError, ListenError};
use crate::listen::{HttpListener, ListenEvent, SigListener};
use crate::router::RelayRouter;

/// Errors the facade itself can raise, in addition to bubbling up whatever
/// the dial/listen engine underneath it reports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Listen(#[from] ListenError),

    #[error("address rejected by filter: not a direct-family address, or a star address this node cannot serve")]
    FilteredOut,
}

/// A running listener, selected at construction: an `HttpListener` when the
/// announced address has no star marker (or signalling is disabled), a
/// `SigListener` when it does.
#[derive(Clone)]
pub enum Listener {
    Http(Arc<HttpListener>),
    Sig(Arc<SigListener>),
}

impl Listener {
    pub fn local_address(&self) -> Option<Address> {
        match self {
            Self::Http(listener) => listener.local_address(),
            Self::Sig(listener) => listener.local_address(),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Http(listener) => listener.close().await,
            Self::Sig(listener) => listener.close().await,
        }
    }
}

/// Construct one per node; it owns the single [`DialEngine`] (and, in Relay
/// role, the single [`RelayRouter`]) for the process, and tracks every
/// [`Listener`] it has created so [`Transport::close`] can tear them all down
/// together.
pub struct Transport {
    config: TransportConfig,
    engine: Arc<dyn PeerEngine>,
    dial: Arc<DialEngine>,
    router: Option<Arc<RelayRouter>>,
    self_pid: Pid,
    listeners: Mutex<Vec<Listener>>,
}

impl Transport {
    pub fn new(config: TransportConfig, self_pid: Pid, engine: Arc<dyn PeerEngine>) -> Arc<Self> {
        let router = (config.node_type == NodeType::Relay)
            .then(|| RelayRouter::new(config.seen_cache_ttl(), config.channel_closed_timeout()));
        let dial = Arc::new(DialEngine::new(
            engine.clone(),
            config.clone(),
            self_pid.clone(),
            router.clone(),
        ));

        Arc::new(Self {
            config,
            engine,
            dial,
            router,
            self_pid,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn role(&self) -> NodeType {
        self.config.node_type
    }

    pub fn self_pid(&self) -> &Pid {
        &self.self_pid
    }

    /// This node's relay router, present only when it was constructed in
    /// Relay role. Exposed mainly so tests can inspect routing-table state
    /// directly.
    pub fn relay_router(&self) -> Option<Arc<RelayRouter>> {
        self.router.clone()
    }

    /// Accepts only addresses whose protocol stack matches the "direct"
    /// family; if an address carries the "star" marker, additionally
    /// requires signalling to be enabled and, when `listening` is true,
    /// requires the embedded owner PID to equal the primary relay PID.
    pub fn filter<I>(&self, addrs: I, listening: bool) -> Vec<Address>
    where
        I: IntoIterator<Item = Address>,
    {
        addrs
            .into_iter()
            .filter(|addr| self.accepts(addr, listening))
            .collect()
    }

    fn accepts(&self, addr: &Address, listening: bool) -> bool {
        if !addr.is_direct() {
            return false;
        }
        if addr.is_star() {
            if !self.config.signalling_enabled {
                return false;
            }
            if listening && addr.owner_pid() != self.config.primary_relay_pid().as_ref() {
                return false;
            }
        }
        true
    }

    /// Registers the local listener that should answer inbound
    /// `ConnectRequest`s routed to this node through its primary relay. Only
    /// meaningful once a [`Listener::Sig`] has been created; the dial engine
    /// keeps this registration across primary `PeerSC` reopenings on its own.
    fn bind_incoming_sink(&self, sig: &Arc<SigListener>) {
        self.dial.set_incoming_sink(sig.clone());
    }

    #[instrument(skip(self, options), fields(target = %target))]
    pub async fn dial(&self, target: &Address, options: DialOptions) -> Result<Connection, TransportError> {
        if !self.accepts(target, false) {
            return Err(TransportError::FilteredOut);
        }
        Ok(self.dial.dial(target, options).await?)
    }

    /// Creates and starts a listener for `announce`: a [`Listener::Sig`]
    /// when signalling is enabled and `announce` carries the star marker, an
    /// HTTP listener bound to `bind_addr` otherwise. Returns once the
    /// listener is confirmed ready
    /// (bound, for HTTP; registered, for SC) or with the error that
    /// prevented it, plus a receiver of the listener's events.
    #[instrument(skip(self), fields(announce = %announce))]
    pub async fn create_listener(
        self: &Arc<Self>,
        bind_addr: SocketAddr,
        announce: Address,
    ) -> Result<(Listener, mpsc::UnboundedReceiver<ListenEvent>), TransportError> {
        if !self.accepts(&announce, true) {
            return Err(TransportError::FilteredOut);
        }

        let (listener, rx) = if self.config.signalling_enabled && announce.is_star() {
            let (sig, rx) = SigListener::new(self.engine.clone(), self.self_pid.clone());
            self.bind_incoming_sink(&sig);
            sig.announce(announce);
            (Listener::Sig(sig), rx)
        } else {
            let (http, rx) = HttpListener::with_close_timeout(
                self.engine.clone(),
                self.router.clone(),
                self.config.close_timeout(),
            );
            let (ready_tx, ready_rx) = oneshot::channel();
            let spawned = http.clone();
            tokio::spawn(async move {
                let _ = spawned.serve(bind_addr, announce, Some(ready_tx)).await;
            });
            match ready_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(ListenError::Io(std::io::Error::other(err)).into()),
                Err(_) => {
                    return Err(ListenError::Io(std::io::Error::other(
                        "listener task ended before reporting readiness",
                    ))
                    .into())
                }
            }
            (Listener::Http(http), rx)
        };

        self.listeners.lock().push(listener.clone());
        Ok((listener, rx))
    }

    /// Graceful close: closes every tracked listener (which in turn closes
    /// their tracked connections and, for a Relay's HTTP listener, empties
    /// its router's tables), then drops them.
    pub async fn close(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in &listeners {
            listener.close().await;
        }
    }
}
