use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::Deserialize;
use signal_wire::{decode_signal_base58, encode_signal_base58, Signal, SignalMessage};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, instrument, warn};

use crate::address::{Address, Pid};
use crate::channel::{InboundMessage, ScKind, SignallingChannel};
use crate::connection::Connection;
use crate::dial::IncomingSignalling;
use crate::engine::{EngineEvent, EngineOptions, PeerEngine};
use crate::error::ListenError;
use crate::rendezvous::Rendezvous;
use crate::router::RelayRouter;

/// Wait limit for a graceful `close()`.
pub const CLOSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Events emitted by a running listener.
pub enum ListenEvent {
    Listening(Address),
    Connection(Connection),
    Close,
}

impl std::fmt::Debug for ListenEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening(addr) => f.debug_tuple("Listening").field(addr).finish(),
            Self::Connection(conn) => f
                .debug_tuple("Connection")
                .field(&conn.remote_address)
                .finish(),
            Self::Close => write!(f, "Close"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OfferQuery {
    signal: Option<String>,
    signalling_channel: Option<String>,
}

fn malformed_request() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "malformed request").into_response()
}

fn ok_with_body(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response()
}

/// HTTP variant: accepts offers over a short HTTP request and answers them,
/// optionally also accepting a signalling channel used either by the dial
/// engine (to register this node's primary `PeerSC`) or, in Relay role, by
/// the relay router (an inbound `RelaySC`).
pub struct HttpListener {
    engine: Arc<dyn PeerEngine>,
    router: Option<Arc<RelayRouter>>,
    events: mpsc::UnboundedSender<ListenEvent>,
    /// Remote addresses of connections established through this listener,
    /// kept only for accounting: the list must go empty shortly after a
    /// tracked connection closes. `Connection` itself is not `Clone` — it
    /// owns the live application channel, which is surrendered whole to the
    /// inbound-connection upgrader at emit time; actually tearing down the
    /// channel on `close()` is that collaborator's job.
    connections: RwLock<Vec<Address>>,
    cancel: CancellationToken,
    local_addr: RwLock<Option<Address>>,
    close_timeout: Duration,
    done: RwLock<Option<oneshot::Receiver<()>>>,
}

impl HttpListener {
    pub fn new(
        engine: Arc<dyn PeerEngine>,
        router: Option<Arc<RelayRouter>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ListenEvent>) {
        Self::with_close_timeout(engine, router, CLOSE_TIMEOUT)
    }

    /// `close_timeout` is the configured wait limit before
    /// [`HttpListener::close`] forces teardown (`close_timeout_secs` in
    /// [`crate::config::TransportConfig`], default [`CLOSE_TIMEOUT`]).
    pub fn with_close_timeout(
        engine: Arc<dyn PeerEngine>,
        router: Option<Arc<RelayRouter>>,
        close_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ListenEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            engine,
            router,
            events,
            connections: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            local_addr: RwLock::new(None),
            close_timeout,
            done: RwLock::new(None),
        });
        (listener, rx)
    }

    pub fn local_address(&self) -> Option<Address> {
        self.local_addr.read().clone()
    }

    /// Binds `bind_addr` and serves the HTTP offer/answer endpoint until
    /// [`HttpListener::close`] is called. `announce` is the multi-address
    /// this listener reports via the `Listening` event — callers typically
    /// derive it from the bound socket plus their own PID.
    #[instrument(skip(self), fields(bind = %bind_addr))]
    pub async fn listen(self: &Arc<Self>, bind_addr: SocketAddr, announce: Address) -> Result<(), ListenError> {
        self.serve(bind_addr, announce, None).await
    }

    /// Same as [`HttpListener::listen`], but reports the outcome of the
    /// initial bind on `ready` before driving the server to completion.
    /// Used by [`crate::facade::Transport::create_listener`] so it can await
    /// a confirmed bind (or propagate a bind failure) before returning,
    /// without blocking on the server's entire lifetime.
    pub(crate) async fn serve(
        self: &Arc<Self>,
        bind_addr: SocketAddr,
        announce: Address,
        ready: Option<oneshot::Sender<Result<(), String>>>,
    ) -> Result<(), ListenError> {
        let tcp = match TcpListener::bind(bind_addr).await {
            Ok(tcp) => tcp,
            Err(err) => {
                if let Some(ready) = ready {
                    let _ = ready.send(Err(err.to_string()));
                }
                return Err(err.into());
            }
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        let app = Router::new()
            .route("/", get(handle_offer))
            .layer(cors)
            .with_state(self.clone());

        *self.local_addr.write() = Some(announce.clone());
        let _ = self.events.send(ListenEvent::Listening(announce));
        if let Some(ready) = ready {
            let _ = ready.send(Ok(()));
        }

        let (done_tx, done_rx) = oneshot::channel();
        *self.done.write() = Some(done_rx);

        let cancel = self.cancel.clone();
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(tcp, make_service)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        let _ = done_tx.send(());
        result?;

        Ok(())
    }

    fn emit_connection(&self, connection: Connection) {
        let _ = self.events.send(ListenEvent::Connection(connection));
    }

    fn track(&self, remote_address: Address) {
        self.connections.write().push(remote_address);
    }

    /// Number of connections currently tracked.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Graceful close: stops the HTTP server, closes tracked connections,
    /// and — if this listener owns a relay router — clears its tables.
    /// Bounds the wait for the server to actually report stopped at
    /// `close_timeout` before forcing ahead regardless.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(router) = &self.router {
            router.close();
        }
        self.connections.write().clear();

        if let Some(done) = self.done.write().take() {
            if tokio::time::timeout(self.close_timeout, done).await.is_err() {
                warn!("HTTP server did not report stopped within close_timeout, forcing ahead");
            }
        }

        let _ = self.events.send(ListenEvent::Close);
    }
}

async fn handle_offer(
    State(state): State<Arc<HttpListener>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<OfferQuery>,
) -> Response {
    let Some(signal_param) = query.signal.as_deref() else {
        return malformed_request();
    };

    let signal = match decode_signal_base58(signal_param) {
        Ok(signal) => signal,
        Err(err) => {
            warn!(%err, "malformed signal in HTTP offer, rejecting request");
            return malformed_request();
        }
    };

    if !signal.is_offer() {
        return ok_with_body(String::new());
    }

    let sc_tag = query.signalling_channel.as_deref().unwrap_or("none").to_string();

    let mut session = match state.engine.create_receiver(EngineOptions::default()).await {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "peer engine failed to create a receiver session");
            return malformed_request();
        }
    };

    if let Err(err) = session.feed_signal(signal).await {
        error!(%err, "peer engine rejected the inbound offer");
        return malformed_request();
    }

    let answer = loop {
        match session.next_event().await {
            Some(EngineEvent::LocalSignal(signal)) => break Some(signal),
            Some(EngineEvent::Ready) => continue,
            Some(EngineEvent::Error(err)) => {
                warn!(%err, "engine error before an answer was produced");
                break None;
            }
            None => break None,
        }
    };

    let body = match &answer {
        Some(signal) => encode_signal_base58(signal),
        None => String::new(),
    };

    if answer.is_some() {
        let state = state.clone();
        tokio::spawn(async move {
            finish_connection(state, session, remote, sc_tag).await;
        });
    }

    ok_with_body(body)
}

/// Drives the remainder of connection setup after the HTTP response has
/// already been written: waits for `ready`, optionally opens the auxiliary
/// SC, and only then tracks and emits the connection.
async fn finish_connection(
    state: Arc<HttpListener>,
    mut session: Box<dyn crate::engine::PeerSession>,
    remote: SocketAddr,
    sc_tag: String,
) {
    let rendezvous = Rendezvous::new();
    let app_gate = rendezvous.add_gate();
    let sc_gate = (sc_tag != "none").then(|| rendezvous.add_gate());

    loop {
        match session.next_event().await {
            Some(EngineEvent::Ready) => {
                app_gate.ready();
                break;
            }
            Some(EngineEvent::LocalSignal(_)) => continue,
            Some(EngineEvent::Error(err)) => {
                app_gate.fail(err.clone());
                session.close().await;
                return;
            }
            None => {
                app_gate.fail("session ended before becoming ready".to_string());
                return;
            }
        }
    }

    if let Some(sc_gate) = &sc_gate {
        match session.create_data_channel().await {
            Ok(dc) => {
                let kind = if sc_tag == "relay" {
                    ScKind::Relay
                } else {
                    ScKind::Peer { remote_pid: None }
                };
                let (sc, inbound) = SignallingChannel::spawn(kind, dc);
                match sc_tag.as_str() {
                    "relay" => {
                        if let Some(router) = &state.router {
                            router.track_relay(sc.clone());
                            router.attach(sc, inbound);
                        } else {
                            warn!("signalling_channel=relay requested but this node has no relay router");
                        }
                    }
                    _ => {
                        if let Some(router) = &state.router {
                            router.attach(sc, inbound);
                        } else {
                            debug!("no relay router attached; inbound PeerSC will not be routed");
                        }
                    }
                }
                sc_gate.ready();
            }
            Err(err) => {
                sc_gate.fail(err.to_string());
                session.close().await;
                return;
            }
        }
    }

    if rendezvous.wait().await.is_err() {
        session.close().await;
        return;
    }

    let Some(application_dc) = session.take_application_channel() else {
        error!("engine reported ready without an application channel");
        return;
    };

    let remote_ip = match remote.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => std::net::Ipv4Addr::UNSPECIFIED,
    };
    let remote_address = match Address::build(remote_ip, remote.port(), true, false, None, None) {
        Ok(address) => address,
        Err(err) => {
            error!(%err, "failed to build remote address for inbound connection");
            return;
        }
    };

    state.track(remote_address.clone());
    state.emit_connection(Connection {
        application_dc,
        remote_address,
        opened_at: std::time::Instant::now(),
    });
}

/// Receives inbound offers purely over an already-established `PeerSC` to
/// this node's primary relay — no HTTP server of its own. Registered as the
/// dial engine's [`IncomingSignalling`] sink.
pub struct SigListener {
    engine: Arc<dyn PeerEngine>,
    self_pid: Pid,
    events: mpsc::UnboundedSender<ListenEvent>,
    active: std::sync::atomic::AtomicBool,
    /// The multi-address this listener announces whenever active. Set once
    /// at [`SigListener::announce`] and retained across
    /// deactivate/reactivate cycles so a reopened primary `PeerSC` can
    /// re-announce it without needing the caller to supply it again.
    address: RwLock<Option<Address>>,
}

impl SigListener {
    pub fn new(engine: Arc<dyn PeerEngine>, self_pid: Pid) -> (Arc<Self>, mpsc::UnboundedReceiver<ListenEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            engine,
            self_pid,
            events,
            active: std::sync::atomic::AtomicBool::new(true),
            address: RwLock::new(None),
        });
        (listener, rx)
    }

    pub fn announce(&self, address: Address) {
        self.active.store(true, std::sync::atomic::Ordering::Release);
        *self.address.write() = Some(address.clone());
        let _ = self.events.send(ListenEvent::Listening(address));
    }

    /// Whether this listener is still announcing its multi-address via
    /// `getAddrs()`. Drops to `false` once the primary `PeerSC` closes, at
    /// which point it also emits `close`.
    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn local_address(&self) -> Option<Address> {
        if self.is_active() {
            self.address.read().clone()
        } else {
            None
        }
    }

    /// Permanent shutdown, driven by [`crate::facade::Transport::close`] —
    /// unlike [`IncomingSignalling::on_primary_sc_closed`], this also
    /// forgets the configured address so a later, unrelated reopen of the
    /// primary `PeerSC` cannot resurrect this listener.
    pub async fn close(&self) {
        self.active.store(false, std::sync::atomic::Ordering::Release);
        *self.address.write() = None;
        let _ = self.events.send(ListenEvent::Close);
    }
}

impl IncomingSignalling for SigListener {
    fn handle_connect_request(self: Arc<Self>, sc: Arc<SignallingChannel>, src: Pid, dst: Pid, signal: Signal) {
        if !signal.is_offer() {
            // An answer or candidate arriving outside the normal
            // offer-then-answer flow is silently dropped.
            return;
        }
        if dst != self.self_pid {
            warn!(%dst, self_pid = %self.self_pid, "ConnectRequest routed to the wrong listener, dropping");
            return;
        }
        tokio::spawn(async move {
            self.answer_connect_request(sc, src, dst, signal).await;
        });
    }

    /// The primary `PeerSC` this listener depends on has closed: drop the
    /// announced address and emit `close`. The dial engine attempts to
    /// reopen the channel on its own; this listener relies entirely on that
    /// reattachment to come back.
    fn on_primary_sc_closed(self: Arc<Self>) {
        self.active.store(false, std::sync::atomic::Ordering::Release);
        let _ = self.events.send(ListenEvent::Close);
    }

    /// The dial engine reopened a replacement primary `PeerSC`: re-announce
    /// the address this listener was originally given.
    fn on_primary_sc_reopened(self: Arc<Self>) {
        let Some(address) = self.address.read().clone() else {
            return;
        };
        self.announce(address);
    }
}

impl SigListener {
    async fn answer_connect_request(self: Arc<Self>, sc: Arc<SignallingChannel>, src: Pid, dst: Pid, signal: Signal) {
        let mut session = match self.engine.create_receiver(EngineOptions::default()).await {
            Ok(session) => session,
            Err(err) => {
                error!(%err, "peer engine failed to create a receiver for a relayed ConnectRequest");
                return;
            }
        };

        if let Err(err) = session.feed_signal(signal).await {
            error!(%err, "peer engine rejected a relayed offer");
            return;
        }

        let answer = loop {
            match session.next_event().await {
                Some(EngineEvent::LocalSignal(signal)) => break Some(signal),
                Some(EngineEvent::Ready) => continue,
                Some(EngineEvent::Error(err)) => {
                    warn!(%err, "engine error before answering a relayed ConnectRequest");
                    break None;
                }
                None => break None,
            }
        };

        let Some(answer) = answer else { return };

        // The response swaps the request's src/dst: the requester (`src`)
        // becomes this message's `dst`, and this node (`dst` in the
        // original request) becomes its `src`.
        let response = SignalMessage::ConnectResponse {
            src: dst.to_string(),
            dst: src.to_string(),
            signal: answer,
        };
        if let Err(err) = sc.send_message(&response).await {
            warn!(%err, "failed to send ConnectResponse back across the signalling channel");
            return;
        }

        loop {
            match session.next_event().await {
                Some(EngineEvent::Ready) => break,
                Some(EngineEvent::LocalSignal(_)) => continue,
                Some(EngineEvent::Error(err)) => {
                    warn!(%err, "engine error while finishing a relayed connection");
                    return;
                }
                None => return,
            }
        }

        let Some(application_dc) = session.take_application_channel() else {
            error!("engine reported ready without an application channel for a relayed connection");
            return;
        };

        // Resolved open question: the relayed connection's remote address
        // identifies the other party, the original requester — `request.src`,
        // not this node's own PID (`request.dst`).
        let Some(remote_address) = build_peer_address(&src) else {
            error!("could not build a remote address for a relayed connection");
            return;
        };

        let connection = Connection {
            application_dc,
            remote_address,
            opened_at: std::time::Instant::now(),
        };
        let _ = self.events.send(ListenEvent::Connection(connection));
    }
}

/// Builds a placeholder direct address carrying only the remote peer's PID
/// — all the information a relayed connection's remote address can recover,
/// since there is no socket to read a host/port back from.
fn build_peer_address(pid: &Pid) -> Option<Address> {
    Address::build(std::net::Ipv4Addr::UNSPECIFIED, 0, false, true, None, Some(pid)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopEngine;

    fn star_address() -> Address {
        Address::build(
            std::net::Ipv4Addr::UNSPECIFIED,
            0,
            true,
            true,
            Some(&Pid::new("RPID")),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn on_primary_sc_closed_drops_the_address_and_emits_close() {
        let (sig, mut events) = SigListener::new(LoopEngine::new(), Pid::new("P1"));
        sig.announce(star_address());
        assert!(matches!(events.recv().await, Some(ListenEvent::Listening(_))));
        assert!(sig.is_active());
        assert!(sig.local_address().is_some());

        sig.clone().on_primary_sc_closed();

        assert!(!sig.is_active());
        assert!(sig.local_address().is_none());
        assert!(matches!(events.recv().await, Some(ListenEvent::Close)));
    }

    #[tokio::test]
    async fn on_primary_sc_reopened_re_announces_the_original_address() {
        let (sig, mut events) = SigListener::new(LoopEngine::new(), Pid::new("P1"));
        let address = star_address();
        sig.announce(address.clone());
        assert!(matches!(events.recv().await, Some(ListenEvent::Listening(_))));

        sig.clone().on_primary_sc_closed();
        assert!(matches!(events.recv().await, Some(ListenEvent::Close)));

        sig.clone().on_primary_sc_reopened();

        assert!(sig.is_active());
        assert_eq!(sig.local_address(), Some(address));
        assert!(matches!(events.recv().await, Some(ListenEvent::Listening(_))));
    }

    #[tokio::test]
    async fn permanent_close_forgets_the_address_so_a_later_reopen_cannot_resurrect_it() {
        let (sig, mut events) = SigListener::new(LoopEngine::new(), Pid::new("P1"));
        sig.announce(star_address());
        assert!(matches!(events.recv().await, Some(ListenEvent::Listening(_))));

        sig.close().await;
        assert!(matches!(events.recv().await, Some(ListenEvent::Close)));

        sig.clone().on_primary_sc_reopened();

        assert!(!sig.is_active());
        assert!(sig.local_address().is_none());
        assert!(events.try_recv().is_err());
    }
}
