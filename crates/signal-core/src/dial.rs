use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use signal_wire::{decode_signal_base58, encode_signal_base58, Signal, SignalMessage};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::address::{Address, Pid};
use crate::channel::{InboundMessage, ScKind, SignallingChannel};
use crate::config::{NodeType, TransportConfig};
use crate::connection::Connection;
use crate::engine::{EngineEvent, EngineOptions, PeerEngine, PeerSession};
use crate::error::DialError;
use crate::health::ChannelHealthMonitor;
use crate::router::RelayRouter;

/// An engine error text treated as a normal close rather than a failure.
const TRANSPORT_CHANNEL_CLOSED: &str = "Transport channel closed";

/// Sink a freshly (re)opened primary `PeerSC` hands inbound `ConnectRequest`
/// traffic to, so this node can answer dials routed to it through its
/// primary relay. Implemented by [`crate::listen::SigListener`]; kept as a
/// trait here so `dial` has no compile-time dependency on `listen`.
pub trait IncomingSignalling: Send + Sync {
    /// `sc` is the channel to answer on; `src`/`dst` and `signal` are taken
    /// directly from the inbound `ConnectRequest`. Implementations should
    /// not block the caller — spawn their own task if answering requires
    /// driving a receiver session to completion.
    fn handle_connect_request(self: Arc<Self>, sc: Arc<SignallingChannel>, src: Pid, dst: Pid, signal: Signal);

    /// Called when the primary `PeerSC` this sink was registered against
    /// closes — a `SigListener` drops its multi-address from `getAddrs()`
    /// and emits `close` here; it does not reopen on its own, relying
    /// entirely on the dial engine reattaching.
    fn on_primary_sc_closed(self: Arc<Self>) {}

    /// Called once the dial engine has reopened a replacement `PeerSC`,
    /// so a `SigListener` can re-announce its multi-address.
    fn on_primary_sc_reopened(self: Arc<Self>) {}
}

/// Per-dial knobs: just the caller's cancellation signal.
#[derive(Clone, Default)]
pub struct DialOptions {
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScQuery {
    None,
    Peer,
    Relay,
}

impl ScQuery {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Peer => "peer",
            Self::Relay => "relay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialPath {
    Http(ScQuery),
    Sc,
}

/// Path-selection decision table, evaluated left-to-right.
fn select_path(config: &TransportConfig, target: &Address) -> Result<DialPath, DialError> {
    match (config.signalling_enabled, target.is_star()) {
        (false, true) => Err(DialError::RejectedAddress),
        (false, false) => Ok(DialPath::Http(ScQuery::None)),
        (true, true) => Ok(DialPath::Sc),
        (true, false) => match config.node_type {
            NodeType::Peer => {
                let is_primary = config.primary_relay_pid().as_ref() == target.owner_pid();
                if is_primary {
                    Ok(DialPath::Http(ScQuery::Peer))
                } else {
                    Ok(DialPath::Http(ScQuery::None))
                }
            }
            NodeType::Relay => Ok(DialPath::Http(ScQuery::Relay)),
        },
    }
}

/// Supervises the singular outbound `PeerSC` to the primary relay. Shared by
/// every concurrent dial this node makes, since they all reuse the same
/// channel — the codec is self-delimited and the `(src,dst)` filter on the
/// awaited response disambiguates answers, so interleaving multiple
/// in-flight dials is safe.
struct PeerLink {
    relay_pid: Pid,
    self_pid: Pid,
    primary: RwLock<Option<Arc<SignallingChannel>>>,
    pending: RwLock<HashMap<Pid, oneshot::Sender<Signal>>>,
    incoming_sink: RwLock<Option<Arc<dyn IncomingSignalling>>>,
    health: Arc<ChannelHealthMonitor>,
    /// The bootstrap session that created the current `primary` channel,
    /// retained only so a dropped SC can be reopened on the same underlying
    /// connection without redialing the relay over HTTP.
    session: AsyncMutex<Option<Box<dyn PeerSession>>>,
}

impl PeerLink {
    fn new(relay_pid: Pid, self_pid: Pid, channel_closed_timeout: std::time::Duration) -> Arc<Self> {
        let link = Arc::new(Self {
            relay_pid,
            self_pid,
            primary: RwLock::new(None),
            pending: RwLock::new(HashMap::new()),
            incoming_sink: RwLock::new(None),
            health: ChannelHealthMonitor::new(channel_closed_timeout),
            session: AsyncMutex::new(None),
        });
        let cleanup_link = link.clone();
        link.health
            .spawn(move |sc| cleanup_link.clone().handle_sc_closed(sc));
        link
    }

    fn set_incoming_sink(&self, sink: Arc<dyn IncomingSignalling>) {
        *self.incoming_sink.write() = Some(sink);
    }

    fn current(&self) -> Option<Arc<SignallingChannel>> {
        self.primary.read().clone()
    }

    async fn await_response(&self, target: Pid) -> oneshot::Receiver<Signal> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(target, tx);
        rx
    }

    fn handle_sc_closed(self: Arc<Self>, sc: Arc<SignallingChannel>) {
        let was_primary = {
            let mut primary = self.primary.write();
            if primary.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &sc)) {
                *primary = None;
                true
            } else {
                false
            }
        };
        self.pending.write().clear();

        if was_primary {
            if let Some(sink) = self.incoming_sink.read().clone() {
                sink.on_primary_sc_closed();
            }
        }

        let link = self.clone();
        tokio::spawn(async move {
            link.reopen().await;
        });
    }

    async fn reopen(self: Arc<Self>) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            debug!("no retained session, not reopening primary signalling channel");
            return;
        };

        match session.create_data_channel().await {
            Ok(dc) => {
                let session = guard.take().expect("checked Some above");
                drop(guard);
                let (sc, inbound) =
                    SignallingChannel::spawn(ScKind::Peer { remote_pid: Some(self.relay_pid.clone()) }, dc);
                if let Err(err) = self.adopt(sc, inbound, session).await {
                    warn!(%err, "failed to reopen primary signalling channel");
                }
            }
            Err(err) if err.0 == TRANSPORT_CHANNEL_CLOSED => {
                debug!("parent connection closed, not reopening primary signalling channel");
            }
            Err(err) => {
                warn!(%err, "failed to create replacement signalling channel");
            }
        }
    }

    async fn adopt(
        self: &Arc<Self>,
        sc: Arc<SignallingChannel>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        session: Box<dyn PeerSession>,
    ) -> Result<(), DialError> {
        sc.send_message(&SignalMessage::JoinRequest {
            peer_id: self.self_pid.to_string(),
        })
        .await
        .map_err(|err| DialError::Engine(err.0))?;

        *self.session.lock().await = Some(session);
        *self.primary.write() = Some(sc.clone());
        self.health.watch(sc.clone());

        if let Some(sink) = self.incoming_sink.read().clone() {
            sink.on_primary_sc_reopened();
        }

        let link = self.clone();
        tokio::spawn(async move {
            while let Some(InboundMessage { message, .. }) = inbound.recv().await {
                link.dispatch_inbound(&sc, message).await;
            }
            if sc.mark_cleaned_up() {
                link.clone().handle_sc_closed(sc);
            }
        });
        Ok(())
    }

    async fn dispatch_inbound(self: &Arc<Self>, sc: &Arc<SignallingChannel>, message: SignalMessage) {
        match message {
            SignalMessage::ConnectResponse { src, dst: _, signal } => {
                if let Some(tx) = self.pending.write().remove(&Pid::from(src)) {
                    let _ = tx.send(signal);
                }
            }
            SignalMessage::ConnectRequest { src, dst, signal } => {
                if let Some(sink) = self.incoming_sink.read().clone() {
                    sink.handle_connect_request(sc.clone(), Pid::from(src), Pid::from(dst), signal);
                } else {
                    debug!("no listener registered for the primary relay, dropping ConnectRequest");
                }
            }
            SignalMessage::JoinRequest { .. } => {
                warn!("unexpected JoinRequest arrived on an outbound PeerSC, ignoring");
            }
        }
    }
}

/// Drives outbound establishment — the HTTP offer/answer bootstrap and the
/// signalling-channel path.
pub struct DialEngine {
    engine: Arc<dyn PeerEngine>,
    http: reqwest::Client,
    config: TransportConfig,
    peer_link: Option<Arc<PeerLink>>,
    relay_router: Option<Arc<RelayRouter>>,
    self_pid: Pid,
}

impl DialEngine {
    pub fn new(
        engine: Arc<dyn PeerEngine>,
        config: TransportConfig,
        self_pid: Pid,
        relay_router: Option<Arc<RelayRouter>>,
    ) -> Self {
        let peer_link = if config.node_type == NodeType::Peer {
            let channel_closed_timeout = config.channel_closed_timeout();
            config
                .primary_relay_pid()
                .map(|relay_pid| PeerLink::new(relay_pid, self_pid.clone(), channel_closed_timeout))
        } else {
            None
        };

        Self {
            engine,
            http: reqwest::Client::new(),
            config,
            peer_link,
            relay_router,
            self_pid,
        }
    }

    /// Registers the local listener that should answer inbound
    /// `ConnectRequest`s arriving on the primary `PeerSC`. A no-op when this
    /// node is not configured as a Peer with a primary relay.
    pub fn set_incoming_sink(&self, sink: Arc<dyn IncomingSignalling>) {
        if let Some(link) = &self.peer_link {
            link.set_incoming_sink(sink);
        }
    }

    pub fn primary_channel(&self) -> Option<Arc<SignallingChannel>> {
        self.peer_link.as_ref().and_then(|link| link.current())
    }

    #[instrument(skip(self, options), fields(target = %target))]
    pub async fn dial(&self, target: &Address, options: DialOptions) -> Result<Connection, DialError> {
        match select_path(&self.config, target)? {
            DialPath::Http(query) => self.dial_http(target, query, &options).await,
            DialPath::Sc => self.dial_sc(target, &options).await,
        }
    }

    async fn await_offer(session: &mut dyn PeerSession, options: &DialOptions) -> Result<Signal, DialError> {
        loop {
            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => return Err(DialError::Aborted),
                event = session.next_event() => match event {
                    Some(EngineEvent::LocalSignal(signal)) if signal.is_offer() => return Ok(signal),
                    Some(EngineEvent::LocalSignal(_)) | Some(EngineEvent::Ready) => continue,
                    Some(EngineEvent::Error(err)) => return Err(DialError::Engine(err)),
                    None => return Err(DialError::Engine("session ended before emitting an offer".into())),
                }
            }
        }
    }

    async fn await_ready(session: &mut dyn PeerSession, options: &DialOptions) -> Result<(), DialError> {
        loop {
            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => return Err(DialError::Aborted),
                event = session.next_event() => match event {
                    Some(EngineEvent::Ready) => return Ok(()),
                    // Further local candidates may still arrive; they are
                    // not forwarded once the HTTP response has been read.
                    Some(EngineEvent::LocalSignal(_)) => continue,
                    Some(EngineEvent::Error(err)) => return Err(DialError::Engine(err)),
                    None => return Err(DialError::Engine("session ended before becoming ready".into())),
                }
            }
        }
    }

    async fn dial_http(
        &self,
        target: &Address,
        query: ScQuery,
        options: &DialOptions,
    ) -> Result<Connection, DialError> {
        let mut session = self
            .engine
            .create_initiator(EngineOptions::default())
            .await
            .map_err(|err| DialError::Engine(err.0))?;

        let offer = match Self::await_offer(session.as_mut(), options).await {
            Ok(signal) => signal,
            Err(err) => {
                session.close().await;
                return Err(err);
            }
        };

        let url = target.http_url("http");
        let signal_b58 = encode_signal_base58(&offer);
        let response = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => {
                session.close().await;
                return Err(DialError::Aborted);
            }
            result = self
                .http
                .get(&url)
                .query(&[("signal", signal_b58.as_str()), ("signalling_channel", query.as_str())])
                .send() => result?,
        };
        let body = response.text().await?;

        if !body.is_empty() {
            let answer = decode_signal_base58(&body)?;
            session
                .feed_signal(answer)
                .await
                .map_err(|err| DialError::Engine(err.0))?;
        }

        if let Err(err) = Self::await_ready(session.as_mut(), options).await {
            session.close().await;
            return Err(err);
        }

        if query == ScQuery::None {
            let app_dc = session
                .take_application_channel()
                .ok_or_else(|| DialError::Engine("ready without an application channel".into()))?;
            return Ok(Connection {
                application_dc: app_dc,
                remote_address: target.clone(),
                opened_at: Instant::now(),
            });
        }

        let dc = session
            .create_data_channel()
            .await
            .map_err(|err| DialError::Engine(err.0))?;
        let app_dc = session
            .take_application_channel()
            .ok_or_else(|| DialError::Engine("ready without an application channel".into()))?;

        match query {
            ScQuery::Peer => {
                let relay_pid = target.owner_pid().cloned().ok_or_else(|| {
                    DialError::Engine("primary relay address missing owner pid".into())
                })?;
                let (sc, inbound) =
                    SignallingChannel::spawn(ScKind::Peer { remote_pid: Some(relay_pid) }, dc);
                let link = self
                    .peer_link
                    .as_ref()
                    .expect("peer_link is configured whenever select_path returns ScQuery::Peer");
                link.adopt(sc, inbound, session)
                    .await
                    .map_err(|err| DialError::Engine(err.to_string()))?;
            }
            ScQuery::Relay => {
                let (sc, inbound) = SignallingChannel::spawn(ScKind::Relay, dc);
                let router = self
                    .relay_router
                    .as_ref()
                    .expect("relay_router is configured whenever select_path returns ScQuery::Relay");
                router.track_relay(sc.clone());
                router.attach(sc, inbound);
                // The bootstrap session has served its purpose: the app
                // channel is already taken and relay-to-relay links do not
                // reopen on their own the way the peer-side primary link
                // does.
                session.close().await;
            }
            ScQuery::None => unreachable!("handled above"),
        }

        Ok(Connection {
            application_dc: app_dc,
            remote_address: target.clone(),
            opened_at: Instant::now(),
        })
    }

    async fn dial_sc(&self, target: &Address, options: &DialOptions) -> Result<Connection, DialError> {
        let link = self.peer_link.as_ref().ok_or(DialError::RelayUnavailable)?;
        let sc = link.current().ok_or(DialError::RelayUnavailable)?;
        let dst = target
            .dest_pid()
            .cloned()
            .ok_or_else(|| DialError::Address(crate::error::AddressError::MissingDestinationPid))?;

        let mut session = self
            .engine
            .create_initiator(EngineOptions::default())
            .await
            .map_err(|err| DialError::Engine(err.0))?;

        let offer = match Self::await_offer(session.as_mut(), options).await {
            Ok(signal) => signal,
            Err(err) => {
                session.close().await;
                return Err(err);
            }
        };

        let rx = link.await_response(dst.clone()).await;
        if let Err(err) = sc
            .send_message(&SignalMessage::ConnectRequest {
                src: self.self_pid.to_string(),
                dst: dst.to_string(),
                signal: offer,
            })
            .await
        {
            session.close().await;
            return Err(DialError::Engine(err.0));
        }

        let answer = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => {
                session.close().await;
                return Err(DialError::Aborted);
            }
            result = rx => match result {
                Ok(signal) => signal,
                Err(_) => {
                    session.close().await;
                    return Err(DialError::Engine(
                        "signalling channel closed before a ConnectResponse arrived".into(),
                    ));
                }
            },
        };

        if let Err(err) = session.feed_signal(answer).await {
            session.close().await;
            return Err(DialError::Engine(err.0));
        }

        if let Err(err) = Self::await_ready(session.as_mut(), options).await {
            session.close().await;
            return Err(err);
        }

        let app_dc = session
            .take_application_channel()
            .ok_or_else(|| DialError::Engine("ready without an application channel".into()))?;

        Ok(Connection {
            application_dc: app_dc,
            remote_address: target.clone(),
            opened_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopEngine;

    fn peer_config(relay_pid: &str) -> TransportConfig {
        TransportConfig {
            signalling_enabled: true,
            node_type: NodeType::Peer,
            relay_peer_id: Some(relay_pid.to_string()),
            ..TransportConfig::default()
        }
    }

    /// `/p2p/<pid>` components must be a base58btc-encoded multihash, so
    /// tests build addresses rather than hand-typing PID labels into a
    /// multiaddr string — see [`Address::build`].
    fn star_address(owner: Option<&str>, dest: &str) -> Address {
        Address::build(
            std::net::Ipv4Addr::LOCALHOST,
            1,
            true,
            true,
            owner.map(Pid::new).as_ref(),
            Some(&Pid::new(dest)),
        )
        .unwrap()
    }

    fn direct_address(owner: Option<&str>) -> Address {
        Address::build(
            std::net::Ipv4Addr::LOCALHOST,
            1,
            true,
            false,
            owner.map(Pid::new).as_ref(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn select_path_rejects_star_address_when_disabled() {
        let config = TransportConfig::default();
        let target = star_address(None, "P2");
        assert!(matches!(
            select_path(&config, &target),
            Err(DialError::RejectedAddress)
        ));
    }

    #[test]
    fn select_path_uses_plain_http_when_disabled_and_no_star() {
        let config = TransportConfig::default();
        let target = direct_address(None);
        assert_eq!(select_path(&config, &target).unwrap(), DialPath::Http(ScQuery::None));
    }

    #[test]
    fn select_path_creates_peer_sc_for_primary_relay() {
        let config = peer_config("RPID");
        let target = direct_address(Some("RPID"));
        assert_eq!(select_path(&config, &target).unwrap(), DialPath::Http(ScQuery::Peer));
    }

    #[test]
    fn select_path_plain_http_for_non_primary_peer() {
        let config = peer_config("RPID");
        let target = direct_address(Some("OTHER"));
        assert_eq!(select_path(&config, &target).unwrap(), DialPath::Http(ScQuery::None));
    }

    #[test]
    fn select_path_uses_sc_for_star_marker() {
        let config = peer_config("RPID");
        let target = star_address(Some("RPID"), "P2PID");
        assert_eq!(select_path(&config, &target).unwrap(), DialPath::Sc);
    }

    #[test]
    fn select_path_relay_always_opens_relay_sc_over_http() {
        let config = TransportConfig {
            signalling_enabled: true,
            node_type: NodeType::Relay,
            ..TransportConfig::default()
        };
        let target = direct_address(None);
        assert_eq!(select_path(&config, &target).unwrap(), DialPath::Http(ScQuery::Relay));
    }

    #[tokio::test]
    async fn dial_sc_rejects_when_no_primary_channel_open() {
        let engine: Arc<dyn PeerEngine> = LoopEngine::new();
        let dial = DialEngine::new(engine, peer_config("RPID"), Pid::new("P1"), None);
        let target = star_address(Some("RPID"), "P2PID");
        let err = dial.dial(&target, DialOptions::default()).await.unwrap_err();
        assert!(matches!(err, DialError::RelayUnavailable));
    }
}
