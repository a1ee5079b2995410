use std::collections::HashMap;

use signal_wire::Signal;

/// Opaque options passed through to the peer engine unexamined by this
/// workspace.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub create_data_channel: bool,
    pub extra: HashMap<String, String>,
}

/// Lifecycle states reported by the peer engine for a data channel, per
/// the signalling channel's `connecting → open → closing → closed` states
/// plus `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

/// Events a [`PeerSession`] emits while establishing a connection.
#[derive(Debug)]
pub enum EngineEvent {
    /// A signal the local engine wants sent to the remote side.
    LocalSignal(Signal),
    /// The connection (application data channel) is ready for use.
    Ready,
    /// An unrecoverable error; the session should be torn down.
    Error(String),
}

/// Error raised by a [`PeerEngine`] or one of its sessions/channels.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Write half of a data channel.
#[allow(async_fn_in_trait)]
pub trait ChannelSender: Send {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), EngineError>;
    fn state(&self) -> ChannelState;
    async fn close(&mut self);
}

/// Read half of a data channel. Yields `None` once the channel has closed.
#[allow(async_fn_in_trait)]
pub trait ChannelReceiver: Send {
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// A single duplex data channel, already split into independently owned
/// halves (mirroring how a websocket or TCP stream is split into a sink and
/// a stream in this workspace's networking code).
pub struct DataChannel {
    pub tx: Box<dyn ChannelSender>,
    pub rx: Box<dyn ChannelReceiver>,
}

/// A running initiator or receiver session with the peer engine.
///
/// The session is driven by polling [`PeerSession::next_event`] in a loop
/// and feeding back remote signals via [`PeerSession::feed_signal`]: the
/// engine's consumed surface is create-initiator/create-receiver,
/// feed-signal, emit-local-signal, emit-ready, emit-error, close,
/// create-data-channel.
#[allow(async_fn_in_trait)]
pub trait PeerSession: Send {
    async fn feed_signal(&mut self, signal: Signal) -> Result<(), EngineError>;

    /// Returns `None` once the session is closed and will emit no further
    /// events.
    async fn next_event(&mut self) -> Option<EngineEvent>;

    /// Creates the auxiliary signalling data channel on top of this
    /// session's underlying peer-to-peer connection.
    async fn create_data_channel(&mut self) -> Result<DataChannel, EngineError>;

    /// Takes the application data channel. Available once `Ready` has been
    /// observed from [`PeerSession::next_event`]; `None` before that or if
    /// already taken.
    fn take_application_channel(&mut self) -> Option<DataChannel>;

    async fn close(&mut self);
}

/// External peer engine: the interactive offer/answer connection library
/// this workspace treats as an out-of-scope collaborator.
#[allow(async_fn_in_trait)]
pub trait PeerEngine: Send + Sync {
    async fn create_initiator(
        &self,
        options: EngineOptions,
    ) -> Result<Box<dyn PeerSession>, EngineError>;

    async fn create_receiver(
        &self,
        options: EngineOptions,
    ) -> Result<Box<dyn PeerSession>, EngineError>;
}
