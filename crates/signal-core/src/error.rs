use signal_wire::CodecError;

/// Errors surfaced by [`crate::address::Address`] parsing.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address is not a recognised multiaddr: {0}")]
    Multiaddr(#[from] multiaddr::Error),

    #[error("address carries the star marker but no destination PID")]
    MissingDestinationPid,

    #[error("address has neither a host nor a port component")]
    MissingHostPort,
}

/// Errors from [`crate::dial::DialEngine::dial`].
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial aborted by caller")]
    Aborted,

    #[error("target demands the signalling overlay but it is disabled")]
    RejectedAddress,

    #[error("signalling channel path requested but no open PeerSC to the primary relay")]
    RelayUnavailable,

    #[error("peer engine error: {0}")]
    Engine(String),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors from the listen engine.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("listen aborted by caller")]
    Aborted,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("malformed signal: {0}")]
    MalformedSignal(#[from] CodecError),

    #[error("peer engine error: {0}")]
    Engine(String),

    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("http server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the relay router's table bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("JoinRequest received on a RelaySC, which is a protocol violation")]
    JoinOnRelaySc,

    #[error("channel send failed while forwarding to {0:?}: {1}")]
    ForwardFailed(String, String),
}
