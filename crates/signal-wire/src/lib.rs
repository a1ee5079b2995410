//! Wire codec for the p2p-webrtc-direct/star signalling overlay
//!
//! Runtime-agnostic: this crate only encodes/decodes bytes and tracks seen
//! digests. It has no opinion about sockets, data channels, or the peer
//! engine that produces offers and answers — see `signal-core` for that.

#![forbid(unsafe_code)]

mod envelope;
mod error;
mod message;
mod seen_cache;

pub use envelope::{Signal, SignalKind};
pub use error::CodecError;
pub use message::SignalMessage;
pub use seen_cache::SeenCache;

/// Encode a [`SignalMessage`] to its on-the-wire JSON bytes.
pub fn encode_message(message: &SignalMessage) -> Vec<u8> {
    // A `SignalMessage` is always representable as JSON by construction, so
    // this cannot fail in practice; callers that need the fallible form can
    // go through `serde_json::to_vec` directly.
    serde_json::to_vec(message).expect("SignalMessage is always serializable")
}

/// Decode on-the-wire bytes into a [`SignalMessage`].
///
/// An unknown `type` tag or truncated payload surfaces as [`CodecError`]; the
/// caller drops the message rather than propagating a panic.
pub fn decode_message(bytes: &[u8]) -> Result<SignalMessage, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

/// Encode a [`Signal`] envelope to its on-the-wire JSON bytes.
pub fn encode_signal(signal: &Signal) -> Vec<u8> {
    serde_json::to_vec(signal).expect("Signal is always serializable")
}

/// Decode on-the-wire bytes into a [`Signal`] envelope.
///
/// Returns [`CodecError::MalformedSignal`] when the bytes parse as JSON but
/// do not match the envelope shape (e.g. missing `kind`), and
/// [`CodecError::Decode`] when the bytes are not valid JSON at all.
pub fn decode_signal(bytes: &[u8]) -> Result<Signal, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
    serde_json::from_value(value).map_err(|_| CodecError::MalformedSignal)
}

/// Base58-encode arbitrary bytes for URL-safe HTTP transport.
pub fn base58_encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Base58-decode a string back to raw bytes.
pub fn base58_decode(encoded: &str) -> Result<Vec<u8>, CodecError> {
    bs58::decode(encoded)
        .into_vec()
        .map_err(CodecError::Base58)
}

/// Convenience: base58-encode a [`Signal`] envelope (the form used for the
/// HTTP `signal` query parameter and response body).
pub fn encode_signal_base58(signal: &Signal) -> String {
    base58_encode(&encode_signal(signal))
}

/// Convenience: base58-decode and parse a [`Signal`] envelope.
pub fn decode_signal_base58(encoded: &str) -> Result<Signal, CodecError> {
    let bytes = base58_decode(encoded)?;
    decode_signal(&bytes)
}
