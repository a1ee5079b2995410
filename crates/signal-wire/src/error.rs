/// Codec-layer errors.
///
/// Decode failures and malformed envelopes are never fatal to the caller —
/// the listen/relay engines log and drop the offending message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode signalling message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("payload parsed but is not a recognised signal envelope")]
    MalformedSignal,

    #[error("invalid base58 payload: {0}")]
    Base58(#[from] bs58::decode::Error),
}
