use serde::{Deserialize, Serialize};

use crate::envelope::Signal;

/// The signalling messages exchanged over a signalling channel (SC).
///
/// Tagged on `type` so an unrecognised variant decodes to an error rather
/// than silently picking a default — see [`crate::decode_message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Sent once by a Peer to its primary Relay as soon as the SC opens.
    JoinRequest {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// An offer being relayed toward `dst`.
    ConnectRequest {
        src: String,
        dst: String,
        signal: Signal,
    },
    /// The answer coming back to `src`.
    ConnectResponse {
        src: String,
        dst: String,
        signal: Signal,
    },
}

impl SignalMessage {
    /// The destination PID this message is addressed to, if it carries one.
    /// `JoinRequest` has no destination — it is handled by the SC's owning
    /// relay, not routed further.
    pub fn dst(&self) -> Option<&str> {
        match self {
            Self::JoinRequest { .. } => None,
            Self::ConnectRequest { dst, .. } | Self::ConnectResponse { dst, .. } => Some(dst),
        }
    }

    pub fn src(&self) -> Option<&str> {
        match self {
            Self::JoinRequest { peer_id } => Some(peer_id),
            Self::ConnectRequest { src, .. } | Self::ConnectResponse { src, .. } => Some(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SignalKind;

    #[test]
    fn join_request_wire_shape_matches_spec() {
        let msg = SignalMessage::JoinRequest {
            peer_id: "p1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"JoinRequest","peerId":"p1"}"#);
    }

    #[test]
    fn connect_request_roundtrips() {
        let msg = SignalMessage::ConnectRequest {
            src: "p1".to_string(),
            dst: "p2".to_string(),
            signal: Signal {
                kind: SignalKind::Offer,
                payload: vec![1, 2, 3],
            },
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let decoded: SignalMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.dst(), Some("p2"));
        assert_eq!(decoded.src(), Some("p1"));
    }

    #[test]
    fn join_request_has_no_destination() {
        let msg = SignalMessage::JoinRequest {
            peer_id: "p1".to_string(),
        };
        assert_eq!(msg.dst(), None);
    }
}
