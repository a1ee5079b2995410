use serde::{Deserialize, Serialize};

/// An offer/answer/candidate envelope produced by the peer engine.
///
/// Only `Offer` triggers state transitions in the dial/listen engines;
/// `Answer` and `Candidate` are forwarded opaquely wherever this envelope
/// travels. An `Answer` arriving outside the normal offer-then-answer flow
/// is silently dropped by whichever side receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub payload: Vec<u8>,
}

/// The three envelope kinds the peer engine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl Signal {
    pub fn offer(payload: Vec<u8>) -> Self {
        Self {
            kind: SignalKind::Offer,
            payload,
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SignalKind::Offer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_offer_only_true_for_offer_kind() {
        assert!(Signal::offer(vec![]).is_offer());
        assert!(!Signal {
            kind: SignalKind::Answer,
            payload: vec![]
        }
        .is_offer());
    }
}
