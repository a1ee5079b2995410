use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Time-bounded set of message digests used to suppress rebroadcast loops.
///
/// Digests are computed over the raw on-the-wire bytes — never a
/// re-serialised form — so that different relays observing the same
/// forwarded message produce the same digest regardless of how their local
/// JSON serializer orders fields.
pub struct SeenCache {
    ttl: Duration,
    entries: Mutex<HashMap<[u8; 32], Instant>>,
}

impl SeenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Observe a message's raw bytes. Returns `true` if this digest has
    /// already been seen within the TTL window, `false` and records it
    /// otherwise.
    ///
    /// Under concurrent calls with identical bytes, at most one caller loses
    /// the race and observes `false` — the subsequent forward is idempotent
    /// on the destination, so either outcome is correct.
    pub fn observe(&self, bytes: &[u8]) -> bool {
        let digest = *blake3::hash(bytes).as_bytes();
        let now = Instant::now();

        let mut entries = self.entries.lock();
        entries.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);

        if entries.contains_key(&digest) {
            true
        } else {
            entries.insert(digest, now);
            false
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SeenCache {
    /// Default TTL is 30s, per spec.
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
