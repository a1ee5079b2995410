use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::SignallingChannel;
use crate::engine::ChannelState;

/// Default scan interval.
pub const CHANNEL_CLOSED_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically reconciles watched signalling channels whose engine-reported
/// state transitioned to `closed` without the channel's own close handler
/// having run. The engine occasionally fails to emit a close event; without
/// this, routing tables would leak.
pub struct ChannelHealthMonitor {
    watched: RwLock<Vec<Arc<SignallingChannel>>>,
    cancel: CancellationToken,
    interval: Duration,
}

impl ChannelHealthMonitor {
    /// `interval` is the configured scan period (`channel_closed_timeout_secs`
    /// in [`crate::config::TransportConfig`], default [`CHANNEL_CLOSED_TIMEOUT`]).
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            watched: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            interval,
        })
    }

    pub fn watch(&self, sc: Arc<SignallingChannel>) {
        self.watched.write().push(sc);
    }

    /// Spawns the periodic scan loop. `cleanup` is invoked exactly once per
    /// SC, the first time either this loop or the SC's own close handler
    /// observes closure (see [`SignallingChannel::mark_cleaned_up`]).
    ///
    /// The loop holds only a `Weak` reference to `self`, so dropping every
    /// strong reference to the monitor (e.g. the owning router closing)
    /// lets the task end on its own rather than running forever.
    pub fn spawn(
        self: &Arc<Self>,
        cleanup: impl Fn(Arc<SignallingChannel>) + Send + Sync + 'static,
    ) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.scan_once(&cleanup).await;
            }
            debug!("channel health monitor stopped");
        });
    }

    async fn scan_once(&self, cleanup: &(impl Fn(Arc<SignallingChannel>) + Send + Sync)) {
        let watched = self.watched.read().clone();
        for sc in watched {
            if sc.engine_reported_state().await == ChannelState::Closed && sc.mark_cleaned_up() {
                cleanup(sc.clone());
            }
        }
        self.watched
            .write()
            .retain(|sc| sc.state() != ChannelState::Closed);
    }

    /// Stops the scan loop and forgets all watched channels — closed is
    /// terminal, and releases every table entry that referenced them.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.watched.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn reclaims_channel_whose_engine_reports_closed_without_event() {
        let (a, _b) = LoopEngine::connected_pair();
        let (sc, _rx) = SignallingChannel::spawn(crate::channel::ScKind::Relay, a);

        let monitor = ChannelHealthMonitor::new(CHANNEL_CLOSED_TIMEOUT);
        monitor.watch(sc.clone());

        let cleanups = Arc::new(AtomicUsize::new(0));
        let counted = cleanups.clone();
        monitor.spawn(move |_sc| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        sc.close().await; // simulates the engine silently going closed
        tokio::time::advance(CHANNEL_CLOSED_TIMEOUT + StdDuration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }
}
