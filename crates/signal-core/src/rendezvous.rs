use parking_lot::Mutex;
use tokio::sync::watch;

/// Outcome of one gate tracked by a [`Rendezvous`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    Pending,
    Ready,
    Failed(String),
}

/// One input a [`Rendezvous`] waits on. Dropping a `Gate` before calling
/// either method is equivalent to calling [`Gate::fail`].
pub struct Gate {
    tx: watch::Sender<GateState>,
}

impl Gate {
    pub fn ready(&self) {
        let _ = self.tx.send(GateState::Ready);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(GateState::Failed(reason.into()));
    }
}

/// Waits for every registered gate to become ready, or reports the first
/// observed failure — the generalisation to N inputs of a single
/// `oneshot`-per-event join. Used to coordinate "application data channel
/// open AND (no signalling channel requested OR signalling channel open)"
/// in both the dial and listen engines.
pub struct Rendezvous {
    gates: Mutex<Vec<watch::Receiver<GateState>>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            gates: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new gate that must resolve for [`Rendezvous::wait`] to
    /// succeed.
    pub fn add_gate(&self) -> Gate {
        let (tx, rx) = watch::channel(GateState::Pending);
        self.gates.lock().push(rx);
        Gate { tx }
    }

    /// Resolves once every registered gate is ready, or immediately with the
    /// first observed failure. Resolves immediately if no gates were ever
    /// registered.
    pub async fn wait(&self) -> Result<(), String> {
        let mut gates = self.gates.lock().clone();
        if gates.is_empty() {
            return Ok(());
        }

        loop {
            for gate in &gates {
                if let GateState::Failed(reason) = &*gate.borrow() {
                    return Err(reason.clone());
                }
            }
            if gates.iter().all(|g| matches!(&*g.borrow(), GateState::Ready)) {
                return Ok(());
            }

            let futures = gates.iter_mut().map(|g| Box::pin(g.changed()));
            let (result, idx, _remaining) = futures::future::select_all(futures).await;
            if result.is_err() {
                return Err(format!("gate {idx} dropped without resolving"));
            }
        }
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once_all_gates_are_ready() {
        let rendezvous = Rendezvous::new();
        let app = rendezvous.add_gate();
        let sc = rendezvous.add_gate();

        let wait = rendezvous.wait();
        app.ready();
        sc.ready();
        assert_eq!(wait.await, Ok(()));
    }

    #[tokio::test]
    async fn no_gates_resolves_immediately() {
        let rendezvous = Rendezvous::new();
        assert_eq!(rendezvous.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn reports_first_failure() {
        let rendezvous = Rendezvous::new();
        let app = rendezvous.add_gate();
        let sc = rendezvous.add_gate();

        let wait = rendezvous.wait();
        sc.fail("signalling channel never opened");
        app.ready();
        assert_eq!(
            wait.await,
            Err("signalling channel never opened".to_string())
        );
    }
}
