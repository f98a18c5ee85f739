//! Kind → handler binding with an explicit Active → Draining → Removed lifecycle.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Handler, Kind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Draining,
    Removed,
}

struct State {
    phase: Phase,
    in_flight: usize,
}

pub(crate) struct Binding {
    pub kind: Kind,
    pub handler: Arc<dyn Handler>,
    state: Mutex<State>,
    idle: Notify,
    removed: CancellationToken,
    /// Stops the watch feeding this binding.
    pub watch: CancellationToken,
}

/// Held while a handler runs; dropping it may complete a drain.
pub(crate) struct InFlight {
    binding: Arc<Binding>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Ok(mut st) = self.binding.state.lock() else { return };
        st.in_flight -= 1;
        if st.in_flight == 0 && st.phase == Phase::Draining {
            self.binding.idle.notify_waiters();
        }
    }
}

impl Binding {
    pub fn new(kind: Kind, handler: Arc<dyn Handler>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            handler,
            state: Mutex::new(State { phase: Phase::Active, in_flight: 0 }),
            idle: Notify::new(),
            removed: CancellationToken::new(),
            watch: CancellationToken::new(),
        })
    }

    pub fn phase(&self) -> Phase { self.state.lock().map(|s| s.phase).unwrap_or(Phase::Removed) }

    /// Claim a slot for one handler run; `None` once the binding stopped accepting work.
    pub fn enter(self: &Arc<Self>) -> Option<InFlight> {
        let mut st = self.state.lock().ok()?;
        if st.phase != Phase::Active {
            return None;
        }
        st.in_flight += 1;
        Some(InFlight { binding: Arc::clone(self) })
    }

    /// Stop the watch, wait for in-flight runs, then invoke the teardown hook.
    /// Idempotent: concurrent and repeated calls return once the binding is removed.
    pub async fn shutdown(&self) {
        let first = match self.state.lock() {
            Ok(mut st) if st.phase == Phase::Active => {
                st.phase = Phase::Draining;
                true
            }
            _ => false,
        };
        if !first {
            self.removed.cancelled().await;
            return;
        }
        info!(kind = %self.kind, "draining kind");
        self.watch.cancel();
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let busy = self.state.lock().map(|s| s.in_flight).unwrap_or(0);
            if busy == 0 {
                break;
            }
            debug!(kind = %self.kind, in_flight = busy, "waiting for handlers");
            notified.await;
        }
        self.handler.teardown().await;
        if let Ok(mut st) = self.state.lock() {
            st.phase = Phase::Removed;
        }
        self.removed.cancel();
        info!(kind = %self.kind, "kind removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, Outcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        teardowns: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Handler for Counting {
        async fn handle(&self, _event: &Event) -> anyhow::Result<Outcome> { Ok(Outcome::done()) }
        async fn teardown(&self) { self.teardowns.fetch_add(1, Ordering::SeqCst); }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_and_is_idempotent() {
        let h = Arc::new(Counting::default());
        let b = Binding::new(Kind::new("v1", "ConfigMap"), h.clone());
        let slot = b.enter().unwrap();

        let b1 = b.clone();
        let first = tokio::spawn(async move { b1.shutdown().await });
        let b2 = b.clone();
        let second = tokio::spawn(async move { b2.shutdown().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.phase(), Phase::Draining);
        assert!(b.enter().is_none(), "draining binding must refuse work");
        assert!(!first.is_finished() && !second.is_finished());

        drop(slot);
        first.await.unwrap();
        second.await.unwrap();
        b.shutdown().await;
        assert_eq!(b.phase(), Phase::Removed);
        assert_eq!(h.teardowns.load(Ordering::SeqCst), 1);
        assert!(b.watch.is_cancelled());
    }
}
