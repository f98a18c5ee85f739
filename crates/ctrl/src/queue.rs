//! Dedup event queue: per-key debounce barrier in front of a bounded channel.
//!
//! A key stays in the barrier from `enqueue` until a consumer takes the event, so repeated
//! triggers for a pending key coalesce into one delivery. Removing the key on delivery (not
//! before) reopens it exactly when a worker takes ownership, which lets the scheduler redeliver
//! changes that arrive mid-run.

use std::collections::VecDeque;
use std::sync::Mutex;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Event;

pub struct DedupQueue {
    tx: mpsc::Sender<Event>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    /// Pending keys with the highest retry count seen while pending.
    barrier: Mutex<FxHashMap<String, u32>>,
    /// Events that did not fit in the channel, in arrival order.
    overflow: Mutex<VecDeque<Event>>,
    stop: CancellationToken,
}

impl DedupQueue {
    /// `capacity` must be at least the number of consumers so producers never block.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            barrier: Mutex::new(FxHashMap::default()),
            overflow: Mutex::new(VecDeque::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Never blocks. A key already pending is coalesced, keeping the larger retry count.
    pub fn enqueue(&self, event: Event) {
        if self.stop.is_cancelled() {
            return;
        }
        {
            let Ok(mut barrier) = self.barrier.lock() else { return };
            if let Some(attempts) = barrier.get_mut(&event.key()) {
                *attempts = (*attempts).max(event.attempts);
                counter!("queue_coalesced", 1u64);
                trace!(event = %event, "coalesced");
                return;
            }
            barrier.insert(event.key(), event.attempts);
        }
        let Ok(mut overflow) = self.overflow.lock() else { return };
        drain_into(&self.tx, &mut overflow);
        if !overflow.is_empty() {
            counter!("queue_overflow", 1u64);
            overflow.push_back(event);
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                counter!("queue_overflow", 1u64);
                overflow.push_back(event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Wait for the next event. Returns `None` once stopped.
    ///
    /// Channel entries always predate overflow entries, so taking from the channel and then
    /// refilling it from the front of the overflow buffer keeps arrival order.
    pub async fn dequeue(&self) -> Option<Event> {
        let mut event = {
            let mut rx = tokio::select! {
                _ = self.stop.cancelled() => return None,
                rx = self.rx.lock() => rx,
            };
            tokio::select! {
                _ = self.stop.cancelled() => return None,
                ev = rx.recv() => ev?,
            }
        };
        if let Ok(mut barrier) = self.barrier.lock() {
            if let Some(attempts) = barrier.remove(&event.key()) {
                event.attempts = event.attempts.max(attempts);
            }
        }
        if let Ok(mut overflow) = self.overflow.lock() {
            drain_into(&self.tx, &mut overflow);
        }
        Some(event)
    }

    pub fn stop(&self) { self.stop.cancel(); }

    pub fn is_stopped(&self) -> bool { self.stop.is_cancelled() }

    /// Keys currently pending delivery.
    pub fn pending(&self) -> usize { self.barrier.lock().map(|b| b.len()).unwrap_or(0) }
}

fn drain_into(tx: &mpsc::Sender<Event>, overflow: &mut VecDeque<Event>) {
    while !overflow.is_empty() {
        match tx.try_reserve() {
            Ok(permit) => {
                if let Some(ev) = overflow.pop_front() {
                    permit.send(ev);
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kind;
    use std::time::Duration;

    fn ev(name: &str) -> Event { Event::new(Kind::new("v1", "ConfigMap"), Some("ns"), name) }

    #[tokio::test]
    async fn duplicate_keys_coalesce_until_dequeued() {
        let q = DedupQueue::with_capacity(4);
        for _ in 0..10 {
            q.enqueue(ev("a"));
        }
        assert_eq!(q.pending(), 1);
        assert_eq!(q.dequeue().await.unwrap().name, "a");
        assert_eq!(q.pending(), 0);
        let none = tokio::time::timeout(Duration::from_millis(20), q.dequeue()).await;
        assert!(none.is_err(), "only one delivery expected");

        // Reopened once taken.
        q.enqueue(ev("a"));
        assert_eq!(q.dequeue().await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn coalescing_keeps_the_larger_retry_count() {
        let q = DedupQueue::with_capacity(4);
        q.enqueue(ev("a"));
        let mut retry = ev("a");
        retry.attempts = 3;
        q.enqueue(retry);
        assert_eq!(q.pending(), 1);
        assert_eq!(q.dequeue().await.unwrap().attempts(), 3);

        let mut retry = ev("b");
        retry.attempts = 2;
        q.enqueue(retry);
        q.enqueue(ev("b"));
        assert_eq!(q.dequeue().await.unwrap().attempts(), 2);
    }

    #[tokio::test]
    async fn overflow_preserves_arrival_order_without_blocking() {
        let q = DedupQueue::with_capacity(2);
        for i in 0..6 {
            q.enqueue(ev(&format!("e{}", i)));
        }
        let mut got = Vec::new();
        for _ in 0..6 {
            got.push(q.dequeue().await.unwrap().name);
        }
        assert_eq!(got, vec!["e0", "e1", "e2", "e3", "e4", "e5"]);
    }

    #[tokio::test]
    async fn stop_releases_waiting_consumers() {
        let q = std::sync::Arc::new(DedupQueue::with_capacity(1));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.dequeue().await });
        tokio::task::yield_now().await;
        q.stop();
        assert!(waiter.await.unwrap().is_none());
        q.enqueue(ev("late"));
        assert!(q.dequeue().await.is_none());
    }
}
