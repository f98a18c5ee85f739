//! Controller scheduler: binds kinds to handlers and runs a fixed worker pool over one dedup queue.

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use futures::{FutureExt, StreamExt};
use hangar_core::json::semantic_eq;
use hangar_kubehub::{ResourceClient, WatchEvent, WatchStream};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::binding::Binding;
use crate::config::{retry_delay, SchedulerConfig};
use crate::{DedupQueue, Event, Kind, Outcome, Trigger};

/// Reconciliation logic bound to one kind.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> Result<Outcome>;

    /// Runs once after the kind is shut down and every in-flight run has finished.
    async fn teardown(&self) {}
}

type Registry = FxHashMap<Kind, Arc<Binding>>;

struct Inner {
    client: Arc<dyn ResourceClient>,
    config: SchedulerConfig,
    queue: DedupQueue,
    registry: ArcSwap<Registry>,
    /// Serialises register/shutdown per kind.
    kind_locks: Mutex<FxHashMap<Kind, Arc<tokio::sync::Mutex<()>>>>,
    /// Keys being handled, each with a token cancelled when the run ends.
    active: Mutex<FxHashMap<String, CancellationToken>>,
    timers: Mutex<FxHashMap<String, (Kind, JoinHandle<()>)>>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Non-owning handle for handlers that need to enqueue or (de)register kinds.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Weak<Inner>,
}

impl Scheduler {
    pub fn new(client: Arc<dyn ResourceClient>, config: SchedulerConfig) -> Self {
        let config = SchedulerConfig::new(config.concurrency, config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                client,
                queue: DedupQueue::with_capacity(config.queue_capacity),
                config,
                registry: ArcSwap::from_pointee(Registry::default()),
                kind_locks: Mutex::new(FxHashMap::default()),
                active: Mutex::new(FxHashMap::default()),
                timers: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub fn handle(&self) -> SchedulerHandle { SchedulerHandle { inner: Arc::downgrade(&self.inner) } }

    pub fn config(&self) -> SchedulerConfig { self.inner.config }

    /// Bind `handler` to `kind` and start watching it. An existing binding is shut down and
    /// drained before the new one is installed.
    pub async fn register_kind(&self, kind: Kind, handler: Arc<dyn Handler>) -> Result<()> {
        self.inner.register_kind(kind, handler, true).await.map(|_| ())
    }

    /// Idempotent; returns once in-flight work for the kind has drained and teardown ran.
    pub async fn shutdown_kind(&self, kind: &Kind) { self.inner.shutdown_kind(kind).await }

    pub fn is_listening(&self, kind: &Kind) -> bool { self.inner.is_listening(kind) }

    pub fn enqueue(&self, event: Event) { self.inner.queue.enqueue(event) }

    /// Run the worker pool until `ctx` is cancelled. Handlers already running finish first;
    /// every binding is then shut down.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        let n = self.inner.config.concurrency;
        info!(concurrency = n, "scheduler started");
        let mut workers = JoinSet::new();
        for _ in 0..n {
            workers.spawn(worker(self.inner.clone(), ctx.clone()));
        }
        let mut crashed = 0usize;
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker exited abnormally");
                crashed += 1;
                ctx.cancel();
            }
        }
        self.inner.queue.stop();
        if let Ok(mut timers) = self.inner.timers.lock() {
            for (_, (_, t)) in timers.drain() {
                t.abort();
            }
        }
        let kinds: Vec<Kind> = self.inner.registry.load().keys().cloned().collect();
        for kind in kinds {
            self.inner.shutdown_kind(&kind).await;
        }
        info!("scheduler stopped");
        if crashed > 0 {
            return Err(anyhow!("{} scheduler worker(s) crashed", crashed));
        }
        Ok(())
    }
}

impl SchedulerHandle {
    fn upgrade(&self) -> Result<Arc<Inner>> { self.inner.upgrade().ok_or_else(|| anyhow!("scheduler has stopped")) }

    pub async fn register_kind(&self, kind: Kind, handler: Arc<dyn Handler>) -> Result<()> {
        self.upgrade()?.register_kind(kind, handler, true).await.map(|_| ())
    }

    /// Register only when nothing is bound to `kind` yet. Returns whether a binding was created.
    pub async fn ensure_kind(&self, kind: Kind, handler: Arc<dyn Handler>) -> Result<bool> {
        self.upgrade()?.register_kind(kind, handler, false).await
    }

    pub async fn shutdown_kind(&self, kind: &Kind) {
        if let Ok(inner) = self.upgrade() {
            inner.shutdown_kind(kind).await;
        }
    }

    pub fn is_listening(&self, kind: &Kind) -> bool { self.inner.upgrade().map(|i| i.is_listening(kind)).unwrap_or(false) }

    pub fn enqueue(&self, event: Event) {
        if let Some(inner) = self.inner.upgrade() {
            inner.queue.enqueue(event);
        }
    }
}

async fn worker(inner: Arc<Inner>, ctx: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            ev = inner.queue.dequeue() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };
        inner.process(event, &ctx).await;
    }
}

/// Releases an active key; waiters for the key are woken after removal.
struct ActiveGuard<'a> {
    inner: &'a Inner,
    key: String,
    done: CancellationToken,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.inner.active.lock() {
            active.remove(&self.key);
        }
        self.done.cancel();
    }
}

impl Inner {
    fn is_listening(&self, kind: &Kind) -> bool {
        self.registry.load().get(kind).map(|b| b.phase() == crate::binding::Phase::Active).unwrap_or(false)
    }

    fn kind_lock(&self, kind: &Kind) -> Arc<tokio::sync::Mutex<()>> {
        match self.kind_locks.lock() {
            Ok(mut locks) => locks.entry(kind.clone()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn register_kind(self: &Arc<Self>, kind: Kind, handler: Arc<dyn Handler>, replace: bool) -> Result<bool> {
        let lock = self.kind_lock(&kind);
        let _guard = lock.lock().await;
        let existing = self.registry.load().get(&kind).cloned();
        if existing.is_some() && !replace {
            return Ok(false);
        }
        self.client
            .resolve(&kind.api_version, &kind.kind)
            .await
            .with_context(|| format!("failed to resolve kind {}", kind))?;
        let stream = self
            .client
            .watch(&kind.api_version, &kind.kind)
            .await
            .with_context(|| format!("failed to watch {}", kind))?;
        if let Some(old) = existing {
            info!(kind = %kind, "replacing handler");
            old.shutdown().await;
            self.abort_timers(&kind);
        }
        let binding = Binding::new(kind.clone(), handler);
        self.registry.rcu(|m| {
            let mut m = Registry::clone(m);
            m.insert(kind.clone(), binding.clone());
            m
        });
        self.spawn_watch(&binding, stream);
        info!(kind = %kind, "kind registered");
        Ok(true)
    }

    async fn shutdown_kind(&self, kind: &Kind) {
        let lock = self.kind_lock(kind);
        let _guard = lock.lock().await;
        let Some(binding) = self.registry.load().get(kind).cloned() else {
            debug!(kind = %kind, "shutdown of unbound kind");
            return;
        };
        binding.shutdown().await;
        self.registry.rcu(|m| {
            let mut m = Registry::clone(m);
            if m.get(kind).map(|b| Arc::ptr_eq(b, &binding)).unwrap_or(false) {
                m.remove(kind);
            }
            m
        });
        self.abort_timers(kind);
    }

    fn abort_timers(&self, kind: &Kind) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.retain(|_, (k, t)| {
                if k == kind {
                    t.abort();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Feed watch events for one binding into the queue, skipping updates that only churn metadata.
    fn spawn_watch(self: &Arc<Self>, binding: &Arc<Binding>, mut stream: WatchStream) {
        let weak = Arc::downgrade(self);
        let kind = binding.kind.clone();
        let stop = binding.watch.clone();
        tokio::spawn(async move {
            let mut seen: FxHashMap<String, Json> = FxHashMap::default();
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break,
                    n = stream.next() => n,
                };
                let Some(next) = next else {
                    warn!(kind = %kind, "watcher stream ended");
                    break;
                };
                let Some(inner) = weak.upgrade() else { break };
                match next {
                    Ok(WatchEvent::Applied(r)) => {
                        let id = r.id().to_string();
                        if seen.get(&id).map(|prev| semantic_eq(prev, r.as_value())).unwrap_or(false) {
                            continue;
                        }
                        inner.queue.enqueue(Event::for_resource(&r, Trigger::Applied));
                        seen.insert(id, r.into_value());
                    }
                    Ok(WatchEvent::Deleted(r)) => {
                        seen.remove(&r.id().to_string());
                        inner.queue.enqueue(Event::for_resource(&r, Trigger::Deleted));
                    }
                    Ok(WatchEvent::Restarted(list)) => {
                        debug!(kind = %kind, count = list.len(), "watch relisted");
                        let mut next_seen = FxHashMap::default();
                        for r in list {
                            let id = r.id().to_string();
                            let unchanged = seen.get(&id).map(|prev| semantic_eq(prev, r.as_value())).unwrap_or(false);
                            if !unchanged {
                                inner.queue.enqueue(Event::for_resource(&r, Trigger::StartUp));
                            }
                            next_seen.insert(id, r.into_value());
                        }
                        for (id, gone) in seen.drain() {
                            if !next_seen.contains_key(&id) {
                                let r = hangar_core::Resource::from_value_unchecked(gone);
                                inner.queue.enqueue(Event::for_resource(&r, Trigger::Deleted));
                            }
                        }
                        seen = next_seen;
                    }
                    Err(e) => warn!(kind = %kind, error = %e, "watch error"),
                }
            }
            debug!(kind = %kind, "watch loop stopped");
        });
    }

    async fn process(self: &Arc<Self>, event: Event, ctx: &CancellationToken) {
        let key = event.key();
        let done = CancellationToken::new();
        let busy = {
            let Ok(mut active) = self.active.lock() else { return };
            match active.get(&key) {
                Some(tok) => Some(tok.clone()),
                None => {
                    active.insert(key.clone(), done.clone());
                    None
                }
            }
        };
        if let Some(busy) = busy {
            // Never block a worker on a busy key: redeliver once the current run ends.
            let inner = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    _ = busy.cancelled() => inner.queue.enqueue(event),
                }
            });
            return;
        }
        let _active = ActiveGuard { inner: &**self, key: key.clone(), done };

        if let Ok(mut timers) = self.timers.lock() {
            if let Some((_, t)) = timers.remove(&key) {
                t.abort();
            }
        }

        let Some(binding) = self.registry.load().get(&event.kind).cloned() else {
            debug!(event = %key, "no handler bound; dropping event");
            return;
        };
        let Some(_slot) = binding.enter() else {
            debug!(event = %key, "kind is shutting down; dropping event");
            return;
        };

        let span = info_span!("reconcile", loop_id = %loop_id(), event = %key, attempt = event.attempts, trigger = ?event.trigger);
        async {
            info!("processing event");
            counter!("reconcile_total", 1u64);
            let started = Instant::now();
            let result = match AssertUnwindSafe(binding.handler.handle(&event)).catch_unwind().await {
                Ok(res) => res,
                Err(payload) => {
                    counter!("reconcile_panics", 1u64);
                    let msg = panic_message(payload.as_ref());
                    error!(panic = %msg, backtrace = %Backtrace::force_capture(), "caught handler panic");
                    Err(anyhow!("handler panicked: {}", msg))
                }
            };
            histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);

            let (outcome, err) = match result {
                Ok(o) => (o, None),
                Err(e) => (Outcome::default(), Some(e)),
            };
            let requeue = outcome.requeue || !outcome.requeue_after.is_zero() || err.is_some();
            let delay = if requeue {
                let d = if outcome.requeue_after.is_zero() { retry_delay(event.attempts) } else { outcome.requeue_after };
                self.schedule(event.clone(), d, err.is_some());
                Some(d)
            } else {
                None
            };
            match err {
                Some(e) => {
                    counter!("reconcile_errors", 1u64);
                    error!(error = %format!("{:#}", e), requeue_after = ?delay, "error processing event");
                }
                None => info!(elapsed_ms = started.elapsed().as_millis() as u64, requeue_after = ?delay, "reconcile successful"),
            }
        }
        .instrument(span)
        .await;
    }

    fn schedule(self: &Arc<Self>, mut event: Event, delay: Duration, failed: bool) {
        event.attempts = if failed { event.attempts.saturating_add(1) } else { 0 };
        event.trigger = Trigger::Requeue;
        let key = event.key();
        let kind = event.kind.clone();
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.queue.enqueue(event);
            }
        });
        if let Ok(mut timers) = self.timers.lock() {
            if let Some((_, old)) = timers.insert(key, (kind, timer)) {
                old.abort();
            }
        }
    }
}

fn loop_id() -> String { hex::encode(rand::random::<[u8; 4]>()) }

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
