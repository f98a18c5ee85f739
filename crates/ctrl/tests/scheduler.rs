#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use hangar_core::Resource;
use hangar_ctrl::{Event, Handler, Kind, Outcome, Scheduler, SchedulerConfig};
use hangar_kubehub::{memory::MemoryCluster, ApplyOpts, ResourceClient};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn cm(name: &str, data: &str) -> Resource {
    Resource::from_value(serde_json::json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "ns"},
        "data": {"k": data}
    }))
    .unwrap()
}

fn configmaps() -> Kind { Kind::new("v1", "ConfigMap") }

struct Harness {
    cluster: Arc<MemoryCluster>,
    scheduler: Arc<Scheduler>,
    ctx: CancellationToken,
    run: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn start(concurrency: usize) -> Harness {
    let cluster = Arc::new(MemoryCluster::new());
    let scheduler = Arc::new(Scheduler::new(cluster.clone(), SchedulerConfig::new(concurrency, 16)));
    let ctx = CancellationToken::new();
    let run = tokio::spawn({
        let s = scheduler.clone();
        let ctx = ctx.clone();
        async move { s.run(ctx).await }
    });
    Harness { cluster, scheduler, ctx, run }
}

#[derive(Default)]
struct Serial {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait::async_trait]
impl Handler for Serial {
    async fn handle(&self, _event: &Event) -> anyhow::Result<Outcome> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Outcome::done())
    }
}

#[tokio::test(start_paused = true)]
async fn same_key_is_serialized_and_redelivered_once() {
    let h = start(4);
    h.cluster.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
    let handler = Arc::new(Serial::default());
    h.scheduler.register_kind(configmaps(), handler.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    for _ in 0..5 {
        h.scheduler.enqueue(Event::new(configmaps(), Some("ns"), "a"));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2, "one redelivery after the in-flight run");
    assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);

    h.ctx.cancel();
    h.run.await.unwrap().unwrap();
}

#[derive(Default)]
struct AlwaysFails {
    calls: Mutex<Vec<Instant>>,
}

#[async_trait::async_trait]
impl Handler for AlwaysFails {
    async fn handle(&self, _event: &Event) -> anyhow::Result<Outcome> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(Instant::now());
        }
        Err(anyhow!("always failing"))
    }
}

#[tokio::test(start_paused = true)]
async fn failing_handler_backs_off_exponentially_with_jitter() {
    let h = start(2);
    h.cluster.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
    let handler = Arc::new(AlwaysFails::default());
    h.scheduler.register_kind(configmaps(), handler.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(150)).await;
    let calls = handler.calls.lock().unwrap().clone();
    assert!(calls.len() >= 7, "calls={}", calls.len());
    for (n, pair) in calls.windows(2).take(6).enumerate() {
        let delay = (pair[1] - pair[0]).as_secs_f64();
        let base = 2f64.powi(n as i32);
        assert!(delay >= base * 0.9 - 0.01 && delay <= base * 1.1 + 0.01, "attempt {} delay {}", n, delay);
    }

    h.ctx.cancel();
    h.run.await.unwrap().unwrap();
}

#[derive(Default)]
struct PanicsOnce {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Handler for PanicsOnce {
    async fn handle(&self, event: &Event) -> anyhow::Result<Outcome> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 && event.name == "boom" {
            panic!("handler exploded");
        }
        Ok(Outcome::done())
    }
}

#[tokio::test(start_paused = true)]
async fn handler_panic_is_recovered_and_retried() {
    let h = start(1);
    h.cluster.apply(&cm("boom", "1"), ApplyOpts::default()).await.unwrap();
    let handler = Arc::new(PanicsOnce::default());
    h.scheduler.register_kind(configmaps(), handler.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2, "panic retried through backoff");

    // The single worker survived and keeps processing.
    h.cluster.apply(&cm("other", "1"), ApplyOpts::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    h.ctx.cancel();
    h.run.await.unwrap().unwrap();
}

#[derive(Default)]
struct Blocking {
    started: AtomicBool,
    finished: AtomicUsize,
    teardowns: AtomicUsize,
    release: Notify,
}

#[async_trait::async_trait]
impl Handler for Blocking {
    async fn handle(&self, _event: &Event) -> anyhow::Result<Outcome> {
        self.started.store(true, Ordering::SeqCst);
        self.release.notified().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::done())
    }

    async fn teardown(&self) { self.teardowns.fetch_add(1, Ordering::SeqCst); }
}

#[tokio::test]
async fn shutdown_kind_drains_in_flight_work_and_is_idempotent() {
    let h = start(2);
    h.cluster.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
    let handler = Arc::new(Blocking::default());
    h.scheduler.register_kind(configmaps(), handler.clone()).await.unwrap();
    while !handler.started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first = tokio::spawn({
        let s = h.scheduler.clone();
        async move { s.shutdown_kind(&configmaps()).await }
    });
    let second = tokio::spawn({
        let s = h.scheduler.clone();
        async move { s.shutdown_kind(&configmaps()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.is_finished() && !second.is_finished(), "shutdown must wait for the running handler");
    assert!(!h.scheduler.is_listening(&configmaps()));

    handler.release.notify_waiters();
    first.await.unwrap();
    second.await.unwrap();
    h.scheduler.shutdown_kind(&configmaps()).await;

    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    assert_eq!(handler.teardowns.load(Ordering::SeqCst), 1);

    h.ctx.cancel();
    h.run.await.unwrap().unwrap();
}

#[derive(Default)]
struct Counter {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Handler for Counter {
    async fn handle(&self, _event: &Event) -> anyhow::Result<Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::done())
    }
}

#[tokio::test(start_paused = true)]
async fn metadata_churn_does_not_trigger() {
    let h = start(2);
    h.cluster.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
    let handler = Arc::new(Counter::default());
    h.scheduler.register_kind(configmaps(), handler.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // Same content, new resourceVersion.
    h.cluster.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
    h.cluster.set_status(&cm("a", "1"), serde_json::json!({"seen": true})).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    h.cluster.apply(&cm("a", "2"), ApplyOpts::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    h.cluster.delete(&cm("a", "2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    h.ctx.cancel();
    h.run.await.unwrap().unwrap();
}

#[derive(Default)]
struct Slow {
    done: AtomicBool,
    started: AtomicBool,
}

#[async_trait::async_trait]
impl Handler for Slow {
    async fn handle(&self, _event: &Event) -> anyhow::Result<Outcome> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.done.store(true, Ordering::SeqCst);
        Ok(Outcome::done())
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_running_handlers_finish() {
    let h = start(1);
    h.cluster.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
    let handler = Arc::new(Slow::default());
    h.scheduler.register_kind(configmaps(), handler.clone()).await.unwrap();
    while !handler.started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.ctx.cancel();
    h.run.await.unwrap().unwrap();
    assert!(handler.done.load(Ordering::SeqCst), "handler must not be aborted mid-run");
    assert!(!h.scheduler.is_listening(&configmaps()));
}

#[tokio::test]
async fn registering_unknown_kind_fails() {
    let h = start(1);
    let err = h
        .scheduler
        .register_kind(Kind::new("x.dev/v1", "Missing"), Arc::new(Counter::default()))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("failed to resolve kind Missing.x.dev"), "{:#}", err);
    h.ctx.cancel();
    h.run.await.unwrap().unwrap();
}
