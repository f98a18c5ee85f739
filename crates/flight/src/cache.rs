//! Module cache: each reference loads once, idle entries expire on a ticker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{EvalError, Module};

struct Entry {
    module: OnceCell<Arc<Module>>,
    last_used: Mutex<Instant>,
}

impl Entry {
    fn touch(&self) {
        if let Ok(mut t) = self.last_used.lock() {
            *t = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_used.lock().map(|t| now.saturating_duration_since(*t)).unwrap_or_default()
    }
}

pub struct ModuleCache {
    entries: Mutex<FxHashMap<String, Arc<Entry>>>,
    ttl: Duration,
}

impl Default for ModuleCache {
    fn default() -> Self { Self::new(Duration::from_secs(600)) }
}

impl ModuleCache {
    pub fn new(ttl: Duration) -> Self { Self { entries: Mutex::new(FxHashMap::default()), ttl } }

    /// TTL from `HANGAR_MODULE_TTL_SECS` (default 600).
    pub fn from_env() -> Self {
        let secs = std::env::var("HANGAR_MODULE_TTL_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(600);
        Self::new(Duration::from_secs(secs))
    }

    pub fn ttl(&self) -> Duration { self.ttl }

    /// Load `reference` or return the cached module. Concurrent callers for the same
    /// reference share one load; a failed load is not cached.
    pub async fn get(&self, reference: &str) -> Result<Arc<Module>, EvalError> {
        let entry = {
            let mut entries = self.entries.lock().map_err(|_| poisoned(reference))?;
            entries
                .entry(reference.to_string())
                .or_insert_with(|| Arc::new(Entry { module: OnceCell::new(), last_used: Mutex::new(Instant::now()) }))
                .clone()
        };
        entry.touch();
        if let Some(m) = entry.module.get() {
            counter!("module_cache_hits", 1u64);
            return Ok(m.clone());
        }
        let module = entry
            .module
            .get_or_try_init(|| async {
                debug!(reference, "loading module");
                Module::load(reference).await.map(Arc::new)
            })
            .await?;
        Ok(module.clone())
    }

    /// Forget `reference` so the next [`get`](Self::get) reloads it.
    pub fn invalidate(&self, reference: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(reference);
        }
    }

    pub fn len(&self) -> usize { self.entries.lock().map(|e| e.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop entries idle for longer than the TTL. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else { return 0 };
        let before = entries.len();
        entries.retain(|_, e| e.idle_for(now) < self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            counter!("module_cache_evicted", evicted as u64);
            debug!(evicted, "module cache sweep");
        }
        evicted
    }

    /// Sweep every `interval` until `ctx` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, ctx: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(cache) = cache.upgrade() else { break };
                cache.sweep();
            }
        })
    }
}

fn poisoned(reference: &str) -> EvalError {
    EvalError::Load { reference: reference.to_string(), message: "module cache poisoned".into() }
}
