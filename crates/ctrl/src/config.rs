use std::time::Duration;

/// Maximum delay between retries of a failing event.
pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Worker count, at least 1.
    pub concurrency: usize,
    /// Dedup queue channel capacity, never below `concurrency`.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let concurrency = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self::new(concurrency, 1024)
    }
}

impl SchedulerConfig {
    pub fn new(concurrency: usize, queue_capacity: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self { concurrency, queue_capacity: queue_capacity.max(concurrency) }
    }

    /// Read `HANGAR_CONCURRENCY` and `HANGAR_QUEUE_CAP`, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let concurrency = std::env::var("HANGAR_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(d.concurrency);
        let cap = std::env::var("HANGAR_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(d.queue_capacity);
        Self::new(concurrency, cap)
    }
}

/// `min(2^attempts s, 15m)` before jitter.
pub fn backoff(attempts: u32) -> Duration {
    if attempts >= 10 {
        return MAX_BACKOFF;
    }
    Duration::from_secs(1u64 << attempts).min(MAX_BACKOFF)
}

/// Backoff with ±10% jitter, clamped so it never exceeds [`MAX_BACKOFF`].
pub fn retry_delay(attempts: u32) -> Duration { with_jitter(backoff(attempts), 0.10).min(MAX_BACKOFF) }

/// Spread `d` uniformly within ±`fraction`.
pub fn with_jitter(d: Duration, fraction: f64) -> Duration {
    use rand::Rng;
    let factor = 1.0 + rand::thread_rng().gen_range(-fraction..=fraction);
    Duration::from_millis((d.as_millis() as f64 * factor).round() as u64)
}
