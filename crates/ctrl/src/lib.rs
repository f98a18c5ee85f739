//! Hangar controller scheduling engine.
//!
//! A [`Scheduler`] owns one [`DedupQueue`] and a fixed pool of workers. Kinds are bound to
//! [`Handler`]s at runtime; each binding watches its kind and enqueues events. Events for the
//! same identity never run concurrently, failures back off exponentially with jitter, and
//! handler panics are caught and retried like errors.

#![forbid(unsafe_code)]

mod binding;
mod config;
mod event;
mod queue;
mod scheduler;

pub use binding::Phase;
pub use config::{backoff, retry_delay, with_jitter, SchedulerConfig, MAX_BACKOFF};
pub use event::{Event, Kind, Outcome, Trigger};
pub use queue::DedupQueue;
pub use scheduler::{Handler, Scheduler, SchedulerHandle};
