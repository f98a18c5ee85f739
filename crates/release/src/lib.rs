//! Hangar release protocol: takeoff, descent, mayday and turbulence.
//!
//! A release is the set of revisions sharing a `(name, namespace)` identity. Takeoff
//! evaluates a flight and rolls the release forward, descent moves the active pointer
//! back, mayday tears everything down and turbulence reports or repairs drift.

#![forbid(unsafe_code)]

mod apply;
mod params;
mod pilot;
mod prune;
mod turbulence;

pub use params::{DescentParams, IdentityFn, MaydayParams, PruneOpts, TakeoffParams, TurbulenceParams};
pub use pilot::{DescentOutcome, MaydayOutcome, Pilot, ResourceDiff, TakeoffOutcome};
pub use prune::{orphans, prune, PruneReport};
pub use turbulence::{Drift, DriftReport};
