//! Hangar kubehub: the resource client boundary, its kube-rs and in-memory
//! implementations, readiness predicates and watch streams.

#![forbid(unsafe_code)]

mod client;
mod cluster;
pub mod memory;
mod readiness;

pub use client::{owned_by, ownership_matches, ApplyOpts, ClientError, Mapping, ResourceClient, WatchEvent, WatchStream};
pub use cluster::{KubeClient, FIELD_MANAGER};
pub use readiness::{is_ready, wait_all, wait_ready, WaitOptions, AIRWAY_KIND};
