use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hangar_core::Resource;
use hangar_flight::Flight;
use serde_json::Value as Json;

/// Resources matching this predicate are dropped from the flight output before anything else
/// happens. ATC instances use it to let a flight emit its own parent.
pub type IdentityFn = Arc<dyn Fn(&Resource) -> bool + Send + Sync>;

/// What happens to Namespaces and CRDs that leave a release. Unless removal is requested
/// they are orphaned: ownership labels and owner references are stripped and the object stays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOpts {
    pub remove_crds: bool,
    pub remove_namespaces: bool,
}

#[derive(Clone)]
pub struct TakeoffParams {
    pub release: String,
    /// Release namespace; `default` when empty.
    pub namespace: String,
    pub flight: Flight,
    pub force_conflicts: bool,
    pub force_ownership: bool,
    /// Allow resources outside the release namespace.
    pub cross_namespace: bool,
    /// Server dry-run only; nothing is written and no revision is recorded.
    pub dry_run: bool,
    /// Compute the change against the active revision without touching the cluster.
    pub diff_only: bool,
    /// Keep at most this many revisions; 0 keeps all.
    pub history_cap: usize,
    /// Wait this long for readiness after the last stage; zero skips the wait.
    pub wait: Duration,
    pub poll: Duration,
    pub lock: bool,
    pub lock_holder: String,
    pub identity: Option<IdentityFn>,
    pub owner_references: Vec<Json>,
    pub extra_labels: Vec<(String, String)>,
    pub prune: PruneOpts,
}

impl TakeoffParams {
    pub fn new(release: impl Into<String>, namespace: impl Into<String>, flight: Flight) -> Self {
        Self {
            release: release.into(),
            namespace: namespace.into(),
            flight,
            force_conflicts: false,
            force_ownership: false,
            cross_namespace: false,
            dry_run: false,
            diff_only: false,
            history_cap: 0,
            wait: Duration::ZERO,
            poll: Duration::from_secs(1),
            lock: false,
            lock_holder: "hangar".into(),
            identity: None,
            owner_references: Vec::new(),
            extra_labels: Vec::new(),
            prune: PruneOpts::default(),
        }
    }
}

impl fmt::Debug for TakeoffParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TakeoffParams")
            .field("release", &self.release)
            .field("namespace", &self.namespace)
            .field("module", &self.flight.module.reference)
            .field("dry_run", &self.dry_run)
            .field("diff_only", &self.diff_only)
            .field("identity", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct DescentParams {
    pub release: String,
    pub namespace: String,
    pub revision: u64,
    pub wait: Duration,
    pub poll: Duration,
    pub lock: bool,
    pub lock_holder: String,
    pub prune: PruneOpts,
}

impl DescentParams {
    pub fn new(release: impl Into<String>, namespace: impl Into<String>, revision: u64) -> Self {
        Self {
            release: release.into(),
            namespace: namespace.into(),
            revision,
            wait: Duration::ZERO,
            poll: Duration::from_secs(1),
            lock: false,
            lock_holder: "hangar".into(),
            prune: PruneOpts::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaydayParams {
    pub release: String,
    pub namespace: String,
    pub prune: PruneOpts,
}

#[derive(Debug, Clone, Default)]
pub struct TurbulenceParams {
    pub release: String,
    pub namespace: String,
    /// Compare only the fields the release declares.
    pub conflicts_only: bool,
    /// Re-apply drifted resources, forcing conflicts.
    pub fix: bool,
}
