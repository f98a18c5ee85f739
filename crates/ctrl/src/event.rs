use std::fmt;
use std::time::Duration;

use hangar_core::Resource;

/// A resource kind a handler can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind {
    pub api_version: String,
    pub kind: String,
}

impl Kind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    pub fn of(r: &Resource) -> Self { Self::new(r.api_version(), r.kind()) }

    pub fn group(&self) -> &str { self.api_version.split_once('/').map(|(g, _)| g).unwrap_or("") }
}

/// `Kind.group`, or just `Kind` for the core group.
impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group() {
            "" => f.write_str(&self.kind),
            g => write!(f, "{}.{}", self.kind, g),
        }
    }
}

/// What caused an event to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartUp,
    Applied,
    Deleted,
    Requeue,
    Dispatch,
}

/// Identifies one resource instance to reconcile. Handlers re-read current state.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub namespace: Option<String>,
    pub kind: Kind,
    pub trigger: Trigger,
    pub(crate) attempts: u32,
}

impl Event {
    pub fn new(kind: Kind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.filter(|s| !s.is_empty()).map(str::to_string),
            kind,
            trigger: Trigger::Applied,
            attempts: 0,
        }
    }

    pub fn for_resource(r: &Resource, trigger: Trigger) -> Self {
        Self { trigger, ..Self::new(Kind::of(r), r.namespace(), r.name()) }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Consecutive failures so far; not part of the identity.
    pub fn attempts(&self) -> u32 { self.attempts }

    /// Identity key `namespace/kind:name`.
    pub fn key(&self) -> String {
        format!("{}/{}:{}", self.namespace.as_deref().unwrap_or(""), self.kind, self.name)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.namespace == other.namespace && self.kind == other.kind
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.namespace.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

/// Handler verdict: requeue now-ish (with backoff) or after a fixed delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub requeue: bool,
    pub requeue_after: Duration,
}

impl Outcome {
    pub fn done() -> Self { Self::default() }
    pub fn requeue() -> Self { Self { requeue: true, requeue_after: Duration::ZERO } }
    pub fn requeue_after(after: Duration) -> Self { Self { requeue: false, requeue_after: after } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_attempts_and_trigger() {
        let a = Event::new(Kind::new("apps/v1", "Deployment"), Some("ns"), "web");
        let mut b = a.clone().with_trigger(Trigger::Requeue);
        b.attempts = 3;
        assert_eq!(a.key(), "ns/Deployment.apps:web");
        assert_eq!(a.key(), b.key());
        assert_eq!(a, b);
        let c = Event::new(Kind::new("v1", "Namespace"), None, "x");
        assert_eq!(c.key(), "/Namespace:x");
    }
}
