//! Routes changes of tracked resources back to the instances interested in them.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use hangar_core::{Resource, Stages};
use hangar_ctrl::{Event, Handler, Kind, Outcome, SchedulerHandle, Trigger};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tracing::debug;

use crate::Mode;

/// Resource identity, exact or `ns/group/kind/*`, to the instance events it wakes.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    routes: Mutex<FxHashMap<String, FxHashSet<Event>>>,
}

impl EventDispatcher {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, key: String, event: Event) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.entry(key).or_default().insert(event);
        }
    }

    /// Forget every route of `event`.
    pub fn remove_event(&self, event: &Event) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.retain(|_, events| {
                events.remove(event);
                !events.is_empty()
            });
        }
    }

    /// Replace the routes of `event` for `mode` and return the kinds that need watching.
    pub fn track(&self, event: &Event, mode: Mode, stages: &Stages) -> Vec<Kind> {
        self.remove_event(event);
        if !mode.tracks() {
            return Vec::new();
        }
        let mut kinds = FxHashSet::default();
        for r in stages.flatten() {
            let key = match mode {
                Mode::Subscription => exact_key(r),
                _ => kind_key(&Kind::of(r), r.namespace()),
            };
            self.register(key, event.clone());
            kinds.insert(Kind::of(r));
        }
        let mut kinds: Vec<Kind> = kinds.into_iter().collect();
        kinds.sort();
        kinds
    }

    /// Instance events interested in a change to `r`.
    pub fn dispatch(&self, r: &Resource) -> Vec<Event> {
        let Ok(routes) = self.routes.lock() else { return Vec::new() };
        let mut out: FxHashSet<Event> = FxHashSet::default();
        for key in [exact_key(r), kind_key(&Kind::of(r), r.namespace())] {
            if let Some(events) = routes.get(&key) {
                out.extend(events.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    pub fn len(&self) -> usize { self.routes.lock().map(|r| r.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

pub fn exact_key(r: &Resource) -> String { r.versionless_id().to_string() }

pub fn kind_key(kind: &Kind, namespace: Option<&str>) -> String {
    probe(kind, namespace, "*").versionless_id().to_string()
}

/// Minimal document carrying an event's identity.
pub(crate) fn probe(kind: &Kind, namespace: Option<&str>, name: &str) -> Resource {
    let mut v = json!({"apiVersion": kind.api_version, "kind": kind.kind, "metadata": {"name": name}});
    if let Some(ns) = namespace {
        v["metadata"]["namespace"] = json!(ns);
    }
    Resource::from_value_unchecked(v)
}

/// Bound to every kind a tracking instance produced; turns their events into instance events.
pub struct DispatchHandler {
    dispatcher: Arc<EventDispatcher>,
    scheduler: SchedulerHandle,
}

impl DispatchHandler {
    pub fn new(dispatcher: Arc<EventDispatcher>, scheduler: SchedulerHandle) -> Self { Self { dispatcher, scheduler } }
}

#[async_trait::async_trait]
impl Handler for DispatchHandler {
    async fn handle(&self, event: &Event) -> Result<Outcome> {
        let changed = probe(&event.kind, event.namespace.as_deref(), &event.name);
        for target in self.dispatcher.dispatch(&changed) {
            debug!(source = %event, target = %target, "dispatching");
            counter!("dispatch_total", 1u64);
            self.scheduler.enqueue(target.with_trigger(Trigger::Dispatch));
        }
        Ok(Outcome::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(ns: &str, name: &str) -> Resource {
        Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": ns}})).unwrap()
    }

    fn instance(name: &str) -> Event { Event::new(Kind::new("examples.com/v1", "Backend"), Some("apps"), name) }

    #[test]
    fn subscription_routes_only_exact_resources() {
        let d = EventDispatcher::new();
        let kinds = d.track(&instance("b"), Mode::Subscription, &Stages::new(vec![vec![cm("apps", "a")]]));
        assert_eq!(kinds, vec![Kind::new("v1", "ConfigMap")]);
        assert_eq!(d.dispatch(&cm("apps", "a")), vec![instance("b")]);
        assert!(d.dispatch(&cm("apps", "other")).is_empty());
    }

    #[test]
    fn dynamic_routes_whole_kind_in_namespace() {
        let d = EventDispatcher::new();
        d.track(&instance("b"), Mode::Dynamic, &Stages::new(vec![vec![cm("apps", "a")]]));
        assert_eq!(d.dispatch(&cm("apps", "other")), vec![instance("b")]);
        assert!(d.dispatch(&cm("elsewhere", "a")).is_empty());
    }

    #[test]
    fn retracking_replaces_routes() {
        let d = EventDispatcher::new();
        let stages = Stages::new(vec![vec![cm("apps", "a")]]);
        d.track(&instance("b"), Mode::Subscription, &stages);
        d.track(&instance("c"), Mode::Subscription, &stages);
        assert_eq!(d.dispatch(&cm("apps", "a")).len(), 2);

        assert!(d.track(&instance("b"), Mode::Standard, &stages).is_empty());
        assert_eq!(d.dispatch(&cm("apps", "a")), vec![instance("c")]);
        d.remove_event(&instance("c"));
        assert!(d.is_empty());
    }
}
