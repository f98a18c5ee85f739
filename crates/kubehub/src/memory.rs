//! In-memory [`ResourceClient`] for tests and local runs.
//!
//! Keeps a kinds registry (CRDs register their kinds when applied), a versionless object
//! store, label selectors, ownership enforcement, dry-run, watch broadcast and failure injection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use futures::StreamExt;
use hangar_core::Resource;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};
use tokio::sync::broadcast;

use crate::client::ownership_matches;
use crate::{ApplyOpts, ClientError, Mapping, ResourceClient, WatchEvent, WatchStream};

type KindKey = (String, String);

static BUILTIN_KINDS: Lazy<Vec<(&'static str, &'static str, &'static str, bool)>> = Lazy::new(|| {
    vec![
        ("v1", "Namespace", "namespaces", false),
        ("v1", "ConfigMap", "configmaps", true),
        ("v1", "Secret", "secrets", true),
        ("v1", "Service", "services", true),
        ("v1", "ServiceAccount", "serviceaccounts", true),
        ("v1", "Pod", "pods", true),
        ("apps/v1", "Deployment", "deployments", true),
        ("apps/v1", "ReplicaSet", "replicasets", true),
        ("apps/v1", "StatefulSet", "statefulsets", true),
        ("apps/v1", "DaemonSet", "daemonsets", true),
        ("batch/v1", "Job", "jobs", true),
        ("rbac.authorization.k8s.io/v1", "ClusterRole", "clusterroles", false),
        ("apiextensions.k8s.io/v1", "CustomResourceDefinition", "customresourcedefinitions", false),
    ]
});

#[derive(Debug, Clone)]
struct WatchMsg {
    group: String,
    kind: String,
    event: WatchEvent,
}

pub struct MemoryCluster {
    kinds: RwLock<FxHashMap<KindKey, Mapping>>,
    objects: Mutex<BTreeMap<String, Json>>,
    failures: Mutex<FxHashMap<String, ClientError>>,
    rv: AtomicU64,
    writes: AtomicUsize,
    events: broadcast::Sender<WatchMsg>,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let mut kinds = FxHashMap::default();
        for (av, kind, plural, namespaced) in BUILTIN_KINDS.iter() {
            kinds.insert((av.to_string(), kind.to_string()), Mapping { namespaced: *namespaced, plural: plural.to_string() });
        }
        let (events, _) = broadcast::channel(1024);
        Self {
            kinds: RwLock::new(kinds),
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(FxHashMap::default()),
            rv: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            events,
        }
    }

    pub fn register_kind(&self, api_version: &str, kind: &str, plural: &str, namespaced: bool) {
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.insert((api_version.to_string(), kind.to_string()), Mapping { namespaced, plural: plural.to_string() });
        }
    }

    /// Make every write to the resource described as `Kind/name` or `ns/Kind/name` fail.
    pub fn fail_on(&self, describe: &str, err: ClientError) {
        if let Ok(mut f) = self.failures.lock() {
            f.insert(describe.to_string(), err);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut f) = self.failures.lock() {
            f.clear();
        }
    }

    /// Number of persisted mutations so far (dry-runs excluded).
    pub fn writes(&self) -> usize { self.writes.load(Ordering::SeqCst) }

    /// All stored objects.
    pub fn objects(&self) -> Vec<Resource> {
        match self.objects.lock() {
            Ok(objs) => objs.values().cloned().map(Resource::from_value_unchecked).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Set the status of a stored object, as a controller on the server would.
    pub fn set_status(&self, resource: &Resource, status: Json) -> Result<(), ClientError> {
        let (key, _) = self.key(resource)?;
        let updated = {
            let mut objs = self.lock_objects()?;
            let obj = objs.get_mut(&key).ok_or_else(|| ClientError::NotFound(resource.describe()))?;
            obj["status"] = status;
            obj["metadata"]["resourceVersion"] = json!(self.next_rv().to_string());
            obj.clone()
        };
        self.emit(WatchEvent::Applied(Resource::from_value_unchecked(updated)));
        Ok(())
    }

    fn mapping(&self, api_version: &str, kind: &str) -> Result<Mapping, ClientError> {
        let kinds = self.kinds.read().map_err(|_| ClientError::Transport("kinds registry poisoned".into()))?;
        kinds.get(&(api_version.to_string(), kind.to_string())).cloned().ok_or_else(|| ClientError::UnknownKind {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        })
    }

    /// Versionless storage key plus the effective namespace.
    fn key(&self, r: &Resource) -> Result<(String, Option<String>), ClientError> {
        let mapping = self.mapping(r.api_version(), r.kind())?;
        let ns = if mapping.namespaced { Some(r.namespace().unwrap_or("default").to_string()) } else { None };
        let key = format!("{}/{}/{}/{}", r.group(), r.kind(), ns.as_deref().unwrap_or(""), r.name());
        Ok((key, ns))
    }

    fn lock_objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Json>>, ClientError> {
        self.objects.lock().map_err(|_| ClientError::Transport("object store poisoned".into()))
    }

    fn injected(&self, r: &Resource) -> Result<(), ClientError> {
        let failures = self.failures.lock().map_err(|_| ClientError::Transport("failures poisoned".into()))?;
        match failures.get(&r.describe()) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn next_rv(&self) -> u64 { self.rv.fetch_add(1, Ordering::SeqCst) }

    fn emit(&self, event: WatchEvent) {
        let r = match &event {
            WatchEvent::Applied(r) | WatchEvent::Deleted(r) => r,
            WatchEvent::Restarted(_) => return,
        };
        let msg = WatchMsg { group: r.group().to_string(), kind: r.kind().to_string(), event: event.clone() };
        let _ = self.events.send(msg);
    }

    /// Server-side effects of persisting an object: namespaces activate, CRDs establish and register kinds.
    fn server_side_effects(&self, obj: &mut Json) {
        let r = Resource::from_value_unchecked(obj.clone());
        if r.is_namespace() {
            obj["status"] = json!({"phase": "Active"});
        } else if r.is_crd() {
            obj["status"] = json!({"conditions": [{"type": "Established", "status": "True"}]});
            let spec = &obj["spec"];
            let group = spec["group"].as_str().unwrap_or("");
            let kind = spec["names"]["kind"].as_str().unwrap_or("");
            let plural = spec["names"]["plural"].as_str().unwrap_or("");
            let namespaced = spec["scope"].as_str() != Some("Cluster");
            for v in spec["versions"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(name) = v["name"].as_str() {
                    self.register_kind(&format!("{}/{}", group, name), kind, plural, namespaced);
                }
            }
        }
    }

    fn unregister_crd_kinds(&self, crd: &Json) {
        let spec = &crd["spec"];
        let group = spec["group"].as_str().unwrap_or("");
        let kind = spec["names"]["kind"].as_str().unwrap_or("");
        if let Ok(mut kinds) = self.kinds.write() {
            for v in spec["versions"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(name) = v["name"].as_str() {
                    kinds.remove(&(format!("{}/{}", group, name), kind.to_string()));
                }
            }
        }
    }

    fn stamp(&self, obj: &mut Json, ns: Option<&str>, live: Option<&Json>) {
        if let Some(ns) = ns {
            obj["metadata"]["namespace"] = json!(ns);
        }
        let rv = self.next_rv();
        obj["metadata"]["resourceVersion"] = json!(rv.to_string());
        match live {
            Some(live) => {
                obj["metadata"]["uid"] = live["metadata"]["uid"].clone();
                obj["metadata"]["creationTimestamp"] = live["metadata"]["creationTimestamp"].clone();
            }
            None => {
                obj["metadata"]["uid"] = json!(format!("00000000-0000-0000-0000-{:012}", rv));
                obj["metadata"]["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
            }
        }
    }
}

/// RFC 7386 JSON merge patch.
fn merge(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() {
                *target = Json::Object(serde_json::Map::new());
            }
            if let Json::Object(t) = target {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn labels_match(obj: &Json, labels: &[(&str, &str)]) -> bool {
    labels.iter().all(|(k, v)| obj["metadata"]["labels"].get(*k).and_then(Json::as_str) == Some(*v))
}

fn stale(desired: &Resource, live: &Json) -> bool {
    match desired.resource_version() {
        Some(rv) => live["metadata"]["resourceVersion"].as_str() != Some(rv),
        None => false,
    }
}

#[async_trait::async_trait]
impl ResourceClient for MemoryCluster {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<Mapping, ClientError> { self.mapping(api_version, kind) }

    async fn apply(&self, resource: &Resource, opts: ApplyOpts) -> Result<Resource, ClientError> {
        let (key, ns) = self.key(resource)?;
        self.injected(resource)?;
        let mut obj = resource.as_value().clone();
        let saved = {
            let mut objs = self.lock_objects()?;
            let live = objs.get(&key).cloned();
            if let (Some(live), false) = (&live, opts.force_ownership) {
                ownership_matches(resource, &Resource::from_value_unchecked(live.clone()))?;
            }
            if let Some(status) = live.as_ref().and_then(|l| l.get("status")) {
                if obj.get("status").is_none() {
                    obj["status"] = status.clone();
                }
            }
            self.stamp(&mut obj, ns.as_deref(), live.as_ref());
            if opts.dry_run {
                return Ok(Resource::from_value_unchecked(obj));
            }
            self.server_side_effects(&mut obj);
            objs.insert(key, obj.clone());
            obj
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Applied(Resource::from_value_unchecked(saved.clone())));
        Ok(Resource::from_value_unchecked(saved))
    }

    async fn get(&self, resource: &Resource) -> Result<Option<Resource>, ClientError> {
        let (key, _) = self.key(resource)?;
        let objs = self.lock_objects()?;
        Ok(objs.get(&key).cloned().map(Resource::from_value_unchecked))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &[(&str, &str)],
    ) -> Result<Vec<Resource>, ClientError> {
        let mapping = self.mapping(api_version, kind)?;
        let probe = Resource::from_value_unchecked(json!({"apiVersion": api_version, "kind": kind}));
        let prefix = format!("{}/{}/", probe.group(), kind);
        let objs = self.lock_objects()?;
        Ok(objs
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v)
            .filter(|v| match namespace {
                Some(ns) if mapping.namespaced => v["metadata"]["namespace"].as_str() == Some(ns),
                _ => true,
            })
            .filter(|v| labels_match(v, labels))
            .cloned()
            .map(Resource::from_value_unchecked)
            .collect())
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let (key, ns) = self.key(resource)?;
        self.injected(resource)?;
        let saved = {
            let mut objs = self.lock_objects()?;
            if objs.contains_key(&key) {
                return Err(ClientError::AlreadyExists(resource.describe()));
            }
            let mut obj = resource.as_value().clone();
            self.stamp(&mut obj, ns.as_deref(), None);
            self.server_side_effects(&mut obj);
            objs.insert(key, obj.clone());
            obj
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Applied(Resource::from_value_unchecked(saved.clone())));
        Ok(Resource::from_value_unchecked(saved))
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let (key, ns) = self.key(resource)?;
        self.injected(resource)?;
        let saved = {
            let mut objs = self.lock_objects()?;
            let live = objs.get(&key).cloned().ok_or_else(|| ClientError::NotFound(resource.describe()))?;
            if stale(resource, &live) {
                return Err(ClientError::Conflict(format!("{} has been modified", resource.describe())));
            }
            let mut obj = resource.as_value().clone();
            match live.get("status") {
                Some(s) => obj["status"] = s.clone(),
                None => {
                    if let Some(o) = obj.as_object_mut() {
                        o.remove("status");
                    }
                }
            }
            self.stamp(&mut obj, ns.as_deref(), Some(&live));
            objs.insert(key, obj.clone());
            obj
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Applied(Resource::from_value_unchecked(saved.clone())));
        Ok(Resource::from_value_unchecked(saved))
    }

    async fn update_status(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let (key, _) = self.key(resource)?;
        let saved = {
            let mut objs = self.lock_objects()?;
            let live = objs.get_mut(&key).ok_or_else(|| ClientError::NotFound(resource.describe()))?;
            if stale(resource, live) {
                return Err(ClientError::Conflict(format!("{} has been modified", resource.describe())));
            }
            live["status"] = resource.as_value().get("status").cloned().unwrap_or(Json::Null);
            live["metadata"]["resourceVersion"] = json!(self.next_rv().to_string());
            live.clone()
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Applied(Resource::from_value_unchecked(saved.clone())));
        Ok(Resource::from_value_unchecked(saved))
    }

    async fn merge_patch(&self, resource: &Resource, patch: &Json) -> Result<Resource, ClientError> {
        let (key, _) = self.key(resource)?;
        self.injected(resource)?;
        let saved = {
            let mut objs = self.lock_objects()?;
            let live = objs.get_mut(&key).ok_or_else(|| ClientError::NotFound(resource.describe()))?;
            merge(live, patch);
            live["metadata"]["resourceVersion"] = json!(self.next_rv().to_string());
            live.clone()
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Applied(Resource::from_value_unchecked(saved.clone())));
        Ok(Resource::from_value_unchecked(saved))
    }

    async fn delete(&self, resource: &Resource) -> Result<(), ClientError> {
        let (key, _) = self.key(resource)?;
        self.injected(resource)?;
        let removed = self.lock_objects()?.remove(&key).ok_or_else(|| ClientError::NotFound(resource.describe()))?;
        if resource.is_crd() {
            self.unregister_crd_kinds(&removed);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Deleted(Resource::from_value_unchecked(removed)));
        Ok(())
    }

    async fn watch(&self, api_version: &str, kind: &str) -> Result<WatchStream, ClientError> {
        let rx = self.events.subscribe();
        let initial = self.list(api_version, kind, None, &[]).await?;
        let probe = Resource::from_value_unchecked(json!({"apiVersion": api_version, "kind": kind}));
        let (group, kind) = (probe.group().to_string(), kind.to_string());
        let live = futures::stream::unfold(rx, move |mut rx| {
            let (group, kind) = (group.clone(), kind.clone());
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) if msg.group == group && msg.kind == kind => return Some((Ok(msg.event), rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(ClientError::Transport(format!("watch lagged by {} events", n))), rx))
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::once(async move { Ok(WatchEvent::Restarted(initial)) }).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::ReleaseRef;

    fn cm(name: &str, data: &str) -> Resource {
        Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}, "data": {"k": data}})).unwrap()
    }

    #[tokio::test]
    async fn apply_get_and_dry_run() {
        let c = MemoryCluster::new();
        c.apply(&cm("a", "1"), ApplyOpts { dry_run: true, ..Default::default() }).await.unwrap();
        assert!(c.get(&cm("a", "1")).await.unwrap().is_none());
        assert_eq!(c.writes(), 0);

        c.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
        let live = c.get(&cm("a", "x")).await.unwrap().unwrap();
        assert_eq!(live.as_value()["data"]["k"], "1");
        assert!(live.uid().is_some());
        assert_eq!(c.writes(), 1);
    }

    #[tokio::test]
    async fn apply_rejects_foreign_owner_unless_forced() {
        let c = MemoryCluster::new();
        let mut a = cm("x", "1");
        a.stamp_owner(&ReleaseRef::new("one", "ns"));
        c.apply(&a, ApplyOpts::default()).await.unwrap();

        let mut b = cm("x", "2");
        b.stamp_owner(&ReleaseRef::new("two", "ns"));
        let err = c.apply(&b, ApplyOpts::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::Ownership { .. }));
        assert!(c.check_ownership(&b).await.is_err());
        c.apply(&b, ApplyOpts { force_ownership: true, ..Default::default() }).await.unwrap();
    }

    #[tokio::test]
    async fn crd_registers_kind_and_unknown_kinds_fail() {
        let c = MemoryCluster::new();
        assert!(c.resolve("x.dev/v1", "Backend").await.unwrap_err().is_unknown_kind());
        let crd = Resource::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": {"name": "backends.x.dev"},
            "spec": {"group": "x.dev", "scope": "Namespaced", "names": {"kind": "Backend", "plural": "backends"}, "versions": [{"name": "v1", "served": true}]}
        }))
        .unwrap();
        c.apply(&crd, ApplyOpts::default()).await.unwrap();
        let m = c.resolve("x.dev/v1", "Backend").await.unwrap();
        assert!(m.namespaced);
        let live = c.get(&crd).await.unwrap().unwrap();
        assert!(crate::is_ready(&live).unwrap());
    }

    #[tokio::test]
    async fn update_detects_stale_resource_version() {
        let c = MemoryCluster::new();
        let live = c.create(&cm("a", "1")).await.unwrap();
        c.update(&live).await.unwrap();
        let err = c.update(&live).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(c.create(&cm("a", "1")).await.unwrap_err(), ClientError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn list_filters_namespace_and_labels() {
        let c = MemoryCluster::new();
        let mut a = cm("a", "1");
        a.set_label("team", "x");
        c.apply(&a, ApplyOpts::default()).await.unwrap();
        c.apply(&cm("b", "1"), ApplyOpts::default()).await.unwrap();
        assert_eq!(c.list("v1", "ConfigMap", Some("ns"), &[]).await.unwrap().len(), 2);
        assert_eq!(c.list("v1", "ConfigMap", Some("other"), &[]).await.unwrap().len(), 0);
        assert_eq!(c.list("v1", "ConfigMap", None, &[("team", "x")]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn merge_patch_removes_null_fields() {
        let c = MemoryCluster::new();
        let mut a = cm("a", "1");
        a.set_label("keep", "y");
        a.set_label("drop", "y");
        c.apply(&a, ApplyOpts::default()).await.unwrap();
        let out = c.merge_patch(&a, &json!({"metadata": {"labels": {"drop": null}}})).await.unwrap();
        assert_eq!(out.label("keep"), Some("y"));
        assert_eq!(out.label("drop"), None);
    }

    #[tokio::test]
    async fn watch_starts_with_relist_then_streams() {
        let c = MemoryCluster::new();
        c.apply(&cm("a", "1"), ApplyOpts::default()).await.unwrap();
        let mut w = c.watch("v1", "ConfigMap").await.unwrap();
        match w.next().await.unwrap().unwrap() {
            WatchEvent::Restarted(list) => assert_eq!(list.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        c.apply(&Resource::from_value(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}})).unwrap(), ApplyOpts::default())
            .await
            .unwrap();
        c.delete(&cm("a", "1")).await.unwrap();
        assert!(matches!(w.next().await.unwrap().unwrap(), WatchEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let c = MemoryCluster::new();
        c.fail_on("ns/ConfigMap/a", ClientError::Invalid("bad".into()));
        assert!(c.apply(&cm("a", "1"), ApplyOpts::default()).await.is_err());
        c.clear_failures();
        assert!(c.apply(&cm("a", "1"), ApplyOpts::default()).await.is_ok());
    }
}
