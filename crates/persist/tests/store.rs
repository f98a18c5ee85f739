use std::sync::Arc;

use base64::Engine as _;
use hangar_core::{ReleaseRef, Resource, Source, Stages};
use hangar_kubehub::{memory::MemoryCluster, ResourceClient};
use hangar_persist::{Locked, RevisionStore, LABEL_KIND};
use serde_json::json;

fn stages(names: &[&str]) -> Stages {
    let stage = names
        .iter()
        .map(|n| Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": n, "namespace": "apps"}})).unwrap())
        .collect();
    Stages::new(vec![stage])
}

fn source(checksum: &str) -> Source { Source { reference: "file:///flights/app.wasm".into(), checksum: checksum.into() } }

fn setup() -> (Arc<MemoryCluster>, RevisionStore) {
    let cluster = Arc::new(MemoryCluster::new());
    let store = RevisionStore::with_level(cluster.clone(), 3);
    (cluster, store)
}

#[tokio::test]
async fn create_appends_and_loads_payload() {
    let (_c, store) = setup();
    let rel = ReleaseRef::new("web", "apps");

    let h = store.history(&rel).await.unwrap();
    assert!(h.is_empty());
    let r1 = store.create(&h, &source("aa"), &stages(&["a"])).await.unwrap();
    let h = store.history(&rel).await.unwrap();
    let r2 = store.create(&h, &source("bb"), &stages(&["b", "c"])).await.unwrap();

    let h = store.history(&rel).await.unwrap();
    assert_eq!(h.revisions.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(h.active().unwrap().id, 2);
    assert_eq!(h.get(2).unwrap().resources, 2);
    assert_eq!(h.get(2).unwrap().source, source("bb"));
    assert_eq!(r1.id, 1);

    let loaded = store.load(&r2).await.unwrap();
    assert_eq!(loaded, stages(&["b", "c"]));
}

#[tokio::test]
async fn activate_moves_the_pointer_without_new_revisions() {
    let (_c, store) = setup();
    let rel = ReleaseRef::new("web", "apps");
    for n in ["a", "b", "c"] {
        let h = store.history(&rel).await.unwrap();
        store.create(&h, &source(n), &stages(&[n])).await.unwrap();
    }
    let h = store.history(&rel).await.unwrap();
    let rev = store.activate(&h, 1).await.unwrap();
    assert_eq!(rev.id, 1);

    let h = store.history(&rel).await.unwrap();
    assert_eq!(h.revisions.len(), 3);
    assert_eq!(h.active().unwrap().id, 1);
    assert_eq!(h.next_id(), 4);

    let err = store.activate(&h, 9).await.unwrap_err();
    assert!(err.to_string().contains("revision 9 not found"), "{}", err);
}

#[tokio::test]
async fn cap_keeps_the_active_revision() {
    let (_c, store) = setup();
    let rel = ReleaseRef::new("web", "apps");
    for n in ["a", "b", "c", "d"] {
        let h = store.history(&rel).await.unwrap();
        store.create(&h, &source(n), &stages(&[n])).await.unwrap();
    }
    let h = store.history(&rel).await.unwrap();
    store.activate(&h, 1).await.unwrap();

    assert_eq!(store.cap_history(&rel, 2).await.unwrap(), 2);
    let h = store.history(&rel).await.unwrap();
    assert_eq!(h.revisions.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 4]);
    assert_eq!(h.next_id(), 5, "ids stay stable after capping");
}

#[tokio::test]
async fn histories_are_per_release_and_listable() {
    let (_c, store) = setup();
    let web = ReleaseRef::new("web", "apps");
    let db = ReleaseRef::new("db", "apps");
    let other = ReleaseRef::new("web", "staging");
    for rel in [&web, &db, &other] {
        let h = store.history(rel).await.unwrap();
        store.create(&h, &source("x"), &stages(&["a"])).await.unwrap();
    }
    assert_eq!(store.history(&web).await.unwrap().revisions.len(), 1);
    assert_eq!(store.list_releases(Some("apps")).await.unwrap(), vec![db.clone(), web.clone()]);
    assert_eq!(store.list_releases(None).await.unwrap().len(), 3);

    assert_eq!(store.delete_all(&web).await.unwrap(), 1);
    assert!(store.history(&web).await.unwrap().is_empty());
    assert_eq!(store.history(&db).await.unwrap().revisions.len(), 1);
}

#[tokio::test]
async fn uncompressed_payloads_still_load() {
    let (cluster, store) = setup();
    let rel = ReleaseRef::new("old", "apps");
    let raw = serde_json::to_vec(&stages(&["legacy"])).unwrap();
    let obj = Resource::from_value(json!({
        "apiVersion": "v1", "kind": "Secret",
        "metadata": {
            "name": "hangar.legacy", "namespace": "apps",
            "labels": {LABEL_KIND: "revision", "hangar.dev/release": "old"},
            "annotations": {
                "hangar.dev/revision-id": "7",
                "hangar.dev/created-at": "2024-01-01T00:00:00Z",
                "hangar.dev/active-at": "2024-01-01T00:00:00Z",
                "hangar.dev/resources": "1"
            }
        },
        "data": {"resources": base64::engine::general_purpose::STANDARD.encode(raw)}
    }))
    .unwrap();
    cluster.create(&obj).await.unwrap();

    let h = store.history(&rel).await.unwrap();
    let active = h.active().unwrap();
    assert_eq!(active.id, 7);
    assert_eq!(store.load(active).await.unwrap(), stages(&["legacy"]));
    assert_eq!(h.next_id(), 8);
}

#[tokio::test]
async fn malformed_revision_objects_are_skipped() {
    let (cluster, store) = setup();
    let rel = ReleaseRef::new("web", "apps");
    let junk = Resource::from_value(json!({
        "apiVersion": "v1", "kind": "Secret",
        "metadata": {"name": "hangar.junk", "namespace": "apps", "labels": {LABEL_KIND: "revision", "hangar.dev/release": "web"}}
    }))
    .unwrap();
    cluster.create(&junk).await.unwrap();
    assert!(store.history(&rel).await.unwrap().is_empty());
}

#[tokio::test]
async fn lock_is_exclusive_until_unlocked() {
    let (_c, store) = setup();
    let rel = ReleaseRef::new("web", "apps");
    store.lock(&rel, "alice").await.unwrap();

    let err = store.lock(&rel, "bob").await.unwrap_err();
    let locked = err.downcast_ref::<Locked>().expect("locked error");
    assert_eq!(locked.holder, "alice");

    store.unlock(&rel).await.unwrap();
    store.unlock(&rel).await.unwrap();
    store.lock(&rel, "bob").await.unwrap();

    // Locks never show up as revisions.
    assert!(store.history(&rel).await.unwrap().is_empty());
}
