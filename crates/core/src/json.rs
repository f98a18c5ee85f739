//! JSON helpers for drift detection and change suppression.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Drop server-populated fields that never count as drift.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Equality ignoring generation, resourceVersion, managedFields and status.
pub fn semantic_eq(a: &Json, b: &Json) -> bool {
    fn trimmed(v: &Json) -> Json {
        let mut v = v.clone();
        if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.remove("generation");
            meta.remove("resourceVersion");
            meta.remove("managedFields");
        }
        if let Some(obj) = v.as_object_mut() {
            obj.remove("status");
        }
        v
    }
    trimmed(a) == trimmed(b)
}

/// Keep only the parts of `actual` that `expected` declares.
///
/// Arrays are compared element-wise by index; extra trailing elements in `actual` are dropped.
pub fn remove_additions(expected: &Json, actual: &Json) -> Json {
    match (expected, actual) {
        (Json::Object(e), Json::Object(a)) => {
            let mut out = serde_json::Map::new();
            for (k, ev) in e {
                if let Some(av) = a.get(k) {
                    out.insert(k.clone(), remove_additions(ev, av));
                }
            }
            Json::Object(out)
        }
        (Json::Array(e), Json::Array(a)) => {
            Json::Array(a.iter().take(e.len()).zip(e.iter()).map(|(av, ev)| remove_additions(ev, av)).collect())
        }
        (_, a) => a.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Change {
    Add { path: String, value: Json },
    Remove { path: String, value: Json },
    Replace { path: String, from: Json, to: Json },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Add { path, value } => write!(f, "+ {}: {}", path, value),
            Change::Remove { path, value } => write!(f, "- {}: {}", path, value),
            Change::Replace { path, from, to } => write!(f, "~ {}: {} -> {}", path, from, to),
        }
    }
}

/// Structured diff turning `from` into `to`. Paths are JSON pointers.
pub fn diff(from: &Json, to: &Json) -> Vec<Change> {
    fn walk(path: &str, a: &Json, b: &Json, out: &mut Vec<Change>) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    let p = format!("{}/{}", path, escape(k));
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(&p, av, bv, out),
                        None => out.push(Change::Remove { path: p, value: av.clone() }),
                    }
                }
                for (k, bv) in bo {
                    if !ao.contains_key(k) {
                        out.push(Change::Add { path: format!("{}/{}", path, escape(k)), value: bv.clone() });
                    }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for i in 0..aa.len().max(bb.len()) {
                    let p = format!("{}/{}", path, i);
                    match (aa.get(i), bb.get(i)) {
                        (Some(av), Some(bv)) if av == bv => {}
                        (Some(av), Some(bv)) => walk(&p, av, bv, out),
                        (Some(av), None) => out.push(Change::Remove { path: p, value: av.clone() }),
                        (None, Some(bv)) => out.push(Change::Add { path: p, value: bv.clone() }),
                        (None, None) => {}
                    }
                }
            }
            (av, bv) => {
                if av != bv {
                    out.push(Change::Replace { path: path.to_string(), from: av.clone(), to: bv.clone() });
                }
            }
        }
    }
    let mut out = Vec::new();
    walk("", from, to, &mut out);
    out
}

fn escape(key: &str) -> String { key.replace('~', "~0").replace('/', "~1") }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_common_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 1);
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn metadata_churn_is_not_a_change() {
        let a = json!({"metadata": {"name": "x", "resourceVersion": "1", "generation": 1}, "spec": {"r": 1}, "status": {"ok": false}});
        let b = json!({"metadata": {"name": "x", "resourceVersion": "2", "generation": 2}, "spec": {"r": 1}, "status": {"ok": true}});
        assert!(semantic_eq(&a, &b));
        let c = json!({"metadata": {"name": "x"}, "spec": {"r": 2}});
        assert!(!semantic_eq(&a, &c));
    }

    #[test]
    fn remove_additions_keeps_declared_fields_only() {
        let expected = json!({"data": {"a": "1"}, "list": [1]});
        let actual = json!({"data": {"a": "2", "b": "3"}, "list": [1, 2], "extra": true});
        assert_eq!(remove_additions(&expected, &actual), json!({"data": {"a": "2"}, "list": [1]}));
    }

    #[test]
    fn diff_reports_pointer_paths() {
        let from = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3], "k/s": 0});
        let to = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let changes = diff(&from, &to);
        assert!(changes.contains(&Change::Replace { path: "/a".into(), from: json!(1), to: json!(2) }));
        assert!(changes.contains(&Change::Add { path: "/b/y".into(), value: json!(2) }));
        assert!(changes.contains(&Change::Replace { path: "/c/1".into(), from: json!(2), to: json!(9) }));
        assert!(changes.contains(&Change::Remove { path: "/c/2".into(), value: json!(3) }));
        assert!(changes.contains(&Change::Remove { path: "/k~1s".into(), value: json!(0) }));
        assert!(changes.contains(&Change::Add { path: "/d".into(), value: json!(true) }));
        assert_eq!(changes.len(), 6);
        assert!(diff(&from, &from).is_empty());
    }
}
