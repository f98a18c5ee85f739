//! Resource documents and their canonical identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::Error;

/// Label marking every resource applied by hangar.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "hangar";
/// Label carrying the owning release name.
pub const LABEL_RELEASE: &str = "hangar.dev/release";
/// Label carrying the owning release namespace.
pub const LABEL_RELEASE_NAMESPACE: &str = "hangar.dev/release-namespace";

/// Placeholder namespace used in canonical identities of cluster scoped resources.
const CLUSTER_SCOPE: &str = "_";

/// An opaque structured cluster document (apiVersion/kind/metadata/...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Json);

impl Resource {
    /// Wrap a JSON value, checking that it looks like a cluster object.
    pub fn from_value(v: Json) -> Result<Self, Error> {
        let r = Self(v);
        if !r.0.is_object() {
            return Err(Error::InvalidResource("resource must be an object".into()));
        }
        if r.api_version().is_empty() {
            return Err(Error::InvalidResource(format!("{}: missing apiVersion", r.describe())));
        }
        if r.kind().is_empty() {
            return Err(Error::InvalidResource(format!("{}: missing kind", r.describe())));
        }
        if r.name().is_empty() {
            return Err(Error::InvalidResource(format!("{}: missing metadata.name", r.describe())));
        }
        Ok(r)
    }

    /// Wrap without validation. Used for documents read back from the cluster.
    pub fn from_value_unchecked(v: Json) -> Self { Self(v) }

    pub fn as_value(&self) -> &Json { &self.0 }
    pub fn as_value_mut(&mut self) -> &mut Json { &mut self.0 }
    pub fn into_value(self) -> Json { self.0 }

    pub fn api_version(&self) -> &str { self.0.get("apiVersion").and_then(Json::as_str).unwrap_or("") }
    pub fn kind(&self) -> &str { self.0.get("kind").and_then(Json::as_str).unwrap_or("") }

    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    pub fn version(&self) -> &str {
        let av = self.api_version();
        av.split_once('/').map(|(_, v)| v).unwrap_or(av)
    }

    pub fn name(&self) -> &str { self.meta_str("name").unwrap_or("") }

    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace").filter(|s| !s.is_empty()) }

    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }

    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    pub fn is_deleting(&self) -> bool { self.meta().and_then(|m| m.get("deletionTimestamp")).is_some() }

    pub fn generation(&self) -> Option<i64> { self.meta().and_then(|m| m.get("generation")).and_then(Json::as_i64) }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.meta()
            .and_then(|m| m.get("finalizers"))
            .and_then(Json::as_array)
            .map(|f| f.iter().any(|x| x.as_str() == Some(finalizer)))
            .unwrap_or(false)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if self.has_finalizer(finalizer) {
            return;
        }
        let list = self.meta_mut().entry("finalizers").or_insert_with(|| Json::Array(Vec::new()));
        if !list.is_array() {
            *list = Json::Array(Vec::new());
        }
        if let Json::Array(items) = list {
            items.push(Json::String(finalizer.to_string()));
        }
    }

    /// Returns whether the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        match self.meta_mut().get_mut("finalizers") {
            Some(Json::Array(items)) => {
                let before = items.len();
                items.retain(|x| x.as_str() != Some(finalizer));
                items.len() != before
            }
            _ => false,
        }
    }

    fn meta(&self) -> Option<&Map<String, Json>> { self.0.get("metadata").and_then(Json::as_object) }

    fn meta_str(&self, key: &str) -> Option<&str> { self.meta().and_then(|m| m.get(key)).and_then(Json::as_str) }

    fn meta_mut(&mut self) -> &mut Map<String, Json> {
        let obj = ensure_object(&mut self.0);
        ensure_object(obj.entry("metadata").or_insert_with(|| Json::Object(Map::new())))
    }

    pub fn set_namespace(&mut self, ns: &str) {
        self.meta_mut().insert("namespace".into(), Json::String(ns.to_string()));
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta().and_then(|m| m.get("labels")).and_then(|l| l.get(key)).and_then(Json::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        let meta = self.meta_mut();
        let labels = ensure_object(meta.entry("labels").or_insert_with(|| Json::Object(Map::new())));
        labels.insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().and_then(|m| m.get("annotations")).and_then(|l| l.get(key)).and_then(Json::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let meta = self.meta_mut();
        let annos = ensure_object(meta.entry("annotations").or_insert_with(|| Json::Object(Map::new())));
        annos.insert(key.to_string(), Json::String(value.to_string()));
    }

    /// Append owner references, skipping ones already present by uid.
    pub fn add_owner_references(&mut self, refs: &[Json]) {
        if refs.is_empty() {
            return;
        }
        let meta = self.meta_mut();
        let list = meta.entry("ownerReferences").or_insert_with(|| Json::Array(Vec::new()));
        if !list.is_array() {
            *list = Json::Array(Vec::new());
        }
        if let Json::Array(items) = list {
            for r in refs {
                let uid = r.get("uid");
                if !items.iter().any(|x| x.get("uid") == uid) {
                    items.push(r.clone());
                }
            }
        }
    }

    pub fn owner_references(&self) -> &[Json] {
        self.meta()
            .and_then(|m| m.get("ownerReferences"))
            .and_then(Json::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove fields the server owns so the document can be re-applied.
    pub fn drop_server_fields(&mut self) {
        let meta = self.meta_mut();
        for k in ["resourceVersion", "creationTimestamp", "uid", "managedFields", "generation"] {
            meta.remove(k);
        }
    }

    /// Stamp the release ownership labels.
    pub fn stamp_owner(&mut self, release: &ReleaseRef) {
        self.set_label(LABEL_MANAGED_BY, MANAGED_BY);
        self.set_label(LABEL_RELEASE, &release.name);
        self.set_label(LABEL_RELEASE_NAMESPACE, &release.namespace);
    }

    /// Release recorded in the ownership labels, if any.
    pub fn owner(&self) -> Option<ReleaseRef> {
        let name = self.label(LABEL_RELEASE)?;
        let namespace = self.label(LABEL_RELEASE_NAMESPACE).unwrap_or("");
        Some(ReleaseRef { name: name.to_string(), namespace: namespace.to_string() })
    }

    pub fn is_namespace(&self) -> bool { self.group().is_empty() && self.kind() == "Namespace" }

    pub fn is_crd(&self) -> bool {
        self.group() == "apiextensions.k8s.io" && self.kind() == "CustomResourceDefinition"
    }

    /// Canonical identity including the version.
    pub fn id(&self) -> ResourceId { ResourceId::of(self, true) }

    /// Canonical identity ignoring the version. Used for orphan diffing.
    pub fn versionless_id(&self) -> ResourceId { ResourceId::of(self, false) }

    /// Short human readable form, `Kind/name` or `ns/Kind/name`.
    pub fn describe(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}/{}", ns, self.kind(), self.name()),
            None => format!("{}/{}", self.kind(), self.name()),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.describe()) }
}

fn ensure_object(v: &mut Json) -> &mut Map<String, Json> {
    if !v.is_object() {
        *v = Json::Object(Map::new());
    }
    match v {
        Json::Object(m) => m,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Lowercased `ns-or-_/group-or-core/version/kind/name` identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    fn of(r: &Resource, with_version: bool) -> Self {
        let ns = r.namespace().unwrap_or(CLUSTER_SCOPE);
        let group = match r.group() {
            "" => "core",
            g => g,
        };
        let s = if with_version {
            format!("{}/{}/{}/{}/{}", ns, group, r.version(), r.kind(), r.name())
        } else {
            format!("{}/{}/{}/{}", ns, group, r.kind(), r.name())
        };
        Self(s.to_lowercase())
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// The `(name, namespace)` identity of a release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub namespace: String,
}

impl ReleaseRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }
}

impl fmt::Display for ReleaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}
