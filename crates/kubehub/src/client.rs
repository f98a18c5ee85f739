//! Resource client boundary shared by the scheduler, the revision store and the release protocol.

use futures::stream::BoxStream;
use hangar_core::{ReleaseRef, Resource};
use serde_json::Value as Json;

/// Errors surfaced by a [`ResourceClient`]. Ownership conflicts are distinct from
/// not-found and write conflicts so callers can tell them apart.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{resource} is owned by release {actual}, not {expected}")]
    Ownership { resource: String, expected: String, actual: String },
    #[error("unknown kind {kind} in {api_version}")]
    UnknownKind { api_version: String, kind: String },
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("serialization: {0}")]
    Serialization(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict(_)) }
    pub fn is_unknown_kind(&self) -> bool { matches!(self, ClientError::UnknownKind { .. }) }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self { ClientError::Serialization(e.to_string()) }
}

/// REST mapping for a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub namespaced: bool,
    pub plural: String,
}

/// Options for a server-side apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOpts {
    /// Validate on the server without persisting.
    pub dry_run: bool,
    /// Take ownership of fields managed by other field managers.
    pub force_conflicts: bool,
    /// Skip the release ownership label check.
    pub force_ownership: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(Resource),
    Deleted(Resource),
    /// Full relist, sent at start-up and after watch restarts.
    Restarted(Vec<Resource>),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// Typed/untyped CRUD over cluster objects. Implementations must be safe for concurrent use.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<Mapping, ClientError>;

    /// Server-side apply. Rejects writes to resources owned by another release unless
    /// `force_ownership` is set.
    async fn apply(&self, resource: &Resource, opts: ApplyOpts) -> Result<Resource, ClientError>;

    /// Fetch the live object with the same identity as `resource`.
    async fn get(&self, resource: &Resource) -> Result<Option<Resource>, ClientError>;

    /// List objects of a kind, optionally scoped to a namespace and filtered by labels.
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &[(&str, &str)],
    ) -> Result<Vec<Resource>, ClientError>;

    async fn create(&self, resource: &Resource) -> Result<Resource, ClientError>;

    /// Replace guarded by `metadata.resourceVersion`; stale versions yield [`ClientError::Conflict`].
    async fn update(&self, resource: &Resource) -> Result<Resource, ClientError>;

    async fn update_status(&self, resource: &Resource) -> Result<Resource, ClientError>;

    async fn merge_patch(&self, resource: &Resource, patch: &Json) -> Result<Resource, ClientError>;

    async fn delete(&self, resource: &Resource) -> Result<(), ClientError>;

    async fn watch(&self, api_version: &str, kind: &str) -> Result<WatchStream, ClientError>;

    /// Fail when the live object carries a different release's ownership labels.
    /// Kinds that cannot be resolved yet cannot have live objects and pass.
    async fn check_ownership(&self, resource: &Resource) -> Result<(), ClientError> {
        let live = match self.get(resource).await {
            Ok(Some(live)) => live,
            Ok(None) => return Ok(()),
            Err(e) if e.is_unknown_kind() => return Ok(()),
            Err(e) => return Err(e),
        };
        ownership_matches(resource, &live)
    }
}

/// Compare the desired object's owner labels with the live object's.
pub fn ownership_matches(desired: &Resource, live: &Resource) -> Result<(), ClientError> {
    let (Some(want), Some(have)) = (desired.owner(), live.owner()) else {
        return Ok(());
    };
    if want == have {
        return Ok(());
    }
    Err(ClientError::Ownership {
        resource: desired.describe(),
        expected: want.to_string(),
        actual: have.to_string(),
    })
}

/// Whether a live object belongs to `release`.
pub fn owned_by(live: &Resource, release: &ReleaseRef) -> bool { live.owner().as_ref() == Some(release) }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owned(release: &str) -> Resource {
        let mut r = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "n"}})).unwrap();
        r.stamp_owner(&ReleaseRef::new(release, "n"));
        r
    }

    #[test]
    fn ownership_mismatch_is_distinct_error() {
        let err = ownership_matches(&owned("a"), &owned("b")).unwrap_err();
        assert!(matches!(err, ClientError::Ownership { .. }));
        assert!(!err.is_not_found() && !err.is_conflict());
        assert!(err.to_string().contains("owned by release n/b"), "{}", err);
        assert!(ownership_matches(&owned("a"), &owned("a")).is_ok());
    }

    #[test]
    fn unlabeled_live_object_is_adoptable() {
        let live = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "n"}})).unwrap();
        assert!(ownership_matches(&owned("a"), &live).is_ok());
        assert!(!owned_by(&live, &ReleaseRef::new("a", "n")));
    }
}
