//! Hangar persistence: one Secret per revision, labeled with the release identity.
//! Payloads are zstd compressed when the feature is on; uncompressed payloads still load.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hangar_core::{
    History, ReleaseRef, Resource, Revision, Source, Stages, LABEL_MANAGED_BY, LABEL_RELEASE, LABEL_RELEASE_NAMESPACE,
    MANAGED_BY,
};
use hangar_kubehub::ResourceClient;
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, info, warn};

/// Marks hangar bookkeeping objects (`revision` or `lock`).
pub const LABEL_KIND: &str = "hangar.dev/kind";
const KIND_REVISION: &str = "revision";
const KIND_LOCK: &str = "lock";

const ANN_ID: &str = "hangar.dev/revision-id";
const ANN_CREATED_AT: &str = "hangar.dev/created-at";
const ANN_ACTIVE_AT: &str = "hangar.dev/active-at";
const ANN_RESOURCES: &str = "hangar.dev/resources";
const ANN_SOURCE_REF: &str = "hangar.dev/source-ref";
const ANN_SOURCE_CHECKSUM: &str = "hangar.dev/source-checksum";
const ANN_HOLDER: &str = "hangar.dev/holder";

const PAYLOAD_KEY: &str = "resources";

/// Returned (inside `anyhow`) when a release lock is already held.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("release {release} is locked by {holder}")]
pub struct Locked {
    pub release: ReleaseRef,
    pub holder: String,
}

/// Revision history of releases, stored as cluster objects through a [`ResourceClient`].
#[derive(Clone)]
pub struct RevisionStore {
    client: Arc<dyn ResourceClient>,
    level: i32,
}

impl RevisionStore {
    /// Compression level comes from `HANGAR_ZSTD_LEVEL` (default 3).
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        let level = std::env::var("HANGAR_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        Self { client, level }
    }

    pub fn with_level(client: Arc<dyn ResourceClient>, level: i32) -> Self { Self { client, level } }

    /// All revisions of `release`, oldest first.
    pub async fn history(&self, release: &ReleaseRef) -> Result<History> {
        let objs = self
            .client
            .list("v1", "Secret", Some(release.namespace.as_str()), &[(LABEL_KIND, KIND_REVISION), (LABEL_RELEASE, release.name.as_str())])
            .await
            .with_context(|| format!("failed to get revision history for release \"{}\"", release))?;
        let mut revisions = Vec::with_capacity(objs.len());
        for obj in &objs {
            match decode_revision(obj, release) {
                Ok(rev) => revisions.push(rev),
                Err(e) => warn!(object = %obj.describe(), error = %e, "skipping malformed revision"),
            }
        }
        Ok(History::new(release.clone(), revisions))
    }

    /// The resource set recorded by `revision`.
    pub async fn load(&self, revision: &Revision) -> Result<Stages> {
        let obj = self
            .client
            .get(&secret_probe(&revision.object_name, &revision.release.namespace))
            .await
            .with_context(|| format!("failed to get revision {} of {}", revision.id, revision.release))?
            .ok_or_else(|| anyhow!("revision {} of {} no longer exists", revision.id, revision.release))?;
        let data = obj.as_value()["data"][PAYLOAD_KEY]
            .as_str()
            .ok_or_else(|| anyhow!("revision {} of {} has no payload", revision.id, revision.release))?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(data)
            .with_context(|| format!("decoding payload of revision {}", revision.id))?;
        let json = maybe_decompress(&raw);
        serde_json::from_slice(&json).with_context(|| format!("parsing resources of revision {}", revision.id))
    }

    /// Append a revision recording `stages` and mark it active. Ids continue from the highest
    /// id in `history`.
    pub async fn create(&self, history: &History, source: &Source, stages: &Stages) -> Result<Revision> {
        let started = std::time::Instant::now();
        let release = &history.release;
        let now = activation_time(history);
        let revision = Revision {
            id: history.next_id(),
            release: release.clone(),
            object_name: format!("hangar.{}", uuid::Uuid::new_v4().simple()),
            source: source.clone(),
            created_at: now,
            active_at: now,
            resources: stages.resource_count(),
        };
        let payload = serde_json::to_vec(stages).context("serializing resources")?;
        let packed = maybe_compress(&payload, self.level);
        let mut obj = secret_probe(&revision.object_name, &release.namespace);
        obj.set_label(LABEL_MANAGED_BY, MANAGED_BY);
        obj.set_label(LABEL_KIND, KIND_REVISION);
        obj.set_label(LABEL_RELEASE, &release.name);
        obj.set_label(LABEL_RELEASE_NAMESPACE, &release.namespace);
        for (k, v) in annotations(&revision) {
            obj.set_annotation(k, &v);
        }
        let v = obj.as_value_mut();
        v["type"] = json!("hangar.dev/revision");
        v["data"] = json!({ PAYLOAD_KEY: base64::engine::general_purpose::STANDARD.encode(packed) });
        self.client
            .create(&obj)
            .await
            .with_context(|| format!("failed to record revision {} of {}", revision.id, release))?;
        histogram!("revision_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("revision_created", 1u64);
        info!(release = %release, revision = revision.id, resources = revision.resources, "revision recorded");
        Ok(revision)
    }

    /// Mark revision `id` of `history` active. Nothing else about the revision changes.
    pub async fn activate(&self, history: &History, id: u64) -> Result<Revision> {
        let mut revision = history
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("revision {} not found for release {}", id, history.release))?;
        revision.active_at = activation_time(history);
        let patch = json!({"metadata": {"annotations": {ANN_ACTIVE_AT: fmt_time(&revision.active_at)}}});
        self.client
            .merge_patch(&secret_probe(&revision.object_name, &history.release.namespace), &patch)
            .await
            .with_context(|| format!("failed to activate revision {} of {}", id, history.release))?;
        info!(release = %history.release, revision = id, "revision activated");
        Ok(revision)
    }

    pub async fn delete(&self, revision: &Revision) -> Result<()> {
        match self.client.delete(&secret_probe(&revision.object_name, &revision.release.namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete revision {} of {}", revision.id, revision.release)),
        }
    }

    /// Delete the oldest revisions beyond `cap`, keeping the active one. Returns how many went.
    pub async fn cap_history(&self, release: &ReleaseRef, cap: usize) -> Result<usize> {
        let history = self.history(release).await?;
        let doomed = history.beyond_cap(cap);
        for rev in &doomed {
            self.delete(rev).await?;
            debug!(release = %release, revision = rev.id, "capped revision");
        }
        Ok(doomed.len())
    }

    /// Delete every revision of `release`.
    pub async fn delete_all(&self, release: &ReleaseRef) -> Result<usize> {
        let history = self.history(release).await?;
        for rev in &history.revisions {
            self.delete(rev).await?;
        }
        Ok(history.revisions.len())
    }

    /// Releases with at least one revision, optionally restricted to one namespace.
    pub async fn list_releases(&self, namespace: Option<&str>) -> Result<Vec<ReleaseRef>> {
        let objs = self
            .client
            .list("v1", "Secret", namespace, &[(LABEL_KIND, KIND_REVISION)])
            .await
            .context("failed to list releases")?;
        let set: BTreeSet<ReleaseRef> = objs
            .iter()
            .filter_map(|o| Some(ReleaseRef::new(o.label(LABEL_RELEASE)?, o.namespace()?)))
            .collect();
        Ok(set.into_iter().collect())
    }

    /// Take the exclusive lock of `release`. Fails with [`Locked`] when someone holds it.
    pub async fn lock(&self, release: &ReleaseRef, holder: &str) -> Result<()> {
        let mut obj = secret_probe(&lock_name(release), &release.namespace);
        obj.set_label(LABEL_MANAGED_BY, MANAGED_BY);
        obj.set_label(LABEL_KIND, KIND_LOCK);
        obj.set_label(LABEL_RELEASE, &release.name);
        obj.set_label(LABEL_RELEASE_NAMESPACE, &release.namespace);
        obj.set_annotation(ANN_HOLDER, holder);
        obj.set_annotation(ANN_CREATED_AT, &fmt_time(&Utc::now()));
        match self.client.create(&obj).await {
            Ok(_) => {
                debug!(release = %release, holder, "lock acquired");
                Ok(())
            }
            Err(e) if matches!(e, hangar_kubehub::ClientError::AlreadyExists(_)) => {
                let holder = match self.client.get(&obj).await {
                    Ok(Some(live)) => live.annotation(ANN_HOLDER).unwrap_or("unknown").to_string(),
                    _ => "unknown".to_string(),
                };
                Err(Locked { release: release.clone(), holder }.into())
            }
            Err(e) => Err(e).with_context(|| format!("failed to lock release {}", release)),
        }
    }

    /// Release the lock; unlocking an unlocked release is fine.
    pub async fn unlock(&self, release: &ReleaseRef) -> Result<()> {
        match self.client.delete(&secret_probe(&lock_name(release), &release.namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to unlock release {}", release)),
        }
    }
}

fn lock_name(release: &ReleaseRef) -> String { format!("hangar.lock.{}", release.name) }

fn secret_probe(name: &str, namespace: &str) -> Resource {
    Resource::from_value_unchecked(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": name, "namespace": namespace},
    }))
}

/// Strictly after every recorded activation so the new active revision always wins.
fn activation_time(history: &History) -> DateTime<Utc> {
    let now = Utc::now();
    match history.active() {
        Some(a) if a.active_at >= now => a.active_at + Duration::microseconds(1),
        _ => now,
    }
}

fn fmt_time(t: &DateTime<Utc>) -> String { t.to_rfc3339_opts(SecondsFormat::Micros, true) }

fn annotations(rev: &Revision) -> Vec<(&'static str, String)> {
    vec![
        (ANN_ID, rev.id.to_string()),
        (ANN_CREATED_AT, fmt_time(&rev.created_at)),
        (ANN_ACTIVE_AT, fmt_time(&rev.active_at)),
        (ANN_RESOURCES, rev.resources.to_string()),
        (ANN_SOURCE_REF, rev.source.reference.clone()),
        (ANN_SOURCE_CHECKSUM, rev.source.checksum.clone()),
    ]
}

fn decode_revision(obj: &Resource, release: &ReleaseRef) -> Result<Revision> {
    let ann = |k: &str| obj.annotation(k).ok_or_else(|| anyhow!("missing annotation {}", k));
    let time = |k: &str| -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(ann(k)?).with_context(|| format!("parsing {}", k))?.with_timezone(&Utc))
    };
    Ok(Revision {
        id: ann(ANN_ID)?.parse().context("parsing revision id")?,
        release: release.clone(),
        object_name: obj.name().to_string(),
        source: Source {
            reference: obj.annotation(ANN_SOURCE_REF).unwrap_or_default().to_string(),
            checksum: obj.annotation(ANN_SOURCE_CHECKSUM).unwrap_or_default().to_string(),
        },
        created_at: time(ANN_CREATED_AT)?,
        active_at: time(ANN_ACTIVE_AT)?,
        resources: ann(ANN_RESOURCES)?.parse().context("parsing resource count")?,
    })
}

#[cfg(feature = "zstd")]
pub fn maybe_compress(data: &[u8], level: i32) -> Vec<u8> { zstd::encode_all(data, level).unwrap_or_else(|_| data.to_vec()) }

#[cfg(not(feature = "zstd"))]
pub fn maybe_compress(data: &[u8], _level: i32) -> Vec<u8> { data.to_vec() }

/// Payloads that do not decompress are returned as they are.
pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_payload_passes_through_decompress() {
        let raw = br#"[[{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}]]"#;
        assert_eq!(maybe_decompress(raw), raw.to_vec());
        let packed = maybe_compress(raw, 3);
        assert_eq!(maybe_decompress(&packed), raw.to_vec());
    }

    #[test]
    fn activation_time_moves_past_future_stamps() {
        let release = ReleaseRef::new("r", "ns");
        let ahead = Utc::now() + Duration::seconds(60);
        let rev = Revision {
            id: 1,
            release: release.clone(),
            object_name: "x".into(),
            source: Source::default(),
            created_at: ahead,
            active_at: ahead,
            resources: 0,
        };
        let h = History::new(release, vec![rev]);
        assert!(activation_time(&h) > ahead);
    }
}
