use hangar_core::{MultiError, ReleaseRef, Resource, ResourceId, Stages, LABEL_MANAGED_BY, LABEL_RELEASE, LABEL_RELEASE_NAMESPACE};
use hangar_kubehub::{owned_by, ResourceClient};
use metrics::counter;
use rustc_hash::FxHashSet;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info};

use crate::PruneOpts;

/// What a prune did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<ResourceId>,
    pub orphaned: Vec<ResourceId>,
    /// Resources that left the release but are owned by someone else now.
    pub skipped: Vec<ResourceId>,
}

/// Resources of `previous` whose versionless identity is absent from `next`.
pub fn orphans<'a>(previous: &'a Stages, next: &Stages) -> Vec<&'a Resource> {
    let keep: FxHashSet<ResourceId> = next.flatten().map(Resource::versionless_id).collect();
    let mut out: Vec<&Resource> = Vec::new();
    for stage in previous.iter().rev() {
        out.extend(stage.iter().filter(|r| !keep.contains(&r.versionless_id())));
    }
    out
}

/// Delete (or orphan) everything in `previous` that `next` no longer declares.
/// Later stages go first. Missing objects are fine; foreign-owned objects are left alone.
pub async fn prune(
    client: &dyn ResourceClient,
    release: &ReleaseRef,
    previous: &Stages,
    next: &Stages,
    opts: PruneOpts,
) -> Result<PruneReport, MultiError> {
    let mut report = PruneReport::default();
    let mut errs = MultiError::new("failed to prune");
    for r in orphans(previous, next) {
        let id = r.versionless_id();
        let live = match client.get(r).await {
            Ok(Some(live)) => live,
            Ok(None) => continue,
            Err(e) if e.is_not_found() || e.is_unknown_kind() => continue,
            Err(e) => {
                errs.push(id, format!("failed to lookup: {}", e));
                continue;
            }
        };
        if !owned_by(&live, release) {
            debug!(resource = %r, "skipping prune of resource owned elsewhere");
            report.skipped.push(id);
            continue;
        }
        if (r.is_crd() && !opts.remove_crds) || (r.is_namespace() && !opts.remove_namespaces) {
            match client.merge_patch(r, &orphan_patch(&live)).await {
                Ok(_) => {
                    info!(resource = %r, "orphaned");
                    report.orphaned.push(id);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => errs.push(id, format!("failed to orphan: {}", e)),
            }
            continue;
        }
        match client.delete(r).await {
            Ok(()) => {
                counter!("prune_deleted", 1u64);
                info!(resource = %r, "pruned");
                report.removed.push(id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => errs.push(id, format!("failed to delete: {}", e)),
        }
    }
    errs.into_result().map(|_| report)
}

/// Merge patch dropping release ownership labels and owner references.
fn orphan_patch(live: &Resource) -> Json {
    let mut labels = Map::new();
    for k in [LABEL_MANAGED_BY, LABEL_RELEASE, LABEL_RELEASE_NAMESPACE] {
        if live.label(k).is_some() {
            labels.insert(k.to_string(), Json::Null);
        }
    }
    let mut meta = Map::new();
    meta.insert("labels".into(), Json::Object(labels));
    if !live.owner_references().is_empty() {
        meta.insert("ownerReferences".into(), Json::Null);
    }
    json!({ "metadata": meta })
}
