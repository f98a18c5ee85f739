//! Takeoff, Descent and Mayday over a release's revision history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use hangar_core::json::{diff, Change};
use hangar_core::{History, MultiError, ReleaseRef, Resource, ResourceId, Revision, Stages, Warning};
use hangar_flight::Evaluator;
use hangar_kubehub::{wait_all, ApplyOpts, ResourceClient, WaitOptions};
use hangar_persist::RevisionStore;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::apply::{apply_stage, parallelism, STAGE_POLL, STAGE_WAIT};
use crate::prune::{prune, PruneReport};
use crate::{DescentParams, MaydayParams, TakeoffParams};

const DEFAULT_NAMESPACE: &str = "default";

/// Changes a takeoff would make to one resource, relative to the active revision.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    pub id: ResourceId,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TakeoffOutcome {
    /// A new revision was recorded and orphans were pruned.
    Landed { revision: Revision, stages: Stages, pruned: PruneReport },
    /// Server dry run only.
    DryRun { stages: Stages },
    Diff { changes: Vec<ResourceDiff> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescentOutcome {
    pub from: u64,
    pub to: u64,
    pub pruned: PruneReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaydayOutcome {
    pub pruned: PruneReport,
    pub revisions_deleted: usize,
}

/// Drives releases through a cluster client, a revision store and a flight evaluator.
#[derive(Clone)]
pub struct Pilot {
    pub(crate) client: Arc<dyn ResourceClient>,
    pub(crate) store: RevisionStore,
    evaluator: Arc<dyn Evaluator>,
}

impl Pilot {
    pub fn new(client: Arc<dyn ResourceClient>, evaluator: Arc<dyn Evaluator>) -> Self {
        let store = RevisionStore::new(client.clone());
        Self { client, store, evaluator }
    }

    pub fn with_store(client: Arc<dyn ResourceClient>, store: RevisionStore, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { client, store, evaluator }
    }

    pub fn client(&self) -> &Arc<dyn ResourceClient> { &self.client }

    pub fn store(&self) -> &RevisionStore { &self.store }

    /// Evaluate the flight and roll the release forward to its output.
    ///
    /// Returns a [`Warning`] when the output equals the active revision.
    pub async fn takeoff(&self, params: TakeoffParams) -> Result<TakeoffOutcome> {
        let release = release_ref(&params.release, &params.namespace);
        let span = info_span!("takeoff", release = %release, module = %params.flight.module.reference);
        self.takeoff_inner(release, params).instrument(span).await
    }

    async fn takeoff_inner(&self, release: ReleaseRef, params: TakeoffParams) -> Result<TakeoffOutcome> {
        let evaluation = self.evaluator.evaluate(&params.flight).await.context("failed to evaluate flight")?;
        let mut stages = Stages::parse(&evaluation.output).context("failed to parse output into valid flight output")?;

        if let Some(identity) = &params.identity {
            let dropped = stages.extract(|r| identity(r));
            debug!(count = dropped.len(), "dropped identity resources from flight output");
        }
        if stages.is_empty() {
            bail!("failed to parse output into valid flight output: flight produced no resources");
        }

        for r in stages.iter_mut().flatten() {
            r.drop_server_fields();
            r.stamp_owner(&release);
            for (k, v) in &params.extra_labels {
                r.set_label(k, v);
            }
            if !params.owner_references.is_empty() {
                r.add_owner_references(&params.owner_references);
            }
        }
        self.scope_namespaces(&mut stages, &release.namespace, params.cross_namespace).await?;

        if params.diff_only {
            let history = self.history(&release).await?;
            let previous = self.active_stages(&history).await?;
            return Ok(TakeoffOutcome::Diff { changes: resource_diffs(&previous, &stages) });
        }

        let lock = params.lock && !params.dry_run;
        if lock {
            self.store.lock(&release, &params.lock_holder).await?;
        }
        let result = self.takeoff_locked(&release, &params, stages, evaluation.source).await;
        if lock {
            if let Err(e) = self.store.unlock(&release).await {
                warn!(error = %e, "failed to release lock");
            }
        }
        result
    }

    async fn takeoff_locked(
        &self,
        release: &ReleaseRef,
        params: &TakeoffParams,
        stages: Stages,
        source: hangar_core::Source,
    ) -> Result<TakeoffOutcome> {
        let history = self.history(release).await?;
        let previous = self.active_stages(&history).await?;

        if !params.dry_run && !history.is_empty() && previous == stages {
            return Err(Warning::new("resources are the same as previous revision: skipping creation of new revision").into());
        }

        if !params.force_ownership {
            self.check_ownership(&stages).await?;
        }

        let opts = ApplyOpts {
            dry_run: params.dry_run,
            force_conflicts: params.force_conflicts,
            force_ownership: params.force_ownership,
        };
        self.apply_stages(&stages, opts, false, params.wait, params.poll)
            .await
            .context("failed to apply resources")?;

        if params.dry_run {
            info!(resources = stages.resource_count(), "dry run succeeded");
            return Ok(TakeoffOutcome::DryRun { stages });
        }

        let revision = self.store.create(&history, &source, &stages).await.context("failed to create revision")?;
        let pruned = prune(self.client.as_ref(), release, &previous, &stages, params.prune)
            .await
            .context("failed to prune release diff")?;

        if params.history_cap > 0 {
            if let Err(e) = self.store.cap_history(release, params.history_cap).await {
                warn!(error = %e, cap = params.history_cap, "failed to cap release history");
            }
        }

        if !params.wait.is_zero() {
            self.wait(&stages, params.wait, params.poll)
                .await
                .context("release did not become ready within wait period: to rollback use descent")?;
        }

        info!(revision = revision.id, resources = stages.resource_count(), pruned = pruned.removed.len(), "takeoff succeeded");
        Ok(TakeoffOutcome::Landed { revision, stages, pruned })
    }

    /// Re-apply an earlier revision and make it active. No revision is created.
    pub async fn descent(&self, params: DescentParams) -> Result<DescentOutcome> {
        let release = release_ref(&params.release, &params.namespace);
        let span = info_span!("descent", release = %release, target = params.revision);
        async {
            if params.lock {
                self.store.lock(&release, &params.lock_holder).await?;
            }
            let result = self.descent_locked(&release, &params).await;
            if params.lock {
                if let Err(e) = self.store.unlock(&release).await {
                    warn!(error = %e, "failed to release lock");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn descent_locked(&self, release: &ReleaseRef, params: &DescentParams) -> Result<DescentOutcome> {
        let history = self.history(release).await?;
        if history.is_empty() {
            bail!("no release found for {}", release);
        }
        let target = history
            .get(params.revision)
            .ok_or_else(|| anyhow!("revision {} not found for release {}", params.revision, release))?;
        let active = history.active().ok_or_else(|| anyhow!("no active revision for release {}", release))?;
        if active.id == target.id {
            bail!("can't descend from {} to {}", active.id, target.id);
        }

        let next = self.store.load(target).await.with_context(|| format!("failed to load revision {}", target.id))?;
        let previous = self.store.load(active).await.with_context(|| format!("failed to load revision {}", active.id))?;

        self.check_ownership(&next).await?;
        self.apply_stages(&next, ApplyOpts::default(), true, params.wait, params.poll)
            .await
            .context("failed to apply resources")?;
        if !params.wait.is_zero() {
            self.wait(&next, params.wait, params.poll)
                .await
                .context("release did not become ready within wait period")?;
        }

        self.store.activate(&history, target.id).await.context("failed to activate revision")?;
        let pruned = prune(self.client.as_ref(), release, &previous, &next, params.prune)
            .await
            .context("failed to prune release diff")?;

        info!(from = active.id, to = target.id, "descent succeeded");
        Ok(DescentOutcome { from: active.id, to: target.id, pruned })
    }

    /// Delete every resource of the active revision, then the release history.
    ///
    /// Returns a [`Warning`] when the release has no history.
    pub async fn mayday(&self, params: MaydayParams) -> Result<MaydayOutcome> {
        let release = release_ref(&params.release, &params.namespace);
        let history = self.history(&release).await?;
        if history.is_empty() {
            return Err(Warning::new(format!("mayday noop: no history found for release {}", release)).into());
        }
        let active = self.active_stages(&history).await?;
        let pruned = prune(self.client.as_ref(), &release, &active, &Stages::default(), params.prune)
            .await
            .context("failed to delete resources")?;
        let revisions_deleted = self.store.delete_all(&release).await.context("failed to delete revision history")?;
        info!(release = %release, removed = pruned.removed.len(), revisions = revisions_deleted, "mayday succeeded");
        Ok(MaydayOutcome { pruned, revisions_deleted })
    }

    /// Resources of the active revision of `release`; empty without history.
    pub async fn active_resources(&self, release: &ReleaseRef) -> Result<Stages> {
        let history = self.history(release).await?;
        self.active_stages(&history).await
    }

    pub(crate) async fn history(&self, release: &ReleaseRef) -> Result<History> { self.store.history(release).await }

    /// Resources of the active revision; empty without history.
    pub(crate) async fn active_stages(&self, history: &History) -> Result<Stages> {
        match history.active() {
            Some(rev) => self.store.load(rev).await.with_context(|| format!("failed to load revision {}", rev.id)),
            None => Ok(Stages::default()),
        }
    }

    /// Give namespaced resources the release namespace and reject foreign namespaces.
    /// Kinds the cluster does not know are accepted only when a CRD in the same output defines them.
    async fn scope_namespaces(&self, stages: &mut Stages, namespace: &str, cross_namespace: bool) -> Result<()> {
        let defined = defined_kinds(stages);
        let mut unknown = MultiError::new("failed to resolve resource kinds");
        let mut foreign = MultiError::new("multiple namespaces detected");
        let mut cache: FxHashMap<(String, String), bool> = FxHashMap::default();

        for r in stages.iter_mut().flatten() {
            let key = (r.api_version().to_string(), r.kind().to_string());
            let namespaced = match cache.get(&key) {
                Some(n) => *n,
                None => {
                    let n = match self.client.resolve(r.api_version(), r.kind()).await {
                        Ok(mapping) => mapping.namespaced,
                        Err(e) if e.is_unknown_kind() => match defined.get(&(r.group().to_string(), r.kind().to_string())) {
                            Some(n) => *n,
                            None => {
                                unknown.push(r.id(), e);
                                continue;
                            }
                        },
                        Err(e) => return Err(anyhow::Error::new(e).context(format!("failed to resolve {}", r.describe()))),
                    };
                    cache.insert(key, n);
                    n
                }
            };
            if !namespaced {
                continue;
            }
            match r.namespace() {
                None => r.set_namespace(namespace),
                Some(ns) if ns != namespace && !cross_namespace => {
                    let msg = format!("namespace {} differs from release namespace {}", ns, namespace);
                    foreign.push(r.id(), msg);
                }
                Some(_) => {}
            }
        }
        unknown.into_result()?;
        foreign.into_result()?;
        Ok(())
    }

    /// Fail if any resource is owned by another release. Nothing is written.
    async fn check_ownership(&self, stages: &Stages) -> Result<()> {
        let client = self.client.as_ref();
        let checks: Vec<_> = stages.flatten().map(|r| async move { (r.id(), client.check_ownership(r).await) }).collect();
        let results: Vec<_> = futures::stream::iter(checks)
            .buffer_unordered(parallelism())
            .collect()
            .await;
        let mut errs = MultiError::new("ownership validation");
        for (id, res) in results {
            if let Err(e) = res {
                errs.push(id, e);
            }
        }
        errs.into_result()?;
        Ok(())
    }

    /// Apply stages in order. Stages before the last are waited on before the next one starts.
    async fn apply_stages(&self, stages: &Stages, opts: ApplyOpts, skip_dry_run: bool, wait: Duration, poll: Duration) -> Result<()> {
        let count = stages.len();
        for (i, stage) in stages.iter().enumerate() {
            let poll = if poll.is_zero() { STAGE_POLL } else { poll };
            apply_stage(self.client.as_ref(), stage, opts, skip_dry_run, poll).await?;
            if i + 1 < count && !opts.dry_run {
                let (wait, poll) = if wait.is_zero() { (STAGE_WAIT, STAGE_POLL) } else { (wait, poll) };
                let refs: Vec<&Resource> = stage.iter().collect();
                wait_all(self.client.as_ref(), &refs, WaitOptions { timeout: wait, interval: poll })
                    .await
                    .with_context(|| format!("stage {} did not become ready", i + 1))?;
            }
        }
        Ok(())
    }

    async fn wait(&self, stages: &Stages, timeout: Duration, poll: Duration) -> Result<()> {
        let refs: Vec<&Resource> = stages.flatten().collect();
        let interval = if poll.is_zero() { STAGE_POLL } else { poll };
        wait_all(self.client.as_ref(), &refs, WaitOptions { timeout, interval }).await
    }
}

pub(crate) fn release_ref(name: &str, namespace: &str) -> ReleaseRef {
    let ns = if namespace.is_empty() { DEFAULT_NAMESPACE } else { namespace };
    ReleaseRef::new(name, ns)
}

/// `(group, kind) -> namespaced` for every CRD in the output.
fn defined_kinds(stages: &Stages) -> FxHashMap<(String, String), bool> {
    stages
        .flatten()
        .filter(|r| r.is_crd())
        .filter_map(|crd| {
            let spec = crd.as_value().get("spec")?;
            let group = spec.get("group")?.as_str()?;
            let kind = spec.get("names")?.get("kind")?.as_str()?;
            let namespaced = spec.get("scope").and_then(Json::as_str) != Some("Cluster");
            Some(((group.to_string(), kind.to_string()), namespaced))
        })
        .collect()
}

/// Per-resource changes from `previous` to `next`, keyed by versionless identity.
/// Removed resources diff against null.
fn resource_diffs(previous: &Stages, next: &Stages) -> Vec<ResourceDiff> {
    let before: FxHashMap<ResourceId, &Resource> = previous.flatten().map(|r| (r.versionless_id(), r)).collect();
    let mut seen = rustc_hash::FxHashSet::default();
    let mut out = Vec::new();
    for r in next.flatten() {
        let id = r.versionless_id();
        let old = before.get(&id).map(|p| p.as_value()).unwrap_or(&Json::Null);
        let changes = diff(old, r.as_value());
        seen.insert(id.clone());
        if !changes.is_empty() {
            out.push(ResourceDiff { id, changes });
        }
    }
    for (id, r) in before {
        if !seen.contains(&id) {
            out.push(ResourceDiff { changes: diff(r.as_value(), &Json::Null), id });
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(v: Json) -> Resource { Resource::from_value(v).unwrap() }

    #[test]
    fn defined_kinds_reads_crd_scope() {
        let stages = Stages::new(vec![vec![res(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "gadgets.acme.io"},
            "spec": {"group": "acme.io", "scope": "Cluster", "names": {"kind": "Gadget", "plural": "gadgets"}}
        }))]]);
        let kinds = defined_kinds(&stages);
        assert_eq!(kinds.get(&("acme.io".to_string(), "Gadget".to_string())), Some(&false));
    }

    #[test]
    fn diffs_cover_added_changed_and_removed() {
        let a = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "n"}, "data": {"k": "1"}}));
        let a2 = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "n"}, "data": {"k": "2"}}));
        let b = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b", "namespace": "n"}}));
        let c = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "n"}}));

        let prev = Stages::new(vec![vec![a, b.clone()]]);
        let next = Stages::new(vec![vec![a2, b, c]]);
        let diffs = resource_diffs(&prev, &next);
        let ids: Vec<_> = diffs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["n/core/configmap/a", "n/core/configmap/c"]);
        assert_eq!(
            diffs[0].changes,
            vec![Change::Replace { path: "/data/k".into(), from: json!("1"), to: json!("2") }]
        );

        let gone = resource_diffs(&next, &Stages::default());
        assert_eq!(gone.len(), 3);
        assert!(gone.iter().all(|d| matches!(d.changes[0], Change::Replace { ref to, .. } if to.is_null())));
    }

    #[test]
    fn empty_namespace_defaults() {
        assert_eq!(release_ref("r", "").namespace, "default");
        assert_eq!(release_ref("r", "apps").namespace, "apps");
    }
}
