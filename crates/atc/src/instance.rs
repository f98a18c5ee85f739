//! Reconciler for instances of an airway-defined kind.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use hangar_core::{is_warning, ReleaseRef, Resource, Stages};
use hangar_ctrl::{Event, Handler, Outcome, Trigger};
use hangar_flight::Flight;
use hangar_kubehub::{wait_all, WaitOptions};
use hangar_release::{IdentityFn, MaydayParams, Pilot, TakeoffOutcome, TakeoffParams, TurbulenceParams};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::airway::{release_name, Airway, LABEL_INSTANCE_GROUP_KIND, LABEL_INSTANCE_NAME, LABEL_INSTANCE_NAMESPACE};
use crate::atc::Shared;
use crate::dispatcher::probe;
use crate::status;
use crate::Mode;

/// Blocks instance deletion until its release is torn down.
pub const FINALIZER: &str = "hangar.dev/mayday";
const LOCK_HOLDER: &str = "hangar-atc";
const READY_TIMEOUT: Duration = Duration::from_secs(300);
const READY_POLL: Duration = Duration::from_secs(2);

pub(crate) struct InstanceHandler {
    shared: Arc<Shared>,
    airway: Arc<Airway>,
    pilot: Pilot,
}

impl InstanceHandler {
    pub(crate) fn new(shared: Arc<Shared>, airway: Arc<Airway>, pilot: Pilot) -> Self { Self { shared, airway, pilot } }

    async fn fly(&self, event: &Event, instance: &Resource, mode: Mode) -> Result<Outcome> {
        let client = self.shared.client.as_ref();
        let spec = &self.airway.spec;
        status::set_ready(client, instance, false, "InProgress", "Reconciling release").await?;

        let module = self.shared.modules.get(&spec.flight).await.context("failed to fetch flight module from cache")?;
        let release = instance_release(instance);
        let flight = Flight::new(module, release.clone()).with_input(spec.input(instance)?);

        let identity = Arc::new(Mutex::new(None));
        let mut params = TakeoffParams::new(release.name.clone(), release.namespace.clone(), flight);
        params.force_conflicts = true;
        params.force_ownership = true;
        params.cross_namespace = spec.cross_namespace;
        params.history_cap = spec.history_cap();
        params.prune = spec.prune_opts();
        params.lock_holder = LOCK_HOLDER.into();
        params.owner_references = vec![owner_reference(instance)];
        params.extra_labels = vec![
            (LABEL_INSTANCE_NAME.into(), instance.name().into()),
            (LABEL_INSTANCE_NAMESPACE.into(), instance.namespace().unwrap_or_default().into()),
            (LABEL_INSTANCE_GROUP_KIND.into(), event.kind.to_string()),
        ];
        params.identity = Some(identity_filter(instance, identity.clone()));

        counter!("atc_takeoff_total", 1u64);
        match self.pilot.takeoff(params).await {
            Ok(TakeoffOutcome::Landed { revision, .. }) => info!(release = %release, revision = revision.id, "instance released"),
            Ok(_) => {}
            Err(e) if is_warning(&e) => {
                debug!(release = %release, "flight output unchanged; checking drift");
                self.fix_drift(instance, &release).await?;
            }
            Err(e) => {
                counter!("atc_takeoff_errors", 1u64);
                self.report_error(instance, &e).await;
                return Err(e.context("failed to takeoff"));
            }
        }

        let identity = identity.lock().ok().and_then(|mut s| s.take());
        if let Some(st) = identity.as_ref().and_then(|r| r.as_value().get("status")) {
            status::replace_status(client, instance, st.clone()).await?;
        }

        let stages = self.pilot.active_resources(&release).await?;
        let tracked = Event::new(event.kind.clone(), event.namespace.as_deref(), &event.name);
        for kind in self.shared.dispatcher.track(&tracked, mode, &stages) {
            if let Err(e) = self.shared.scheduler.ensure_kind(kind.clone(), self.shared.dispatch.clone()).await {
                warn!(kind = %kind, error = %format!("{:#}", e), "failed to watch tracked kind");
            }
        }

        let reports_ready = identity.as_ref().and_then(status::ready_condition).is_some();
        if !reports_ready {
            self.spawn_poller(event.key(), instance.clone(), stages);
        }

        Ok(match spec.fix_drift_interval() {
            Some(every) => Outcome::requeue_after(every),
            None => Outcome::done(),
        })
    }

    /// Repair children that were changed or removed behind the release's back.
    async fn fix_drift(&self, instance: &Resource, release: &ReleaseRef) -> Result<()> {
        let params = TurbulenceParams {
            release: release.name.clone(),
            namespace: release.namespace.clone(),
            conflicts_only: true,
            fix: true,
        };
        match self.pilot.turbulence(params).await {
            Ok(report) => {
                if !report.fixed.is_empty() {
                    counter!("atc_drift_fixed", report.fixed.len() as u64);
                    info!(release = %release, fixed = report.fixed.len(), "fixed drift");
                }
                Ok(())
            }
            Err(e) => {
                self.report_error(instance, &e).await;
                Err(e.context("failed to fix drift"))
            }
        }
    }

    /// Tear the release down and release the finalizer.
    pub(crate) async fn land(&self, instance: &Resource) -> Result<()> {
        let client = self.shared.client.as_ref();
        status::set_ready(client, instance, false, "Terminating", "Deleting release resources").await?;
        let event = Event::for_resource(instance, Trigger::Deleted);
        self.shared.cancel_poller(&event.key());

        let release = instance_release(instance);
        let params = MaydayParams {
            release: release.name.clone(),
            namespace: release.namespace.clone(),
            prune: self.airway.spec.prune_opts(),
        };
        match self.pilot.mayday(params).await {
            Ok(out) => info!(release = %release, removed = out.pruned.removed.len(), "instance release deleted"),
            Err(e) if is_warning(&e) => debug!(release = %release, "{}", e),
            Err(e) => return Err(e.context("failed to delete instance release")),
        }

        if let Some(mut live) = client.get(instance).await.context("failed to get instance")? {
            if live.remove_finalizer(FINALIZER) {
                client.update(&live).await.context("failed to remove instance finalizer")?;
            }
        }
        self.forget(&event);
        Ok(())
    }

    async fn report_error(&self, instance: &Resource, err: &anyhow::Error) {
        let msg = format!("{:#}", err);
        if let Err(e) = status::set_ready(self.shared.client.as_ref(), instance, false, "Error", &msg).await {
            warn!(instance = %instance, error = %format!("{:#}", e), "failed to record error status");
        }
    }

    /// Mark the instance Ready once every resource of the active revision is.
    fn spawn_poller(&self, key: String, instance: Resource, stages: Stages) {
        let token = self.shared.replace_poller(&key);
        let shared = self.shared.clone();
        let timeout = self.airway.spec.timeout().unwrap_or(READY_TIMEOUT);
        tokio::spawn(async move {
            let resources: Vec<&Resource> = stages.flatten().collect();
            let opts = WaitOptions { timeout, interval: READY_POLL };
            let res = tokio::select! {
                _ = token.cancelled() => return,
                res = wait_all(shared.client.as_ref(), &resources, opts) => res,
            };
            let Some(state) = shared.states.get(&key) else { return };
            let _guard = state.lock.write().await;
            if token.is_cancelled() {
                return;
            }
            let client = shared.client.as_ref();
            let update = match res {
                Ok(()) => status::set_ready(client, &instance, true, "Ready", "Successfully deployed").await,
                Err(e) => status::set_ready(client, &instance, false, "Error", &format!("{:#}", e)).await,
            };
            if let Err(e) = update {
                warn!(instance = %instance, error = %format!("{:#}", e), "failed to update readiness");
            }
        });
    }

    fn forget(&self, event: &Event) {
        let key = event.key();
        self.shared.cancel_poller(&key);
        self.shared.states.remove(&key);
        self.shared.dispatcher.remove_event(event);
    }
}

#[async_trait::async_trait]
impl Handler for InstanceHandler {
    async fn handle(&self, event: &Event) -> Result<Outcome> {
        let client = self.shared.client.as_ref();
        let Some(mut instance) = client
            .get(&probe(&event.kind, event.namespace.as_deref(), &event.name))
            .await
            .context("failed to get instance")?
        else {
            self.forget(event);
            return Ok(Outcome::done());
        };

        let key = event.key();
        let state = self.shared.states.entry(&key);
        let _guard = state.lock.write().await;
        let mode = Mode::resolve(&instance, self.airway.spec.mode);
        state.set_mode(mode);

        if instance.is_deleting() {
            match instance.has_finalizer(FINALIZER) {
                true => self.land(&instance).await?,
                false => self.forget(event),
            }
            return Ok(Outcome::done());
        }

        let airway_owned = instance.owner_references().iter().any(|o| o.get("uid") == Some(&json!(self.airway.uid)));
        if !instance.has_finalizer(FINALIZER) || !airway_owned {
            instance.add_finalizer(FINALIZER);
            instance.add_owner_references(&[self.airway.owner_reference()]);
            client.update(&instance).await.context("failed to add instance finalizer")?;
            return Ok(Outcome::done());
        }

        self.fly(event, &instance, mode).await
    }
}

/// Release of an instance; cluster scoped instances live in `default`.
pub(crate) fn instance_release(instance: &Resource) -> ReleaseRef {
    ReleaseRef::new(release_name(instance), instance.namespace().unwrap_or("default"))
}

fn owner_reference(instance: &Resource) -> Json {
    json!({
        "apiVersion": instance.api_version(),
        "kind": instance.kind(),
        "name": instance.name(),
        "uid": instance.uid().unwrap_or_default(),
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

/// Matches the instance itself in flight output and keeps the last match.
fn identity_filter(instance: &Resource, slot: Arc<Mutex<Option<Resource>>>) -> IdentityFn {
    let group = instance.group().to_string();
    let kind = instance.kind().to_string();
    let name = instance.name().to_string();
    let namespace = instance.namespace().map(str::to_string);
    Arc::new(move |r: &Resource| {
        let hit = r.group() == group
            && r.kind() == kind
            && r.name() == name
            && r.namespace().map_or(true, |ns| namespace.as_deref() == Some(ns));
        if hit {
            if let Ok(mut s) = slot.lock() {
                *s = Some(r.clone());
            }
        }
        hit
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(ns: Option<&str>) -> Resource {
        let mut v = json!({"apiVersion": "examples.com/v1", "kind": "Backend", "metadata": {"name": "b", "uid": "u-1"}});
        if let Some(ns) = ns {
            v["metadata"]["namespace"] = json!(ns);
        }
        Resource::from_value(v).unwrap()
    }

    #[test]
    fn identity_filter_captures_the_instance_only() {
        let slot = Arc::new(Mutex::new(None));
        let filter = identity_filter(&backend(Some("apps")), slot.clone());
        let cm = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}})).unwrap();
        assert!(!filter(&cm));
        assert!(!filter(&backend(Some("other"))));
        assert!(slot.lock().unwrap().is_none());

        let mut emitted = backend(None);
        emitted.as_value_mut()["status"] = json!({"phase": "Up"});
        assert!(filter(&emitted));
        assert_eq!(slot.lock().unwrap().as_ref().unwrap().as_value()["status"]["phase"], "Up");
    }

    #[test]
    fn cluster_scoped_instances_release_into_default() {
        assert_eq!(instance_release(&backend(None)), ReleaseRef::new("examples.com.backend.b", "default"));
        assert_eq!(instance_release(&backend(Some("apps"))).namespace, "apps");
        assert_eq!(owner_reference(&backend(None))["uid"], "u-1");
    }
}
