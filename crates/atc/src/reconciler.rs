//! Reconciler for Airway objects: keeps one instance handler bound per airway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hangar_core::Resource;
use hangar_ctrl::{Event, Handler, Kind, Outcome};
use hangar_kubehub::{wait_ready, ApplyOpts, WaitOptions};
use hangar_release::Pilot;
use tracing::{info, warn};

use crate::airway::Airway;
use crate::atc::Shared;
use crate::dispatcher::probe;
use crate::instance::{InstanceHandler, FINALIZER as INSTANCE_FINALIZER};
use crate::status;

/// Blocks airway deletion until its instances are landed and the kind is unbound.
pub const FINALIZER: &str = "hangar.dev/airway-cleanup";
const CRD_WAIT: Duration = Duration::from_secs(30);

pub(crate) struct AirwayHandler {
    shared: Arc<Shared>,
}

impl AirwayHandler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self { Self { shared } }

    async fn bind(&self, live: &Resource, airway: Airway) -> Result<()> {
        let client = self.shared.client.as_ref();
        let kind = airway.instance_kind();
        if let Some((previous, _)) = self.shared.bound(&airway.name) {
            if previous != kind {
                info!(airway = %airway.name, from = %previous, to = %kind, "instance kind changed");
                self.shared.scheduler.shutdown_kind(&previous).await;
            }
        }

        status::set_ready(client, live, false, "InProgress", "Registering instance kind").await?;
        let crd = airway.instance_crd();
        client
            .apply(&crd, ApplyOpts { force_conflicts: true, ..ApplyOpts::default() })
            .await
            .with_context(|| format!("failed to apply CRD for {}", kind))?;
        wait_ready(client, &crd, WaitOptions { timeout: CRD_WAIT, interval: Duration::from_millis(500) })
            .await
            .with_context(|| format!("CRD for {} was not established", kind))?;

        self.shared.modules.invalidate(&airway.spec.flight);
        self.shared
            .modules
            .get(&airway.spec.flight)
            .await
            .with_context(|| format!("failed to load flight {}", airway.spec.flight))?;

        let evaluator = (self.shared.evaluators)(&airway.spec);
        let pilot = Pilot::with_store(self.shared.client.clone(), self.shared.store.clone(), evaluator);
        let handler = Arc::new(InstanceHandler::new(self.shared.clone(), Arc::new(airway.clone()), pilot));
        self.shared.scheduler.register_kind(kind.clone(), handler.clone()).await?;
        self.shared.bind(&airway.name, kind.clone(), handler);

        info!(airway = %airway.name, kind = %kind, "airway bound");
        status::set_ready(client, live, true, "Ready", &format!("Listening for {}", kind)).await
    }

    /// Unbind the airway's kind, then land every instance of it. The instance CRD is kept.
    async fn retire(&self, name: &str) -> Result<()> {
        let Some((kind, handler)) = self.shared.bound(name) else { return Ok(()) };
        let client = self.shared.client.as_ref();
        self.shared.scheduler.shutdown_kind(&kind).await;
        let instances = match client.list(&kind.api_version, &kind.kind, None, &[]).await {
            Ok(list) => list,
            Err(e) if e.is_unknown_kind() => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("failed to list instances of {}", kind)),
        };
        for instance in instances.iter().filter(|i| i.has_finalizer(INSTANCE_FINALIZER)) {
            handler.land(instance).await.with_context(|| format!("failed to land {}", instance))?;
        }
        self.shared.unbind(name);
        info!(airway = %name, kind = %kind, "airway retired");
        Ok(())
    }

    async fn report_error(&self, live: &Resource, err: &anyhow::Error) {
        if let Err(e) = status::set_ready(self.shared.client.as_ref(), live, false, "Error", &format!("{:#}", err)).await {
            warn!(airway = %live.name(), error = %format!("{:#}", e), "failed to record error status");
        }
    }
}

#[async_trait::async_trait]
impl Handler for AirwayHandler {
    async fn handle(&self, event: &Event) -> Result<Outcome> {
        let client = self.shared.client.as_ref();
        let Some(mut live) = client
            .get(&probe(&event.kind, None, &event.name))
            .await
            .context("failed to get airway")?
        else {
            self.retire(&event.name).await?;
            return Ok(Outcome::done());
        };

        if live.is_deleting() {
            if live.has_finalizer(FINALIZER) {
                status::set_ready(client, &live, false, "Terminating", "Landing instances").await?;
                self.retire(&event.name).await?;
                if let Some(mut fresh) = client.get(&live).await.context("failed to get airway")? {
                    if fresh.remove_finalizer(FINALIZER) {
                        client.update(&fresh).await.context("failed to remove airway finalizer")?;
                    }
                }
            }
            return Ok(Outcome::done());
        }

        if !live.has_finalizer(FINALIZER) {
            live.add_finalizer(FINALIZER);
            client.update(&live).await.context("failed to add airway finalizer")?;
            return Ok(Outcome::done());
        }

        let airway = match Airway::from_resource(&live) {
            Ok(a) => a,
            Err(e) => {
                self.report_error(&live, &e).await;
                return Err(e);
            }
        };
        if let Err(e) = self.bind(&live, airway).await {
            self.report_error(&live, &e).await;
            return Err(e);
        }
        Ok(Outcome::done())
    }

    async fn teardown(&self) {
        for (name, kind) in self.shared.bound_kinds() {
            self.shared.scheduler.shutdown_kind(&kind).await;
            self.shared.unbind(&name);
        }
    }
}

pub(crate) fn airway_kind() -> Kind { Kind::new(crate::airway::API_VERSION, hangar_kubehub::AIRWAY_KIND) }
