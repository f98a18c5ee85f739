use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use hangar_core::Resource;
use hangar_ctrl::{Kind, Scheduler, SchedulerConfig, SchedulerHandle};
use hangar_flight::{EvalConfig, Evaluator, ModuleCache, ProcessEvaluator};
use hangar_kubehub::{wait_ready, ApplyOpts, ResourceClient, WaitOptions};
use hangar_persist::RevisionStore;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::airway::{airway_crd, AirwaySpec, LABEL_INSTANCE_GROUP_KIND, LABEL_INSTANCE_NAME, LABEL_INSTANCE_NAMESPACE};
use crate::dispatcher::{DispatchHandler, EventDispatcher};
use crate::instance::InstanceHandler;
use crate::reconciler::{airway_kind, AirwayHandler};
use crate::state::InstanceStates;
use crate::Mode;

/// Builds the evaluator an airway's instances run their flight with.
pub type EvaluatorFactory = Arc<dyn Fn(&AirwaySpec) -> Arc<dyn Evaluator> + Send + Sync>;

/// Child-process evaluators honouring the airway's timeout.
pub fn process_evaluators() -> EvaluatorFactory {
    Arc::new(|spec: &AirwaySpec| {
        let mut config = EvalConfig::default();
        if let Some(t) = spec.timeout() {
            config.timeout = Some(t);
        }
        Arc::new(ProcessEvaluator::new(config)) as Arc<dyn Evaluator>
    })
}

const MODULE_SWEEP: Duration = Duration::from_secs(60);

/// State shared by the airway reconciler, instance reconcilers and readiness pollers.
pub(crate) struct Shared {
    pub(crate) client: Arc<dyn ResourceClient>,
    pub(crate) store: RevisionStore,
    pub(crate) modules: Arc<ModuleCache>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) dispatch: Arc<DispatchHandler>,
    pub(crate) states: InstanceStates,
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) evaluators: EvaluatorFactory,
    pollers: Mutex<FxHashMap<String, CancellationToken>>,
    airways: Mutex<FxHashMap<String, (Kind, Arc<InstanceHandler>)>>,
}

impl Shared {
    pub(crate) fn bound(&self, airway: &str) -> Option<(Kind, Arc<InstanceHandler>)> {
        self.airways.lock().ok()?.get(airway).cloned()
    }

    pub(crate) fn bound_kinds(&self) -> Vec<(String, Kind)> {
        match self.airways.lock() {
            Ok(a) => a.iter().map(|(n, (k, _))| (n.clone(), k.clone())).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub(crate) fn bind(&self, airway: &str, kind: Kind, handler: Arc<InstanceHandler>) {
        if let Ok(mut a) = self.airways.lock() {
            a.insert(airway.to_string(), (kind, handler));
        }
    }

    pub(crate) fn unbind(&self, airway: &str) {
        if let Ok(mut a) = self.airways.lock() {
            a.remove(airway);
        }
    }

    /// Cancel any running poller for `key` and return the token for its successor.
    pub(crate) fn replace_poller(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut p) = self.pollers.lock() {
            if let Some(old) = p.insert(key.to_string(), token.clone()) {
                old.cancel();
            }
        }
        token
    }

    pub(crate) fn cancel_poller(&self, key: &str) {
        if let Ok(mut p) = self.pollers.lock() {
            if let Some(old) = p.remove(key) {
                old.cancel();
            }
        }
    }

    fn cancel_all_pollers(&self) {
        if let Ok(mut p) = self.pollers.lock() {
            for (_, t) in p.drain() {
                t.cancel();
            }
        }
    }
}

/// The airway controller: binds instance kinds as airways come and go and reconciles
/// their instances into releases.
pub struct Atc {
    scheduler: Scheduler,
    shared: Arc<Shared>,
}

impl Atc {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        evaluators: EvaluatorFactory,
        modules: Arc<ModuleCache>,
        config: SchedulerConfig,
    ) -> Self {
        let scheduler = Scheduler::new(client.clone(), config);
        let handle = scheduler.handle();
        let dispatcher = Arc::new(EventDispatcher::new());
        let shared = Arc::new(Shared {
            store: RevisionStore::new(client.clone()),
            client,
            modules,
            dispatch: Arc::new(DispatchHandler::new(dispatcher.clone(), handle.clone())),
            dispatcher,
            states: InstanceStates::new(),
            scheduler: handle,
            evaluators,
            pollers: Mutex::new(FxHashMap::default()),
            airways: Mutex::new(FxHashMap::default()),
        });
        Self { scheduler, shared }
    }

    pub fn handle(&self) -> SchedulerHandle { self.scheduler.handle() }

    pub fn is_listening(&self, kind: &Kind) -> bool { self.scheduler.is_listening(kind) }

    pub fn dispatcher(&self) -> &EventDispatcher { &self.shared.dispatcher }

    /// Mode of the instance that owns `resource`, if it is an instance release resource.
    pub fn instance_mode(&self, resource: &Resource) -> Option<Mode> {
        let name = resource.label(LABEL_INSTANCE_NAME)?;
        let namespace = resource.label(LABEL_INSTANCE_NAMESPACE).unwrap_or("");
        let group_kind = resource.label(LABEL_INSTANCE_GROUP_KIND)?;
        let key = format!("{}/{}:{}", namespace, group_kind, name);
        self.shared.states.get(&key).map(|s| s.mode())
    }

    /// Whether an admission layer should reject an external change to `resource`.
    /// Waits for any in-progress reconcile of the owning instance to finish.
    pub async fn blocks_external_changes(&self, resource: &Resource) -> bool {
        let (Some(name), Some(group_kind)) = (resource.label(LABEL_INSTANCE_NAME), resource.label(LABEL_INSTANCE_GROUP_KIND)) else {
            return false;
        };
        let namespace = resource.label(LABEL_INSTANCE_NAMESPACE).unwrap_or("");
        let Some(state) = self.shared.states.get(&format!("{}/{}:{}", namespace, group_kind, name)) else { return false };
        let _read = state.lock.read().await;
        state.mode() == Mode::Static
    }

    /// Install the Airway CRD, bind the Airway kind and run until `ctx` is cancelled.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        let client = self.shared.client.as_ref();
        let crd = airway_crd();
        client
            .apply(&crd, ApplyOpts { force_conflicts: true, ..ApplyOpts::default() })
            .await
            .context("failed to apply airway CRD")?;
        wait_ready(client, &crd, WaitOptions { timeout: Duration::from_secs(30), interval: Duration::from_millis(500) })
            .await
            .context("airway CRD was not established")?;

        self.scheduler
            .register_kind(airway_kind(), Arc::new(AirwayHandler::new(self.shared.clone())))
            .await
            .context("failed to register airway kind")?;
        let sweeper = self.shared.modules.spawn_sweeper(MODULE_SWEEP, ctx.clone());
        info!("atc started");

        let res = self.scheduler.run(ctx).await;
        self.shared.cancel_all_pollers();
        sweeper.abort();
        info!("atc stopped");
        res
    }
}
