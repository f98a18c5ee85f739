//! kube-rs backed [`ResourceClient`].

use std::sync::RwLock;
use std::time::Instant;

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use hangar_core::Resource;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{ApplyOpts, ClientError, Mapping, ResourceClient, WatchEvent, WatchStream};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "hangar";

type MappingCache = FxHashMap<(String, String), (ApiResource, Mapping)>;

pub struct KubeClient {
    client: Client,
    mappings: RwLock<MappingCache>,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client, mappings: RwLock::new(FxHashMap::default()) } }

    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn cached(&self, api_version: &str, kind: &str) -> Option<(ApiResource, Mapping)> {
        let cache = self.mappings.read().ok()?;
        cache.get(&(api_version.to_string(), kind.to_string())).cloned()
    }

    /// Rebuild the mapping cache from discovery, covering every served version.
    async fn refresh(&self) -> Result<(), ClientError> {
        let started = Instant::now();
        counter!("discovery_refresh_total", 1u64);
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(|e| {
            counter!("discovery_refresh_errors", 1u64);
            from_kube(e, "discovery")
        })?;
        let mut next = MappingCache::default();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let mapping = Mapping { namespaced: matches!(caps.scope, Scope::Namespaced), plural: ar.plural.clone() };
                    next.insert((ar.api_version.clone(), ar.kind.clone()), (ar, mapping));
                }
            }
        }
        histogram!("discovery_refresh_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(kinds = next.len(), "discovery cache refreshed");
        if let Ok(mut cache) = self.mappings.write() {
            *cache = next;
        }
        Ok(())
    }

    /// Resolve through the cache; a miss resets the cache and retries once.
    async fn api_resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, Mapping), ClientError> {
        if let Some(hit) = self.cached(api_version, kind) {
            return Ok(hit);
        }
        self.refresh().await?;
        self.cached(api_version, kind).ok_or_else(|| {
            counter!("discovery_unknown_kind", 1u64);
            ClientError::UnknownKind { api_version: api_version.to_string(), kind: kind.to_string() }
        })
    }

    async fn api_for(&self, r: &Resource) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, mapping) = self.api_resource(r.api_version(), r.kind()).await?;
        Ok(self.api(&ar, &mapping, r.namespace()))
    }

    fn api(&self, ar: &ApiResource, mapping: &Mapping, namespace: Option<&str>) -> Api<DynamicObject> {
        if mapping.namespaced {
            Api::namespaced_with(self.client.clone(), namespace.unwrap_or("default"), ar)
        } else {
            Api::all_with(self.client.clone(), ar)
        }
    }
}

fn to_object(r: &Resource) -> Result<DynamicObject, ClientError> { Ok(serde_json::from_value(r.as_value().clone())?) }

fn to_resource(obj: DynamicObject) -> Result<Resource, ClientError> {
    let mut raw = serde_json::to_value(obj)?;
    strip_managed_fields(&mut raw);
    Ok(Resource::from_value_unchecked(raw))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
    }
}

fn from_kube(e: kube::Error, what: &str) -> ClientError {
    match e {
        kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
            (404, _) => ClientError::NotFound(what.to_string()),
            (409, "AlreadyExists") => ClientError::AlreadyExists(what.to_string()),
            (409, _) => ClientError::Conflict(ae.message),
            (400, _) | (422, _) => ClientError::Invalid(ae.message),
            (code, _) => ClientError::Api { code, message: ae.message },
        },
        kube::Error::SerdeError(e) => ClientError::Serialization(e.to_string()),
        other => ClientError::Transport(other.to_string()),
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<Mapping, ClientError> {
        Ok(self.api_resource(api_version, kind).await?.1)
    }

    async fn apply(&self, resource: &Resource, opts: ApplyOpts) -> Result<Resource, ClientError> {
        let api = self.api_for(resource).await?;
        if !opts.force_ownership {
            self.check_ownership(resource).await?;
        }
        let mut pp = PatchParams::apply(FIELD_MANAGER);
        if opts.force_conflicts {
            pp = pp.force();
        }
        if opts.dry_run {
            pp = pp.dry_run();
        }
        let obj = api
            .patch(resource.name(), &pp, &Patch::Apply(resource.as_value()))
            .await
            .map_err(|e| from_kube(e, &resource.describe()))?;
        to_resource(obj)
    }

    async fn get(&self, resource: &Resource) -> Result<Option<Resource>, ClientError> {
        let api = self.api_for(resource).await?;
        match api.get_opt(resource.name()).await.map_err(|e| from_kube(e, &resource.describe()))? {
            Some(obj) => Ok(Some(to_resource(obj)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &[(&str, &str)],
    ) -> Result<Vec<Resource>, ClientError> {
        let (ar, mapping) = self.api_resource(api_version, kind).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if mapping.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let selector = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",");
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector);
        }
        let list = api.list(&lp).await.map_err(|e| from_kube(e, kind))?;
        list.items.into_iter().map(to_resource).collect()
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let api = self.api_for(resource).await?;
        let obj = api
            .create(&PostParams::default(), &to_object(resource)?)
            .await
            .map_err(|e| from_kube(e, &resource.describe()))?;
        to_resource(obj)
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let api = self.api_for(resource).await?;
        let obj = api
            .replace(resource.name(), &PostParams::default(), &to_object(resource)?)
            .await
            .map_err(|e| from_kube(e, &resource.describe()))?;
        to_resource(obj)
    }

    async fn update_status(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let api = self.api_for(resource).await?;
        let data = serde_json::to_vec(resource.as_value())?;
        let obj = api
            .replace_status(resource.name(), &PostParams::default(), data)
            .await
            .map_err(|e| from_kube(e, &resource.describe()))?;
        to_resource(obj)
    }

    async fn merge_patch(&self, resource: &Resource, patch: &Json) -> Result<Resource, ClientError> {
        let api = self.api_for(resource).await?;
        let obj = api
            .patch(resource.name(), &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| from_kube(e, &resource.describe()))?;
        to_resource(obj)
    }

    async fn delete(&self, resource: &Resource) -> Result<(), ClientError> {
        let api = self.api_for(resource).await?;
        api.delete(resource.name(), &DeleteParams::background())
            .await
            .map_err(|e| from_kube(e, &resource.describe()))?;
        Ok(())
    }

    async fn watch(&self, api_version: &str, kind: &str) -> Result<WatchStream, ClientError> {
        let (ar, _) = self.api_resource(api_version, kind).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        info!(api_version = %ar.api_version, kind = %kind, "watcher started");
        let stream = watcher::watcher(api, watcher::Config::default())
            .map_err(|e| ClientError::Transport(e.to_string()))
            .and_then(|ev| async move {
                match ev {
                    Event::Applied(o) => Ok(WatchEvent::Applied(to_resource(o)?)),
                    Event::Deleted(o) => Ok(WatchEvent::Deleted(to_resource(o)?)),
                    Event::Restarted(list) => {
                        debug!(count = list.len(), "watch restart");
                        Ok(WatchEvent::Restarted(list.into_iter().map(to_resource).collect::<Result<_, _>>()?))
                    }
                }
            });
        Ok(stream.boxed())
    }
}
