//! The Airway custom resource: declares an instance kind and the flight that reconciles it.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use hangar_core::Resource;
use hangar_ctrl::Kind;
use hangar_kubehub::AIRWAY_KIND;
use hangar_release::PruneOpts;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::Mode;

pub const GROUP: &str = "hangar.dev";
pub const API_VERSION: &str = "hangar.dev/v1alpha1";
/// Label on instance CRDs naming the airway that defines them.
pub const LABEL_AIRWAY: &str = "hangar.dev/airway";
/// Labels stamped on every resource of an instance release.
pub const LABEL_INSTANCE_NAME: &str = "instance.hangar.dev/name";
pub const LABEL_INSTANCE_NAMESPACE: &str = "instance.hangar.dev/namespace";
pub const LABEL_INSTANCE_GROUP_KIND: &str = "instance.hangar.dev/group-kind";

pub const DEFAULT_HISTORY_CAP: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    #[default]
    Namespaced,
    Cluster,
}

/// Shape of the instance kind's CRD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdTemplate {
    pub group: String,
    pub kind: String,
    pub plural: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default = "default_version")]
    pub version: String,
    /// OpenAPI v3 schema for instances; unknown fields are preserved when absent.
    #[serde(default)]
    pub schema: Option<Json>,
}

fn default_version() -> String { "v1".into() }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneSpec {
    #[serde(default)]
    pub crds: bool,
    #[serde(default)]
    pub namespaces: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirwaySpec {
    /// Module reference, a path or `file://` URL.
    pub flight: String,
    pub template: CrdTemplate,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub history_cap: Option<usize>,
    /// Re-evaluate and repair drift this often; unset disables it.
    #[serde(default)]
    pub fix_drift_interval_secs: Option<u64>,
    #[serde(default)]
    pub cross_namespace: bool,
    #[serde(default)]
    pub prune: PruneSpec,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Path into the instance handed to the flight as input; empty passes the whole object.
    #[serde(default)]
    pub object_path: Vec<String>,
}

impl AirwaySpec {
    pub fn history_cap(&self) -> usize { self.history_cap.unwrap_or(DEFAULT_HISTORY_CAP) }

    pub fn fix_drift_interval(&self) -> Option<Duration> {
        self.fix_drift_interval_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn timeout(&self) -> Option<Duration> { self.timeout_secs.map(Duration::from_secs) }

    pub fn prune_opts(&self) -> PruneOpts {
        PruneOpts { remove_crds: self.prune.crds, remove_namespaces: self.prune.namespaces }
    }

    /// Flight input for `instance`: the JSON at `object_path`, or null when the path is missing.
    pub fn input(&self, instance: &Resource) -> Result<Vec<u8>> {
        let mut v = instance.as_value();
        for seg in &self.object_path {
            match v.get(seg) {
                Some(next) => v = next,
                None => {
                    v = &Json::Null;
                    break;
                }
            }
        }
        serde_json::to_vec(v).context("failed to marshal flight input")
    }
}

/// A parsed Airway object.
#[derive(Debug, Clone, PartialEq)]
pub struct Airway {
    pub name: String,
    pub uid: String,
    pub spec: AirwaySpec,
}

impl Airway {
    pub fn from_resource(r: &Resource) -> Result<Self> {
        let spec: AirwaySpec = serde_json::from_value(r.as_value().get("spec").cloned().unwrap_or(Json::Null))
            .with_context(|| format!("invalid airway spec for {}", r.name()))?;
        let t = &spec.template;
        if t.group.is_empty() || t.kind.is_empty() || t.plural.is_empty() {
            bail!("airway {}: template group, kind and plural are required", r.name());
        }
        let expected = format!("{}.{}", t.plural, t.group);
        if r.name() != expected {
            bail!("airway name must be {} to match its template, got {}", expected, r.name());
        }
        if spec.flight.is_empty() {
            bail!("airway {}: flight is required", r.name());
        }
        Ok(Self { name: r.name().to_string(), uid: r.uid().unwrap_or_default().to_string(), spec })
    }

    pub fn instance_kind(&self) -> Kind {
        let t = &self.spec.template;
        Kind::new(format!("{}/{}", t.group, t.version), t.kind.clone())
    }

    /// Owner reference pointing at this airway.
    pub fn owner_reference(&self) -> Json {
        json!({
            "apiVersion": API_VERSION,
            "kind": AIRWAY_KIND,
            "name": self.name,
            "uid": self.uid,
            "blockOwnerDeletion": true,
        })
    }

    /// CRD for the instance kind, with a status subresource.
    pub fn instance_crd(&self) -> Resource {
        let t = &self.spec.template;
        let schema = t
            .schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "x-kubernetes-preserve-unknown-fields": true}));
        let scope = match t.scope {
            Scope::Namespaced => "Namespaced",
            Scope::Cluster => "Cluster",
        };
        Resource::from_value_unchecked(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": self.name, "labels": {LABEL_AIRWAY: self.name}},
            "spec": {
                "group": t.group,
                "scope": scope,
                "names": {
                    "kind": t.kind,
                    "plural": t.plural,
                    "singular": t.kind.to_lowercase(),
                    "listKind": format!("{}List", t.kind),
                },
                "versions": [{
                    "name": t.version,
                    "served": true,
                    "storage": true,
                    "subresources": {"status": {}},
                    "schema": {"openAPIV3Schema": schema},
                }],
            },
        }))
    }
}

/// The cluster scoped CRD defining airways themselves.
pub fn airway_crd() -> Resource {
    Resource::from_value_unchecked(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": format!("airways.{}", GROUP)},
        "spec": {
            "group": GROUP,
            "scope": "Cluster",
            "names": {"kind": AIRWAY_KIND, "plural": "airways", "singular": "airway", "listKind": "AirwayList"},
            "versions": [{
                "name": "v1alpha1",
                "served": true,
                "storage": true,
                "subresources": {"status": {}},
                "schema": {"openAPIV3Schema": {"type": "object", "x-kubernetes-preserve-unknown-fields": true}},
            }],
        },
    }))
}

/// Release name of an instance: `group.kind.name`, lowercased.
pub fn release_name(instance: &Resource) -> String {
    let group = match instance.group() {
        "" => "core",
        g => g,
    };
    format!("{}.{}.{}", group, instance.kind(), instance.name()).to_lowercase()
}
