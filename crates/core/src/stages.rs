//! Flight output parsing and dependency tiering.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Error, Resource};

/// One stage of resources. Stages are applied in order, each gated on readiness of the previous one.
pub type Stage = Vec<Resource>;

/// Ordered list of stages. Serialized as a list of lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stages(Vec<Stage>);

impl Stages {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self(stages.into_iter().filter(|s| !s.is_empty()).collect())
    }

    /// Parse flight output: a single resource, a flat list, or a list of lists.
    /// JSON is tried first, then (multi-document) YAML.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(data).map_err(|e| Error::InvalidOutput(format!("output is not utf-8: {}", e)))?;
        if text.trim().is_empty() {
            return Err(Error::InvalidOutput("empty output".into()));
        }
        let value = match serde_json::from_str::<Json>(text) {
            Ok(v) => v,
            Err(_) => parse_yaml_stream(text)?,
        };
        Self::from_value(value)
    }

    pub fn from_value(value: Json) -> Result<Self, Error> {
        match value {
            Json::Object(_) => Ok(Self::new(vec![vec![Resource::from_value(value)?]])),
            Json::Array(items) => {
                if items.iter().all(Json::is_array) && !items.is_empty() {
                    let mut stages = Vec::with_capacity(items.len());
                    for (i, stage) in items.into_iter().enumerate() {
                        stages.push(resources_from(stage).map_err(|e| Error::InvalidOutput(format!("stage {}: {}", i, e)))?);
                    }
                    Ok(Self::new(stages))
                } else {
                    Ok(Self::new(vec![resources_from(Json::Array(items))?]))
                }
            }
            Json::Null => Ok(Self::default()),
            other => Err(Error::InvalidOutput(format!("expected resource or list of resources, got {}", type_name(&other)))),
        }
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.iter().all(Vec::is_empty) }
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Stage> { self.0.iter() }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stage> { self.0.iter_mut() }

    /// All resources across stages, in order.
    pub fn flatten(&self) -> impl Iterator<Item = &Resource> { self.0.iter().flatten() }

    pub fn resource_count(&self) -> usize { self.0.iter().map(Vec::len).sum() }

    /// Drop resources matching the predicate, returning the removed ones.
    pub fn extract(&mut self, mut pred: impl FnMut(&Resource) -> bool) -> Vec<Resource> {
        let mut out = Vec::new();
        for stage in self.0.iter_mut() {
            let (hit, keep): (Vec<_>, Vec<_>) = std::mem::take(stage).into_iter().partition(|r| pred(r));
            *stage = keep;
            out.extend(hit);
        }
        self.0.retain(|s| !s.is_empty());
        out
    }

    pub fn into_inner(self) -> Vec<Stage> { self.0 }
}

fn parse_yaml_stream(text: &str) -> Result<Json, Error> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let v = serde_yaml::Value::deserialize(doc).map_err(|e| Error::InvalidOutput(format!("parsing yaml: {}", e)))?;
        if v.is_null() {
            continue;
        }
        docs.push(serde_json::to_value(v).map_err(|e| Error::InvalidOutput(format!("converting yaml to json: {}", e)))?);
    }
    Ok(match docs.len() {
        0 => Json::Null,
        1 => docs.pop().unwrap_or(Json::Null),
        _ => Json::Array(docs),
    })
}

fn resources_from(v: Json) -> Result<Stage, Error> {
    match v {
        Json::Array(items) => items
            .into_iter()
            .filter(|x| !x.is_null())
            .map(Resource::from_value)
            .collect(),
        other => Err(Error::InvalidOutput(format!("expected list of resources, got {}", type_name(&other)))),
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Dependency tiers of a stage: namespaces and CRDs must be ready before the rest.
#[derive(Debug, Default)]
pub struct Tiers<'a> {
    pub namespaces: Vec<&'a Resource>,
    pub crds: Vec<&'a Resource>,
    pub core: Vec<&'a Resource>,
}

impl<'a> Tiers<'a> {
    pub fn split(stage: &'a [Resource]) -> Self {
        let mut t = Tiers::default();
        for r in stage {
            if r.is_namespace() {
                t.namespaces.push(r);
            } else if r.is_crd() {
                t.crds.push(r);
            } else {
                t.core.push(r);
            }
        }
        t
    }

    /// Non-empty tiers in apply order.
    pub fn ordered(&self) -> impl Iterator<Item = &[&'a Resource]> {
        [&self.namespaces, &self.crds, &self.core].into_iter().map(Vec::as_slice).filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_flat_and_staged_json() {
        let one = br#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}"#;
        let s = Stages::parse(one).unwrap();
        assert_eq!((s.len(), s.resource_count()), (1, 1));

        let flat = br#"[{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}},{"apiVersion":"v1","kind":"Secret","metadata":{"name":"b"}}]"#;
        let s = Stages::parse(flat).unwrap();
        assert_eq!((s.len(), s.resource_count()), (1, 2));

        let staged = br#"[[{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"n"}}],[],[{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}]]"#;
        let s = Stages::parse(staged).unwrap();
        assert_eq!((s.len(), s.resource_count()), (2, 2));
    }

    #[test]
    fn parses_multi_document_yaml() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
        let s = Stages::parse(y.as_bytes()).unwrap();
        let names: Vec<_> = s.flatten().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn rejects_garbage_and_empty_output() {
        assert!(Stages::parse(b"").is_err());
        assert!(Stages::parse(b"42").is_err());
        assert!(Stages::parse(br#"[{"kind":"ConfigMap"}]"#).is_err());
    }

    #[test]
    fn tiers_order_namespaces_then_crds_then_core() {
        let v = serde_json::json!([
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}},
            {"apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": {"name": "x.y"}},
            {"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "n"}},
        ]);
        let s = Stages::from_value(v).unwrap();
        let stage = s.iter().next().unwrap();
        let tiers = Tiers::split(stage);
        let kinds: Vec<_> = tiers.ordered().map(|t| t[0].kind().to_string()).collect();
        assert_eq!(kinds, vec!["Namespace", "CustomResourceDefinition", "ConfigMap"]);
    }

    #[test]
    fn extract_removes_matching_resources() {
        let v = serde_json::json!([
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}},
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}},
        ]);
        let mut s = Stages::from_value(v).unwrap();
        let got = s.extract(|r| r.name() == "a");
        assert_eq!(got.len(), 1);
        assert_eq!(s.resource_count(), 1);
    }
}
