//! Kind-specific readiness predicates and bounded readiness waits.

use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use hangar_core::Resource;
use serde_json::Value as Json;
use tracing::debug;

use crate::ResourceClient;

/// Kind that marks dynamically defined instances through owner references.
pub const AIRWAY_KIND: &str = "Airway";

const REPLICA_COUNTS: [&str; 4] = ["replicas", "availableReplicas", "readyReplicas", "updatedReplicas"];

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self { Self { timeout: Duration::from_secs(120), interval: Duration::from_secs(1) } }
}

/// Readiness of a live object. A failed Job is an error, not "not yet ready".
pub fn is_ready(r: &Resource) -> Result<bool> {
    let v = r.as_value();
    if r.owner_references().iter().any(|o| o.get("kind").and_then(Json::as_str) == Some(AIRWAY_KIND)) {
        return Ok(condition(v, "Ready") == Some(true));
    }
    let ready = match (r.group(), r.kind()) {
        ("", "Namespace") => status_str(v, "phase") == Some("Active"),
        ("", "Pod") => condition(v, "Ready") == Some(true) || condition(v, "Available") == Some(true),
        ("apps", "Deployment") => condition(v, "Available") == Some(true) && counts_equal(v, &REPLICA_COUNTS),
        ("apps", "ReplicaSet") | ("apps", "StatefulSet") => counts_equal(v, &REPLICA_COUNTS),
        ("apps", "DaemonSet") => counts_equal(
            v,
            &["currentNumberScheduled", "desiredNumberScheduled", "updatedNumberScheduled", "numberAvailable", "numberReady"],
        ),
        ("batch", "Job") => {
            if condition(v, "Failed") == Some(true) {
                return Err(anyhow!("job {} failed", r.describe()));
            }
            condition(v, "Complete") == Some(true)
        }
        ("apiextensions.k8s.io", "CustomResourceDefinition") => condition(v, "Established") == Some(true),
        _ => true,
    };
    Ok(ready)
}

fn status_str<'a>(v: &'a Json, key: &str) -> Option<&'a str> { v.get("status")?.get(key)?.as_str() }

fn condition(v: &Json, ty: &str) -> Option<bool> {
    v.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Json::as_str) == Some(ty))
        .and_then(|c| c.get("status").and_then(Json::as_str))
        .map(|s| s == "True")
}

/// All counters present in status must agree; absent counters read as zero.
fn counts_equal(v: &Json, keys: &[&str]) -> bool {
    let Some(status) = v.get("status") else { return false };
    let mut vals = keys.iter().map(|k| status.get(*k).and_then(Json::as_i64).unwrap_or(0));
    match vals.next() {
        Some(first) => vals.all(|x| x == first),
        None => true,
    }
}

/// Poll until `resource` is ready or the timeout elapses.
pub async fn wait_ready(client: &dyn ResourceClient, resource: &Resource, opts: WaitOptions) -> Result<()> {
    let poll = async {
        let mut ticker = tokio::time::interval(opts.interval);
        loop {
            ticker.tick().await;
            match client.get(resource).await {
                Ok(Some(live)) => {
                    if is_ready(&live)? {
                        return Ok::<(), anyhow::Error>(());
                    }
                }
                Ok(None) => debug!(resource = %resource, "waiting for resource to appear"),
                Err(e) => debug!(resource = %resource, error = %e, "readiness poll failed"),
            }
        }
    };
    match tokio::time::timeout(opts.timeout, poll).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!("timed out after {:?} waiting for {}", opts.timeout, resource)),
    }
}

/// Wait for every resource concurrently; the error names each resource that never became ready.
pub async fn wait_all(client: &dyn ResourceClient, resources: &[&Resource], opts: WaitOptions) -> Result<()> {
    let results = join_all(resources.iter().map(|r| wait_ready(client, r, opts))).await;
    let failed: Vec<String> = resources
        .iter()
        .zip(results)
        .filter_map(|(r, res)| res.err().map(|e| format!("{}: {}", r.describe(), e)))
        .collect();
    if failed.is_empty() {
        return Ok(());
    }
    Err(anyhow!("resources not ready:\n  - {}", failed.join("\n  - ")))
}
