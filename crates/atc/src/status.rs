//! Ready condition bookkeeping with optimistic-concurrency retries.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use hangar_core::Resource;
use hangar_kubehub::ResourceClient;
use serde_json::{json, Value as Json};
use tracing::debug;

pub const READY: &str = "Ready";
const STATUS_RETRIES: usize = 5;

/// Insert or replace the Ready condition in `status`. The transition time only moves
/// when the condition's status flips.
pub fn upsert_ready(status: &mut Json, ready: bool, reason: &str, message: &str, generation: Option<i64>) {
    if !status.is_object() {
        *status = json!({});
    }
    let flag = if ready { "True" } else { "False" };
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let conditions = status
        .as_object_mut()
        .map(|o| o.entry("conditions").or_insert_with(|| Json::Array(Vec::new())));
    let Some(conditions) = conditions else { return };
    if !conditions.is_array() {
        *conditions = Json::Array(Vec::new());
    }
    let Json::Array(items) = conditions else { return };

    let previous = items.iter().position(|c| c["type"] == READY);
    let transitioned = previous.map(|i| items[i]["status"] != flag).unwrap_or(true);
    let last_transition = match previous {
        Some(i) if !transitioned => items[i]["lastTransitionTime"].clone(),
        _ => json!(now),
    };
    let mut cond = json!({
        "type": READY,
        "status": flag,
        "reason": reason,
        "message": message,
        "lastTransitionTime": last_transition,
    });
    if let Some(g) = generation {
        cond["observedGeneration"] = json!(g);
    }
    match previous {
        Some(i) => items[i] = cond,
        None => items.push(cond),
    }
}

pub fn ready_condition(r: &Resource) -> Option<&Json> {
    r.as_value()
        .get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c["type"] == READY)
}

/// Set the Ready condition of the live object behind `target`. Skipped when the object is gone
/// or its generation moved past `target`'s.
pub async fn set_ready(client: &dyn ResourceClient, target: &Resource, ready: bool, reason: &str, message: &str) -> Result<()> {
    update_status(client, target, |status, generation| upsert_ready(status, ready, reason, message, generation)).await
}

/// Replace the status of the live object with `status`, keeping its Ready condition when
/// `status` carries none.
pub async fn replace_status(client: &dyn ResourceClient, target: &Resource, status: Json) -> Result<()> {
    update_status(client, target, move |current, _| {
        let ready = current
            .get("conditions")
            .and_then(Json::as_array)
            .and_then(|c| c.iter().find(|c| c["type"] == READY))
            .cloned();
        let mut next = status.clone();
        let has_ready = next
            .get("conditions")
            .and_then(Json::as_array)
            .map(|c| c.iter().any(|c| c["type"] == READY))
            .unwrap_or(false);
        if let (Some(ready), false, Some(obj)) = (ready, has_ready, next.as_object_mut()) {
            let list = obj.entry("conditions").or_insert_with(|| Json::Array(Vec::new()));
            if let Json::Array(items) = list {
                items.push(ready);
            }
        }
        *current = next;
    })
    .await
}

async fn update_status<F>(client: &dyn ResourceClient, target: &Resource, mutate: F) -> Result<()>
where
    F: Fn(&mut Json, Option<i64>) + Send + Sync,
{
    let mut last = None;
    for attempt in 0..STATUS_RETRIES {
        let Some(mut current) = client.get(target).await.context("failed to get object for status update")? else {
            return Ok(());
        };
        if current.generation() != target.generation() {
            debug!(resource = %target, "generation moved; skipping status update");
            return Ok(());
        }
        let generation = current.generation();
        let value = current.as_value_mut();
        let mut status = value.get("status").cloned().unwrap_or(Json::Null);
        mutate(&mut status, generation);
        value["status"] = status;
        match client.update_status(&current).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(resource = %target, attempt, "status update conflict; retrying");
                last = Some(e);
            }
            Err(e) => return Err(e).with_context(|| format!("failed to update status of {}", target)),
        }
    }
    match last {
        Some(e) => Err(e).with_context(|| format!("failed to update status of {} after {} attempts", target, STATUS_RETRIES)),
        None => Ok(()),
    }
}
