//! Drift between the active revision and the live cluster.

use anyhow::{bail, Context, Result};
use hangar_core::json::{diff, remove_additions, semantic_eq, strip_noisy, Change};
use hangar_core::{MultiError, Resource, ResourceId};
use hangar_kubehub::ApplyOpts;
use serde_json::Value as Json;
use tracing::{info, info_span, Instrument};

use crate::pilot::release_ref;
use crate::{Pilot, TurbulenceParams};

/// One resource whose live state differs from what the release declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub id: ResourceId,
    /// Changes turning the live state into the declared one.
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftReport {
    pub drifted: Vec<Drift>,
    /// Filled in fix mode.
    pub fixed: Vec<ResourceId>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool { self.drifted.is_empty() }
}

impl Pilot {
    /// Compare the active revision with live state and, with `fix`, force it back.
    /// Never records a revision.
    pub async fn turbulence(&self, params: TurbulenceParams) -> Result<DriftReport> {
        let release = release_ref(&params.release, &params.namespace);
        let span = info_span!("turbulence", release = %release, fix = params.fix);
        async {
            let history = self.history(&release).await?;
            if history.is_empty() {
                bail!("no release found for {}", release);
            }
            let stages = self.active_stages(&history).await?;

            let mut report = DriftReport::default();
            let mut targets: Vec<&Resource> = Vec::new();
            for r in stages.flatten() {
                let live = self.client.get(r).await.with_context(|| format!("failed to get {}", r.describe()))?;
                let changes = drift(r, live.as_ref(), params.conflicts_only);
                if changes.is_empty() {
                    continue;
                }
                report.drifted.push(Drift { id: r.id(), changes });
                targets.push(r);
            }

            if params.fix && !targets.is_empty() {
                let opts = ApplyOpts { force_conflicts: true, ..ApplyOpts::default() };
                let mut errs = MultiError::new("failed to apply desired state to drift");
                for r in targets {
                    match self.client.apply(r, opts).await {
                        Ok(_) => report.fixed.push(r.id()),
                        Err(e) => errs.push(r.id(), e),
                    }
                }
                errs.into_result()?;
            }
            info!(drifted = report.drifted.len(), fixed = report.fixed.len(), "turbulence check done");
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

/// Changes from the live object to the declared one; a missing object diffs from null.
fn drift(declared: &Resource, live: Option<&Resource>, conflicts_only: bool) -> Vec<Change> {
    let expected = strip_noisy(declared.as_value().clone());
    let actual = match live {
        Some(live) => {
            let actual = strip_noisy(live.as_value().clone());
            if conflicts_only {
                remove_additions(&expected, &actual)
            } else {
                actual
            }
        }
        None => Json::Null,
    };
    if semantic_eq(&expected, &actual) {
        return Vec::new();
    }
    diff(&actual, &expected)
}
