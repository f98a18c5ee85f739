//! Batch apply and readiness gating shared by takeoff, descent and turbulence.

use std::time::{Duration, Instant};

use futures::StreamExt;
use hangar_core::{MultiError, Resource, Tiers};
use hangar_kubehub::{wait_all, ApplyOpts, ResourceClient, WaitOptions};
use metrics::{counter, histogram};
use tracing::debug;

/// Namespaces and CRDs get this long to become ready before core resources go in.
pub(crate) const TIER_WAIT: Duration = Duration::from_secs(30);
/// Non-final stages are gated with these when the caller did not ask for a wait.
pub(crate) const STAGE_WAIT: Duration = Duration::from_secs(30);
pub(crate) const STAGE_POLL: Duration = Duration::from_secs(2);

pub(crate) fn parallelism() -> usize { std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) }

/// Apply `resources` concurrently, bounded by CPU count. Every failure is collected;
/// successes stay applied.
pub(crate) async fn apply_many(
    client: &dyn ResourceClient,
    resources: &[&Resource],
    opts: ApplyOpts,
    heading: &str,
) -> Result<(), MultiError> {
    let applies: Vec<_> = resources.iter().map(|r| async move {
        let started = Instant::now();
        let res = client.apply(r, opts).await;
        histogram!("apply_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        match (&res, opts.dry_run) {
            (Ok(_), true) => counter!("apply_dry_ok", 1u64),
            (Ok(_), false) => counter!("apply_ok", 1u64),
            (Err(_), _) => counter!("apply_err", 1u64),
        }
        debug!(resource = %r, dry_run = opts.dry_run, ok = res.is_ok(), "apply");
        (r.id(), res)
    }).collect();
    let results: Vec<_> = futures::stream::iter(applies)
    .buffer_unordered(parallelism())
    .collect()
    .await;

    let mut errs = MultiError::new(heading);
    for (id, res) in results {
        if let Err(e) = res {
            errs.push(id, e);
        }
    }
    errs.into_result()
}

/// Apply one stage tier by tier. Each tier is dry-run first unless `skip_dry_run`; with
/// `opts.dry_run` only the dry-run happens. Namespace and CRD tiers are waited on before the next.
pub(crate) async fn apply_stage(
    client: &dyn ResourceClient,
    stage: &[Resource],
    opts: ApplyOpts,
    skip_dry_run: bool,
    poll: Duration,
) -> anyhow::Result<()> {
    let tiers = Tiers::split(stage);
    for (tier, gate) in [(&tiers.namespaces, true), (&tiers.crds, true), (&tiers.core, false)] {
        if tier.is_empty() {
            continue;
        }
        if opts.dry_run {
            // Kinds whose CRD is part of this release do not exist yet on a dry run.
            let mut known = Vec::with_capacity(tier.len());
            for r in tier.iter().copied() {
                match client.resolve(r.api_version(), r.kind()).await {
                    Err(e) if e.is_unknown_kind() => debug!(resource = %r, "skipping dry run of undefined kind"),
                    _ => known.push(r),
                }
            }
            apply_many(client, &known, opts, "dry run").await?;
            continue;
        }
        if !skip_dry_run {
            apply_many(client, tier, ApplyOpts { dry_run: true, ..opts }, "dry run").await?;
        }
        apply_many(client, tier, opts, "failed to apply").await?;
        if gate {
            wait_all(client, tier, WaitOptions { timeout: TIER_WAIT, interval: poll })
                .await
                .map_err(|e| e.context("dependency resources did not become ready"))?;
        }
    }
    Ok(())
}
