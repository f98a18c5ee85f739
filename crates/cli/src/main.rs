use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use hangar_atc::{process_evaluators, Atc};
use hangar_core::{is_warning, ReleaseRef};
use hangar_ctrl::SchedulerConfig;
use hangar_flight::{EvalConfig, Flight, Module, ModuleCache, ProcessEvaluator};
use hangar_kubehub::{KubeClient, ResourceClient};
use hangar_persist::RevisionStore;
use hangar_release::{
    DescentParams, MaydayParams, Pilot, PruneOpts, PruneReport, TakeoffOutcome, TakeoffParams, TurbulenceParams,
};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hangarctl", version, about = "Deploy and manage flight releases")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Release namespace
    #[arg(short = 'n', long = "namespace", global = true, env = "HANGAR_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Args, Debug, Clone, Copy)]
struct PruneArgs {
    /// Delete CRDs that leave the release instead of orphaning them
    #[arg(long = "remove-crds", action = ArgAction::SetTrue)]
    remove_crds: bool,
    /// Delete Namespaces that leave the release instead of orphaning them
    #[arg(long = "remove-namespaces", action = ArgAction::SetTrue)]
    remove_namespaces: bool,
}

impl From<PruneArgs> for PruneOpts {
    fn from(a: PruneArgs) -> Self { PruneOpts { remove_crds: a.remove_crds, remove_namespaces: a.remove_namespaces } }
}

#[derive(Args, Debug, Clone)]
struct LockArgs {
    /// Hold the release lock while mutating
    #[arg(long = "lock", action = ArgAction::SetTrue)]
    lock: bool,
    #[arg(long = "lock-holder", default_value = "hangarctl")]
    holder: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a flight and roll the release forward to its output
    Takeoff {
        release: String,
        /// Module path or file:// URL
        module: String,
        /// Flight input file, `-` for stdin
        #[arg(short = 'i', long = "input")]
        input: Option<String>,
        /// Extra argument passed to the module (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,
        /// KEY=VALUE environment entry for the module (repeatable)
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Print the change against the active revision and exit
        #[arg(long = "diff", action = ArgAction::SetTrue)]
        diff: bool,
        #[arg(long = "force-conflicts", action = ArgAction::SetTrue)]
        force_conflicts: bool,
        /// Take over resources owned by another release
        #[arg(long = "force-ownership", action = ArgAction::SetTrue)]
        force_ownership: bool,
        /// Allow resources outside the release namespace
        #[arg(long = "cross-namespace", action = ArgAction::SetTrue)]
        cross_namespace: bool,
        /// Keep at most this many revisions (0 keeps all)
        #[arg(long = "history-cap", default_value_t = 10)]
        history_cap: usize,
        /// Seconds to wait for readiness (0 skips)
        #[arg(long = "wait", default_value_t = 0)]
        wait: u64,
        /// Flight evaluation deadline in seconds
        #[arg(long = "timeout", default_value_t = 10)]
        timeout: u64,
        #[command(flatten)]
        lock: LockArgs,
        #[command(flatten)]
        prune: PruneArgs,
    },
    /// Roll the release back (or forward) to an earlier revision
    Descent {
        release: String,
        revision: u64,
        #[arg(long = "wait", default_value_t = 0)]
        wait: u64,
        #[command(flatten)]
        lock: LockArgs,
        #[command(flatten)]
        prune: PruneArgs,
    },
    /// Delete every resource of the release and its history
    Mayday {
        release: String,
        #[command(flatten)]
        prune: PruneArgs,
    },
    /// Compare the active revision with the cluster
    Turbulence {
        release: String,
        /// Only compare fields the release declares
        #[arg(long = "conflicts-only", action = ArgAction::SetTrue)]
        conflicts_only: bool,
        /// Re-apply drifted resources
        #[arg(long = "fix", action = ArgAction::SetTrue)]
        fix: bool,
    },
    /// Show the revision history of a release
    History { release: String },
    /// List releases in the namespace, or everywhere with --all
    Releases {
        #[arg(short = 'A', long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Force-release a stuck release lock
    Unlock { release: String },
    /// Run the airway controller until interrupted
    Atc,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))
}

fn init_tracing() {
    let env = std::env::var("HANGAR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HANGAR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HANGAR_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_warning(&e) => {
            warn!("{:#}", e);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client: Arc<dyn ResourceClient> = Arc::new(KubeClient::try_default().await.context("failed to connect to cluster")?);
    let ns = cli.namespace.clone();
    let out = cli.output;
    match cli.command {
        Commands::Takeoff {
            release,
            module,
            input,
            args,
            env,
            dry_run,
            diff,
            force_conflicts,
            force_ownership,
            cross_namespace,
            history_cap,
            wait,
            timeout,
            lock,
            prune,
        } => {
            let module = Arc::new(Module::load(&module).await?);
            let mut flight = Flight::new(module, ReleaseRef::new(&release, &ns)).with_args(args);
            if let Some(path) = input {
                flight = flight.with_input(read_input(&path).await?);
            }
            for (k, v) in env {
                flight = flight.with_env(k, v);
            }
            let evaluator = ProcessEvaluator::new(EvalConfig { timeout: Some(Duration::from_secs(timeout)), ..EvalConfig::default() });
            let pilot = Pilot::new(client, Arc::new(evaluator));

            let mut params = TakeoffParams::new(release, ns, flight);
            params.dry_run = dry_run;
            params.diff_only = diff;
            params.force_conflicts = force_conflicts;
            params.force_ownership = force_ownership;
            params.cross_namespace = cross_namespace;
            params.history_cap = history_cap;
            params.wait = Duration::from_secs(wait);
            params.lock = lock.lock;
            params.lock_holder = lock.holder;
            params.prune = prune.into();
            print_takeoff(out, pilot.takeoff(params).await?);
        }
        Commands::Descent { release, revision, wait, lock, prune } => {
            let pilot = Pilot::new(client, Arc::new(ProcessEvaluator::default()));
            let mut params = DescentParams::new(release, ns, revision);
            params.wait = Duration::from_secs(wait);
            params.lock = lock.lock;
            params.lock_holder = lock.holder;
            params.prune = prune.into();
            let o = pilot.descent(params).await?;
            match out {
                Output::Human => {
                    println!("descended from revision {} to {}", o.from, o.to);
                    print_pruned(&o.pruned);
                }
                Output::Json => println!("{}", json!({"from": o.from, "to": o.to, "pruned": pruned_json(&o.pruned)})),
            }
        }
        Commands::Mayday { release, prune } => {
            let pilot = Pilot::new(client, Arc::new(ProcessEvaluator::default()));
            let o = pilot.mayday(MaydayParams { release, namespace: ns, prune: prune.into() }).await?;
            match out {
                Output::Human => {
                    print_pruned(&o.pruned);
                    println!("deleted {} revision(s)", o.revisions_deleted);
                }
                Output::Json => {
                    println!("{}", json!({"pruned": pruned_json(&o.pruned), "revisionsDeleted": o.revisions_deleted}))
                }
            }
        }
        Commands::Turbulence { release, conflicts_only, fix } => {
            let pilot = Pilot::new(client, Arc::new(ProcessEvaluator::default()));
            let report = pilot.turbulence(TurbulenceParams { release, namespace: ns, conflicts_only, fix }).await?;
            match out {
                Output::Human => {
                    if report.is_clean() {
                        println!("no drift");
                    }
                    for d in &report.drifted {
                        println!("{}", d.id);
                        for c in &d.changes {
                            println!("  {}", c);
                        }
                    }
                    for id in &report.fixed {
                        println!("fixed {}", id);
                    }
                }
                Output::Json => {
                    let drifted: Vec<_> = report.drifted.iter().map(|d| json!({"id": d.id, "changes": d.changes})).collect();
                    println!("{}", json!({"drifted": drifted, "fixed": report.fixed}));
                }
            }
        }
        Commands::History { release } => {
            let history = RevisionStore::new(client).history(&ReleaseRef::new(release, ns)).await?;
            let active = history.active().map(|r| r.id);
            match out {
                Output::Human => {
                    for r in &history.revisions {
                        let mark = if Some(r.id) == active { "*" } else { " " };
                        println!(
                            "{} {:>4}  {}  {:>3} resources  {}",
                            mark,
                            r.id,
                            r.created_at.format("%Y-%m-%d %H:%M:%S"),
                            r.resources,
                            r.source.reference
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&history)?),
            }
        }
        Commands::Releases { all } => {
            let store = RevisionStore::new(client);
            let releases = store.list_releases(if all { None } else { Some(ns.as_str()) }).await?;
            match out {
                Output::Human => releases.iter().for_each(|r| println!("{}", r)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&releases)?),
            }
        }
        Commands::Unlock { release } => {
            let release = ReleaseRef::new(release, ns);
            RevisionStore::new(client).unlock(&release).await?;
            info!(release = %release, "lock released");
        }
        Commands::Atc => {
            let atc = Atc::new(client, process_evaluators(), Arc::new(ModuleCache::from_env()), SchedulerConfig::from_env());
            let ctx = CancellationToken::new();
            tokio::spawn({
                let ctx = ctx.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received; shutting down");
                    }
                    ctx.cancel();
                }
            });
            atc.run(ctx).await?;
        }
    }
    Ok(())
}

async fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await.context("failed to read flight input from stdin")?;
        return Ok(buf);
    }
    tokio::fs::read(path).await.with_context(|| format!("failed to read flight input {}", path))
}

fn print_takeoff(out: Output, outcome: TakeoffOutcome) {
    match (out, outcome) {
        (Output::Human, TakeoffOutcome::Landed { revision, stages, pruned }) => {
            println!("revision {} landed with {} resource(s)", revision.id, stages.resource_count());
            print_pruned(&pruned);
        }
        (Output::Json, TakeoffOutcome::Landed { revision, pruned, .. }) => {
            println!("{}", json!({"revision": revision, "pruned": pruned_json(&pruned)}))
        }
        (Output::Human, TakeoffOutcome::DryRun { stages }) => {
            for r in stages.flatten() {
                println!("{} (dry run)", r.describe());
            }
        }
        (Output::Json, TakeoffOutcome::DryRun { stages }) => println!("{}", json!({"dryRun": stages})),
        (Output::Human, TakeoffOutcome::Diff { changes }) => {
            if changes.is_empty() {
                println!("no changes");
            }
            for d in changes {
                println!("{}", d.id);
                for c in &d.changes {
                    println!("  {}", c);
                }
            }
        }
        (Output::Json, TakeoffOutcome::Diff { changes }) => {
            let changes: Vec<_> = changes.iter().map(|d| json!({"id": d.id, "changes": d.changes})).collect();
            println!("{}", json!({"diff": changes}));
        }
    }
}

fn print_pruned(p: &PruneReport) {
    for id in &p.removed {
        println!("removed {}", id);
    }
    for id in &p.orphaned {
        println!("orphaned {}", id);
    }
    for id in &p.skipped {
        println!("skipped {} (not owned by this release)", id);
    }
}

fn pruned_json(p: &PruneReport) -> serde_json::Value {
    json!({"removed": p.removed, "orphaned": p.orphaned, "skipped": p.skipped})
}
