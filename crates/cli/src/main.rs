use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use weft_apply::KubeApplier;
use weft_core::{build_identifier, payload::diff_summary, Operations};
use weft_kubehub::{get_kube_client, KubeFabric, LeaderConfig, LeaderElector, FABRIC_TARGET};
use weft_store::{
    observe_inventory, spawn_applier, spawn_controller, Batch, ControllerConfig, DesiredSource, Engine, FabricApplier,
    ObservedInventory, SyncReport,
};

mod desired;

use desired::FileDesired;

#[derive(Parser, Debug)]
#[command(name = "weftctl", version, about = "Weft fabric reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the fabric identifier for ordered name components
    Name {
        components: Vec<String>,
    },
    /// Full sync the desired file against the cluster and print the operations (nothing applied)
    Plan {
        #[arg(long = "desired")]
        desired: PathBuf,
    },
    /// Full sync once, optionally applying the result
    Sync {
        #[arg(long = "desired")]
        desired: PathBuf,
        #[arg(long = "apply")]
        apply: bool,
    },
    /// Run the controller loop until Ctrl-C
    Run {
        #[arg(long = "desired")]
        desired: PathBuf,
        /// Seconds between full syncs
        #[arg(long = "interval-secs", env = "WEFT_SYNC_INTERVAL_SECS")]
        interval_secs: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("WEFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("WEFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid WEFT_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect() -> Result<KubeFabric> {
    let client = get_kube_client().await?;
    KubeFabric::connect(client, &FABRIC_TARGET).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Name { components } => {
            let id = build_identifier(&components);
            match cli.output {
                Output::Human => println!("{}", id),
                Output::Json => println!("{}", serde_json::to_string(&serde_json::json!({ "components": components, "identifier": id }))?),
            }
        }
        Commands::Plan { desired } => {
            let (report, _, observed) = plan(&desired).await?;
            print_report(cli.output, &report, &observed)?;
        }
        Commands::Sync { desired, apply } => {
            let (report, fabric, observed) = plan(&desired).await?;
            print_report(cli.output, &report, &observed)?;
            if apply && !report.ops.is_empty() {
                let applied = KubeApplier::new(&fabric).apply(&report.ops).await;
                match cli.output {
                    Output::Human => println!("applied {} of {} operations", applied.applied, report.ops.len()),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&applied)?),
                }
                if !applied.is_clean() {
                    for f in applied.failures.iter() { error!(error = %f, "apply failed"); }
                    return Err(anyhow!("{} operations failed to apply", applied.failures.len()));
                }
            }
        }
        Commands::Run { desired, interval_secs } => run(&desired, interval_secs).await?,
    }

    Ok(())
}

async fn plan(path: &PathBuf) -> Result<(SyncReport, KubeFabric, ObservedInventory)> {
    let desired = FileDesired::load(path)?;
    info!(objects = desired.object_count(), path = %path.display(), "desired state loaded");
    let fabric = connect().await?;
    let observed = observe_inventory(&fabric).await;
    info!(objects = observed.object_count(), "fabric observed");
    let engine = Engine::new();
    let report = engine.full_sync_with(&observed, &desired);
    Ok((report, fabric, observed))
}

fn print_report(output: Output, report: &SyncReport, observed: &ObservedInventory) -> Result<()> {
    match output {
        Output::Human => {
            print_ops(&report.ops, observed);
            println!(
                "{} to add, {} to update, {} to delete ({} keys, {} unowned, {} failed)",
                report.ops.adds.len(),
                report.ops.updates.len(),
                report.ops.deletes.len(),
                report.keys_synced,
                report.unowned,
                report.failures.len()
            );
            for f in report.failures.iter() {
                eprintln!("skipped {}: {}", f.key, f.error);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_ops(ops: &Operations, observed: &ObservedInventory) {
    for o in ops.adds.iter() {
        println!("+ {:<48} {}", o.identifier, o.kind);
    }
    for o in ops.updates.iter() {
        let changes = observed
            .find(&o.identifier)
            .map(|prev| diff_summary(&o.payload, &prev.payload).to_string())
            .unwrap_or_default();
        println!("~ {:<48} {} {}", o.identifier, o.kind, changes);
    }
    for id in ops.deletes.iter() {
        println!("- {}", id);
    }
}

async fn run(path: &PathBuf, interval_secs: Option<u64>) -> Result<()> {
    let desired = Arc::new(FileDesired::load(path)?);
    let client = get_kube_client().await?;
    let fabric = Arc::new(KubeFabric::connect(client.clone(), &FABRIC_TARGET).await?);
    let mut cfg = ControllerConfig::from_env();
    if let Some(secs) = interval_secs.filter(|s| *s > 0) {
        cfg.sync_interval = Duration::from_secs(secs);
    }

    let leader_cfg = LeaderConfig::from_env(&FABRIC_TARGET.namespace);
    let elector = if leader_cfg.enabled {
        let elector = LeaderElector::new(client, leader_cfg);
        tokio::select! {
            _ = elector.acquire() => {}
            r = signal::ctrl_c() => {
                r?;
                info!("Ctrl-C received before leadership was acquired");
                return Ok(());
            }
        }
        Some(elector)
    } else {
        None
    };
    info!(interval = ?cfg.sync_interval, objects = desired.object_count(), "starting controller");

    let engine = Arc::new(Engine::new());
    let (ops_tx, ops_rx) = mpsc::channel::<Batch>(cfg.queue_cap);
    let source: Arc<dyn DesiredSource> = desired;
    let (cmd_tx, handle) = spawn_controller(engine, fabric.clone(), Some(source), ops_tx, cfg.clone());
    let applier = spawn_applier(Arc::new(KubeApplier::new(&fabric)), ops_rx, &cmd_tx, cfg.retry_backoff);
    let watcher_handle = tokio::spawn({
        let fabric = fabric.clone();
        let tx = cmd_tx.clone();
        async move { fabric.watch_resyncs(tx).await }
    });

    let lost = async {
        match &elector {
            Some(e) => e.hold().await,
            None => std::future::pending::<()>().await,
        }
    };
    let outcome = tokio::select! {
        r = signal::ctrl_c() => {
            r?;
            info!("Ctrl-C received; shutting down controller");
            Ok(())
        }
        _ = lost => {
            error!("leadership lost; stopping controller");
            Err(anyhow!("leader lease lost"))
        }
    };

    // Graceful shutdown: stop the watcher, close the command channel, let the applier drain
    watcher_handle.abort();
    let _ = watcher_handle.await;
    drop(cmd_tx);
    if tokio::time::timeout(Duration::from_secs(10), applier).await.is_err() {
        warn!("applier did not drain in time");
    }
    if let (Some(e), Ok(())) = (&elector, &outcome) {
        if let Err(err) = e.release().await {
            warn!(error = %err, identity = e.identity(), "releasing leader lease failed");
        }
    }
    let stats = handle.stats();
    info!(epoch = stats.epoch, keys = stats.keys, objects = stats.objects, "controller stopped");
    outcome
}
