use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use skipper_apply::UpgradeStrategy;
use skipper_core::{AnyEvent, EventRecord, EventStatus, WorkloadSpec};
use skipper_persist::{HistoryStore, Operation, SqliteHistory};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "skipperctl", version, about = "Deploy workloads and follow them until ready")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (overrides the one in the workload file)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { Deployment, Job }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or upgrade a workload and stream its progress
    Deploy {
        /// Workload file (YAML or JSON)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Seconds before the rollout is reported as timed out
        #[arg(long = "timeout", default_value_t = 300)]
        timeout: u64,
        /// Delete and recreate an existing workload instead of patching it
        #[arg(long = "recreate", action = ArgAction::SetTrue)]
        recreate: bool,
    },
    /// Delete a workload; succeeds when it is already gone
    Delete {
        name: String,
        #[arg(long = "kind", value_enum, default_value_t = Kind::Deployment)]
        kind: Kind,
    },
    /// List recorded operations, or replay the events of one
    History {
        /// Operation id
        op: Option<String>,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIPPER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIPPER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SKIPPER_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_history() -> Option<SqliteHistory> {
    let disabled = std::env::var("SKIPPER_DISABLE_HISTORY")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if disabled {
        return None;
    }
    match SqliteHistory::open_default() {
        Ok(h) => Some(h),
        Err(e) => {
            warn!(error = %e, "history store unavailable; not recording");
            None
        }
    }
}

fn status_line(status: EventStatus, message: &str) -> String {
    format!("[{}] {}", status, message)
}

fn print_record(output: Output, record: &EventRecord) -> Result<()> {
    match output {
        Output::Human => println!("{}", status_line(record.status, &record.message)),
        Output::Json => println!("{}", serde_json::to_string(record)?),
    }
    Ok(())
}

/// 0 on COMPLETED, 2 on TIMEOUT, 1 otherwise.
fn exit_code(last: Option<EventStatus>) -> i32 {
    match last {
        Some(EventStatus::Completed) => 0,
        Some(EventStatus::Timeout) => 2,
        _ => 1,
    }
}

fn load_spec(file: &Path, ns: Option<&str>) -> Result<WorkloadSpec> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let mut spec: WorkloadSpec = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    if let Some(ns) = ns {
        spec.namespace = ns.to_string();
    }
    spec.validate()?;
    Ok(spec)
}

async fn deploy(output: Output, ns: Option<&str>, file: &Path, timeout: Duration, recreate: bool) -> Result<i32> {
    let spec = load_spec(file, ns)?;
    let controller = skipper_apply::default_controller().await?;
    let history = open_history();
    let op = Operation::new("deploy", &spec.namespace, &spec.name);
    if let Some(h) = &history {
        if let Err(e) = h.begin(&op) {
            warn!(error = %e, "failed to record operation");
        }
    }
    info!(op = %op.id, ns = %spec.namespace, name = %spec.name, recreate, "deploy invoked");

    let strategy = if recreate { UpgradeStrategy::Recreate } else { UpgradeStrategy::Rolling };
    let mut rollout = controller.create_or_upgrade(&spec, timeout, strategy).await;
    let mut seq = 0u32;
    let mut last = None;
    loop {
        let next = tokio::select! {
            ev = rollout.next() => ev,
            _ = signal::ctrl_c() => {
                warn!(op = %op.id, "interrupted; stopping watches");
                return Ok(130);
            }
        };
        let Some(ev) = next else { break };
        let record = ev.serialize()?;
        if let Some(h) = &history {
            if let Err(e) = h.put(&op.id, seq, &record) {
                warn!(error = %e, "failed to record event");
            }
        }
        seq += 1;
        print_record(output, &record)?;
        last = Some(record.status);
    }
    Ok(exit_code(last))
}

async fn delete(ns: &str, name: &str, kind: Kind) -> Result<i32> {
    let controller = skipper_apply::default_controller().await?;
    let deleted = match kind {
        Kind::Deployment => controller.delete::<Deployment>(ns, name).await?,
        Kind::Job => controller.delete::<Job>(ns, name).await?,
    };
    let kind = format!("{:?}", kind).to_lowercase();
    if deleted {
        println!("deleted {} {}/{}", kind, ns, name);
    } else {
        println!("{} {}/{} not found", kind, ns, name);
    }
    Ok(0)
}

fn history(output: Output, op: Option<&str>, limit: usize) -> Result<i32> {
    let store = SqliteHistory::open_default()?;
    match op {
        Some(op) => {
            let records = store.events(op)?;
            if records.is_empty() {
                eprintln!("no events recorded for {}", op);
                return Ok(1);
            }
            for record in records {
                match output {
                    Output::Json => print_record(output, &record)?,
                    Output::Human => {
                        let ev = AnyEvent::deserialize(record)?;
                        println!("{} {}", ev.timestamp().format("%H:%M:%S"), status_line(ev.status(), &ev.message()));
                    }
                }
            }
        }
        None => {
            let ops = store.operations(limit)?;
            match output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&ops)?),
                Output::Human => {
                    println!("{:<36}  {:<7}  {:<30}  {:<19}  {:>6}  LAST", "ID", "ACTION", "TARGET", "STARTED", "EVENTS");
                    for o in ops {
                        let target = format!("{}/{}", o.namespace, o.name);
                        let last = o.last_status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<36}  {:<7}  {:<30}  {:<19}  {:>6}  {}",
                            o.id,
                            o.action,
                            target,
                            o.started_at.format("%Y-%m-%d %H:%M:%S"),
                            o.events,
                            last
                        );
                    }
                }
            }
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    let code = match &cli.command {
        Commands::Deploy { file, timeout, recreate } => {
            deploy(cli.output, ns, file, Duration::from_secs(*timeout), *recreate).await?
        }
        Commands::Delete { name, kind } => delete(ns.unwrap_or("default"), name, *kind).await?,
        Commands::History { op, limit } => history(cli.output, op.as_deref(), *limit)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
