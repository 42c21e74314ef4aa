//! Fleetview demo driver: feeds a synthetic emulator fleet through the
//! batched table-update engine and prints what a renderer would receive.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use rustc_hash::FxHashSet;
use tracing::info;

use fleetview_core::{
    EngineConfig, EntityKey, FleetResult, FleetStats, RenderDispatcher, Row, RowSnapshot,
};
use fleetview_search::spawn_debouncer;
use fleetview_store::spawn_engine;

#[derive(Parser, Debug)]
#[command(name = "fleetview", version, about = "Fleetview batched table-update engine demo")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a jittery synthetic fleet through the engine and print flushes
    Demo {
        /// Number of emulator instances in the fleet
        #[arg(long, default_value_t = 8)]
        instances: usize,
        /// Number of polling rounds before summarizing
        #[arg(long, default_value_t = 30)]
        ticks: u32,
        /// Producer polling cadence
        #[arg(long = "poll-ms", default_value_t = 100)]
        poll_ms: u64,
        /// Run a debounced search with this query halfway through
        #[arg(long)]
        query: Option<String>,
    },
    /// Print the effective engine configuration
    Config,
}

fn init_tracing() {
    let env = std::env::var("FLEETVIEW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLEETVIEW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FLEETVIEW_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints render payloads the way a table widget would consume them.
struct StdoutSink {
    output: Output,
}

impl StdoutSink {
    fn render_row(row: &Row) -> String {
        let cells: Vec<String> = row
            .fields
            .iter()
            .map(|(name, value)| match value {
                fleetview_core::FieldValue::Text(s) => format!("{name}={s}"),
                fleetview_core::FieldValue::Number(n) => format!("{name}={n:.1}"),
                fleetview_core::FieldValue::Bool(b) => format!("{name}={b}"),
            })
            .collect();
        format!("{} [{}]", row.key, cells.join(" "))
    }
}

impl RenderDispatcher for StdoutSink {
    fn on_flush(&self, rows: Arc<RowSnapshot>, changed: &FxHashSet<EntityKey>) -> FleetResult<()> {
        let mut changed: Vec<&String> = changed.iter().collect();
        changed.sort();
        match self.output {
            Output::Human => {
                println!("flush epoch={} rows={} changed={:?}", rows.epoch, rows.rows.len(), changed);
                for row in rows.rows.iter().filter(|r| changed.iter().any(|c| **c == r.key)) {
                    println!("  {}", Self::render_row(row));
                }
            }
            Output::Json => {
                let payload = serde_json::json!({
                    "event": "flush",
                    "epoch": rows.epoch,
                    "changed": changed,
                    "rows": rows.rows,
                });
                println!("{payload}");
            }
        }
        Ok(())
    }

    fn on_filtered(&self, rows: Vec<Row>) -> FleetResult<()> {
        match self.output {
            Output::Human => {
                println!("filter result: {} row(s)", rows.len());
                for row in rows.iter() {
                    println!("  {}", Self::render_row(row));
                }
            }
            Output::Json => {
                let payload = serde_json::json!({ "event": "filtered", "rows": rows });
                println!("{payload}");
            }
        }
        Ok(())
    }
}

fn xorshift(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

struct InstanceSim {
    name: String,
    status: &'static str,
    cpu: f64,
    memory_mb: f64,
    uptime_secs: u64,
}

/// One polling round: volatile pid churn every tick, sub-epsilon cpu jitter
/// most ticks, occasional real changes. The flush log shows how little of it
/// survives change detection.
fn tick_snapshot(sims: &mut [InstanceSim], rng: &mut u64) -> Vec<serde_json::Value> {
    sims.iter_mut()
        .enumerate()
        .map(|(i, sim)| {
            if xorshift(rng) % 16 == 0 {
                sim.status = match sim.status {
                    "running" => "stopped",
                    "stopped" => "starting",
                    _ => "running",
                };
            }
            if xorshift(rng) % 8 == 0 {
                sim.cpu = (xorshift(rng) % 10_000) as f64 / 100.0;
            } else {
                // Measurement jitter, below the default epsilon.
                sim.cpu += ((xorshift(rng) % 9) as f64 - 4.0) / 10_000.0;
            }
            if sim.status == "running" {
                sim.uptime_secs += 1;
            }
            serde_json::json!({
                "key": format!("emu-{i}"),
                "name": sim.name,
                "status": sim.status,
                "adb_port": 16384 + 32 * i as u64,
                "cpu": sim.cpu,
                "memory_mb": sim.memory_mb,
                "uptime_secs": sim.uptime_secs,
                "pid": 1000 + xorshift(rng) % 60_000,
            })
        })
        .collect()
}

async fn run_demo(
    output: Output,
    instances: usize,
    ticks: u32,
    poll_ms: u64,
    query: Option<String>,
) -> Result<()> {
    let cfg = EngineConfig::from_env();
    let sink: Arc<dyn RenderDispatcher> = Arc::new(StdoutSink { output });
    let (snapshots, handle) = spawn_engine(cfg.clone(), Arc::clone(&sink));
    let queries = {
        let h = handle.clone();
        spawn_debouncer(&cfg, move || h.current(), Arc::clone(&sink))
    };

    let mut rng = 0x00c0_ffeeu64 | 1;
    let mut sims: Vec<InstanceSim> = (0..instances)
        .map(|i| InstanceSim {
            name: format!("MuMu-{i}"),
            status: if i % 3 == 0 { "stopped" } else { "running" },
            cpu: (10 + 7 * i) as f64 % 90.0,
            memory_mb: 512.0 + 128.0 * (i % 4) as f64,
            uptime_secs: 0,
        })
        .collect();

    info!(instances, ticks, poll_ms, "demo fleet started");
    let mut interval = tokio::time::interval(Duration::from_millis(poll_ms));
    for tick in 0..ticks {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                break;
            }
        }
        snapshots.submit(tick_snapshot(&mut sims, &mut rng));
        metrics::counter!("demo_ticks_total", 1u64);
        if let (Some(q), true) = (&query, tick == ticks / 2) {
            info!(query = %q, "submitting debounced search");
            queries.query(q.clone());
        }
    }

    // Let the last batch window and debounce close before summarizing.
    tokio::time::sleep(cfg.batch_interval + cfg.debounce).await;
    let snap = handle.current();
    let stats = FleetStats::of(&snap);
    match output {
        Output::Human => println!(
            "fleet: {} total, {} running, {} stopped (epoch {})",
            stats.total, stats.running, stats.stopped, snap.epoch
        ),
        Output::Json => {
            println!("{}", serde_json::json!({ "event": "summary", "epoch": snap.epoch, "stats": stats }))
        }
    }
    snapshots.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { instances, ticks, poll_ms, query } => {
            run_demo(cli.output, instances, ticks, poll_ms, query).await?;
        }
        Commands::Config => {
            let cfg = EngineConfig::from_env();
            match cli.output {
                Output::Human => println!("{cfg:#?}"),
                Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
            }
        }
    }
    Ok(())
}
