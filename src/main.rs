use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shardring::cluster::{DEFAULT_REPLICAS, DOWN_THRESHOLD, hashtag};
use shardring::{
    Command, HashRing, InMemoryTransport, PoolStats, Ring, RingOptions, ShardStatus,
};
use std::collections::BTreeMap;
use std::process;
use std::sync::Arc;
use tracing::debug;

#[derive(Parser)]
#[command(name = "shardring")]
#[command(about = "Inspect and simulate a sharded key/value ring")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Print the shard owning each key, assuming every shard is up
    Route {
        #[arg(long)]
        url: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Run a ring over in-memory shards, with some of them unreachable
    Simulate {
        #[arg(long)]
        url: String,
        #[arg(long, default_value_t = 1000)]
        keys: usize,
        /// Shard to mark unreachable (repeatable)
        #[arg(long)]
        down: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct ShardReport {
    #[serde(flatten)]
    status: ShardStatus,
    keys: usize,
}

#[derive(Serialize)]
struct SimulationReport {
    shards: Vec<ShardReport>,
    commands: usize,
    failed: usize,
    first_error: Option<String>,
    pool: PoolStats,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("shardring: error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        CliCommand::Route { url, keys } => route(&url, &keys),
        CliCommand::Simulate {
            url,
            keys,
            down,
            json,
        } => simulate(&url, keys, &down, json).await,
    }
}

fn parse_options(url: &str) -> Result<RingOptions> {
    let opt = RingOptions::from_url(url).with_context(|| format!("Invalid ring URL: {}", url))?;
    opt.validate()?;
    Ok(opt)
}

fn route(url: &str, keys: &[String]) -> Result<()> {
    let opt = parse_options(url)?;
    let ring = HashRing::build(DEFAULT_REPLICAS, opt.addrs.keys());

    for key in keys {
        let shard = ring
            .get(hashtag::key(key))
            .context("ring has no shards")?;
        println!("{} -> {} ({})", key, shard, opt.addrs[shard]);
    }
    Ok(())
}

async fn simulate(url: &str, key_count: usize, down: &[String], json: bool) -> Result<()> {
    let opt = parse_options(url)?;
    for name in down {
        if !opt.addrs.contains_key(name) {
            bail!("Unknown shard '{}'", name);
        }
    }

    let transport = InMemoryTransport::new();
    let mut backends = BTreeMap::new();
    for (name, addr) in &opt.addrs {
        let backend = transport.add_backend(addr);
        backend.set_reachable(!down.contains(name));
        backends.insert(name.clone(), backend);
    }

    let ring = Ring::new(opt, Arc::new(transport))?;
    for sweep in 0..DOWN_THRESHOLD {
        let changed = ring.check_health().await;
        debug!(sweep, changed, "health sweep");
    }

    let result = ring
        .pipelined(|pipe| {
            for i in 0..key_count {
                pipe.push(Command::set(format!("key:{i}"), i.to_string()));
            }
        })
        .await;

    let report = SimulationReport {
        shards: ring
            .shards()
            .into_iter()
            .map(|status| ShardReport {
                keys: backends.get(&status.name).map_or(0, |b| b.len()),
                status,
            })
            .collect(),
        commands: result.cmds.len(),
        failed: result.cmds.iter().filter(|cmd| cmd.err().is_some()).count(),
        first_error: result.error.as_ref().map(ToString::to_string),
        pool: ring.pool_stats().await,
    };
    ring.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("{:<12} {:<24} {:<6} {:>8}", "shard", "addr", "state", "keys");
    for shard in &report.shards {
        let state = if shard.status.up { "up" } else { "down" };
        println!(
            "{:<12} {:<24} {:<6} {:>8}",
            shard.status.name, shard.status.addr, state, shard.keys
        );
    }
    println!();
    println!("{} commands, {} failed", report.commands, report.failed);
    if let Some(err) = &report.first_error {
        println!("first error: {}", err);
    }
    println!("{}", report.pool);
}
