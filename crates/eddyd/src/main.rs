//! `eddyd`: runs eddy peers over an in-process network.
//!
//! # Usage
//!
//! ```text
//! eddyd simulate                          # 3 peers, 20 entries each
//! eddyd simulate -p 5 -n 100 -r 2         # 5 peers, replication factor 2
//! eddyd simulate -d ./data                # persist blocks and segments
//! eddyd -c eddy.toml config               # print the effective config
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eddy_log::{AppendOptions, BlockStore, Blocks, Ed25519Identity, Entry, Identity, Payload};
use eddy_replication::{ReplicationIndex, ReplicationSpec};
use eddy_sync::{MemoryNetwork, SharedLog, SharedLogOptions};
use eddy_types::config::EddyConfig;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "eddyd", version, about = "Replicated causal log peers")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "EDDY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start peers on an in-process network, write from each of them and
    /// wait until every entry reached its replicators.
    Simulate {
        /// Number of peers.
        #[arg(short, long, default_value = "3")]
        peers: usize,

        /// Entries appended by each peer.
        #[arg(short = 'n', long, default_value = "20")]
        entries: usize,

        /// Override `[replication] replicas`.
        #[arg(short, long)]
        replicas: Option<usize>,

        /// Keep blocks and segments under this directory instead of memory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Give up waiting for convergence after this many seconds.
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EddyConfig::load(cli.config.as_deref()).context("failed to load config")?;

    eddy_types::telemetry::init(&config.log);

    match cli.command {
        Commands::Simulate {
            peers,
            entries,
            replicas,
            data_dir,
            timeout,
        } => {
            let params = Simulation {
                peers,
                entries,
                replicas,
                data_dir,
                timeout: Duration::from_secs(timeout),
            };
            let report = simulate(&config, &params).await?;
            print_report(&params, &report);
            if !report.converged {
                anyhow::bail!("peers did not converge within {timeout}s");
            }
            Ok(())
        }
        Commands::Config => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

// -----------------------------------------------------------------------
// eddyd simulate
// -----------------------------------------------------------------------

struct Simulation {
    peers: usize,
    entries: usize,
    replicas: Option<usize>,
    data_dir: Option<PathBuf>,
    timeout: Duration,
}

struct PeerReport {
    peer: String,
    entries: usize,
    heads: usize,
    segments: usize,
}

struct Report {
    converged: bool,
    elapsed: Duration,
    messages: u64,
    peers: Vec<PeerReport>,
}

async fn simulate(config: &EddyConfig, params: &Simulation) -> Result<Report> {
    anyhow::ensure!(params.peers > 0, "at least one peer is required");

    let mut options = SharedLogOptions::from_config(config)?;
    if let Some(replicas) = params.replicas {
        options.replicas = replicas;
    }
    let share = (options.replicas as f64 / params.peers as f64).min(1.0);
    info!(
        peers = params.peers,
        entries = params.entries,
        replicas = options.replicas,
        share,
        "starting simulation"
    );

    let net = MemoryNetwork::new();
    let mut logs = Vec::with_capacity(params.peers);
    for i in 0..params.peers {
        let seed = u8::try_from(i + 1).context("at most 255 peers are supported")?;
        let identity: Arc<dyn Identity> = Arc::new(Ed25519Identity::from_seed([seed; 32]));
        let (store, index) = open_storage(params.data_dir.as_deref(), i)?;
        let (transport, events) = net.attach(identity.peer_id());
        let log = SharedLog::open(identity, store, index, transport, events, options.clone())
            .await
            .with_context(|| format!("failed to open peer {i}"))?;
        log.replicate(
            ReplicationSpec::Factor {
                factor: share,
                offset: None,
            },
            true,
        )
        .await?;
        logs.push(log);
    }

    let start = Instant::now();
    let mut written: Vec<(usize, Entry)> = Vec::with_capacity(params.peers * params.entries);
    for n in 0..params.entries {
        for (i, log) in logs.iter().enumerate() {
            let payload = Payload::text(format!("peer{i}-{n}"));
            let entry = log.append(payload, AppendOptions::default()).await?.entry;
            written.push((i, entry));
        }
    }
    debug!(count = written.len(), "appended");

    let deadline = Instant::now() + params.timeout;
    let converged = loop {
        if replicated(&logs, &written).await? {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let elapsed = start.elapsed();
    if !converged {
        warn!(?elapsed, "simulation did not converge");
    }

    let mut peers = Vec::with_capacity(logs.len());
    for log in &logs {
        let (entries, heads) = {
            let guard = log.log().await;
            (guard.len(), guard.head_hashes().len())
        };
        peers.push(PeerReport {
            peer: format!("{:?}", log.peer_id()),
            entries,
            heads,
            segments: log.segment_count()?,
        });
    }
    for log in &logs {
        log.close().await;
    }

    Ok(Report {
        converged,
        elapsed,
        messages: net.delivered(),
        peers,
    })
}

fn open_storage(
    data_dir: Option<&Path>,
    peer: usize,
) -> Result<(Arc<dyn BlockStore>, ReplicationIndex)> {
    match data_dir {
        Some(dir) => {
            let root = dir.join(format!("peer-{peer}"));
            std::fs::create_dir_all(&root)
                .with_context(|| format!("failed to create {}", root.display()))?;
            let store = Blocks::open(root.join("blocks")).context("failed to open block store")?;
            let index =
                ReplicationIndex::open(root.join("segments")).context("failed to open segments")?;
            Ok((Arc::new(store), index))
        }
        None => Ok((Arc::new(Blocks::in_memory()), ReplicationIndex::in_memory())),
    }
}

/// Whether every written entry is held by each of its leaders.
async fn replicated(logs: &[SharedLog], written: &[(usize, Entry)]) -> Result<bool> {
    for (writer, entry) in written {
        for leader in logs[*writer].find_leaders(entry, None)? {
            let Some(holder) = logs.iter().find(|l| l.peer_id() == leader) else {
                continue;
            };
            if !holder.log().await.has(&entry.hash()) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn print_report(params: &Simulation, report: &Report) {
    println!("eddy simulation");
    println!("  peers:     {}", params.peers);
    println!("  entries:   {} per peer", params.entries);
    println!(
        "  converged: {} in {:.2}s",
        report.converged,
        report.elapsed.as_secs_f64()
    );
    println!("  messages:  {}", report.messages);
    println!();
    for peer in &report.peers {
        println!(
            "  {}  entries={} heads={} segments={}",
            peer.peer, peer.entries, peer.heads, peer.segments
        );
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
