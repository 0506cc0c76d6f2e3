//! 'main' for the Agora in-process network simulator

use std::sync::Arc;

use agora_common::collaborators::ProducerSchedule;
use agora_common::peer::PeerId;
use agora_common::ProducerId;
use agora_module_chain_coordinator::ChainCoordinator;
use agora_module_peer_network_interface::Node;
use agora_test_utils::{genesis, producer, CheckpointOracle, LedgerExecutor, RoundRobinSchedule};
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use config::{Config, Environment, File};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::select;
use tokio::time::{interval, sleep};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

mod configuration;
mod producer;

use crate::configuration::SimulatorConfig;
use crate::producer::{build_block, random_transaction};

#[derive(Debug, Parser)]
#[command(name = "agora-simulator")]
#[command(about = "Runs a ring of Agora nodes in one process")]
struct Args {
    /// Configuration file; missing is fine
    #[arg(long, value_name = "PATH", default_value = "simulator.toml")]
    config: String,

    /// Override the node count
    #[arg(short, long)]
    nodes: Option<u64>,

    /// Override the number of blocks to produce
    #[arg(short, long)]
    blocks: Option<u64>,

    /// Keep every store in memory instead of on disk
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());
    Registry::default().with(fmt_layer).init();

    info!("Agora simulator");

    let mut builder = Config::builder()
        .add_source(File::with_name(&args.config).required(false))
        .add_source(Environment::with_prefix("AGORA"))
        .set_override_option("nodes", args.nodes)?
        .set_override_option("blocks", args.blocks)?;
    if args.memory {
        builder = builder
            .set_override("block-store.backend", "memory")?
            .set_override("state.backend", "memory")?;
    }
    let config = builder.build().context("reading configuration")?;
    let sim = SimulatorConfig::try_load(&config)?;

    let producers = u8::try_from(sim.producers).context("at most 255 producers are supported")?;
    let identities: Vec<ProducerId> = (1..=producers).map(producer).collect();
    let schedule: Arc<dyn ProducerSchedule> = Arc::new(RoundRobinSchedule::new(identities.clone()));

    let mut nodes = Vec::with_capacity(sim.nodes);
    for index in 0..sim.nodes {
        let chain = open_chain(&config, &sim, index)?;
        let role = identities.get(index).copied();
        let node = Node::spawn(PeerId(index as u64 + 1), &config, chain.shared(), schedule.clone(), role)?;
        nodes.push(node);
    }
    for index in 0..sim.nodes {
        let next = (index + 1) % sim.nodes;
        // Two nodes need one link, not two
        if next == index || (sim.nodes == 2 && index == 1) {
            continue;
        }
        nodes[index].connect(&nodes[next]).await?;
    }
    info!(nodes = sim.nodes, producers = sim.producers, "Network up");

    let mut rng = StdRng::seed_from_u64(sim.seed);
    let mut ticker = interval(sim.block_interval());
    ticker.tick().await;
    let mut nonce = 0u64;
    let mut slot = 0u64;
    while sim.blocks == 0 || slot < sim.blocks {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {}
        }

        for _ in 0..sim.transactions_per_block {
            nonce += 1;
            let target = &nodes[rng.random_range(0..nodes.len())];
            target.submit(random_transaction(&mut rng, nonce)).await?;
        }

        let index = (slot % sim.producers as u64) as usize;
        let block = build_block(&nodes[index], identities[index]).await?;
        info!(
            node = %nodes[index].id,
            number = block.number(),
            txs = block.transactions.len(),
            "Produced block"
        );
        nodes[index].publish(block).await?;
        slot += 1;
    }

    sleep(sim.settle_time()).await;
    let mut heads = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let chain = node.chain.lock().await;
        info!(
            node = %node.id,
            head = %chain.head(),
            solid = %chain.solid(),
            unresolved = chain.fork_index_len(),
            pending = chain.pending_transactions().len(),
            "Final state"
        );
        heads.push(chain.head());
    }

    for node in nodes {
        let id = node.id;
        if let Err(error) = node.shutdown().await {
            warn!(node = %id, "{error:#}");
        }
    }

    if heads.windows(2).any(|pair| pair[0] != pair[1]) {
        bail!("nodes did not converge on one head");
    }

    // Bye!
    info!("Exiting");
    Ok(())
}

/// One node's chain, with its databases in their own directory
fn open_chain(base: &Config, sim: &SimulatorConfig, index: usize) -> Result<ChainCoordinator> {
    let dir = sim.data_dir.join(format!("node-{index}"));
    let config = Config::builder()
        .add_source(base.clone())
        .set_override("block-store.database-path", dir.join("blocks").to_string_lossy().into_owned())?
        .set_override("state.database-path", dir.join("state").to_string_lossy().into_owned())?
        .build()?;
    ChainCoordinator::from_config(
        &config,
        genesis(),
        Arc::new(LedgerExecutor::new()),
        Arc::new(CheckpointOracle::new(sim.finality_interval)),
    )
    .with_context(|| format!("opening chain for node {index}"))
}
