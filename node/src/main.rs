// Conduit state channel node: wires a signer, store, messaging and chain
// access into the protocol engine and (optionally) the forwarding router.

mod config;

use clap::Parser;
use conduit_core::chain::MockChainService;
use conduit_core::crypto::ChannelSigner;
use conduit_core::engine::Engine;
use conduit_core::lock::LockService;
use conduit_core::messaging::InMemoryMessaging;
use conduit_core::router::{IdentitySwap, Router};
use conduit_core::store::{MemoryStore, RouterStore, Store};
use conduit_core::types::RebalanceProfile;
use config::NodeConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conduit-node", version, about = "Conduit state channel node")]
struct Args {
    /// Path to the node configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_ref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.node.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let signer = match &config.node.signer_key {
        Some(key) => ChannelSigner::from_hex(key)?,
        None => {
            warn!("No signer key configured; generating an ephemeral identity");
            ChannelSigner::random()
        }
    };
    info!(
        identifier = %signer.public_identifier(),
        address = %signer.address(),
        "starting conduit node"
    );

    let context = config.network_context()?;
    info!(
        chain_id = context.chain_id,
        channel_factory = %context.channel_factory,
        "chain context loaded"
    );

    let messaging = InMemoryMessaging::new();
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(MockChainService::new());
    let lock = LockService::new(
        signer.public_identifier().clone(),
        messaging.clone(),
        Duration::from_secs(config.lock.ttl_secs),
    );
    lock.serve().await?;

    let engine = Engine::new(
        signer,
        store.clone() as Arc<dyn Store>,
        messaging.clone(),
        lock,
        chain.clone(),
    );
    engine.start().await?;

    if config.router.enabled {
        let router = Router::new(
            engine.clone(),
            store.clone() as Arc<dyn Store>,
            store as Arc<dyn RouterStore>,
            chain,
            messaging,
            Arc::new(IdentitySwap),
            RebalanceProfile {
                target: config.router.collateral_target,
                reclaim_threshold: config.router.reclaim_threshold,
            },
        );
        router.start().await?;
    }

    // Tell every channel counterparty this node is reachable so queued
    // forwards drain.
    engine.announce_alive().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");
    Ok(())
}
