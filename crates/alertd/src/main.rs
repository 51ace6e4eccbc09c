//! Process entry point: wires configuration, the persistent identity, the
//! SQL datastore, the libp2p overlay, and every long-lived task (gossip
//! intake, peer discovery, retry scheduler, HTTP inspection API) behind a
//! single shutdown signal.

mod cli;
mod config;
mod http;
mod swarm;

use alertd_core::{
    bootstrap, ensure_schema, AlertStore, JsonRpcNodeClient, KeyStore, NodeRpc, SqlAlertStore,
    SqlKeyStore,
};
use alertd_net::{ConnectedPeers, DEFAULT_DISCOVERY_INTERVAL, PeerDiscoveryLoop};
use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use secp256k1::{Secp256k1, SecretKey};
use sqlx::any::AnyPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Parse `count` hex-encoded 33-byte compressed public keys.
fn parse_genesis_public_keys(hexes: &[String]) -> Result<[[u8; 33]; 5]> {
    if hexes.len() != 5 {
        bail!("genesis_public_keys must list exactly 5 keys, got {}", hexes.len());
    }
    let mut out = [[0u8; 33]; 5];
    for (i, h) in hexes.iter().enumerate() {
        let bytes = hex::decode(h).with_context(|| format!("genesis public key {i} is not valid hex"))?;
        out[i] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("genesis public key {i} is not 33 bytes"))?;
    }
    Ok(out)
}

/// Parse the genesis signing secrets (3 by default, matching
/// `signatures_per_alert`).
fn parse_genesis_secrets(hexes: &[String]) -> Result<Vec<SecretKey>> {
    hexes
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let bytes = hex::decode(h).with_context(|| format!("genesis secret {i} is not valid hex"))?;
            SecretKey::from_slice(&bytes).with_context(|| format!("genesis secret {i} is not a valid secp256k1 key"))
        })
        .collect()
}

fn run_genesis_keygen() {
    let secp = Secp256k1::new();
    println!("# Fresh genesis key set — 5 keypairs, operators choose which 3 sign each alert by default.");
    for i in 0..5 {
        let secret = SecretKey::new(&mut rand::thread_rng());
        let public = secp256k1::PublicKey::from_secret_key(&secp, &secret);
        println!(
            "key[{i}]  public={}  private={}",
            hex::encode(public.serialize()),
            hex::encode(secret.secret_bytes())
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::GenesisKeygen => {
            run_genesis_keygen();
            Ok(())
        }
        Command::Run => run_engine(cli).await,
    }
}

async fn run_engine(cli: Cli) -> Result<()> {
    let cfg = config::Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .connect(&cfg.database_url)
        .await
        .context("failed to connect to datastore")?;

    if cfg.auto_migrate {
        ensure_schema(&pool, &cfg.table_prefix)
            .await
            .context("auto-migration failed")?;
    }

    let store: Arc<dyn AlertStore> = Arc::new(SqlAlertStore::new(pool.clone(), &cfg.table_prefix));
    let keystore: Arc<dyn KeyStore> = Arc::new(SqlKeyStore::new(pool.clone(), &cfg.table_prefix));
    let node: Arc<dyn NodeRpc> = Arc::new(JsonRpcNodeClient::new(
        cfg.rpc_endpoint.clone(),
        cfg.rpc_username.clone(),
        cfg.rpc_password.clone(),
    ));

    let genesis_public_keys = parse_genesis_public_keys(&cfg.genesis_public_keys)?;
    let genesis_secrets = parse_genesis_secrets(&cfg.genesis_private_keys)?;
    bootstrap(store.as_ref(), keystore.as_ref(), genesis_public_keys, &genesis_secrets)
        .await
        .context("genesis bootstrap failed")?;

    let keypair = swarm::load_or_generate_identity(&cfg.identity_path)
        .context("failed to load or generate overlay identity")?;
    let local_peer_id = keypair.public().to_peer_id();
    tracing::info!(%local_peer_id, "overlay identity ready");

    let built_swarm = swarm::build_swarm(keypair, &cfg).context("failed to build overlay swarm")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connected = ConnectedPeers::new();

    let deps = swarm::SwarmDeps {
        store: store.clone(),
        keystore: keystore.clone(),
        node: node.clone(),
        connected: connected.clone(),
        webhook_url: cfg.webhook_url.clone(),
        topic: cfg.topic.clone(),
        local_peer_id,
    };
    let (handle, _) = swarm::spawn(built_swarm, deps, shutdown_rx.clone());

    let discovery_loop = PeerDiscoveryLoop::new(
        swarm::KadPeerSource { handle: handle.clone() },
        swarm::SwarmSyncDialer {
            handle: handle.clone(),
            store: store.clone(),
            keystore: keystore.clone(),
            node: node.clone(),
        },
        vec![cfg.topic.clone()],
        duration_or_default(cfg.peer_discovery_interval_secs, DEFAULT_DISCOVERY_INTERVAL),
        connected.clone(),
        cfg.allow_private_addrs,
    );
    let discovery_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        discovery_loop.run(discovery_shutdown).await;
    });

    let retry = alertd_core::RetryScheduler::new(
        store.clone(),
        node.clone(),
        keystore.clone(),
        Duration::from_secs(cfg.retry_interval_secs),
    );
    let retry_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        retry.run(retry_shutdown).await;
    });

    let http_state = http::AppState { store: store.clone(), connected: connected.clone() };
    let http_router = http::router(http_state);
    let listener = tokio::net::TcpListener::bind(&cfg.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP inspection API on {}", cfg.http_addr))?;
    tracing::info!(addr = %cfg.http_addr, "http inspection api listening");
    let mut http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(listener, http_router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, stopping all tasks");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, http_task).await;

    Ok(())
}

fn duration_or_default(secs: u64, default: Duration) -> Duration {
    if secs == 0 {
        default
    } else {
        Duration::from_secs(secs)
    }
}
