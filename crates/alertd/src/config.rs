//! Layered configuration: embedded defaults, overridden by environment
//! variables, overridden by an optional config file. Built on `figment`,
//! the same layering crate the corpus's `teleport`-style services use.

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the Ed25519 identity key file (generated on first run).
    pub identity_path: PathBuf,
    /// Multiaddr the overlay listens on.
    pub bind_addr: String,
    /// Gossip topic name alerts are published/subscribed under.
    pub topic: String,
    /// Kademlia DHT mode: `"auto-server"` or `"client"`.
    pub dht_mode: String,
    /// Bootstrap peer multiaddresses, dialed on startup.
    pub bootstrap_peers: Vec<String>,
    /// Whether to allow dialing/broadcasting private address ranges.
    pub allow_private_addrs: bool,
    /// Peer-discovery loop interval, seconds (default 600).
    pub peer_discovery_interval_secs: u64,
    /// Retry scheduler interval, seconds (default 300).
    pub retry_interval_secs: u64,

    /// Bitcoin node JSON-RPC endpoint.
    pub rpc_endpoint: String,
    pub rpc_username: String,
    pub rpc_password: String,

    /// Optional webhook URL notified on accepted alerts.
    pub webhook_url: Option<String>,

    /// SQL datastore connection string (`sqlite::memory:`,
    /// `sqlite:alerts.db`, `postgres://...`, `mysql://...`).
    pub database_url: String,
    /// Table name prefix.
    pub table_prefix: String,
    /// Whether to run embedded migrations on startup. Off in production.
    pub auto_migrate: bool,

    /// HTTP inspection API bind address.
    pub http_addr: String,

    /// Genesis bootstrap material. Never used again after the first run
    /// and never persisted by this process.
    pub genesis_public_keys: Vec<String>,
    pub genesis_private_keys: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from("identity.key"),
            bind_addr: "/ip4/0.0.0.0/tcp/4001".to_string(),
            topic: "alert-system".to_string(),
            dht_mode: "client".to_string(),
            bootstrap_peers: Vec::new(),
            allow_private_addrs: false,
            peer_discovery_interval_secs: 600,
            retry_interval_secs: 300,
            rpc_endpoint: "http://127.0.0.1:8332".to_string(),
            rpc_username: String::new(),
            rpc_password: String::new(),
            webhook_url: None,
            database_url: "sqlite://alertd.db".to_string(),
            table_prefix: String::new(),
            auto_migrate: false,
            http_addr: "127.0.0.1:8080".to_string(),
            genesis_public_keys: Vec::new(),
            genesis_private_keys: Vec::new(),
        }
    }
}

impl Config {
    /// Load embedded defaults, then `ALERTD_*` environment variables,
    /// then an optional JSON file if `config_path` is given.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("ALERTD_").split("__"));

        if let Some(path) = config_path {
            figment = figment.merge(Json::file(path));
        }

        Ok(figment.extract()?)
    }
}
