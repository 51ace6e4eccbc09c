//! libp2p network behaviour for the alert engine overlay.
//!
//! Defines the composite behaviour that combines:
//! - GossipSub for alert topic flood-propagation
//! - Kademlia for peer/topic discovery (auto-server or client mode)
//! - Identify for peer identification
//! - Ping for connection keep-alive
//!
//! This module owns no alert semantics — it only configures the wire-level
//! protocols. Codec/Verifier/ordering checks happen in `gossip.rs` and
//! `sync.rs`, one layer up.

use libp2p::{gossipsub, identify, kad, ping, swarm::NetworkBehaviour, stream, StreamProtocol};
use std::time::Duration;

/// The sync protocol's stream-protocol identifier.
pub const SYNC_PROTOCOL_ID: &str = "/bitcoin/alert-system/0.0.1";

pub fn sync_stream_protocol() -> StreamProtocol {
    StreamProtocol::new("/bitcoin/alert-system/0.0.1")
}

#[derive(NetworkBehaviour)]
pub struct AlertBehaviour {
    /// GossipSub for the overlay's alert topics — the transport half of
    /// Alert gossip.
    pub gossipsub: gossipsub::Behaviour,

    /// Kademlia DHT, used by peer discovery to find peers
    /// announcing each topic. Mode (`auto-server` / `client`) is set by
    /// the caller at construction time, per configured `dht_mode`.
    pub kad: kad::Behaviour<kad::store::MemoryStore>,

    /// Identify, so peers exchange supported protocol IDs including the
    /// sync protocol.
    pub identify: identify::Behaviour,

    /// Ping for keep-alive and basic liveness measurement.
    pub ping: ping::Behaviour,

    /// Generic stream-opening behaviour (`libp2p-stream`) the sync
    /// protocol (`sync.rs`) rides on.
    pub stream: stream::Behaviour,
}

/// GossipSub configuration tuned for alert envelopes, which are small
/// (well under a kilobyte for every alert type except FreezeUtxo with many
/// fund records) and must be validated strictly before relaying.
pub fn create_gossipsub_config() -> gossipsub::Config {
    gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Permissive)
        .max_transmit_size(256 * 1024)
        .build()
        .expect("valid gossipsub config")
}

pub fn create_identify_config(local_public_key: libp2p::identity::PublicKey) -> identify::Config {
    identify::Config::new(format!("{SYNC_PROTOCOL_ID}/identify"), local_public_key)
}

pub fn create_kad_config() -> kad::Config {
    kad::Config::default()
}
