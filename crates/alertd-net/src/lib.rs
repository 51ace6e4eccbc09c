//! # alertd-net
//!
//! Overlay networking for the Bitcoin SV alert engine: the libp2p
//! behaviour composite, gossip intake, the pairwise sync protocol, and
//! the peer discovery loop. All alert semantics (codec, verification,
//! execution, storage) live in `alertd-core`; this crate only drives that
//! logic over the wire.

pub mod behaviour;
pub mod discovery;
pub mod gossip;
pub mod sync;

pub use behaviour::{
    create_gossipsub_config, create_identify_config, create_kad_config, sync_stream_protocol,
    AlertBehaviour, AlertBehaviourEvent, SYNC_PROTOCOL_ID,
};
pub use discovery::{
    is_private_multiaddr, ConnectedPeers, DhtMode, PeerDiscoveryLoop, PeerSource, SyncDialer,
    DEFAULT_DISCOVERY_INTERVAL,
};
pub use gossip::{GossipDrop, GossipIntake};
pub use sync::{drive_initiator, drive_responder, SyncCtx, SyncError, SESSION_TIMEOUT};
