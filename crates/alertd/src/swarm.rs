//! Builds the libp2p swarm and drives its event loop, translating
//! low-level swarm events into calls against `alertd-net`'s gossip intake
//! and sync protocol drivers. This is the only task that ever touches the
//! `Swarm` directly; every other task reaches it through `SwarmHandle`'s
//! command channel or a cloned `stream::Control`.

use crate::config::Config;
use alertd_core::{AlertStore, KeyStore, NodeRpc};
use anyhow::Context as _;
use alertd_net::{
    create_gossipsub_config, create_identify_config, create_kad_config, sync_stream_protocol,
    AlertBehaviour, AlertBehaviourEvent, ConnectedPeers, GossipIntake, SyncCtx,
};
use futures::StreamExt;
use libp2p::{
    gossipsub, identify, identity, kad, multiaddr::Protocol, swarm::SwarmEvent, Multiaddr, PeerId,
    Swarm,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Load the persistent Ed25519 identity from `path`, generating and
/// saving a fresh one on first run.
pub fn load_or_generate_identity(path: &Path) -> anyhow::Result<identity::Keypair> {
    if let Ok(bytes) = std::fs::read(path) {
        return Ok(identity::Keypair::from_protobuf_encoding(&bytes)?);
    }
    let keypair = identity::Keypair::generate_ed25519();
    std::fs::write(path, keypair.to_protobuf_encoding()?)?;
    Ok(keypair)
}

pub fn build_swarm(keypair: identity::Keypair, config: &Config) -> anyhow::Result<Swarm<AlertBehaviour>> {
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            Default::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )?
        .with_dns()?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();
            let kad_mode = if config.dht_mode == "auto-server" {
                kad::Mode::Server
            } else {
                kad::Mode::Client
            };
            let mut kad = kad::Behaviour::with_config(
                peer_id,
                kad::store::MemoryStore::new(peer_id),
                create_kad_config(),
            );
            kad.set_mode(Some(kad_mode));

            Ok(AlertBehaviour {
                gossipsub: gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    create_gossipsub_config(),
                )
                .expect("valid gossipsub behaviour"),
                kad,
                identify: identify::Behaviour::new(create_identify_config(key.public())),
                ping: libp2p::ping::Behaviour::default(),
                stream: libp2p::stream::Behaviour::new(),
            })
        })?
        .build();

    swarm.listen_on(config.bind_addr.parse()?)?;

    for peer_addr in &config.bootstrap_peers {
        let addr: Multiaddr = peer_addr
            .parse()
            .with_context(|| format!("bootstrap peer address {peer_addr} is not a valid multiaddr"))?;
        let peer_id = addr.iter().find_map(|p| match p {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        });
        match peer_id {
            Some(peer_id) => {
                swarm.behaviour_mut().kad.add_address(&peer_id, addr.clone());
                if let Err(e) = swarm.dial(addr) {
                    tracing::warn!(%peer_addr, error = %e, "failed to dial configured bootstrap peer");
                }
            }
            None => {
                tracing::warn!(%peer_addr, "bootstrap peer address carries no /p2p peer id, skipping");
            }
        }
    }
    if !config.bootstrap_peers.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kad.bootstrap() {
            tracing::warn!(error = %e, "kademlia bootstrap query failed to start");
        }
    }

    Ok(swarm)
}

enum SwarmCommand {
    Dial {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<(), String>>,
    },
    FindProviders {
        topic: String,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// A cheaply-cloneable handle other tasks use to ask the swarm-owning
/// task to dial peers and run Kademlia provider lookups, and to open
/// outbound sync streams directly via `libp2p-stream`'s own `Control`
/// (which needs no round-trip through the swarm task).
#[derive(Clone)]
pub struct SwarmHandle {
    commands: mpsc::Sender<SwarmCommand>,
    control: libp2p::stream::Control,
}

impl SwarmHandle {
    pub async fn dial(&self, peer_id: PeerId) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::Dial { peer_id, reply })
            .await
            .map_err(|_| "swarm task is gone".to_string())?;
        rx.await.map_err(|_| "swarm task dropped the reply".to_string())?
    }

    pub async fn find_providers(&self, topic: &str) -> Vec<Multiaddr> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SwarmCommand::FindProviders {
                topic: topic.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    pub async fn open_sync_stream(
        &mut self,
        peer_id: PeerId,
    ) -> Result<libp2p::Stream, String> {
        self.control
            .open_stream(peer_id, sync_stream_protocol())
            .await
            .map_err(|e| e.to_string())
    }
}

/// Everything the swarm task needs to process inbound gossip and respond
/// to provider queries.
pub struct SwarmDeps {
    pub store: Arc<dyn AlertStore>,
    pub keystore: Arc<dyn KeyStore>,
    pub node: Arc<dyn NodeRpc>,
    pub connected: ConnectedPeers,
    pub webhook_url: Option<String>,
    pub topic: String,
    pub local_peer_id: PeerId,
}

/// Spawn the swarm event loop. Returns a `SwarmHandle` for issuing dial
/// and provider-lookup commands, and the local `PeerId`.
pub fn spawn(
    mut swarm: Swarm<AlertBehaviour>,
    deps: SwarmDeps,
    mut shutdown: watch::Receiver<bool>,
) -> (SwarmHandle, PeerId) {
    let local_peer_id = *swarm.local_peer_id();
    let (tx, mut rx) = mpsc::channel::<SwarmCommand>(64);

    let topic_hash = gossipsub::IdentTopic::new(deps.topic.clone());
    let _ = swarm.behaviour_mut().gossipsub.subscribe(&topic_hash);

    let provider_key = kad::RecordKey::new(&deps.topic);
    let _ = swarm.behaviour_mut().kad.start_providing(provider_key);

    let control = swarm.behaviour().stream.new_control();
    tokio::spawn(accept_sync_streams(control.clone(), deps_for_sync(&deps)));

    tokio::spawn(async move {
        let mut pending_dials: HashMap<PeerId, oneshot::Sender<Result<(), String>>> = HashMap::new();
        let mut pending_queries: HashMap<kad::QueryId, oneshot::Sender<Vec<Multiaddr>>> = HashMap::new();
        let http = reqwest::Client::new();

        loop {
            tokio::select! {
                Some(command) = rx.recv() => match command {
                    SwarmCommand::Dial { peer_id, reply } => {
                        if let Err(e) = swarm.dial(peer_id) {
                            let _ = reply.send(Err(e.to_string()));
                        } else {
                            pending_dials.insert(peer_id, reply);
                        }
                    }
                    SwarmCommand::FindProviders { topic, reply } => {
                        let key = kad::RecordKey::new(&topic);
                        let query_id = swarm.behaviour_mut().kad.get_providers(key);
                        pending_queries.insert(query_id, reply);
                    }
                },
                event = swarm.select_next_some() => {
                    handle_swarm_event(event, &deps, &http, &mut pending_dials, &mut pending_queries);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("swarm event loop shutting down");
                        return;
                    }
                }
            }
        }
    });

    (SwarmHandle { commands: tx, control }, local_peer_id)
}

fn deps_for_sync(deps: &SwarmDeps) -> (Arc<dyn AlertStore>, Arc<dyn KeyStore>, Arc<dyn NodeRpc>) {
    (deps.store.clone(), deps.keystore.clone(), deps.node.clone())
}

async fn accept_sync_streams(
    mut control: libp2p::stream::Control,
    (store, keystore, node): (Arc<dyn AlertStore>, Arc<dyn KeyStore>, Arc<dyn NodeRpc>),
) {
    let Ok(mut incoming) = control.accept(sync_stream_protocol()) else {
        tracing::error!("failed to register sync protocol acceptor");
        return;
    };
    while let Some((peer, stream)) = incoming.next().await {
        let store = store.clone();
        let keystore = keystore.clone();
        let node = node.clone();
        tokio::spawn(async move {
            let ctx = SyncCtx {
                store: store.as_ref(),
                keystore: keystore.as_ref(),
                node: node.as_ref(),
            };
            if let Err(e) = alertd_net::drive_responder(stream, &ctx).await {
                tracing::debug!(%peer, error = %e, "sync: responder session ended with error");
            }
        });
    }
}

fn handle_swarm_event(
    event: SwarmEvent<AlertBehaviourEvent>,
    deps: &SwarmDeps,
    http: &reqwest::Client,
    pending_dials: &mut HashMap<PeerId, oneshot::Sender<Result<(), String>>>,
    pending_queries: &mut HashMap<kad::QueryId, oneshot::Sender<Vec<Multiaddr>>>,
) {
    match event {
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            if let Some(reply) = pending_dials.remove(&peer_id) {
                let _ = reply.send(Ok(()));
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
            if let Some(reply) = pending_dials.remove(&peer_id) {
                let _ = reply.send(Err(error.to_string()));
            }
        }
        SwarmEvent::Behaviour(AlertBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => {
            let store = deps.store.clone();
            let keystore = deps.keystore.clone();
            let node = deps.node.clone();
            let connected = deps.connected.clone();
            let webhook_url = deps.webhook_url.clone();
            let http = http.clone();
            let data = message.data;
            let source = propagation_source;
            let local_peer_id = deps.local_peer_id;
            tokio::spawn(async move {
                let intake = GossipIntake {
                    store: store.as_ref(),
                    keystore: keystore.as_ref(),
                    node: node.as_ref(),
                    connected,
                    local_peer_id,
                    webhook_url,
                    http,
                };
                if let Err(e) = intake.handle_message(source, &data).await {
                    tracing::debug!(error = %e, "gossip: message dropped");
                }
            });
        }
        SwarmEvent::Behaviour(AlertBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
            id,
            result: kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders { providers, .. })),
            ..
        })) => {
            if let Some(reply) = pending_queries.remove(&id) {
                let addrs = providers
                    .into_iter()
                    .map(|peer| Multiaddr::empty().with(Protocol::P2p(peer)))
                    .collect();
                let _ = reply.send(addrs);
            }
        }
        _ => {}
    }
}

/// Adapts `SwarmHandle::find_providers` to `alertd_net::PeerSource`, so
/// the peer discovery loop's timing/threshold logic stays swarm-free.
pub struct KadPeerSource {
    pub handle: SwarmHandle,
}

#[async_trait::async_trait]
impl alertd_net::PeerSource for KadPeerSource {
    async fn candidates(&self, topic: &str) -> Vec<Multiaddr> {
        self.handle.find_providers(topic).await
    }
}

/// Dials a discovered peer and drives the initiator side of a sync
/// session over a freshly-opened `/bitcoin/alert-system` stream.
pub struct SwarmSyncDialer {
    pub handle: SwarmHandle,
    pub store: Arc<dyn AlertStore>,
    pub keystore: Arc<dyn KeyStore>,
    pub node: Arc<dyn NodeRpc>,
}

#[async_trait::async_trait]
impl alertd_net::SyncDialer for SwarmSyncDialer {
    async fn dial_and_sync(&self, addr: &Multiaddr) -> Result<(), String> {
        let peer_id = addr
            .iter()
            .find_map(|p| match p {
                Protocol::P2p(peer) => Some(peer),
                _ => None,
            })
            .ok_or_else(|| "candidate address carries no peer id".to_string())?;

        let mut handle = self.handle.clone();
        handle.dial(peer_id).await?;
        let stream = handle.open_sync_stream(peer_id).await?;

        let ctx = SyncCtx {
            store: self.store.as_ref(),
            keystore: self.keystore.as_ref(),
            node: self.node.as_ref(),
        };
        alertd_net::drive_initiator(stream, &ctx)
            .await
            .map_err(|e| e.to_string())
    }
}
