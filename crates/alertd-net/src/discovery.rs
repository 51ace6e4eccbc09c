//! Announces presence, periodically
//! find peers announcing each topic, dial candidates, and drive an
//! outbound sync session against each.
//!
//! The actual DHT queries and dialing live behind the `PeerSource` and
//! `SyncDialer` traits so this module's timing/threshold/shutdown policy
//! is unit-testable without a running libp2p `Swarm` — the same
//! capability-trait split used for `NodeRpc`/`AlertStore`.

use async_trait::async_trait;
use libp2p::Multiaddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(600);

/// Private/reserved address ranges filtered from dial candidates and
/// broadcast, unless explicitly allowed by config.
const PRIVATE_V4_RANGES: &[(u8, u8, u8)] = &[
    (10, 0, 0),    // 10.0.0.0/8 (mask applied to first octet only below)
    (172, 16, 0),  // 172.16.0.0/12
    (192, 168, 0), // 192.168.0.0/16
    (127, 0, 0),   // 127.0.0.0/8 (loopback)
    (100, 64, 0),  // 100.64.0.0/10 (carrier-grade NAT)
    (169, 254, 0), // 169.254.0.0/16 (link-local)
];

/// Whether `addr` falls in a filtered private/reserved range (the
/// six listed ranges). Non-IP4 components (DNS, IP6, etc.) are never
/// filtered here.
pub fn is_private_multiaddr(addr: &Multiaddr) -> bool {
    for proto in addr.iter() {
        if let libp2p::multiaddr::Protocol::Ip4(ip) = proto {
            let octets = ip.octets();
            match octets {
                [10, ..] => return true,
                [172, b, ..] if (16..=31).contains(&b) => return true,
                [192, 168, ..] => return true,
                [127, ..] => return true,
                [100, b, ..] if (64..=127).contains(&b) => return true,
                [169, 254, ..] => return true,
                _ => {}
            }
        }
    }
    false
}

/// Whether Kademlia runs in DHT-server mode (answers queries for other
/// peers) or client-only mode (issues queries but does not serve them).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhtMode {
    AutoServer,
    Client,
}

/// Tracks how many peers this node currently considers "connected" —
/// two or more peers have reached `DONE` on a
/// sync session. Gossip Intake consults this before trusting its own
/// ordering gate.
#[derive(Clone, Default)]
pub struct ConnectedPeers(Arc<AtomicUsize>);

impl ConnectedPeers {
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(0)))
    }

    pub fn record_success(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn load(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.load() >= 2
    }
}

/// Finds dial candidates for a topic — backed by Kademlia
/// `get_providers`/`start_providing` queries against the real swarm.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn candidates(&self, topic: &str) -> Vec<Multiaddr>;
}

/// Dials a candidate address and drives `sync::drive_initiator` over the
/// resulting stream.
#[async_trait]
pub trait SyncDialer: Send + Sync {
    async fn dial_and_sync(&self, addr: &Multiaddr) -> Result<(), String>;
}

pub struct PeerDiscoveryLoop<P, D> {
    source: P,
    dialer: D,
    topics: Vec<String>,
    interval: Duration,
    connected: ConnectedPeers,
    allow_private: bool,
}

impl<P, D> PeerDiscoveryLoop<P, D>
where
    P: PeerSource,
    D: SyncDialer,
{
    pub fn new(
        source: P,
        dialer: D,
        topics: Vec<String>,
        interval: Duration,
        connected: ConnectedPeers,
        allow_private: bool,
    ) -> Self {
        Self {
            source,
            dialer,
            topics,
            interval,
            connected,
            allow_private,
        }
    }

    /// Run one discovery round: for every topic, fetch candidates, filter
    /// private addresses (unless allowed), dial each, and drive a sync
    /// session. Returns the count of sessions that reached `DONE`.
    pub async fn tick(&self) -> usize {
        let mut successes = 0;
        for topic in &self.topics {
            let candidates = self.source.candidates(topic).await;
            for addr in candidates {
                if !self.allow_private && is_private_multiaddr(&addr) {
                    tracing::debug!(%addr, "discovery: skipping private address");
                    continue;
                }
                match self.dialer.dial_and_sync(&addr).await {
                    Ok(()) => {
                        successes += 1;
                        self.connected.record_success();
                    }
                    Err(e) => {
                        tracing::debug!(%addr, error = %e, "discovery: sync session failed");
                    }
                }
            }
        }
        successes
    }

    /// Run an immediate round at startup, then one round every
    /// `interval`, until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.tick().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("peer discovery loop shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn filters_private_ranges() {
        let cases: &[(&str, bool)] = &[
            ("/ip4/10.0.0.5/tcp/4001", true),
            ("/ip4/172.16.0.1/tcp/4001", true),
            ("/ip4/172.32.0.1/tcp/4001", false),
            ("/ip4/192.168.1.1/tcp/4001", true),
            ("/ip4/127.0.0.1/tcp/4001", true),
            ("/ip4/100.64.0.1/tcp/4001", true),
            ("/ip4/169.254.0.1/tcp/4001", true),
            ("/ip4/8.8.8.8/tcp/4001", false),
        ];
        for (addr, expect_private) in cases {
            let parsed: Multiaddr = addr.parse().unwrap();
            assert_eq!(is_private_multiaddr(&parsed), *expect_private, "{addr}");
        }
    }

    #[test]
    fn connected_peers_threshold() {
        let connected = ConnectedPeers::new();
        assert!(!connected.is_connected());
        connected.record_success();
        assert!(!connected.is_connected());
        connected.record_success();
        assert!(connected.is_connected());
    }

    struct FixedSource(Vec<Multiaddr>);

    #[async_trait]
    impl PeerSource for FixedSource {
        async fn candidates(&self, _topic: &str) -> Vec<Multiaddr> {
            self.0.clone()
        }
    }

    struct CountingDialer {
        calls: Mutex<Vec<Multiaddr>>,
        fail_count: StdAtomicUsize,
    }

    #[async_trait]
    impl SyncDialer for CountingDialer {
        async fn dial_and_sync(&self, addr: &Multiaddr) -> Result<(), String> {
            self.calls.lock().unwrap().push(addr.clone());
            if self.fail_count.load(Ordering::SeqCst) > 0 {
                self.fail_count.fetch_sub(1, Ordering::SeqCst);
                Err("dial failed".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn tick_skips_private_addresses_by_default() {
        let source = FixedSource(vec![
            "/ip4/10.0.0.5/tcp/4001".parse().unwrap(),
            "/ip4/8.8.8.8/tcp/4001".parse().unwrap(),
        ]);
        let dialer = CountingDialer {
            calls: Mutex::new(vec![]),
            fail_count: StdAtomicUsize::new(0),
        };
        let loop_ = PeerDiscoveryLoop::new(
            source,
            dialer,
            vec!["alerts".into()],
            Duration::from_secs(600),
            ConnectedPeers::new(),
            false,
        );
        let successes = loop_.tick().await;
        assert_eq!(successes, 1);
        assert_eq!(loop_.dialer.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tick_records_connected_peers_on_success() {
        let source = FixedSource(vec!["/ip4/8.8.8.8/tcp/4001".parse().unwrap()]);
        let dialer = CountingDialer {
            calls: Mutex::new(vec![]),
            fail_count: StdAtomicUsize::new(0),
        };
        let connected = ConnectedPeers::new();
        let loop_ = PeerDiscoveryLoop::new(
            source,
            dialer,
            vec!["alerts".into()],
            Duration::from_secs(600),
            connected.clone(),
            false,
        );
        loop_.tick().await;
        assert_eq!(connected.load(), 1);
    }
}
