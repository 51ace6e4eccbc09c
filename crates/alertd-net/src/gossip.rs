//! Validates inbound published alerts and
//! hands them off to the Executor and Alert Log. One task runs per
//! subscribed topic; within a task, messages are handled one at a time.

use crate::discovery::ConnectedPeers;
use alertd_core::{codec, AlertRow, AlertStore, CodecError, Executor, ExecutorCtx, KeyStore, NodeRpc, StoreError, VerifyError, Verifier};
use libp2p::PeerId;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GossipDrop {
    #[error("not yet synced: fewer than the required connected-peer threshold")]
    NotConnected,

    #[error("message originated locally")]
    SelfDelivery,

    #[error("codec rejected the envelope: {0}")]
    Malformed(String),

    #[error("signature check failed: {0}")]
    SignatureInvalid(String),

    #[error("out-of-order: predecessor sequence is missing")]
    OutOfOrder,

    #[error("duplicate: sequence already present")]
    Duplicate,

    #[error("store error: {0}")]
    Store(String),
}

impl From<CodecError> for GossipDrop {
    fn from(e: CodecError) -> Self {
        GossipDrop::Malformed(e.to_string())
    }
}

impl From<VerifyError> for GossipDrop {
    fn from(e: VerifyError) -> Self {
        GossipDrop::SignatureInvalid(e.to_string())
    }
}

/// JSON body POSTed to the configured webhook URL on acceptance, per
/// the local daemon.
#[derive(Serialize)]
struct WebhookPayload {
    alert_type: u32,
    sequence: u32,
    raw: String,
    text: String,
}

pub struct GossipIntake<'a> {
    pub store: &'a dyn AlertStore,
    pub keystore: &'a dyn KeyStore,
    pub node: &'a dyn NodeRpc,
    pub connected: ConnectedPeers,
    pub local_peer_id: PeerId,
    pub webhook_url: Option<String>,
    pub http: reqwest::Client,
}

impl<'a> GossipIntake<'a> {
    /// Process one message received on a subscribed topic. Every drop path
    /// logs at `debug` with the reason tag; this function never panics or
    /// retries.
    pub async fn handle_message(&self, from: PeerId, data: &[u8]) -> Result<(), GossipDrop> {
        if !self.connected.is_connected() {
            tracing::debug!(reason = "not_connected", "gossip: dropping message before reaching sync threshold");
            return Err(GossipDrop::NotConnected);
        }

        if from == self.local_peer_id {
            tracing::debug!(reason = "self_delivery", "gossip: dropping self-originated message");
            return Err(GossipDrop::SelfDelivery);
        }

        let envelope = match codec::decode(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(reason = "malformed", error = %e, "gossip: dropping malformed envelope");
                return Err(e.into());
            }
        };

        let active_keys = self
            .keystore
            .active_keys()
            .await
            .map_err(|e| GossipDrop::Store(e.to_string()))?;
        if let Err(e) = Verifier::verify(&envelope, &active_keys) {
            tracing::debug!(reason = "signature_invalid", sequence = envelope.sequence, error = %e, "gossip: dropping invalid signature");
            return Err(e.into());
        }

        if envelope.sequence > 0 {
            match self.store.get_by_sequence(envelope.sequence - 1).await {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(reason = "out_of_order", sequence = envelope.sequence, "gossip: dropping out-of-order alert");
                    return Err(GossipDrop::OutOfOrder);
                }
                Err(e) => return Err(GossipDrop::Store(e.to_string())),
            }
        }

        match self.store.get_by_sequence(envelope.sequence).await {
            Ok(_) => {
                tracing::debug!(reason = "duplicate", sequence = envelope.sequence, "gossip: dropping duplicate alert");
                return Err(GossipDrop::Duplicate);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(GossipDrop::Store(e.to_string())),
        }

        let hash = hex::encode(codec::envelope_hash(&envelope));
        let exec_ctx = ExecutorCtx {
            node: self.node,
            keystore: self.keystore,
            alert_hash: &hash,
        };
        let processed = match Executor::execute(&envelope.payload, &exec_ctx).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(sequence = envelope.sequence, error = %e, "gossip: execution failed, will retry");
                false
            }
        };

        let now = chrono::Utc::now();
        let row = AlertRow {
            id: 0,
            sequence: envelope.sequence,
            hash: hash.clone(),
            raw: hex::encode(data),
            processed,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store
            .append(&row)
            .await
            .map_err(|e| GossipDrop::Store(e.to_string()))?;

        if let Some(url) = &self.webhook_url {
            let payload = WebhookPayload {
                alert_type: envelope.payload.alert_type().as_u32(),
                sequence: envelope.sequence,
                raw: row.raw.clone(),
                text: summarize(&envelope.payload),
            };
            let client = self.http.clone();
            let url = url.clone();
            tokio::spawn(async move {
                match client.post(&url).json(&payload).send().await {
                    Ok(resp) if !resp.status().is_success() => {
                        tracing::debug!(status = %resp.status(), "gossip: webhook returned non-2xx");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "gossip: webhook delivery failed");
                    }
                    _ => {}
                }
            });
        }

        Ok(())
    }
}

fn summarize(payload: &alertd_core::AlertPayload) -> String {
    use alertd_core::AlertPayload::*;
    match payload {
        Informational { text } => format!("informational: {text}"),
        FreezeUtxo { funds } => format!("freeze {} utxo(s)", funds.len()),
        UnfreezeUtxo { funds } => format!("unfreeze {} utxo(s)", funds.len()),
        ConfiscateUtxo { .. } => "confiscate utxo".to_string(),
        BanPeer { .. } => "ban peer".to_string(),
        UnbanPeer { .. } => "unban peer".to_string(),
        InvalidateBlock { .. } => "invalidate block".to_string(),
        SetKeys { .. } => "rotate signing keys".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertd_core::keystore::MemoryKeyStore;
    use alertd_core::types::{AlertPayload, Envelope, ENVELOPE_VERSION};
    use alertd_core::{sign_compact, signed_digest, ConfiscationResult, ExecutionFailed, FundRecord};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use secp256k1::{Secp256k1, SecretKey};
    use std::collections::HashMap;

    /// Sign `env`'s body with `secrets`, returning the fully-formed envelope
    /// a real peer would have broadcast.
    fn signed(mut env: Envelope, secrets: &[SecretKey]) -> Envelope {
        let body = codec::body_bytes(&env);
        let digest = signed_digest(&body);
        env.signatures = secrets.iter().map(|s| sign_compact(s, &digest)).collect();
        env
    }

    fn genesis_secrets() -> Vec<SecretKey> {
        (1u8..=3).map(|b| SecretKey::from_slice(&[b; 32]).unwrap()).collect()
    }

    /// Public keys matching `genesis_secrets()`, in the shape `Verifier`
    /// checks signatures against (an unordered active set).
    fn genesis_public_keys(secrets: &[SecretKey]) -> Vec<[u8; 33]> {
        let secp = Secp256k1::new();
        secrets
            .iter()
            .map(|s| secp256k1::PublicKey::from_secret_key(&secp, s).serialize())
            .collect()
    }

    struct MockStore {
        rows: Mutex<HashMap<u32, AlertRow>>,
    }

    #[async_trait]
    impl AlertStore for MockStore {
        async fn append(&self, row: &AlertRow) -> Result<(), StoreError> {
            let mut rows = self.rows.lock();
            if rows.contains_key(&row.sequence) {
                return Err(StoreError::SequenceConflict(row.sequence));
            }
            rows.insert(row.sequence, row.clone());
            Ok(())
        }
        async fn get_by_sequence(&self, sequence: u32) -> Result<AlertRow, StoreError> {
            self.rows.lock().get(&sequence).cloned().ok_or(StoreError::NotFound(sequence))
        }
        async fn latest(&self) -> Result<AlertRow, StoreError> {
            self.rows.lock().values().max_by_key(|r| r.sequence).cloned().ok_or(StoreError::NotFound(0))
        }
        async fn all_unprocessed(&self) -> Result<Vec<AlertRow>, StoreError> {
            Ok(vec![])
        }
        async fn mark_processed(&self, _id: i64, _processed: bool) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct MockNode;

    #[async_trait]
    impl NodeRpc for MockNode {
        async fn ban_peer(&self, _peer: &str) -> Result<(), ExecutionFailed> {
            Ok(())
        }
        async fn unban_peer(&self, _peer: &str) -> Result<(), ExecutionFailed> {
            Ok(())
        }
        async fn invalidate_block(&self, _hash: &str) -> Result<(), ExecutionFailed> {
            Ok(())
        }
        async fn best_block_hash(&self) -> Result<String, ExecutionFailed> {
            Ok("00".repeat(32))
        }
        async fn add_to_consensus_blacklist(&self, _funds: &[FundRecord]) -> Result<(), ExecutionFailed> {
            Ok(())
        }
        async fn add_to_confiscation_whitelist(&self, _tx_hex: &str) -> Result<ConfiscationResult, ExecutionFailed> {
            Ok(ConfiscationResult::default())
        }
    }

    fn genesis_row() -> AlertRow {
        let now = chrono::Utc::now();
        AlertRow {
            id: 0,
            sequence: 0,
            hash: "genesis".into(),
            raw: "00".into(),
            processed: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn synced_peers() -> ConnectedPeers {
        let connected = ConnectedPeers::new();
        connected.record_success();
        connected.record_success();
        connected
    }

    fn intake<'a>(store: &'a MockStore, keystore: &'a MemoryKeyStore, node: &'a MockNode) -> GossipIntake<'a> {
        GossipIntake {
            store,
            keystore,
            node,
            connected: synced_peers(),
            local_peer_id: PeerId::random(),
            webhook_url: None,
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn drops_messages_before_connected_threshold() {
        let store = MockStore { rows: Mutex::new(HashMap::new()) };
        let keystore = MemoryKeyStore::new();
        let node = MockNode;
        let gi = GossipIntake {
            store: &store,
            keystore: &keystore,
            node: &node,
            connected: ConnectedPeers::new(),
            local_peer_id: PeerId::random(),
            webhook_url: None,
            http: reqwest::Client::new(),
        };
        let result = gi.handle_message(PeerId::random(), &[]).await;
        assert_eq!(result, Err(GossipDrop::NotConnected));
    }

    #[tokio::test]
    async fn drops_self_delivered_messages() {
        let store = MockStore { rows: Mutex::new(HashMap::new()) };
        let keystore = MemoryKeyStore::new();
        let node = MockNode;
        let gi = intake(&store, &keystore, &node);
        let result = gi.handle_message(gi.local_peer_id, &[]).await;
        assert_eq!(result, Err(GossipDrop::SelfDelivery));
    }

    #[tokio::test]
    async fn drops_out_of_order_messages() {
        let store = MockStore { rows: Mutex::new(HashMap::new()) };
        store.append(&genesis_row()).await.unwrap();
        let secrets = genesis_secrets();
        let keystore = MemoryKeyStore::new();
        keystore.rotate(&genesis_public_keys(&secrets), "genesis").await.unwrap();
        let node = MockNode;
        let gi = intake(&store, &keystore, &node);

        let env = Envelope {
            version: ENVELOPE_VERSION,
            sequence: 3,
            timestamp: 1,
            payload: AlertPayload::Informational { text: "x".into() },
            signatures: vec![],
        };
        let env = signed(env, &secrets);
        let data = codec::encode(&env);
        let result = gi.handle_message(PeerId::random(), &data).await;
        assert_eq!(result, Err(GossipDrop::OutOfOrder));
    }

    #[tokio::test]
    async fn drops_duplicate_messages() {
        let store = MockStore { rows: Mutex::new(HashMap::new()) };
        store.append(&genesis_row()).await.unwrap();
        let existing = AlertRow {
            sequence: 1,
            ..genesis_row()
        };
        store.append(&existing).await.unwrap();
        let secrets = genesis_secrets();
        let keystore = MemoryKeyStore::new();
        keystore.rotate(&genesis_public_keys(&secrets), "genesis").await.unwrap();
        let node = MockNode;
        let gi = intake(&store, &keystore, &node);

        let env = Envelope {
            version: ENVELOPE_VERSION,
            sequence: 1,
            timestamp: 1,
            payload: AlertPayload::Informational { text: "x".into() },
            signatures: vec![],
        };
        let env = signed(env, &secrets);
        let data = codec::encode(&env);
        let result = gi.handle_message(PeerId::random(), &data).await;
        assert_eq!(result, Err(GossipDrop::Duplicate));
    }

    #[tokio::test]
    async fn drops_malformed_messages() {
        let store = MockStore { rows: Mutex::new(HashMap::new()) };
        let keystore = MemoryKeyStore::new();
        let node = MockNode;
        let gi = intake(&store, &keystore, &node);
        let result = gi.handle_message(PeerId::random(), &[0u8; 3]).await;
        assert!(matches!(result, Err(GossipDrop::Malformed(_))));
    }
}
