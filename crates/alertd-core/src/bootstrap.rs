//! Genesis bootstrap: the synthetic SetKeys alert at sequence 0 that seeds
//! the Keystore, signing a fixed-shape SetKeys payload with
//! operator-supplied keys at a fixed timestamp.

use crate::codec;
use crate::keystore::{KeyStore, PublicKey};
use crate::store::{AlertStore, StoreError};
use crate::types::{AlertPayload, AlertRow, Envelope, ENVELOPE_VERSION, SET_KEYS_COUNT};
use crate::verifier::{sign_compact, signed_digest};
use secp256k1::SecretKey;
use thiserror::Error;

/// Unix seconds used for every genesis envelope, matching the source's
/// convention of a fixed bootstrap timestamp rather than wall-clock time
/// (so independently-bootstrapped nodes agree on the genesis hash).
pub const GENESIS_TIMESTAMP: u64 = 1_231_006_505;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("genesis signing key set is empty")]
    NoGenesisSecrets,

    #[error("store error during bootstrap: {0}")]
    Store(#[from] StoreError),

    #[error("keystore error during bootstrap: {0}")]
    KeyStore(#[from] crate::keystore::KeyStoreError),
}

/// Run genesis bootstrap if `get_by_sequence(0)` is absent. Constructs the
/// version-1 SetKeys envelope from `genesis_public_keys`, signs it with
/// `genesis_secrets`, seeds the keystore directly (no `Verifier` call,
/// since nothing is active yet to verify against), and appends the row with
/// `processed = true`. No-op if genesis already exists.
pub async fn bootstrap(
    store: &dyn AlertStore,
    keystore: &dyn KeyStore,
    genesis_public_keys: [PublicKey; SET_KEYS_COUNT],
    genesis_secrets: &[SecretKey],
) -> Result<(), BootstrapError> {
    if store.get_by_sequence(0).await.is_ok() {
        return Ok(());
    }
    if genesis_secrets.is_empty() {
        return Err(BootstrapError::NoGenesisSecrets);
    }

    let mut envelope = Envelope {
        version: ENVELOPE_VERSION,
        sequence: 0,
        timestamp: GENESIS_TIMESTAMP,
        payload: AlertPayload::SetKeys {
            keys: genesis_public_keys,
        },
        signatures: vec![],
    };

    let body = codec::body_bytes(&envelope);
    let digest = signed_digest(&body);
    envelope.signatures = genesis_secrets
        .iter()
        .map(|secret| sign_compact(secret, &digest))
        .collect();

    let hash = hex::encode(codec::envelope_hash(&envelope));

    keystore.rotate(&genesis_public_keys, &hash).await?;

    let now = chrono::Utc::now();
    let row = AlertRow {
        id: 0,
        sequence: 0,
        hash,
        raw: hex::encode(codec::encode(&envelope)),
        processed: true,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    store.append(&row).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;
    use crate::types::COMPRESSED_PUBKEY_LEN;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use secp256k1::Secp256k1;
    use std::collections::HashMap;

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
            self.rows
                .lock()
                .get(&sequence)
                .cloned()
                .ok_or(StoreError::NotFound(sequence))
        }
        async fn latest(&self) -> Result<AlertRow, StoreError> {
            self.rows
                .lock()
                .values()
                .max_by_key(|r| r.sequence)
                .cloned()
                .ok_or(StoreError::NotFound(0))
        }
        async fn all_unprocessed(&self) -> Result<Vec<AlertRow>, StoreError> {
            Ok(vec![])
        }
        async fn mark_processed(&self, _id: i64, _processed: bool) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn bootstrap_seeds_keystore_and_genesis_row() {
        let store = MockStore {
            rows: Mutex::new(HashMap::new()),
        };
        let keystore = MemoryKeyStore::new();
        let secp = Secp256k1::new();
        let secrets: Vec<SecretKey> = (1u8..=3)
            .map(|b| SecretKey::from_slice(&[b; 32]).unwrap())
            .collect();
        let pubkeys: [PublicKey; SET_KEYS_COUNT] = {
            let mut keys = [[0u8; COMPRESSED_PUBKEY_LEN]; SET_KEYS_COUNT];
            for (i, key) in keys.iter_mut().enumerate() {
                let secret = SecretKey::from_slice(&[(i as u8) + 10; 32]).unwrap();
                *key = secp256k1::PublicKey::from_secret_key(&secp, &secret).serialize();
            }
            keys
        };

        bootstrap(&store, &keystore, pubkeys, &secrets).await.unwrap();

        let genesis = store.get_by_sequence(0).await.unwrap();
        assert!(genesis.processed);
        assert_eq!(keystore.active_keys().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn bootstrap_is_noop_when_genesis_already_exists() {
        let store = MockStore {
            rows: Mutex::new(HashMap::new()),
        };
        let existing = AlertRow {
            id: 0,
            sequence: 0,
            hash: "preexisting".into(),
            raw: "00".into(),
            processed: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        };
        store.append(&existing).await.unwrap();

        let keystore = MemoryKeyStore::new();
        let secrets = vec![SecretKey::from_slice(&[1u8; 32]).unwrap()];
        let pubkeys = [[0u8; COMPRESSED_PUBKEY_LEN]; SET_KEYS_COUNT];

        bootstrap(&store, &keystore, pubkeys, &secrets).await.unwrap();

        // Untouched: no rotate happened, existing genesis row preserved.
        assert!(keystore.active_keys().await.unwrap().is_empty());
        assert_eq!(store.get_by_sequence(0).await.unwrap().hash, "preexisting");
    }
}
