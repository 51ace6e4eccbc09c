//! The current set of authorized signing keys, and atomic rotation.

use crate::types::{PublicKeyRow, COMPRESSED_PUBKEY_LEN};
use async_trait::async_trait;
use sqlx::AnyPool;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key rotation failed: {0}")]
    KeyRotationFailed(String),

    #[error("datastore error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A 33-byte compressed secp256k1 public key.
pub type PublicKey = [u8; COMPRESSED_PUBKEY_LEN];

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// The currently active key set. Unordered.
    async fn active_keys(&self) -> Result<HashSet<PublicKey>, KeyStoreError>;

    /// Replace the active set atomically: every previously-active key is
    /// deactivated, every key in `keys` is upserted active, all within one
    /// transaction. `asserted_by_hash` is the hex hash of the SetKeys alert
    /// that authorized this rotation.
    async fn rotate(
        &self,
        keys: &[PublicKey],
        asserted_by_hash: &str,
    ) -> Result<(), KeyStoreError>;
}

/// SQL-backed keystore over the `public_keys` table.
pub struct SqlKeyStore {
    pool: AnyPool,
    table: String,
}

impl SqlKeyStore {
    pub fn new(pool: AnyPool, table_prefix: &str) -> Self {
        Self {
            pool,
            table: format!("{table_prefix}public_keys"),
        }
    }
}

#[async_trait]
impl KeyStore for SqlKeyStore {
    async fn active_keys(&self) -> Result<HashSet<PublicKey>, KeyStoreError> {
        let query = format!("SELECT key FROM {} WHERE active = true", self.table);
        let rows: Vec<(String,)> = sqlx::query_as(&query).fetch_all(&self.pool).await?;
        let mut out = HashSet::with_capacity(rows.len());
        for (hex_key,) in rows {
            let bytes = hex::decode(&hex_key)
                .map_err(|e| KeyStoreError::KeyRotationFailed(e.to_string()))?;
            let key: PublicKey = bytes
                .try_into()
                .map_err(|_| KeyStoreError::KeyRotationFailed("stored key has wrong length".into()))?;
            out.insert(key);
        }
        Ok(out)
    }

    async fn rotate(
        &self,
        keys: &[PublicKey],
        asserted_by_hash: &str,
    ) -> Result<(), KeyStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KeyStoreError::KeyRotationFailed(e.to_string()))?;

        let deactivate = format!("UPDATE {} SET active = false", self.table);
        sqlx::query(&deactivate)
            .execute(&mut *tx)
            .await
            .map_err(|e| KeyStoreError::KeyRotationFailed(e.to_string()))?;

        let insert = format!(
            "INSERT INTO {} (key, active, last_update_hash) VALUES ($1, true, $2)",
            self.table
        );
        for key in keys {
            sqlx::query(&insert)
                .bind(hex::encode(key))
                .bind(asserted_by_hash)
                .execute(&mut *tx)
                .await
                .map_err(|e| KeyStoreError::KeyRotationFailed(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| KeyStoreError::KeyRotationFailed(e.to_string()))?;
        Ok(())
    }
}

/// In-memory keystore for unit tests; not used by the shipped binary.
#[derive(Default)]
pub struct MemoryKeyStore {
    inner: parking_lot::RwLock<MemoryKeyStoreState>,
}

#[derive(Default)]
struct MemoryKeyStoreState {
    active: HashSet<PublicKey>,
    history: Vec<PublicKeyRow>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<PublicKeyRow> {
        self.inner.read().history.clone()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn active_keys(&self) -> Result<HashSet<PublicKey>, KeyStoreError> {
        Ok(self.inner.read().active.clone())
    }

    async fn rotate(
        &self,
        keys: &[PublicKey],
        asserted_by_hash: &str,
    ) -> Result<(), KeyStoreError> {
        let mut state = self.inner.write();
        state.active.clear();
        state.active.extend(keys.iter().copied());
        let now = chrono::DateTime::<chrono::Utc>::default();
        for key in keys {
            state.history.push(PublicKeyRow {
                id: state.history.len() as i64,
                key: hex::encode(key),
                active: true,
                last_update_hash: asserted_by_hash.to_string(),
                created_at: now,
                updated_at: now,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_keystore_rotate_replaces_active_set() {
        let store = MemoryKeyStore::new();
        let keys_a = vec![[1u8; COMPRESSED_PUBKEY_LEN]; 5];
        store.rotate(&keys_a, "hash-a").await.unwrap();
        assert_eq!(store.active_keys().await.unwrap().len(), 5);

        let keys_b = vec![[2u8; COMPRESSED_PUBKEY_LEN]; 5];
        store.rotate(&keys_b, "hash-b").await.unwrap();
        let active = store.active_keys().await.unwrap();
        assert_eq!(active.len(), 5);
        assert!(active.contains(&[2u8; COMPRESSED_PUBKEY_LEN]));
        assert!(!active.contains(&[1u8; COMPRESSED_PUBKEY_LEN]));
    }

    #[tokio::test]
    async fn memory_keystore_starts_empty() {
        let store = MemoryKeyStore::new();
        assert!(store.active_keys().await.unwrap().is_empty());
    }
}
