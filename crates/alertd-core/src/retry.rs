//! Periodically re-drives alerts whose side effect previously failed.

use crate::codec;
use crate::executor::{Executor, ExecutorCtx, NodeRpc};
use crate::keystore::KeyStore;
use crate::store::AlertStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct RetryScheduler {
    store: Arc<dyn AlertStore>,
    node: Arc<dyn NodeRpc>,
    keystore: Arc<dyn KeyStore>,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn AlertStore>,
        node: Arc<dyn NodeRpc>,
        keystore: Arc<dyn KeyStore>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            node,
            keystore,
            interval,
        }
    }

    /// Run until `shutdown` fires. A single cooperative task; never runs
    /// two ticks concurrently.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("retry scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Run a single retry pass. Exposed for tests driving the scheduler
    /// deterministically instead of waiting on the ticker.
    pub async fn tick(&self) {
        let rows = match self.store.all_unprocessed().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "retry: failed to list unprocessed alerts");
                return;
            }
        };

        for row in rows {
            let raw = match hex::decode(&row.raw) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(sequence = row.sequence, error = %e, "retry: row raw is not valid hex");
                    continue;
                }
            };
            let envelope = match codec::decode(&raw) {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(sequence = row.sequence, error = %e, "retry: stored envelope failed to decode");
                    continue;
                }
            };

            let ctx = ExecutorCtx {
                node: self.node.as_ref(),
                keystore: self.keystore.as_ref(),
                alert_hash: &row.hash,
            };

            match Executor::execute(&envelope.payload, &ctx).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_processed(row.id, true).await {
                        tracing::warn!(sequence = row.sequence, error = %e, "retry: failed to mark processed");
                    }
                }
                Err(e) => {
                    tracing::warn!(sequence = row.sequence, error = %e, "retry: execution failed again");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ConfiscationResult, ExecutionFailed};
    use crate::keystore::MemoryKeyStore;
    use crate::store::StoreError;
    use crate::types::{AlertPayload, AlertRow, Envelope, FundRecord, ENVELOPE_VERSION};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MockStore {
        rows: Mutex<HashMap<i64, AlertRow>>,
    }

    #[async_trait]
    impl AlertStore for MockStore {
        async fn append(&self, row: &AlertRow) -> Result<(), StoreError> {
            self.rows.lock().insert(row.id, row.clone());
            Ok(())
        }
        async fn get_by_sequence(&self, sequence: u32) -> Result<AlertRow, StoreError> {
            self.rows
                .lock()
                .values()
                .find(|r| r.sequence == sequence)
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
            let mut rows: Vec<_> = self
                .rows
                .lock()
                .values()
                .filter(|r| !r.processed)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.sequence);
            Ok(rows)
        }
        async fn mark_processed(&self, id: i64, processed: bool) -> Result<(), StoreError> {
            if let Some(row) = self.rows.lock().get_mut(&id) {
                row.processed = processed;
            }
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
        async fn add_to_confiscation_whitelist(
            &self,
            _tx_hex: &str,
        ) -> Result<ConfiscationResult, ExecutionFailed> {
            Ok(ConfiscationResult::default())
        }
    }

    fn unprocessed_row(sequence: u32) -> AlertRow {
        let env = Envelope {
            version: ENVELOPE_VERSION,
            sequence,
            timestamp: 1_700_000_000,
            payload: AlertPayload::InvalidateBlock {
                block_hash: [1u8; 32],
                reason: b"bad".to_vec(),
            },
            signatures: vec![],
        };
        let raw = hex::encode(codec::encode(&env));
        let hash = hex::encode(codec::envelope_hash(&env));
        let now = chrono::DateTime::<chrono::Utc>::default();
        AlertRow {
            id: sequence as i64,
            sequence,
            hash,
            raw,
            processed: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn tick_marks_successfully_executed_rows_processed() {
        let store = Arc::new(MockStore {
            rows: Mutex::new(HashMap::new()),
        });
        store.append(&unprocessed_row(1)).await.unwrap();

        let scheduler = RetryScheduler::new(
            store.clone(),
            Arc::new(MockNode),
            Arc::new(MemoryKeyStore::new()),
            Duration::from_secs(1),
        );
        scheduler.tick().await;

        let row = store.get_by_sequence(1).await.unwrap();
        assert!(row.processed);
    }
}
