//! Dispatches each alert payload's side effect against the Bitcoin node RPC
//! or, for `SetKeys`, the Keystore.

use crate::keystore::{KeyStore, KeyStoreError};
use crate::types::{AlertPayload, FundRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionFailed {
    #[error("node rpc call failed: {0}")]
    Rpc(String),

    #[error("node reported {count} transaction(s) not processed")]
    NotProcessed { count: usize },

    #[error("key rotation failed: {0}")]
    KeyRotation(#[from] KeyStoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotProcessedEntry {
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfiscationResult {
    #[serde(rename = "NotProcessed", default)]
    pub not_processed: Vec<NotProcessedEntry>,
}

/// Capability trait over the Bitcoin node's RPC surface. Kept
/// free of any particular HTTP/JSON framing so it stays mockable in tests.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn ban_peer(&self, peer: &str) -> Result<(), ExecutionFailed>;
    async fn unban_peer(&self, peer: &str) -> Result<(), ExecutionFailed>;
    async fn invalidate_block(&self, hash: &str) -> Result<(), ExecutionFailed>;
    async fn best_block_hash(&self) -> Result<String, ExecutionFailed>;
    async fn add_to_consensus_blacklist(&self, funds: &[FundRecord]) -> Result<(), ExecutionFailed>;
    async fn add_to_confiscation_whitelist(
        &self,
        tx_hex: &str,
    ) -> Result<ConfiscationResult, ExecutionFailed>;
}

/// Plain JSON-RPC 1.0 client over HTTP basic auth, the shape every
/// Bitcoin-family daemon's RPC server exposes.
pub struct JsonRpcNodeClient {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl JsonRpcNodeClient {
    pub fn new(endpoint: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ExecutionFailed> {
        #[derive(Serialize)]
        struct Req<'a> {
            jsonrpc: &'a str,
            id: u32,
            method: &'a str,
            params: Value,
        }
        #[derive(Deserialize)]
        struct Resp {
            result: Value,
            error: Option<Value>,
        }

        let body = Req {
            jsonrpc: "1.0",
            id: 1,
            method,
            params,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecutionFailed::Rpc(e.to_string()))?;

        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| ExecutionFailed::Rpc(e.to_string()))?;

        if let Some(err) = parsed.error {
            if !err.is_null() {
                return Err(ExecutionFailed::Rpc(err.to_string()));
            }
        }
        Ok(parsed.result)
    }
}

#[async_trait]
impl NodeRpc for JsonRpcNodeClient {
    async fn ban_peer(&self, peer: &str) -> Result<(), ExecutionFailed> {
        self.call("setban", serde_json::json!([peer, "add"])).await?;
        Ok(())
    }

    async fn unban_peer(&self, peer: &str) -> Result<(), ExecutionFailed> {
        self.call("setban", serde_json::json!([peer, "remove"])).await?;
        Ok(())
    }

    async fn invalidate_block(&self, hash: &str) -> Result<(), ExecutionFailed> {
        self.call("invalidateblock", serde_json::json!([hash])).await?;
        Ok(())
    }

    async fn best_block_hash(&self) -> Result<String, ExecutionFailed> {
        let result = self.call("getbestblockhash", serde_json::json!([])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExecutionFailed::Rpc("getbestblockhash returned non-string".into()))
    }

    async fn add_to_consensus_blacklist(&self, funds: &[FundRecord]) -> Result<(), ExecutionFailed> {
        let entries: Vec<Value> = funds
            .iter()
            .map(|f| {
                serde_json::json!({
                    "txId": hex::encode(f.txid),
                    "vout": f.vout,
                    "enforceAtHeight": [{
                        "start": f.enforce_at_height_start,
                        "stop": f.enforce_at_height_end,
                    }],
                    "policyExpiresWithConsensus": f.expires_with_consensus,
                })
            })
            .collect();
        self.call(
            "addToConsensusBlacklist",
            serde_json::json!({ "funds": entries }),
        )
        .await?;
        Ok(())
    }

    async fn add_to_confiscation_whitelist(
        &self,
        tx_hex: &str,
    ) -> Result<ConfiscationResult, ExecutionFailed> {
        let result = self
            .call(
                "addToConfiscationTransactionWhitelist",
                serde_json::json!({ "confiscationTxs": [{ "confiscationTx": { "txHex": tx_hex } }] }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ExecutionFailed::Rpc(format!("unexpected response shape: {e}")))
    }
}

/// Everything `Executor::execute` needs besides the payload itself.
pub struct ExecutorCtx<'a> {
    pub node: &'a dyn NodeRpc,
    pub keystore: &'a dyn KeyStore,
    pub alert_hash: &'a str,
}

pub struct Executor;

impl Executor {
    /// Dispatch one payload's side effect.
    pub async fn execute(payload: &AlertPayload, ctx: &ExecutorCtx<'_>) -> Result<(), ExecutionFailed> {
        match payload {
            AlertPayload::Informational { text } => {
                tracing::info!(alert_text = %text, "informational alert");
                Ok(())
            }
            AlertPayload::FreezeUtxo { funds } | AlertPayload::UnfreezeUtxo { funds } => {
                ctx.node.add_to_consensus_blacklist(funds).await
            }
            AlertPayload::ConfiscateUtxo { tx_hex, .. } => {
                let result = ctx.node.add_to_confiscation_whitelist(tx_hex).await?;
                if !result.not_processed.is_empty() {
                    return Err(ExecutionFailed::NotProcessed {
                        count: result.not_processed.len(),
                    });
                }
                Ok(())
            }
            AlertPayload::BanPeer { peer, .. } => {
                ctx.node.ban_peer(&String::from_utf8_lossy(peer)).await
            }
            AlertPayload::UnbanPeer { peer, .. } => {
                ctx.node.unban_peer(&String::from_utf8_lossy(peer)).await
            }
            AlertPayload::InvalidateBlock { block_hash, .. } => {
                ctx.node.invalidate_block(&hex::encode(block_hash)).await
            }
            AlertPayload::SetKeys { keys } => {
                ctx.keystore.rotate(keys, ctx.alert_hash).await?;
                Ok(())
            }
        }
    }
}
