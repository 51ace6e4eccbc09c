//! The pairwise sync protocol: a framed, symmetric,
//! stream-oriented exchange that brings a lagging peer's log prefix up to
//! the other side's latest sequence.
//!
//! Frames are varint-length-prefixed (`unsigned_varint`'s
//! `asynchronous_codec` integration, the same framing discipline libp2p
//! itself uses for multistream-select), carrying a small fixed message
//! grammar: 1-byte `kind`, optional 4-byte little-endian `sequence`,
//! optional tail `data`.

use alertd_core::{
    codec, AlertRow, AlertStore, CodecError, Executor, ExecutorCtx, KeyStore, NodeRpc, StoreError,
    VerifyError, Verifier,
};
use asynchronous_codec::Framed;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{AsyncRead, AsyncWrite, SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use unsigned_varint::codec::UviBytes;

pub const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

const KIND_WANT_LATEST: u8 = 0x01;
const KIND_WANT_SEQUENCE: u8 = 0x02;
const KIND_GOT_SEQUENCE: u8 = 0x03;
const KIND_GOT_LATEST: u8 = 0x04;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("stream closed before the session completed")]
    StreamClosed,

    #[error("frame transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed sync message: {0}")]
    MalformedMessage(String),

    #[error("protocol abort: {0}")]
    ProtocolAbort(String),

    #[error("session exceeded the {0:?} timeout")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<CodecError> for SyncError {
    fn from(e: CodecError) -> Self {
        SyncError::ProtocolAbort(format!("codec: {e}"))
    }
}

impl From<VerifyError> for SyncError {
    fn from(e: VerifyError) -> Self {
        SyncError::ProtocolAbort(format!("verify: {e}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SyncMessage {
    WantLatest,
    WantSequence(u32),
    GotSequence { sequence: u32, data: Vec<u8> },
    GotLatest { sequence: u32, data: Vec<u8> },
}

fn encode_message(msg: &SyncMessage) -> Bytes {
    let mut out = BytesMut::new();
    match msg {
        SyncMessage::WantLatest => out.put_u8(KIND_WANT_LATEST),
        SyncMessage::WantSequence(seq) => {
            out.put_u8(KIND_WANT_SEQUENCE);
            out.put_u32_le(*seq);
        }
        SyncMessage::GotSequence { sequence, data } => {
            out.put_u8(KIND_GOT_SEQUENCE);
            out.put_u32_le(*sequence);
            out.put_slice(data);
        }
        SyncMessage::GotLatest { sequence, data } => {
            out.put_u8(KIND_GOT_LATEST);
            out.put_u32_le(*sequence);
            out.put_slice(data);
        }
    }
    out.freeze()
}

fn decode_message(mut frame: BytesMut) -> Result<SyncMessage, SyncError> {
    if frame.is_empty() {
        return Err(SyncError::MalformedMessage("empty frame".into()));
    }
    let kind = frame.get_u8();
    match kind {
        KIND_WANT_LATEST => Ok(SyncMessage::WantLatest),
        KIND_WANT_SEQUENCE => {
            if frame.len() < 4 {
                return Err(SyncError::MalformedMessage("WantSequence missing sequence".into()));
            }
            Ok(SyncMessage::WantSequence(frame.get_u32_le()))
        }
        KIND_GOT_SEQUENCE | KIND_GOT_LATEST => {
            if frame.len() < 4 {
                return Err(SyncError::MalformedMessage("missing sequence".into()));
            }
            let sequence = frame.get_u32_le();
            let data = frame.to_vec();
            if kind == KIND_GOT_SEQUENCE {
                Ok(SyncMessage::GotSequence { sequence, data })
            } else {
                Ok(SyncMessage::GotLatest { sequence, data })
            }
        }
        other => Err(SyncError::MalformedMessage(format!("unknown kind {other}"))),
    }
}

/// Everything a sync session needs from the engine. Borrowed for the
/// session's lifetime; no session ever holds a database transaction
/// across the stream's awaits.
pub struct SyncCtx<'a> {
    pub store: &'a dyn AlertStore,
    pub keystore: &'a dyn KeyStore,
    pub node: &'a dyn NodeRpc,
}

async fn send<S>(framed: &mut Framed<S, UviBytes<Bytes>>, msg: SyncMessage) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(encode_message(&msg))
        .await
        .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

async fn recv<S>(framed: &mut Framed<S, UviBytes<Bytes>>) -> Result<SyncMessage, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed
        .next()
        .await
        .ok_or(SyncError::StreamClosed)?
        .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    decode_message(BytesMut::from(&frame[..]))
}

/// Run the identical handler-side state machine as the initiator.
/// `is_initiator` only controls whether `WantLatest` is sent before
/// entering the receive loop.
async fn run_session<S>(stream: S, is_initiator: bool, ctx: &SyncCtx<'_>) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, UviBytes::<Bytes>::default());

    let mut my_latest_row = ctx.store.latest().await?;
    let mut my_latest = my_latest_row.sequence;
    let mut peer_latest: Option<u32> = None;

    if is_initiator {
        send(&mut framed, SyncMessage::WantLatest).await?;
    }

    loop {
        let message = recv(&mut framed).await?;
        match message {
            SyncMessage::WantLatest => {
                let data = hex::decode(&my_latest_row.raw)
                    .map_err(|e| SyncError::MalformedMessage(e.to_string()))?;
                send(
                    &mut framed,
                    SyncMessage::GotLatest {
                        sequence: my_latest,
                        data,
                    },
                )
                .await?;
            }
            SyncMessage::GotLatest { sequence, .. } => {
                if sequence < my_latest {
                    return Ok(());
                }
                if sequence == my_latest {
                    return Ok(());
                }
                peer_latest = Some(sequence);
                send(&mut framed, SyncMessage::WantSequence(my_latest + 1)).await?;
            }
            SyncMessage::WantSequence(n) => {
                let row = ctx.store.get_by_sequence(n).await.map_err(|e| {
                    SyncError::ProtocolAbort(format!("peer requested unknown sequence {n}: {e}"))
                })?;
                let data = hex::decode(&row.raw)
                    .map_err(|e| SyncError::MalformedMessage(e.to_string()))?;
                send(
                    &mut framed,
                    SyncMessage::GotSequence { sequence: n, data },
                )
                .await?;
                if n == my_latest {
                    return Ok(());
                }
            }
            SyncMessage::GotSequence { sequence, data } => {
                let envelope = codec::decode(&data)?;
                let active = ctx.keystore.active_keys().await.map_err(|e| {
                    SyncError::ProtocolAbort(format!("keystore: {e}"))
                })?;
                Verifier::verify(&envelope, &active)?;

                if sequence != my_latest + 1 {
                    return Err(SyncError::ProtocolAbort(format!(
                        "expected sequence {}, got {sequence}",
                        my_latest + 1
                    )));
                }

                let hash = hex::encode(codec::envelope_hash(&envelope));
                let exec_ctx = ExecutorCtx {
                    node: ctx.node,
                    keystore: ctx.keystore,
                    alert_hash: &hash,
                };
                let processed = match Executor::execute(&envelope.payload, &exec_ctx).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(sequence, error = %e, "sync: execution failed during catch-up");
                        false
                    }
                };

                let now = chrono::Utc::now();
                let row = AlertRow {
                    id: 0,
                    sequence,
                    hash,
                    raw: hex::encode(&data),
                    processed,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                match ctx.store.append(&row).await {
                    Ok(()) => {}
                    Err(StoreError::SequenceConflict(_)) => {
                        // A concurrent writer already appended this sequence;
                        // benign, resolved by the tie-break rule below.
                        return Ok(());
                    }
                    Err(e) => return Err(SyncError::Store(e)),
                }

                my_latest = sequence;
                my_latest_row = ctx.store.get_by_sequence(sequence).await?;
                if Some(my_latest) == peer_latest {
                    return Ok(());
                }
                send(&mut framed, SyncMessage::WantSequence(my_latest + 1)).await?;
            }
        }
    }
}

/// Drive the initiator side of a sync session: read our local latest
/// sequence, send `WantLatest`, then run the shared state machine.
pub async fn drive_initiator<S>(stream: S, ctx: &SyncCtx<'_>) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(SESSION_TIMEOUT, run_session(stream, true, ctx))
        .await
        .map_err(|_| SyncError::Timeout(SESSION_TIMEOUT))?
}

/// Drive the responder side: wait for the peer's first message, then run
/// the shared state machine.
pub async fn drive_responder<S>(stream: S, ctx: &SyncCtx<'_>) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(SESSION_TIMEOUT, run_session(stream, false, ctx))
        .await
        .map_err(|_| SyncError::Timeout(SESSION_TIMEOUT))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_want_latest() {
        let msg = SyncMessage::WantLatest;
        let bytes = encode_message(&msg);
        assert_eq!(decode_message(BytesMut::from(&bytes[..])).unwrap(), msg);
    }

    #[test]
    fn round_trips_want_sequence() {
        let msg = SyncMessage::WantSequence(42);
        let bytes = encode_message(&msg);
        assert_eq!(decode_message(BytesMut::from(&bytes[..])).unwrap(), msg);
    }

    #[test]
    fn round_trips_got_sequence() {
        let msg = SyncMessage::GotSequence {
            sequence: 7,
            data: vec![1, 2, 3, 4],
        };
        let bytes = encode_message(&msg);
        assert_eq!(decode_message(BytesMut::from(&bytes[..])).unwrap(), msg);
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(decode_message(BytesMut::new()).is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xEE);
        assert!(decode_message(buf).is_err());
    }

    #[test]
    fn rejects_truncated_want_sequence() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_WANT_SEQUENCE);
        buf.put_u8(0x01); // only one byte of the 4-byte sequence
        assert!(decode_message(buf).is_err());
    }

    mod catch_up {
        use super::*;
        use alertd_core::{
            sign_compact, signed_digest, AlertPayload, ConfiscationResult, Envelope, ExecutionFailed,
            FundRecord, KeyStore, MemoryKeyStore, ENVELOPE_VERSION,
        };
        use async_trait::async_trait;
        use parking_lot::Mutex;
        use secp256k1::{Secp256k1, SecretKey};
        use std::collections::HashMap;

        struct MemoryStore {
            rows: Mutex<HashMap<u32, AlertRow>>,
        }

        impl MemoryStore {
            fn new() -> Self {
                Self {
                    rows: Mutex::new(HashMap::new()),
                }
            }
        }

        #[async_trait]
        impl AlertStore for MemoryStore {
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

        struct NoopNode;

        #[async_trait]
        impl NodeRpc for NoopNode {
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

        fn signed_row(sequence: u32, secrets: &[SecretKey]) -> AlertRow {
            let mut env = Envelope {
                version: ENVELOPE_VERSION,
                sequence,
                timestamp: 1_706_740_583,
                payload: AlertPayload::Informational {
                    text: format!("alert {sequence}"),
                },
                signatures: vec![],
            };
            let body = codec::body_bytes(&env);
            let digest = signed_digest(&body);
            env.signatures = secrets.iter().map(|s| sign_compact(s, &digest)).collect();
            let now = chrono::Utc::now();
            AlertRow {
                id: sequence as i64,
                sequence,
                hash: hex::encode(codec::envelope_hash(&env)),
                raw: hex::encode(codec::encode(&env)),
                processed: true,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            }
        }

        /// Peer A's log ends at sequence 5, peer B's at sequence 2. B opens a
        /// stream and catches up to A's latest, matching the end-to-end sync
        /// scenario: after the session both logs agree through sequence 5 and
        /// B's side of the stream closes on its own.
        #[tokio::test]
        async fn behind_peer_catches_up_to_ahead_peer() {
            let secrets: Vec<SecretKey> =
                (1u8..=3).map(|b| SecretKey::from_slice(&[b; 32]).unwrap()).collect();
            let secp = Secp256k1::new();
            let active_keys: Vec<[u8; 33]> = secrets
                .iter()
                .map(|s| secp256k1::PublicKey::from_secret_key(&secp, s).serialize())
                .collect();

            let store_a = MemoryStore::new();
            let store_b = MemoryStore::new();
            for seq in 0..=5 {
                store_a.append(&signed_row(seq, &secrets)).await.unwrap();
            }
            for seq in 0..=2 {
                store_b.append(&signed_row(seq, &secrets)).await.unwrap();
            }

            let keystore_a = MemoryKeyStore::new();
            keystore_a.rotate(&active_keys, "genesis").await.unwrap();
            let keystore_b = MemoryKeyStore::new();
            keystore_b.rotate(&active_keys, "genesis").await.unwrap();

            let node_a = NoopNode;
            let node_b = NoopNode;

            let ctx_a = SyncCtx {
                store: &store_a,
                keystore: &keystore_a,
                node: &node_a,
            };
            let ctx_b = SyncCtx {
                store: &store_b,
                keystore: &keystore_b,
                node: &node_b,
            };

            let (stream_a, stream_b) = futures::io::duplex(4096);
            let (result_a, result_b) =
                futures::future::join(drive_responder(stream_a, &ctx_a), drive_initiator(stream_b, &ctx_b))
                    .await;
            result_a.unwrap();
            result_b.unwrap();

            assert_eq!(store_b.latest().await.unwrap().sequence, 5);
            assert_eq!(store_a.latest().await.unwrap().sequence, 5);
            for seq in 0..=5 {
                assert_eq!(
                    store_b.get_by_sequence(seq).await.unwrap().hash,
                    store_a.get_by_sequence(seq).await.unwrap().hash
                );
            }
        }
    }
}
