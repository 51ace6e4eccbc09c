//! Wire codec: `encode`/`decode` between [`Envelope`](crate::types::Envelope)
//! and the little-endian binary wire form.
//!
//! Varints follow Bitcoin's CompactSize convention, since the payload
//! grammars (txid, vout, tx-hex) are themselves Bitcoin primitives.

use crate::types::*;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("envelope too short: need at least {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },

    #[error("unknown alert type {0}")]
    UnknownAlertType(u32),

    #[error("payload length {actual} invalid for this type (expected {expected})")]
    BadPayloadLength { expected: String, actual: usize },

    #[error("varint-declared length {declared} exceeds remaining buffer ({remaining})")]
    VarintOverrun { declared: u64, remaining: usize },

    #[error("reason field must be non-empty")]
    EmptyReason,

    #[error("buffer ended while reading varint")]
    TruncatedVarint,

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

const HEADER_LEN: usize = 20;

/// Double-SHA256, used both as the signed digest and the log's row key.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let first = *buf.get(*pos).ok_or(CodecError::TruncatedVarint)?;
    *pos += 1;
    match first {
        0..=0xfc => Ok(first as u64),
        0xfd => {
            let bytes = buf
                .get(*pos..*pos + 2)
                .ok_or(CodecError::TruncatedVarint)?;
            *pos += 2;
            Ok(u16::from_le_bytes(bytes.try_into().unwrap()) as u64)
        }
        0xfe => {
            let bytes = buf
                .get(*pos..*pos + 4)
                .ok_or(CodecError::TruncatedVarint)?;
            *pos += 4;
            Ok(u32::from_le_bytes(bytes.try_into().unwrap()) as u64)
        }
        0xff => {
            let bytes = buf
                .get(*pos..*pos + 8)
                .ok_or(CodecError::TruncatedVarint)?;
            *pos += 8;
            Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
        }
    }
}

fn write_varint(out: &mut Vec<u8>, v: u64) {
    if v <= 0xfc {
        out.push(v as u8);
    } else if v <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(v as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn read_varbytes<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], CodecError> {
    let len = read_varint(buf, pos)?;
    let remaining = buf.len() - *pos;
    if len > remaining as u64 {
        return Err(CodecError::VarintOverrun {
            declared: len,
            remaining,
        });
    }
    let start = *pos;
    *pos += len as usize;
    Ok(&buf[start..*pos])
}

fn write_varbytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn decode_payload(alert_type: u32, body: &[u8]) -> Result<AlertPayload, CodecError> {
    match alert_type {
        1 => {
            let mut pos = 0usize;
            let text_bytes = read_varbytes(body, &mut pos)?;
            let text = std::str::from_utf8(text_bytes)
                .map_err(|_| CodecError::InvalidUtf8)?
                .to_string();
            Ok(AlertPayload::Informational { text })
        }
        2 | 3 => {
            if body.is_empty() || body.len() % FUND_RECORD_LEN != 0 {
                return Err(CodecError::BadPayloadLength {
                    expected: format!("positive multiple of {FUND_RECORD_LEN}"),
                    actual: body.len(),
                });
            }
            let mut funds = Vec::with_capacity(body.len() / FUND_RECORD_LEN);
            for chunk in body.chunks_exact(FUND_RECORD_LEN) {
                let mut txid = [0u8; 32];
                txid.copy_from_slice(&chunk[0..32]);
                let vout = u64::from_le_bytes(chunk[32..40].try_into().unwrap());
                let start = u64::from_le_bytes(chunk[40..48].try_into().unwrap());
                let end = u64::from_le_bytes(chunk[48..56].try_into().unwrap());
                let expires_with_consensus = chunk[56] != 0;
                funds.push(FundRecord {
                    txid,
                    vout,
                    enforce_at_height_start: start,
                    enforce_at_height_end: end,
                    expires_with_consensus,
                });
            }
            if alert_type == 2 {
                Ok(AlertPayload::FreezeUtxo { funds })
            } else {
                Ok(AlertPayload::UnfreezeUtxo { funds })
            }
        }
        4 => {
            if body.len() < 8 {
                return Err(CodecError::BadPayloadLength {
                    expected: "at least 8 bytes".into(),
                    actual: body.len(),
                });
            }
            let enforce_at_height = u64::from_le_bytes(body[0..8].try_into().unwrap());
            let mut pos = 8usize;
            let tx_bytes = read_varbytes(body, &mut pos)?;
            Ok(AlertPayload::ConfiscateUtxo {
                enforce_at_height,
                tx_hex: hex::encode(tx_bytes),
            })
        }
        5 | 6 => {
            let mut pos = 0usize;
            let peer = read_varbytes(body, &mut pos)?.to_vec();
            let reason = read_varbytes(body, &mut pos)?.to_vec();
            if alert_type == 5 {
                Ok(AlertPayload::BanPeer { peer, reason })
            } else {
                Ok(AlertPayload::UnbanPeer { peer, reason })
            }
        }
        7 => {
            if body.len() < 32 {
                return Err(CodecError::BadPayloadLength {
                    expected: "at least 32 bytes".into(),
                    actual: body.len(),
                });
            }
            let mut block_hash = [0u8; 32];
            block_hash.copy_from_slice(&body[0..32]);
            let mut pos = 32usize;
            let reason = read_varbytes(body, &mut pos)?.to_vec();
            if reason.is_empty() {
                return Err(CodecError::EmptyReason);
            }
            Ok(AlertPayload::InvalidateBlock { block_hash, reason })
        }
        8 => {
            if body.len() != SET_KEYS_PAYLOAD_LEN {
                return Err(CodecError::BadPayloadLength {
                    expected: SET_KEYS_PAYLOAD_LEN.to_string(),
                    actual: body.len(),
                });
            }
            let mut keys = [[0u8; COMPRESSED_PUBKEY_LEN]; SET_KEYS_COUNT];
            for (i, chunk) in body.chunks_exact(COMPRESSED_PUBKEY_LEN).enumerate() {
                keys[i].copy_from_slice(chunk);
            }
            Ok(AlertPayload::SetKeys { keys })
        }
        other => Err(CodecError::UnknownAlertType(other)),
    }
}

fn encode_payload(payload: &AlertPayload) -> Vec<u8> {
    let mut out = Vec::new();
    match payload {
        AlertPayload::Informational { text } => {
            write_varbytes(&mut out, text.as_bytes());
        }
        AlertPayload::FreezeUtxo { funds } | AlertPayload::UnfreezeUtxo { funds } => {
            for f in funds {
                out.extend_from_slice(&f.txid);
                out.extend_from_slice(&f.vout.to_le_bytes());
                out.extend_from_slice(&f.enforce_at_height_start.to_le_bytes());
                out.extend_from_slice(&f.enforce_at_height_end.to_le_bytes());
                out.push(if f.expires_with_consensus { 1 } else { 0 });
            }
        }
        AlertPayload::ConfiscateUtxo {
            enforce_at_height,
            tx_hex,
        } => {
            out.extend_from_slice(&enforce_at_height.to_le_bytes());
            let tx_bytes = hex::decode(tx_hex).unwrap_or_default();
            write_varbytes(&mut out, &tx_bytes);
        }
        AlertPayload::BanPeer { peer, reason } | AlertPayload::UnbanPeer { peer, reason } => {
            write_varbytes(&mut out, peer);
            write_varbytes(&mut out, reason);
        }
        AlertPayload::InvalidateBlock { block_hash, reason } => {
            out.extend_from_slice(block_hash);
            write_varbytes(&mut out, reason);
        }
        AlertPayload::SetKeys { keys } => {
            for k in keys {
                out.extend_from_slice(k);
            }
        }
    }
    out
}

/// Encode an envelope to its full wire form (header + payload + signatures).
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&envelope.version.to_le_bytes());
    out.extend_from_slice(&envelope.sequence.to_le_bytes());
    out.extend_from_slice(&envelope.timestamp.to_le_bytes());
    out.extend_from_slice(&envelope.payload.alert_type().as_u32().to_le_bytes());
    out.extend(encode_payload(&envelope.payload));
    for sig in &envelope.signatures {
        out.extend_from_slice(sig);
    }
    out
}

/// Decode a full wire envelope, validating every grammar rule from
/// the header and payload layout.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::TooShort {
            needed: HEADER_LEN,
            got: bytes.len(),
        });
    }
    let version = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let sequence = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let timestamp = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let alert_type = u32::from_le_bytes(bytes[16..20].try_into().unwrap());

    let expected_sigs = if alert_type == RESERVED_TWO_SIG_ALERT_TYPE {
        RESERVED_TWO_SIG_COUNT
    } else {
        DEFAULT_SIGNATURES_PER_ALERT
    };
    let sig_block_len = expected_sigs * SIGNATURE_LENGTH;

    if bytes.len() < HEADER_LEN + sig_block_len {
        return Err(CodecError::TooShort {
            needed: HEADER_LEN + sig_block_len,
            got: bytes.len(),
        });
    }

    let payload_end = bytes.len() - sig_block_len;
    let body = &bytes[HEADER_LEN..payload_end];
    let sig_bytes = &bytes[payload_end..];
    // `sig_bytes` is always exactly `sig_block_len` bytes by construction
    // above, and `sig_block_len` is always a multiple of `SIGNATURE_LENGTH` —
    // there is no way for a malformed trailing block to reach here; a
    // truncated envelope is already caught by the `TooShort` check.

    if alert_type == RESERVED_TWO_SIG_ALERT_TYPE {
        // Length rule honored; payload grammar intentionally unspecified.
        return Err(CodecError::UnknownAlertType(alert_type));
    }

    let payload = decode_payload(alert_type, body)?;

    let signatures = sig_bytes
        .chunks_exact(SIGNATURE_LENGTH)
        .map(|c| {
            let mut arr = [0u8; SIGNATURE_LENGTH];
            arr.copy_from_slice(c);
            arr
        })
        .collect();

    Ok(Envelope {
        version,
        sequence,
        timestamp,
        payload,
        signatures,
    })
}

/// The body bytes `[0 .. 20+N)` that are hashed and signed — everything
/// before the signature block.
pub fn body_bytes(envelope: &Envelope) -> Vec<u8> {
    let full = encode(envelope);
    let sig_block_len = envelope.expected_signature_count() * SIGNATURE_LENGTH;
    full[..full.len() - sig_block_len].to_vec()
}

/// The hash that is signed and that keys the log: double-SHA256 of the
/// body bytes.
pub fn envelope_hash(envelope: &Envelope) -> [u8; 32] {
    double_sha256(&body_bytes(envelope))
}
