//! Wire-level and storage-level types shared by every module in this crate.
//!
//! The alert hierarchy is modeled as a single tagged `AlertPayload` enum
//! owned exclusively by `Envelope`, rather than as a trait-object hierarchy
//! — see the tagged-union design below.

use serde::{Deserialize, Serialize};

/// Current envelope wire format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Default threshold signature count and fixed signature width.
pub const DEFAULT_SIGNATURES_PER_ALERT: usize = 3;
pub const SIGNATURE_LENGTH: usize = 65;

/// Reserved alert type carrying a two-signature (128-byte) envelope. Its
/// payload grammar is undefined upstream; we accept the length rule and
/// reject the payload (see decode in `codec.rs`).
pub const RESERVED_TWO_SIG_ALERT_TYPE: u32 = 99;
pub const RESERVED_TWO_SIG_COUNT: usize = 2;

/// A single FreezeUtxo / UnfreezeUtxo record: 57 fixed bytes.
pub const FUND_RECORD_LEN: usize = 57;

/// Exactly five 33-byte compressed public keys per SetKeys payload.
pub const SET_KEYS_COUNT: usize = 5;
pub const COMPRESSED_PUBKEY_LEN: usize = 33;
pub const SET_KEYS_PAYLOAD_LEN: usize = SET_KEYS_COUNT * COMPRESSED_PUBKEY_LEN;

/// The enumerated alert command, matching the wire format's type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum AlertType {
    Informational = 1,
    FreezeUtxo = 2,
    UnfreezeUtxo = 3,
    ConfiscateUtxo = 4,
    BanPeer = 5,
    UnbanPeer = 6,
    InvalidateBlock = 7,
    SetKeys = 8,
}

impl AlertType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Informational,
            2 => Self::FreezeUtxo,
            3 => Self::UnfreezeUtxo,
            4 => Self::ConfiscateUtxo,
            5 => Self::BanPeer,
            6 => Self::UnbanPeer,
            7 => Self::InvalidateBlock,
            8 => Self::SetKeys,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A single frozen/unfrozen fund record (57 bytes on the wire).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundRecord {
    pub txid: [u8; 32],
    pub vout: u64,
    pub enforce_at_height_start: u64,
    pub enforce_at_height_end: u64,
    pub expires_with_consensus: bool,
}

/// The type-specific body of an alert, decoded and validated per its
/// grammar. `execute` dispatch lives in `executor.rs`; this type is pure
/// data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AlertPayload {
    Informational { text: String },
    FreezeUtxo { funds: Vec<FundRecord> },
    UnfreezeUtxo { funds: Vec<FundRecord> },
    ConfiscateUtxo { enforce_at_height: u64, tx_hex: String },
    BanPeer { peer: Vec<u8>, reason: Vec<u8> },
    UnbanPeer { peer: Vec<u8>, reason: Vec<u8> },
    InvalidateBlock { block_hash: [u8; 32], reason: Vec<u8> },
    SetKeys { keys: [[u8; COMPRESSED_PUBKEY_LEN]; SET_KEYS_COUNT] },
}

impl AlertPayload {
    pub fn alert_type(&self) -> AlertType {
        match self {
            Self::Informational { .. } => AlertType::Informational,
            Self::FreezeUtxo { .. } => AlertType::FreezeUtxo,
            Self::UnfreezeUtxo { .. } => AlertType::UnfreezeUtxo,
            Self::ConfiscateUtxo { .. } => AlertType::ConfiscateUtxo,
            Self::BanPeer { .. } => AlertType::BanPeer,
            Self::UnbanPeer { .. } => AlertType::UnbanPeer,
            Self::InvalidateBlock { .. } => AlertType::InvalidateBlock,
            Self::SetKeys { .. } => AlertType::SetKeys,
        }
    }
}

/// The full wire envelope: header + typed payload + signatures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub sequence: u32,
    pub timestamp: u64,
    pub payload: AlertPayload,
    /// Concatenated fixed-width compact recoverable signatures.
    pub signatures: Vec<[u8; SIGNATURE_LENGTH]>,
}

impl Envelope {
    /// Number of signatures required for this envelope's alert type.
    pub fn expected_signature_count(&self) -> usize {
        if self.payload.alert_type().as_u32() == RESERVED_TWO_SIG_ALERT_TYPE {
            RESERVED_TWO_SIG_COUNT
        } else {
            DEFAULT_SIGNATURES_PER_ALERT
        }
    }
}

/// A persisted alert row, matching the `alert_messages` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertRow {
    pub id: i64,
    pub sequence: u32,
    /// Hex-encoded double-SHA256 of the envelope body bytes.
    pub hash: String,
    /// Hex-encoded full envelope (header + payload + signatures).
    pub raw: String,
    pub processed: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A persisted public key row, matching the `public_keys` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicKeyRow {
    pub id: i64,
    /// Hex-encoded 33-byte compressed public key.
    pub key: String,
    pub active: bool,
    /// Hash of the SetKeys alert that asserted this key.
    pub last_update_hash: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
