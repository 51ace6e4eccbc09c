//! Threshold-signature verification over an envelope's body bytes.
//!
//! Each signature is a compact recoverable ECDSA signature over the
//! double-SHA256 of the Bitcoin "signed message" envelope
//! (`\x18Bitcoin Signed Message:\n` + varint length + message), where the
//! signed message is the hex-encoded body bytes.

use crate::codec::{body_bytes, double_sha256};
use crate::keystore::PublicKey;
use crate::types::{Envelope, SIGNATURE_LENGTH};
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

const MESSAGE_MAGIC: &[u8] = b"\x18Bitcoin Signed Message:\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no active keys configured")]
    NoActiveKeys,

    #[error("signature at index {index} does not match any active key")]
    SignatureInvalid { index: usize },

    #[error("signature at index {index} is structurally invalid: {reason}")]
    MalformedSignature { index: usize, reason: String },
}

fn varint_prefixed(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 9);
    let len = message.len() as u64;
    if len <= 0xfc {
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else if len <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.extend_from_slice(message);
    out
}

/// The digest actually signed: double-SHA256 of the Bitcoin message
/// envelope wrapping the hex-encoded body bytes.
pub fn signed_digest(body: &[u8]) -> [u8; 32] {
    let hex_message = hex::encode(body);
    let mut full = Vec::with_capacity(MESSAGE_MAGIC.len() + hex_message.len() + 9);
    full.extend_from_slice(MESSAGE_MAGIC);
    full.extend(varint_prefixed(hex_message.as_bytes()));
    double_sha256(&full)
}

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

/// Mainnet P2PKH version byte.
const ADDRESS_VERSION: u8 = 0x00;

/// Base58Check-encoded legacy address for a compressed public key. Keys are
/// compared as addresses rather than raw hash160es, since that's the
/// comparison an alert's signer set is asserted in terms of.
fn legacy_address(pubkey: &[u8]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(&hash160(pubkey));
    bs58::encode(payload).with_check().into_string()
}

/// Recover the compressed public key that produced `sig` over `digest`,
/// if the signature is structurally well-formed.
fn recover_compressed_pubkey(
    sig: &[u8; SIGNATURE_LENGTH],
    digest: &[u8; 32],
) -> Result<[u8; 33], String> {
    let header = sig[0];
    if !(27..=42).contains(&header) {
        return Err(format!("invalid recovery header byte {header}"));
    }
    let recid_raw = (header - 27) % 4;
    let recid = RecoveryId::from_i32(recid_raw as i32).map_err(|e| e.to_string())?;
    let recoverable = RecoverableSignature::from_compact(&sig[1..65], recid)
        .map_err(|e| e.to_string())?;
    let msg = Message::from_digest(*digest);
    let secp = Secp256k1::verification_only();
    let pubkey = secp
        .recover_ecdsa(&msg, &recoverable)
        .map_err(|e| e.to_string())?;
    Ok(pubkey.serialize())
}

/// Compact-recoverable-sign `digest` with `secret`, matching the header
/// byte convention `recover_compressed_pubkey` expects (compressed key,
/// header in `31..=34`).
pub fn sign_compact(
    secret: &secp256k1::SecretKey,
    digest: &[u8; 32],
) -> [u8; SIGNATURE_LENGTH] {
    let secp = Secp256k1::signing_only();
    let msg = Message::from_digest(*digest);
    let (recid, compact) = secp.sign_ecdsa_recoverable(&msg, secret).serialize_compact();
    let mut out = [0u8; SIGNATURE_LENGTH];
    out[0] = 31 + recid.to_i32() as u8;
    out[1..].copy_from_slice(&compact);
    out
}

pub struct Verifier;

impl Verifier {
    /// Check every signature on `envelope` against `active_keys`. Every
    /// signature must match some active key; order does not matter.
    /// `NoActiveKeys` is reported before any signature math runs.
    pub fn verify(
        envelope: &Envelope,
        active_keys: &HashSet<PublicKey>,
    ) -> Result<(), VerifyError> {
        if active_keys.is_empty() {
            return Err(VerifyError::NoActiveKeys);
        }

        let body = body_bytes(envelope);
        let digest = signed_digest(&body);
        let active_addresses: HashSet<String> =
            active_keys.iter().map(|k| legacy_address(k)).collect();

        for (index, sig) in envelope.signatures.iter().enumerate() {
            let recovered = recover_compressed_pubkey(sig, &digest).map_err(|reason| {
                VerifyError::MalformedSignature { index, reason }
            })?;
            let addr = legacy_address(&recovered);
            if !active_addresses.contains(&addr) {
                return Err(VerifyError::SignatureInvalid { index });
            }
        }

        Ok(())
    }
}
