//! Signing and verification over canonical message bytes.
//!
//! The signable form of a message is its prost encoding with the signature
//! field cleared. Both sides must agree on that form bit-exactly, which is
//! why the message structs in this crate freeze their field tags.

use ed25519_dalek::{Signature, Signer, Verifier};
use prost::Message;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{HashAlgorithm, OrderLimit, PieceHash};

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Errors from signature checks
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid public key")]
    InvalidKey,

    #[error("malformed signature")]
    MalformedSignature,

    #[error("signature verification failed")]
    Verification,
}

/// Parse a verifying key from raw bytes
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, SigningError> {
    let arr: &[u8; 32] = bytes.try_into().map_err(|_| SigningError::InvalidKey)?;
    VerifyingKey::from_bytes(arr).map_err(|_| SigningError::InvalidKey)
}

/// Canonical bytes of an order limit, signature field cleared
#[must_use]
pub fn order_limit_signable_bytes(limit: &OrderLimit) -> Vec<u8> {
    let mut unsigned = limit.clone();
    unsigned.satellite_signature = Vec::new();
    unsigned.encode_to_vec()
}

/// Sign an order limit with the satellite key
#[must_use]
pub fn sign_order_limit(key: &SigningKey, mut limit: OrderLimit) -> OrderLimit {
    let bytes = order_limit_signable_bytes(&limit);
    limit.satellite_signature = key.sign(&bytes).to_bytes().to_vec();
    limit
}

/// Verify the satellite signature on an order limit
pub fn verify_order_limit(key: &VerifyingKey, limit: &OrderLimit) -> Result<(), SigningError> {
    let signature = Signature::from_slice(&limit.satellite_signature)
        .map_err(|_| SigningError::MalformedSignature)?;
    key.verify(&order_limit_signable_bytes(limit), &signature)
        .map_err(|_| SigningError::Verification)
}

/// Canonical bytes of a piece hash, signature field cleared
#[must_use]
pub fn piece_hash_signable_bytes(hash: &PieceHash) -> Vec<u8> {
    let mut unsigned = hash.clone();
    unsigned.signature = Vec::new();
    unsigned.encode_to_vec()
}

/// Sign a piece hash with the per-upload key
#[must_use]
pub fn sign_piece_hash(key: &SigningKey, mut hash: PieceHash) -> PieceHash {
    let bytes = piece_hash_signable_bytes(&hash);
    hash.signature = key.sign(&bytes).to_bytes().to_vec();
    hash
}

/// Verify the upload-key signature on a piece hash
pub fn verify_piece_hash(key: &VerifyingKey, hash: &PieceHash) -> Result<(), SigningError> {
    let signature =
        Signature::from_slice(&hash.signature).map_err(|_| SigningError::MalformedSignature)?;
    key.verify(&piece_hash_signable_bytes(hash), &signature)
        .map_err(|_| SigningError::Verification)
}

/// Hash piece content with the header's algorithm
#[must_use]
pub fn hash_piece_content(algorithm: HashAlgorithm, content: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(content).to_vec(),
    }
}
