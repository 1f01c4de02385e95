//! Cryptographic primitives for gossipchain
//!
//! Addresses are the hex encoding of a compressed secp256k1 public key, so a
//! verifier can recover the key from the address alone. All digests are
//! SHA-256 rendered as lowercase hex, which is the form the proof-of-work
//! prefix test operates on.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
/// This prevents repeated, unnecessary context creation.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Compute the SHA-256 digest of `data` as a lowercase hex string.
pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }

    /// Creates a KeyPair from a hex-encoded secret key.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex secret key: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    /// The node's account address: hex of the compressed public key.
    pub fn address(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Signs a message (which is first hashed using SHA-256) and returns the
    /// compact signature as a hex string.
    pub fn sign(&self, message: &[u8]) -> Result<String, ChainError> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(hex::encode(signature.serialize_compact()))
    }
}

/// Verifies an ECDSA signature given the sender address (hex compressed
/// public key), the signed message bytes, and the hex compact signature.
pub fn verify_signature(
    address: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), ChainError> {
    let public_key_bytes = hex::decode(address)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex address: {}", e)))?;
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Address must decode to exactly {} bytes (compressed public key), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }

    let signature_bytes = hex::decode(signature_hex)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex signature: {}", e)))?;
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(&public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;

    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;

    let signature = Signature::from_compact(&signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}
