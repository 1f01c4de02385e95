//! Transaction type and signing rules
//!
//! A transaction's signature covers its *content*: every field except the
//! signature itself, serialized as canonical JSON. The content hash over the
//! same bytes is the transaction's identity for duplicate detection.

use crate::crypto::{self, KeyPair};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: u64,
    pub fee: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub signature: String,
}

/// Borrowed view of a transaction with the signature left out; its canonical
/// JSON is what gets signed and hashed. Field order is fixed by this struct.
#[derive(Serialize)]
struct TransactionContent<'a> {
    sender: &'a str,
    receiver: &'a str,
    amount: u64,
    fee: u64,
    timestamp: u64,
    message: &'a str,
}

impl Transaction {
    /// Create an unsigned transaction. A zero/absent timestamp defaults to
    /// the current time.
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        amount: u64,
        fee: u64,
        timestamp: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        let timestamp = match timestamp {
            Some(ts) if ts != 0 => ts,
            _ => chrono::Utc::now().timestamp_millis() as u64,
        };
        Transaction {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            fee,
            timestamp,
            message: message.into(),
            signature: String::new(),
        }
    }

    /// Canonical serialization of everything except the signature.
    pub fn content_bytes(&self) -> Vec<u8> {
        let content = TransactionContent {
            sender: &self.sender,
            receiver: &self.receiver,
            amount: self.amount,
            fee: self.fee,
            timestamp: self.timestamp,
            message: &self.message,
        };
        // Serializing a plain struct with string/integer fields cannot fail.
        serde_json::to_vec(&content).unwrap_or_default()
    }

    /// Content hash: the transaction's identity.
    pub fn hash(&self) -> String {
        crypto::hash_hex(&self.content_bytes())
    }

    /// Content as a JSON value, for embedding in a block's content digest.
    pub fn content_json(&self) -> serde_json::Value {
        let content = TransactionContent {
            sender: &self.sender,
            receiver: &self.receiver,
            amount: self.amount,
            fee: self.fee,
            timestamp: self.timestamp,
            message: &self.message,
        };
        serde_json::to_value(&content).unwrap_or(serde_json::Value::Null)
    }

    /// Sign the content with the given keypair. The keypair's address must be
    /// the sender for the signature to later verify.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        self.signature = keypair.sign(&self.content_bytes())?;
        Ok(())
    }

    /// Verify the signature against the sender address and the content.
    pub fn verify_signature(&self) -> Result<(), ChainError> {
        if self.signature.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Transaction is unsigned".to_string(),
            ));
        }
        crypto::verify_signature(&self.sender, &self.content_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_transaction(keypair: &KeyPair, amount: u64, fee: u64) -> Transaction {
        let mut tx = Transaction::new(
            keypair.address(),
            "receiver-address",
            amount,
            fee,
            Some(1_700_000_000_000),
            "test payment",
        );
        tx.sign(keypair).unwrap();
        tx
    }

    #[test]
    fn test_timestamp_defaults_to_now() {
        let tx = Transaction::new("a", "b", 1, 0, None, "");
        assert!(tx.timestamp > 0);

        let fixed = Transaction::new("a", "b", 1, 0, Some(42), "");
        assert_eq!(fixed.timestamp, 42);
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let tx = signed_transaction(&keypair, 5, 1);
        assert!(tx.verify_signature().is_ok());
    }

    #[test]
    fn test_unsigned_rejected() {
        let tx = Transaction::new("a", "b", 1, 0, None, "");
        assert!(tx.verify_signature().is_err());
    }

    #[test]
    fn test_mutated_amount_invalidates_signature() {
        let keypair = KeyPair::generate();
        let mut tx = signed_transaction(&keypair, 5, 1);
        tx.amount = 500;
        assert!(tx.verify_signature().is_err());
    }

    #[test]
    fn test_hash_ignores_signature() {
        let keypair = KeyPair::generate();
        let mut tx = signed_transaction(&keypair, 5, 1);
        let hash_before = tx.hash();
        tx.signature = String::new();
        assert_eq!(tx.hash(), hash_before);
    }

    #[test]
    fn test_json_round_trip() {
        let keypair = KeyPair::generate();
        let tx = signed_transaction(&keypair, 5, 1);
        let json = serde_json::to_string(&tx).unwrap();
        let decoded: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, tx);
        assert!(decoded.verify_signature().is_ok());
    }

    #[test]
    fn test_round_trip_empty_message_and_zero_amounts() {
        let tx = Transaction::new("sender", "receiver", 0, 0, Some(1), "");
        let json = serde_json::to_string(&tx).unwrap();
        let decoded: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
    }
}
