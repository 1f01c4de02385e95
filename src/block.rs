//! Block structure, content hashing and the proof-of-work search
//!
//! The block hash is a digest of every field except the hash itself, with
//! transactions serialized without their signatures. Proof-of-work succeeds
//! when the hex form of that digest starts with `mining_difficulty` literal
//! `'0'` characters. The Merkle root is derived from the transaction list
//! and never travels on the wire; decode paths recompute it.

use crate::crypto;
use crate::error::ChainError;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub previous_hash: String,
    pub hash: String,
    pub mining_difficulty: u32,
    pub nonce: u64,
    /// Milliseconds since the Unix epoch, refreshed on every search attempt.
    pub timestamp: u64,
    pub miner_address: String,
    pub miner_rewards: u64,
    pub transactions: Vec<Transaction>,
    /// Derived from `transactions`; recompute after deserializing.
    #[serde(skip)]
    pub merkle_root: String,
}

/// The mining success predicate: `difficulty` leading `'0'` characters in
/// the hex digest. A string-prefix target, not a numeric threshold.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let prefix_len = difficulty as usize;
    hash.len() >= prefix_len && hash.as_bytes()[..prefix_len].iter().all(|b| *b == b'0')
}

impl Block {
    /// Create an unsealed candidate block.
    pub fn new(
        previous_hash: impl Into<String>,
        mining_difficulty: u32,
        miner_address: impl Into<String>,
        miner_rewards: u64,
    ) -> Self {
        Block {
            previous_hash: previous_hash.into(),
            hash: String::new(),
            mining_difficulty,
            nonce: 0,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            miner_address: miner_address.into(),
            miner_rewards,
            transactions: Vec::new(),
            merkle_root: merkle_root(&[]),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// A block is finalized once the proof-of-work search has stamped it.
    pub fn is_sealed(&self) -> bool {
        !self.hash.is_empty()
    }

    /// Canonical serialization of everything except `hash` (and the derived
    /// Merkle root); transactions appear without their signatures.
    pub fn content_bytes(&self) -> Vec<u8> {
        let content = serde_json::json!({
            "previousHash": self.previous_hash,
            "miningDifficulty": self.mining_difficulty,
            "nonce": self.nonce,
            "timestamp": self.timestamp,
            "minerAddress": self.miner_address,
            "minerRewards": self.miner_rewards,
            "transactions": self
                .transactions
                .iter()
                .map(|tx| tx.content_json())
                .collect::<Vec<_>>(),
        });
        serde_json::to_vec(&content).unwrap_or_default()
    }

    pub fn content_hash(&self) -> String {
        crypto::hash_hex(&self.content_bytes())
    }

    /// Recompute the derived Merkle root. Must be called after any decode.
    pub fn refresh_merkle_root(&mut self) {
        self.merkle_root = merkle_root(&self.transactions);
    }

    /// Add a transaction to an unsealed block, rejecting duplicates by
    /// content hash. The Merkle root is recomputed.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), ChainError> {
        if self.is_sealed() {
            return Err(ChainError::InvalidBlock(
                "Cannot add a transaction to a sealed block".to_string(),
            ));
        }
        let hash = tx.hash();
        if self.transactions.iter().any(|t| t.hash() == hash) {
            return Err(ChainError::DuplicateTransaction);
        }
        self.transactions.push(tx);
        self.refresh_merkle_root();
        Ok(())
    }

    /// Remove a transaction by content hash from an unsealed block.
    pub fn remove_transaction(&mut self, tx_hash: &str) -> Result<(), ChainError> {
        if self.is_sealed() {
            return Err(ChainError::InvalidBlock(
                "Cannot remove a transaction from a sealed block".to_string(),
            ));
        }
        let before = self.transactions.len();
        self.transactions.retain(|t| t.hash() != tx_hash);
        if self.transactions.len() == before {
            return Err(ChainError::InvalidTransaction(
                "Transaction not found in block".to_string(),
            ));
        }
        self.refresh_merkle_root();
        Ok(())
    }

    /// Proof-of-work: generate fresh nonce/timestamp pairs until the content
    /// hash meets the difficulty target. Returns `false` when `preempted`
    /// signals the search should stop (a new tip arrived); the block is left
    /// unsealed in that case.
    pub fn seal<F: Fn() -> bool>(&mut self, preempted: F) -> bool {
        let mut rng = rand::thread_rng();
        loop {
            if preempted() {
                return false;
            }
            self.nonce = rng.gen();
            self.timestamp = chrono::Utc::now().timestamp_millis() as u64;
            let hash = self.content_hash();
            if meets_difficulty(&hash, self.mining_difficulty) {
                self.hash = hash;
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn tx(amount: u64, fee: u64) -> Transaction {
        Transaction::new("sender", "receiver", amount, fee, Some(1000), "")
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("0abc", 1));
        assert!(meets_difficulty("00ab", 2));
        assert!(!meets_difficulty("a0bc", 1));
        assert!(!meets_difficulty("0abc", 2));
        // difficulty zero accepts anything
        assert!(meets_difficulty("ffff", 0));
        // hash shorter than the prefix can never match
        assert!(!meets_difficulty("00", 3));
    }

    #[test]
    fn test_content_hash_excludes_own_hash() {
        let mut block = Block::new(GENESIS_PREVIOUS_HASH, 1, "miner", 10);
        let content_hash = block.content_hash();
        block.hash = "whatever".to_string();
        assert_eq!(block.content_hash(), content_hash);
    }

    #[test]
    fn test_content_hash_ignores_transaction_signatures() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::new(keypair.address(), "receiver", 5, 1, Some(1000), "");
        let mut block = Block::new("prev", 1, "miner", 10);
        block.add_transaction(tx.clone()).unwrap();
        let unsigned_hash = block.content_hash();

        tx.sign(&keypair).unwrap();
        let mut signed_block = Block::new("prev", 1, "miner", 10);
        signed_block.add_transaction(tx).unwrap();
        assert_eq!(signed_block.content_hash(), unsigned_hash);
    }

    #[test]
    fn test_add_transaction_rejects_duplicates() {
        let mut block = Block::new("prev", 1, "miner", 10);
        block.add_transaction(tx(1, 1)).unwrap();
        assert!(matches!(
            block.add_transaction(tx(1, 1)),
            Err(ChainError::DuplicateTransaction)
        ));
        assert_eq!(block.transactions.len(), 1);
    }

    #[test]
    fn test_mutations_recompute_merkle_root() {
        let mut block = Block::new("prev", 1, "miner", 10);
        let empty_root = block.merkle_root.clone();

        let t = tx(1, 1);
        let t_hash = t.hash();
        block.add_transaction(t).unwrap();
        assert_ne!(block.merkle_root, empty_root);
        assert_eq!(block.merkle_root, merkle_root(&block.transactions));

        block.remove_transaction(&t_hash).unwrap();
        assert_eq!(block.merkle_root, empty_root);
    }

    #[test]
    fn test_sealed_block_refuses_mutation() {
        let mut block = Block::new(GENESIS_PREVIOUS_HASH, 1, "miner", 10);
        assert!(block.seal(|| false));
        assert!(block.add_transaction(tx(1, 1)).is_err());
    }

    #[test]
    fn test_seal_satisfies_predicate_and_hash() {
        let mut block = Block::new(GENESIS_PREVIOUS_HASH, 1, "miner", 10);
        assert!(block.seal(|| false));
        assert!(meets_difficulty(&block.hash, block.mining_difficulty));
        assert_eq!(block.hash, block.content_hash());
    }

    #[test]
    fn test_seal_preemption() {
        let mut block = Block::new(GENESIS_PREVIOUS_HASH, 1, "miner", 10);
        assert!(!block.seal(|| true));
        assert!(!block.is_sealed());
    }

    #[test]
    fn test_serde_skips_merkle_root() {
        let mut block = Block::new(GENESIS_PREVIOUS_HASH, 1, "miner", 10);
        block.add_transaction(tx(1, 1)).unwrap();
        let json = serde_json::to_string(&block).unwrap();
        assert!(!json.contains("merkle"));

        let mut decoded: Block = serde_json::from_str(&json).unwrap();
        assert!(decoded.merkle_root.is_empty());
        decoded.refresh_merkle_root();
        assert_eq!(decoded.merkle_root, block.merkle_root);
    }
}
