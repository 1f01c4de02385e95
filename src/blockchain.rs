//! Chain engine: the chain, the pending pool, difficulty and mining
//!
//! The engine owns every consensus decision: candidate construction, the
//! post-search commit (including the discard-and-requeue reconciliation for
//! concurrent mining races), block and transaction acceptance, difficulty
//! retuning, and balance derivation by full replay. It performs no I/O;
//! callers drive broadcasts from the outcomes it returns.
//!
//! Validation failures are local: every operation reports through its
//! `Result`, never panics, and leaves state untouched on rejection.

use crate::block::{meets_difficulty, Block, GENESIS_PREVIOUS_HASH};
use crate::config::ChainConfig;
use crate::error::{ChainError, Result};
use crate::merkle::merkle_root;
use crate::peer::Peer;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

pub struct Blockchain {
    /// Append-only chain; index 0 is genesis.
    pub blocks: Vec<Block>,
    /// Accepted but not yet chained transactions.
    pub pending: Vec<Transaction>,
    pub difficulty: u32,
    pub mining: bool,
    pub miner_address: String,
    pub config: ChainConfig,
}

/// Result of committing a sealed (or preempted) candidate.
#[derive(Debug)]
pub enum MineOutcome {
    /// The candidate was appended; broadcast it.
    Appended(Block),
    /// The tip moved during the search. The candidate was discarded and its
    /// not-yet-chained transactions returned to the pool.
    Discarded { requeued: usize },
}

/// Chain-only exchange payload used by the clone flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExport {
    pub chain: Vec<Block>,
}

/// Whole-node snapshot. Available for tooling; the clone flow never uses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExport {
    pub wallet: String,
    pub difficulty: u32,
    pub mining: bool,
    pub peers: Vec<Peer>,
    pub chain: Vec<Block>,
    pub pending_transactions: Vec<Transaction>,
}

impl Blockchain {
    pub fn new(miner_address: impl Into<String>, config: ChainConfig) -> Self {
        Blockchain {
            blocks: Vec::new(),
            pending: Vec::new(),
            difficulty: config.initial_difficulty.max(1),
            mining: true,
            miner_address: miner_address.into(),
            config,
        }
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn start_mining(&mut self) {
        self.mining = true;
        info!("Mining started");
    }

    pub fn stop_mining(&mut self) {
        self.mining = false;
        info!("Mining stopped");
    }

    /// Build an unsealed candidate on the current tip, or `None` when mining
    /// is disabled. A genesis candidate draws no transactions; otherwise the
    /// pool is drained fee-ascending up to the per-block maximum.
    pub fn build_candidate(&mut self) -> Option<Block> {
        if !self.mining {
            return None;
        }

        let mut block = match self.tip() {
            None => Block::new(
                GENESIS_PREVIOUS_HASH,
                self.difficulty,
                self.miner_address.clone(),
                self.config.mining_rewards,
            ),
            Some(tip) => Block::new(
                tip.hash.clone(),
                self.difficulty,
                self.miner_address.clone(),
                self.config.mining_rewards,
            ),
        };

        if !block.is_genesis() {
            self.fill_candidate(&mut block);
        }
        Some(block)
    }

    /// Move pending transactions into the candidate, lowest fee first.
    fn fill_candidate(&mut self, block: &mut Block) {
        self.pending.sort_by_key(|tx| tx.fee);
        let take = self
            .pending
            .len()
            .min(self.config.max_transactions_per_block);
        for tx in self.pending.drain(..take) {
            if let Err(e) = block.add_transaction(tx) {
                warn!("Skipping pending transaction while filling candidate: {}", e);
            }
        }
    }

    /// Commit a candidate after the proof-of-work search. If the tip is
    /// still the one the candidate was built on (and the seal succeeded),
    /// the candidate is appended. Otherwise the candidate is discarded:
    /// transactions already chained since the fork point are dropped, the
    /// rest are returned to the pool, conserving the total count.
    pub fn commit_candidate(&mut self, block: Block) -> MineOutcome {
        let linked = match self.tip() {
            None => block.is_genesis(),
            Some(tip) => block.previous_hash == tip.hash,
        };

        if linked && block.is_sealed() {
            info!(
                "Mined block {} (difficulty {}, {} transaction(s))",
                block.hash,
                block.mining_difficulty,
                block.transactions.len()
            );
            self.blocks.push(block.clone());
            self.adjust_mining_difficulty();
            return MineOutcome::Appended(block);
        }

        // The tip advanced while we were searching (or the search was
        // preempted). Drop whatever a concurrent block already chained and
        // requeue the rest.
        let fork_point = self
            .blocks
            .iter()
            .position(|b| b.hash == block.previous_hash)
            .unwrap_or(0);
        let chained: HashSet<String> = self.blocks[fork_point..]
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.hash()))
            .collect();

        let mut requeued = 0;
        for tx in block.transactions {
            if chained.contains(&tx.hash()) {
                continue;
            }
            self.pending.push(tx);
            requeued += 1;
        }
        info!(
            "Discarded stale mined block; {} transaction(s) returned to the pool",
            requeued
        );
        MineOutcome::Discarded { requeued }
    }

    /// Mine one block synchronously: build, search, commit. Returns `None`
    /// when mining is disabled. The node's background miner uses the split
    /// `build_candidate`/`seal`/`commit_candidate` path instead so the
    /// search runs outside the state lock.
    pub fn mine_block(&mut self) -> Option<MineOutcome> {
        let mut candidate = self.build_candidate()?;
        candidate.seal(|| false);
        Some(self.commit_candidate(candidate))
    }

    /// Retune difficulty every `difficulty_adjustment_interval` blocks based
    /// on the observed average block time over the window. Runs right after
    /// each accepted block; a no-op while mining is disabled or off the
    /// interval boundary.
    pub fn adjust_mining_difficulty(&mut self) {
        if !self.mining {
            return;
        }

        let interval = self.config.difficulty_adjustment_interval as usize;
        let len = self.blocks.len();
        if len == 0 || len % interval != 0 {
            return;
        }

        let window_start = self.blocks[len - interval].timestamp;
        let window_end = self.blocks[len - 1].timestamp;
        let elapsed_secs = window_end.saturating_sub(window_start) / 1000;
        let average_block_time = elapsed_secs as f64 / interval as f64;

        if average_block_time > self.config.target_block_time_secs as f64 {
            self.difficulty = self.difficulty.saturating_sub(1).max(1);
            info!(
                "Decreasing mining difficulty to {} (average block time: {}s)",
                self.difficulty, average_block_time
            );
        } else {
            self.difficulty += 1;
            info!(
                "Increasing mining difficulty to {} (average block time: {}s)",
                self.difficulty, average_block_time
            );
        }
    }

    /// Validate and append a block received from the network. On success the
    /// block's transactions leave the pool and its difficulty becomes the
    /// local difficulty; the caller is expected to rebroadcast it.
    pub fn receive_block(&mut self, block: Block) -> Result<()> {
        if self.blocks.iter().any(|b| b.hash == block.hash) {
            return Err(ChainError::BlockAlreadyExists);
        }

        // Strict linear chain: the block must extend the exact tip. A
        // mismatch is rejected outright, never queued.
        let tip = self.tip().ok_or(ChainError::InvalidBlockLinkage)?;
        if block.previous_hash != tip.hash {
            return Err(ChainError::InvalidBlockLinkage);
        }

        let expected = tip.mining_difficulty;
        if block.mining_difficulty.abs_diff(expected) > 1 {
            return Err(ChainError::IncompatibleDifficulty {
                expected,
                got: block.mining_difficulty,
            });
        }

        if !meets_difficulty(&block.hash, block.mining_difficulty) {
            return Err(ChainError::InvalidProofOfWork);
        }

        if block.hash != block.content_hash() {
            return Err(ChainError::InvalidBlockHash);
        }

        if block.merkle_root != merkle_root(&block.transactions) {
            return Err(ChainError::InvalidMerkleRoot);
        }

        for tx in &block.transactions {
            tx.verify_signature().map_err(|_| {
                ChainError::InvalidTransaction("Block contains a tampered signature".to_string())
            })?;
        }

        let included: HashSet<String> = block.transactions.iter().map(|tx| tx.hash()).collect();
        self.pending.retain(|tx| !included.contains(&tx.hash()));

        info!("Accepted block {} from the network", block.hash);
        self.difficulty = block.mining_difficulty;
        self.blocks.push(block);
        self.adjust_mining_difficulty();
        Ok(())
    }

    /// Validate and enqueue a transaction. The caller is expected to
    /// rebroadcast it on success.
    pub fn receive_transaction(&mut self, tx: Transaction) -> Result<()> {
        tx.verify_signature()
            .map_err(|e| ChainError::InvalidTransaction(e.to_string()))?;

        let spend = tx.amount as i128 + tx.fee as i128;
        if spend > self.balance(&tx.sender) as i128 {
            return Err(ChainError::InsufficientBalance(tx.sender.clone()));
        }

        let hash = tx.hash();
        if self.pending.iter().any(|t| t.hash() == hash) || self.contains_transaction(&hash) {
            return Err(ChainError::DuplicateTransaction);
        }

        info!("Accepted transaction {} into the pool", hash);
        self.pending.push(tx);
        Ok(())
    }

    /// True when a transaction with this content hash is chained.
    pub fn contains_transaction(&self, tx_hash: &str) -> bool {
        self.blocks
            .iter()
            .any(|b| b.transactions.iter().any(|t| t.hash() == tx_hash))
    }

    /// Derive an account balance by replaying the whole chain: miners earn
    /// the block reward plus included fees; receivers gain amounts; senders
    /// lose amount plus fee. Accumulates in `i128` so peer-supplied blocks
    /// with absurd amounts cannot wrap the result; the final value clamps
    /// to the `i64` range.
    pub fn balance(&self, address: &str) -> i64 {
        let mut balance: i128 = 0;
        for block in &self.blocks {
            let is_miner = block.miner_address == address;
            if is_miner {
                balance += block.miner_rewards as i128;
            }
            for tx in &block.transactions {
                if is_miner {
                    balance += tx.fee as i128;
                }
                if tx.receiver == address {
                    balance += tx.amount as i128;
                }
                if tx.sender == address {
                    balance -= tx.amount as i128 + tx.fee as i128;
                }
            }
        }
        balance.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Replace the local chain with one cloned from a peer, after a linear
    /// integrity pass: every adjacent pair must link by hash and timestamps
    /// must not regress. On violation the node is left empty and the error
    /// reported. Pool is cleared either way; the new tip's difficulty is
    /// adopted.
    pub fn install_chain(&mut self, mut blocks: Vec<Block>) -> Result<()> {
        self.blocks.clear();
        self.pending.clear();

        for block in &mut blocks {
            block.refresh_merkle_root();
        }

        for pair in blocks.windows(2) {
            if pair[1].previous_hash != pair[0].hash {
                warn!("Cloned chain failed the linkage check; discarding");
                return Err(ChainError::InvalidBlockLinkage);
            }
            if pair[1].timestamp < pair[0].timestamp {
                warn!("Cloned chain has regressing timestamps; discarding");
                return Err(ChainError::InvalidBlock(
                    "Timestamps regress across the cloned chain".to_string(),
                ));
            }
        }

        self.blocks = blocks;
        if let Some(tip) = self.tip() {
            self.difficulty = tip.mining_difficulty;
        }
        info!("Installed cloned chain of length {}", self.blocks.len());
        Ok(())
    }

    pub fn export_chain(&self) -> ChainExport {
        ChainExport {
            chain: self.blocks.clone(),
        }
    }

    /// Snapshot the whole node state. Available for tooling; the clone flow
    /// exchanges chains only.
    pub fn export_state(&self, peers: &[Peer]) -> NodeExport {
        NodeExport {
            wallet: self.miner_address.clone(),
            difficulty: self.difficulty,
            mining: self.mining,
            peers: peers.to_vec(),
            chain: self.blocks.clone(),
            pending_transactions: self.pending.clone(),
        }
    }

    /// Restore a whole-node snapshot, returning the peer list for the
    /// caller's registry.
    pub fn import_state(&mut self, export: NodeExport) -> Vec<Peer> {
        self.miner_address = export.wallet;
        self.difficulty = export.difficulty.max(1);
        self.mining = export.mining;
        self.blocks = export.chain;
        for block in &mut self.blocks {
            block.refresh_merkle_root();
        }
        self.pending = export.pending_transactions;
        export.peers
    }
}
