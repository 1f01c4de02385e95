//! gossipchain - a proof-of-work ledger node that gossips over TCP lines
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Chain engine, pending pool and validation
//! - [`block`] - Block structure and the proof-of-work search
//! - [`transaction`] - Transaction types and signing
//! - [`merkle`] - Merkle root construction
//!
//! ## Cryptography
//! - [`crypto`] - Keys, addresses and signatures (secp256k1)
//!
//! ## Networking
//! - [`network`] - Line-oriented wire protocol
//! - [`peer`] - Peer identity and registry
//! - [`sync`] - Broadcast, join/leave and chain cloning
//! - [`node`] - The node: gateway, dispatch and the miner
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod transaction;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod peer;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
