//! Error types for gossipchain

use std::fmt;

#[derive(Debug, Clone)]
pub enum ChainError {
    InvalidBlockLinkage,
    InvalidProofOfWork,
    InvalidBlockHash,
    InvalidMerkleRoot,
    IncompatibleDifficulty { expected: u32, got: u32 },
    InvalidBlock(String),
    InvalidTransaction(String),
    InsufficientBalance(String),
    BlockAlreadyExists,
    DuplicateTransaction,
    DuplicatePeer,
    PeerNotFound,
    CryptoError(String),
    NetworkError(String),
    ParseError(String),
    ConfigError(String),
    IoError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidBlockLinkage => write!(f, "Invalid block linkage"),
            ChainError::InvalidProofOfWork => write!(f, "Invalid proof of work"),
            ChainError::InvalidBlockHash => write!(f, "Block hash does not match its content"),
            ChainError::InvalidMerkleRoot => write!(f, "Invalid Merkle root"),
            ChainError::IncompatibleDifficulty { expected, got } => {
                write!(f, "Incompatible difficulty: expected ~{}, got {}", expected, got)
            }
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            ChainError::InsufficientBalance(addr) => {
                write!(f, "Insufficient balance for sender {}", addr)
            }
            ChainError::BlockAlreadyExists => write!(f, "Block already exists"),
            ChainError::DuplicateTransaction => write!(f, "Duplicate transaction"),
            ChainError::DuplicatePeer => write!(f, "Peer already registered"),
            ChainError::PeerNotFound => write!(f, "Peer not found"),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::ParseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
