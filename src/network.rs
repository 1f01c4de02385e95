//! Wire protocol: line-oriented messages over TCP
//!
//! Every message is a single line, either `<type>` alone or
//! `<type>, <base64(payload)>`, where the payload is base64-encoded JSON.
//! Replies are a single base64-encoded line. Unknown message types are not a
//! protocol error at this layer; the dispatcher answers them with `Error`
//! and keeps the connection open.

use crate::block::Block;
use crate::blockchain::ChainExport;
use crate::error::{ChainError, Result};
use crate::peer::Peer;
use crate::transaction::Transaction;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Canonical reply bodies (sent base64-encoded).
pub mod reply {
    pub const OK: &str = "Ok";
    pub const DUP: &str = "Dup";
    pub const ERROR: &str = "Error";
    pub const BYE: &str = "Bye";
    pub const DUPLICATE: &str = "Duplicate";
    pub const DUPLICATE_OR_TAMPERED: &str = "Duplicate or Tampered";
    pub const DUPLICATE_OR_INVALID: &str = "Duplicate or Invalid";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    GetBalance,
    DoTransact,
    GetCloneChainFrom,
    JoinNetwork,
    LeaveNetwork,
    StartMining,
    StopMining,
    BroadcastedBlock,
    BroadcastedTransaction,
    BroadcastedNewNode,
    CloneBlockchain,
}

impl MessageType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            MessageType::GetBalance => "getBalance",
            MessageType::DoTransact => "doTransact",
            MessageType::GetCloneChainFrom => "getCloneChainFrom",
            MessageType::JoinNetwork => "joinNetwork",
            MessageType::LeaveNetwork => "leaveNetwork",
            MessageType::StartMining => "startMining",
            MessageType::StopMining => "stopMining",
            MessageType::BroadcastedBlock => "broadcastedBlock",
            MessageType::BroadcastedTransaction => "broadcastedTransaction",
            MessageType::BroadcastedNewNode => "broadcastedNewNode",
            MessageType::CloneBlockchain => "cloneBlockchain",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "getBalance" => Some(MessageType::GetBalance),
            "doTransact" => Some(MessageType::DoTransact),
            "getCloneChainFrom" => Some(MessageType::GetCloneChainFrom),
            "joinNetwork" => Some(MessageType::JoinNetwork),
            "leaveNetwork" => Some(MessageType::LeaveNetwork),
            "startMining" => Some(MessageType::StartMining),
            "stopMining" => Some(MessageType::StopMining),
            "broadcastedBlock" => Some(MessageType::BroadcastedBlock),
            "broadcastedTransaction" => Some(MessageType::BroadcastedTransaction),
            "broadcastedNewNode" => Some(MessageType::BroadcastedNewNode),
            "cloneBlockchain" => Some(MessageType::CloneBlockchain),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One parsed wire line: a message type and an optional base64 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub payload: Option<String>,
}

impl WireMessage {
    pub fn new(msg_type: MessageType, payload: Option<String>) -> Self {
        WireMessage { msg_type, payload }
    }

    /// Parse one line. The separator is the first `", "`; everything after
    /// it is the payload, untouched.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (type_part, payload) = match line.split_once(", ") {
            Some((t, p)) => (t, Some(p.to_string())),
            None => (line, None),
        };
        let msg_type = MessageType::from_wire(type_part.trim()).ok_or_else(|| {
            ChainError::ParseError(format!("Unrecognized message type: {:?}", type_part))
        })?;
        Ok(WireMessage { msg_type, payload })
    }

    /// Render as a newline-terminated wire line.
    pub fn to_line(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{}, {}\n", self.msg_type, payload),
            None => format!("{}\n", self.msg_type),
        }
    }
}

pub fn encode_b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_b64(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| ChainError::ParseError(format!("Invalid base64 payload: {}", e)))
}

/// Serialize a record to base64-wrapped JSON, the payload form every
/// carrying message uses.
pub fn encode_record<T: Serialize>(record: &T) -> Result<String> {
    let json = serde_json::to_vec(record)?;
    Ok(encode_b64(&json))
}

/// Decode a base64-wrapped JSON payload.
pub fn decode_record<T: DeserializeOwned>(payload: &str) -> Result<T> {
    let bytes = decode_b64(payload)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decode a block payload and restore its derived Merkle root.
pub fn decode_block(payload: &str) -> Result<Block> {
    let mut block: Block = decode_record(payload)?;
    block.refresh_merkle_root();
    Ok(block)
}

/// Decode a transaction payload.
pub fn decode_transaction(payload: &str) -> Result<Transaction> {
    decode_record(payload)
}

/// Decode a peer descriptor payload, canonicalizing its host.
pub fn decode_peer(payload: &str) -> Result<Peer> {
    let mut peer: Peer = decode_record(payload)?;
    peer.canonicalize();
    Ok(peer)
}

/// Decode a cloned-chain payload, restoring every block's Merkle root.
pub fn decode_chain(payload: &str) -> Result<Vec<Block>> {
    let mut export: ChainExport = decode_record(payload)?;
    for block in &mut export.chain {
        block.refresh_merkle_root();
    }
    Ok(export.chain)
}

/// Encode a reply body for the single reply line.
pub fn encode_reply(body: &str) -> String {
    encode_b64(body.as_bytes())
}

/// Decode a reply line back to its body.
pub fn decode_reply(line: &str) -> Result<String> {
    let bytes = decode_b64(line)?;
    String::from_utf8(bytes).map_err(|e| ChainError::ParseError(format!("Reply is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::GENESIS_PREVIOUS_HASH;

    #[test]
    fn test_parse_bare_line() {
        let msg = WireMessage::parse_line("cloneBlockchain\n").unwrap();
        assert_eq!(msg.msg_type, MessageType::CloneBlockchain);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn test_parse_line_with_payload() {
        let msg = WireMessage::parse_line("getBalance, c29tZS1hZGRyZXNz\r\n").unwrap();
        assert_eq!(msg.msg_type, MessageType::GetBalance);
        assert_eq!(msg.payload.as_deref(), Some("c29tZS1hZGRyZXNz"));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(WireMessage::parse_line("fetchTheMoon, abc").is_err());
        assert!(WireMessage::parse_line("").is_err());
    }

    #[test]
    fn test_line_round_trip() {
        let msg = WireMessage::new(MessageType::JoinNetwork, Some("cGF5bG9hZA==".to_string()));
        let line = msg.to_line();
        assert!(line.ends_with('\n'));
        assert_eq!(WireMessage::parse_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_every_type_round_trips_through_wire_names() {
        let types = [
            MessageType::GetBalance,
            MessageType::DoTransact,
            MessageType::GetCloneChainFrom,
            MessageType::JoinNetwork,
            MessageType::LeaveNetwork,
            MessageType::StartMining,
            MessageType::StopMining,
            MessageType::BroadcastedBlock,
            MessageType::BroadcastedTransaction,
            MessageType::BroadcastedNewNode,
            MessageType::CloneBlockchain,
        ];
        for t in types {
            assert_eq!(MessageType::from_wire(t.as_wire()), Some(t));
        }
    }

    #[test]
    fn test_reply_round_trip() {
        let encoded = encode_reply(reply::DUPLICATE_OR_TAMPERED);
        assert_eq!(decode_reply(&encoded).unwrap(), reply::DUPLICATE_OR_TAMPERED);
    }

    #[test]
    fn test_peer_payload_canonicalizes_host() {
        let payload = encode_b64(br#"{"nodeAddress":"localhost","nodePort":8300}"#);
        let peer = decode_peer(&payload).unwrap();
        assert_eq!(peer, Peer::new("127.0.0.1", 8300));
    }

    #[test]
    fn test_block_payload_restores_merkle_root() {
        let mut block = Block::new(GENESIS_PREVIOUS_HASH, 1, "miner", 10);
        block
            .add_transaction(Transaction::new("s", "r", 1, 1, Some(1000), ""))
            .unwrap();
        let payload = encode_record(&block).unwrap();
        let decoded = decode_block(&payload).unwrap();
        assert_eq!(decoded.merkle_root, block.merkle_root);
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_chain_payload_round_trip() {
        let block = Block::new(GENESIS_PREVIOUS_HASH, 1, "miner", 10);
        let export = ChainExport {
            chain: vec![block.clone()],
        };
        let payload = encode_record(&export).unwrap();
        let chain = decode_chain(&payload).unwrap();
        assert_eq!(chain, vec![block]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_record::<Transaction>("not-base64!!!").is_err());
        let not_json = encode_b64(b"plainly not json");
        assert!(decode_record::<Transaction>(&not_json).is_err());
    }
}
