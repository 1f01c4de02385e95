//! Peer exchanges: one-shot requests, flood broadcast and the clone flow
//!
//! Every exchange opens a fresh connection, writes one line, reads one reply
//! line and closes. Broadcast iterates a snapshot of the registry so no lock
//! is held across network I/O; peers that fail are collected during the pass
//! and removed together afterwards.

use crate::error::{ChainError, Result};
use crate::network::{self, MessageType, WireMessage};
use crate::node::SharedState;
use crate::peer::Peer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Send one wire line to a peer and read the single reply line.
pub async fn request(peer: &Peer, line: &str) -> Result<String> {
    tokio::time::timeout(EXCHANGE_TIMEOUT, exchange(peer, line))
        .await
        .map_err(|_| ChainError::NetworkError(format!("Exchange with {} timed out", peer)))?
}

async fn exchange(peer: &Peer, line: &str) -> Result<String> {
    let stream = TcpStream::connect(peer.addr())
        .await
        .map_err(|e| ChainError::NetworkError(format!("Connect to {} failed: {}", peer, e)))?;
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ChainError::NetworkError(format!("Write to {} failed: {}", peer, e)))?;

    let mut reply = String::new();
    let mut reader = BufReader::new(read_half);
    let n = reader
        .read_line(&mut reply)
        .await
        .map_err(|e| ChainError::NetworkError(format!("Read from {} failed: {}", peer, e)))?;
    if n == 0 {
        return Err(ChainError::NetworkError(format!(
            "Peer {} closed the connection without replying",
            peer
        )));
    }
    Ok(reply.trim_end_matches(['\r', '\n']).to_string())
}

/// Flood one message to every known peer except `exclude`. Unreachable peers
/// are dropped from the registry after the pass; replies are otherwise
/// ignored.
pub async fn broadcast(
    state: &SharedState,
    msg_type: MessageType,
    payload: Option<String>,
    exclude: Option<&Peer>,
) {
    let peers = state.lock().await.peers.snapshot();
    let line = WireMessage::new(msg_type, payload).to_line();

    let mut unreachable = Vec::new();
    for peer in &peers {
        if Some(peer) == exclude {
            continue;
        }
        if let Err(e) = request(peer, &line).await {
            warn!("Broadcast of {} to {} failed: {}", msg_type, peer, e);
            unreachable.push(peer.clone());
        }
    }

    if !unreachable.is_empty() {
        let mut guard = state.lock().await;
        for peer in &unreachable {
            guard.peers.remove_peer(peer);
        }
        info!("Removed {} unreachable peer(s)", unreachable.len());
    }
}

/// Introduce ourselves to a bootstrap peer and register it. A `Dup` reply
/// means the peer already knew us, which is fine.
pub async fn join_network(state: &SharedState, self_peer: &Peer, target: &Peer) -> Result<()> {
    let payload = network::encode_record(self_peer)?;
    let line = WireMessage::new(MessageType::JoinNetwork, Some(payload)).to_line();
    let reply = request(target, &line).await?;
    let body = network::decode_reply(&reply)?;
    if body != network::reply::OK && body != network::reply::DUP {
        return Err(ChainError::NetworkError(format!(
            "Peer {} refused the join: {}",
            target, body
        )));
    }
    state.lock().await.peers.add_peer(target.clone());
    info!("Joined the network via {}", target);
    Ok(())
}

/// Announce departure to every peer and clear the registry.
pub async fn leave_network(state: &SharedState, self_peer: &Peer) {
    let payload = match network::encode_record(self_peer) {
        Ok(p) => p,
        Err(e) => {
            warn!("Could not encode the departure notice: {}", e);
            return;
        }
    };
    broadcast(state, MessageType::LeaveNetwork, Some(payload), None).await;
    state.lock().await.peers.replace(Vec::new());
    info!("Left the network");
}

/// Replace the local chain with one cloned from `source`. Mining is disabled
/// and local chain state cleared for the duration; a successful install
/// re-enables mining at the adopted difficulty. On any failure the node is
/// left empty with mining still disabled, matching the install semantics.
pub async fn clone_chain_from(
    state: &SharedState,
    chain_version: &Arc<AtomicU64>,
    source: &Peer,
) -> Result<()> {
    {
        let mut guard = state.lock().await;
        guard.chain.stop_mining();
        guard.chain.blocks.clear();
        guard.chain.pending.clear();
    }
    chain_version.fetch_add(1, Ordering::SeqCst);

    let line = WireMessage::new(MessageType::CloneBlockchain, None).to_line();
    let reply = request(source, &line).await?;
    let blocks = network::decode_chain(&reply)?;
    let length = blocks.len();

    let mut guard = state.lock().await;
    guard.chain.install_chain(blocks)?;
    guard.chain.start_mining();
    chain_version.fetch_add(1, Ordering::SeqCst);
    info!("Cloned a chain of {} block(s) from {}", length, source);
    Ok(())
}
