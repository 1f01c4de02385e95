//! The node: gateway listener, message dispatch and the background miner
//!
//! All mutable state lives behind one `Mutex<NodeState>`; every handler takes
//! the lock, mutates, and releases before any network I/O. The proof-of-work
//! search runs on the blocking pool outside the lock and is preempted through
//! `chain_version`, a counter bumped whenever the tip may have moved.

use crate::blockchain::{Blockchain, MineOutcome};
use crate::config::Config;
use crate::crypto::KeyPair;
use crate::error::{ChainError, Result};
use crate::network::{self, reply, MessageType, WireMessage};
use crate::peer::{Peer, PeerRegistry};
use crate::sync;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Pause between mining rounds so an idle node does not spin hot.
const MINING_PACE: Duration = Duration::from_millis(250);

pub struct NodeState {
    pub chain: Blockchain,
    pub peers: PeerRegistry,
}

pub type SharedState = Arc<Mutex<NodeState>>;

pub struct Node {
    pub config: Config,
    pub wallet: KeyPair,
    /// How other peers reach this node.
    pub self_peer: Peer,
    pub state: SharedState,
    /// Bumped whenever the tip may have moved; the miner compares against it.
    pub chain_version: Arc<AtomicU64>,
}

impl Node {
    pub fn new(config: Config) -> Result<Self> {
        let wallet = match &config.wallet.secret_key {
            Some(hex_secret) => KeyPair::from_secret_hex(hex_secret)?,
            None => KeyPair::generate(),
        };
        info!("Node wallet address: {}", wallet.address());

        let self_peer = Peer::new(config.network.advertise_host.clone(), config.network.p2p_port);
        let mut chain = Blockchain::new(wallet.address(), config.chain.clone());
        chain.mining = config.miner.enabled;

        Ok(Node {
            config,
            wallet,
            self_peer,
            state: Arc::new(Mutex::new(NodeState {
                chain,
                peers: PeerRegistry::new(),
            })),
            chain_version: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Bind the gateway, contact the bootstrap peers and start the miner.
    /// Returns once the node is running; the spawned tasks keep it alive.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let bind = format!(
            "{}:{}",
            self.config.network.bind_host, self.config.network.p2p_port
        );
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Cannot bind {}: {}", bind, e)))?;
        info!("Gateway listening on {}", bind);

        let node = self.clone();
        tokio::spawn(async move {
            node.accept_loop(listener).await;
        });

        self.bootstrap().await;

        let node = self.clone();
        tokio::spawn(async move {
            node.mining_loop().await;
        });
        Ok(())
    }

    /// Join every configured bootstrap peer, then clone a chain from the
    /// first one that serves us. A node with no reachable peers starts a
    /// fresh network instead.
    async fn bootstrap(self: &Arc<Self>) {
        for entry in &self.config.network.bootstrap_peers {
            let Some(target) = Peer::parse(entry) else {
                warn!("Ignoring malformed bootstrap peer {:?}", entry);
                continue;
            };
            if target == self.self_peer {
                continue;
            }
            if let Err(e) = sync::join_network(&self.state, &self.self_peer, &target).await {
                warn!("Could not join via {}: {}", target, e);
            }
        }

        let peers = self.state.lock().await.peers.snapshot();
        for source in &peers {
            match sync::clone_chain_from(&self.state, &self.chain_version, source).await {
                Ok(()) => {
                    // the clone flow re-enables mining; startup honors the
                    // configured mode instead
                    self.state.lock().await.chain.mining = self.config.miner.enabled;
                    return;
                }
                Err(e) => warn!("Clone from {} failed: {}", source, e),
            }
        }

        if !peers.is_empty() {
            warn!("No peer served a chain; starting fresh");
        }
        // a failed clone leaves mining disabled; restore the configured mode
        self.state.lock().await.chain.mining = self.config.miner.enabled;
    }

    /// Announce departure and stop accepting new work.
    pub async fn shutdown(&self) {
        self.state.lock().await.chain.stop_mining();
        self.chain_version.fetch_add(1, Ordering::SeqCst);
        sync::leave_network(&self.state, &self.self_peer).await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Serve one connection: one reply line per request line, until the
    /// client hangs up. A malformed line gets `Error` and the connection
    /// stays open.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.dispatch(&line).await;
            if write_half
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// Handle one request line, returning the encoded reply line.
    async fn dispatch(&self, line: &str) -> String {
        let msg = match WireMessage::parse_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Rejected request line: {}", e);
                return network::encode_reply(reply::ERROR);
            }
        };

        match msg.msg_type {
            MessageType::GetBalance => self.handle_get_balance(msg.payload).await,
            MessageType::DoTransact => self.handle_do_transact(msg.payload).await,
            MessageType::GetCloneChainFrom => self.handle_get_clone_chain_from(msg.payload).await,
            MessageType::JoinNetwork => self.handle_join_network(msg.payload).await,
            MessageType::LeaveNetwork => self.handle_leave_network(msg.payload).await,
            MessageType::StartMining => self.handle_start_mining().await,
            MessageType::StopMining => self.handle_stop_mining().await,
            MessageType::BroadcastedBlock => self.handle_broadcasted_block(msg.payload).await,
            MessageType::BroadcastedTransaction => {
                self.handle_broadcasted_transaction(msg.payload).await
            }
            MessageType::BroadcastedNewNode => self.handle_broadcasted_new_node(msg.payload).await,
            MessageType::CloneBlockchain => self.handle_clone_blockchain().await,
        }
    }

    /// Payload: base64 of a bare address string. Reply: base64 of the
    /// balance rendered in decimal.
    async fn handle_get_balance(&self, payload: Option<String>) -> String {
        let address = match payload.as_deref().map(network::decode_b64) {
            Some(Ok(bytes)) => match String::from_utf8(bytes) {
                Ok(address) => address,
                Err(_) => return network::encode_reply(reply::ERROR),
            },
            _ => return network::encode_reply(reply::ERROR),
        };
        let balance = self.state.lock().await.chain.balance(address.trim());
        network::encode_reply(&balance.to_string())
    }

    /// Accept a transaction from a client. An unsigned transaction from this
    /// node's own wallet (or with a blank sender) is signed locally before
    /// validation; accepted transactions are flooded to the network.
    async fn handle_do_transact(&self, payload: Option<String>) -> String {
        let Some(payload) = payload else {
            return network::encode_reply(reply::ERROR);
        };
        let mut tx = match network::decode_transaction(&payload) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("Undecodable transaction payload: {}", e);
                return network::encode_reply(reply::ERROR);
            }
        };

        if tx.signature.is_empty() {
            if tx.sender.is_empty() {
                tx.sender = self.wallet.address();
            }
            if tx.sender == self.wallet.address() {
                if let Err(e) = tx.sign(&self.wallet) {
                    warn!("Could not sign the transaction: {}", e);
                    return network::encode_reply(reply::ERROR);
                }
            }
        }

        let accepted = self.state.lock().await.chain.receive_transaction(tx.clone());
        match accepted {
            Ok(()) => {
                self.flood(MessageType::BroadcastedTransaction, &tx, None);
                network::encode_reply(reply::OK)
            }
            Err(e) => {
                warn!("Rejected transaction: {}", e);
                network::encode_reply(reply::ERROR)
            }
        }
    }

    /// Payload: a peer descriptor to clone the whole chain from.
    async fn handle_get_clone_chain_from(&self, payload: Option<String>) -> String {
        let source = match payload.as_deref().map(network::decode_peer) {
            Some(Ok(peer)) => peer,
            _ => return network::encode_reply(reply::ERROR),
        };
        match sync::clone_chain_from(&self.state, &self.chain_version, &source).await {
            Ok(()) => network::encode_reply(reply::OK),
            Err(e) => {
                warn!("Clone from {} failed: {}", source, e);
                network::encode_reply(reply::ERROR)
            }
        }
    }

    /// A peer introduces itself. A newcomer is registered and gossiped to
    /// the rest of the network; a known peer gets `Dup`.
    async fn handle_join_network(&self, payload: Option<String>) -> String {
        let peer = match payload.as_deref().map(network::decode_peer) {
            Some(Ok(peer)) => peer,
            _ => return network::encode_reply(reply::ERROR),
        };
        if peer == self.self_peer {
            return network::encode_reply(reply::DUP);
        }
        let added = self.state.lock().await.peers.add_peer(peer.clone());
        if !added {
            return network::encode_reply(reply::DUP);
        }
        info!("Peer {} joined the network", peer);
        self.flood(MessageType::BroadcastedNewNode, &peer, Some(peer.clone()));
        network::encode_reply(reply::OK)
    }

    async fn handle_leave_network(&self, payload: Option<String>) -> String {
        if let Some(Ok(peer)) = payload.as_deref().map(network::decode_peer) {
            if self.state.lock().await.peers.remove_peer(&peer) {
                info!("Peer {} left the network", peer);
            }
        }
        network::encode_reply(reply::BYE)
    }

    async fn handle_start_mining(&self) -> String {
        self.state.lock().await.chain.start_mining();
        network::encode_reply(reply::OK)
    }

    async fn handle_stop_mining(&self) -> String {
        self.state.lock().await.chain.stop_mining();
        // abort any in-flight search
        self.chain_version.fetch_add(1, Ordering::SeqCst);
        network::encode_reply(reply::OK)
    }

    /// A block flooded by a peer. Acceptance preempts the local search and
    /// continues the flood; any rejection answers `Duplicate or Tampered`.
    async fn handle_broadcasted_block(&self, payload: Option<String>) -> String {
        let Some(payload) = payload else {
            return network::encode_reply(reply::ERROR);
        };
        let block = match network::decode_block(&payload) {
            Ok(block) => block,
            Err(e) => {
                warn!("Undecodable block payload: {}", e);
                return network::encode_reply(reply::ERROR);
            }
        };
        let received = self.state.lock().await.chain.receive_block(block);
        match received {
            Ok(()) => {
                self.chain_version.fetch_add(1, Ordering::SeqCst);
                self.flood_raw(MessageType::BroadcastedBlock, payload, None);
                network::encode_reply(reply::OK)
            }
            Err(e) => {
                warn!("Rejected broadcast block: {}", e);
                network::encode_reply(reply::DUPLICATE_OR_TAMPERED)
            }
        }
    }

    /// A transaction flooded by a peer; rejections answer
    /// `Duplicate or Invalid`, which ends the flood at this hop.
    async fn handle_broadcasted_transaction(&self, payload: Option<String>) -> String {
        let Some(payload) = payload else {
            return network::encode_reply(reply::ERROR);
        };
        let tx = match network::decode_transaction(&payload) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("Undecodable transaction payload: {}", e);
                return network::encode_reply(reply::ERROR);
            }
        };
        let received = self.state.lock().await.chain.receive_transaction(tx);
        match received {
            Ok(()) => {
                self.flood_raw(MessageType::BroadcastedTransaction, payload, None);
                network::encode_reply(reply::OK)
            }
            Err(e) => {
                warn!("Rejected broadcast transaction: {}", e);
                network::encode_reply(reply::DUPLICATE_OR_INVALID)
            }
        }
    }

    /// Gossip about a node joining elsewhere. Registering it continues the
    /// gossip; knowing it already (or it being ourselves) answers
    /// `Duplicate` and ends the flood.
    async fn handle_broadcasted_new_node(&self, payload: Option<String>) -> String {
        let peer = match payload.as_deref().map(network::decode_peer) {
            Some(Ok(peer)) => peer,
            _ => return network::encode_reply(reply::ERROR),
        };
        if peer == self.self_peer {
            return network::encode_reply(reply::DUPLICATE);
        }
        let added = self.state.lock().await.peers.add_peer(peer.clone());
        if !added {
            return network::encode_reply(reply::DUPLICATE);
        }
        info!("Learned about peer {} through gossip", peer);
        self.flood(MessageType::BroadcastedNewNode, &peer, Some(peer.clone()));
        network::encode_reply(reply::OK)
    }

    /// Serve the whole chain; the reply line is the encoded chain itself.
    async fn handle_clone_blockchain(&self) -> String {
        let export = self.state.lock().await.chain.export_chain();
        match network::encode_record(&export) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Could not encode the chain for cloning: {}", e);
                network::encode_reply(reply::ERROR)
            }
        }
    }

    /// Flood a record to the network in the background.
    fn flood<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        record: &T,
        exclude: Option<Peer>,
    ) {
        match network::encode_record(record) {
            Ok(payload) => self.flood_raw(msg_type, payload, exclude),
            Err(e) => warn!("Could not encode a {} broadcast: {}", msg_type, e),
        }
    }

    fn flood_raw(&self, msg_type: MessageType, payload: String, exclude: Option<Peer>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            sync::broadcast(&state, msg_type, Some(payload), exclude.as_ref()).await;
        });
    }

    /// Mine forever: build a candidate under the lock, search outside it on
    /// the blocking pool, commit under the lock again. A version bump during
    /// the search abandons it; the discarded candidate's transactions go
    /// back to the pool inside `commit_candidate`.
    async fn mining_loop(self: Arc<Self>) {
        loop {
            let (candidate, version) = {
                let guard_version = self.chain_version.load(Ordering::SeqCst);
                let mut guard = self.state.lock().await;
                (guard.chain.build_candidate(), guard_version)
            };
            let Some(mut block) = candidate else {
                tokio::time::sleep(MINING_PACE).await;
                continue;
            };

            let chain_version = self.chain_version.clone();
            let search = tokio::task::spawn_blocking(move || {
                block.seal(|| chain_version.load(Ordering::SeqCst) != version);
                block
            });
            let block = match search.await {
                Ok(block) => block,
                Err(e) => {
                    error!("Mining task failed: {}", e);
                    continue;
                }
            };

            let outcome = self.state.lock().await.chain.commit_candidate(block);
            if let MineOutcome::Appended(block) = outcome {
                self.chain_version.fetch_add(1, Ordering::SeqCst);
                self.flood(MessageType::BroadcastedBlock, &block, None);
            }
            tokio::time::sleep(MINING_PACE).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn test_node() -> Arc<Node> {
        let mut config = Config::default();
        config.miner.enabled = false;
        Arc::new(Node::new(config).unwrap())
    }

    fn request_line<T: serde::Serialize>(msg_type: MessageType, record: &T) -> String {
        let payload = network::encode_record(record).unwrap();
        WireMessage::new(msg_type, Some(payload)).to_line()
    }

    async fn expect_reply(node: &Arc<Node>, line: &str, body: &str) {
        let encoded = node.dispatch(line).await;
        assert_eq!(network::decode_reply(&encoded).unwrap(), body);
    }

    #[tokio::test]
    async fn test_unknown_command_answers_error() {
        let node = test_node();
        expect_reply(&node, "summonDragons, abc\n", reply::ERROR).await;
    }

    #[tokio::test]
    async fn test_get_balance_of_unknown_address_is_zero() {
        let node = test_node();
        let line = WireMessage::new(
            MessageType::GetBalance,
            Some(network::encode_b64(b"nobody-address")),
        )
        .to_line();
        expect_reply(&node, &line, "0").await;
    }

    #[tokio::test]
    async fn test_join_then_rejoin_answers_dup() {
        let node = test_node();
        let peer = Peer::new("10.0.0.9", 8300);
        let line = request_line(MessageType::JoinNetwork, &peer);
        expect_reply(&node, &line, reply::OK).await;
        expect_reply(&node, &line, reply::DUP).await;
        assert!(node.state.lock().await.peers.contains(&peer));
    }

    #[tokio::test]
    async fn test_join_with_localhost_alias_is_one_peer() {
        let node = test_node();
        let line = request_line(MessageType::JoinNetwork, &Peer::new("localhost", 9000));
        expect_reply(&node, &line, reply::OK).await;
        let line = request_line(MessageType::JoinNetwork, &Peer::new("127.0.0.1", 9000));
        expect_reply(&node, &line, reply::DUP).await;
        assert_eq!(node.state.lock().await.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_network_answers_bye() {
        let node = test_node();
        let peer = Peer::new("10.0.0.9", 8300);
        node.state.lock().await.peers.add_peer(peer.clone());
        let line = request_line(MessageType::LeaveNetwork, &peer);
        expect_reply(&node, &line, reply::BYE).await;
        assert!(node.state.lock().await.peers.is_empty());
    }

    #[tokio::test]
    async fn test_mining_toggle() {
        let node = test_node();
        assert!(!node.state.lock().await.chain.mining);
        expect_reply(
            &node,
            &WireMessage::new(MessageType::StartMining, None).to_line(),
            reply::OK,
        )
        .await;
        assert!(node.state.lock().await.chain.mining);
        expect_reply(
            &node,
            &WireMessage::new(MessageType::StopMining, None).to_line(),
            reply::OK,
        )
        .await;
        assert!(!node.state.lock().await.chain.mining);
    }

    #[tokio::test]
    async fn test_do_transact_signs_own_wallet_and_accepts() {
        let node = test_node();
        // fund the wallet with a mined genesis
        {
            let mut guard = node.state.lock().await;
            guard.chain.start_mining();
            guard.chain.mine_block().unwrap();
        }
        let tx = Transaction::new(node.wallet.address(), "receiver", 2, 1, None, "");
        let line = request_line(MessageType::DoTransact, &tx);
        expect_reply(&node, &line, reply::OK).await;
        assert_eq!(node.state.lock().await.chain.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_do_transact_rejects_overspend() {
        let node = test_node();
        let tx = Transaction::new(node.wallet.address(), "receiver", 1_000, 0, None, "");
        let line = request_line(MessageType::DoTransact, &tx);
        expect_reply(&node, &line, reply::ERROR).await;
    }

    #[tokio::test]
    async fn test_broadcast_block_duplicate_answers_tampered() {
        let node = test_node();
        {
            let mut guard = node.state.lock().await;
            guard.chain.start_mining();
            guard.chain.mine_block().unwrap();
        }
        let tip = node.state.lock().await.chain.tip().unwrap().clone();
        let line = request_line(MessageType::BroadcastedBlock, &tip);
        expect_reply(&node, &line, reply::DUPLICATE_OR_TAMPERED).await;
    }

    #[tokio::test]
    async fn test_broadcast_new_node_about_self_answers_duplicate() {
        let node = test_node();
        let line = request_line(MessageType::BroadcastedNewNode, &node.self_peer);
        expect_reply(&node, &line, reply::DUPLICATE).await;
        assert!(node.state.lock().await.peers.is_empty());
    }

    #[tokio::test]
    async fn test_clone_blockchain_serves_decodable_chain() {
        let node = test_node();
        {
            let mut guard = node.state.lock().await;
            guard.chain.start_mining();
            guard.chain.mine_block().unwrap();
        }
        let encoded = node
            .dispatch(&WireMessage::new(MessageType::CloneBlockchain, None).to_line())
            .await;
        let chain = network::decode_chain(&encoded).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(chain[0].is_genesis());
    }
}
