//! Peer identity and registry
//!
//! A peer is identified by `(host, port)`. Hosts are canonicalized at
//! ingestion (`localhost` becomes `127.0.0.1`) so identity checks are plain
//! equality. Connection handles are transient and never part of identity.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "nodeAddress")]
    pub host: String,
    #[serde(rename = "nodePort")]
    pub port: u16,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Peer {
            host: canonical_host(host.into()),
            port,
        }
    }

    /// "host:port" form used for connecting and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a "host:port" string.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Peer::new(host, port))
    }

    /// Re-canonicalize after deserialization, since serde bypasses `new`.
    pub fn canonicalize(&mut self) {
        self.host = canonical_host(std::mem::take(&mut self.host));
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn canonical_host(host: String) -> String {
    if host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        host
    }
}

/// The set of known peers. Insertion is idempotent.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; returns false when it is already registered.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Remove a peer; returns false when it was not registered.
    pub fn remove_peer(&mut self, peer: &Peer) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        self.peers.len() != before
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.contains(peer)
    }

    /// Copy of the current peer list, for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn replace(&mut self, peers: Vec<Peer>) {
        self.peers.clear();
        for mut peer in peers {
            peer.canonicalize();
            if !self.peers.contains(&peer) {
                self.peers.push(peer);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localhost_aliases_to_loopback() {
        let a = Peer::new("localhost", 8300);
        let b = Peer::new("127.0.0.1", 8300);
        assert_eq!(a, b);
        assert_eq!(a.host, "127.0.0.1");
    }

    #[test]
    fn test_different_port_is_different_peer() {
        assert_ne!(Peer::new("127.0.0.1", 8300), Peer::new("127.0.0.1", 8301));
    }

    #[test]
    fn test_add_peer_is_idempotent() {
        let mut registry = PeerRegistry::new();
        assert!(registry.add_peer(Peer::new("localhost", 8300)));
        assert!(!registry.add_peer(Peer::new("127.0.0.1", 8300)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_peer() {
        let mut registry = PeerRegistry::new();
        let peer = Peer::new("10.0.0.2", 8300);
        registry.add_peer(peer.clone());
        assert!(registry.remove_peer(&peer));
        assert!(!registry.remove_peer(&peer));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_parse() {
        let peer = Peer::parse("localhost:8300").unwrap();
        assert_eq!(peer, Peer::new("127.0.0.1", 8300));
        assert!(Peer::parse("no-port").is_none());
        assert!(Peer::parse(":8300").is_none());
    }

    #[test]
    fn test_descriptor_json_shape() {
        let peer = Peer::new("10.0.0.2", 8300);
        let json = serde_json::to_string(&peer).unwrap();
        assert!(json.contains("nodeAddress"));
        assert!(json.contains("nodePort"));
        let decoded: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, peer);
    }
}
