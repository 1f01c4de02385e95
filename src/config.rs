//! Configuration management for gossipchain
//!
//! All tunables live here as explicit values handed to the constructors that
//! need them; nothing is read from process-wide statics.

use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Host other peers should use to reach this node.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// "host:port" entries contacted at startup to join the network.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

/// Consensus parameters shared by every node of a network.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: u32,
    /// Difficulty is retuned every this many blocks.
    #[serde(default = "default_adjustment_interval")]
    pub difficulty_adjustment_interval: u64,
    #[serde(default = "default_target_block_time")]
    pub target_block_time_secs: u64,
    #[serde(default = "default_mining_rewards")]
    pub mining_rewards: u64,
    #[serde(default = "default_max_transactions")]
    pub max_transactions_per_block: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default = "default_mining_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WalletConfig {
    /// Hex-encoded secret key. A fresh keypair is generated when unset.
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            bind_host: default_bind_host(),
            advertise_host: default_advertise_host(),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: default_initial_difficulty(),
            difficulty_adjustment_interval: default_adjustment_interval(),
            target_block_time_secs: default_target_block_time(),
            mining_rewards: default_mining_rewards(),
            max_transactions_per_block: default_max_transactions(),
        }
    }
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: default_mining_enabled(),
        }
    }
}

fn default_p2p_port() -> u16 {
    8300
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_initial_difficulty() -> u32 {
    1
}

fn default_adjustment_interval() -> u64 {
    10
}

fn default_target_block_time() -> u64 {
    30
}

fn default_mining_rewards() -> u64 {
    10
}

fn default_max_transactions() -> usize {
    32
}

fn default_mining_enabled() -> bool {
    true
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file is absent.
pub fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    let config: Config = if config_str.is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };

    // Validate critical values
    if config.chain.initial_difficulty == 0 {
        return Err("chain.initial_difficulty must be at least 1".into());
    }
    if config.chain.difficulty_adjustment_interval == 0 {
        return Err("chain.difficulty_adjustment_interval must be at least 1".into());
    }
    if config.chain.max_transactions_per_block == 0 {
        return Err("chain.max_transactions_per_block must be at least 1".into());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_network_constants() {
        let config = Config::default();
        assert_eq!(config.network.p2p_port, 8300);
        assert_eq!(config.chain.initial_difficulty, 1);
        assert_eq!(config.chain.difficulty_adjustment_interval, 10);
        assert_eq!(config.chain.target_block_time_secs, 30);
        assert_eq!(config.chain.mining_rewards, 10);
        assert_eq!(config.chain.max_transactions_per_block, 32);
        assert!(config.miner.enabled);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [network]
            p2p_port = 9000
            bootstrap_peers = ["127.0.0.1:8300"]

            [chain]
            target_block_time_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.network.p2p_port, 9000);
        assert_eq!(config.network.bootstrap_peers.len(), 1);
        assert_eq!(config.chain.target_block_time_secs, 5);
        // untouched sections keep defaults
        assert_eq!(config.chain.mining_rewards, 10);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/gossipchain.toml")).unwrap();
        assert_eq!(config.network.p2p_port, 8300);
    }
}
