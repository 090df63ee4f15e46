//! Runtime configuration for the ledger core.
//!
//! Loads optional `cascade.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used. All
//! consensus-critical knobs (Snowball parameters, vote thresholds, sync and
//! pruning windows) live here so tests can shrink them.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Every recognized parameter of the core. Field defaults are the mainnet
/// values; `testnet()` widens the Snowball sample.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of peers sampled per query/sync round.
    pub snowball_k: usize,
    /// Confidence threshold a tally must reach to count as a confirmation.
    pub snowball_alpha: f64,
    /// Consecutive confirmations required before a decision locks in.
    pub snowball_beta: u32,

    /// Tally threshold for the out-of-sync sampler.
    pub sync_vote_threshold: f64,
    /// Tally threshold for the block finalization sampler.
    pub finalization_vote_threshold: f64,
    /// Weight of the stake component when tallying votes.
    pub stake_majority_weight: f64,
    /// Weight of the transaction-count component when tallying finalization
    /// votes. When unset it is derived as `finalization_vote_threshold - 1/k`,
    /// just enough to reach majority under equal stakes.
    pub transactions_num_majority_weight: Option<f64>,

    /// Timeout for a single Query RPC, in milliseconds.
    pub query_timeout_ms: u64,
    /// Timeout for gossip-style broadcasts, in milliseconds.
    pub gossip_timeout_ms: u64,
    /// Timeout for transaction download streams, in milliseconds.
    pub download_tx_timeout_ms: u64,
    /// Timeout for a single CheckOutOfSync RPC, in milliseconds.
    pub check_out_of_sync_timeout_ms: u64,

    /// Size in bytes of one state-diff chunk served to syncing peers.
    pub sync_chunk_size: usize,
    /// How many blocks behind the majority a node must be before state sync
    /// kicks in.
    pub sync_if_block_indices_differ_by: u64,

    /// Number of transactions requested per chunk during mempool sync.
    pub tx_sync_chunk_size: u64,
    /// Upper bound on the number of transactions accepted from one
    /// reconciliation stream.
    pub tx_sync_limit: u64,
    /// Upper bound on missing ids broadcast per pull round.
    pub missing_tx_pull_limit: usize,

    /// Bit budget of the transaction membership filter.
    pub bloom_filter_m: usize,
    /// Hash count of the transaction membership filter.
    pub bloom_filter_k: usize,

    /// Number of blocks after which transactions are pruned.
    pub pruning_limit: u64,

    /// Resident-memory ceiling for the stall watchdog, in MiB. Zero disables
    /// the check.
    pub max_memory_mb: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            snowball_k: 2,
            snowball_alpha: 0.8,
            snowball_beta: 150,

            sync_vote_threshold: 0.8,
            finalization_vote_threshold: 0.8,
            stake_majority_weight: 1.0,
            transactions_num_majority_weight: None,

            query_timeout_ms: 5_000,
            gossip_timeout_ms: 5_000,
            download_tx_timeout_ms: 30_000,
            check_out_of_sync_timeout_ms: 5_000,

            sync_chunk_size: 16_384,
            sync_if_block_indices_differ_by: 5,

            tx_sync_chunk_size: 1_000,
            tx_sync_limit: 1 << 20,
            missing_tx_pull_limit: 16_384,

            bloom_filter_m: 1 << 24,
            bloom_filter_k: 3,

            pruning_limit: 30,

            max_memory_mb: 0,
        }
    }
}

impl Config {
    /// Testnet preset: identical to mainnet except for a wider Snowball
    /// sample.
    pub fn testnet() -> Self {
        Config {
            snowball_k: 10,
            ..Config::default()
        }
    }

    /// Load configuration from `cascade.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("cascade.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// The transaction-count tally weight, deriving the automatic value when
    /// it has not been pinned explicitly.
    pub fn transactions_num_weight(&self) -> f64 {
        self.transactions_num_majority_weight
            .unwrap_or(self.finalization_vote_threshold - 1.0 / self.snowball_k.max(1) as f64)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn gossip_timeout(&self) -> Duration {
        Duration::from_millis(self.gossip_timeout_ms)
    }

    pub fn download_tx_timeout(&self) -> Duration {
        Duration::from_millis(self.download_tx_timeout_ms)
    }

    pub fn check_out_of_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.check_out_of_sync_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = Config::default();
        assert_eq!(config.snowball_k, 2);
        assert_eq!(config.snowball_beta, 150);
        assert_eq!(config.pruning_limit, 30);
        assert_eq!(config.sync_chunk_size, 16_384);
        assert_eq!(config.tx_sync_limit, 1 << 20);
    }

    #[test]
    fn testnet_widens_sample() {
        let config = Config::testnet();
        assert_eq!(config.snowball_k, 10);
        assert_eq!(config.snowball_beta, Config::default().snowball_beta);
    }

    #[test]
    fn transactions_num_weight_derivation() {
        let config = Config::default();
        // 0.8 - 1/2
        assert!((config.transactions_num_weight() - 0.3).abs() < 1e-9);

        let pinned = Config {
            transactions_num_majority_weight: Some(0.5),
            ..Config::default()
        };
        assert!((pinned.transactions_num_weight() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
snowball_k = 10
snowball_beta = 20
pruning_limit = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.snowball_k, 10);
        assert_eq!(config.snowball_beta, 20);
        assert_eq!(config.pruning_limit, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.sync_chunk_size, 16_384);
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path());
        assert_eq!(config.snowball_k, 2);
    }
}
