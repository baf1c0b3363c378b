//! Node configuration file.
//!
//! ```toml
//! [runner]
//! vm_threads = 4
//! status_interval_ms = 500
//!
//! [devnet]
//! nodes = 4
//! threshold = 3
//! seed = 7
//! request_interval_ms = 250
//!
//! [mempool]
//! max_requests = 10000
//!
//! [state_manager]
//! housekeeping_interval_ms = 500
//! sync_window = 64
//!
//! [consensus]
//! tick_interval_ms = 200
//! max_batch_size = 100
//! ```
//!
//! Every field is optional. Durations are milliseconds and are converted
//! into the component configs by [`NodeConfig::chain_config`].

use quorumstate_chain::ChainConfig;
use quorumstate_consensus::ConsensusConfig;
use quorumstate_mempool::MempoolConfig;
use quorumstate_statemgr::StateManagerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading a node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub runner: RunnerSection,

    #[serde(default)]
    pub devnet: DevnetSection,

    #[serde(default)]
    pub mempool: MempoolConfig,

    #[serde(default)]
    pub state_manager: StateManagerSection,

    #[serde(default)]
    pub consensus: ConsensusSection,
}

/// Runner resources.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    /// Execution threads shared by every chain. 0 means half the cores.
    #[serde(default)]
    pub vm_threads: usize,

    /// How often each chain publishes its status snapshot.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

fn default_status_interval_ms() -> u64 {
    500
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            vm_threads: 0,
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

/// Local committee run by the `quorumstate-node` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct DevnetSection {
    #[serde(default = "default_nodes")]
    pub nodes: u16,

    #[serde(default = "default_threshold")]
    pub threshold: u16,

    /// Seed for dealing the committee key shares.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Interval between generated requests. 0 disables the generator.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
}

fn default_nodes() -> u16 {
    4
}

fn default_threshold() -> u16 {
    3
}

fn default_seed() -> u64 {
    1
}

fn default_request_interval_ms() -> u64 {
    250
}

impl Default for DevnetSection {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            threshold: default_threshold(),
            seed: default_seed(),
            request_interval_ms: default_request_interval_ms(),
        }
    }
}

/// State manager timings.
#[derive(Debug, Clone, Deserialize)]
pub struct StateManagerSection {
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,

    #[serde(default = "default_block_request_timeout_ms")]
    pub block_request_timeout_ms: u64,

    #[serde(default = "default_max_request_backoff_ms")]
    pub max_request_backoff_ms: u64,

    #[serde(default = "default_pingpong_interval_ms")]
    pub pingpong_interval_ms: u64,

    #[serde(default = "default_sync_window")]
    pub sync_window: u32,

    #[serde(default = "default_block_history")]
    pub block_history: usize,
}

fn default_housekeeping_interval_ms() -> u64 {
    500
}

fn default_block_request_timeout_ms() -> u64 {
    1_000
}

fn default_max_request_backoff_ms() -> u64 {
    16_000
}

fn default_pingpong_interval_ms() -> u64 {
    2_000
}

fn default_sync_window() -> u32 {
    64
}

fn default_block_history() -> usize {
    256
}

impl Default for StateManagerSection {
    fn default() -> Self {
        Self {
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            block_request_timeout_ms: default_block_request_timeout_ms(),
            max_request_backoff_ms: default_max_request_backoff_ms(),
            pingpong_interval_ms: default_pingpong_interval_ms(),
            sync_window: default_sync_window(),
            block_history: default_block_history(),
        }
    }
}

impl From<&StateManagerSection> for StateManagerConfig {
    fn from(s: &StateManagerSection) -> Self {
        StateManagerConfig {
            housekeeping_interval: Duration::from_millis(s.housekeeping_interval_ms),
            block_request_timeout: Duration::from_millis(s.block_request_timeout_ms),
            max_request_backoff: Duration::from_millis(s.max_request_backoff_ms),
            pingpong_interval: Duration::from_millis(s.pingpong_interval_ms),
            sync_window: s.sync_window,
            block_history: s.block_history,
        }
    }
}

/// Consensus timings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Idle time before the next member takes over as leader.
    #[serde(default = "default_leader_timeout_ms")]
    pub leader_timeout_ms: u64,

    #[serde(default = "default_proposal_budget_ms")]
    pub proposal_budget_ms: u64,

    #[serde(default = "default_execution_budget_ms")]
    pub execution_budget_ms: u64,

    #[serde(default = "default_signing_budget_ms")]
    pub signing_budget_ms: u64,

    #[serde(default = "default_posting_budget_ms")]
    pub posting_budget_ms: u64,

    #[serde(default = "default_inclusion_budget_ms")]
    pub inclusion_budget_ms: u64,

    #[serde(default = "default_rebroadcast_interval_ms")]
    pub rebroadcast_interval_ms: u64,

    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_max_batch_size() -> usize {
    100
}

fn default_leader_timeout_ms() -> u64 {
    3_000
}

fn default_proposal_budget_ms() -> u64 {
    5_000
}

fn default_execution_budget_ms() -> u64 {
    10_000
}

fn default_signing_budget_ms() -> u64 {
    5_000
}

fn default_posting_budget_ms() -> u64 {
    10_000
}

fn default_inclusion_budget_ms() -> u64 {
    30_000
}

fn default_rebroadcast_interval_ms() -> u64 {
    1_000
}

fn default_announce_interval_ms() -> u64 {
    2_000
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_batch_size: default_max_batch_size(),
            leader_timeout_ms: default_leader_timeout_ms(),
            proposal_budget_ms: default_proposal_budget_ms(),
            execution_budget_ms: default_execution_budget_ms(),
            signing_budget_ms: default_signing_budget_ms(),
            posting_budget_ms: default_posting_budget_ms(),
            inclusion_budget_ms: default_inclusion_budget_ms(),
            rebroadcast_interval_ms: default_rebroadcast_interval_ms(),
            announce_interval_ms: default_announce_interval_ms(),
        }
    }
}

impl From<&ConsensusSection> for ConsensusConfig {
    fn from(s: &ConsensusSection) -> Self {
        ConsensusConfig {
            tick_interval: Duration::from_millis(s.tick_interval_ms),
            max_batch_size: s.max_batch_size,
            leader_timeout: Duration::from_millis(s.leader_timeout_ms),
            proposal_budget: Duration::from_millis(s.proposal_budget_ms),
            execution_budget: Duration::from_millis(s.execution_budget_ms),
            signing_budget: Duration::from_millis(s.signing_budget_ms),
            posting_budget: Duration::from_millis(s.posting_budget_ms),
            inclusion_budget: Duration::from_millis(s.inclusion_budget_ms),
            rebroadcast_interval: Duration::from_millis(s.rebroadcast_interval_ms),
            announce_interval: Duration::from_millis(s.announce_interval_ms),
        }
    }
}

impl NodeConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let devnet = &self.devnet;
        if devnet.nodes == 0 {
            return Err(ConfigError::Invalid("devnet.nodes must be at least 1".into()));
        }
        if devnet.threshold == 0 || devnet.threshold > devnet.nodes {
            return Err(ConfigError::Invalid(format!(
                "devnet.threshold must be in 1..={}, got {}",
                devnet.nodes, devnet.threshold
            )));
        }
        if self.consensus.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "consensus.tick_interval_ms must be positive".into(),
            ));
        }
        if self.consensus.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "consensus.max_batch_size must be positive".into(),
            ));
        }
        if self.state_manager.sync_window == 0 {
            return Err(ConfigError::Invalid(
                "state_manager.sync_window must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Component configuration for one chain.
    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig::new()
            .with_mempool(self.mempool.clone())
            .with_state_manager(StateManagerConfig::from(&self.state_manager))
            .with_consensus(ConsensusConfig::from(&self.consensus))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.runner.status_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.devnet.nodes, 4);
        assert_eq!(config.devnet.threshold, 3);

        let chain = config.chain_config();
        let defaults = ChainConfig::default();
        assert_eq!(chain.consensus.tick_interval, defaults.consensus.tick_interval);
        assert_eq!(chain.consensus.inclusion_budget, defaults.consensus.inclusion_budget);
        assert_eq!(chain.state_manager.sync_window, defaults.state_manager.sync_window);
        assert_eq!(
            chain.state_manager.housekeeping_interval,
            defaults.state_manager.housekeeping_interval
        );
        assert_eq!(chain.mempool.max_requests, defaults.mempool.max_requests);
    }

    #[test]
    fn test_sections_convert_milliseconds() {
        let config = NodeConfig::from_toml_str(
            r#"
            [mempool]
            max_requests = 50

            [state_manager]
            block_request_timeout_ms = 250

            [consensus]
            tick_interval_ms = 50
            leader_timeout_ms = 1500
            "#,
        )
        .unwrap();
        let chain = config.chain_config();
        assert_eq!(chain.mempool.max_requests, 50);
        assert_eq!(
            chain.state_manager.block_request_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(chain.consensus.tick_interval, Duration::from_millis(50));
        assert_eq!(chain.consensus.leader_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = NodeConfig::from_toml_str("[devnet]\nnodes = 3\nthreshold = 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = NodeConfig::from_toml_str("[consensus]\ntick_interval_ms = \"fast\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
