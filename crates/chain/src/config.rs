//! Chain configuration.

use quorumstate_consensus::ConsensusConfig;
use quorumstate_mempool::MempoolConfig;
use quorumstate_statemgr::StateManagerConfig;

/// Configuration for every component of one chain.
#[derive(Debug, Default, Clone)]
pub struct ChainConfig {
    pub mempool: MempoolConfig,
    pub state_manager: StateManagerConfig,
    pub consensus: ConsensusConfig,
}

impl ChainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mempool(mut self, mempool: MempoolConfig) -> Self {
        self.mempool = mempool;
        self
    }

    pub fn with_state_manager(mut self, state_manager: StateManagerConfig) -> Self {
        self.state_manager = state_manager;
        self
    }

    pub fn with_consensus(mut self, consensus: ConsensusConfig) -> Self {
        self.consensus = consensus;
        self
    }
}
