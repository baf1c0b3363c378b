//! Consensus configuration.

use crate::RoundStage;
use std::time::Duration;

/// Consensus round configuration.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Interval of the consensus housekeeping tick.
    pub tick_interval: Duration,

    /// Maximum requests per batch.
    pub max_batch_size: usize,

    /// How long a synced node with ready requests waits for the current
    /// leader before rotating to the next one.
    pub leader_timeout: Duration,

    /// Time allowed to gather batch acknowledgements.
    pub proposal_budget: Duration,

    /// Time allowed for the VM to execute the batch.
    pub execution_budget: Duration,

    /// Time allowed to gather signature shares.
    pub signing_budget: Duration,

    /// Time the leader waits for the ledger to acknowledge its post, and a
    /// non-leader waits for the leader's announcement.
    pub posting_budget: Duration,

    /// Time allowed for the ledger to decide on the transaction.
    pub inclusion_budget: Duration,

    /// Interval for re-sending proposals, acknowledgements and shares.
    pub rebroadcast_interval: Duration,

    /// Interval for announcing the local ready list to peers.
    pub announce_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            max_batch_size: 100,
            leader_timeout: Duration::from_secs(3),
            proposal_budget: Duration::from_secs(5),
            execution_budget: Duration::from_secs(10),
            signing_budget: Duration::from_secs(5),
            posting_budget: Duration::from_secs(10),
            inclusion_budget: Duration::from_secs(30),
            rebroadcast_interval: Duration::from_secs(1),
            announce_interval: Duration::from_secs(2),
        }
    }
}

impl ConsensusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    pub fn with_leader_timeout(mut self, timeout: Duration) -> Self {
        self.leader_timeout = timeout;
        self
    }

    /// Use the same budget for every round stage.
    pub fn with_stage_budget(mut self, budget: Duration) -> Self {
        self.proposal_budget = budget;
        self.execution_budget = budget;
        self.signing_budget = budget;
        self.posting_budget = budget;
        self.inclusion_budget = budget;
        self
    }

    /// Time budget of a stage. `None` for `Idle`, which never times out.
    pub fn budget(&self, stage: RoundStage) -> Option<Duration> {
        match stage {
            RoundStage::Idle => None,
            RoundStage::ProposingBatch => Some(self.proposal_budget),
            RoundStage::Executing => Some(self.execution_budget),
            RoundStage::CollectingSignatures => Some(self.signing_budget),
            RoundStage::PostingTransaction => Some(self.posting_budget),
            RoundStage::AwaitingInclusion => Some(self.inclusion_budget),
        }
    }
}
