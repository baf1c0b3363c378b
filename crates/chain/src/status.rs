//! Serializable chain snapshot.

use quorumstate_consensus::ConsensusStatus;
use quorumstate_statemgr::SyncStatus;
use quorumstate_types::ChainId;
use serde::Serialize;

/// Point-in-time view of one chain for operators and APIs.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub chain_id: ChainId,
    pub sync: SyncStatus,
    pub consensus: ConsensusStatus,
    pub mempool_size: usize,
    pub tombstones: usize,
    pub dismissed: bool,
    /// Why the chain stopped building on its state, if it did.
    pub fatal: Option<String>,
}
