//! Registry records and peer status views.

use crate::{ChainId, Hash, PeerIndex};
use serde::{Deserialize, Serialize};

/// Point-in-time liveness of one committee member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub index: PeerIndex,
    pub peering_id: String,
    pub is_self: bool,
    pub connected: bool,
}

/// Persistent description of a chain this node serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub chain_id: ChainId,
    /// Control address of the committee that runs the chain.
    pub committee_address: Hash,
    pub active: bool,
}

/// Peering ids of a committee, in peer index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeRecord {
    pub address: Hash,
    pub nodes: Vec<String>,
}
