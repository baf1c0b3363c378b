//! The committee-signed state transition posted to the ledger.

use crate::{AggregateSignature, ChainId, Hash, StateIndex, StateOutput};
use serde::{Deserialize, Serialize};

/// Domain tag for the state transition signing message.
///
/// Format: `STATE_TRANSITION` || chain_id || index || prev_state_hash ||
/// state_hash || block_hash || timestamp
pub const DOMAIN_STATE_TRANSITION: &[u8] = b"STATE_TRANSITION";

/// Everything the committee signs for one round.
///
/// Its hash is the round's result hash: identical on every honest member
/// that executed the same batch against the same state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionEssence {
    pub chain_id: ChainId,
    /// Index of the state this transaction produces.
    pub index: StateIndex,
    pub prev_state_hash: Hash,
    pub state_hash: Hash,
    pub block_hash: Hash,
    pub timestamp: u64,
}

impl TransactionEssence {
    /// Domain-separated bytes signed by each committee member.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(DOMAIN_STATE_TRANSITION.len() + 140);
        message.extend_from_slice(DOMAIN_STATE_TRANSITION);
        message.extend_from_slice(self.chain_id.as_bytes());
        message.extend_from_slice(&self.index.0.to_le_bytes());
        message.extend_from_slice(self.prev_state_hash.as_bytes());
        message.extend_from_slice(self.state_hash.as_bytes());
        message.extend_from_slice(self.block_hash.as_bytes());
        message.extend_from_slice(&self.timestamp.to_le_bytes());
        message
    }

    pub fn hash(&self) -> Hash {
        Hash::from_bytes(&self.signing_message())
    }
}

/// A state transition with the committee's aggregate signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransaction {
    pub essence: TransactionEssence,
    pub signature: AggregateSignature,
}

impl StateTransaction {
    /// Ledger transaction id. Equal to the essence hash, so every member
    /// knows it before the leader posts.
    pub fn tx_id(&self) -> Hash {
        self.essence.hash()
    }

    /// The state output this transaction anchors once included.
    pub fn output(&self) -> StateOutput {
        StateOutput {
            output_id: self.tx_id(),
            index: self.essence.index,
            state_hash: self.essence.state_hash,
            timestamp: self.essence.timestamp,
        }
    }
}

/// The ledger's verdict on a posted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InclusionState {
    /// Known to the ledger but not yet decided.
    Pending,
    Included,
    Rejected,
    Conflicting,
}

impl InclusionState {
    /// Whether the verdict is terminal.
    pub fn is_final(&self) -> bool {
        !matches!(self, InclusionState::Pending)
    }
}
