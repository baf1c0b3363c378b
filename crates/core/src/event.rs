//! Events processed by a chain's state machine.

use crate::{PeerMessage, VmError, VmOutput};
use quorumstate_types::{
    Hash, InclusionState, PeerIndex, Request, RequestId, StateBlock, StateIndex, StateOutput,
    VirtualState,
};
use std::sync::Arc;

/// Priority levels for event ordering within the same timestamp.
///
/// Lower values = higher priority (processed first). Internal events are
/// consequences of earlier processing and run before new external input,
/// which preserves causality in the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing.
    Internal = 0,

    /// Timer events scheduled by the node itself.
    Timer = 1,

    /// Ledger and peer input.
    Network = 2,

    /// New requests from clients.
    Client = 3,
}

/// Every input a chain reacts to, delivered through one ordered intake.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    // ═══════════════════════════════════════════════════════════════════════
    // Ledger
    // ═══════════════════════════════════════════════════════════════════════
    /// The ledger anchored a new state output for this chain.
    StateOutput { output: StateOutput },

    /// Verdict on a transaction this chain posted or is tracking.
    TransactionInclusionState { tx_id: Hash, state: InclusionState },

    // ═══════════════════════════════════════════════════════════════════════
    // Peers
    // ═══════════════════════════════════════════════════════════════════════
    /// A message from another committee member.
    PeerMessage {
        from: PeerIndex,
        message: PeerMessage,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// State manager housekeeping tick.
    StateManagerTimer,

    /// Consensus round tick.
    ConsensusTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════
    /// Consensus produced a block it expects the ledger to confirm.
    PendingBlock {
        block: Arc<StateBlock>,
        state_hash: Hash,
    },

    /// The VM finished a batch.
    VmResult {
        state_index: StateIndex,
        batch_hash: Hash,
        result: Result<VmOutput, VmError>,
    },

    /// The state manager reached a new solid state matching the ledger.
    StateTransition {
        state: Arc<VirtualState>,
        output: StateOutput,
        /// Requests consumed by the blocks applied since the last transition.
        request_ids: Vec<RequestId>,
    },

    /// Consensus saw its round's transaction included.
    BatchFinalized {
        state_index: StateIndex,
        request_ids: Vec<RequestId>,
    },

    /// Another subsystem learned that a higher state index exists.
    EvidenceStateIndex { index: StateIndex },

    // ═══════════════════════════════════════════════════════════════════════
    // Ingress
    // ═══════════════════════════════════════════════════════════════════════
    /// A new request addressed to this chain.
    ReceiveRequest { request: Arc<Request> },
}

impl ChainEvent {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            ChainEvent::StateManagerTimer | ChainEvent::ConsensusTimer => EventPriority::Timer,

            ChainEvent::StateOutput { .. }
            | ChainEvent::TransactionInclusionState { .. }
            | ChainEvent::PeerMessage { .. } => EventPriority::Network,

            ChainEvent::ReceiveRequest { .. } => EventPriority::Client,

            ChainEvent::PendingBlock { .. }
            | ChainEvent::VmResult { .. }
            | ChainEvent::StateTransition { .. }
            | ChainEvent::BatchFinalized { .. }
            | ChainEvent::EvidenceStateIndex { .. } => EventPriority::Internal,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            ChainEvent::StateOutput { .. } => "StateOutput",
            ChainEvent::TransactionInclusionState { .. } => "TransactionInclusionState",
            ChainEvent::PeerMessage { message, .. } => message.type_name(),
            ChainEvent::StateManagerTimer => "StateManagerTimer",
            ChainEvent::ConsensusTimer => "ConsensusTimer",
            ChainEvent::PendingBlock { .. } => "PendingBlock",
            ChainEvent::VmResult { .. } => "VmResult",
            ChainEvent::StateTransition { .. } => "StateTransition",
            ChainEvent::BatchFinalized { .. } => "BatchFinalized",
            ChainEvent::EvidenceStateIndex { .. } => "EvidenceStateIndex",
            ChainEvent::ReceiveRequest { .. } => "ReceiveRequest",
        }
    }
}
