//! Actions a chain's state machine asks its runner to perform.

use crate::{ChainEvent, PeerMessage, TimerId, VmTask};
use quorumstate_types::{Hash, PeerIndex, RequestId, StateTransaction};
use std::sync::Arc;
use std::time::Duration;

/// Outputs of [`StateMachine::handle`](crate::StateMachine::handle).
///
/// None of these block the event-processing point: sends are
/// fire-and-forget, execution runs on a worker pool and reports back with
/// [`ChainEvent::VmResult`], ledger calls report back with ledger events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Unicast to one committee member.
    SendToPeer {
        target: PeerIndex,
        message: PeerMessage,
    },

    /// Send to every committee member except self.
    Broadcast { message: PeerMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Schedule (or reschedule) a timer.
    SetTimer { id: TimerId, duration: Duration },

    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════
    /// Feed an event back into the intake ahead of external input.
    EnqueueInternal { event: ChainEvent },

    /// Execute a batch off the serialized path.
    ExecuteBatch { task: VmTask },

    // ═══════════════════════════════════════════════════════════════════════
    // Ledger
    // ═══════════════════════════════════════════════════════════════════════
    PostTransaction { transaction: Arc<StateTransaction> },

    QueryInclusionState { tx_id: Hash },

    // ═══════════════════════════════════════════════════════════════════════
    // Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// A request was consumed by a state the chain has applied.
    EmitRequestProcessed { request_id: RequestId },

    /// The local state cannot be reconciled with the ledger.
    ReportFatal { reason: String },
}

impl Action {
    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::SendToPeer { .. } => "SendToPeer",
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::ExecuteBatch { .. } => "ExecuteBatch",
            Action::PostTransaction { .. } => "PostTransaction",
            Action::QueryInclusionState { .. } => "QueryInclusionState",
            Action::EmitRequestProcessed { .. } => "EmitRequestProcessed",
            Action::ReportFatal { .. } => "ReportFatal",
        }
    }
}
