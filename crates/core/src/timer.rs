//! Timer scheduling abstraction.
//!
//! The state machine emits `Action::SetTimer` and `Action::CancelTimer`.
//! This trait abstracts the runtime side:
//! - Production: `TimerManager` spawns tokio tasks
//! - Simulation: inserts into a deterministic event queue

use crate::ChainEvent;
use std::time::Duration;

/// Timer identification for scheduled events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Block re-requests, ping-pong and sync housekeeping.
    StateManager,
    /// Round budgets, proposal start and re-broadcasts.
    Consensus,
}

impl TimerId {
    /// The event delivered when this timer fires.
    pub fn into_event(self) -> ChainEvent {
        match self {
            TimerId::StateManager => ChainEvent::StateManagerTimer,
            TimerId::Consensus => ChainEvent::ConsensusTimer,
        }
    }
}

/// Abstraction for scheduling and cancelling timers.
pub trait TimerScheduler {
    fn set_timer(&mut self, id: TimerId, duration: Duration);
    fn cancel_timer(&mut self, id: TimerId);
}
