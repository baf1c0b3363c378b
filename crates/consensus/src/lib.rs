//! Committee consensus rounds for one chain.
//!
//! A round takes a batch of requests the committee has seen, executes it
//! against the current solid state, collects threshold signature shares over
//! the result and anchors the signed transition on the ledger.
//!
//! The state machine is synchronous: execution, ledger posting and peer
//! sends are returned as [`Action`](quorumstate_core::Action)s, and their
//! results come back as events.

mod config;
mod execution;
mod share_set;
mod state;

pub use config::ConsensusConfig;
pub use execution::run_batch;
pub use share_set::{ShareOutcome, ShareSet};
pub use state::{ConsensusState, ConsensusStatus, RoundAbort, RoundStage};
