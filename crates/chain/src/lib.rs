//! Per-chain orchestrator.
//!
//! [`ChainStateMachine`] composes the mempool, state manager and consensus
//! of one chain behind a single [`StateMachine`](quorumstate_core::StateMachine)
//! and keeps them consistent: consensus only proposes on a synced state, and
//! the state manager holds block application while a round is in flight.
//!
//! The registry traits describe where chain and committee records and this
//! node's key shares come from; [`MemoryRegistry`] is the in-process
//! implementation.

mod config;
mod error;
mod registry;
mod state;
mod status;

pub use config::ChainConfig;
pub use error::ChainError;
pub use registry::{DkShareProvider, MemoryRegistry, RegistryError, RegistryProvider};
pub use state::ChainStateMachine;
pub use status::ChainStatus;
