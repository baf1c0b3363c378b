//! Block synchronization for one chain.
//!
//! The [`StateManager`] owns the chain's solid virtual state. It follows the
//! state outputs the ledger anchors, fetches missing blocks from committee
//! peers, and reports each reconciled state to the rest of the chain as a
//! `StateTransition` event.

mod config;
mod state;

pub use config::StateManagerConfig;
pub use state::{FatalStateError, StateManager, SyncError, SyncStateKind, SyncStatus};
