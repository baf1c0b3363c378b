//! Deterministic simulation of one chain's committee.
//!
//! Every member runs a real [`ChainStateMachine`](quorumstate_chain::ChainStateMachine);
//! the network, the ledger and the VM worker are simulated in-process. Given
//! the same seed, a run produces identical results every time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Event Queue (BTreeMap<EventKey, ChainEvent>)   │ │
//! │  │     Ordered by: time, priority, node, sequence     │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     nodes: one ChainStateMachine per member        │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │ actions                     │
//! │              ┌────────────┼─────────────┐               │
//! │              ▼            ▼             ▼               │
//! │       SimCommittee    SimLedger     run_batch           │
//! │       (outbox →       (verdicts,    (VmResult after     │
//! │        network)        outputs)      execution delay)   │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod committee;
mod event_queue;
mod ledger;
mod network;
mod runner;

pub use committee::SimCommittee;
pub use event_queue::EventKey;
pub use ledger::{LedgerStats, SimLedger};
pub use network::{Links, NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationConfig, SimulationError, SimulationRunner, SimulationStats};

/// Position of a member in the simulated committee.
///
/// Same numbering as the member's [`PeerIndex`](quorumstate_types::PeerIndex).
pub type NodeIndex = u16;
