//! Production runner for quorumstate chains.
//!
//! Wraps the deterministic [`ChainStateMachine`](quorumstate_chain::ChainStateMachine)
//! with real threads and I/O:
//!
//! - One loop thread per chain draining an ordered crossbeam intake
//! - Timers as tokio sleeps feeding the intake
//! - Batch execution on a shared rayon pool
//! - Ledger calls through [`LedgerClient`](quorumstate_core::LedgerClient)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Node                                      │
//! │                                                                         │
//! │  Chains (registry + factory)                                            │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │  ChainHandle per active chain                                       ││
//! │  │    └─ chain-<id> thread: loop { event = recv(); handle(event); }    ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                │                                        │
//! │    ┌───────────────────────────┼───────────────────────────────┐        │
//! │    ▼                           ▼                               ▼        │
//! │  VM Pool (rayon)          Timers (tokio)               Committee        │
//! │  - run_batch              - StateManagerTimer          - PeerTransport  │
//! │                           - ConsensusTimer                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`LocalDevnet`] runs a whole committee in one process over
//! [`MemoryHub`] and [`MemoryLedger`]; the `quorumstate-node` binary is a thin
//! wrapper around it.
//!
//! ```no_run
//! use quorumstate_production::{KeyValueVm, LocalDevnet, NodeConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::default();
//! let devnet = LocalDevnet::start(&config, Arc::new(KeyValueVm), tokio::runtime::Handle::current())?;
//! devnet.submit(&KeyValueVm::set_request(1, 0, "greeting", b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```

mod chains;
mod config;
mod devnet;
mod event_loop;
mod ledger;
mod runner;
mod thread_pools;
mod timers;
mod transport;
mod vm;

pub use chains::{ChainFactory, Chains, ChainsError};
pub use config::{
    ConfigError, ConsensusSection, DevnetSection, NodeConfig, RunnerSection, StateManagerSection,
};
pub use devnet::{DevnetError, DevnetNode, LocalDevnet};
pub use ledger::{origin_output, LedgerError, MemoryLedger};
pub use runner::{spawn_chain, ChainHandle, RunnerError, RunnerServices, ShutdownHandle};
pub use thread_pools::{ThreadPoolError, VmPool, VmPoolConfig};
pub use timers::TimerManager;
pub use transport::MemoryHub;
pub use vm::KeyValueVm;
