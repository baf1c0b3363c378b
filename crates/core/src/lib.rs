//! Core types for the quorumstate chain engine.
//!
//! This crate provides the foundational types for the per-chain state
//! machine architecture:
//!
//! - [`ChainEvent`]: All possible inputs to a chain
//! - [`Action`]: All possible outputs from a chain
//! - [`PeerMessage`]: The logical committee message set
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait that all state machines implement
//! - [`VmProcessor`], [`BlobCache`], [`LedgerClient`]: external collaborators
//!
//! # Architecture
//!
//! ```text
//! ledger / peers / timers / clients
//!              │
//!              ▼
//!     ordered intake (ChainEvent)
//!              │
//!              ▼
//!   StateMachine::handle() ──► Vec<Action> ──► runner performs I/O
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O

mod action;
mod blob;
mod event;
mod message;
mod timer;
mod traits;
mod vm;

pub use action::Action;
pub use blob::MemoryBlobCache;
pub use event::{ChainEvent, EventPriority};
pub use message::{
    BlockHeaderMsg, GetBlockMsg, NotifyFinalResultPostedMsg, NotifyReqMsg, PeerMessage,
    SignedHashMsg, StartProcessingBatchMsg, StateIndexPingPongMsg, StateUpdateMsg,
};
pub use timer::{TimerId, TimerScheduler};
pub use traits::{BlobCache, LedgerClient, StateMachine, VmProcessor};
pub use vm::{StateView, VmError, VmOutput, VmTask};
