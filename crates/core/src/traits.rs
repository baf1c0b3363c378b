//! Core traits for state machines and external collaborators.

use crate::{Action, ChainEvent, StateView, VmError};
use quorumstate_types::{ChainId, Hash, Request, StateDelta, StateTransaction};
use std::sync::Arc;
use std::time::Duration;

/// A state machine that processes events.
///
/// Every component of a chain is written as a state machine that is:
///
/// - **Synchronous**: No async, no `.await`
/// - **Deterministic**: Same state + event = same actions
/// - **Pure-ish**: Mutates self, but performs no I/O
///
/// The runner (production or simulation) owns the I/O: it delivers events
/// one at a time and executes the returned actions.
pub trait StateMachine {
    /// Process an event, returning actions to perform.
    fn handle(&mut self, event: ChainEvent) -> Vec<Action>;

    /// Set the current time.
    ///
    /// Called by the runner before each `handle()` call.
    fn set_time(&mut self, now: Duration);

    /// Get the current time.
    fn now(&self) -> Duration;
}

/// The virtual machine that executes requests.
///
/// Implementations must be deterministic: the same request applied to the
/// same view must produce the same delta on every node, or committee
/// members will sign different result hashes.
pub trait VmProcessor: Send + Sync {
    /// Execute one request against `view`, returning its state mutations.
    ///
    /// An `Err` marks the request as failed; it is still consumed, with no
    /// writes.
    fn process(
        &self,
        view: &StateView<'_>,
        request: &Request,
        blobs: &dyn BlobCache,
    ) -> Result<StateDelta, VmError>;
}

/// Content-addressed blob store consulted during admission and execution.
pub trait BlobCache: Send + Sync {
    fn has_blob(&self, hash: &Hash) -> bool;

    fn get_blob(&self, hash: &Hash) -> Option<Arc<Vec<u8>>>;

    /// Store `data`, returning its content hash.
    fn put_blob(&self, data: Vec<u8>) -> Hash;
}

/// The ledger client: sink for signed transactions and source of inclusion
/// verdicts.
///
/// Both calls are fire-and-forget. Verdicts and new state outputs come back
/// to the chain as [`ChainEvent::TransactionInclusionState`] and
/// [`ChainEvent::StateOutput`].
pub trait LedgerClient: Send + Sync {
    fn post_transaction(&self, chain_id: ChainId, transaction: Arc<StateTransaction>);

    fn request_inclusion_state(&self, chain_id: ChainId, tx_id: Hash);
}
