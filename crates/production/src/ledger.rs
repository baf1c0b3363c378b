//! In-process ledger.
//!
//! Anchors one state output per chain, verifies posted transactions against
//! the committee key and pushes outputs and inclusion verdicts to every
//! subscribed chain runner.

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use quorumstate_core::{ChainEvent, LedgerClient};
use quorumstate_types::{
    ChainId, DkShare, Hash, InclusionState, StateOutput, StateTransaction, VirtualState,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Chain {0} is not registered with the ledger")]
    UnknownChain(ChainId),
}

struct LedgerChain {
    /// Any share of the committee; only its public material is used.
    verifier: Arc<DkShare>,
    anchored: StateOutput,
    verdicts: HashMap<Hash, InclusionState>,
    subscribers: Vec<Sender<ChainEvent>>,
}

impl LedgerChain {
    fn publish(&mut self, event: ChainEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn judge(&self, chain_id: ChainId, tx: &StateTransaction) -> InclusionState {
        if tx.essence.chain_id != chain_id {
            return InclusionState::Rejected;
        }
        let message = tx.essence.signing_message();
        if let Err(e) = self.verifier.verify_aggregate(&message, &tx.signature) {
            warn!(chain = %chain_id, error = %e, "Rejecting transaction with bad signature");
            return InclusionState::Rejected;
        }
        if tx.essence.index != self.anchored.index.next()
            || tx.essence.prev_state_hash != self.anchored.state_hash
        {
            return InclusionState::Conflicting;
        }
        InclusionState::Included
    }
}

/// Ledger kept in memory, shared by every node of a local deployment.
#[derive(Default)]
pub struct MemoryLedger {
    chains: Mutex<HashMap<ChainId, LedgerChain>>,
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("chains", &self.chains.lock().len())
            .finish()
    }
}

/// Output id the ledger gives a chain's origin state.
pub fn origin_output(state: &VirtualState) -> StateOutput {
    StateOutput {
        output_id: Hash::from_parts(&[b"ORIGIN".as_slice(), &state.chain_id().as_bytes()[..]]),
        index: state.index(),
        state_hash: state.hash(),
        timestamp: state.timestamp(),
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor `origin` for a new chain governed by `verifier`'s committee.
    /// Re-registering an existing chain is a no-op.
    pub fn register_chain(&self, chain_id: ChainId, verifier: Arc<DkShare>, origin: &VirtualState) {
        self.chains.lock().entry(chain_id).or_insert_with(|| {
            info!(chain = %chain_id, "Chain registered with ledger");
            LedgerChain {
                verifier,
                anchored: origin_output(origin),
                verdicts: HashMap::new(),
                subscribers: Vec::new(),
            }
        });
    }

    /// Route a chain's ledger events to `subscriber`. The current anchored
    /// output is delivered right away.
    pub fn subscribe(
        &self,
        chain_id: ChainId,
        subscriber: Sender<ChainEvent>,
    ) -> Result<(), LedgerError> {
        let mut chains = self.chains.lock();
        let chain = chains
            .get_mut(&chain_id)
            .ok_or(LedgerError::UnknownChain(chain_id))?;
        if subscriber
            .send(ChainEvent::StateOutput {
                output: chain.anchored,
            })
            .is_ok()
        {
            chain.subscribers.push(subscriber);
        }
        Ok(())
    }

    pub fn anchored_output(&self, chain_id: &ChainId) -> Option<StateOutput> {
        self.chains.lock().get(chain_id).map(|c| c.anchored)
    }

    pub fn verdict(&self, chain_id: &ChainId, tx_id: &Hash) -> Option<InclusionState> {
        self.chains
            .lock()
            .get(chain_id)
            .and_then(|c| c.verdicts.get(tx_id).copied())
    }
}

impl LedgerClient for MemoryLedger {
    fn post_transaction(&self, chain_id: ChainId, transaction: Arc<StateTransaction>) {
        let mut chains = self.chains.lock();
        let Some(chain) = chains.get_mut(&chain_id) else {
            warn!(chain = %chain_id, "Transaction for unknown chain");
            return;
        };
        let tx_id = transaction.tx_id();
        if chain.verdicts.contains_key(&tx_id) {
            return;
        }

        let verdict = chain.judge(chain_id, &transaction);
        chain.verdicts.insert(tx_id, verdict);
        debug!(chain = %chain_id, ?tx_id, ?verdict, "Transaction judged");
        if verdict == InclusionState::Included {
            chain.anchored = transaction.output();
            info!(
                chain = %chain_id,
                index = chain.anchored.index.0,
                "State anchored"
            );
            let output = chain.anchored;
            chain.publish(ChainEvent::StateOutput { output });
        }
    }

    fn request_inclusion_state(&self, chain_id: ChainId, tx_id: Hash) {
        let mut chains = self.chains.lock();
        let Some(chain) = chains.get_mut(&chain_id) else {
            return;
        };
        let state = chain
            .verdicts
            .get(&tx_id)
            .copied()
            .unwrap_or(InclusionState::Pending);
        chain.publish(ChainEvent::TransactionInclusionState { tx_id, state });
    }
}
