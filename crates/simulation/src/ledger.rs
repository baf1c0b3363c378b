//! Simulated ledger for a single chain.

use quorumstate_types::{
    ChainId, DkShare, Hash, InclusionState, StateOutput, StateTransaction, VirtualState,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters over every posted transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LedgerStats {
    pub posted: u64,
    pub duplicates: u64,
    pub included: u64,
    pub rejected: u64,
    pub conflicting: u64,
}

/// Ledger anchoring one chain's state outputs.
///
/// A posted transaction is included when it carries a valid aggregate
/// signature and extends the anchored output. Tests can override the
/// verdict of upcoming valid transactions to exercise ledger rejections.
#[derive(Debug)]
pub struct SimLedger {
    chain_id: ChainId,
    verifier: Arc<DkShare>,
    anchored: StateOutput,
    history: Vec<StateOutput>,
    verdicts: BTreeMap<Hash, InclusionState>,
    forced: VecDeque<InclusionState>,
    stats: LedgerStats,
}

impl SimLedger {
    /// Anchor `origin`; transactions are verified with `verifier`'s
    /// committee key.
    pub fn new(verifier: Arc<DkShare>, origin: &VirtualState) -> Self {
        let chain_id = origin.chain_id();
        let anchored = StateOutput {
            output_id: Hash::from_parts(&[b"ORIGIN".as_slice(), &chain_id.as_bytes()[..]]),
            index: origin.index(),
            state_hash: origin.hash(),
            timestamp: origin.timestamp(),
        };
        Self {
            chain_id,
            verifier,
            anchored,
            history: vec![anchored],
            verdicts: BTreeMap::new(),
            forced: VecDeque::new(),
            stats: LedgerStats::default(),
        }
    }

    pub fn anchored(&self) -> StateOutput {
        self.anchored
    }

    /// Every anchored output, origin first.
    pub fn history(&self) -> &[StateOutput] {
        &self.history
    }

    pub fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    /// Give the next valid transaction `verdict` instead of including it.
    pub fn force_next_verdict(&mut self, verdict: InclusionState) {
        self.forced.push_back(verdict);
    }

    /// Verdict for a posted transaction; `Pending` if never seen.
    pub fn inclusion_state(&self, tx_id: &Hash) -> InclusionState {
        self.verdicts
            .get(tx_id)
            .copied()
            .unwrap_or(InclusionState::Pending)
    }

    fn judge(&self, tx: &StateTransaction) -> InclusionState {
        if tx.essence.chain_id != self.chain_id {
            return InclusionState::Rejected;
        }
        let message = tx.essence.signing_message();
        if let Err(e) = self.verifier.verify_aggregate(&message, &tx.signature) {
            warn!(error = %e, "Ledger rejecting transaction with bad signature");
            return InclusionState::Rejected;
        }
        if tx.essence.index != self.anchored.index.next()
            || tx.essence.prev_state_hash != self.anchored.state_hash
        {
            return InclusionState::Conflicting;
        }
        InclusionState::Included
    }

    /// Judge a posted transaction. Returns the verdict and, when included,
    /// the newly anchored output.
    pub fn post(&mut self, tx: &StateTransaction) -> (InclusionState, Option<StateOutput>) {
        let tx_id = tx.tx_id();
        if let Some(&verdict) = self.verdicts.get(&tx_id) {
            self.stats.duplicates += 1;
            return (verdict, None);
        }
        self.stats.posted += 1;

        let mut verdict = self.judge(tx);
        if verdict == InclusionState::Included {
            if let Some(forced) = self.forced.pop_front() {
                verdict = forced;
            }
        }
        self.verdicts.insert(tx_id, verdict);
        debug!(?tx_id, ?verdict, index = tx.essence.index.0, "Ledger verdict");

        match verdict {
            InclusionState::Included => {
                self.stats.included += 1;
                self.anchored = tx.output();
                self.history.push(self.anchored);
                info!(index = self.anchored.index.0, "Ledger anchored state");
                (verdict, Some(self.anchored))
            }
            InclusionState::Rejected => {
                self.stats.rejected += 1;
                (verdict, None)
            }
            InclusionState::Conflicting => {
                self.stats.conflicting += 1;
                (verdict, None)
            }
            InclusionState::Pending => (verdict, None),
        }
    }
}
