//! Consensus round state machine.
//!
//! One round turns a batch of ready requests into a committee-signed state
//! transition anchored on the ledger.
//!
//! # Stages
//!
//! ```text
//!  Idle ──(leader: ready batch)──► ProposingBatch ──(quorum acks)──► Executing
//!   ▲                                                                    │
//!   │                                                          VM result │
//!   │                                                                    ▼
//!   │   AwaitingInclusion ◄──(posted)── PostingTransaction ◄── CollectingSignatures
//!   │          │                                   (threshold shares over one hash)
//!   └──────────┘ included, or any abort
//! ```
//!
//! The leader of a round is `(state_index + attempt) mod size`. `attempt`
//! starts at 0 for every new state index, grows by one on each aborted
//! round (and when an idle leader is skipped), and a node adopts a higher
//! attempt it sees in a valid proposal from that attempt's leader.
//!
//! Consensus never mutates the solid state or the mempool. The chain
//! applies the outcome: `BatchFinalized` and `StateTransition` remove the
//! consumed requests, and the state manager applies the block once the
//! ledger confirms it.

use crate::share_set::{ShareOutcome, ShareSet};
use crate::ConsensusConfig;
use quorumstate_committee::Committee;
use quorumstate_core::{
    Action, ChainEvent, NotifyFinalResultPostedMsg, NotifyReqMsg, PeerMessage, SignedHashMsg,
    StartProcessingBatchMsg, TimerId, VmError, VmOutput, VmTask,
};
use quorumstate_mempool::MempoolState;
use quorumstate_metrics as metrics;
use quorumstate_types::{
    ChainId, CryptoError, Hash, InclusionState, PeerIndex, Request, RequestId, SignatureShare,
    StateIndex, StateOutput, StateTransaction, TransactionEssence, VirtualState,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Upper bound on batches tracked for acknowledgements or shares that
/// arrive before their proposal.
const MAX_EARLY_BATCHES: usize = 16;

/// Stage of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStage {
    Idle,
    ProposingBatch,
    Executing,
    CollectingSignatures,
    PostingTransaction,
    AwaitingInclusion,
}

impl RoundStage {
    /// Returns a string representation for metrics/logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStage::Idle => "idle",
            RoundStage::ProposingBatch => "proposing_batch",
            RoundStage::Executing => "executing",
            RoundStage::CollectingSignatures => "collecting_signatures",
            RoundStage::PostingTransaction => "posting_transaction",
            RoundStage::AwaitingInclusion => "awaiting_inclusion",
        }
    }
}

impl fmt::Display for RoundStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a round ended without finalizing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundAbort {
    #[error("Quorum of committee peers is not alive")]
    QuorumNotAlive,

    #[error("Stage {0} exceeded its time budget")]
    Timeout(RoundStage),

    #[error("Local result can no longer reach the signing threshold")]
    HashDivergence,

    #[error("Ledger rejected the transaction")]
    LedgerRejected,

    #[error("Ledger reported a conflicting transaction")]
    LedgerConflicting,

    #[error("Committee changed")]
    CommitteeChanged,

    #[error("Ledger moved past round base {base}")]
    Stale { base: StateIndex },

    #[error("Superseded by leader attempt {attempt}")]
    Superseded { attempt: u32 },

    #[error("Batch execution failed: {0}")]
    Execution(String),

    #[error("Signature aggregation failed: {0}")]
    Aggregation(CryptoError),

    #[error("Chain dismissed")]
    Dismissed,
}

impl RoundAbort {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            RoundAbort::QuorumNotAlive => "quorum_not_alive",
            RoundAbort::Timeout(_) => "timeout",
            RoundAbort::HashDivergence => "hash_divergence",
            RoundAbort::LedgerRejected => "ledger_rejected",
            RoundAbort::LedgerConflicting => "ledger_conflicting",
            RoundAbort::CommitteeChanged => "committee_changed",
            RoundAbort::Stale { .. } => "stale",
            RoundAbort::Superseded { .. } => "superseded",
            RoundAbort::Execution(_) => "execution",
            RoundAbort::Aggregation(_) => "aggregation",
            RoundAbort::Dismissed => "dismissed",
        }
    }
}

/// Consensus snapshot for external APIs.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusStatus {
    pub stage: RoundStage,
    /// Base index of the current round, or of the latest solid state when
    /// idle.
    pub state_index: Option<u32>,
    pub attempt: u32,
    pub leader: Option<u16>,
    pub synced: bool,
    pub batch_size: usize,
    pub acks: usize,
    pub shares: usize,
}

/// Local result of executing the round's batch.
#[derive(Debug)]
struct RoundResult {
    output: VmOutput,
    essence: TransactionEssence,
    essence_hash: Hash,
    own_share: SignatureShare,
    shares: ShareSet,
}

#[derive(Debug)]
struct Round {
    base: Arc<VirtualState>,
    attempt: u32,
    leader: PeerIndex,
    stage: RoundStage,
    started_at: Duration,
    stage_started_at: Duration,
    last_broadcast: Duration,
    proposal: StartProcessingBatchMsg,
    batch_hash: Hash,
    requests: Vec<Arc<Request>>,
    acks: BTreeSet<PeerIndex>,
    result: Option<RoundResult>,
    transaction: Option<Arc<StateTransaction>>,
    /// Transaction id the leader announced as posted.
    posted_tx: Option<Hash>,
}

impl Round {
    fn state_index(&self) -> StateIndex {
        self.base.index()
    }

    fn tx_id(&self) -> Option<Hash> {
        self.result.as_ref().map(|r| r.essence_hash)
    }

    fn result_state_hash(&self) -> Option<Hash> {
        self.result.as_ref().map(|r| r.output.state_hash)
    }

    fn enter(&mut self, stage: RoundStage, now: Duration) {
        self.stage = stage;
        self.stage_started_at = now;
        self.last_broadcast = now;
    }

    fn ack_message(&self) -> PeerMessage {
        PeerMessage::NotifyReq(NotifyReqMsg {
            state_index: self.state_index(),
            request_ids: self.proposal.request_ids.clone(),
            batch_hash: Some(self.batch_hash),
        })
    }
}

/// Consensus state for one chain on one node.
pub struct ConsensusState {
    config: ConsensusConfig,
    committee: Arc<dyn Committee>,
    chain_id: ChainId,

    /// Latest solid state reported by the state manager.
    base: Option<Arc<VirtualState>>,
    synced: bool,
    attempt: u32,
    round: Option<Round>,
    /// Base index of the last finalized round. No new round starts on that
    /// base; the next one waits for the resulting state.
    last_finalized: Option<StateIndex>,
    idle_since: Duration,
    last_announce: Option<Duration>,

    early_proposal: Option<(PeerIndex, StartProcessingBatchMsg)>,
    early_acks: HashMap<Hash, (StateIndex, BTreeSet<PeerIndex>)>,
    early_shares: HashMap<Hash, Vec<(PeerIndex, SignedHashMsg)>>,

    dismissed: bool,
    timer_armed: bool,
    now: Duration,
}

impl fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusState")
            .field("chain_id", &self.chain_id)
            .field("base", &self.base.as_ref().map(|b| b.index()))
            .field("attempt", &self.attempt)
            .field("stage", &self.stage())
            .field("synced", &self.synced)
            .finish()
    }
}

impl ConsensusState {
    pub fn new(committee: Arc<dyn Committee>, chain_id: ChainId, config: ConsensusConfig) -> Self {
        Self {
            config,
            committee,
            chain_id,
            base: None,
            synced: false,
            attempt: 0,
            round: None,
            last_finalized: None,
            idle_since: Duration::ZERO,
            last_announce: None,
            early_proposal: None,
            early_acks: HashMap::new(),
            early_shares: HashMap::new(),
            dismissed: false,
            timer_armed: false,
            now: Duration::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn stage(&self) -> RoundStage {
        self.round.as_ref().map_or(RoundStage::Idle, |r| r.stage)
    }

    pub fn has_round_in_flight(&self) -> bool {
        self.round.is_some()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Index of the solid state rounds currently build on.
    pub fn base_index(&self) -> Option<StateIndex> {
        self.base.as_ref().map(|b| b.index())
    }

    pub fn is_dismissed(&self) -> bool {
        self.dismissed
    }

    /// Leader for `state_index` at rotation `attempt`.
    pub fn leader_for(&self, state_index: StateIndex, attempt: u32) -> PeerIndex {
        let size = self.committee.size().max(1) as u64;
        PeerIndex(((state_index.0 as u64 + attempt as u64) % size) as u16)
    }

    /// Leader of the current round, or of the next one when idle.
    pub fn current_leader(&self) -> Option<PeerIndex> {
        match &self.round {
            Some(round) => Some(round.leader),
            None => self
                .base
                .as_ref()
                .map(|b| self.leader_for(b.index(), self.attempt)),
        }
    }

    /// Essence this node computed and signed in the current round.
    pub fn current_essence(&self) -> Option<&TransactionEssence> {
        self.round
            .as_ref()
            .and_then(|r| r.result.as_ref())
            .map(|r| &r.essence)
    }

    /// Transaction assembled in the current round, once shares reached the
    /// threshold.
    pub fn current_transaction(&self) -> Option<&Arc<StateTransaction>> {
        self.round.as_ref().and_then(|r| r.transaction.as_ref())
    }

    pub fn current_batch(&self) -> Option<&[RequestId]> {
        self.round.as_ref().map(|r| r.proposal.request_ids.as_slice())
    }

    pub fn status(&self) -> ConsensusStatus {
        let round = self.round.as_ref();
        ConsensusStatus {
            stage: self.stage(),
            state_index: round
                .map(|r| r.state_index().0)
                .or_else(|| self.base.as_ref().map(|b| b.index().0)),
            attempt: self.attempt,
            leader: self.current_leader().map(|p| p.0),
            synced: self.synced,
            batch_size: round.map_or(0, |r| r.proposal.request_ids.len()),
            acks: round.map_or(0, |r| r.acks.len()),
            shares: round
                .and_then(|r| r.result.as_ref())
                .map_or(0, |r| r.shares.count()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control from the chain
    // ═══════════════════════════════════════════════════════════════════════

    /// Arm the round tick.
    pub fn start(&mut self) -> Vec<Action> {
        self.arm_timer().into_iter().collect()
    }

    /// Track whether the state manager is synced. Rounds only start while
    /// synced.
    pub fn set_synced(&mut self, synced: bool) {
        if self.synced != synced {
            trace!(synced, "Consensus sync flag changed");
            self.synced = synced;
        }
    }

    /// Switch to a new committee. Any round in flight is abandoned.
    pub fn set_committee(&mut self, committee: Arc<dyn Committee>) {
        self.abort_round(RoundAbort::CommitteeChanged);
        self.committee = committee;
        self.attempt = 0;
        self.idle_since = self.now;
        self.early_proposal = None;
        self.early_acks.clear();
        self.early_shares.clear();
    }

    /// Stop taking part in consensus for good.
    pub fn dismiss(&mut self) -> Vec<Action> {
        self.abort_round(RoundAbort::Dismissed);
        self.dismissed = true;
        self.early_proposal = None;
        self.early_acks.clear();
        self.early_shares.clear();
        if std::mem::take(&mut self.timer_armed) {
            vec![Action::CancelTimer {
                id: TimerId::Consensus,
            }]
        } else {
            vec![]
        }
    }

    /// Tell peers this node holds `request_ids`, so their seen marks count
    /// it toward the quorum.
    pub fn announce_requests(&self, request_ids: Vec<RequestId>) -> Vec<Action> {
        if request_ids.is_empty() || self.dismissed {
            return vec![];
        }
        let state_index = self
            .base
            .as_ref()
            .map_or(StateIndex::ORIGIN, |b| b.index());
        vec![Action::Broadcast {
            message: PeerMessage::NotifyReq(NotifyReqMsg {
                state_index,
                request_ids,
                batch_hash: None,
            }),
        }]
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Process one chain event. `mempool` is read to build and validate
    /// batches; consensus never changes it.
    pub fn handle(&mut self, event: ChainEvent, mempool: &MempoolState) -> Vec<Action> {
        if self.dismissed {
            return vec![];
        }
        match event {
            ChainEvent::StateTransition { state, .. } => self.on_state_transition(state, mempool),
            ChainEvent::StateOutput { output } => self.on_state_output(output),
            ChainEvent::TransactionInclusionState { tx_id, state } => {
                self.on_inclusion_state(tx_id, state)
            }
            ChainEvent::PeerMessage { from, message } => {
                if from == self.committee.own_peer_index() {
                    return vec![];
                }
                match message {
                    PeerMessage::StartProcessingBatch(msg) => self.on_proposal(from, msg, mempool),
                    PeerMessage::NotifyReq(msg) => self.on_notify_req(from, msg),
                    PeerMessage::SignedHash(msg) => self.on_signed_hash(from, msg),
                    PeerMessage::NotifyFinalResultPosted(msg) => self.on_result_posted(from, msg),
                    _ => vec![],
                }
            }
            ChainEvent::VmResult {
                state_index,
                batch_hash,
                result,
            } => self.on_vm_result(state_index, batch_hash, result),
            ChainEvent::ConsensusTimer => self.on_timer(mempool),
            _ => vec![],
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ledger and state manager
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, state, mempool), fields(index = state.index().0))]
    fn on_state_transition(
        &mut self,
        state: Arc<VirtualState>,
        mempool: &MempoolState,
    ) -> Vec<Action> {
        let index = state.index();
        let mut actions = vec![];

        if let Some(round) = &self.round {
            let base = round.state_index();
            if index > base {
                if index == base.next() && round.result_state_hash() == Some(state.hash()) {
                    actions.extend(self.finalize_round());
                } else {
                    self.abort_round(RoundAbort::Stale { base });
                }
            }
        }

        let moved = self.base.as_ref().map(|b| b.index()) != Some(index);
        self.base = Some(state);
        self.synced = true;
        if moved {
            self.attempt = 0;
            self.idle_since = self.now;
            self.prune_early(index);
        }

        if let Some((from, msg)) = self.early_proposal.take() {
            if msg.state_index == index {
                actions.extend(self.on_proposal(from, msg, mempool));
            } else if msg.state_index > index {
                self.early_proposal = Some((from, msg));
            }
        }

        actions.extend(self.try_start_round(mempool));
        actions
    }

    fn on_state_output(&mut self, output: StateOutput) -> Vec<Action> {
        let Some(round) = &self.round else {
            return vec![];
        };
        let base = round.state_index();
        if output.index <= base {
            return vec![];
        }
        if output.index == base.next() && round.result_state_hash() == Some(output.state_hash) {
            debug!(index = output.index.0, "Ledger anchored our result");
            self.finalize_round()
        } else {
            self.abort_round(RoundAbort::Stale { base });
            vec![]
        }
    }

    fn on_inclusion_state(&mut self, tx_id: Hash, state: InclusionState) -> Vec<Action> {
        let Some(round) = &self.round else {
            return vec![];
        };
        if round.tx_id() != Some(tx_id) {
            return vec![];
        }
        match state {
            InclusionState::Pending => {
                trace!(%tx_id, "Transaction pending");
                let now = self.now;
                if let Some(round) = self.round.as_mut() {
                    if round.stage == RoundStage::PostingTransaction
                        && round.leader == self.committee.own_peer_index()
                    {
                        debug!(%tx_id, "Ledger acknowledged transaction");
                        round.enter(RoundStage::AwaitingInclusion, now);
                    }
                }
                vec![]
            }
            InclusionState::Included => self.finalize_round(),
            InclusionState::Rejected => {
                self.abort_round(RoundAbort::LedgerRejected);
                vec![]
            }
            InclusionState::Conflicting => {
                self.abort_round(RoundAbort::LedgerConflicting);
                vec![]
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposal and acknowledgement
    // ═══════════════════════════════════════════════════════════════════════

    /// Start a round if this node leads the current attempt and has a batch
    /// the quorum has seen.
    fn try_start_round(&mut self, mempool: &MempoolState) -> Vec<Action> {
        if self.round.is_some() || !self.synced || self.dismissed {
            return vec![];
        }
        let Some(base) = self.base.clone() else {
            return vec![];
        };
        if self.last_finalized == Some(base.index()) {
            return vec![];
        }
        let own = self.committee.own_peer_index();
        let leader = self.leader_for(base.index(), self.attempt);
        if leader != own {
            return vec![];
        }
        if !self.committee.quorum_is_alive(&[]) {
            trace!("Quorum not alive, not proposing");
            return vec![];
        }

        let mut ready = mempool.get_ready_list(self.committee.quorum());
        if ready.is_empty() {
            return vec![];
        }
        ready.truncate(self.config.max_batch_size);

        let now_ms = self.now.as_millis() as u64;
        let proposal = StartProcessingBatchMsg {
            state_index: base.index(),
            attempt: self.attempt,
            timestamp: now_ms.max(base.timestamp() + 1),
            request_ids: ready.iter().map(|r| r.id).collect(),
        };
        info!(
            state_index = base.index().0,
            attempt = self.attempt,
            batch_size = ready.len(),
            "Proposing batch"
        );

        let mut actions = vec![Action::Broadcast {
            message: PeerMessage::StartProcessingBatch(proposal.clone()),
        }];
        actions.extend(self.open_round(base, leader, proposal, ready));
        actions
    }

    #[instrument(skip(self, from, msg, mempool), fields(from = from.0, index = msg.state_index.0, attempt = msg.attempt))]
    fn on_proposal(
        &mut self,
        from: PeerIndex,
        msg: StartProcessingBatchMsg,
        mempool: &MempoolState,
    ) -> Vec<Action> {
        let Some(base) = self.base.clone() else {
            self.early_proposal = Some((from, msg));
            return vec![];
        };
        if msg.state_index > base.index() || (msg.state_index == base.index() && !self.synced) {
            trace!("Buffering proposal for a state not reached yet");
            self.early_proposal = Some((from, msg));
            return vec![];
        }
        if msg.state_index < base.index() {
            trace!("Ignoring proposal for an old state");
            return vec![];
        }
        if from != self.leader_for(msg.state_index, msg.attempt) {
            debug!("Ignoring proposal from a peer that does not lead this attempt");
            return vec![];
        }
        if msg.attempt < self.attempt {
            trace!(current = self.attempt, "Ignoring proposal for an old attempt");
            return vec![];
        }
        if self.last_finalized == Some(msg.state_index) {
            return vec![];
        }

        let batch_hash = msg.batch_hash();
        if let Some(round) = &self.round {
            if round.attempt == msg.attempt {
                // Leader re-sent its proposal; our ack may have been lost.
                if round.batch_hash == batch_hash && round.stage == RoundStage::ProposingBatch {
                    return vec![Action::Broadcast {
                        message: round.ack_message(),
                    }];
                }
                return vec![];
            }
            self.abort_round(RoundAbort::Superseded {
                attempt: msg.attempt,
            });
        }
        self.attempt = msg.attempt;

        if msg.request_ids.is_empty() || msg.request_ids.len() > self.config.max_batch_size {
            debug!(batch_size = msg.request_ids.len(), "Rejecting batch of invalid size");
            return vec![];
        }
        if msg.timestamp <= base.timestamp() {
            debug!(timestamp = msg.timestamp, "Rejecting batch with non-increasing timestamp");
            return vec![];
        }
        let requests = match mempool.ready_batch(&msg.request_ids) {
            Ok(requests) => requests,
            Err(id) => {
                debug!(request_id = %id, "Rejecting batch: request not ready locally");
                return vec![];
            }
        };

        self.open_round(base, from, msg, requests)
    }

    fn open_round(
        &mut self,
        base: Arc<VirtualState>,
        leader: PeerIndex,
        proposal: StartProcessingBatchMsg,
        requests: Vec<Arc<Request>>,
    ) -> Vec<Action> {
        let own = self.committee.own_peer_index();
        let batch_hash = proposal.batch_hash();
        let mut acks = BTreeSet::from([own, leader]);
        if let Some((_, early)) = self.early_acks.remove(&batch_hash) {
            acks.extend(early);
        }

        metrics::record_round_started(base.index().0);
        let round = Round {
            base,
            attempt: proposal.attempt,
            leader,
            stage: RoundStage::ProposingBatch,
            started_at: self.now,
            stage_started_at: self.now,
            last_broadcast: self.now,
            proposal,
            batch_hash,
            requests,
            acks,
            result: None,
            transaction: None,
            posted_tx: None,
        };

        let mut actions = vec![];
        if leader != own {
            actions.push(Action::Broadcast {
                message: round.ack_message(),
            });
        }
        self.round = Some(round);
        actions.extend(self.check_acks());
        actions
    }

    fn on_notify_req(&mut self, from: PeerIndex, msg: NotifyReqMsg) -> Vec<Action> {
        let Some(batch_hash) = msg.batch_hash else {
            return vec![];
        };
        if let Some(round) = self.round.as_mut() {
            if round.batch_hash == batch_hash {
                round.acks.insert(from);
                return self.check_acks();
            }
        }
        if self.base.as_ref().is_some_and(|b| msg.state_index < b.index()) {
            return vec![];
        }
        if !self.early_acks.contains_key(&batch_hash) && self.early_acks.len() >= MAX_EARLY_BATCHES {
            return vec![];
        }
        self.early_acks
            .entry(batch_hash)
            .or_insert_with(|| (msg.state_index, BTreeSet::new()))
            .1
            .insert(from);
        vec![]
    }

    fn check_acks(&mut self) -> Vec<Action> {
        let quorum = self.committee.quorum() as usize;
        let Some(round) = self.round.as_mut() else {
            return vec![];
        };
        if round.stage != RoundStage::ProposingBatch || round.acks.len() < quorum {
            return vec![];
        }
        round.enter(RoundStage::Executing, self.now);
        debug!(
            state_index = round.state_index().0,
            acks = round.acks.len(),
            "Batch acknowledged by quorum, executing"
        );
        vec![Action::ExecuteBatch {
            task: VmTask {
                chain_id: self.chain_id,
                batch_hash: round.batch_hash,
                state: Arc::clone(&round.base),
                requests: round.requests.clone(),
                timestamp: round.proposal.timestamp,
            },
        }]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution and signing
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, result), fields(index = state_index.0))]
    fn on_vm_result(
        &mut self,
        state_index: StateIndex,
        batch_hash: Hash,
        result: Result<VmOutput, VmError>,
    ) -> Vec<Action> {
        let current = self.round.as_ref().is_some_and(|r| {
            r.batch_hash == batch_hash
                && r.state_index() == state_index
                && r.stage == RoundStage::Executing
        });
        if !current {
            trace!("Ignoring VM result for a finished round");
            return vec![];
        }
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.abort_round(RoundAbort::Execution(e.to_string()));
                return vec![];
            }
        };

        let Some(round) = self.round.as_mut() else {
            return vec![];
        };
        let essence = TransactionEssence {
            chain_id: self.chain_id,
            index: output.block.index,
            prev_state_hash: round.base.hash(),
            state_hash: output.state_hash,
            block_hash: output.block.essence_hash(),
            timestamp: round.proposal.timestamp,
        };
        let essence_hash = essence.hash();
        let message = essence.signing_message();
        let dk_share = self.committee.dk_share();
        let own_share = dk_share.sign_share(&message);
        let mut shares = ShareSet::new(essence_hash, message, dk_share.threshold(), dk_share.size());
        shares.add(dk_share, essence_hash, own_share.clone());

        let signed = SignedHashMsg {
            state_index,
            batch_hash,
            essence_hash,
            share: own_share.clone(),
        };
        debug!(%essence_hash, state_hash = %output.state_hash, "Batch executed, signing result");

        let mut actions = vec![
            Action::EnqueueInternal {
                event: ChainEvent::PendingBlock {
                    block: Arc::clone(&output.block),
                    state_hash: output.state_hash,
                },
            },
            Action::Broadcast {
                message: PeerMessage::SignedHash(signed),
            },
        ];
        round.result = Some(RoundResult {
            output,
            essence,
            essence_hash,
            own_share,
            shares,
        });
        round.enter(RoundStage::CollectingSignatures, self.now);

        if let Some(early) = self.early_shares.remove(&batch_hash) {
            for (from, msg) in early {
                self.add_share(from, msg);
            }
        }
        actions.extend(self.check_shares());
        actions.extend(self.follow_posted());
        actions
    }

    fn on_signed_hash(&mut self, from: PeerIndex, msg: SignedHashMsg) -> Vec<Action> {
        if msg.share.signer != from {
            warn!(peer = from.0, signer = msg.share.signer.0, "Share signer does not match sender");
            return vec![];
        }
        let (ours, executed) = match &self.round {
            Some(round) => (round.batch_hash == msg.batch_hash, round.result.is_some()),
            None => (false, false),
        };
        if ours && executed {
            self.add_share(from, msg);
            return self.check_shares();
        }
        if self.base.as_ref().is_some_and(|b| msg.state_index < b.index()) {
            return vec![];
        }
        let batch_hash = msg.batch_hash;
        if !self.early_shares.contains_key(&batch_hash)
            && self.early_shares.len() >= MAX_EARLY_BATCHES
        {
            return vec![];
        }
        let buffered = self.early_shares.entry(batch_hash).or_default();
        if buffered.len() < self.committee.size() as usize
            && !buffered.iter().any(|(peer, _)| *peer == from)
        {
            buffered.push((from, msg));
        }
        vec![]
    }

    fn add_share(&mut self, from: PeerIndex, msg: SignedHashMsg) {
        let Some(result) = self.round.as_mut().and_then(|r| r.result.as_mut()) else {
            return;
        };
        match result
            .shares
            .add(self.committee.dk_share(), msg.essence_hash, msg.share)
        {
            ShareOutcome::Added => {
                trace!(peer = from.0, count = result.shares.count(), "Share added");
            }
            ShareOutcome::Duplicate => {}
            ShareOutcome::Foreign => {
                warn!(
                    peer = from.0,
                    theirs = %msg.essence_hash,
                    ours = %result.essence_hash,
                    "Peer signed a different result"
                );
            }
            ShareOutcome::Invalid(e) => {
                warn!(peer = from.0, error = %e, "Invalid signature share");
            }
        }
    }

    fn check_shares(&mut self) -> Vec<Action> {
        let Some(round) = self.round.as_ref() else {
            return vec![];
        };
        let Some(result) = round.result.as_ref() else {
            return vec![];
        };
        if round.stage != RoundStage::CollectingSignatures {
            return vec![];
        }
        if result.shares.diverged() {
            self.abort_round(RoundAbort::HashDivergence);
            return vec![];
        }
        if !result.shares.has_threshold() {
            return vec![];
        }
        let signature = match result.shares.aggregate(self.committee.dk_share()) {
            Ok(signature) => signature,
            Err(e) => {
                self.abort_round(RoundAbort::Aggregation(e));
                return vec![];
            }
        };
        let transaction = Arc::new(StateTransaction {
            essence: result.essence.clone(),
            signature,
        });
        self.on_transaction_assembled(transaction)
    }

    fn on_transaction_assembled(&mut self, transaction: Arc<StateTransaction>) -> Vec<Action> {
        let own = self.committee.own_peer_index();
        let Some(round) = self.round.as_mut() else {
            return vec![];
        };
        let tx_id = transaction.tx_id();
        let state_index = round.state_index();
        info!(
            state_index = state_index.0,
            %tx_id,
            signers = transaction.signature.signers.count(),
            "Transaction assembled"
        );
        round.transaction = Some(Arc::clone(&transaction));
        round.enter(RoundStage::PostingTransaction, self.now);

        if round.leader != own {
            return self.follow_posted();
        }

        // Leaves PostingTransaction when the ledger first answers for it.
        vec![
            Action::PostTransaction { transaction },
            Action::Broadcast {
                message: PeerMessage::NotifyFinalResultPosted(NotifyFinalResultPostedMsg {
                    state_index,
                    tx_id,
                }),
            },
            Action::QueryInclusionState { tx_id },
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Posting and inclusion
    // ═══════════════════════════════════════════════════════════════════════

    fn on_result_posted(&mut self, from: PeerIndex, msg: NotifyFinalResultPostedMsg) -> Vec<Action> {
        let Some(round) = self.round.as_mut() else {
            return vec![];
        };
        if from != round.leader || msg.state_index != round.state_index() {
            return vec![];
        }
        debug!(tx_id = %msg.tx_id, "Leader posted transaction");
        round.posted_tx = Some(msg.tx_id);
        self.follow_posted()
    }

    /// Move to `AwaitingInclusion` once the leader announced a posted
    /// transaction matching our own result.
    fn follow_posted(&mut self) -> Vec<Action> {
        let now = self.now;
        let Some(round) = self.round.as_mut() else {
            return vec![];
        };
        if !matches!(
            round.stage,
            RoundStage::CollectingSignatures | RoundStage::PostingTransaction
        ) {
            return vec![];
        }
        let (Some(posted), Some(ours)) = (round.posted_tx, round.tx_id()) else {
            return vec![];
        };
        if posted != ours {
            warn!(%posted, %ours, "Leader posted a different result");
            self.abort_round(RoundAbort::HashDivergence);
            return vec![];
        }
        round.enter(RoundStage::AwaitingInclusion, now);
        vec![Action::QueryInclusionState { tx_id: ours }]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Round end
    // ═══════════════════════════════════════════════════════════════════════

    fn finalize_round(&mut self) -> Vec<Action> {
        let Some(round) = self.round.take() else {
            return vec![];
        };
        let state_index = round.state_index();
        let elapsed = self.now.saturating_sub(round.started_at);
        metrics::record_round_finalized(state_index.0, elapsed.as_secs_f64());
        info!(
            state_index = state_index.0,
            attempt = round.attempt,
            requests = round.proposal.request_ids.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Round finalized"
        );

        self.last_finalized = Some(state_index);
        self.attempt = 0;
        self.idle_since = self.now;
        self.early_acks.remove(&round.batch_hash);
        self.early_shares.remove(&round.batch_hash);

        vec![Action::EnqueueInternal {
            event: ChainEvent::BatchFinalized {
                state_index,
                request_ids: round.proposal.request_ids,
            },
        }]
    }

    /// Drop the round. The solid state and the mempool are untouched, so
    /// the same requests are eligible for the next attempt.
    fn abort_round(&mut self, reason: RoundAbort) {
        let Some(round) = self.round.take() else {
            return;
        };
        metrics::record_round_aborted(reason.reason());
        warn!(
            state_index = round.state_index().0,
            attempt = round.attempt,
            stage = %round.stage,
            reason = %reason,
            "Round aborted"
        );
        self.attempt = self.attempt.max(round.attempt + 1);
        self.idle_since = self.now;
        self.early_acks.remove(&round.batch_hash);
        self.early_shares.remove(&round.batch_hash);
    }

    fn prune_early(&mut self, index: StateIndex) {
        self.early_acks.retain(|_, (state_index, _)| *state_index >= index);
        self.early_shares.retain(|_, shares| {
            shares
                .first()
                .is_some_and(|(_, msg)| msg.state_index >= index)
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timer
    // ═══════════════════════════════════════════════════════════════════════

    fn on_timer(&mut self, mempool: &MempoolState) -> Vec<Action> {
        self.timer_armed = false;
        let mut actions = self.check_round_progress();
        self.maybe_rotate_leader(mempool);
        actions.extend(self.maybe_announce(mempool));
        actions.extend(self.try_start_round(mempool));
        actions.extend(self.arm_timer());
        actions
    }

    /// Enforce stage budgets and re-send what peers may have missed.
    fn check_round_progress(&mut self) -> Vec<Action> {
        let now = self.now;
        let own = self.committee.own_peer_index();
        let Some(round) = self.round.as_ref() else {
            return vec![];
        };

        if let Some(budget) = self.config.budget(round.stage) {
            if now.saturating_sub(round.stage_started_at) > budget {
                let stage = round.stage;
                self.abort_round(RoundAbort::Timeout(stage));
                return vec![];
            }
        }
        let before_posting = matches!(
            round.stage,
            RoundStage::ProposingBatch | RoundStage::Executing | RoundStage::CollectingSignatures
        );
        if before_posting && !self.committee.quorum_is_alive(&[]) {
            self.abort_round(RoundAbort::QuorumNotAlive);
            return vec![];
        }
        if now.saturating_sub(round.last_broadcast) < self.config.rebroadcast_interval {
            return vec![];
        }

        let Some(round) = self.round.as_mut() else {
            return vec![];
        };
        round.last_broadcast = now;
        match round.stage {
            RoundStage::ProposingBatch if round.leader == own => vec![Action::Broadcast {
                message: PeerMessage::StartProcessingBatch(round.proposal.clone()),
            }],
            RoundStage::ProposingBatch => vec![Action::Broadcast {
                message: round.ack_message(),
            }],
            RoundStage::CollectingSignatures => match &round.result {
                Some(result) => vec![Action::Broadcast {
                    message: PeerMessage::SignedHash(SignedHashMsg {
                        state_index: round.state_index(),
                        batch_hash: round.batch_hash,
                        essence_hash: result.essence_hash,
                        share: result.own_share.clone(),
                    }),
                }],
                None => vec![],
            },
            RoundStage::PostingTransaction | RoundStage::AwaitingInclusion
                if round.stage == RoundStage::AwaitingInclusion || round.leader == own =>
            {
                let Some(tx_id) = round.tx_id() else {
                    return vec![];
                };
                let mut actions = vec![Action::QueryInclusionState { tx_id }];
                if round.leader == own {
                    actions.push(Action::Broadcast {
                        message: PeerMessage::NotifyFinalResultPosted(
                            NotifyFinalResultPostedMsg {
                                state_index: round.state_index(),
                                tx_id,
                            },
                        ),
                    });
                }
                actions
            }
            RoundStage::Idle
            | RoundStage::Executing
            | RoundStage::PostingTransaction
            | RoundStage::AwaitingInclusion => vec![],
        }
    }

    /// Skip a leader that stays silent while this node has work ready.
    fn maybe_rotate_leader(&mut self, mempool: &MempoolState) {
        if self.round.is_some() || !self.synced {
            return;
        }
        let Some(base) = &self.base else {
            return;
        };
        let index = base.index();
        if self.last_finalized == Some(index) {
            return;
        }
        if mempool.get_ready_list(1).is_empty() {
            self.idle_since = self.now;
            return;
        }
        if self.now.saturating_sub(self.idle_since) < self.config.leader_timeout {
            return;
        }
        self.attempt += 1;
        self.idle_since = self.now;
        debug!(
            state_index = index.0,
            attempt = self.attempt,
            leader = self.leader_for(index, self.attempt).0,
            "Leader idle, rotating"
        );
    }

    fn maybe_announce(&mut self, mempool: &MempoolState) -> Vec<Action> {
        if let Some(last) = self.last_announce {
            if self.now.saturating_sub(last) < self.config.announce_interval {
                return vec![];
            }
        }
        self.last_announce = Some(self.now);
        let ids: Vec<RequestId> = mempool
            .get_ready_list(1)
            .iter()
            .take(self.config.max_batch_size)
            .map(|r| r.id)
            .collect();
        self.announce_requests(ids)
    }

    fn arm_timer(&mut self) -> Option<Action> {
        if self.timer_armed || self.dismissed {
            return None;
        }
        self.timer_armed = true;
        Some(Action::SetTimer {
            id: TimerId::Consensus,
            duration: self.config.tick_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_batch;
    use quorumstate_core::{BlobCache, MemoryBlobCache};
    use quorumstate_test_helpers::fixtures::{self, CounterVm};
    use quorumstate_test_helpers::{FakeCommittee, TestCommittee};
    use tracing_test::traced_test;

    struct Node {
        fake: Arc<FakeCommittee>,
        consensus: ConsensusState,
        mempool: MempoolState,
        blobs: Arc<MemoryBlobCache>,
    }

    impl Node {
        fn new(committee: &TestCommittee, idx: usize) -> Self {
            let fake = committee.fake(idx);
            let blobs = Arc::new(MemoryBlobCache::new());
            let config = ConsensusConfig::default();
            let mut node = Self {
                consensus: ConsensusState::new(
                    Arc::clone(&fake) as Arc<dyn Committee>,
                    committee.chain_id(),
                    config,
                ),
                mempool: MempoolState::new(
                    PeerIndex(idx as u16),
                    Arc::clone(&blobs) as Arc<dyn BlobCache>,
                ),
                fake,
                blobs,
            };
            node.set_time(Duration::from_secs(100));
            node
        }

        fn set_time(&mut self, now: Duration) {
            self.consensus.set_time(now);
            self.mempool.set_time(now);
        }

        fn handle(&mut self, event: ChainEvent) -> Vec<Action> {
            self.consensus.handle(event, &self.mempool)
        }

        /// Admit requests and mark them seen by `peers`.
        fn admit(&mut self, requests: &[Arc<Request>], peers: &[u16]) {
            let state = self
                .consensus
                .base
                .clone()
                .unwrap_or_else(|| fixtures::origin(self.consensus.chain_id));
            for request in requests {
                self.mempool
                    .receive_request(Arc::clone(request), &state)
                    .unwrap();
                for peer in peers {
                    self.mempool
                        .mark_seen_by_committee_peer(&request.id, PeerIndex(*peer));
                }
            }
        }

        fn transition(&mut self, state: Arc<VirtualState>) -> Vec<Action> {
            self.handle(ChainEvent::StateTransition {
                output: fixtures::output_for(&state),
                state,
                request_ids: vec![],
            })
        }

        fn execute(&self, actions: &[Action]) -> Option<ChainEvent> {
            actions.iter().find_map(|a| match a {
                Action::ExecuteBatch { task } => Some(ChainEvent::VmResult {
                    state_index: task.state_index(),
                    batch_hash: task.batch_hash,
                    result: run_batch(&CounterVm, self.blobs.as_ref(), task),
                }),
                _ => None,
            })
        }
    }

    fn broadcasts(actions: &[Action]) -> Vec<&PeerMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn proposal(actions: &[Action]) -> Option<StartProcessingBatchMsg> {
        broadcasts(actions).into_iter().find_map(|m| match m {
            PeerMessage::StartProcessingBatch(p) => Some(p.clone()),
            _ => None,
        })
    }

    fn ack(from: u16, proposal: &StartProcessingBatchMsg) -> ChainEvent {
        ChainEvent::PeerMessage {
            from: PeerIndex(from),
            message: PeerMessage::NotifyReq(NotifyReqMsg {
                state_index: proposal.state_index,
                request_ids: proposal.request_ids.clone(),
                batch_hash: Some(proposal.batch_hash()),
            }),
        }
    }

    fn share(
        committee: &TestCommittee,
        from: usize,
        proposal: &StartProcessingBatchMsg,
        essence: &TransactionEssence,
    ) -> ChainEvent {
        ChainEvent::PeerMessage {
            from: PeerIndex(from as u16),
            message: PeerMessage::SignedHash(SignedHashMsg {
                state_index: proposal.state_index,
                batch_hash: proposal.batch_hash(),
                essence_hash: essence.hash(),
                share: committee.share(from).sign_share(&essence.signing_message()),
            }),
        }
    }

    fn finalized(actions: &[Action]) -> Option<Vec<RequestId>> {
        actions.iter().find_map(|a| match a {
            Action::EnqueueInternal {
                event: ChainEvent::BatchFinalized { request_ids, .. },
            } => Some(request_ids.clone()),
            _ => None,
        })
    }

    /// Drive node 0 (leader at origin, attempt 0) to `CollectingSignatures`.
    fn leader_executed(
        committee: &TestCommittee,
    ) -> (Node, StartProcessingBatchMsg, TransactionEssence) {
        let mut leader = Node::new(committee, 0);
        let requests = vec![fixtures::make_request(1, 10), fixtures::make_request(2, 20)];
        leader.admit(&requests, &[1, 2]);

        let origin = fixtures::origin(committee.chain_id());
        let actions = leader.transition(origin);
        let proposal = proposal(&actions).expect("leader proposes");
        assert_eq!(leader.consensus.stage(), RoundStage::ProposingBatch);

        leader.handle(ack(1, &proposal));
        let actions = leader.handle(ack(2, &proposal));
        assert_eq!(leader.consensus.stage(), RoundStage::Executing);
        let result = leader.execute(&actions).expect("execute batch");
        let actions = leader.handle(result);
        assert_eq!(leader.consensus.stage(), RoundStage::CollectingSignatures);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::EnqueueInternal {
                event: ChainEvent::PendingBlock { .. }
            }
        )));
        let essence = leader.consensus.current_essence().unwrap().clone();
        (leader, proposal, essence)
    }

    #[test]
    fn test_leader_rotation() {
        let committee = TestCommittee::new(4, 3, 30);
        let node = Node::new(&committee, 0);
        assert_eq!(node.consensus.leader_for(StateIndex(0), 0), PeerIndex(0));
        assert_eq!(node.consensus.leader_for(StateIndex(5), 0), PeerIndex(1));
        assert_eq!(node.consensus.leader_for(StateIndex(5), 2), PeerIndex(3));
        assert_eq!(node.consensus.leader_for(StateIndex(5), 3), PeerIndex(0));
    }

    #[traced_test]
    #[test]
    fn test_leader_round_finalizes_on_inclusion() {
        let committee = TestCommittee::new(4, 3, 31);
        let (mut leader, proposal, essence) = leader_executed(&committee);

        let actions = leader.handle(share(&committee, 1, &proposal, &essence));
        assert!(!actions.iter().any(|a| matches!(a, Action::PostTransaction { .. })));
        let actions = leader.handle(share(&committee, 2, &proposal, &essence));

        let posted = actions
            .iter()
            .find_map(|a| match a {
                Action::PostTransaction { transaction } => Some(Arc::clone(transaction)),
                _ => None,
            })
            .expect("leader posts");
        assert_eq!(posted.essence, essence);
        assert!(committee
            .share(3)
            .verify_aggregate(&essence.signing_message(), &posted.signature)
            .is_ok());
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, PeerMessage::NotifyFinalResultPosted(_))));
        assert_eq!(leader.consensus.stage(), RoundStage::PostingTransaction);

        // The ledger knows the transaction but has not decided yet.
        leader.handle(ChainEvent::TransactionInclusionState {
            tx_id: posted.tx_id(),
            state: InclusionState::Pending,
        });
        assert_eq!(leader.consensus.stage(), RoundStage::AwaitingInclusion);

        let actions = leader.handle(ChainEvent::TransactionInclusionState {
            tx_id: posted.tx_id(),
            state: InclusionState::Included,
        });
        assert_eq!(finalized(&actions), Some(proposal.request_ids.clone()));
        assert_eq!(leader.consensus.stage(), RoundStage::Idle);
        assert!(logs_contain("Round finalized"));
    }

    #[test]
    fn test_two_matching_and_one_divergent_share_wait_for_third() {
        let committee = TestCommittee::new(4, 3, 32);
        let (mut leader, proposal, essence) = leader_executed(&committee);

        let mut other = essence.clone();
        other.state_hash = Hash::from_bytes(b"divergent");

        // Own share plus peer 1 over H1, peer 2 over H2.
        leader.handle(share(&committee, 1, &proposal, &essence));
        let actions = leader.handle(share(&committee, 2, &proposal, &other));
        assert!(!actions.iter().any(|a| matches!(a, Action::PostTransaction { .. })));
        assert_eq!(leader.consensus.stage(), RoundStage::CollectingSignatures);

        let actions = leader.handle(share(&committee, 3, &proposal, &essence));
        assert!(actions.iter().any(|a| matches!(a, Action::PostTransaction { .. })));
    }

    #[test]
    fn test_divergent_majority_aborts_round() {
        let committee = TestCommittee::new(4, 3, 33);
        let (mut leader, proposal, essence) = leader_executed(&committee);
        let mut other = essence.clone();
        other.state_hash = Hash::from_bytes(b"divergent");

        leader.handle(share(&committee, 1, &proposal, &other));
        leader.handle(share(&committee, 2, &proposal, &other));
        assert_eq!(leader.consensus.stage(), RoundStage::Idle);
        assert_eq!(leader.consensus.attempt(), 1);
    }

    #[traced_test]
    #[test]
    fn test_rejected_transaction_aborts_cleanly() {
        let committee = TestCommittee::new(4, 3, 34);
        let (mut leader, proposal, essence) = leader_executed(&committee);
        let base_hash = leader.consensus.base.as_ref().unwrap().hash();

        leader.handle(share(&committee, 1, &proposal, &essence));
        leader.handle(share(&committee, 2, &proposal, &essence));
        let actions = leader.handle(ChainEvent::TransactionInclusionState {
            tx_id: essence.hash(),
            state: InclusionState::Rejected,
        });

        assert!(finalized(&actions).is_none());
        assert_eq!(leader.consensus.stage(), RoundStage::Idle);
        assert_eq!(leader.consensus.attempt(), 1);
        assert_eq!(leader.consensus.current_leader(), Some(PeerIndex(1)));
        // Nothing consumed: base state and backlog as before the round.
        assert_eq!(leader.consensus.base.as_ref().unwrap().hash(), base_hash);
        for id in &proposal.request_ids {
            assert!(leader.mempool.is_in_backlog(id));
        }
        assert!(logs_contain("Round aborted"));
    }

    #[test]
    fn test_follower_acks_executes_and_follows_leader() {
        let committee = TestCommittee::new(4, 3, 35);
        let (_, proposal, essence) = leader_executed(&committee);

        let mut follower = Node::new(&committee, 1);
        let requests = vec![fixtures::make_request(1, 10), fixtures::make_request(2, 20)];
        follower.admit(&requests, &[]);
        follower.transition(fixtures::origin(committee.chain_id()));

        let actions = follower.handle(ChainEvent::PeerMessage {
            from: PeerIndex(0),
            message: PeerMessage::StartProcessingBatch(proposal.clone()),
        });
        assert!(broadcasts(&actions).iter().any(|m| matches!(
            m,
            PeerMessage::NotifyReq(NotifyReqMsg { batch_hash: Some(h), .. }) if *h == proposal.batch_hash()
        )));
        assert_eq!(follower.consensus.stage(), RoundStage::ProposingBatch);

        let actions = follower.handle(ack(2, &proposal));
        let result = follower.execute(&actions).expect("quorum reached");
        follower.handle(result);
        assert_eq!(follower.consensus.current_essence(), Some(&essence));

        follower.handle(share(&committee, 0, &proposal, &essence));
        follower.handle(share(&committee, 2, &proposal, &essence));
        assert_eq!(follower.consensus.stage(), RoundStage::PostingTransaction);

        let actions = follower.handle(ChainEvent::PeerMessage {
            from: PeerIndex(0),
            message: PeerMessage::NotifyFinalResultPosted(NotifyFinalResultPostedMsg {
                state_index: proposal.state_index,
                tx_id: essence.hash(),
            }),
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::QueryInclusionState { tx_id } if *tx_id == essence.hash())));
        assert_eq!(follower.consensus.stage(), RoundStage::AwaitingInclusion);

        // The ledger output for our result finalizes the round as well.
        let actions = follower.handle(ChainEvent::StateOutput {
            output: StateOutput {
                output_id: essence.hash(),
                index: essence.index,
                state_hash: essence.state_hash,
                timestamp: essence.timestamp,
            },
        });
        assert!(finalized(&actions).is_some());
    }

    #[test]
    fn test_follower_rejects_batch_with_unknown_request() {
        let committee = TestCommittee::new(4, 3, 36);
        let mut follower = Node::new(&committee, 1);
        follower.admit(&[fixtures::make_request(1, 10)], &[]);
        follower.transition(fixtures::origin(committee.chain_id()));

        let foreign = StartProcessingBatchMsg {
            state_index: StateIndex(0),
            attempt: 0,
            timestamp: 100_000,
            request_ids: vec![fixtures::request_id(1), fixtures::request_id(99)],
        };
        let actions = follower.handle(ChainEvent::PeerMessage {
            from: PeerIndex(0),
            message: PeerMessage::StartProcessingBatch(foreign.clone()),
        });
        assert!(actions.is_empty());
        assert_eq!(follower.consensus.stage(), RoundStage::Idle);

        // Same batch from a peer that does not lead attempt 0.
        let mut known = foreign;
        known.request_ids.truncate(1);
        let actions = follower.handle(ChainEvent::PeerMessage {
            from: PeerIndex(2),
            message: PeerMessage::StartProcessingBatch(known),
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn test_early_shares_counted_after_execution() {
        let committee = TestCommittee::new(4, 3, 37);
        let (_, proposal, essence) = leader_executed(&committee);

        let mut follower = Node::new(&committee, 1);
        let requests = vec![fixtures::make_request(1, 10), fixtures::make_request(2, 20)];
        follower.admit(&requests, &[]);
        follower.transition(fixtures::origin(committee.chain_id()));

        // Shares from faster peers arrive before the proposal.
        follower.handle(share(&committee, 0, &proposal, &essence));
        follower.handle(share(&committee, 2, &proposal, &essence));
        follower.handle(ack(2, &proposal));

        let actions = follower.handle(ChainEvent::PeerMessage {
            from: PeerIndex(0),
            message: PeerMessage::StartProcessingBatch(proposal.clone()),
        });
        let result = follower.execute(&actions).expect("buffered ack completes quorum");
        follower.handle(result);
        assert_eq!(follower.consensus.stage(), RoundStage::PostingTransaction);
    }

    #[test]
    fn test_no_proposal_without_live_quorum() {
        let committee = TestCommittee::new(4, 3, 38);
        let mut leader = Node::new(&committee, 0);
        leader.admit(&[fixtures::make_request(1, 10)], &[1, 2]);
        leader.fake.set_alive(PeerIndex(1), false);
        leader.fake.set_alive(PeerIndex(2), false);

        let actions = leader.transition(fixtures::origin(committee.chain_id()));
        assert!(proposal(&actions).is_none());
        assert_eq!(leader.consensus.stage(), RoundStage::Idle);
    }

    /// Step just past the budget of `stage` and fire the consensus timer.
    fn expire(node: &mut Node, stage: RoundStage) -> Vec<Action> {
        let budget = node.consensus.config().budget(stage).unwrap();
        node.set_time(Duration::from_secs(100) + budget + Duration::from_millis(1));
        node.handle(ChainEvent::ConsensusTimer)
    }

    /// The round is gone and left no trace: requests are back in the
    /// backlog and the base state is the one the round started from.
    fn assert_round_dropped(node: &Node, request_ids: &[RequestId], base: &VirtualState) {
        assert_eq!(node.consensus.stage(), RoundStage::Idle);
        assert!(!node.consensus.has_round_in_flight());
        for id in request_ids {
            assert!(node.mempool.is_in_backlog(id));
        }
        let current = node.consensus.base.as_ref().unwrap();
        assert_eq!(current.index(), base.index());
        assert_eq!(current.hash(), base.hash());
    }

    #[traced_test]
    #[test]
    fn test_stage_timeout_aborts_and_rotates() {
        let committee = TestCommittee::new(4, 3, 39);
        let origin = fixtures::origin(committee.chain_id());
        let mut leader = Node::new(&committee, 0);
        leader.admit(&[fixtures::make_request(1, 10)], &[1, 2]);
        let actions = leader.transition(Arc::clone(&origin));
        let proposal = proposal(&actions).unwrap();
        assert_eq!(leader.consensus.stage(), RoundStage::ProposingBatch);

        expire(&mut leader, RoundStage::ProposingBatch);
        assert_round_dropped(&leader, &proposal.request_ids, &origin);
        assert_eq!(leader.consensus.attempt(), 1);
        assert_eq!(leader.consensus.current_leader(), Some(PeerIndex(1)));
        assert!(logs_contain("Round aborted"));
    }

    #[test]
    fn test_execution_timeout_drops_late_result() {
        let committee = TestCommittee::new(4, 3, 44);
        let origin = fixtures::origin(committee.chain_id());
        let mut leader = Node::new(&committee, 0);
        leader.admit(&[fixtures::make_request(1, 10)], &[1, 2]);
        let actions = leader.transition(Arc::clone(&origin));
        let proposal = proposal(&actions).unwrap();
        leader.handle(ack(1, &proposal));
        let actions = leader.handle(ack(2, &proposal));
        assert_eq!(leader.consensus.stage(), RoundStage::Executing);
        let late = leader.execute(&actions).unwrap();

        expire(&mut leader, RoundStage::Executing);
        assert_round_dropped(&leader, &proposal.request_ids, &origin);

        // The VM finishes after the round is gone.
        let actions = leader.handle(late);
        assert!(!actions.iter().any(|a| matches!(
            a,
            Action::EnqueueInternal {
                event: ChainEvent::PendingBlock { .. }
            }
        )));
        assert!(broadcasts(&actions)
            .iter()
            .all(|m| !matches!(m, PeerMessage::SignedHash(_))));
        assert_round_dropped(&leader, &proposal.request_ids, &origin);
    }

    #[test]
    fn test_signing_timeout_aborts_cleanly() {
        let committee = TestCommittee::new(4, 3, 45);
        let origin = fixtures::origin(committee.chain_id());
        let (mut leader, proposal, essence) = leader_executed(&committee);

        // One share short of the threshold.
        leader.handle(share(&committee, 1, &proposal, &essence));
        assert_eq!(leader.consensus.stage(), RoundStage::CollectingSignatures);

        let actions = expire(&mut leader, RoundStage::CollectingSignatures);
        assert!(!actions.iter().any(|a| matches!(a, Action::PostTransaction { .. })));
        assert_round_dropped(&leader, &proposal.request_ids, &origin);

        // A share arriving afterwards does not revive the round.
        let actions = leader.handle(share(&committee, 2, &proposal, &essence));
        assert!(!actions.iter().any(|a| matches!(a, Action::PostTransaction { .. })));
        assert_round_dropped(&leader, &proposal.request_ids, &origin);
    }

    #[test]
    fn test_leader_posting_timeout_aborts_cleanly() {
        let committee = TestCommittee::new(4, 3, 46);
        let origin = fixtures::origin(committee.chain_id());
        let (mut leader, proposal, essence) = leader_executed(&committee);
        leader.handle(share(&committee, 1, &proposal, &essence));
        let actions = leader.handle(share(&committee, 2, &proposal, &essence));
        assert!(actions.iter().any(|a| matches!(a, Action::PostTransaction { .. })));
        assert_eq!(leader.consensus.stage(), RoundStage::PostingTransaction);

        // The ledger never acknowledges the post.
        expire(&mut leader, RoundStage::PostingTransaction);
        assert_round_dropped(&leader, &proposal.request_ids, &origin);
        assert_eq!(leader.consensus.attempt(), 1);
    }

    #[test]
    fn test_follower_posting_timeout_aborts_cleanly() {
        let committee = TestCommittee::new(4, 3, 47);
        let origin = fixtures::origin(committee.chain_id());
        let (_, proposal, essence) = leader_executed(&committee);

        let mut follower = Node::new(&committee, 1);
        let requests = vec![fixtures::make_request(1, 10), fixtures::make_request(2, 20)];
        follower.admit(&requests, &[]);
        follower.transition(Arc::clone(&origin));
        follower.handle(ChainEvent::PeerMessage {
            from: PeerIndex(0),
            message: PeerMessage::StartProcessingBatch(proposal.clone()),
        });
        let actions = follower.handle(ack(2, &proposal));
        let result = follower.execute(&actions).unwrap();
        follower.handle(result);
        follower.handle(share(&committee, 0, &proposal, &essence));
        follower.handle(share(&committee, 2, &proposal, &essence));
        assert_eq!(follower.consensus.stage(), RoundStage::PostingTransaction);

        // The leader never announces its post.
        expire(&mut follower, RoundStage::PostingTransaction);
        assert_round_dropped(&follower, &proposal.request_ids, &origin);
    }

    #[test]
    fn test_leader_requeries_until_ledger_answers() {
        let committee = TestCommittee::new(4, 3, 48);
        let (mut leader, proposal, essence) = leader_executed(&committee);
        leader.handle(share(&committee, 1, &proposal, &essence));
        leader.handle(share(&committee, 2, &proposal, &essence));

        let interval = leader.consensus.config().rebroadcast_interval;
        leader.set_time(Duration::from_secs(100) + interval);
        let actions = leader.handle(ChainEvent::ConsensusTimer);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::QueryInclusionState { tx_id } if *tx_id == essence.hash())));
        assert_eq!(leader.consensus.stage(), RoundStage::PostingTransaction);
    }

    #[test]
    fn test_idle_leader_is_skipped() {
        let committee = TestCommittee::new(4, 3, 40);
        let mut node = Node::new(&committee, 1);
        node.admit(&[fixtures::make_request(1, 10)], &[0, 2]);
        let actions = node.transition(fixtures::origin(committee.chain_id()));
        assert!(proposal(&actions).is_none());

        let timeout = node.consensus.config().leader_timeout;
        node.set_time(Duration::from_secs(100) + timeout);
        let actions = node.handle(ChainEvent::ConsensusTimer);
        assert_eq!(node.consensus.attempt(), 1);
        let proposal = proposal(&actions).expect("node 1 leads attempt 1");
        assert_eq!(proposal.attempt, 1);
    }

    #[test]
    fn test_higher_ledger_output_aborts_stale_round() {
        let committee = TestCommittee::new(4, 3, 41);
        let (mut leader, _, _) = leader_executed(&committee);
        let elsewhere = fixtures::state_at(committee.chain_id(), StateIndex(1));

        let actions = leader.handle(ChainEvent::StateOutput {
            output: fixtures::output_for(&elsewhere),
        });
        assert!(finalized(&actions).is_none());
        assert!(!leader.consensus.has_round_in_flight());
    }

    #[test]
    fn test_no_new_round_until_finalized_state_arrives() {
        let committee = TestCommittee::new(4, 3, 42);
        let (mut leader, proposal, essence) = leader_executed(&committee);
        leader.admit(&[fixtures::make_request(3, 30)], &[1, 2]);
        leader.handle(share(&committee, 1, &proposal, &essence));
        leader.handle(share(&committee, 2, &proposal, &essence));
        leader.handle(ChainEvent::TransactionInclusionState {
            tx_id: essence.hash(),
            state: InclusionState::Included,
        });

        let actions = leader.handle(ChainEvent::ConsensusTimer);
        assert!(self::proposal(&actions).is_none());
        assert_eq!(leader.consensus.stage(), RoundStage::Idle);
    }

    #[test]
    fn test_dismiss_cancels_timer_and_ignores_events() {
        let committee = TestCommittee::new(4, 3, 43);
        let mut node = Node::new(&committee, 0);
        assert_eq!(node.consensus.start().len(), 1);
        let actions = node.consensus.dismiss();
        assert!(matches!(
            actions.as_slice(),
            [Action::CancelTimer {
                id: TimerId::Consensus
            }]
        ));
        assert!(node.handle(ChainEvent::ConsensusTimer).is_empty());
        assert!(node.consensus.is_dismissed());
    }
}
