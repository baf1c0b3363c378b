//! State manager state machine.
//!
//! Keeps the node's solid [`VirtualState`] in lock-step with the state
//! output the ledger anchors for the chain.
//!
//! # States
//!
//! ```text
//!            ledger index > local
//! Synced ─────────────────────────► Unsynced
//!   ▲                                   │ blocks missing (ledger output
//!   │ local == ledger index             │ or peer evidence)
//!   │ and hashes match                  ▼
//!   └────────────────────────────── Syncing
//! ```
//!
//! While syncing, blocks are fetched from peers (`GetBlock`), reassembled
//! from a `BlockHeader` plus one `StateUpdate` per update, buffered, and
//! applied strictly in index order. A block the consensus produced locally
//! (`PendingBlock`) is used directly when the ledger confirms its state hash.
//!
//! Fetched blocks are applied to a scratch state first and committed only
//! when the run reaches the ledger index with the ledger's state hash. A run
//! that misses the hash is dropped and fetched again from other peers; only
//! a mismatch that no peer block took part in is fatal.
//!
//! Peer evidence of a higher index (`EvidenceStateIndex`, ping-pong) is
//! only recorded. It widens the next fetch, which the ledger output, a
//! `GetBlock`/`BlockHeader` from a peer, or the housekeeping tick starts.

use crate::StateManagerConfig;
use quorumstate_committee::Committee;
use quorumstate_core::{
    Action, BlockHeaderMsg, ChainEvent, GetBlockMsg, PeerMessage, StateIndexPingPongMsg,
    StateMachine, StateUpdateMsg, TimerId,
};
use quorumstate_metrics as metrics;
use quorumstate_types::{
    BlockHeader, Hash, PeerIndex, RequestId, StateBlock, StateError, StateIndex, StateOutput,
    StateUpdate, VirtualState,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Current sync state for external APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStateKind {
    /// Behind the ledger (or never matched it) and not fetching yet.
    Unsynced,
    /// Fetching and applying blocks.
    Syncing,
    /// Solid state equals the ledger-anchored state.
    Synced,
}

impl SyncStateKind {
    /// Returns a string representation for metrics/logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStateKind::Unsynced => "unsynced",
            SyncStateKind::Syncing => "syncing",
            SyncStateKind::Synced => "synced",
        }
    }
}

/// Sync status snapshot for external APIs.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncStateKind,
    pub state_index: u32,
    pub ledger_index: Option<u32>,
    pub blocks_behind: u32,
    pub in_flight: usize,
    pub buffered: usize,
    pub round_lock: bool,
}

/// The local state can not be reconciled with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalStateError {
    #[error("State {index} hash {local:?} does not match ledger hash {ledger:?}")]
    HashMismatch {
        index: StateIndex,
        local: Hash,
        ledger: Hash,
    },
}

/// Problems with blocks received from peers. Never fatal: the block is
/// dropped and requested again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Block {0} was not requested")]
    Unrequested(StateIndex),

    #[error("Update position {position} outside block {index} of size {size}")]
    PositionOutOfRange {
        index: StateIndex,
        position: u16,
        size: u16,
    },

    #[error("Conflicting headers for block {0}")]
    ConflictingHeader(StateIndex),

    #[error("Block does not assemble: {0}")]
    Assembly(#[from] StateError),
}

/// Locally produced blocks kept at most. Every aborted round at the same
/// base leaves one behind.
const MAX_PENDING_BLOCKS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct FetchState {
    peer: PeerIndex,
    requested_at: Duration,
    attempts: u32,
}

#[derive(Debug, Default)]
struct Assembly {
    header: Option<BlockHeader>,
    /// Peer that sent the header.
    source: Option<PeerIndex>,
    updates: BTreeMap<u16, StateUpdate>,
}

/// A complete block waiting for its turn. `source` is `None` for a block
/// this node produced itself.
#[derive(Debug, Clone)]
struct ReadyBlock {
    block: Arc<StateBlock>,
    source: Option<PeerIndex>,
}

/// State manager state machine.
pub struct StateManager {
    config: StateManagerConfig,
    committee: Arc<dyn Committee>,

    /// Last applied state.
    solid: Arc<VirtualState>,

    /// Latest output anchored by the ledger.
    ledger_output: Option<StateOutput>,

    /// Highest index any peer has revealed.
    evidence_index: StateIndex,

    kind: SyncStateKind,

    /// Blocks being reassembled from peer messages.
    assembling: HashMap<StateIndex, Assembly>,

    /// Complete blocks waiting for their turn.
    ready_blocks: BTreeMap<StateIndex, ReadyBlock>,

    /// Locally produced blocks keyed by the state hash they produce.
    pending_blocks: HashMap<Hash, Arc<StateBlock>>,
    /// Insertion order of `pending_blocks`, oldest first.
    pending_order: VecDeque<Hash>,

    /// Peers that served blocks which did not reach the ledger hash. Asked
    /// last until the committee changes.
    suspects: BTreeSet<PeerIndex>,

    /// Outstanding `GetBlock` requests, kept until the block is applied so
    /// a re-request goes to the next peer.
    in_flight: BTreeMap<StateIndex, FetchState>,

    /// Applied blocks served to peers.
    history: BTreeMap<StateIndex, Arc<StateBlock>>,

    /// Requests consumed by blocks applied since the last state transition.
    applied_requests: Vec<RequestId>,

    /// Set while consensus has a round in flight. Blocks are not applied.
    round_lock: bool,

    fatal: Option<FatalStateError>,

    timer_armed: bool,
    last_ping: Option<Duration>,
    now: Duration,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("state", &self.kind)
            .field("state_index", &self.solid.index())
            .field("ledger_index", &self.ledger_output.map(|o| o.index))
            .field("in_flight", &self.in_flight.len())
            .field("fatal", &self.fatal)
            .finish()
    }
}

impl StateManager {
    /// Create a state manager starting from `solid`.
    ///
    /// `solid` is the origin state for a new chain, or the last state a
    /// restarted node had applied.
    pub fn new(
        committee: Arc<dyn Committee>,
        solid: Arc<VirtualState>,
        config: StateManagerConfig,
    ) -> Self {
        Self {
            config,
            committee,
            solid,
            ledger_output: None,
            evidence_index: StateIndex::ORIGIN,
            kind: SyncStateKind::Unsynced,
            assembling: HashMap::new(),
            ready_blocks: BTreeMap::new(),
            pending_blocks: HashMap::new(),
            pending_order: VecDeque::new(),
            suspects: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            history: BTreeMap::new(),
            applied_requests: Vec::new(),
            round_lock: false,
            fatal: None,
            timer_armed: false,
            last_ping: None,
            now: Duration::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn solid_state(&self) -> &Arc<VirtualState> {
        &self.solid
    }

    pub fn state_index(&self) -> StateIndex {
        self.solid.index()
    }

    pub fn ledger_output(&self) -> Option<&StateOutput> {
        self.ledger_output.as_ref()
    }

    pub fn sync_state(&self) -> SyncStateKind {
        self.kind
    }

    pub fn is_synced(&self) -> bool {
        self.kind == SyncStateKind::Synced
    }

    pub fn fatal(&self) -> Option<&FatalStateError> {
        self.fatal.as_ref()
    }

    pub fn is_round_locked(&self) -> bool {
        self.round_lock
    }

    /// Peers whose blocks failed verification against the ledger.
    pub fn suspects(&self) -> &BTreeSet<PeerIndex> {
        &self.suspects
    }

    pub fn pending_block_count(&self) -> usize {
        self.pending_blocks.len()
    }

    /// Block that produced state `index`, if still in history.
    pub fn block(&self, index: StateIndex) -> Option<&Arc<StateBlock>> {
        self.history.get(&index)
    }

    pub fn status(&self) -> SyncStatus {
        let ledger_index = self.ledger_output.map(|o| o.index.0);
        SyncStatus {
            state: self.kind,
            state_index: self.solid.index().0,
            ledger_index,
            blocks_behind: ledger_index
                .map(|l| l.saturating_sub(self.solid.index().0))
                .unwrap_or(0),
            in_flight: self.in_flight.len(),
            buffered: self.ready_blocks.len(),
            round_lock: self.round_lock,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control from the chain
    // ═══════════════════════════════════════════════════════════════════════

    /// Hold back (or release) block application while a consensus round is
    /// in flight.
    pub fn set_round_lock(&mut self, locked: bool) -> Vec<Action> {
        if self.round_lock == locked {
            return vec![];
        }
        self.round_lock = locked;
        trace!(locked, "Round lock changed");
        if locked || self.fatal.is_some() {
            vec![]
        } else {
            self.progress()
        }
    }

    /// Swap the committee used for peer selection. Outstanding requests
    /// are re-issued against the new membership.
    pub fn set_committee(&mut self, committee: Arc<dyn Committee>) -> Vec<Action> {
        self.committee = committee;
        self.in_flight.clear();
        self.assembling.clear();
        self.suspects.clear();
        if self.fatal.is_some() {
            return vec![];
        }
        self.progress()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event handlers
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self), fields(index = output.index.0))]
    fn on_state_output(&mut self, output: StateOutput) -> Vec<Action> {
        if let Some(known) = &self.ledger_output {
            if output.index < known.index || *known == output {
                return vec![];
            }
        }
        if output.index < self.solid.index() {
            warn!(
                ledger = output.index.0,
                local = self.solid.index().0,
                "Ledger output behind solid state, ignoring"
            );
            return vec![];
        }

        self.ledger_output = Some(output);
        if output.index > self.solid.index() && self.kind == SyncStateKind::Synced {
            debug!(
                ledger = output.index.0,
                local = self.solid.index().0,
                "Ledger moved ahead"
            );
            self.kind = SyncStateKind::Unsynced;
        }
        self.adopt_pending_block();
        self.progress()
    }

    fn on_pending_block(&mut self, block: Arc<StateBlock>, state_hash: Hash) -> Vec<Action> {
        if block.index <= self.solid.index() {
            return vec![];
        }
        trace!(index = block.index.0, ?state_hash, "Pending block stored");
        if self.pending_blocks.insert(state_hash, block).is_none() {
            self.pending_order.push_back(state_hash);
        }
        while self.pending_order.len() > MAX_PENDING_BLOCKS {
            if let Some(oldest) = self.pending_order.pop_front() {
                self.pending_blocks.remove(&oldest);
            }
        }
        if self.adopt_pending_block() {
            self.progress()
        } else {
            vec![]
        }
    }

    /// Remember a peer's claim of a higher index. Acted on later.
    fn record_evidence(&mut self, index: StateIndex) {
        if index > self.evidence_index {
            trace!(index = index.0, "Evidence of higher state index");
            self.evidence_index = index;
        }
    }

    /// A peer fetching or serving a block above ours shows we are behind.
    fn on_revealed_index(&mut self, index: StateIndex) -> Vec<Action> {
        self.record_evidence(index);
        if index <= self.solid.index() || self.kind == SyncStateKind::Synced {
            return vec![];
        }
        self.progress()
    }

    fn on_peer_message(&mut self, from: PeerIndex, message: PeerMessage) -> Vec<Action> {
        match message {
            PeerMessage::GetBlock(GetBlockMsg { index }) => {
                let mut actions = self.on_revealed_index(index);
                actions.extend(self.serve_block(from, index));
                actions
            }
            PeerMessage::BlockHeader(BlockHeaderMsg { header }) => {
                let mut actions = self.on_revealed_index(header.index);
                actions.extend(self.on_block_header(from, header));
                actions
            }
            PeerMessage::StateUpdate(msg) => self.on_state_update(from, msg),
            PeerMessage::StateIndexPingPong(StateIndexPingPongMsg {
                index,
                request_pong,
            }) => {
                self.record_evidence(index);
                let mut actions = Vec::new();
                if request_pong {
                    actions.push(Action::SendToPeer {
                        target: from,
                        message: PeerMessage::StateIndexPingPong(StateIndexPingPongMsg {
                            index: self.solid.index(),
                            request_pong: false,
                        }),
                    });
                }
                actions
            }
            _ => vec![],
        }
    }

    fn on_timer(&mut self) -> Vec<Action> {
        self.timer_armed = false;
        if self.kind == SyncStateKind::Synced {
            return vec![];
        }

        let expired: Vec<(StateIndex, PeerIndex)> = self
            .in_flight
            .iter()
            .filter(|(index, _)| !self.ready_blocks.contains_key(index))
            .filter(|(_, f)| self.now >= f.requested_at + self.config.backoff(f.attempts))
            .map(|(index, f)| (*index, f.peer))
            .collect();

        let mut actions = Vec::new();
        for (index, peer) in expired {
            debug!(index = index.0, peer = %peer, "Block request timed out");
            actions.extend(self.refetch(index));
        }
        actions.extend(self.progress());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Serving blocks
    // ═══════════════════════════════════════════════════════════════════════

    fn serve_block(&self, to: PeerIndex, index: StateIndex) -> Vec<Action> {
        let Some(block) = self.history.get(&index) else {
            trace!(index = index.0, peer = %to, "Block not in history");
            return vec![];
        };

        let mut actions = Vec::with_capacity(block.updates.len() + 1);
        actions.push(Action::SendToPeer {
            target: to,
            message: PeerMessage::BlockHeader(BlockHeaderMsg {
                header: block.header(),
            }),
        });
        for (position, update) in block.updates.iter().enumerate() {
            actions.push(Action::SendToPeer {
                target: to,
                message: PeerMessage::StateUpdate(StateUpdateMsg {
                    index,
                    position: position as u16,
                    update: update.clone(),
                }),
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Block assembly
    // ═══════════════════════════════════════════════════════════════════════

    fn wants_block(&self, index: StateIndex) -> Result<(), SyncError> {
        if index <= self.solid.index()
            || self.ready_blocks.contains_key(&index)
            || !self.in_flight.contains_key(&index)
        {
            return Err(SyncError::Unrequested(index));
        }
        Ok(())
    }

    fn on_block_header(&mut self, from: PeerIndex, header: BlockHeader) -> Vec<Action> {
        let index = header.index;
        if let Err(e) = self.wants_block(index) {
            trace!(peer = %from, error = %e, "Ignoring block header");
            return vec![];
        }

        let existing = self.assembling.entry(index).or_default().header.clone();
        match existing {
            Some(existing) if existing != header => {
                warn!(peer = %from, error = %SyncError::ConflictingHeader(index), "Dropping block");
                return self.refetch(index);
            }
            Some(_) => return vec![],
            None => {}
        }
        let entry = self.assembling.entry(index).or_default();
        entry.header = Some(header);
        entry.source = Some(from);
        self.try_complete(index)
    }

    fn on_state_update(&mut self, from: PeerIndex, msg: StateUpdateMsg) -> Vec<Action> {
        let index = msg.index;
        if let Err(e) = self.wants_block(index) {
            trace!(peer = %from, error = %e, "Ignoring state update");
            return vec![];
        }

        let entry = self.assembling.entry(index).or_default();
        if let Some(header) = &entry.header {
            if msg.position >= header.size {
                let e = SyncError::PositionOutOfRange {
                    index,
                    position: msg.position,
                    size: header.size,
                };
                debug!(peer = %from, error = %e, "Ignoring state update");
                return vec![];
            }
        }
        entry.updates.insert(msg.position, msg.update);
        self.try_complete(index)
    }

    fn try_complete(&mut self, index: StateIndex) -> Vec<Action> {
        let Some(assembly) = self.assembling.get(&index) else {
            return vec![];
        };
        let Some(header) = &assembly.header else {
            return vec![];
        };
        if assembly.updates.len() < header.size as usize {
            return vec![];
        }

        let Some(Assembly {
            header: Some(header),
            source,
            updates,
        }) = self.assembling.remove(&index)
        else {
            return vec![];
        };
        match assemble(header, updates) {
            Ok(block) => {
                trace!(index = index.0, "Block assembled");
                self.ready_blocks.insert(
                    index,
                    ReadyBlock {
                        block: Arc::new(block),
                        source,
                    },
                );
                self.progress()
            }
            Err(e) => {
                warn!(index = index.0, error = %e, "Dropping block");
                self.refetch(index)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync progress
    // ═══════════════════════════════════════════════════════════════════════

    /// Move a locally produced block into the ready set once the ledger
    /// confirms the state it produces. Returns true if one was adopted.
    fn adopt_pending_block(&mut self) -> bool {
        self.prune_pending_blocks();

        let Some(output) = self.ledger_output else {
            return false;
        };
        let Some(block) = self.pending_blocks.remove(&output.state_hash) else {
            return false;
        };
        self.pending_order.retain(|hash| *hash != output.state_hash);
        if block.index != output.index {
            return false;
        }
        debug!(index = block.index.0, "Using pending block");
        self.in_flight.remove(&block.index);
        self.assembling.remove(&block.index);
        self.ready_blocks.insert(
            block.index,
            ReadyBlock {
                block,
                source: None,
            },
        );
        true
    }

    fn prune_pending_blocks(&mut self) {
        let solid_index = self.solid.index();
        self.pending_blocks.retain(|_, b| b.index > solid_index);
        let pending = &self.pending_blocks;
        self.pending_order.retain(|hash| pending.contains_key(hash));
    }

    fn progress(&mut self) -> Vec<Action> {
        let mut actions = self.try_apply();
        if self.fatal.is_some() || self.kind == SyncStateKind::Synced {
            return actions;
        }
        actions.extend(self.schedule_fetches());
        actions.extend(self.maybe_ping());
        actions.extend(self.arm_timer());
        actions
    }

    /// Apply buffered blocks up to the ledger index once every one of them
    /// is present, then check the result against the ledger hash.
    fn try_apply(&mut self) -> Vec<Action> {
        let Some(ledger) = self.ledger_output else {
            return vec![];
        };
        if self.round_lock {
            trace!("Round in flight, deferring block application");
            return vec![];
        }

        let solid_index = self.solid.index();
        if solid_index < ledger.index {
            if self.ready_run_end() < ledger.index {
                return vec![];
            }
            return self.apply_run(ledger);
        }
        if solid_index == ledger.index && self.kind != SyncStateKind::Synced {
            let local = self.solid.hash();
            if local == ledger.state_hash {
                return self.become_synced(ledger);
            }
            return self.enter_fatal(FatalStateError::HashMismatch {
                index: solid_index,
                local,
                ledger: ledger.state_hash,
            });
        }
        vec![]
    }

    /// Last index of the contiguous run of ready blocks above the solid
    /// state.
    fn ready_run_end(&self) -> StateIndex {
        let mut end = self.solid.index();
        while self.ready_blocks.contains_key(&end.next()) {
            end = end.next();
        }
        end
    }

    /// Apply the ready run on a scratch state and commit it only if it
    /// lands on the ledger hash.
    fn apply_run(&mut self, ledger: StateOutput) -> Vec<Action> {
        let mut tip = Arc::clone(&self.solid);
        let mut index = self.solid.index();
        while index < ledger.index {
            index = index.next();
            let Some(ready) = self.ready_blocks.get(&index) else {
                return vec![];
            };
            match tip.with_block(&ready.block) {
                Ok(state) => tip = Arc::new(state),
                Err(e) => {
                    warn!(index = index.0, error = %e, "Dropping block that does not apply");
                    return self.refetch(index);
                }
            }
        }

        let local = tip.hash();
        if local != ledger.state_hash {
            return self.reject_run(ledger, local);
        }

        let mut index = self.solid.index();
        while index < ledger.index {
            index = index.next();
            if let Some(ready) = self.ready_blocks.remove(&index) {
                self.applied_requests.extend(ready.block.request_ids());
                self.history.insert(index, ready.block);
                metrics::record_block_applied(index.0);
                debug!(index = index.0, "Block applied");
            }
        }
        while self.history.len() > self.config.block_history {
            self.history.pop_first();
        }
        self.solid = tip;
        metrics::set_state_index(ledger.index.0);

        let solid_index = self.solid.index();
        self.in_flight.retain(|index, _| *index > solid_index);
        self.assembling.retain(|index, _| *index > solid_index);
        self.prune_pending_blocks();
        self.become_synced(ledger)
    }

    /// The run reached the ledger index with another hash. Peer blocks in
    /// the run are fetched again from other peers; without any, the local
    /// chain itself disagrees with the ledger.
    fn reject_run(&mut self, ledger: StateOutput, local: Hash) -> Vec<Action> {
        let from_peers: Vec<(StateIndex, PeerIndex)> = self
            .ready_blocks
            .range(self.solid.index().next()..=ledger.index)
            .filter_map(|(index, ready)| ready.source.map(|peer| (*index, peer)))
            .collect();
        if from_peers.is_empty() {
            return self.enter_fatal(FatalStateError::HashMismatch {
                index: ledger.index,
                local,
                ledger: ledger.state_hash,
            });
        }

        warn!(
            index = ledger.index.0,
            blocks = from_peers.len(),
            ?local,
            ledger = ?ledger.state_hash,
            "Fetched blocks do not reach the ledger state, fetching again"
        );
        let mut actions = Vec::new();
        for (index, peer) in from_peers {
            self.suspects.insert(peer);
            actions.extend(self.refetch(index));
        }
        actions
    }

    fn become_synced(&mut self, output: StateOutput) -> Vec<Action> {
        info!(
            state_index = output.index.0,
            applied = self.applied_requests.len(),
            "State synced"
        );
        self.kind = SyncStateKind::Synced;
        self.in_flight.clear();
        self.assembling.clear();

        let mut actions = Vec::new();
        if self.timer_armed {
            self.timer_armed = false;
            actions.push(Action::CancelTimer {
                id: TimerId::StateManager,
            });
        }
        actions.push(Action::EnqueueInternal {
            event: ChainEvent::StateTransition {
                state: Arc::clone(&self.solid),
                output,
                request_ids: std::mem::take(&mut self.applied_requests),
            },
        });
        actions
    }

    fn enter_fatal(&mut self, err: FatalStateError) -> Vec<Action> {
        error!(error = %err, "Local state diverged from ledger");
        metrics::record_fatal_state();
        let reason = err.to_string();
        self.fatal = Some(err);
        self.in_flight.clear();
        self.assembling.clear();
        self.ready_blocks.clear();

        let mut actions = vec![Action::ReportFatal { reason }];
        if self.timer_armed {
            self.timer_armed = false;
            actions.push(Action::CancelTimer {
                id: TimerId::StateManager,
            });
        }
        actions
    }

    /// Request every missing index in the window that is not in flight.
    fn schedule_fetches(&mut self) -> Vec<Action> {
        let ledger_index = self.ledger_output.map(|o| o.index).unwrap_or_default();
        let solid_index = self.solid.index();
        let frontier = self.ready_run_end();
        let target = ledger_index
            .max(self.evidence_index)
            .min(StateIndex(frontier.0.saturating_add(self.config.sync_window)));
        if target <= solid_index {
            return vec![];
        }

        if self.kind == SyncStateKind::Unsynced {
            info!(
                local = solid_index.0,
                target = target.0,
                "Starting sync"
            );
            self.kind = SyncStateKind::Syncing;
        }

        let mut actions = Vec::new();
        for i in frontier.0 + 1..=target.0 {
            let index = StateIndex(i);
            if self.ready_blocks.contains_key(&index) || self.in_flight.contains_key(&index) {
                continue;
            }
            actions.extend(self.request_block(index, 0));
        }
        actions
    }

    fn request_block(&mut self, index: StateIndex, attempts: u32) -> Option<Action> {
        let Some(peer) = self.choose_peer(index, attempts) else {
            debug!(index = index.0, "No alive peer to fetch block from");
            return None;
        };
        self.in_flight.insert(
            index,
            FetchState {
                peer,
                requested_at: self.now,
                attempts: attempts + 1,
            },
        );
        trace!(index = index.0, peer = %peer, attempts, "Requesting block");
        Some(Action::SendToPeer {
            target: peer,
            message: PeerMessage::GetBlock(GetBlockMsg { index }),
        })
    }

    /// Drop whatever we had for `index` and ask the next peer.
    fn refetch(&mut self, index: StateIndex) -> Vec<Action> {
        let attempts = self
            .in_flight
            .remove(&index)
            .map(|f| f.attempts)
            .unwrap_or(0);
        self.assembling.remove(&index);
        self.ready_blocks.remove(&index);
        metrics::record_block_fetch_retry();
        self.request_block(index, attempts).into_iter().collect()
    }

    /// Round-robin over alive peers, offset by index and attempt so retries
    /// go to a different peer. Suspects are used only when no other peer is
    /// alive.
    fn choose_peer(&self, index: StateIndex, attempts: u32) -> Option<PeerIndex> {
        let own = self.committee.own_peer_index();
        let alive: Vec<PeerIndex> = (0..self.committee.size())
            .map(PeerIndex)
            .filter(|p| *p != own && self.committee.is_alive_peer(*p))
            .collect();
        let trusted: Vec<PeerIndex> = alive
            .iter()
            .copied()
            .filter(|p| !self.suspects.contains(p))
            .collect();
        let candidates = if trusted.is_empty() { alive } else { trusted };
        if candidates.is_empty() {
            return None;
        }
        let slot = (index.0 as usize + attempts as usize) % candidates.len();
        Some(candidates[slot])
    }

    fn maybe_ping(&mut self) -> Option<Action> {
        if self
            .last_ping
            .is_some_and(|at| self.now < at + self.config.pingpong_interval)
        {
            return None;
        }
        self.last_ping = Some(self.now);
        Some(Action::Broadcast {
            message: PeerMessage::StateIndexPingPong(StateIndexPingPongMsg {
                index: self.solid.index(),
                request_pong: true,
            }),
        })
    }

    fn arm_timer(&mut self) -> Option<Action> {
        if self.timer_armed {
            return None;
        }
        self.timer_armed = true;
        Some(Action::SetTimer {
            id: TimerId::StateManager,
            duration: self.config.housekeeping_interval,
        })
    }
}

/// Rebuild a block from a complete assembly.
fn assemble(
    header: BlockHeader,
    updates: BTreeMap<u16, StateUpdate>,
) -> Result<StateBlock, SyncError> {
    if let Some(&position) = updates.keys().find(|p| **p >= header.size) {
        return Err(SyncError::PositionOutOfRange {
            index: header.index,
            position,
            size: header.size,
        });
    }
    let updates: Vec<StateUpdate> = updates.into_values().collect();
    Ok(StateBlock::from_parts(&header, updates)?)
}

impl StateMachine for StateManager {
    fn handle(&mut self, event: ChainEvent) -> Vec<Action> {
        if self.fatal.is_some() {
            return vec![];
        }
        match event {
            ChainEvent::StateOutput { output } => self.on_state_output(output),
            ChainEvent::PeerMessage { from, message } => self.on_peer_message(from, message),
            ChainEvent::StateManagerTimer => self.on_timer(),
            ChainEvent::PendingBlock { block, state_hash } => {
                self.on_pending_block(block, state_hash)
            }
            ChainEvent::EvidenceStateIndex { index } => {
                self.record_evidence(index);
                vec![]
            }
            _ => vec![],
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}
