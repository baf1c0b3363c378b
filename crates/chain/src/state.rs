//! Chain state machine.

use crate::{ChainConfig, ChainError, ChainStatus};
use quorumstate_committee::Committee;
use quorumstate_consensus::ConsensusState;
use quorumstate_core::{Action, BlobCache, ChainEvent, PeerMessage, StateMachine, TimerId};
use quorumstate_mempool::MempoolState;
use quorumstate_statemgr::StateManager;
use quorumstate_types::{
    ChainId, PeerIndex, PeerStatus, Request, RequestId, RequestProcessingStatus, VirtualState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace};

/// Combined chain state machine.
///
/// Owns one mempool, state manager and consensus for a chain and routes
/// every [`ChainEvent`] to them:
///
/// - ledger outputs go to consensus first (so a matching output finalizes
///   the round), then to the state manager
/// - block sync messages go to the state manager
/// - round messages go to consensus; `NotifyReq` also marks requests seen
/// - `StateTransition` consumes requests from the mempool, whether the
///   block came from our own round or from a peer
///
/// After each event the state manager's sync state and consensus' round
/// are reconciled: consensus only starts rounds on a synced state, and the
/// state manager holds back block application while a round is in flight.
pub struct ChainStateMachine {
    chain_id: ChainId,
    committee: Arc<dyn Committee>,
    mempool: MempoolState,
    state_manager: StateManager,
    consensus: ConsensusState,
    dismissed: bool,
    fatal: Option<String>,
    now: Duration,
}

impl std::fmt::Debug for ChainStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStateMachine")
            .field("chain_id", &self.chain_id)
            .field("own_index", &self.committee.own_peer_index())
            .field("state_manager", &self.state_manager)
            .field("consensus", &self.consensus)
            .field("mempool", &self.mempool.len())
            .field("dismissed", &self.dismissed)
            .finish()
    }
}

impl ChainStateMachine {
    /// Create a chain starting from `solid`, the origin state or the last
    /// state this node applied before a restart.
    pub fn new(
        chain_id: ChainId,
        committee: Arc<dyn Committee>,
        solid: Arc<VirtualState>,
        blobs: Arc<dyn BlobCache>,
        config: ChainConfig,
    ) -> Self {
        let own = committee.own_peer_index();
        Self {
            chain_id,
            mempool: MempoolState::with_config(own, blobs, config.mempool),
            state_manager: StateManager::new(Arc::clone(&committee), solid, config.state_manager),
            consensus: ConsensusState::new(Arc::clone(&committee), chain_id, config.consensus),
            committee,
            dismissed: false,
            fatal: None,
            now: Duration::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn committee(&self) -> &Arc<dyn Committee> {
        &self.committee
    }

    pub fn mempool(&self) -> &MempoolState {
        &self.mempool
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    pub fn consensus(&self) -> &ConsensusState {
        &self.consensus
    }

    pub fn solid_state(&self) -> &Arc<VirtualState> {
        self.state_manager.solid_state()
    }

    pub fn is_dismissed(&self) -> bool {
        self.dismissed
    }

    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// Where `id` stands from this node's point of view.
    pub fn request_status(&self, id: &RequestId) -> RequestProcessingStatus {
        if self.solid_state().is_request_processed(id) {
            RequestProcessingStatus::Completed
        } else if self.mempool.is_in_backlog(id) {
            RequestProcessingStatus::Backlog
        } else {
            RequestProcessingStatus::Unknown
        }
    }

    /// Whether `id` waits in the mempool and has not been consumed.
    pub fn is_request_in_backlog(&self, id: &RequestId) -> bool {
        self.request_status(id) == RequestProcessingStatus::Backlog
    }

    pub fn peer_status(&self) -> Vec<PeerStatus> {
        self.committee.peer_status()
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            chain_id: self.chain_id,
            sync: self.state_manager.status(),
            consensus: self.consensus.status(),
            mempool_size: self.mempool.len(),
            tombstones: self.mempool.tombstone_count(),
            dismissed: self.dismissed,
            fatal: self.fatal.clone(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Arm the chain's timers. Call once after activation.
    pub fn start(&mut self) -> Vec<Action> {
        if self.dismissed {
            return vec![];
        }
        info!(
            chain = %self.chain_id,
            own_index = self.committee.own_peer_index().0,
            state_index = self.state_manager.state_index().0,
            "Chain started"
        );
        self.consensus.start()
    }

    /// Stop the chain for good. Idempotent.
    pub fn dismiss(&mut self) -> Vec<Action> {
        if self.dismissed {
            return vec![];
        }
        info!(chain = %self.chain_id, "Dismissing chain");
        self.dismissed = true;
        let mut actions = self.consensus.dismiss();
        actions.push(Action::CancelTimer {
            id: TimerId::StateManager,
        });
        self.committee.close();
        actions
    }

    /// Replace the committee running this chain.
    ///
    /// The round in flight is abandoned before seen marks are cleared, then
    /// every component switches to the new committee.
    pub fn rotate_committee(
        &mut self,
        committee: Arc<dyn Committee>,
    ) -> Result<Vec<Action>, ChainError> {
        if self.dismissed {
            return Err(ChainError::Dismissed(self.chain_id));
        }
        let own = committee.own_peer_index();
        if own.0 >= committee.size() {
            return Err(ChainError::NotAMember {
                own: own.0,
                size: committee.size(),
            });
        }
        info!(
            chain = %self.chain_id,
            address = ?committee.address(),
            own_index = own.0,
            size = committee.size(),
            "Rotating committee"
        );

        self.consensus.set_committee(Arc::clone(&committee));
        self.mempool.set_own_peer_index(own);
        let mut actions = self.state_manager.set_committee(Arc::clone(&committee));
        let previous = std::mem::replace(&mut self.committee, committee);
        previous.close();
        actions.extend(self.reconcile());
        Ok(actions)
    }

    /// Admit a request into the mempool and announce it to peers.
    pub fn receive_request(&mut self, request: Arc<Request>) -> Result<Vec<Action>, ChainError> {
        if self.dismissed {
            return Err(ChainError::Dismissed(self.chain_id));
        }
        let id = request.id;
        let solid = Arc::clone(self.state_manager.solid_state());
        if self.mempool.receive_request(request, &solid)? {
            trace!(request_id = %id, "Request admitted");
            return Ok(self.consensus.announce_requests(vec![id]));
        }
        Ok(vec![])
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Routing
    // ═══════════════════════════════════════════════════════════════════════

    fn on_peer_message(&mut self, from: PeerIndex, message: PeerMessage) -> Vec<Action> {
        if from.0 >= self.committee.size() {
            debug!(peer = from.0, "Dropping message from outside the committee");
            return vec![];
        }
        if message.is_sync() {
            return self.state_manager.handle(ChainEvent::PeerMessage { from, message });
        }
        if let PeerMessage::NotifyReq(notify) = &message {
            for id in &notify.request_ids {
                self.mempool.mark_seen_by_committee_peer(id, from);
            }
        }
        self.consensus
            .handle(ChainEvent::PeerMessage { from, message }, &self.mempool)
    }

    fn on_state_transition(&mut self, event: ChainEvent) -> Vec<Action> {
        let ChainEvent::StateTransition {
            state,
            request_ids,
            ..
        } = &event
        else {
            return vec![];
        };
        self.mempool.remove_requests(request_ids);
        self.mempool.on_state_index(state.index());
        let mut actions: Vec<Action> = request_ids
            .iter()
            .map(|&request_id| Action::EmitRequestProcessed { request_id })
            .collect();
        actions.extend(self.consensus.handle(event, &self.mempool));
        actions
    }

    /// Keep consensus and the state manager consistent with each other.
    fn reconcile(&mut self) -> Vec<Action> {
        if let Some(fatal) = self.state_manager.fatal() {
            if self.fatal.is_none() {
                error!(chain = %self.chain_id, error = %fatal, "Chain halted on unverifiable state");
                self.fatal = Some(fatal.to_string());
                return self.consensus.dismiss();
            }
            return vec![];
        }
        let synced = self.state_manager.is_synced()
            && self.consensus.base_index() == Some(self.state_manager.state_index());
        self.consensus.set_synced(synced);
        self.state_manager
            .set_round_lock(self.consensus.has_round_in_flight())
    }
}

impl StateMachine for ChainStateMachine {
    #[instrument(skip(self, event), fields(
        chain = %self.chain_id,
        event = %event.type_name(),
    ))]
    fn handle(&mut self, event: ChainEvent) -> Vec<Action> {
        if self.dismissed {
            return vec![];
        }
        let mut actions = match event {
            ChainEvent::ReceiveRequest { request } => match self.receive_request(request) {
                Ok(actions) => actions,
                Err(e) => {
                    debug!(error = %e, "Request not admitted");
                    vec![]
                }
            },
            ChainEvent::StateOutput { output } => {
                let mut actions = self
                    .consensus
                    .handle(ChainEvent::StateOutput { output }, &self.mempool);
                actions.extend(
                    self.state_manager
                        .set_round_lock(self.consensus.has_round_in_flight()),
                );
                actions.extend(self.state_manager.handle(ChainEvent::StateOutput { output }));
                actions
            }
            ChainEvent::PeerMessage { from, message } => self.on_peer_message(from, message),
            event @ (ChainEvent::StateManagerTimer
            | ChainEvent::PendingBlock { .. }
            | ChainEvent::EvidenceStateIndex { .. }) => self.state_manager.handle(event),
            event @ (ChainEvent::ConsensusTimer
            | ChainEvent::VmResult { .. }
            | ChainEvent::TransactionInclusionState { .. }) => {
                self.consensus.handle(event, &self.mempool)
            }
            event @ ChainEvent::StateTransition { .. } => self.on_state_transition(event),
            // The requests leave the mempool with the StateTransition that
            // applies the block.
            ChainEvent::BatchFinalized {
                state_index,
                request_ids,
            } => {
                debug!(
                    state_index = state_index.0,
                    requests = request_ids.len(),
                    "Batch finalized"
                );
                vec![]
            }
        };
        actions.extend(self.reconcile());
        actions
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.mempool.set_time(now);
        self.state_manager.set_time(now);
        self.consensus.set_time(now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumstate_core::{MemoryBlobCache, NotifyReqMsg, StartProcessingBatchMsg};
    use quorumstate_mempool::MempoolError;
    use quorumstate_test_helpers::{fixtures, FakeCommittee, TestCommittee};
    use quorumstate_types::{RequestError, StateIndex, StateOutput};
    use tracing_test::traced_test;

    fn chain(committee: &TestCommittee, idx: usize) -> (ChainStateMachine, Arc<FakeCommittee>) {
        let fake = committee.fake(idx);
        let mut chain = ChainStateMachine::new(
            committee.chain_id(),
            Arc::clone(&fake) as Arc<dyn Committee>,
            fixtures::origin(committee.chain_id()),
            Arc::new(MemoryBlobCache::new()),
            ChainConfig::default(),
        );
        chain.set_time(Duration::from_secs(100));
        (chain, fake)
    }

    /// Feed `event`, then every internal event it produces, depth first.
    fn drive(chain: &mut ChainStateMachine, event: ChainEvent) -> Vec<Action> {
        let mut out = Vec::new();
        let mut queue = vec![event];
        while let Some(event) = queue.pop() {
            for action in chain.handle(event) {
                match action {
                    Action::EnqueueInternal { event } => queue.push(event),
                    other => out.push(other),
                }
            }
        }
        out
    }

    fn synced_at_origin(chain: &mut ChainStateMachine) -> Vec<Action> {
        let output = fixtures::output_for(chain.solid_state());
        drive(chain, ChainEvent::StateOutput { output })
    }

    #[test]
    fn test_request_admission_and_status() {
        let committee = TestCommittee::new(4, 3, 60);
        let (mut chain, _) = chain(&committee, 0);
        synced_at_origin(&mut chain);

        let request = fixtures::make_request(1, 10);
        let actions = chain.receive_request(Arc::clone(&request)).unwrap();
        assert!(matches!(
            actions.as_slice(),
            [Action::Broadcast {
                message: PeerMessage::NotifyReq(NotifyReqMsg { batch_hash: None, .. })
            }]
        ));
        assert_eq!(chain.request_status(&request.id), RequestProcessingStatus::Backlog);
        assert!(chain.is_request_in_backlog(&request.id));

        // Duplicate is accepted silently.
        assert!(chain.receive_request(Arc::clone(&request)).unwrap().is_empty());

        let mut invalid = (*fixtures::make_request(2, 20)).clone();
        invalid.target_contract.clear();
        let err = chain.receive_request(Arc::new(invalid.clone())).unwrap_err();
        assert_eq!(
            err,
            ChainError::Request(MempoolError::Invalid(RequestError::EmptyTarget(invalid.id)))
        );
        assert_eq!(chain.request_status(&invalid.id), RequestProcessingStatus::Unknown);
    }

    #[test]
    fn test_notify_req_marks_seen() {
        let committee = TestCommittee::new(4, 3, 61);
        let (mut chain, _) = chain(&committee, 1);
        let request = fixtures::make_request(1, 10);
        chain.receive_request(Arc::clone(&request)).unwrap();

        chain.handle(ChainEvent::PeerMessage {
            from: PeerIndex(3),
            message: PeerMessage::NotifyReq(NotifyReqMsg {
                state_index: StateIndex(0),
                request_ids: vec![request.id],
                batch_hash: None,
            }),
        });
        assert_eq!(chain.mempool().get_record(&request.id).unwrap().seen_count(), 2);
    }

    #[test]
    fn test_round_through_chain_consumes_requests() {
        let committee = TestCommittee::new(4, 3, 62);
        let (mut chain, fake) = chain(&committee, 0);
        synced_at_origin(&mut chain);

        let request = fixtures::make_request(1, 10);
        chain.receive_request(Arc::clone(&request)).unwrap();
        for peer in [1, 2] {
            chain.handle(ChainEvent::PeerMessage {
                from: PeerIndex(peer),
                message: PeerMessage::NotifyReq(NotifyReqMsg {
                    state_index: StateIndex(0),
                    request_ids: vec![request.id],
                    batch_hash: None,
                }),
            });
        }
        fake.drain_sent();

        let actions = chain.handle(ChainEvent::ConsensusTimer);
        let proposal: StartProcessingBatchMsg = actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast {
                    message: PeerMessage::StartProcessingBatch(p),
                } => Some(p.clone()),
                _ => None,
            })
            .expect("leader proposes");
        assert!(chain.state_manager().is_round_locked());

        let mut task = None;
        for peer in [1u16, 2] {
            for action in chain.handle(ChainEvent::PeerMessage {
                from: PeerIndex(peer),
                message: PeerMessage::NotifyReq(NotifyReqMsg {
                    state_index: StateIndex(0),
                    request_ids: proposal.request_ids.clone(),
                    batch_hash: Some(proposal.batch_hash()),
                }),
            }) {
                if let Action::ExecuteBatch { task: t } = action {
                    task = Some(t);
                }
            }
        }
        let task = task.expect("quorum acks trigger execution");
        let result = quorumstate_consensus::run_batch(
            &fixtures::CounterVm,
            &MemoryBlobCache::new(),
            &task,
        );
        drive(
            &mut chain,
            ChainEvent::VmResult {
                state_index: task.state_index(),
                batch_hash: task.batch_hash,
                result,
            },
        );

        let essence = chain.consensus().current_essence().unwrap().clone();
        for peer in [1usize, 2] {
            chain.handle(ChainEvent::PeerMessage {
                from: PeerIndex(peer as u16),
                message: PeerMessage::SignedHash(quorumstate_core::SignedHashMsg {
                    state_index: StateIndex(0),
                    batch_hash: proposal.batch_hash(),
                    essence_hash: essence.hash(),
                    share: committee.share(peer).sign_share(&essence.signing_message()),
                }),
            });
        }

        // Ledger confirms: inclusion verdict, then the anchored output.
        drive(
            &mut chain,
            ChainEvent::TransactionInclusionState {
                tx_id: essence.hash(),
                state: quorumstate_types::InclusionState::Included,
            },
        );
        // Still held until the confirmed block is applied.
        assert!(chain.is_request_in_backlog(&request.id));
        assert!(chain.mempool().get_record(&request.id).is_some());

        let actions = drive(
            &mut chain,
            ChainEvent::StateOutput {
                output: StateOutput {
                    output_id: essence.hash(),
                    index: essence.index,
                    state_hash: essence.state_hash,
                    timestamp: essence.timestamp,
                },
            },
        );
        assert_eq!(chain.state_manager().state_index(), StateIndex(1));
        assert_eq!(chain.request_status(&request.id), RequestProcessingStatus::Completed);
        let processed = actions
            .iter()
            .filter(|a| matches!(
                a,
                Action::EmitRequestProcessed { request_id } if *request_id == request.id
            ))
            .count();
        assert_eq!(processed, 1);
        assert!(!chain.is_request_in_backlog(&request.id));
        assert!(chain.mempool().is_tombstoned(&request.id));
        assert_eq!(chain.consensus().base_index(), Some(StateIndex(1)));
    }

    #[traced_test]
    #[test]
    fn test_hash_mismatch_halts_chain() {
        let committee = TestCommittee::new(4, 3, 63);
        let (mut chain, _) = chain(&committee, 0);
        let mut output = fixtures::output_for(chain.solid_state());
        output.state_hash = quorumstate_types::Hash::from_bytes(b"elsewhere");

        let actions = drive(&mut chain, ChainEvent::StateOutput { output });
        assert!(actions.iter().any(|a| matches!(a, Action::ReportFatal { .. })));
        assert!(chain.fatal_reason().is_some());
        assert!(chain.status().fatal.is_some());
        assert!(logs_contain("Chain halted on unverifiable state"));
    }

    #[test]
    fn test_dismiss_is_idempotent() {
        let committee = TestCommittee::new(4, 3, 64);
        let (mut chain, fake) = chain(&committee, 0);
        chain.start();

        let actions = chain.dismiss();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::CancelTimer {
                id: TimerId::Consensus
            }
        )));
        assert!(chain.is_dismissed());
        assert!(fake.is_closed());
        assert!(chain.dismiss().is_empty());
        assert!(chain.is_dismissed());
        assert!(chain.handle(ChainEvent::ConsensusTimer).is_empty());
        assert!(matches!(
            chain.receive_request(fixtures::make_request(1, 1)),
            Err(ChainError::Dismissed(_))
        ));
    }

    #[test]
    fn test_rotate_committee_clears_seen_marks() {
        let committee = TestCommittee::new(4, 3, 65);
        let (mut chain, old) = chain(&committee, 0);
        synced_at_origin(&mut chain);
        let request = fixtures::make_request(1, 10);
        chain.receive_request(Arc::clone(&request)).unwrap();
        chain.handle(ChainEvent::PeerMessage {
            from: PeerIndex(1),
            message: PeerMessage::NotifyReq(NotifyReqMsg {
                state_index: StateIndex(0),
                request_ids: vec![request.id],
                batch_hash: None,
            }),
        });
        assert_eq!(chain.mempool().get_record(&request.id).unwrap().seen_count(), 2);

        let next = TestCommittee::new(5, 4, 66);
        let actions = chain
            .rotate_committee(next.fake(3) as Arc<dyn Committee>)
            .unwrap();
        assert!(actions.iter().all(|a| !matches!(a, Action::ReportFatal { .. })));
        assert!(old.is_closed());
        assert_eq!(chain.committee().size(), 5);
        let record = chain.mempool().get_record(&request.id).unwrap();
        assert_eq!(record.seen_count(), 1);
        assert!(record.seen.contains_key(&PeerIndex(3)));
    }

    #[test]
    fn test_status_serializes() {
        let committee = TestCommittee::new(4, 3, 67);
        let (mut chain, _) = chain(&committee, 2);
        synced_at_origin(&mut chain);
        let json = serde_json::to_value(chain.status()).unwrap();
        assert_eq!(json["sync"]["state"], "synced");
        assert_eq!(json["consensus"]["stage"], "idle");
        assert_eq!(json["dismissed"], false);
    }
}
