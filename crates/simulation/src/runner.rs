//! Deterministic simulation runner.

use crate::committee::SimCommittee;
use crate::event_queue::EventKey;
use crate::ledger::SimLedger;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use quorumstate_chain::{ChainConfig, ChainStateMachine};
use quorumstate_committee::Committee;
use quorumstate_consensus::run_batch;
use quorumstate_core::{
    Action, ChainEvent, MemoryBlobCache, StateMachine, TimerId, VmProcessor,
};
use quorumstate_types::{
    deal_shares, ChainId, CryptoError, DkShare, PeerIndex, Request, RequestId, StateIndex,
    StateOutput, VirtualState,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Failed to deal committee shares: {0}")]
    Crypto(#[from] CryptoError),
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub nodes: u16,
    pub threshold: u16,
    pub network: NetworkConfig,
    /// Delay between a ledger event and its delivery to a node.
    pub ledger_latency: Duration,
    /// Simulated VM execution time per batch.
    pub execution_delay: Duration,
    pub chain: ChainConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            threshold: 3,
            network: NetworkConfig::default(),
            ledger_latency: Duration::from_millis(100),
            execution_delay: Duration::from_millis(10),
            chain: ChainConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn new(nodes: u16, threshold: u16) -> Self {
        Self {
            nodes,
            threshold,
            ..Self::default()
        }
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_ledger_latency(mut self, latency: Duration) -> Self {
        self.ledger_latency = latency;
        self
    }

    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    pub fn with_chain(mut self, chain: ChainConfig) -> Self {
        self.chain = chain;
        self
    }
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Events addressed to a crashed node.
    pub events_skipped: u64,
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to partition or a crashed endpoint.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    pub send_failures: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
    pub batches_executed: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

struct SimNode {
    chain: ChainStateMachine,
    committee: Arc<SimCommittee>,
    blobs: Arc<MemoryBlobCache>,
    /// Every `RequestProcessed` this node emitted, across restarts.
    processed: Vec<RequestId>,
    fatal: Option<String>,
}

/// Drives every member of one chain's committee through a deterministic
/// event queue.
///
/// Given the same configuration, VM and seed, every run produces the same
/// sequence of events and the same anchored states.
pub struct SimulationRunner {
    config: SimulationConfig,
    chain_id: ChainId,
    shares: Vec<Arc<DkShare>>,
    vm: Arc<dyn VmProcessor>,
    nodes: Vec<SimNode>,
    event_queue: BTreeMap<EventKey, ChainEvent>,
    sequence: u64,
    now: Duration,
    network: SimulatedNetwork,
    ledger: SimLedger,
    rng: ChaCha8Rng,
    /// Pending timer per node, keyed to its queue entry for cancellation.
    timers: BTreeMap<(NodeIndex, TimerId), EventKey>,
    stats: SimulationStats,
}

impl std::fmt::Debug for SimulationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("chain_id", &self.chain_id)
            .field("nodes", &self.nodes.len())
            .field("now", &self.now)
            .field("queued", &self.event_queue.len())
            .field("anchored", &self.ledger.anchored().index)
            .finish()
    }
}

fn seed_bytes(seed: u64) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517c_c1b7_2722_0a95).to_le_bytes());
    bytes
}

impl SimulationRunner {
    /// Deal a committee from `seed` and create one chain per member, all
    /// starting from the origin state.
    pub fn new(
        config: SimulationConfig,
        vm: Arc<dyn VmProcessor>,
        seed: u64,
    ) -> Result<Self, SimulationError> {
        let shares: Vec<Arc<DkShare>> =
            deal_shares(config.nodes, config.threshold, &seed_bytes(seed))?
                .into_iter()
                .map(Arc::new)
                .collect();
        let chain_id = ChainId::from_address(&shares[0].address());
        let origin = Arc::new(VirtualState::origin(chain_id));
        let network = SimulatedNetwork::new(config.network.clone(), config.nodes);
        let ledger = SimLedger::new(Arc::clone(&shares[0]), &origin);

        let mut runner = Self {
            chain_id,
            vm,
            nodes: Vec::with_capacity(shares.len()),
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            ledger,
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: BTreeMap::new(),
            stats: SimulationStats::default(),
            shares,
            config,
        };
        for index in 0..runner.shares.len() {
            let node = runner.build_node(index, Arc::clone(&origin), Arc::new(MemoryBlobCache::new()));
            runner.nodes.push(node);
        }

        info!(
            chain = %chain_id,
            nodes = runner.nodes.len(),
            threshold = runner.config.threshold,
            seed,
            "Created simulation runner"
        );
        Ok(runner)
    }

    fn build_node(
        &self,
        index: usize,
        solid: Arc<VirtualState>,
        blobs: Arc<MemoryBlobCache>,
    ) -> SimNode {
        let committee = Arc::new(SimCommittee::new(
            Arc::clone(&self.shares[index]),
            Arc::clone(self.network.links()),
        ));
        let chain = ChainStateMachine::new(
            self.chain_id,
            committee.clone(),
            solid,
            blobs.clone(),
            self.config.chain.clone(),
        );
        SimNode {
            chain,
            committee,
            blobs,
            processed: Vec::new(),
            fatal: None,
        }
    }

    /// Start every chain and deliver the origin output to each.
    pub fn start(&mut self) {
        for index in 0..self.nodes.len() {
            self.start_node(index as NodeIndex);
        }
    }

    fn start_node(&mut self, node: NodeIndex) {
        let actions = {
            let sim = &mut self.nodes[node as usize];
            sim.chain.set_time(self.now);
            sim.chain.start()
        };
        self.process_actions(node, actions);
        let output = self.ledger.anchored();
        self.schedule_event(node, self.now, ChainEvent::StateOutput { output });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&ChainStateMachine> {
        self.nodes.get(index as usize).map(|n| &n.chain)
    }

    /// Index of a node's solid state.
    pub fn state_index(&self, index: NodeIndex) -> Option<StateIndex> {
        self.node(index).map(|c| c.state_manager().state_index())
    }

    /// Requests a node reported processed, in order.
    pub fn processed(&self, index: NodeIndex) -> &[RequestId] {
        self.nodes
            .get(index as usize)
            .map(|n| n.processed.as_slice())
            .unwrap_or_default()
    }

    pub fn fatal(&self, index: NodeIndex) -> Option<&str> {
        self.nodes.get(index as usize)?.fatal.as_deref()
    }

    pub fn blobs(&self, index: NodeIndex) -> Option<&Arc<MemoryBlobCache>> {
        self.nodes.get(index as usize).map(|n| &n.blobs)
    }

    pub fn ledger(&self) -> &SimLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut SimLedger {
        &mut self.ledger
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Partition and packet loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Anchored outputs so far, origin first.
    pub fn anchored_history(&self) -> &[StateOutput] {
        self.ledger.history()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Input
    // ═══════════════════════════════════════════════════════════════════════

    /// Deliver a client request to one node after `delay`.
    pub fn submit_request(&mut self, node: NodeIndex, request: Arc<Request>, delay: Duration) {
        let time = self.now + delay;
        self.schedule_event(node, time, ChainEvent::ReceiveRequest { request });
    }

    /// Deliver a client request to every node now.
    pub fn submit_to_all(&mut self, request: &Arc<Request>) {
        for node in 0..self.nodes.len() {
            self.submit_request(node as NodeIndex, Arc::clone(request), Duration::ZERO);
        }
    }

    /// Stop a node: its queued events and timers are dropped and the
    /// network treats it as unreachable until [`restart_node`](Self::restart_node).
    pub fn crash_node(&mut self, node: NodeIndex) {
        self.network.set_down(node, true);
        self.event_queue.retain(|key, _| key.node_index != node);
        self.timers.retain(|(n, _), _| *n != node);
        if let Some(sim) = self.nodes.get(node as usize) {
            sim.committee.close();
        }
        info!(node, "Node crashed");
    }

    /// Bring a crashed node back, recovering from the last state it had
    /// applied. Its mempool starts empty.
    pub fn restart_node(&mut self, node: NodeIndex) {
        let Some(old) = self.nodes.get(node as usize) else {
            return;
        };
        old.committee.close();
        let solid = Arc::clone(old.chain.solid_state());
        let blobs = Arc::clone(&old.blobs);
        let mut fresh = self.build_node(node as usize, solid, blobs);

        let old = &mut self.nodes[node as usize];
        fresh.processed = std::mem::take(&mut old.processed);
        *old = fresh;

        self.network.set_down(node, false);
        self.start_node(node);
        info!(node, state_index = ?self.state_index(node), "Node restarted");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Process every event scheduled up to `end_time`, then advance the
    /// clock to `end_time`.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );

        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let Some((key, event)) = self.event_queue.pop_first() else {
                break;
            };
            self.now = key.time;
            self.step(key, event);
        }

        if self.now < end_time {
            self.now = end_time;
        }
    }

    /// Run for `duration` of simulated time.
    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(self.now + duration);
    }

    /// Run until every live node has applied `target`, giving up at
    /// `deadline`. Returns whether the target was reached.
    pub fn run_until_index(&mut self, target: StateIndex, deadline: Duration) -> bool {
        let step = Duration::from_millis(100);
        loop {
            let reached = (0..self.nodes.len() as NodeIndex)
                .filter(|&n| !self.network.is_down(n))
                .all(|n| self.state_index(n).is_some_and(|i| i >= target));
            if reached {
                return true;
            }
            if self.now >= deadline {
                return false;
            }
            self.run_until((self.now + step).min(deadline));
        }
    }

    fn step(&mut self, key: EventKey, event: ChainEvent) {
        let node = key.node_index;
        if self.network.is_down(node) {
            self.stats.events_skipped += 1;
            return;
        }
        let fired = match event {
            ChainEvent::StateManagerTimer => Some(TimerId::StateManager),
            ChainEvent::ConsensusTimer => Some(TimerId::Consensus),
            _ => None,
        };
        if let Some(id) = fired {
            if self.timers.get(&(node, id)) == Some(&key) {
                self.timers.remove(&(node, id));
            }
        }

        self.stats.events_processed += 1;
        self.stats.events_by_priority[key.priority as usize] += 1;
        trace!(time = ?self.now, node, event = event.type_name(), "Processing event");

        let actions = {
            let sim = &mut self.nodes[node as usize];
            sim.chain.set_time(self.now);
            sim.chain.handle(event)
        };
        self.process_actions(node, actions);
    }

    fn process_actions(&mut self, node: NodeIndex, actions: Vec<Action>) {
        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(node, action);
        }
        self.flush_outbox(node);
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::SendToPeer { target, message } => {
                let committee = &self.nodes[from as usize].committee;
                if let Err(e) = committee.send_msg(target, message) {
                    trace!(from, to = target.0, error = %e, "Send failed");
                    self.stats.send_failures += 1;
                }
            }
            Action::Broadcast { message } => {
                let now_ms = self.now.as_millis() as u64;
                self.nodes[from as usize]
                    .committee
                    .send_msg_to_peers(message, now_ms);
            }
            Action::SetTimer { id, duration } => {
                if let Some(previous) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&previous);
                }
                let key = self.schedule_event(from, self.now + duration, id.into_event());
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }
            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }
            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }
            Action::ExecuteBatch { task } => {
                let sim = &self.nodes[from as usize];
                let result = run_batch(self.vm.as_ref(), sim.blobs.as_ref(), &task);
                self.stats.batches_executed += 1;
                let event = ChainEvent::VmResult {
                    state_index: task.state_index(),
                    batch_hash: task.batch_hash,
                    result,
                };
                self.schedule_event(from, self.now + self.config.execution_delay, event);
            }
            Action::PostTransaction { transaction } => {
                let (verdict, output) = self.ledger.post(&transaction);
                debug!(from, ?verdict, "Transaction posted");
                if let Some(output) = output {
                    let time = self.now + self.config.ledger_latency;
                    for node in 0..self.nodes.len() {
                        self.schedule_event(node as NodeIndex, time, ChainEvent::StateOutput { output });
                    }
                }
            }
            Action::QueryInclusionState { tx_id } => {
                let state = self.ledger.inclusion_state(&tx_id);
                let time = self.now + self.config.ledger_latency;
                self.schedule_event(from, time, ChainEvent::TransactionInclusionState { tx_id, state });
            }
            Action::EmitRequestProcessed { request_id } => {
                self.nodes[from as usize].processed.push(request_id);
            }
            Action::ReportFatal { reason } => {
                warn!(node = from, %reason, "Node reported fatal state");
                self.nodes[from as usize].fatal = Some(reason);
            }
        }
    }

    /// Route everything the node's committee queued through the network.
    fn flush_outbox(&mut self, from: NodeIndex) {
        let outgoing = self.nodes[from as usize].committee.drain_outbox();
        let size = self.nodes.len() as NodeIndex;
        for (target, message) in outgoing {
            let targets: Vec<NodeIndex> = match target {
                Some(peer) => vec![peer.0],
                None => (0..size).filter(|&n| n != from).collect(),
            };
            for to in targets {
                let event = ChainEvent::PeerMessage {
                    from: PeerIndex(from),
                    message: message.clone(),
                };
                self.try_deliver_event(from, to, event);
            }
        }
    }

    /// Deliver an event across the network, accounting for partitions and
    /// packet loss.
    fn try_deliver_event(&mut self, from: NodeIndex, to: NodeIndex, event: ChainEvent) {
        let partitioned = !self.network.links().is_reachable(from, to);
        match self.network.should_deliver(from, to, &mut self.rng) {
            Some(latency) => {
                self.schedule_event(to, self.now + latency, event);
                self.stats.messages_sent += 1;
            }
            None if partitioned => {
                self.stats.messages_dropped_partition += 1;
                trace!(from, to, "Event dropped due to partition");
            }
            None => {
                self.stats.messages_dropped_loss += 1;
                trace!(from, to, "Event dropped due to packet loss");
            }
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: ChainEvent) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }
}
