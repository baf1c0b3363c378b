//! Per-chain event loop thread.
//!
//! Each chain runs on its own `std::thread`. Events come from three
//! crossbeam channels plus a local queue of internal events, taken in
//! priority order:
//!
//! ```text
//! internal queue (0) > timer_rx (1) > callback_rx (2) > inbound_rx (3)
//! ```
//!
//! Internal events are the follow-ups a step enqueued for itself; draining
//! them first keeps each step's consequences ahead of unrelated input. When
//! nothing is ready the loop blocks on `crossbeam::select!` with the status
//! interval as timeout.

use crate::runner::RunnerServices;
use crate::timers::TimerManager;
use arc_swap::ArcSwap;
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use quorumstate_chain::{ChainStateMachine, ChainStatus};
use quorumstate_committee::Committee;
use quorumstate_core::{Action, ChainEvent, StateMachine, TimerScheduler};
use quorumstate_metrics as metrics;
use quorumstate_types::RequestId;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

/// Channels and shared state handed to the loop thread.
pub(crate) struct LoopChannels {
    pub timer_tx: Sender<ChainEvent>,
    pub timer_rx: Receiver<ChainEvent>,
    /// VM results.
    pub callback_tx: Sender<ChainEvent>,
    pub callback_rx: Receiver<ChainEvent>,
    /// Peer messages, ledger events and requests.
    pub inbound_rx: Receiver<ChainEvent>,
    pub shutdown_rx: Receiver<()>,
    pub status: Arc<ArcSwap<ChainStatus>>,
    pub processed_tx: broadcast::Sender<RequestId>,
}

/// Wall-clock time since the Unix epoch.
fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

fn shutdown_requested(rx: &Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(TryRecvError::Empty))
}

struct ChainLoop {
    chain: ChainStateMachine,
    services: RunnerServices,
    channels: LoopChannels,
    timers: TimerManager,
    internal: VecDeque<ChainEvent>,
}

impl ChainLoop {
    fn run(mut self) {
        let chain_id = self.chain.chain_id();
        info!(chain = %chain_id, "Chain loop starting");

        let actions = self.chain.start();
        self.execute(actions);
        let mut last_status = Instant::now();

        loop {
            if shutdown_requested(&self.channels.shutdown_rx) {
                break;
            }
            self.chain.set_time(wall_clock());

            let event = match self.next_event() {
                Ok(event) => event,
                Err(()) => break,
            };
            if let Some(event) = event {
                metrics::set_intake_depth(self.channels.inbound_rx.len());
                trace!(event = event.type_name(), "Step");
                let actions = self.chain.handle(event);
                self.execute(actions);
            }

            if last_status.elapsed() >= self.services.status_interval {
                last_status = Instant::now();
                self.publish_status();
            }
        }

        let actions = self.chain.dismiss();
        self.execute(actions);
        self.publish_status();
        info!(chain = %chain_id, "Chain loop exiting");
    }

    /// `Err` on shutdown, `Ok(None)` on timeout.
    fn next_event(&mut self) -> Result<Option<ChainEvent>, ()> {
        if let Some(event) = self.internal.pop_front() {
            return Ok(Some(event));
        }
        let c = &self.channels;
        if let Ok(e) = c.timer_rx.try_recv() {
            return Ok(Some(e));
        }
        if let Ok(e) = c.callback_rx.try_recv() {
            return Ok(Some(e));
        }
        if let Ok(e) = c.inbound_rx.try_recv() {
            return Ok(Some(e));
        }

        crossbeam::channel::select! {
            recv(c.shutdown_rx) -> _ => Err(()),
            recv(c.timer_rx) -> e => Ok(e.ok()),
            recv(c.callback_rx) -> e => Ok(e.ok()),
            recv(c.inbound_rx) -> e => Ok(e.ok()),
            default(self.services.status_interval) => Ok(None),
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        let chain_id = self.chain.chain_id();
        for action in actions {
            match action {
                Action::SendToPeer { target, message } => {
                    if let Err(e) = self.chain.committee().send_msg(target, message) {
                        debug!(peer = %target, error = %e, "Send failed");
                    }
                }
                Action::Broadcast { message } => {
                    let now_ms = wall_clock().as_millis() as u64;
                    self.chain.committee().send_msg_to_peers(message, now_ms);
                }
                Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
                Action::CancelTimer { id } => self.timers.cancel_timer(id),
                Action::EnqueueInternal { event } => self.internal.push_back(event),
                Action::ExecuteBatch { task } => self.services.vm_pool.execute(
                    Arc::clone(&self.services.vm),
                    Arc::clone(&self.services.blobs),
                    task,
                    self.channels.callback_tx.clone(),
                ),
                Action::PostTransaction { transaction } => {
                    self.services.ledger.post_transaction(chain_id, transaction)
                }
                Action::QueryInclusionState { tx_id } => {
                    self.services.ledger.request_inclusion_state(chain_id, tx_id)
                }
                Action::EmitRequestProcessed { request_id } => {
                    // No subscribers is fine.
                    let _ = self.channels.processed_tx.send(request_id);
                }
                Action::ReportFatal { reason } => {
                    error!(chain = %chain_id, %reason, "Chain stopped on fatal state error");
                    self.publish_status();
                }
            }
        }
    }

    fn publish_status(&self) {
        self.channels.status.store(Arc::new(self.chain.status()));
    }
}

/// Spawn the loop thread for `chain`.
pub(crate) fn spawn_chain_loop(
    chain: ChainStateMachine,
    services: RunnerServices,
    channels: LoopChannels,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let name = format!("chain-{}", chain.chain_id());
    let timers = TimerManager::new(services.tokio.clone(), channels.timer_tx.clone());
    let chain_loop = ChainLoop {
        chain,
        services,
        channels,
        timers,
        internal: VecDeque::new(),
    };
    std::thread::Builder::new()
        .name(name)
        .spawn(move || chain_loop.run())
}
