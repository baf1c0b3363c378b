//! Chain runner: one loop thread per chain plus the handle to drive it.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────────────┐
//!  │  chain-<id> (std::thread)                                            │
//!  │  ┌────────────────────────────────────────────────────────────────┐  │
//!  │  │  ChainLoop                                                     │  │
//!  │  │    - ChainStateMachine event processing                        │  │
//!  │  │    - Action execution (sends, timers, ledger calls)            │  │
//!  │  │    - Status snapshots (ArcSwap)                                │  │
//!  │  └────────────────────────────────────────────────────────────────┘  │
//!  │       ↑ crossbeam channels (all events) ↑                            │
//!  └──────────────────────────────────────────────────────────────────────┘
//!
//!  ┌──────────────────────────────┐  ┌─────────────────────────────────┐
//!  │  Tokio runtime               │  │  Rayon VM pool                  │
//!  │    - TimerManager sleeps     │  │    - run_batch per VmTask       │
//!  └──────────────────────────────┘  └─────────────────────────────────┘
//! ```
//!
//! ## Channel topology
//!
//! ```text
//! Committee handler ──crossbeam──→ inbound  (PeerMessage)
//! Ledger            ──crossbeam──→ inbound  (StateOutput, inclusion states)
//! ChainHandle       ──crossbeam──→ inbound  (ReceiveRequest)
//! VmPool            ──crossbeam──→ callback (VmResult)
//! TimerManager      ──crossbeam──→ timer    (StateManagerTimer, ConsensusTimer)
//! ```

use crate::event_loop::{spawn_chain_loop, LoopChannels};
use crate::thread_pools::{ThreadPoolError, VmPool};
use arc_swap::ArcSwap;
use crossbeam::channel::{self, Sender};
use quorumstate_chain::{ChainStateMachine, ChainStatus};
use quorumstate_committee::{Committee, CommitteeError};
use quorumstate_core::{BlobCache, ChainEvent, LedgerClient, VmProcessor};
use quorumstate_types::{ChainId, Request, RequestId};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the request-processed broadcast. Slow subscribers lag
/// rather than block the loop.
const PROCESSED_CAPACITY: usize = 1024;

/// Errors that can occur while running a chain.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Chain loop channel closed")]
    ChannelClosed,

    #[error("Failed to spawn chain thread: {0}")]
    ThreadSpawn(String),

    #[error("Chain thread panicked")]
    ThreadPanicked,

    #[error("Committee error: {0}")]
    Committee(#[from] CommitteeError),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] ThreadPoolError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),
}

/// Signals a chain loop to stop. Dropping the handle signals too.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<Sender<()>>,
}

impl ShutdownHandle {
    pub fn shutdown(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Node-wide services shared by every chain loop.
#[derive(Clone)]
pub struct RunnerServices {
    pub vm: Arc<dyn VmProcessor>,
    pub blobs: Arc<dyn BlobCache>,
    pub ledger: Arc<dyn LedgerClient>,
    pub vm_pool: Arc<VmPool>,
    /// Runtime the timers sleep on.
    pub tokio: tokio::runtime::Handle,
    /// How often the loop republishes its status snapshot.
    pub status_interval: Duration,
}

impl std::fmt::Debug for RunnerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerServices")
            .field("vm_pool", &self.vm_pool)
            .field("status_interval", &self.status_interval)
            .finish_non_exhaustive()
    }
}

impl RunnerServices {
    pub fn new(
        vm: Arc<dyn VmProcessor>,
        blobs: Arc<dyn BlobCache>,
        ledger: Arc<dyn LedgerClient>,
        vm_pool: Arc<VmPool>,
        tokio: tokio::runtime::Handle,
    ) -> Self {
        Self {
            vm,
            blobs,
            ledger,
            vm_pool,
            tokio,
            status_interval: Duration::from_millis(500),
        }
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }
}

/// Handle to a running chain.
pub struct ChainHandle {
    chain_id: ChainId,
    events: Sender<ChainEvent>,
    status: Arc<ArcSwap<ChainStatus>>,
    processed: broadcast::Sender<RequestId>,
    shutdown: Option<ShutdownHandle>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandle")
            .field("chain_id", &self.chain_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ChainHandle {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Sender feeding the chain's inbound channel. Ledger clients and
    /// ingress paths hold clones of it.
    pub fn event_sender(&self) -> Sender<ChainEvent> {
        self.events.clone()
    }

    pub fn send(&self, event: ChainEvent) -> Result<(), RunnerError> {
        self.events
            .send(event)
            .map_err(|_| RunnerError::ChannelClosed)
    }

    /// Hand a client request to the chain's mempool.
    pub fn submit_request(&self, request: Arc<Request>) -> Result<(), RunnerError> {
        self.send(ChainEvent::ReceiveRequest { request })
    }

    /// Ids of requests whose block has been applied, from now on.
    pub fn subscribe_processed(&self) -> broadcast::Receiver<RequestId> {
        self.processed.subscribe()
    }

    /// Latest status snapshot published by the loop.
    pub fn status(&self) -> Arc<ChainStatus> {
        self.status.load_full()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for its thread. The loop dismisses the chain
    /// before exiting.
    pub fn dismiss(mut self) -> Result<(), RunnerError> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.shutdown();
        }
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| RunnerError::ThreadPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for ChainHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!(chain = %self.chain_id, "Chain handle dropped, stopping loop");
        }
    }
}

/// Start `chain` on its own thread.
///
/// Inbound committee messages are routed into the loop's intake; the
/// caller still has to connect ledger events through
/// [`ChainHandle::event_sender`].
pub fn spawn_chain(
    chain: ChainStateMachine,
    services: RunnerServices,
) -> Result<ChainHandle, RunnerError> {
    let chain_id = chain.chain_id();
    let (timer_tx, timer_rx) = channel::unbounded();
    let (callback_tx, callback_rx) = channel::unbounded();
    let (inbound_tx, inbound_rx) = channel::unbounded();
    let (shutdown_tx, shutdown_rx) = channel::bounded(1);
    let (processed_tx, _) = broadcast::channel(PROCESSED_CAPACITY);
    let status = Arc::new(ArcSwap::from_pointee(chain.status()));

    let peer_tx = inbound_tx.clone();
    chain
        .committee()
        .on_peer_message(Box::new(move |from, message| {
            if peer_tx.send(ChainEvent::PeerMessage { from, message }).is_err() {
                warn!(peer = from.0, "Chain intake closed, dropping peer message");
            }
        }))?;

    let channels = LoopChannels {
        timer_tx,
        timer_rx,
        callback_tx,
        callback_rx,
        inbound_rx,
        shutdown_rx,
        status: Arc::clone(&status),
        processed_tx: processed_tx.clone(),
    };
    let thread = spawn_chain_loop(chain, services, channels)
        .map_err(|e| RunnerError::ThreadSpawn(e.to_string()))?;
    info!(chain = %chain_id, "Chain spawned");

    Ok(ChainHandle {
        chain_id,
        events: inbound_tx,
        status,
        processed: processed_tx,
        shutdown: Some(ShutdownHandle {
            tx: Some(shutdown_tx),
        }),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::thread_pools::VmPoolConfig;
    use crate::transport::MemoryHub;
    use crate::vm::KeyValueVm;
    use quorumstate_chain::ChainConfig;
    use quorumstate_committee::{CommitteeImpl, PeerTransport};
    use quorumstate_core::MemoryBlobCache;
    use quorumstate_test_helpers::TestCommittee;
    use quorumstate_types::VirtualState;

    fn services(ledger: Arc<MemoryLedger>) -> RunnerServices {
        let pool = VmPool::new(VmPoolConfig::auto().with_threads(1)).unwrap();
        RunnerServices::new(
            Arc::new(KeyValueVm),
            Arc::new(MemoryBlobCache::new()),
            ledger,
            Arc::new(pool),
            tokio::runtime::Handle::current(),
        )
        .with_status_interval(Duration::from_millis(20))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_publishes_status_and_dismiss_joins() {
        let committee = TestCommittee::new(4, 3, 90);
        let chain_id = committee.chain_id();
        let origin = Arc::new(VirtualState::origin(chain_id));
        let ledger = Arc::new(MemoryLedger::new());
        ledger.register_chain(chain_id, Arc::clone(committee.share(0)), &origin);

        let hub = MemoryHub::new();
        let member = Arc::new(
            CommitteeImpl::new(
                committee.record(),
                Arc::clone(committee.share(0)),
                Arc::clone(&hub) as Arc<dyn PeerTransport>,
            )
            .unwrap(),
        );
        hub.register(&committee.record().nodes[0], &member);

        let chain = ChainStateMachine::new(
            chain_id,
            member.clone(),
            origin,
            Arc::new(MemoryBlobCache::new()),
            ChainConfig::default(),
        );
        let handle = spawn_chain(chain, services(Arc::clone(&ledger))).unwrap();
        ledger.subscribe(chain_id, handle.event_sender()).unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.status().chain_id, chain_id);
        assert!(!handle.status().dismissed);

        handle.dismiss().unwrap();
        assert!(member.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_handler_registration_fails() {
        let committee = TestCommittee::new(4, 3, 91);
        let chain_id = committee.chain_id();
        let origin = Arc::new(VirtualState::origin(chain_id));
        let ledger = Arc::new(MemoryLedger::new());
        let hub = MemoryHub::new();
        let member = Arc::new(
            CommitteeImpl::new(
                committee.record(),
                Arc::clone(committee.share(1)),
                Arc::clone(&hub) as Arc<dyn PeerTransport>,
            )
            .unwrap(),
        );
        let make_chain = || {
            ChainStateMachine::new(
                chain_id,
                member.clone(),
                Arc::clone(&origin),
                Arc::new(MemoryBlobCache::new()),
                ChainConfig::default(),
            )
        };

        let first = spawn_chain(make_chain(), services(Arc::clone(&ledger))).unwrap();
        let second = spawn_chain(make_chain(), services(ledger));
        assert!(matches!(
            second,
            Err(RunnerError::Committee(CommitteeError::HandlerAlreadyRegistered))
        ));
        first.dismiss().unwrap();
    }
}
