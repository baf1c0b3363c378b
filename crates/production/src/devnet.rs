//! Single-process committee: every node of one chain's committee running
//! in this process, wired through [`MemoryHub`] and [`MemoryLedger`].

use crate::chains::{ChainFactory, Chains, ChainsError};
use crate::config::NodeConfig;
use crate::ledger::MemoryLedger;
use crate::runner::{spawn_chain, ChainHandle, RunnerServices};
use crate::thread_pools::{ThreadPoolError, VmPool, VmPoolConfig};
use crate::transport::MemoryHub;
use quorumstate_chain::{
    ChainConfig, ChainStateMachine, ChainStatus, DkShareProvider, MemoryRegistry, RegistryError,
    RegistryProvider,
};
use quorumstate_committee::{CommitteeImpl, PeerTransport};
use quorumstate_core::{BlobCache, ChainEvent, MemoryBlobCache, VmProcessor};
use quorumstate_types::{
    deal_shares, ChainId, ChainRecord, CommitteeRecord, CryptoError, Request, RequestId,
    VirtualState,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DevnetError {
    #[error("Failed to deal key shares: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] ThreadPoolError),

    #[error("Chain {chain} failed to start on node {node}")]
    NotStarted { chain: ChainId, node: usize },

    #[error(transparent)]
    Chains(#[from] ChainsError),
}

/// One member node: its registry, blob cache and hosted chains.
#[derive(Debug)]
pub struct DevnetNode {
    pub peering_id: String,
    pub blobs: Arc<MemoryBlobCache>,
    pub chains: Chains,
}

pub struct LocalDevnet {
    chain_id: ChainId,
    committee: CommitteeRecord,
    hub: Arc<MemoryHub>,
    ledger: Arc<MemoryLedger>,
    nodes: Vec<DevnetNode>,
}

impl std::fmt::Debug for LocalDevnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDevnet")
            .field("chain_id", &self.chain_id)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

fn seed_bytes(seed: u64) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes
}

/// Factory for one node: builds the committee over the hub, starts the
/// chain from its origin state and subscribes it to the ledger. A restarted
/// chain catches up with the anchored state through block sync.
fn node_factory(
    peering_id: String,
    hub: Arc<MemoryHub>,
    ledger: Arc<MemoryLedger>,
    blobs: Arc<dyn BlobCache>,
    services: RunnerServices,
    chain_config: ChainConfig,
) -> ChainFactory {
    Box::new(
        move |record: &ChainRecord,
              registry: &dyn RegistryProvider|
              -> Result<ChainHandle, ChainsError> {
            let address = record.committee_address;
            let committee_record = registry
                .get_committee_record(&address)
                .ok_or(RegistryError::UnknownCommittee(address))?;
            let share = registry.load_dk_share(&address)?;
            let committee = Arc::new(CommitteeImpl::new(
                &committee_record,
                share,
                Arc::clone(&hub) as Arc<dyn PeerTransport>,
            )?);
            hub.register(&peering_id, &committee);

            let chain = ChainStateMachine::new(
                record.chain_id,
                committee,
                Arc::new(VirtualState::origin(record.chain_id)),
                Arc::clone(&blobs),
                chain_config.clone(),
            );
            let handle = spawn_chain(chain, services.clone())?;
            ledger.subscribe(record.chain_id, handle.event_sender())?;
            Ok(handle)
        },
    )
}

impl LocalDevnet {
    /// Deal a committee from `config.devnet`, register its chain with a
    /// fresh ledger and start the chain on every node.
    pub fn start(
        config: &NodeConfig,
        vm: Arc<dyn VmProcessor>,
        tokio: tokio::runtime::Handle,
    ) -> Result<Self, DevnetError> {
        let devnet = &config.devnet;
        let shares: Vec<_> = deal_shares(devnet.nodes, devnet.threshold, &seed_bytes(devnet.seed))?
            .into_iter()
            .map(Arc::new)
            .collect();
        let committee = CommitteeRecord {
            address: shares[0].address(),
            nodes: (0..devnet.nodes).map(|i| format!("node-{i}")).collect(),
        };
        let chain_id = ChainId::from_address(&committee.address);

        let hub = MemoryHub::new();
        let ledger = Arc::new(MemoryLedger::new());
        ledger.register_chain(
            chain_id,
            Arc::clone(&shares[0]),
            &VirtualState::origin(chain_id),
        );

        let mut pool_config = VmPoolConfig::auto();
        if config.runner.vm_threads > 0 {
            pool_config = pool_config.with_threads(config.runner.vm_threads);
        }
        let vm_pool = Arc::new(VmPool::new(pool_config)?);

        let mut nodes = Vec::with_capacity(shares.len());
        for (share, peering_id) in shares.iter().zip(&committee.nodes) {
            let registry = Arc::new(MemoryRegistry::new());
            registry.save_dk_share(Arc::clone(share));
            registry.save_committee_record(committee.clone());
            registry.save_chain_record(ChainRecord {
                chain_id,
                committee_address: committee.address,
                active: true,
            });

            let blobs = Arc::new(MemoryBlobCache::new());
            let services = RunnerServices::new(
                Arc::clone(&vm),
                blobs.clone(),
                ledger.clone(),
                Arc::clone(&vm_pool),
                tokio.clone(),
            )
            .with_status_interval(config.status_interval());
            let factory = node_factory(
                peering_id.clone(),
                Arc::clone(&hub),
                Arc::clone(&ledger),
                blobs.clone(),
                services,
                config.chain_config(),
            );
            nodes.push(DevnetNode {
                peering_id: peering_id.clone(),
                blobs,
                chains: Chains::new(registry, factory),
            });
        }

        let devnet = Self {
            chain_id,
            committee,
            hub,
            ledger,
            nodes,
        };
        for (node, member) in devnet.nodes.iter().enumerate() {
            if member.chains.activate_all() == 0 {
                return Err(DevnetError::NotStarted {
                    chain: chain_id,
                    node,
                });
            }
        }
        info!(
            chain = %chain_id,
            nodes = devnet.nodes.len(),
            threshold = config.devnet.threshold,
            "Devnet started"
        );
        Ok(devnet)
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn committee(&self) -> &CommitteeRecord {
        &self.committee
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    pub fn nodes(&self) -> &[DevnetNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&DevnetNode> {
        self.nodes.get(index)
    }

    /// Submit `request` to every running node. Returns how many accepted it
    /// into their intake.
    pub fn submit(&self, request: &Arc<Request>) -> usize {
        let mut accepted = 0;
        for node in &self.nodes {
            let Some(events) = node.chains.event_sender(&self.chain_id) else {
                continue;
            };
            let event = ChainEvent::ReceiveRequest {
                request: Arc::clone(request),
            };
            match events.send(event) {
                Ok(()) => accepted += 1,
                Err(_) => warn!(node = %node.peering_id, "Chain intake closed"),
            }
        }
        accepted
    }

    pub fn status(&self, node: usize) -> Option<Arc<ChainStatus>> {
        self.nodes.get(node)?.chains.status(&self.chain_id)
    }

    pub fn subscribe_processed(&self, node: usize) -> Option<broadcast::Receiver<RequestId>> {
        self.nodes.get(node)?.chains.subscribe_processed(&self.chain_id)
    }

    /// Stop the chain on one node, keeping its registry record inactive.
    pub fn stop_node(&self, node: usize) -> Result<(), DevnetError> {
        if let Some(member) = self.nodes.get(node) {
            member.chains.deactivate(&self.chain_id)?;
        }
        Ok(())
    }

    /// Restart a stopped node's chain from its origin state.
    pub fn restart_node(&self, node: usize) -> Result<(), DevnetError> {
        if let Some(member) = self.nodes.get(node) {
            member.chains.activate(&self.chain_id)?;
        }
        Ok(())
    }

    /// Dismiss every chain on every node.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.chains.dismiss_all();
        }
        info!(chain = %self.chain_id, "Devnet stopped");
    }
}
