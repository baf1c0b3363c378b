//! Chains hosted by a node.
//!
//! [`Chains`] owns the running [`ChainHandle`]s and keeps them in line with
//! the registry's active records. How a chain is built (committee, state,
//! ledger subscription) is left to the factory passed at construction.

use crate::ledger::LedgerError;
use crate::runner::{ChainHandle, RunnerError};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use quorumstate_chain::{ChainStatus, RegistryError, RegistryProvider};
use quorumstate_committee::CommitteeError;
use quorumstate_core::ChainEvent;
use quorumstate_types::{ChainId, ChainRecord, RequestId};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ChainsError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Committee error: {0}")]
    Committee(#[from] CommitteeError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Builds and starts one chain from its registry record.
pub type ChainFactory =
    Box<dyn Fn(&ChainRecord, &dyn RegistryProvider) -> Result<ChainHandle, ChainsError> + Send + Sync>;

pub struct Chains {
    registry: Arc<dyn RegistryProvider>,
    factory: ChainFactory,
    running: Mutex<BTreeMap<ChainId, ChainHandle>>,
    /// Held from the running check until the new handle is stored, so a
    /// chain is never built twice. Lookups only take `running`.
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for Chains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chains")
            .field("running", &self.running.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Chains {
    pub fn new(registry: Arc<dyn RegistryProvider>, factory: ChainFactory) -> Self {
        Self {
            registry,
            factory,
            running: Mutex::new(BTreeMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn RegistryProvider> {
        &self.registry
    }

    /// Start every active chain that is not already running. Chains that
    /// fail to start are logged and skipped. Returns how many started.
    pub fn activate_all(&self) -> usize {
        let _lifecycle = self.lifecycle.lock();
        let mut started = 0;
        for record in self.registry.chain_records() {
            if !record.active || self.is_running(&record.chain_id) {
                continue;
            }
            match self.start(&record) {
                Ok(()) => started += 1,
                Err(e) => warn!(chain = %record.chain_id, error = %e, "Failed to start chain"),
            }
        }
        info!(started, "Chains activated");
        started
    }

    /// Mark the chain active and start it. Already running is not an error.
    pub fn activate(&self, chain_id: &ChainId) -> Result<(), ChainsError> {
        let record = self.registry.activate_chain_record(chain_id)?;
        let _lifecycle = self.lifecycle.lock();
        if self.is_running(chain_id) {
            return Ok(());
        }
        self.start(&record)
    }

    /// Mark the chain inactive and dismiss it if running.
    pub fn deactivate(&self, chain_id: &ChainId) -> Result<(), ChainsError> {
        self.registry.deactivate_chain_record(chain_id)?;
        let handle = {
            let _lifecycle = self.lifecycle.lock();
            self.running.lock().remove(chain_id)
        };
        if let Some(handle) = handle {
            handle.dismiss()?;
            info!(chain = %chain_id, "Chain deactivated");
        }
        Ok(())
    }

    /// Caller holds `lifecycle`.
    fn start(&self, record: &ChainRecord) -> Result<(), ChainsError> {
        let handle = (self.factory)(record, self.registry.as_ref())?;
        self.running.lock().insert(record.chain_id, handle);
        Ok(())
    }

    pub fn is_running(&self, chain_id: &ChainId) -> bool {
        self.running.lock().contains_key(chain_id)
    }

    /// Ids of running chains.
    pub fn running(&self) -> Vec<ChainId> {
        self.running.lock().keys().copied().collect()
    }

    pub fn status(&self, chain_id: &ChainId) -> Option<Arc<ChainStatus>> {
        self.running.lock().get(chain_id).map(ChainHandle::status)
    }

    /// Intake of a running chain, for ingress and ledger routing.
    pub fn event_sender(&self, chain_id: &ChainId) -> Option<Sender<ChainEvent>> {
        self.running.lock().get(chain_id).map(ChainHandle::event_sender)
    }

    pub fn subscribe_processed(&self, chain_id: &ChainId) -> Option<broadcast::Receiver<RequestId>> {
        self.running
            .lock()
            .get(chain_id)
            .map(ChainHandle::subscribe_processed)
    }

    /// Dismiss every running chain. Registry records are left untouched.
    pub fn dismiss_all(&self) {
        let handles = std::mem::take(&mut *self.running.lock());
        for (chain_id, handle) in handles {
            if let Err(e) = handle.dismiss() {
                warn!(chain = %chain_id, error = %e, "Chain did not stop cleanly");
            }
        }
    }
}

impl Drop for Chains {
    fn drop(&mut self) {
        self.dismiss_all();
    }
}
