//! Registry of chains, committees and key shares.
//!
//! All methods take `&self`; implementations use interior mutability.

use parking_lot::RwLock;
use quorumstate_types::{ChainId, ChainRecord, CommitteeRecord, DkShare, Hash};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown chain {0}")]
    UnknownChain(ChainId),

    #[error("Unknown committee {0:?}")]
    UnknownCommittee(Hash),

    #[error("No key share for committee {0:?}")]
    MissingDkShare(Hash),
}

/// Lookup of this node's key share for a committee address.
pub trait DkShareProvider: Send + Sync {
    fn load_dk_share(&self, address: &Hash) -> Result<Arc<DkShare>, RegistryError>;
}

/// Persistent chain and committee records.
pub trait RegistryProvider: DkShareProvider {
    /// Insert or replace a chain record.
    fn save_chain_record(&self, record: ChainRecord);

    fn get_chain_record(&self, chain_id: &ChainId) -> Option<ChainRecord>;

    /// Mark a chain active. Returns the updated record.
    fn activate_chain_record(&self, chain_id: &ChainId) -> Result<ChainRecord, RegistryError>;

    /// Mark a chain inactive. Returns the updated record.
    fn deactivate_chain_record(&self, chain_id: &ChainId) -> Result<ChainRecord, RegistryError>;

    /// Every chain record, ordered by chain id.
    fn chain_records(&self) -> Vec<ChainRecord>;

    fn get_committee_record(&self, address: &Hash) -> Option<CommitteeRecord>;

    fn save_committee_record(&self, record: CommitteeRecord);
}

/// In-memory registry for tests, simulation and single-process nodes.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    chains: RwLock<BTreeMap<ChainId, ChainRecord>>,
    committees: RwLock<BTreeMap<Hash, CommitteeRecord>>,
    dk_shares: RwLock<BTreeMap<Hash, Arc<DkShare>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store this node's key share, keyed by its committee address.
    pub fn save_dk_share(&self, share: Arc<DkShare>) {
        self.dk_shares.write().insert(share.address(), share);
    }

    fn set_active(&self, chain_id: &ChainId, active: bool) -> Result<ChainRecord, RegistryError> {
        let mut chains = self.chains.write();
        let record = chains
            .get_mut(chain_id)
            .ok_or(RegistryError::UnknownChain(*chain_id))?;
        record.active = active;
        Ok(record.clone())
    }
}

impl DkShareProvider for MemoryRegistry {
    fn load_dk_share(&self, address: &Hash) -> Result<Arc<DkShare>, RegistryError> {
        self.dk_shares
            .read()
            .get(address)
            .cloned()
            .ok_or(RegistryError::MissingDkShare(*address))
    }
}

impl RegistryProvider for MemoryRegistry {
    fn save_chain_record(&self, record: ChainRecord) {
        self.chains.write().insert(record.chain_id, record);
    }

    fn get_chain_record(&self, chain_id: &ChainId) -> Option<ChainRecord> {
        self.chains.read().get(chain_id).cloned()
    }

    fn activate_chain_record(&self, chain_id: &ChainId) -> Result<ChainRecord, RegistryError> {
        self.set_active(chain_id, true)
    }

    fn deactivate_chain_record(&self, chain_id: &ChainId) -> Result<ChainRecord, RegistryError> {
        self.set_active(chain_id, false)
    }

    fn chain_records(&self) -> Vec<ChainRecord> {
        self.chains.read().values().cloned().collect()
    }

    fn get_committee_record(&self, address: &Hash) -> Option<CommitteeRecord> {
        self.committees.read().get(address).cloned()
    }

    fn save_committee_record(&self, record: CommitteeRecord) {
        self.committees.write().insert(record.address, record);
    }
}
