//! Virtual state, state blocks and ledger-anchored state outputs.
//!
//! The chain's replicated key/value state advances one [`StateBlock`] at a
//! time. A block carries one [`StateUpdate`] per processed request and links
//! to the state it was built on through `prev_state_hash`. Applying a block
//! also writes a receipt for every request it consumed, so a request id can
//! never be processed twice in the chain's history.

use crate::{ChainId, Hash, RequestId, StateIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Key prefix reserved for request receipts.
const RECEIPT_PREFIX: &[u8] = b"\xffreceipt/";

/// Errors applying a block to a virtual state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Block index {got} does not follow state index {current}")]
    NonContiguous { current: StateIndex, got: StateIndex },

    #[error("Block at {index} links to {expected_prev:?}, local state is {actual:?}")]
    PrevHashMismatch {
        index: StateIndex,
        expected_prev: Hash,
        actual: Hash,
    },

    #[error("Request {0} already processed")]
    AlreadyProcessed(RequestId),

    #[error("Request {0} appears twice in one block")]
    DuplicateInBlock(RequestId),

    #[error("Update for {0} writes a reserved key")]
    ReservedKey(RequestId),

    #[error("Block assembled from {got} updates, header declares {expected}")]
    SizeMismatch { expected: u16, got: usize },

    #[error("Block essence {got:?} does not match header {expected:?}")]
    EssenceMismatch { expected: Hash, got: Hash },
}

/// Key/value mutations produced by executing one request.
///
/// `None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StateDelta {
    pub writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.writes.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.writes.insert(key.into(), None);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn feed(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.writes.len() as u64).to_le_bytes());
        for (key, value) in &self.writes {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key);
            match value {
                Some(v) => {
                    hasher.update(&[1]);
                    hasher.update(&(v.len() as u64).to_le_bytes());
                    hasher.update(v);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
    }
}

/// The effect of one request on the state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateUpdate {
    pub request_id: RequestId,
    pub delta: StateDelta,
}

impl StateUpdate {
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.request_id.to_bytes());
        self.delta.feed(&mut hasher);
        Hash::from_raw(*hasher.finalize().as_bytes())
    }
}

/// Header of a block as exchanged during sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: StateIndex,
    pub size: u16,
    pub prev_state_hash: Hash,
    pub timestamp: u64,
    pub essence_hash: Hash,
}

/// A state transition: the ordered updates that move state `index - 1` to
/// state `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBlock {
    pub index: StateIndex,
    pub prev_state_hash: Hash,
    pub timestamp: u64,
    pub updates: Vec<StateUpdate>,
}

impl StateBlock {
    /// Hash committing to every field of the block.
    pub fn essence_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"STATE_BLOCK");
        hasher.update(&self.index.0.to_le_bytes());
        hasher.update(self.prev_state_hash.as_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&(self.updates.len() as u64).to_le_bytes());
        for update in &self.updates {
            hasher.update(update.hash().as_bytes());
        }
        Hash::from_raw(*hasher.finalize().as_bytes())
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            index: self.index,
            size: self.updates.len() as u16,
            prev_state_hash: self.prev_state_hash,
            timestamp: self.timestamp,
            essence_hash: self.essence_hash(),
        }
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.updates.iter().map(|u| u.request_id).collect()
    }

    /// Rebuild a block from a header and its updates in position order,
    /// checking the result against the header's essence hash.
    pub fn from_parts(header: &BlockHeader, updates: Vec<StateUpdate>) -> Result<Self, StateError> {
        if updates.len() != header.size as usize {
            return Err(StateError::SizeMismatch {
                expected: header.size,
                got: updates.len(),
            });
        }
        let block = Self {
            index: header.index,
            prev_state_hash: header.prev_state_hash,
            timestamp: header.timestamp,
            updates,
        };
        let got = block.essence_hash();
        if got != header.essence_hash {
            return Err(StateError::EssenceMismatch {
                expected: header.essence_hash,
                got,
            });
        }
        Ok(block)
    }
}

/// The anchored state as reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateOutput {
    /// Id of the transaction that produced this output.
    pub output_id: Hash,
    pub index: StateIndex,
    pub state_hash: Hash,
    pub timestamp: u64,
}

/// Versioned snapshot of a chain's key/value state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualState {
    chain_id: ChainId,
    index: StateIndex,
    block_hash: Hash,
    timestamp: u64,
    kv: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl VirtualState {
    /// The empty state every chain starts from.
    pub fn origin(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            index: StateIndex::ORIGIN,
            block_hash: Hash::ZERO,
            timestamp: 0,
            kv: BTreeMap::new(),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn index(&self) -> StateIndex {
        self.index
    }

    /// Essence hash of the block that produced this state.
    pub fn block_hash(&self) -> Hash {
        self.block_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.kv.get(key).map(Vec::as_slice)
    }

    /// Iterate user keys (receipts excluded).
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.kv
            .iter()
            .filter(|(k, _)| !k.starts_with(RECEIPT_PREFIX))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn is_request_processed(&self, id: &RequestId) -> bool {
        self.kv.contains_key(&receipt_key(id))
    }

    /// Commitment to the complete state, including receipts.
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"VIRTUAL_STATE");
        hasher.update(self.chain_id.as_bytes());
        hasher.update(&self.index.0.to_le_bytes());
        hasher.update(self.block_hash.as_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&(self.kv.len() as u64).to_le_bytes());
        for (key, value) in &self.kv {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
        Hash::from_raw(*hasher.finalize().as_bytes())
    }

    /// Apply `block` in place. On error the state is left unchanged.
    pub fn apply_block(&mut self, block: &StateBlock) -> Result<(), StateError> {
        if block.index != self.index.next() {
            return Err(StateError::NonContiguous {
                current: self.index,
                got: block.index,
            });
        }
        let actual = self.hash();
        if block.prev_state_hash != actual {
            return Err(StateError::PrevHashMismatch {
                index: block.index,
                expected_prev: block.prev_state_hash,
                actual,
            });
        }

        let mut in_block = BTreeSet::new();
        for update in &block.updates {
            if !in_block.insert(update.request_id) {
                return Err(StateError::DuplicateInBlock(update.request_id));
            }
            if self.is_request_processed(&update.request_id) {
                return Err(StateError::AlreadyProcessed(update.request_id));
            }
            if update
                .delta
                .writes
                .keys()
                .any(|k| k.starts_with(RECEIPT_PREFIX))
            {
                return Err(StateError::ReservedKey(update.request_id));
            }
        }

        for update in &block.updates {
            for (key, value) in &update.delta.writes {
                match value {
                    Some(v) => {
                        self.kv.insert(key.clone(), v.clone());
                    }
                    None => {
                        self.kv.remove(key);
                    }
                }
            }
            self.kv
                .insert(receipt_key(&update.request_id), block.index.0.to_le_bytes().to_vec());
        }

        self.index = block.index;
        self.block_hash = block.essence_hash();
        self.timestamp = block.timestamp;
        Ok(())
    }

    /// Apply `block` to a copy, leaving `self` untouched.
    pub fn with_block(&self, block: &StateBlock) -> Result<Self, StateError> {
        let mut next = self.clone();
        next.apply_block(block)?;
        Ok(next)
    }
}

fn receipt_key(id: &RequestId) -> Vec<u8> {
    let mut key = RECEIPT_PREFIX.to_vec();
    key.extend_from_slice(&id.to_bytes());
    key
}
