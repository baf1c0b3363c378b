//! Types for delegated batch execution.

use quorumstate_types::{
    ChainId, Hash, Request, StateBlock, StateError, StateIndex, VirtualState,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Work handed to the VM pool for one agreed batch.
#[derive(Debug, Clone)]
pub struct VmTask {
    pub chain_id: ChainId,
    pub batch_hash: Hash,
    /// Immutable view of the round's base state.
    pub state: Arc<VirtualState>,
    /// Batch requests in agreed order.
    pub requests: Vec<Arc<Request>>,
    /// Timestamp the produced block carries.
    pub timestamp: u64,
}

impl VmTask {
    pub fn state_index(&self) -> StateIndex {
        self.state.index()
    }
}

/// Outcome of executing a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOutput {
    pub block: Arc<StateBlock>,
    /// Hash of the state after applying `block`.
    pub state_hash: Hash,
}

/// Errors from batch execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("Request execution failed: {0}")]
    Execution(String),

    #[error("Missing blob {0:?}")]
    MissingBlob(Hash),

    #[error("Produced block does not apply: {0}")]
    InvalidBlock(#[from] StateError),
}

/// Read view over a base state plus the writes of requests already executed
/// earlier in the same batch.
pub struct StateView<'a> {
    base: &'a VirtualState,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> StateView<'a> {
    pub fn new(base: &'a VirtualState) -> Self {
        Self {
            base,
            overlay: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> &VirtualState {
        self.base
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.overlay.get(key) {
            Some(Some(value)) => Some(value.as_slice()),
            Some(None) => None,
            None => self.base.get(key),
        }
    }

    /// Layer a delta on top of the view.
    pub fn absorb(&mut self, writes: &BTreeMap<Vec<u8>, Option<Vec<u8>>>) {
        for (key, value) in writes {
            self.overlay.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumstate_types::{RequestId, StateDelta, StateUpdate};

    #[test]
    fn test_view_overlays_base() {
        let chain = ChainId::from_address(&Hash::from_bytes(b"c"));
        let mut base = VirtualState::origin(chain);
        let mut delta = StateDelta::new();
        delta.set(b"a".to_vec(), b"1".to_vec());
        delta.set(b"b".to_vec(), b"2".to_vec());
        let block = StateBlock {
            index: StateIndex(1),
            prev_state_hash: base.hash(),
            timestamp: 1,
            updates: vec![StateUpdate {
                request_id: RequestId::new(Hash::from_bytes(b"r"), 0),
                delta,
            }],
        };
        base.apply_block(&block).unwrap();

        let mut view = StateView::new(&base);
        let mut next = StateDelta::new();
        next.set(b"a".to_vec(), b"9".to_vec());
        next.delete(b"b".to_vec());
        view.absorb(&next.writes);

        assert_eq!(view.get(b"a"), Some(&b"9"[..]));
        assert_eq!(view.get(b"b"), None);
        assert_eq!(base.get(b"b"), Some(&b"2"[..]));
    }
}
