//! Request, block and VM fixtures.

use quorumstate_core::{BlobCache, StateView, VmError, VmProcessor};
use quorumstate_types::{
    ArgValue, ChainId, Hash, Request, RequestId, StateBlock, StateDelta, StateIndex, StateOutput,
    StateUpdate, VirtualState,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Request id derived from a test tag.
pub fn request_id(tag: u64) -> RequestId {
    RequestId::new(Hash::from_parts(&[b"REQ".as_slice(), &tag.to_le_bytes()[..]]), 0)
}

/// A `counter.inc` request with the given ledger timestamp.
pub fn make_request(tag: u64, timestamp: u64) -> Arc<Request> {
    Arc::new(Request {
        id: request_id(tag),
        timestamp,
        target_contract: "counter".into(),
        entry_point: "inc".into(),
        args: BTreeMap::new(),
        time_lock: None,
        transfer: None,
    })
}

/// A `store.set` request writing each `(key, value)` pair.
pub fn make_set_request(tag: u64, timestamp: u64, pairs: &[(&str, &[u8])]) -> Arc<Request> {
    let args = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), ArgValue::Inline(v.to_vec())))
        .collect();
    Arc::new(Request {
        id: request_id(tag),
        timestamp,
        target_contract: "store".into(),
        entry_point: "set".into(),
        args,
        time_lock: None,
        transfer: None,
    })
}

/// A request the [`CounterVm`] fails on.
pub fn make_failing_request(tag: u64, timestamp: u64) -> Arc<Request> {
    let mut request = (*make_request(tag, timestamp)).clone();
    request.entry_point = "fail".into();
    Arc::new(request)
}

/// A minimal deterministic VM.
///
/// - `inc` bumps a little-endian `u64` counter stored under `counter/<contract>`
/// - `set` writes every inline argument under `<contract>/<arg name>`; blob
///   arguments store the blob's length
/// - `fail` returns an execution error
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterVm;

impl CounterVm {
    pub fn counter_key(contract: &str) -> Vec<u8> {
        format!("counter/{contract}").into_bytes()
    }

    /// Read a counter from a state.
    pub fn counter(state: &VirtualState, contract: &str) -> u64 {
        state
            .get(&Self::counter_key(contract))
            .and_then(|v| v.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0)
    }
}

impl VmProcessor for CounterVm {
    fn process(
        &self,
        view: &StateView<'_>,
        request: &Request,
        blobs: &dyn BlobCache,
    ) -> Result<StateDelta, VmError> {
        let mut delta = StateDelta::new();
        match request.entry_point.as_str() {
            "inc" => {
                let key = Self::counter_key(&request.target_contract);
                let current = view
                    .get(&key)
                    .and_then(|v| v.try_into().ok())
                    .map(u64::from_le_bytes)
                    .unwrap_or(0);
                delta.set(key, (current + 1).to_le_bytes().to_vec());
            }
            "set" => {
                for (name, arg) in &request.args {
                    let key = format!("{}/{}", request.target_contract, name).into_bytes();
                    match arg {
                        ArgValue::Inline(value) => delta.set(key, value.clone()),
                        ArgValue::Blob(hash) => {
                            let blob = blobs.get_blob(hash).ok_or(VmError::MissingBlob(*hash))?;
                            delta.set(key, (blob.len() as u64).to_le_bytes().to_vec());
                        }
                    }
                }
            }
            other => return Err(VmError::Execution(format!("unknown entry point {other}"))),
        }
        Ok(delta)
    }
}

/// Ledger output anchoring `state`.
pub fn output_for(state: &VirtualState) -> StateOutput {
    StateOutput {
        output_id: Hash::from_parts(&[
            b"OUTPUT".as_slice(),
            &state.index().0.to_le_bytes()[..],
            state.hash().as_bytes(),
        ]),
        index: state.index(),
        state_hash: state.hash(),
        timestamp: state.timestamp(),
    }
}

/// Origin state of a test chain.
pub fn origin(chain_id: ChainId) -> Arc<VirtualState> {
    Arc::new(VirtualState::origin(chain_id))
}

/// Extend `base` by `count` blocks of one update each.
///
/// Returns each block with the state it produces.
pub fn extend_chain(
    base: &VirtualState,
    count: u32,
) -> Vec<(Arc<StateBlock>, Arc<VirtualState>)> {
    let mut out = Vec::with_capacity(count as usize);
    let mut state = base.clone();
    for _ in 0..count {
        let index = state.index().next();
        let mut delta = StateDelta::new();
        delta.set(format!("key/{}", index.0), index.0.to_le_bytes().to_vec());
        let block = StateBlock {
            index,
            prev_state_hash: state.hash(),
            timestamp: 1_000 * index.0 as u64,
            updates: vec![StateUpdate {
                request_id: request_id(10_000 + index.0 as u64),
                delta,
            }],
        };
        state = state.with_block(&block).expect("fixture block applies");
        out.push((Arc::new(block), Arc::new(state.clone())));
    }
    out
}

/// State at `index` built from `extend_chain` on the origin.
pub fn state_at(chain_id: ChainId, index: StateIndex) -> Arc<VirtualState> {
    extend_chain(&VirtualState::origin(chain_id), index.0)
        .pop()
        .map(|(_, state)| state)
        .unwrap_or_else(|| origin(chain_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumstate_core::MemoryBlobCache;

    #[test]
    fn test_counter_vm() {
        let chain = ChainId::from_address(&Hash::from_bytes(b"c"));
        let state = VirtualState::origin(chain);
        let mut view = StateView::new(&state);
        let blobs = MemoryBlobCache::new();

        let delta = CounterVm
            .process(&view, &make_request(1, 1), &blobs)
            .unwrap();
        view.absorb(&delta.writes);
        let delta = CounterVm
            .process(&view, &make_request(2, 2), &blobs)
            .unwrap();
        assert_eq!(
            delta.writes[&CounterVm::counter_key("counter")],
            Some(2u64.to_le_bytes().to_vec())
        );

        assert!(CounterVm
            .process(&view, &make_failing_request(3, 3), &blobs)
            .is_err());
    }

    #[test]
    fn test_extend_chain_links_blocks() {
        let chain = ChainId::from_address(&Hash::from_bytes(b"c"));
        let blocks = extend_chain(&VirtualState::origin(chain), 3);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].0.prev_state_hash, blocks[0].1.hash());
        assert_eq!(state_at(chain, StateIndex(3)).hash(), blocks[2].1.hash());
    }
}
