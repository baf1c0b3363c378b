//! Batch execution against a round's base state.

use quorumstate_core::{BlobCache, StateView, VmError, VmOutput, VmProcessor, VmTask};
use quorumstate_types::{StateBlock, StateDelta, StateUpdate};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Execute every request of `task` in order and build the resulting block.
///
/// Each request sees the writes of the requests before it. A request the VM
/// fails on is still consumed, with an empty delta, so every member ends up
/// with the same block for the same batch.
#[instrument(skip_all, fields(state_index = task.state_index().0, requests = task.requests.len()))]
pub fn run_batch(
    vm: &dyn VmProcessor,
    blobs: &dyn BlobCache,
    task: &VmTask,
) -> Result<VmOutput, VmError> {
    let base = task.state.as_ref();
    let mut view = StateView::new(base);
    let mut updates = Vec::with_capacity(task.requests.len());

    for request in &task.requests {
        let delta = match vm.process(&view, request, blobs) {
            Ok(delta) => delta,
            Err(e) => {
                debug!(request_id = %request.id, error = %e, "Request failed");
                StateDelta::new()
            }
        };
        view.absorb(&delta.writes);
        updates.push(StateUpdate {
            request_id: request.id,
            delta,
        });
    }

    let block = StateBlock {
        index: base.index().next(),
        prev_state_hash: base.hash(),
        timestamp: task.timestamp,
        updates,
    };
    let next = base.with_block(&block)?;

    Ok(VmOutput {
        block: Arc::new(block),
        state_hash: next.hash(),
    })
}
