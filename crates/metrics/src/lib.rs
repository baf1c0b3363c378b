//! Metrics facade for quorumstate.
//!
//! Provides a [`MetricsRecorder`] trait with domain-specific methods and
//! default no-op implementations. A global recorder is installed once with
//! [`set_global_recorder`]; the free functions delegate to it and do
//! nothing when no recorder has been installed.
//!
//! ```ignore
//! quorumstate_metrics::record_round_started(state_index);
//! quorumstate_metrics::record_round_aborted("timeout");
//! ```

use std::sync::OnceLock;

// ═══════════════════════════════════════════════════════════════════════
// Trait
// ═══════════════════════════════════════════════════════════════════════

/// Domain-specific metrics recording trait.
///
/// All methods have default no-op implementations so backends only need
/// to override the metrics they care about.
#[allow(unused_variables)]
pub trait MetricsRecorder: Send + Sync + 'static {
    // ── Consensus ────────────────────────────────────────────────────

    /// A round started at the given base state index.
    fn record_round_started(&self, state_index: u32) {}

    /// A round's transaction was included.
    fn record_round_finalized(&self, state_index: u32, latency_secs: f64) {}

    /// A round was discarded.
    fn record_round_aborted(&self, reason: &str) {}

    // ── Mempool ──────────────────────────────────────────────────────

    /// Set the mempool size gauge.
    fn set_mempool_size(&self, size: usize) {}

    /// A request was admitted.
    fn record_request_admitted(&self) {}

    /// A request was rejected at admission.
    fn record_request_rejected(&self, reason: &str) {}

    // ── State manager ────────────────────────────────────────────────

    /// Set the solid state index gauge.
    fn set_state_index(&self, index: u32) {}

    /// A block was applied to the local state.
    fn record_block_applied(&self, index: u32) {}

    /// An outstanding block request was re-sent to another peer.
    fn record_block_fetch_retry(&self) {}

    /// The local state could not be reconciled with the ledger.
    fn record_fatal_state(&self) {}

    // ── Infrastructure ───────────────────────────────────────────────

    /// Set the intake channel depth gauge.
    fn set_intake_depth(&self, depth: usize) {}

    /// A peer send failed.
    fn record_send_failure(&self) {}
}

/// A metrics recorder that does nothing.
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}

// ═══════════════════════════════════════════════════════════════════════
// Global recorder
// ═══════════════════════════════════════════════════════════════════════

static RECORDER: OnceLock<Box<dyn MetricsRecorder>> = OnceLock::new();

/// Install the global recorder. Later calls are ignored.
pub fn set_global_recorder(recorder: Box<dyn MetricsRecorder>) {
    let _ = RECORDER.set(recorder);
}

fn recorder() -> &'static dyn MetricsRecorder {
    RECORDER.get().map(|r| r.as_ref()).unwrap_or(&NoopRecorder)
}

// ═══════════════════════════════════════════════════════════════════════
// Free functions
// ═══════════════════════════════════════════════════════════════════════

#[inline]
pub fn record_round_started(state_index: u32) {
    recorder().record_round_started(state_index);
}

#[inline]
pub fn record_round_finalized(state_index: u32, latency_secs: f64) {
    recorder().record_round_finalized(state_index, latency_secs);
}

#[inline]
pub fn record_round_aborted(reason: &str) {
    recorder().record_round_aborted(reason);
}

#[inline]
pub fn set_mempool_size(size: usize) {
    recorder().set_mempool_size(size);
}

#[inline]
pub fn record_request_admitted() {
    recorder().record_request_admitted();
}

#[inline]
pub fn record_request_rejected(reason: &str) {
    recorder().record_request_rejected(reason);
}

#[inline]
pub fn set_state_index(index: u32) {
    recorder().set_state_index(index);
}

#[inline]
pub fn record_block_applied(index: u32) {
    recorder().record_block_applied(index);
}

#[inline]
pub fn record_block_fetch_retry() {
    recorder().record_block_fetch_retry();
}

#[inline]
pub fn record_fatal_state() {
    recorder().record_fatal_state();
}

#[inline]
pub fn set_intake_depth(depth: usize) {
    recorder().set_intake_depth(depth);
}

#[inline]
pub fn record_send_failure() {
    recorder().record_send_failure();
}
