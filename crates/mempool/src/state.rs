//! Mempool state.

use quorumstate_core::BlobCache;
use quorumstate_metrics as metrics;
use quorumstate_types::{PeerIndex, Request, RequestError, RequestId, StateIndex, VirtualState};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Default cap on requests held in the backlog.
pub const DEFAULT_MAX_REQUESTS: usize = 10_000;

/// Default number of state indices a removed request id is remembered for.
///
/// Peers may keep re-announcing a request for a while after it was
/// consumed; the tombstone stops it from being admitted again.
pub const DEFAULT_TOMBSTONE_RETENTION: u32 = 100;

/// Mempool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MempoolConfig {
    /// Maximum requests held at once. Admission fails with
    /// [`MempoolError::Full`] beyond this.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// State indices a tombstone survives after its request was removed.
    #[serde(default = "default_tombstone_retention")]
    pub tombstone_retention: u32,
}

fn default_max_requests() -> usize {
    DEFAULT_MAX_REQUESTS
}

fn default_tombstone_retention() -> u32 {
    DEFAULT_TOMBSTONE_RETENTION
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
        }
    }
}

impl MempoolConfig {
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_tombstone_retention(mut self, retention: u32) -> Self {
        self.tombstone_retention = retention;
        self
    }
}

/// Admission failures. All of them are local: the request never enters the
/// backlog and nothing else in the chain is affected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    #[error("Mempool full ({limit} requests)")]
    Full { limit: usize },

    #[error("Malformed request: {0}")]
    Invalid(#[from] RequestError),

    #[error("Request {0} already processed")]
    AlreadyProcessed(RequestId),
}

impl MempoolError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            MempoolError::Full { .. } => "full",
            MempoolError::Invalid(_) => "invalid",
            MempoolError::AlreadyProcessed(_) => "already_processed",
        }
    }
}

/// A backlog entry: the request plus which committee peers have reported
/// it ready on their side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyListRecord {
    pub request: Arc<Request>,
    pub seen: BTreeMap<PeerIndex, bool>,
}

impl ReadyListRecord {
    fn new(request: Arc<Request>) -> Self {
        Self {
            request,
            seen: BTreeMap::new(),
        }
    }

    /// Number of peers that marked this request seen.
    pub fn seen_count(&self) -> usize {
        self.seen.values().filter(|seen| **seen).count()
    }
}

/// Mempool state.
///
/// Holds every request known for one chain until a ledger-confirmed state
/// consumes it. Ordering is by ledger arrival time and then request id, kept
/// in a `BTreeSet` so ready lists come out sorted without a per-call sort.
pub struct MempoolState {
    /// Backlog keyed by request id.
    requests: HashMap<RequestId, ReadyListRecord>,

    /// (timestamp, id) for every backlog entry; iteration order is the
    /// ready-list order.
    order: BTreeSet<(u64, RequestId)>,

    /// Removed request ids and the state index at removal.
    tombstones: HashMap<RequestId, StateIndex>,

    /// This node's position in the current committee. Admission marks the
    /// request seen by self.
    own_index: PeerIndex,

    /// Last state index the mempool was told about, used to date tombstones.
    state_index: StateIndex,

    blobs: Arc<dyn BlobCache>,

    now: Duration,

    config: MempoolConfig,
}

impl std::fmt::Debug for MempoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MempoolState")
            .field("requests", &self.requests.len())
            .field("tombstones", &self.tombstones.len())
            .field("own_index", &self.own_index)
            .field("state_index", &self.state_index)
            .finish()
    }
}

impl MempoolState {
    /// Create a new mempool with default config.
    pub fn new(own_index: PeerIndex, blobs: Arc<dyn BlobCache>) -> Self {
        Self::with_config(own_index, blobs, MempoolConfig::default())
    }

    /// Create a new mempool with custom config.
    pub fn with_config(
        own_index: PeerIndex,
        blobs: Arc<dyn BlobCache>,
        config: MempoolConfig,
    ) -> Self {
        Self {
            requests: HashMap::new(),
            order: BTreeSet::new(),
            tombstones: HashMap::new(),
            own_index,
            state_index: StateIndex::ORIGIN,
            blobs,
            now: Duration::ZERO,
            config,
        }
    }

    /// Set the current time (milliseconds since the Unix epoch in
    /// production; simulated time in the simulator).
    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Admit a request.
    ///
    /// Returns `Ok(true)` when the request is new, `Ok(false)` when it is
    /// already in the backlog or was removed recently. Requests with a future
    /// time-lock are admitted but not ready until the lock expires.
    #[instrument(skip(self, request, state), fields(request_id = %request.id))]
    pub fn receive_request(
        &mut self,
        request: Arc<Request>,
        state: &VirtualState,
    ) -> Result<bool, MempoolError> {
        let id = request.id;

        if self.requests.contains_key(&id) {
            return Ok(false);
        }
        if self.is_tombstoned(&id) {
            tracing::debug!(request_id = %id, "Ignoring tombstoned request");
            return Ok(false);
        }

        let admitted = self.admit(request, state);
        match &admitted {
            Ok(()) => {
                metrics::record_request_admitted();
                metrics::set_mempool_size(self.requests.len());
            }
            Err(e) => {
                metrics::record_request_rejected(e.reason());
                tracing::debug!(request_id = %id, error = %e, "Request rejected");
            }
        }
        admitted.map(|()| true)
    }

    fn admit(&mut self, request: Arc<Request>, state: &VirtualState) -> Result<(), MempoolError> {
        request.validate()?;
        if state.is_request_processed(&request.id) {
            self.tombstones.insert(request.id, state.index());
            return Err(MempoolError::AlreadyProcessed(request.id));
        }
        if self.requests.len() >= self.config.max_requests {
            return Err(MempoolError::Full {
                limit: self.config.max_requests,
            });
        }

        let id = request.id;
        let mut record = ReadyListRecord::new(request);
        record.seen.insert(self.own_index, true);
        self.order.insert((record.request.timestamp, id));
        self.requests.insert(id, record);
        Ok(())
    }

    /// Record that `peer` reported `id` ready. Unknown or removed ids are
    /// ignored.
    pub fn mark_seen_by_committee_peer(&mut self, id: &RequestId, peer: PeerIndex) {
        if let Some(record) = self.requests.get_mut(id) {
            record.seen.insert(peer, true);
        }
    }

    /// Forget every seen mark except self's.
    pub fn clear_seen_marks(&mut self) {
        let own = self.own_index;
        for record in self.requests.values_mut() {
            record.seen.clear();
            record.seen.insert(own, true);
        }
    }

    /// Switch to a new committee position. Seen marks from the old
    /// committee are dropped.
    pub fn set_own_peer_index(&mut self, own_index: PeerIndex) {
        self.own_index = own_index;
        self.clear_seen_marks();
    }

    fn is_solid(&self, request: &Request) -> bool {
        request.blob_refs().all(|hash| self.blobs.has_blob(hash))
    }

    fn is_ready(&self, record: &ReadyListRecord, seen_threshold: u16, now_ms: u64) -> bool {
        !record.request.is_time_locked(now_ms)
            && record.seen_count() >= seen_threshold as usize
            && self.is_solid(&record.request)
    }

    /// Requests that are time-unlocked, solid and seen by at least
    /// `seen_threshold` peers, in arrival order (ties by id).
    pub fn get_ready_list(&self, seen_threshold: u16) -> Vec<Arc<Request>> {
        self.get_ready_list_full(seen_threshold)
            .into_iter()
            .map(|record| Arc::clone(&record.request))
            .collect()
    }

    /// Same as [`get_ready_list`](Self::get_ready_list), with seen marks.
    pub fn get_ready_list_full(&self, seen_threshold: u16) -> Vec<&ReadyListRecord> {
        let now_ms = self.now_ms();
        self.order
            .iter()
            .filter_map(|(_, id)| self.requests.get(id))
            .filter(|record| self.is_ready(record, seen_threshold, now_ms))
            .collect()
    }

    /// Resolve a proposed batch against the local backlog.
    ///
    /// Every id must be present, time-unlocked and solid here. Returns the
    /// requests in the given order, or the first id that fails.
    pub fn ready_batch(&self, ids: &[RequestId]) -> Result<Vec<Arc<Request>>, RequestId> {
        let now_ms = self.now_ms();
        ids.iter()
            .map(|id| {
                self.requests
                    .get(id)
                    .filter(|record| self.is_ready(record, 1, now_ms))
                    .map(|record| Arc::clone(&record.request))
                    .ok_or(*id)
            })
            .collect()
    }

    /// Drop requests consumed by a ledger-confirmed state. Removing an id
    /// that is not present is a no-op; every id is tombstoned either way.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn remove_requests(&mut self, ids: &[RequestId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(record) = self.requests.remove(id) {
                self.order.remove(&(record.request.timestamp, *id));
                removed += 1;
            }
            self.tombstones.insert(*id, self.state_index);
        }
        if removed > 0 {
            tracing::debug!(removed, remaining = self.requests.len(), "Removed requests");
            metrics::set_mempool_size(self.requests.len());
        }
        removed
    }

    /// Advance the mempool's notion of the chain state and prune tombstones
    /// older than the retention window.
    pub fn on_state_index(&mut self, index: StateIndex) -> usize {
        if index > self.state_index {
            self.state_index = index;
        }
        self.cleanup_old_tombstones(self.state_index, self.config.tombstone_retention)
    }

    /// Remove tombstones created more than `retention` indices before
    /// `current`. Returns the number cleaned up.
    pub fn cleanup_old_tombstones(&mut self, current: StateIndex, retention: u32) -> usize {
        let cutoff = current.0.saturating_sub(retention);
        let before = self.tombstones.len();
        self.tombstones.retain(|_, index| index.0 >= cutoff);
        before - self.tombstones.len()
    }

    pub fn is_tombstoned(&self, id: &RequestId) -> bool {
        self.tombstones.contains_key(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Whether `id` is in the backlog (admitted and not yet removed).
    pub fn is_in_backlog(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn get_request(&self, id: &RequestId) -> Option<Arc<Request>> {
        self.requests.get(id).map(|r| Arc::clone(&r.request))
    }

    pub fn get_record(&self, id: &RequestId) -> Option<&ReadyListRecord> {
        self.requests.get(id)
    }

    /// Backlog ids in ready-list order, regardless of readiness.
    pub fn backlog_ids(&self) -> Vec<RequestId> {
        self.order.iter().map(|(_, id)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
