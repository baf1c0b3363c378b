//! Test helpers for quorumstate - deterministic committees, a recording fake
//! committee, a toy VM and request/block fixtures.
//!
//! Key shares are real BLS shares dealt from a seed, so tests exercise the
//! actual signing and aggregation paths.
//!
//! # Example
//!
//! ```rust
//! use quorumstate_test_helpers::TestCommittee;
//!
//! let committee = TestCommittee::new(4, 3, 42);
//! let msg = b"result";
//! let shares: Vec<_> = (0..3).map(|i| committee.share(i).sign_share(msg)).collect();
//! let aggregate = committee.share(0).aggregate(msg, &shares).unwrap();
//! assert!(committee.share(3).verify_aggregate(msg, &aggregate).is_ok());
//! ```

pub mod byzantine;
mod fake_committee;
pub mod fixtures;

pub use fake_committee::FakeCommittee;

use quorumstate_types::{deal_shares, ChainId, CommitteeRecord, DkShare, Hash};
use std::sync::Arc;

/// A committee with deterministically dealt key shares.
pub struct TestCommittee {
    shares: Vec<Arc<DkShare>>,
    record: CommitteeRecord,
}

impl std::fmt::Debug for TestCommittee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCommittee")
            .field("size", &self.shares.len())
            .field("address", &self.record.address)
            .finish()
    }
}

impl TestCommittee {
    /// Deal `size` shares with `threshold` from `seed`.
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is zero or exceeds `size`.
    pub fn new(size: u16, threshold: u16, seed: u64) -> Self {
        let mut seed_bytes = [0u8; 32];
        seed_bytes[..8].copy_from_slice(&seed.to_le_bytes());
        seed_bytes[8..10].copy_from_slice(&size.to_le_bytes());
        seed_bytes[10..12].copy_from_slice(&threshold.to_le_bytes());

        let shares: Vec<Arc<DkShare>> = deal_shares(size, threshold, &seed_bytes)
            .expect("valid committee parameters")
            .into_iter()
            .map(Arc::new)
            .collect();
        let record = CommitteeRecord {
            address: shares[0].address(),
            nodes: (0..size).map(|i| format!("peer-{seed}-{i}")).collect(),
        };
        Self { shares, record }
    }

    pub fn size(&self) -> u16 {
        self.shares.len() as u16
    }

    pub fn threshold(&self) -> u16 {
        self.shares[0].threshold()
    }

    pub fn address(&self) -> Hash {
        self.record.address
    }

    /// Chain id of a chain controlled by this committee.
    pub fn chain_id(&self) -> ChainId {
        ChainId::from_address(&self.record.address)
    }

    pub fn record(&self) -> &CommitteeRecord {
        &self.record
    }

    /// Key share of member `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= size()`.
    pub fn share(&self, idx: usize) -> &Arc<DkShare> {
        &self.shares[idx]
    }

    pub fn shares(&self) -> &[Arc<DkShare>] {
        &self.shares
    }

    /// A recording fake committee as seen by member `idx`, with every peer
    /// connected.
    pub fn fake(&self, idx: usize) -> Arc<FakeCommittee> {
        Arc::new(FakeCommittee::new(Arc::clone(&self.shares[idx])))
    }
}
