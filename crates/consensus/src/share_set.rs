//! Signature share collection for one round.
//!
//! Shares over our own result hash are verified on receipt and kept for
//! aggregation. Shares claiming a different result hash cannot be verified
//! (we do not know the message they sign); they are only counted, by
//! distinct signer, to detect that our result can no longer reach the
//! threshold.

use quorumstate_types::{AggregateSignature, CryptoError, DkShare, Hash, PeerIndex, SignatureShare};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What happened to a share offered to the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Verified and counted toward our hash.
    Added,
    /// Already have a share from this signer.
    Duplicate,
    /// Over a different result hash; counted toward divergence only.
    Foreign,
    /// Failed verification.
    Invalid(CryptoError),
}

/// Shares for one round's result.
#[derive(Debug, Clone)]
pub struct ShareSet {
    essence_hash: Hash,
    message: Vec<u8>,
    threshold: u16,
    size: u16,
    shares: BTreeMap<PeerIndex, SignatureShare>,
    foreign: HashMap<Hash, BTreeSet<PeerIndex>>,
}

impl ShareSet {
    /// Create a set for the result with `essence_hash`, whose shares sign
    /// `message`.
    pub fn new(essence_hash: Hash, message: Vec<u8>, threshold: u16, size: u16) -> Self {
        Self {
            essence_hash,
            message,
            threshold,
            size,
            shares: BTreeMap::new(),
            foreign: HashMap::new(),
        }
    }

    pub fn essence_hash(&self) -> Hash {
        self.essence_hash
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Number of verified shares over our hash.
    pub fn count(&self) -> usize {
        self.shares.len()
    }

    pub fn has_signer(&self, peer: PeerIndex) -> bool {
        self.shares.contains_key(&peer)
    }

    /// Offer a share over `essence_hash`.
    pub fn add(
        &mut self,
        dk_share: &DkShare,
        essence_hash: Hash,
        share: SignatureShare,
    ) -> ShareOutcome {
        if share.signer.0 >= self.size {
            return ShareOutcome::Invalid(CryptoError::UnknownPeer(share.signer));
        }
        if essence_hash != self.essence_hash {
            self.foreign
                .entry(essence_hash)
                .or_default()
                .insert(share.signer);
            return ShareOutcome::Foreign;
        }
        if self.shares.contains_key(&share.signer) {
            return ShareOutcome::Duplicate;
        }
        if let Err(e) = dk_share.verify_share(&self.message, &share) {
            return ShareOutcome::Invalid(e);
        }
        self.shares.insert(share.signer, share);
        ShareOutcome::Added
    }

    /// Whether enough verified shares agree on our hash.
    pub fn has_threshold(&self) -> bool {
        self.shares.len() >= self.threshold as usize
    }

    /// True once our hash can no longer collect a threshold: either another
    /// hash already has one, or too many peers signed something else.
    pub fn diverged(&self) -> bool {
        if self
            .foreign
            .values()
            .any(|signers| signers.len() >= self.threshold as usize)
        {
            return true;
        }
        let elsewhere: BTreeSet<PeerIndex> = self
            .foreign
            .values()
            .flatten()
            .filter(|peer| !self.shares.contains_key(peer))
            .copied()
            .collect();
        (self.size as usize).saturating_sub(elsewhere.len()) < self.threshold as usize
    }

    /// Aggregate the verified shares.
    pub fn aggregate(&self, dk_share: &DkShare) -> Result<AggregateSignature, CryptoError> {
        let shares: Vec<SignatureShare> = self.shares.values().cloned().collect();
        dk_share.aggregate(&self.message, &shares)
    }
}
