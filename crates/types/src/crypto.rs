//! Committee key shares and BLS12-381 signature aggregation.
//!
//! A [`DkShare`] is the per-node output of distributed key generation: the
//! node's private signing share, the public share of every committee member
//! and the signing threshold. Each member signs the round's result hash with
//! its private share; any `threshold` valid shares over the same message
//! aggregate into one [`AggregateSignature`] that verifies against the
//! aggregated public shares of the signers named in its bitfield.
//!
//! Key generation itself happens outside this crate. [`deal_shares`] is a
//! trusted-dealer stand-in used by simulations and local development.

use crate::{Hash, PeerIndex, SignerBitfield};
use blst::min_pk::{
    AggregatePublicKey, AggregateSignature as BlsAggregateSignature, PublicKey, SecretKey,
    Signature,
};
use blst::BLST_ERROR;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Size of a compressed BLS12-381 G2 signature.
pub const SIGNATURE_BYTES: usize = 96;

/// Size of a compressed BLS12-381 G1 public key.
pub const PUBLIC_KEY_BYTES: usize = 48;

/// Errors from share signing, verification and aggregation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Threshold {threshold} invalid for committee of {size}")]
    InvalidThreshold { threshold: u16, size: u16 },

    #[error("Peer index {0} outside committee")]
    UnknownPeer(PeerIndex),

    #[error("Private share does not match public share at {0}")]
    ShareMismatch(PeerIndex),

    #[error("Malformed key material")]
    MalformedKey,

    #[error("Malformed signature")]
    MalformedSignature,

    #[error("Invalid signature share from {0}")]
    InvalidShare(PeerIndex),

    #[error("Duplicate signature share from {0}")]
    DuplicateShare(PeerIndex),

    #[error("Not enough shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("Aggregation failed")]
    AggregationFailed,

    #[error("Aggregate signature does not verify")]
    InvalidAggregate,
}

/// One committee member's signature over a message.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureShare {
    pub signer: PeerIndex,
    pub signature: Vec<u8>,
}

impl fmt::Debug for SignatureShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.signature);
        write!(
            f,
            "SignatureShare({}, {}..)",
            self.signer,
            &hex[..hex.len().min(16)]
        )
    }
}

/// Aggregate of at least `threshold` shares plus the set of contributors.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateSignature {
    pub signers: SignerBitfield,
    pub signature: Vec<u8>,
}

impl fmt::Debug for AggregateSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.signature);
        write!(
            f,
            "AggregateSignature(signers={}, {}..)",
            self.signers.count(),
            &hex[..hex.len().min(16)]
        )
    }
}

/// This node's share of the committee key.
#[derive(Clone)]
pub struct DkShare {
    address: Hash,
    index: PeerIndex,
    threshold: u16,
    public_shares: Vec<PublicKey>,
    private_share: SecretKey,
}

impl DkShare {
    /// Assemble a share, validating threshold bounds and that the private
    /// share matches the published public share at `index`.
    pub fn new(
        index: PeerIndex,
        threshold: u16,
        public_shares: Vec<[u8; PUBLIC_KEY_BYTES]>,
        private_share: SecretKey,
    ) -> Result<Self, CryptoError> {
        let size = public_shares.len() as u16;
        if threshold == 0 || threshold > size {
            return Err(CryptoError::InvalidThreshold { threshold, size });
        }
        if index.0 >= size {
            return Err(CryptoError::UnknownPeer(index));
        }

        let public_shares = public_shares
            .iter()
            .map(|bytes| PublicKey::from_bytes(bytes).map_err(|_| CryptoError::MalformedKey))
            .collect::<Result<Vec<_>, _>>()?;

        if private_share.sk_to_pk() != public_shares[index.as_usize()] {
            return Err(CryptoError::ShareMismatch(index));
        }

        let address = committee_address(threshold, &public_shares);
        Ok(Self {
            address,
            index,
            threshold,
            public_shares,
            private_share,
        })
    }

    /// Control address of the committee: a commitment to its public shares.
    pub fn address(&self) -> Hash {
        self.address
    }

    pub fn index(&self) -> PeerIndex {
        self.index
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn size(&self) -> u16 {
        self.public_shares.len() as u16
    }

    pub fn public_share(&self, peer: PeerIndex) -> Option<[u8; PUBLIC_KEY_BYTES]> {
        self.public_shares.get(peer.as_usize()).map(|pk| pk.to_bytes())
    }

    /// Sign `message` with this node's private share.
    pub fn sign_share(&self, message: &[u8]) -> SignatureShare {
        let sig = self.private_share.sign(message, &[], &[]);
        SignatureShare {
            signer: self.index,
            signature: sig.to_bytes().to_vec(),
        }
    }

    /// Verify a share against the signer's public share.
    pub fn verify_share(&self, message: &[u8], share: &SignatureShare) -> Result<(), CryptoError> {
        let pk = self
            .public_shares
            .get(share.signer.as_usize())
            .ok_or(CryptoError::UnknownPeer(share.signer))?;
        let sig = Signature::from_bytes(&share.signature)
            .map_err(|_| CryptoError::MalformedSignature)?;
        if sig.verify(true, message, &[], &[], pk, true) == BLST_ERROR::BLST_SUCCESS {
            Ok(())
        } else {
            Err(CryptoError::InvalidShare(share.signer))
        }
    }

    /// Combine shares over `message` into an aggregate signature.
    ///
    /// Every share is verified first. Fails unless at least `threshold`
    /// distinct signers contributed valid shares over this exact message.
    pub fn aggregate(
        &self,
        message: &[u8],
        shares: &[SignatureShare],
    ) -> Result<AggregateSignature, CryptoError> {
        let mut seen = BTreeSet::new();
        let mut signers = SignerBitfield::new(self.size());
        let mut sigs = Vec::with_capacity(shares.len());

        for share in shares {
            if !seen.insert(share.signer) {
                return Err(CryptoError::DuplicateShare(share.signer));
            }
            self.verify_share(message, share)?;
            let sig = Signature::from_bytes(&share.signature)
                .map_err(|_| CryptoError::MalformedSignature)?;
            signers.set(share.signer);
            sigs.push(sig);
        }

        let need = self.threshold as usize;
        if sigs.len() < need {
            return Err(CryptoError::InsufficientShares {
                have: sigs.len(),
                need,
            });
        }

        let refs: Vec<&Signature> = sigs.iter().collect();
        let aggregate = BlsAggregateSignature::aggregate(&refs, true)
            .map_err(|_| CryptoError::AggregationFailed)?;

        Ok(AggregateSignature {
            signers,
            signature: aggregate.to_signature().to_bytes().to_vec(),
        })
    }

    /// Verify an aggregate produced by this committee.
    pub fn verify_aggregate(
        &self,
        message: &[u8],
        aggregate: &AggregateSignature,
    ) -> Result<(), CryptoError> {
        let need = self.threshold as usize;
        let have = aggregate.signers.count();
        if have < need {
            return Err(CryptoError::InsufficientShares { have, need });
        }
        if aggregate.signers.len() != self.size() {
            return Err(CryptoError::InvalidAggregate);
        }

        let pks: Vec<&PublicKey> = aggregate
            .signers
            .iter()
            .map(|peer| &self.public_shares[peer.as_usize()])
            .collect();
        let agg_pk = AggregatePublicKey::aggregate(&pks, false)
            .map_err(|_| CryptoError::AggregationFailed)?
            .to_public_key();
        let sig = Signature::from_bytes(&aggregate.signature)
            .map_err(|_| CryptoError::MalformedSignature)?;

        if sig.verify(true, message, &[], &[], &agg_pk, false) == BLST_ERROR::BLST_SUCCESS {
            Ok(())
        } else {
            Err(CryptoError::InvalidAggregate)
        }
    }
}

impl fmt::Debug for DkShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkShare")
            .field("address", &self.address)
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

fn committee_address(threshold: u16, public_shares: &[PublicKey]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"COMMITTEE");
    hasher.update(&threshold.to_le_bytes());
    for pk in public_shares {
        hasher.update(&pk.to_bytes());
    }
    Hash::from_raw(*hasher.finalize().as_bytes())
}

/// Deterministically deal `size` shares with the given threshold from `seed`.
///
/// Stands in for distributed key generation in simulations and local
/// clusters: every member derives its private share from the same seed, so
/// the output is only as secret as the seed.
pub fn deal_shares(size: u16, threshold: u16, seed: &[u8; 32]) -> Result<Vec<DkShare>, CryptoError> {
    if threshold == 0 || threshold > size {
        return Err(CryptoError::InvalidThreshold { threshold, size });
    }

    let secrets = (0..size)
        .map(|i| {
            let ikm = Hash::from_parts(&[b"DEAL".as_slice(), seed.as_slice(), &i.to_le_bytes()[..]]);
            SecretKey::key_gen(ikm.as_bytes(), &[]).map_err(|_| CryptoError::MalformedKey)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let public_shares: Vec<[u8; PUBLIC_KEY_BYTES]> =
        secrets.iter().map(|sk| sk.sk_to_pk().to_bytes()).collect();

    secrets
        .into_iter()
        .enumerate()
        .map(|(i, sk)| DkShare::new(PeerIndex(i as u16), threshold, public_shares.clone(), sk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committee(size: u16, threshold: u16) -> Vec<DkShare> {
        deal_shares(size, threshold, &[7u8; 32]).unwrap()
    }

    #[test]
    fn test_share_sign_verify() {
        let shares = committee(4, 3);
        let msg = b"result hash";
        let share = shares[1].sign_share(msg);
        assert_eq!(share.signer, PeerIndex(1));
        for verifier in &shares {
            assert!(verifier.verify_share(msg, &share).is_ok());
        }
        assert_eq!(
            shares[0].verify_share(b"other", &share),
            Err(CryptoError::InvalidShare(PeerIndex(1)))
        );
    }

    #[test]
    fn test_all_members_share_address() {
        let shares = committee(4, 3);
        assert!(shares.iter().all(|s| s.address() == shares[0].address()));
        let other = deal_shares(4, 3, &[8u8; 32]).unwrap();
        assert_ne!(other[0].address(), shares[0].address());
    }

    #[test]
    fn test_aggregate_at_threshold() {
        let shares = committee(4, 3);
        let msg = b"H1";
        let sigs: Vec<_> = shares[..3].iter().map(|s| s.sign_share(msg)).collect();
        let agg = shares[3].aggregate(msg, &sigs).unwrap();
        assert_eq!(agg.signers.count(), 3);
        assert!(shares[0].verify_aggregate(msg, &agg).is_ok());
        assert_eq!(
            shares[0].verify_aggregate(b"H2", &agg),
            Err(CryptoError::InvalidAggregate)
        );
    }

    #[test]
    fn test_aggregate_below_threshold_fails() {
        let shares = committee(4, 3);
        let msg = b"H1";
        let sigs: Vec<_> = shares[..2].iter().map(|s| s.sign_share(msg)).collect();
        assert_eq!(
            shares[0].aggregate(msg, &sigs),
            Err(CryptoError::InsufficientShares { have: 2, need: 3 })
        );
    }

    #[test]
    fn test_aggregate_rejects_mixed_messages() {
        let shares = committee(4, 3);
        let mut sigs: Vec<_> = shares[..2].iter().map(|s| s.sign_share(b"H1")).collect();
        sigs.push(shares[2].sign_share(b"H2"));
        assert_eq!(
            shares[0].aggregate(b"H1", &sigs),
            Err(CryptoError::InvalidShare(PeerIndex(2)))
        );
    }

    #[test]
    fn test_aggregate_rejects_duplicate_signer() {
        let shares = committee(4, 3);
        let s0 = shares[0].sign_share(b"H1");
        let s1 = shares[1].sign_share(b"H1");
        assert_eq!(
            shares[0].aggregate(b"H1", &[s0.clone(), s1, s0]),
            Err(CryptoError::DuplicateShare(PeerIndex(0)))
        );
    }

    #[test]
    fn test_invalid_threshold() {
        assert_eq!(
            deal_shares(3, 4, &[0u8; 32]).unwrap_err(),
            CryptoError::InvalidThreshold {
                threshold: 4,
                size: 3
            }
        );
        assert!(deal_shares(3, 0, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_mismatched_private_share_rejected() {
        let shares = committee(3, 2);
        let publics: Vec<_> = (0..3)
            .map(|i| shares[0].public_share(PeerIndex(i)).unwrap())
            .collect();
        let foreign = SecretKey::key_gen(&[9u8; 32], &[]).unwrap();
        assert_eq!(
            DkShare::new(PeerIndex(0), 2, publics, foreign).unwrap_err(),
            CryptoError::ShareMismatch(PeerIndex(0))
        );
    }
}
