//! Negative fixtures: shares that must be rejected.

use crate::TestCommittee;
use quorumstate_types::{PeerIndex, SignatureShare};

/// A share that claims to come from `claimed` but is signed by `actual`.
pub fn make_wrong_key_share(
    committee: &TestCommittee,
    claimed: usize,
    actual: usize,
    message: &[u8],
) -> SignatureShare {
    let mut share = committee.share(actual).sign_share(message);
    share.signer = PeerIndex(claimed as u16);
    share
}

/// A share from `signer` that is valid, but over `signed` rather than the
/// message it is presented with.
pub fn make_wrong_message_share(
    committee: &TestCommittee,
    signer: usize,
    signed: &[u8],
) -> SignatureShare {
    committee.share(signer).sign_share(signed)
}

/// A share with garbage signature bytes.
pub fn make_malformed_share(signer: usize) -> SignatureShare {
    SignatureShare {
        signer: PeerIndex(signer as u16),
        signature: vec![0xAB; 12],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_shares_fail_verification() {
        let committee = TestCommittee::new(4, 3, 5);
        let verifier = committee.share(0);
        let msg = b"essence";

        assert!(verifier
            .verify_share(msg, &make_wrong_key_share(&committee, 1, 2, msg))
            .is_err());
        assert!(verifier
            .verify_share(msg, &make_wrong_message_share(&committee, 1, b"other"))
            .is_err());
        assert!(verifier.verify_share(msg, &make_malformed_share(1)).is_err());
        assert!(verifier
            .verify_share(msg, &committee.share(1).sign_share(msg))
            .is_ok());
    }
}
