//! Core types for the quorumstate chain engine.
//!
//! This crate provides the foundational types used by every component:
//!
//! - **Primitives**: Hash, committee key shares and signatures
//! - **Identifiers**: ChainId, PeerIndex, StateIndex, RequestId
//! - **Chain data**: Request, StateBlock, VirtualState, StateOutput
//! - **Ledger types**: StateTransaction, InclusionState
//! - **Registry records**: ChainRecord, CommitteeRecord, PeerStatus
//!
//! It does not depend on any other workspace crate.

mod crypto;
mod hash;
mod identifiers;
mod records;
mod request;
mod signer_bitfield;
mod state;
mod transaction;

pub use crypto::{
    deal_shares, AggregateSignature, CryptoError, DkShare, SignatureShare, PUBLIC_KEY_BYTES,
    SIGNATURE_BYTES,
};
pub use hash::{Hash, HexError};
pub use identifiers::{ChainId, PeerIndex, RequestId, StateIndex};
pub use records::{ChainRecord, CommitteeRecord, PeerStatus};
pub use request::{ArgValue, Request, RequestError, RequestProcessingStatus, Transfer};
pub use signer_bitfield::SignerBitfield;
pub use state::{
    BlockHeader, StateBlock, StateDelta, StateError, StateOutput, StateUpdate, VirtualState,
};
pub use transaction::{
    InclusionState, StateTransaction, TransactionEssence, DOMAIN_STATE_TRANSITION,
};
