//! Identifier newtypes.

use crate::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique chain identifier, derived from the chain's control address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(pub Hash);

impl ChainId {
    /// Derive the chain id from the committee's control address.
    pub fn from_address(address: &Hash) -> Self {
        Self(Hash::from_parts(&[b"CHAIN_ID".as_slice(), address.as_bytes()]))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({}..)", &self.0.to_hex()[..12])
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_hex()[..12])
    }
}

/// Position of a peer within a committee.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PeerIndex(pub u16);

impl PeerIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PeerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic state counter: one increment per finalized round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct StateIndex(pub u32);

impl StateIndex {
    /// Index of the origin state.
    pub const ORIGIN: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Previous index, or `None` at the origin.
    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Display for StateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request identifier: the ledger transaction that carried the request plus
/// the output index inside that transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub tx_id: Hash,
    pub output_index: u16,
}

impl RequestId {
    pub fn new(tx_id: Hash, output_index: u16) -> Self {
        Self {
            tx_id,
            output_index,
        }
    }

    /// Canonical byte encoding, used in hashes and state keys.
    pub fn to_bytes(&self) -> [u8; 34] {
        let mut out = [0u8; 34];
        out[..32].copy_from_slice(self.tx_id.as_bytes());
        out[32..].copy_from_slice(&self.output_index.to_le_bytes());
        out
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({}..:{})", &self.tx_id.to_hex()[..8], self.output_index)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", &self.tx_id.to_hex()[..8], self.output_index)
    }
}
