//! Compact record of which committee members contributed to an aggregate.

use crate::PeerIndex;
use serde::{Deserialize, Serialize};

/// Bitfield over committee peer indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SignerBitfield {
    len: u16,
    words: Vec<u64>,
}

impl SignerBitfield {
    /// Empty bitfield sized for a committee of `len` members.
    pub fn new(len: u16) -> Self {
        Self {
            len,
            words: vec![0; (len as usize).div_ceil(64)],
        }
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Set the bit for `peer`. Returns false when the index is out of range.
    pub fn set(&mut self, peer: PeerIndex) -> bool {
        if peer.0 >= self.len {
            return false;
        }
        let i = peer.as_usize();
        self.words[i / 64] |= 1 << (i % 64);
        true
    }

    pub fn is_set(&self, peer: PeerIndex) -> bool {
        if peer.0 >= self.len {
            return false;
        }
        let i = peer.as_usize();
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PeerIndex> + '_ {
        (0..self.len)
            .map(PeerIndex)
            .filter(move |peer| self.is_set(*peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_count() {
        let mut bits = SignerBitfield::new(70);
        assert!(bits.is_empty());
        assert!(bits.set(PeerIndex(0)));
        assert!(bits.set(PeerIndex(65)));
        assert!(bits.set(PeerIndex(65)));
        assert!(!bits.set(PeerIndex(70)));
        assert_eq!(bits.count(), 2);
        assert_eq!(
            bits.iter().collect::<Vec<_>>(),
            vec![PeerIndex(0), PeerIndex(65)]
        );
        assert!(!bits.is_set(PeerIndex(1)));
    }
}
