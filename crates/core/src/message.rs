//! Messages exchanged between committee members.
//!
//! The core only defines the logical message set. Framing and byte encoding
//! belong to the transport; the serde derives let a transport pick any
//! format without the core knowing about it.

use quorumstate_types::{
    BlockHeader, Hash, RequestId, SignatureShare, StateIndex, StateUpdate,
};
use serde::{Deserialize, Serialize};

/// Request for the block that produced state `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockMsg {
    pub index: StateIndex,
}

/// Header of a block being served in response to [`GetBlockMsg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderMsg {
    pub header: BlockHeader,
}

/// One update of a block being served, identified by its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdateMsg {
    pub index: StateIndex,
    pub position: u16,
    pub update: StateUpdate,
}

/// Exchange of solid state indices between peers that are catching up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIndexPingPongMsg {
    pub index: StateIndex,
    pub request_pong: bool,
}

/// Batch proposal from the round leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcessingBatchMsg {
    /// Index of the state the batch executes against.
    pub state_index: StateIndex,
    /// Leader rotation attempt at this state index.
    pub attempt: u32,
    /// Timestamp the resulting block will carry (ms since the Unix epoch).
    pub timestamp: u64,
    pub request_ids: Vec<RequestId>,
}

impl StartProcessingBatchMsg {
    /// Hash identifying the proposal; acknowledgements and signature shares
    /// refer to it.
    pub fn batch_hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(48 + self.request_ids.len() * 34);
        buf.extend_from_slice(b"BATCH");
        buf.extend_from_slice(&self.state_index.0.to_le_bytes());
        buf.extend_from_slice(&self.attempt.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        for id in &self.request_ids {
            buf.extend_from_slice(&id.to_bytes());
        }
        Hash::from_bytes(&buf)
    }
}

/// Seen marks for requests, optionally acknowledging a batch.
///
/// Without `batch_hash` it only announces that the sender holds the listed
/// requests. With `batch_hash` it also acknowledges that proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyReqMsg {
    pub state_index: StateIndex,
    pub request_ids: Vec<RequestId>,
    pub batch_hash: Option<Hash>,
}

/// A member's signature share over its locally computed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHashMsg {
    pub state_index: StateIndex,
    pub batch_hash: Hash,
    /// Result hash (transaction essence hash) the share signs.
    pub essence_hash: Hash,
    pub share: SignatureShare,
}

/// The leader announces that the final transaction was posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyFinalResultPostedMsg {
    pub state_index: StateIndex,
    pub tx_id: Hash,
}

/// Every message a committee member can send to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    // ═══════════════════════════════════════════════════════════════════════
    // Block sync
    // ═══════════════════════════════════════════════════════════════════════
    GetBlock(GetBlockMsg),
    BlockHeader(BlockHeaderMsg),
    StateUpdate(StateUpdateMsg),
    StateIndexPingPong(StateIndexPingPongMsg),

    // ═══════════════════════════════════════════════════════════════════════
    // Consensus
    // ═══════════════════════════════════════════════════════════════════════
    StartProcessingBatch(StartProcessingBatchMsg),
    NotifyReq(NotifyReqMsg),
    SignedHash(SignedHashMsg),
    NotifyFinalResultPosted(NotifyFinalResultPostedMsg),
}

impl PeerMessage {
    /// Stable numeric message type, for transports that route by type.
    pub fn msg_type(&self) -> u8 {
        match self {
            PeerMessage::GetBlock(_) => 1,
            PeerMessage::BlockHeader(_) => 2,
            PeerMessage::StateUpdate(_) => 3,
            PeerMessage::StateIndexPingPong(_) => 4,
            PeerMessage::StartProcessingBatch(_) => 10,
            PeerMessage::NotifyReq(_) => 11,
            PeerMessage::SignedHash(_) => 12,
            PeerMessage::NotifyFinalResultPosted(_) => 13,
        }
    }

    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::GetBlock(_) => "GetBlock",
            PeerMessage::BlockHeader(_) => "BlockHeader",
            PeerMessage::StateUpdate(_) => "StateUpdate",
            PeerMessage::StateIndexPingPong(_) => "StateIndexPingPong",
            PeerMessage::StartProcessingBatch(_) => "StartProcessingBatch",
            PeerMessage::NotifyReq(_) => "NotifyReq",
            PeerMessage::SignedHash(_) => "SignedHash",
            PeerMessage::NotifyFinalResultPosted(_) => "NotifyFinalResultPosted",
        }
    }

    /// Whether the state manager consumes this message.
    pub fn is_sync(&self) -> bool {
        self.msg_type() < 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(ids: Vec<RequestId>) -> StartProcessingBatchMsg {
        StartProcessingBatchMsg {
            state_index: StateIndex(3),
            attempt: 0,
            timestamp: 1_000,
            request_ids: ids,
        }
    }

    #[test]
    fn test_batch_hash_depends_on_order_and_attempt() {
        let a = RequestId::new(Hash::from_bytes(b"a"), 0);
        let b = RequestId::new(Hash::from_bytes(b"b"), 0);
        let ab = proposal(vec![a, b]);
        let ba = proposal(vec![b, a]);
        assert_ne!(ab.batch_hash(), ba.batch_hash());

        let mut retry = proposal(vec![a, b]);
        retry.attempt = 1;
        assert_ne!(ab.batch_hash(), retry.batch_hash());
        assert_eq!(ab.batch_hash(), proposal(vec![a, b]).batch_hash());
    }

    #[test]
    fn test_sync_classification() {
        let get = PeerMessage::GetBlock(GetBlockMsg {
            index: StateIndex(1),
        });
        let notify = PeerMessage::NotifyFinalResultPosted(NotifyFinalResultPostedMsg {
            state_index: StateIndex(1),
            tx_id: Hash::ZERO,
        });
        assert!(get.is_sync());
        assert!(!notify.is_sync());
    }
}
