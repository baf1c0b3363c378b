//! Transport interface used by committees.
//!
//! The transport moves opaque envelopes between peering ids. It may encode
//! them however it likes; the committee never sees bytes.

use quorumstate_core::PeerMessage;
use quorumstate_types::{Hash, PeerIndex};
use serde::{Deserialize, Serialize};

/// Error returned when the transport refuses a send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} not connected")]
    NotConnected(String),
    #[error("Transport shutting down")]
    Shutdown,
}

/// A committee message as handed to the transport.
///
/// `committee` lets the receiving node route the message to the right
/// committee (and so the right chain) before decoding the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    pub committee: Hash,
    pub sender: PeerIndex,
    /// Sender's clock for broadcasts (ms since the Unix epoch).
    pub timestamp: Option<u64>,
    pub message: PeerMessage,
}

/// Point-to-point delivery between peering ids.
///
/// Sends are fire-and-forget: `Ok` means the transport accepted the
/// envelope, not that it was delivered. Inbound envelopes are handed to
/// [`CommitteeImpl::deliver`](crate::CommitteeImpl::deliver) by whoever
/// owns the transport's receive side.
pub trait PeerTransport: Send + Sync {
    fn send(&self, peering_id: &str, envelope: PeerEnvelope) -> Result<(), TransportError>;

    fn is_connected(&self, peering_id: &str) -> bool;
}
