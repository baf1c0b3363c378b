//! Committee abstraction for quorumstate chains.
//!
//! A committee is the fixed set of peers holding shares of one threshold
//! key. It provides quorum arithmetic, a liveness view over the transport
//! and unicast/broadcast messaging. It holds no consensus state.

mod committee;
mod transport;

pub use committee::{Committee, CommitteeError, CommitteeImpl, PeerMessageHandler};
pub use transport::{PeerEnvelope, PeerTransport, TransportError};
