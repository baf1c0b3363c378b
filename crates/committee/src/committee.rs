//! The committee trait and its transport-backed implementation.

use crate::transport::{PeerEnvelope, PeerTransport, TransportError};
use parking_lot::RwLock;
use quorumstate_core::PeerMessage;
use quorumstate_metrics as metrics;
use quorumstate_types::{CommitteeRecord, DkShare, Hash, PeerIndex, PeerStatus};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Dispatcher for inbound committee messages.
///
/// Called from the transport's receive thread; keep it lightweight
/// (typically: push into the chain's intake channel).
pub type PeerMessageHandler = Box<dyn Fn(PeerIndex, PeerMessage) + Send + Sync>;

/// Errors from committee construction and messaging.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitteeError {
    #[error("Peer {0} unreachable")]
    PeerUnreachable(PeerIndex),

    #[error("Peer {0} is not a committee member")]
    UnknownPeer(PeerIndex),

    #[error("Cannot send a message to self")]
    SendToSelf,

    #[error("Peer message handler already registered")]
    HandlerAlreadyRegistered,

    #[error("No peer message handler registered")]
    NoHandler,

    #[error("Committee closed")]
    Closed,

    #[error("Committee lists {peers} peers, key share has {shares}")]
    SizeMismatch { peers: usize, shares: u16 },

    #[error("Committee record {record:?} does not match key share {share:?}")]
    AddressMismatch { record: Hash, share: Hash },

    #[error("Envelope addressed to committee {0:?}")]
    WrongCommittee(Hash),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A fixed peer group holding shares of one threshold key.
///
/// Size, quorum and own index never change for the lifetime of an
/// instance; a membership change means a new committee.
pub trait Committee: Send + Sync {
    /// Control address of the committee.
    fn address(&self) -> Hash;

    fn size(&self) -> u16;

    /// Minimum number of agreeing members; equal to the key threshold.
    fn quorum(&self) -> u16;

    fn own_peer_index(&self) -> PeerIndex;

    fn dk_share(&self) -> &DkShare;

    /// Best-effort unicast.
    fn send_msg(&self, target: PeerIndex, message: PeerMessage) -> Result<(), CommitteeError>;

    /// Broadcast to every member except self. Returns the number of peers
    /// the transport accepted the message for.
    fn send_msg_to_peers(&self, message: PeerMessage, timestamp: u64) -> u16;

    fn is_alive_peer(&self, peer: PeerIndex) -> bool;

    /// True iff at least `quorum()` of `peers` are connected. An empty
    /// slice means every member.
    fn quorum_is_alive(&self, peers: &[PeerIndex]) -> bool {
        let candidates: BTreeSet<PeerIndex> = if peers.is_empty() {
            (0..self.size()).map(PeerIndex).collect()
        } else {
            peers.iter().copied().collect()
        };
        let alive = candidates
            .into_iter()
            .filter(|peer| self.is_alive_peer(*peer))
            .count();
        alive >= self.quorum() as usize
    }

    fn peer_status(&self) -> Vec<PeerStatus>;

    /// Register the single inbound dispatcher.
    fn on_peer_message(&self, handler: PeerMessageHandler) -> Result<(), CommitteeError>;

    /// Stop sending and drop the inbound subscription.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// [`Committee`] over a [`PeerTransport`].
pub struct CommitteeImpl {
    dk_share: Arc<DkShare>,
    peers: Vec<String>,
    transport: Arc<dyn PeerTransport>,
    handler: RwLock<Option<PeerMessageHandler>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CommitteeImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitteeImpl")
            .field("address", &self.dk_share.address())
            .field("own_index", &self.dk_share.index())
            .field("peers", &self.peers)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl CommitteeImpl {
    /// Build a committee from its registry record and this node's share.
    pub fn new(
        record: &CommitteeRecord,
        dk_share: Arc<DkShare>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, CommitteeError> {
        if record.address != dk_share.address() {
            return Err(CommitteeError::AddressMismatch {
                record: record.address,
                share: dk_share.address(),
            });
        }
        if record.nodes.len() != dk_share.size() as usize {
            return Err(CommitteeError::SizeMismatch {
                peers: record.nodes.len(),
                shares: dk_share.size(),
            });
        }

        Ok(Self {
            dk_share,
            peers: record.nodes.clone(),
            transport,
            handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Peering id of a member.
    pub fn peering_id(&self, peer: PeerIndex) -> Option<&str> {
        self.peers.get(peer.as_usize()).map(String::as_str)
    }

    /// Hand an inbound envelope to the registered handler.
    pub fn deliver(&self, envelope: PeerEnvelope) -> Result<(), CommitteeError> {
        if self.is_closed() {
            return Err(CommitteeError::Closed);
        }
        if envelope.committee != self.address() {
            return Err(CommitteeError::WrongCommittee(envelope.committee));
        }
        if envelope.sender.0 >= self.size() || envelope.sender == self.own_peer_index() {
            return Err(CommitteeError::UnknownPeer(envelope.sender));
        }

        let handler = self.handler.read();
        let handler = handler.as_ref().ok_or(CommitteeError::NoHandler)?;
        trace!(
            from = %envelope.sender,
            msg = envelope.message.type_name(),
            "Delivering committee message"
        );
        handler(envelope.sender, envelope.message);
        Ok(())
    }

    fn envelope(&self, message: PeerMessage, timestamp: Option<u64>) -> PeerEnvelope {
        PeerEnvelope {
            committee: self.address(),
            sender: self.own_peer_index(),
            timestamp,
            message,
        }
    }
}

impl Committee for CommitteeImpl {
    fn address(&self) -> Hash {
        self.dk_share.address()
    }

    fn size(&self) -> u16 {
        self.peers.len() as u16
    }

    fn quorum(&self) -> u16 {
        self.dk_share.threshold()
    }

    fn own_peer_index(&self) -> PeerIndex {
        self.dk_share.index()
    }

    fn dk_share(&self) -> &DkShare {
        &self.dk_share
    }

    fn send_msg(&self, target: PeerIndex, message: PeerMessage) -> Result<(), CommitteeError> {
        if self.is_closed() {
            return Err(CommitteeError::Closed);
        }
        if target == self.own_peer_index() {
            return Err(CommitteeError::SendToSelf);
        }
        let peering_id = self
            .peering_id(target)
            .ok_or(CommitteeError::UnknownPeer(target))?;
        if !self.transport.is_connected(peering_id) {
            metrics::record_send_failure();
            return Err(CommitteeError::PeerUnreachable(target));
        }

        self.transport
            .send(peering_id, self.envelope(message, None))
            .map_err(|e| {
                metrics::record_send_failure();
                match e {
                    TransportError::NotConnected(_) => CommitteeError::PeerUnreachable(target),
                    other => CommitteeError::Transport(other),
                }
            })
    }

    fn send_msg_to_peers(&self, message: PeerMessage, timestamp: u64) -> u16 {
        if self.is_closed() {
            return 0;
        }
        let own = self.own_peer_index();
        let mut accepted = 0u16;
        for (i, peering_id) in self.peers.iter().enumerate() {
            if i == own.as_usize() {
                continue;
            }
            match self
                .transport
                .send(peering_id, self.envelope(message.clone(), Some(timestamp)))
            {
                Ok(()) => accepted += 1,
                Err(e) => {
                    metrics::record_send_failure();
                    debug!(peer = %peering_id, error = %e, "Broadcast send failed");
                }
            }
        }
        accepted
    }

    fn is_alive_peer(&self, peer: PeerIndex) -> bool {
        if peer == self.own_peer_index() {
            return true;
        }
        self.peering_id(peer)
            .is_some_and(|id| self.transport.is_connected(id))
    }

    fn peer_status(&self) -> Vec<PeerStatus> {
        let own = self.own_peer_index();
        self.peers
            .iter()
            .enumerate()
            .map(|(i, peering_id)| {
                let index = PeerIndex(i as u16);
                PeerStatus {
                    index,
                    peering_id: peering_id.clone(),
                    is_self: index == own,
                    connected: index == own || self.transport.is_connected(peering_id),
                }
            })
            .collect()
    }

    fn on_peer_message(&self, handler: PeerMessageHandler) -> Result<(), CommitteeError> {
        let mut slot = self.handler.write();
        if slot.is_some() {
            return Err(CommitteeError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handler.write().take();
            debug!(committee = ?self.address(), "Committee closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use quorumstate_core::GetBlockMsg;
    use quorumstate_types::{deal_shares, StateIndex};
    use std::collections::HashSet;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingTransport {
        connected: Mutex<HashSet<String>>,
        sent: Mutex<Vec<(String, PeerEnvelope)>>,
    }

    impl PeerTransport for RecordingTransport {
        fn send(&self, peering_id: &str, envelope: PeerEnvelope) -> Result<(), TransportError> {
            if !self.is_connected(peering_id) {
                return Err(TransportError::NotConnected(peering_id.to_string()));
            }
            self.sent.lock().push((peering_id.to_string(), envelope));
            Ok(())
        }

        fn is_connected(&self, peering_id: &str) -> bool {
            self.connected.lock().contains(peering_id)
        }
    }

    fn setup(size: u16, threshold: u16, connected: &[&str]) -> (CommitteeImpl, Arc<RecordingTransport>) {
        let shares = deal_shares(size, threshold, &[3u8; 32]).unwrap();
        let nodes: Vec<String> = (0..size).map(|i| format!("node-{i}")).collect();
        let record = CommitteeRecord {
            address: shares[0].address(),
            nodes,
        };
        let transport = Arc::new(RecordingTransport::default());
        for id in connected {
            transport.connected.lock().insert(id.to_string());
        }
        let committee =
            CommitteeImpl::new(&record, Arc::new(shares[0].clone()), transport.clone()).unwrap();
        (committee, transport)
    }

    fn get_block() -> PeerMessage {
        PeerMessage::GetBlock(GetBlockMsg {
            index: StateIndex(1),
        })
    }

    #[test]
    fn test_static_properties() {
        let (committee, _) = setup(4, 3, &[]);
        assert_eq!(committee.size(), 4);
        assert_eq!(committee.quorum(), 3);
        assert_eq!(committee.own_peer_index(), PeerIndex(0));
    }

    #[test]
    fn test_record_mismatch_rejected() {
        let shares = deal_shares(3, 2, &[3u8; 32]).unwrap();
        let record = CommitteeRecord {
            address: shares[0].address(),
            nodes: vec!["a".into(), "b".into()],
        };
        let err = CommitteeImpl::new(
            &record,
            Arc::new(shares[0].clone()),
            Arc::new(RecordingTransport::default()),
        )
        .unwrap_err();
        assert_eq!(err, CommitteeError::SizeMismatch { peers: 2, shares: 3 });
    }

    #[test]
    fn test_send_to_disconnected_peer_is_unreachable() {
        let (committee, transport) = setup(4, 3, &["node-1"]);
        assert!(committee.send_msg(PeerIndex(1), get_block()).is_ok());
        assert_eq!(
            committee.send_msg(PeerIndex(2), get_block()),
            Err(CommitteeError::PeerUnreachable(PeerIndex(2)))
        );
        assert_eq!(
            committee.send_msg(PeerIndex(0), get_block()),
            Err(CommitteeError::SendToSelf)
        );
        assert_eq!(
            committee.send_msg(PeerIndex(9), get_block()),
            Err(CommitteeError::UnknownPeer(PeerIndex(9)))
        );
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[traced_test]
    #[test]
    fn test_broadcast_counts_accepted_sends() {
        let (committee, transport) = setup(4, 3, &["node-1", "node-3"]);
        assert_eq!(committee.send_msg_to_peers(get_block(), 77), 2);
        let sent = transport.sent.lock();
        assert!(sent.iter().all(|(_, env)| env.timestamp == Some(77)));
        assert!(sent.iter().all(|(id, _)| id != "node-0"));
        assert!(logs_contain("Broadcast send failed"));
    }

    #[test]
    fn test_quorum_is_alive() {
        let (committee, _) = setup(4, 3, &["node-1"]);
        // self + node-1
        assert!(!committee.quorum_is_alive(&[]));

        let (committee, _) = setup(4, 3, &["node-1", "node-2"]);
        assert!(committee.quorum_is_alive(&[]));
        assert!(!committee.quorum_is_alive(&[PeerIndex(1), PeerIndex(3)]));
        assert!(committee.quorum_is_alive(&[PeerIndex(0), PeerIndex(1), PeerIndex(2)]));
        // duplicates do not count twice
        assert!(!committee.quorum_is_alive(&[PeerIndex(1), PeerIndex(1), PeerIndex(1)]));
    }

    #[test]
    fn test_single_handler_and_delivery() {
        let (committee, _) = setup(4, 3, &[]);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        committee
            .on_peer_message(Box::new(move |from, msg| sink.lock().push((from, msg))))
            .unwrap();
        assert_eq!(
            committee.on_peer_message(Box::new(|_, _| {})),
            Err(CommitteeError::HandlerAlreadyRegistered)
        );

        let envelope = PeerEnvelope {
            committee: committee.address(),
            sender: PeerIndex(2),
            timestamp: None,
            message: get_block(),
        };
        committee.deliver(envelope.clone()).unwrap();
        assert_eq!(received.lock().len(), 1);

        let mut foreign = envelope.clone();
        foreign.committee = Hash::from_bytes(b"other");
        assert!(matches!(
            committee.deliver(foreign),
            Err(CommitteeError::WrongCommittee(_))
        ));

        committee.close();
        assert!(committee.is_closed());
        assert_eq!(committee.deliver(envelope), Err(CommitteeError::Closed));
        assert_eq!(committee.send_msg_to_peers(get_block(), 0), 0);
    }

    #[test]
    fn test_peer_status() {
        let (committee, _) = setup(3, 2, &["node-2"]);
        let status = committee.peer_status();
        assert_eq!(status.len(), 3);
        assert!(status[0].is_self && status[0].connected);
        assert!(!status[1].connected);
        assert!(status[2].connected);
        assert_eq!(status[2].peering_id, "node-2");
    }
}
