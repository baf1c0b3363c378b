//! Committee whose sends land in an outbox drained by the runner.

use crate::network::Links;
use crate::NodeIndex;
use parking_lot::Mutex;
use quorumstate_committee::{Committee, CommitteeError, PeerMessageHandler};
use quorumstate_core::PeerMessage;
use quorumstate_types::{DkShare, Hash, PeerIndex, PeerStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An outbound message. `None` as target means every other member.
pub(crate) type Outgoing = (Option<PeerIndex>, PeerMessage);

/// Committee member inside the simulation.
///
/// Liveness reflects the shared [`Links`]; delivery itself is left to the
/// runner, which applies latency and loss to everything in the outbox.
/// Inbound messages are fed straight into the chain, so the registered
/// handler is never invoked.
pub struct SimCommittee {
    dk_share: Arc<DkShare>,
    links: Arc<Links>,
    outbox: Mutex<Vec<Outgoing>>,
    has_handler: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for SimCommittee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCommittee")
            .field("own_index", &self.dk_share.index())
            .field("outbox", &self.outbox.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SimCommittee {
    pub fn new(dk_share: Arc<DkShare>, links: Arc<Links>) -> Self {
        Self {
            dk_share,
            links,
            outbox: Mutex::new(Vec::new()),
            has_handler: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn own(&self) -> NodeIndex {
        self.dk_share.index().0
    }

    pub(crate) fn drain_outbox(&self) -> Vec<Outgoing> {
        std::mem::take(&mut *self.outbox.lock())
    }
}

impl Committee for SimCommittee {
    fn address(&self) -> Hash {
        self.dk_share.address()
    }

    fn size(&self) -> u16 {
        self.dk_share.size()
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
        if target.0 >= self.size() {
            return Err(CommitteeError::UnknownPeer(target));
        }
        self.outbox.lock().push((Some(target), message));
        Ok(())
    }

    fn send_msg_to_peers(&self, message: PeerMessage, _timestamp: u64) -> u16 {
        if self.is_closed() {
            return 0;
        }
        let own = self.own_peer_index();
        let reachable = (0..self.size())
            .map(PeerIndex)
            .filter(|p| *p != own && self.is_alive_peer(*p))
            .count() as u16;
        self.outbox.lock().push((None, message));
        reachable
    }

    fn is_alive_peer(&self, peer: PeerIndex) -> bool {
        peer.0 < self.size() && self.links.is_reachable(self.own(), peer.0)
    }

    fn peer_status(&self) -> Vec<PeerStatus> {
        let own = self.own_peer_index();
        (0..self.size())
            .map(|i| {
                let index = PeerIndex(i);
                PeerStatus {
                    index,
                    peering_id: format!("sim-{i}"),
                    is_self: index == own,
                    connected: self.is_alive_peer(index),
                }
            })
            .collect()
    }

    fn on_peer_message(&self, _handler: PeerMessageHandler) -> Result<(), CommitteeError> {
        if self.has_handler.swap(true, Ordering::SeqCst) {
            return Err(CommitteeError::HandlerAlreadyRegistered);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbox.lock().clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
