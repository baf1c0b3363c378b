//! A [`Committee`] that records outbound messages instead of sending them.

use parking_lot::{Mutex, RwLock};
use quorumstate_committee::{Committee, CommitteeError, PeerMessageHandler};
use quorumstate_core::PeerMessage;
use quorumstate_types::{DkShare, Hash, PeerIndex, PeerStatus};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Recording committee with controllable peer liveness.
pub struct FakeCommittee {
    dk_share: Arc<DkShare>,
    down: RwLock<BTreeSet<PeerIndex>>,
    sent: Mutex<Vec<(Option<PeerIndex>, PeerMessage)>>,
    handler: Mutex<Option<PeerMessageHandler>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FakeCommittee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeCommittee")
            .field("own_index", &self.dk_share.index())
            .field("down", &*self.down.read())
            .finish()
    }
}

impl FakeCommittee {
    pub fn new(dk_share: Arc<DkShare>) -> Self {
        Self {
            dk_share,
            down: RwLock::new(BTreeSet::new()),
            sent: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Mark a peer connected or disconnected.
    pub fn set_alive(&self, peer: PeerIndex, alive: bool) {
        let mut down = self.down.write();
        if alive {
            down.remove(&peer);
        } else {
            down.insert(peer);
        }
    }

    /// Take every recorded send. `None` as target means broadcast.
    pub fn drain_sent(&self) -> Vec<(Option<PeerIndex>, PeerMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Invoke the registered handler as if `from` had sent `message`.
    pub fn inject(&self, from: PeerIndex, message: PeerMessage) -> bool {
        match &*self.handler.lock() {
            Some(handler) => {
                handler(from, message);
                true
            }
            None => false,
        }
    }
}

impl Committee for FakeCommittee {
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
        if !self.is_alive_peer(target) {
            return Err(CommitteeError::PeerUnreachable(target));
        }
        self.sent.lock().push((Some(target), message));
        Ok(())
    }

    fn send_msg_to_peers(&self, message: PeerMessage, _timestamp: u64) -> u16 {
        if self.is_closed() {
            return 0;
        }
        let own = self.own_peer_index();
        let accepted = (0..self.size())
            .map(PeerIndex)
            .filter(|p| *p != own && self.is_alive_peer(*p))
            .count() as u16;
        self.sent.lock().push((None, message));
        accepted
    }

    fn is_alive_peer(&self, peer: PeerIndex) -> bool {
        peer.0 < self.size() && !self.down.read().contains(&peer)
    }

    fn peer_status(&self) -> Vec<PeerStatus> {
        let own = self.own_peer_index();
        (0..self.size())
            .map(|i| {
                let index = PeerIndex(i);
                PeerStatus {
                    index,
                    peering_id: format!("fake-{i}"),
                    is_self: index == own,
                    connected: self.is_alive_peer(index),
                }
            })
            .collect()
    }

    fn on_peer_message(&self, handler: PeerMessageHandler) -> Result<(), CommitteeError> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(CommitteeError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.handler.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
