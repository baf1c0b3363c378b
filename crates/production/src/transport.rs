//! In-process peer transport.

use parking_lot::RwLock;
use quorumstate_committee::{
    Committee, CommitteeImpl, PeerEnvelope, PeerTransport, TransportError,
};
use quorumstate_types::Hash;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Hub connecting the committees of every node running in this process.
///
/// Each node registers its committee instances under its peering id. An
/// envelope is handed straight to the target's committee, which pushes it
/// into the owning chain's intake; nothing blocks on the sender side.
#[derive(Default)]
pub struct MemoryHub {
    nodes: RwLock<HashMap<String, HashMap<Hash, Weak<CommitteeImpl>>>>,
    disconnected: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("nodes", &self.nodes.read().len())
            .field("disconnected", &self.disconnected.read().len())
            .finish()
    }
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `committee` reachable at `peering_id`.
    pub fn register(&self, peering_id: &str, committee: &Arc<CommitteeImpl>) {
        self.nodes
            .write()
            .entry(peering_id.to_string())
            .or_default()
            .insert(committee.address(), Arc::downgrade(committee));
    }

    /// Simulate a node going offline or coming back.
    pub fn set_connected(&self, peering_id: &str, connected: bool) {
        let mut disconnected = self.disconnected.write();
        if connected {
            disconnected.remove(peering_id);
        } else {
            disconnected.insert(peering_id.to_string());
        }
    }

    fn lookup(&self, peering_id: &str, committee: &Hash) -> Option<Arc<CommitteeImpl>> {
        self.nodes
            .read()
            .get(peering_id)
            .and_then(|committees| committees.get(committee))
            .and_then(Weak::upgrade)
    }
}

impl PeerTransport for MemoryHub {
    fn send(&self, peering_id: &str, envelope: PeerEnvelope) -> Result<(), TransportError> {
        if self.disconnected.read().contains(peering_id) {
            return Err(TransportError::NotConnected(peering_id.to_string()));
        }
        let target = self
            .lookup(peering_id, &envelope.committee)
            .ok_or_else(|| TransportError::NotConnected(peering_id.to_string()))?;
        trace!(
            to = peering_id,
            msg = envelope.message.type_name(),
            "Delivering in-process"
        );
        target
            .deliver(envelope)
            .map_err(|_| TransportError::NotConnected(peering_id.to_string()))
    }

    fn is_connected(&self, peering_id: &str) -> bool {
        !self.disconnected.read().contains(peering_id)
            && self.nodes.read().contains_key(peering_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use quorumstate_core::{GetBlockMsg, PeerMessage};
    use quorumstate_test_helpers::TestCommittee;
    use quorumstate_types::{PeerIndex, StateIndex};

    #[test]
    fn test_delivery_between_registered_committees() {
        let committee = TestCommittee::new(3, 2, 80);
        let hub = MemoryHub::new();
        let members: Vec<Arc<CommitteeImpl>> = (0..3)
            .map(|i| {
                let member = Arc::new(
                    CommitteeImpl::new(
                        committee.record(),
                        Arc::clone(committee.share(i)),
                        Arc::clone(&hub) as Arc<dyn PeerTransport>,
                    )
                    .unwrap(),
                );
                hub.register(&committee.record().nodes[i], &member);
                member
            })
            .collect();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        members[2]
            .on_peer_message(Box::new(move |from, msg| sink.lock().push((from, msg))))
            .unwrap();

        let msg = PeerMessage::GetBlock(GetBlockMsg {
            index: StateIndex(3),
        });
        members[0].send_msg(PeerIndex(2), msg.clone()).unwrap();
        assert_eq!(received.lock().as_slice(), &[(PeerIndex(0), msg)]);

        hub.set_connected(&committee.record().nodes[2], false);
        assert!(!members[0].is_alive_peer(PeerIndex(2)));
        assert!(members[0]
            .send_msg(PeerIndex(2), PeerMessage::GetBlock(GetBlockMsg { index: StateIndex(4) }))
            .is_err());
        assert_eq!(received.lock().len(), 1);
    }
}
