//! Per-peer protocol state.

use std::collections::BTreeMap;

use crate::id::NodeId;
use crate::message::Message;
use crate::seqno::{SeqRange, Seqno};

/// Everything the engine remembers about one peer (including itself).
///
/// A record is created when the id is first observed and removed only when
/// an installed view excludes it.
#[derive(Debug, Clone)]
pub struct Peer {
    pub name: String,
    /// Believed alive and participating.
    pub operational: bool,
    /// Acked the pending install in the current recovery round.
    pub installed: bool,
    /// Announced an orderly leave.
    pub leaving: bool,
    pub join_message: Option<Message>,
    pub leave_message: Option<Message>,
    /// Range this peer declared for itself in its last JOIN.
    pub expected_range: Option<SeqRange>,
    /// Last group ARU this peer declared, sentinel until heard.
    pub safe_seq: Seqno,
    /// Consensus-tick of the last receipt from this peer.
    pub tick: u64,
    /// Marked inactive out of band (partition detection hook).
    pub marked_inactive: bool,
    /// Highest fifo sequence seen on control messages from this peer.
    pub fifo_seq: i64,
}

impl Peer {
    fn new(tick: u64, safe_sentinel: Seqno) -> Self {
        Self {
            name: String::new(),
            operational: true,
            installed: false,
            leaving: false,
            join_message: None,
            leave_message: None,
            expected_range: None,
            safe_seq: safe_sentinel,
            tick,
            marked_inactive: false,
            fifo_seq: i64::MIN,
        }
    }

    /// Counts toward membership consensus.
    pub fn is_operational(&self) -> bool {
        self.operational && !self.leaving
    }

    /// Reset the per-round recovery state, keeping liveness knowledge.
    pub fn reset_round(&mut self) {
        self.installed = false;
        self.join_message = None;
        self.expected_range = None;
    }
}

/// The table of known peers, id-ordered.
#[derive(Debug, Default)]
pub struct PeerIndex {
    peers: BTreeMap<NodeId, Peer>,
}

impl PeerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a record, creating it (operational, nameless) on first sight.
    /// Returns whether the id was new.
    pub fn ensure(&mut self, id: NodeId, tick: u64, safe_sentinel: Seqno) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(id, Peer::new(tick, safe_sentinel));
        true
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Peer)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut Peer)> {
        self.peers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Ids currently counting toward consensus.
    pub fn operational_ids(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.is_operational())
            .map(|(id, _)| *id)
            .collect()
    }

    /// The would-be representative: smallest operational id.
    pub fn representative(&self) -> Option<NodeId> {
        self.peers
            .iter()
            .find(|(_, p)| p.is_operational())
            .map(|(id, _)| *id)
    }

    pub fn reset_round(&mut self) {
        for p in self.peers.values_mut() {
            p.reset_round();
        }
    }

    /// Drop every record whose id fails the predicate. Used when a new view
    /// is installed to forget excluded peers.
    pub fn retain<F: FnMut(&NodeId) -> bool>(&mut self, mut keep: F) {
        self.peers.retain(|id, _| keep(id));
    }
}
