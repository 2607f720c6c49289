//! The protocol state machine.
//!
//! One `Proto` instance is a single group member. It reacts to exactly one
//! entry point at a time (a received frame, a timer tick, or an application
//! send), emits zero or more frames through its transport, and hands
//! deliveries and view changes to its upper layer before returning. Nothing
//! blocks and nothing runs concurrently; hosts that want several engines
//! drive each from its own loop.
//!
//! State trajectory:
//!
//! ```text
//! CLOSED -> JOINING -> RECOVERY <-> OPERATIONAL -> LEAVING -> CLOSED
//! ```
//!
//! Recovery rounds exchange JOIN messages until every operational member
//! holds a consistent picture, the representative (smallest operational id)
//! proposes the new view with INSTALL, and members acknowledge with GAP.
//! Delivery of buffered messages, the transitional view and the new regular
//! view then happen in that order.

use std::collections::VecDeque;

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::config::ProtoConfig;
use crate::error::FlockError;
use crate::id::{NodeId, ViewId};
use crate::input_map::{InputMap, InsertOutcome};
use crate::layer::{Transport, UpMeta, UpperLayer};
use crate::message::{flags, Header, JoinEntry, MemberMap, Message, Safety, WIRE_VERSION};
use crate::node::PeerIndex;
use crate::seqno::{SeqRange, Seqno, SeqnoSpace};
use crate::stats::Stats;
use crate::view::{View, ViewKind};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Joining,
    Recovery,
    Operational,
    Leaving,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Joining => "joining",
            Self::Recovery => "recovery",
            Self::Operational => "operational",
            Self::Leaving => "leaving",
        })
    }
}

/// An application payload waiting for its turn in the send window.
#[derive(Debug, Clone)]
struct Pending {
    payload: Bytes,
    user_type: u8,
    safety: Safety,
    more: bool,
}

/// The group communication engine for one member.
pub struct Proto<T: Transport, U: UpperLayer> {
    cfg: ProtoConfig,
    space: SeqnoSpace,
    id: NodeId,
    name: String,
    transport: T,
    upper: U,

    state: State,
    poisoned: bool,
    peers: PeerIndex,
    input_map: InputMap,
    current_view: View,
    /// False until the first view install; the initial singleton view is a
    /// placeholder and produces no transitional view.
    view_installed: bool,
    install_message: Option<Message>,
    /// Content of the JOIN we last announced, for change detection.
    last_sent_join: Option<Message>,
    /// User messages already stamped for the pending view, replayed after
    /// the install completes.
    pending_new_view: VecDeque<(Header, Bytes)>,

    output: VecDeque<Pending>,
    last_sent: Seqno,
    fifo_seq: i64,
    consensus_tick: u64,
    resend_tick: u64,
    stats: Stats,
}

impl<T: Transport, U: UpperLayer> Proto<T, U> {
    /// Fails with `MessageTooLarge` if the node name exceeds the wire field.
    pub fn new(cfg: ProtoConfig, transport: T, upper: U, name: &str) -> Result<Self, FlockError> {
        if name.len() > crate::view::NODE_NAME_LEN {
            return Err(FlockError::MessageTooLarge);
        }
        let space = SeqnoSpace::new(cfg.seqno_max);
        let id = transport.local_id();
        let mut current_view = View::new(ViewKind::None, ViewId::new(id, 0));
        current_view.add_member(id, name)?;
        let mut peers = PeerIndex::new();
        peers.ensure(id, 0, space.none());
        if let Some(p) = peers.get_mut(&id) {
            p.name = name.to_owned();
        }
        let mut input_map = InputMap::new(space);
        input_map.insert_sa(id)?;
        Ok(Self {
            cfg,
            space,
            id,
            name: name.to_owned(),
            transport,
            upper,
            state: State::Closed,
            poisoned: false,
            peers,
            input_map,
            current_view,
            view_installed: false,
            install_message: None,
            last_sent_join: None,
            pending_new_view: VecDeque::new(),
            output: VecDeque::new(),
            last_sent: space.none(),
            fifo_seq: 0,
            consensus_tick: 0,
            resend_tick: 0,
            stats: Stats::default(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn self_id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_view(&self) -> &View {
        &self.current_view
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn upper(&self) -> &U {
        &self.upper
    }

    pub fn upper_mut(&mut self) -> &mut U {
        &mut self.upper
    }

    pub fn is_output_empty(&self) -> bool {
        self.output.is_empty()
    }

    // ---- lifecycle -----------------------------------------------------

    /// Join the group. A lone node completes its singleton view install
    /// synchronously and comes back operational.
    pub fn connect(&mut self) -> Result<(), FlockError> {
        if self.poisoned || self.state != State::Closed {
            return Err(FlockError::NotOperational);
        }
        self.shift_to(State::Joining, false);
        self.send_join(true);
        Ok(())
    }

    /// Leave the group: announce, drain, close.
    pub fn disconnect(&mut self) {
        if self.poisoned || matches!(self.state, State::Closed | State::Leaving) {
            return;
        }
        self.shift_to(State::Leaving, false);
        self.send_leave();
    }

    /// Drive the state machine by hand. Transitions the protocol would
    /// never take on its own poison the engine.
    pub fn shift_to(&mut self, target: State, announce: bool) {
        if self.poisoned {
            return;
        }
        let legal = matches!(
            (self.state, target),
            (State::Closed, State::Joining)
                | (State::Joining, State::Recovery)
                | (State::Operational, State::Recovery)
                | (State::Recovery, State::Recovery)
                | (State::Joining, State::Leaving)
                | (State::Recovery, State::Leaving)
                | (State::Operational, State::Leaving)
                | (_, State::Closed)
        );
        if !legal {
            self.fatal(&format!("illegal shift {} -> {}", self.state, target));
            return;
        }
        debug!("{}: shift {} -> {}", self.id, self.state, target);
        match target {
            State::Recovery => self.shift_to_recovery(announce),
            other => self.state = other,
        }
    }

    fn shift_to_recovery(&mut self, announce: bool) {
        self.state = State::Recovery;
        self.install_message = None;
        self.last_sent_join = None;
        self.pending_new_view.clear();
        self.peers.reset_round();
        if announce {
            self.send_join(true);
        }
    }

    fn fatal(&mut self, why: &str) {
        error!("{}: fatal: {why}", self.id);
        self.poisoned = true;
        self.state = State::Closed;
        let final_view = View::new(
            ViewKind::Reg,
            ViewId::new(self.id, self.current_view.id().seq().wrapping_add(1)),
        );
        self.stats.delivered_views += 1;
        self.upper
            .handle_up(None, &UpMeta::view_change(self.id, final_view));
    }

    // ---- application sends ---------------------------------------------

    /// Submit a payload for multicast under the given safety level.
    /// `more` hints that further sends follow immediately.
    pub fn send(
        &mut self,
        payload: Bytes,
        user_type: u8,
        safety: Safety,
        more: bool,
    ) -> Result<(), FlockError> {
        if self.poisoned || self.state != State::Operational {
            return Err(FlockError::NotOperational);
        }
        if self.output.len() >= self.cfg.send_window as usize * 4 {
            return Err(FlockError::WouldBlock);
        }
        self.output.push_back(Pending {
            payload,
            user_type,
            safety,
            more,
        });
        self.flush_output();
        Ok(())
    }

    fn can_send(&self) -> bool {
        if self.space.is_none(self.last_sent) {
            return true;
        }
        let aru = self.input_map.aru_seq();
        let in_flight = if self.space.is_none(aru) {
            self.space.diff(0, self.last_sent) + 1
        } else {
            self.space.diff(aru, self.last_sent)
        };
        in_flight < self.cfg.send_window
    }

    fn flush_output(&mut self) {
        while matches!(self.state, State::Operational | State::Leaving)
            && !self.output.is_empty()
            && self.can_send()
        {
            if self.send_user_one().is_err() {
                break;
            }
        }
    }

    fn next_fifo(&mut self) -> i64 {
        let f = self.fifo_seq;
        self.fifo_seq += 1;
        f
    }

    fn emit(&mut self, m: &Message) -> Result<(), FlockError> {
        let frame = m.encode()?;
        self.transport.send(frame)?;
        self.stats.on_sent(m.kind());
        Ok(())
    }

    /// Send the head of the output queue as a user message. The message is
    /// committed locally even when the transport pushes back; the resend
    /// timer re-broadcasts it.
    fn send_user_one(&mut self) -> Result<(), FlockError> {
        let Some(item) = self.output.front().cloned() else {
            return Ok(());
        };
        let seq = if self.space.is_none(self.last_sent) {
            0
        } else {
            self.space.next(self.last_sent)
        };
        let more = self.output.len() > 1 || item.more;
        let mut hdr = Header {
            version: WIRE_VERSION,
            user_type: item.user_type,
            safety: item.safety,
            flags: if more { flags::MSG_MORE } else { 0 },
            seq_range: 0,
            source: self.id,
            source_view: self.current_view.id(),
            seq,
            aru_seq: self.space.none(),
            fifo_seq: self.next_fifo(),
        };
        // Self-insert first: the declared ARU covers this very message.
        let res = self
            .input_map
            .insert(hdr.clone(), item.payload.clone(), self.resend_tick)?;
        let aru = self.input_map.aru_seq();
        hdr.aru_seq = aru;
        if let Some(key) = res.key {
            if let Some(e) = self.input_map.get_mut(&key) {
                e.hdr.aru_seq = aru;
            }
        }
        self.output.pop_front();
        self.last_sent = seq;
        let _ = self.input_map.set_safe(self.id, aru);
        let msg = Message::User {
            hdr,
            payload: item.payload,
        };
        let sent = self.emit(&msg);
        if let Err(FlockError::WouldBlock) = &sent {
            debug!("{}: transport full, seq {seq} deferred to resend", self.id);
        }
        self.deliver();
        sent
    }

    /// Claim every sequence number up to `up_to` with empty drop messages.
    /// Without this, a member with nothing to say would hold the group ARU
    /// at undefined forever.
    fn complete_user(&mut self, up_to: Seqno) {
        while self.space.is_none(self.last_sent) || self.space.lt_raw(self.last_sent, up_to) {
            let seq = if self.space.is_none(self.last_sent) {
                0
            } else {
                self.space.next(self.last_sent)
            };
            let mut hdr = Header {
                version: WIRE_VERSION,
                user_type: 0,
                safety: Safety::Drop,
                flags: 0,
                seq_range: 0,
                source: self.id,
                source_view: self.current_view.id(),
                seq,
                aru_seq: self.space.none(),
                fifo_seq: self.next_fifo(),
            };
            let res = match self.input_map.insert(hdr.clone(), Bytes::new(), self.resend_tick) {
                Ok(r) => r,
                Err(e) => {
                    self.fatal(&format!("self insert failed: {e}"));
                    return;
                }
            };
            let aru = self.input_map.aru_seq();
            hdr.aru_seq = aru;
            if let Some(key) = res.key {
                if let Some(e) = self.input_map.get_mut(&key) {
                    e.hdr.aru_seq = aru;
                }
            }
            self.last_sent = seq;
            let _ = self.input_map.set_safe(self.id, aru);
            let msg = Message::User {
                hdr,
                payload: Bytes::new(),
            };
            let _ = self.emit(&msg);
        }
        self.deliver();
    }

    // ---- inbound dispatch ----------------------------------------------

    /// Entry point for raw frames from the transport. Undecodable or
    /// foreign-version frames are counted and dropped.
    pub fn handle_msg(&mut self, frame: &[u8]) {
        match Message::unserialize_from(frame, 0) {
            Ok((m, _)) => self.handle_message(m),
            Err(e) => {
                self.stats.codec_errors += 1;
                warn!("{}: dropping undecodable frame: {e}", self.id);
            }
        }
    }

    /// Entry point for decoded messages.
    pub fn handle_message(&mut self, m: Message) {
        if self.poisoned || self.state == State::Closed {
            return;
        }
        if m.header().version != WIRE_VERSION {
            self.stats.codec_errors += 1;
            return;
        }
        self.stats.on_received(m.kind());
        match m {
            Message::User { hdr, payload } => self.handle_user(hdr, payload),
            Message::Delegate { .. } => self.handle_delegate(m),
            Message::Gap { .. } => self.handle_gap(m),
            Message::Join { .. } => self.handle_join(m),
            Message::Install { .. } => self.handle_install(m),
            Message::Leave { .. } => self.handle_leave(m),
        }
    }

    /// Control-plane ordering: per-link fifo means an older control message
    /// arriving after a newer one is stale. Returns true if `m` is stale
    /// and records its fifo seq otherwise.
    fn fifo_stale(&mut self, m: &Message) -> bool {
        let fifo = m.fifo_seq();
        let stale = {
            let p = self.peer_mut(m.source());
            if fifo <= p.fifo_seq {
                true
            } else {
                p.fifo_seq = fifo;
                false
            }
        };
        if stale {
            self.stats.stale_fifo_drops += 1;
        }
        stale
    }

    fn peer_mut(&mut self, id: NodeId) -> &mut crate::node::Peer {
        self.peers.ensure(id, self.consensus_tick, self.space.none());
        self.peers.get_mut(&id).expect("peer just ensured")
    }

    fn touch_peer(&mut self, id: NodeId) {
        let tick = self.consensus_tick;
        let p = self.peer_mut(id);
        p.tick = tick;
        p.marked_inactive = false;
    }

    /// Fold a peer's declared group ARU into the safe tracking and its
    /// record.
    fn note_declared_aru(&mut self, id: NodeId, seq: Seqno) {
        if self.space.is_defined(seq) {
            self.peer_mut(id).safe_seq = seq;
        }
        if self.input_map.is_registered(&id) {
            let _ = self.input_map.set_safe(id, seq);
        }
    }

    // ---- user messages -------------------------------------------------

    fn handle_user(&mut self, hdr: Header, payload: Bytes) {
        let src = hdr.source;
        if src == self.id {
            return; // own frame echoed back
        }
        if self.peers.get(&src).is_none() {
            // Membership is introduced by JOIN only; a stray user message
            // from a sender we do not know is dropped. If the sender is
            // real, its join announcements will get through.
            self.stats.unknown_source_drops += 1;
            debug!("{}: user message from unknown {src} dropped", self.id);
            return;
        }
        self.touch_peer(src);
        if matches!(self.state, State::Joining) {
            return;
        }
        if hdr.source_view != self.current_view.id() {
            let pending_view = self
                .install_message
                .as_ref()
                .is_some_and(|im| im.source_view() == hdr.source_view);
            if self.state == State::Recovery && pending_view {
                // Sent in the view we are about to install; replay later.
                self.pending_new_view.push_back((hdr, payload));
            } else {
                self.stats.foreign_view_drops += 1;
                debug!("{}: user message from foreign view dropped", self.id);
            }
            return;
        }
        if !self.input_map.is_registered(&src) {
            self.stats.foreign_view_drops += 1;
            return;
        }

        let prev_aru = self.input_map.aru_seq();
        let resend = hdr.flags & flags::RESEND != 0;
        let more = hdr.flags & flags::MSG_MORE != 0;
        let (seq, declared_aru) = (hdr.seq, hdr.aru_seq);
        let res = match self.input_map.insert(hdr, payload, self.resend_tick) {
            Ok(r) => r,
            Err(e) => {
                self.fatal(&format!("input map insert: {e}"));
                return;
            }
        };
        match res.outcome {
            InsertOutcome::OutOfWindow => {
                self.stats.window_drops += 1;
                warn!("{}: seq {seq} from {src} outside window", self.id);
                return;
            }
            InsertOutcome::Duplicate => {
                self.stats.duplicate_drops += 1;
                return;
            }
            InsertOutcome::Stored => {}
        }

        self.note_declared_aru(src, declared_aru);
        self.deliver();

        // Ask for anything this source is now known to owe us. Resent
        // frames answer requests; do not answer them with more requests.
        if !resend {
            if let Some(gap) = self.input_map.gap_of(&src) {
                self.send_gap_request(src, gap);
            }
        }

        let aru_now = self.input_map.aru_seq();
        if self.state == State::Operational {
            if self.output.is_empty()
                && !more
                && (self.space.is_none(self.last_sent)
                    || self.space.gt_raw(seq, self.last_sent))
            {
                self.complete_user(seq);
            } else if self.output.is_empty() {
                if aru_now != prev_aru {
                    self.send_gap_ack();
                }
            } else {
                self.flush_output();
            }
        }
        if self.state == State::Recovery {
            self.send_join_if_changed();
            self.maybe_complete_install();
        }
    }

    fn handle_delegate(&mut self, m: Message) {
        let Message::Delegate { hdr, inner } = m else {
            return;
        };
        if hdr.source == self.id {
            return;
        }
        if self.peers.get(&hdr.source).is_some() {
            self.touch_peer(hdr.source);
        }
        match Message::unserialize_from(&inner, 0) {
            Ok((Message::User { hdr, payload }, _)) => self.handle_user(hdr, payload),
            Ok(_) => {
                self.stats.codec_errors += 1;
                warn!("{}: delegate wrapping a non-user message", self.id);
            }
            Err(e) => {
                self.stats.codec_errors += 1;
                warn!("{}: undecodable delegate payload: {e}", self.id);
            }
        }
    }

    // ---- delivery ------------------------------------------------------

    /// Walk the input map in `(seq, source)` order and deliver whatever its
    /// safety level allows. Entries stay resident until the group safe seq
    /// covers them, then they are erased.
    fn deliver(&mut self) {
        let aru = self.input_map.aru_logical();
        let safe = self.input_map.safe_logical();
        let mut cursor = self.input_map.first_key();
        while let Some(key) = cursor {
            let next = self.input_map.next_key(&key);
            let logical = key.logical;
            let src_aru = self.input_map.aru_logical_of(&key.source());
            let mut up: Option<(Bytes, UpMeta)> = None;
            let mut erase = false;
            if let Some(e) = self.input_map.get_mut(&key) {
                let ready = match e.hdr.safety {
                    Safety::Drop | Safety::Unreliable => true,
                    Safety::Fifo => src_aru.is_some_and(|a| a >= logical),
                    Safety::Agreed => aru.is_some_and(|a| a >= logical),
                    Safety::Safe => safe.is_some_and(|s| s >= logical),
                };
                if ready && !e.delivered {
                    e.delivered = true;
                    if e.hdr.safety != Safety::Drop {
                        up = Some((
                            e.payload.clone(),
                            UpMeta::payload(e.hdr.source, e.hdr.user_type, e.hdr.source_view),
                        ));
                    }
                }
                erase = e.delivered && safe.is_some_and(|s| s >= logical);
            }
            if let Some((payload, meta)) = up {
                self.stats.delivered_payloads += 1;
                self.upper.handle_up(Some(&payload), &meta);
            }
            if erase {
                self.input_map.erase(&key);
            }
            cursor = next;
        }
    }

    /// Flush every remaining undelivered message of the outgoing view, in
    /// order, regardless of safety gates. Runs right before the
    /// transitional view is announced; recovery has already made the
    /// surviving members agree on this content.
    fn deliver_trans(&mut self) {
        let mut cursor = self.input_map.first_key();
        while let Some(key) = cursor {
            let next = self.input_map.next_key(&key);
            let mut up: Option<(Bytes, UpMeta)> = None;
            if let Some(e) = self.input_map.get_mut(&key) {
                if !e.delivered && e.hdr.safety != Safety::Drop {
                    up = Some((
                        e.payload.clone(),
                        UpMeta::payload(e.hdr.source, e.hdr.user_type, e.hdr.source_view),
                    ));
                }
                e.delivered = true;
            }
            if let Some((payload, meta)) = up {
                self.stats.delivered_payloads += 1;
                self.upper.handle_up(Some(&payload), &meta);
            }
            self.input_map.erase(&key);
            cursor = next;
        }
    }

    fn deliver_view(&mut self, view: View) {
        self.stats.delivered_views += 1;
        self.upper
            .handle_up(None, &UpMeta::view_change(self.id, view));
    }

    // ---- gaps ----------------------------------------------------------

    fn send_gap_ack(&mut self) {
        let aru = self.input_map.aru_seq();
        let m = Message::gap(
            self.id,
            self.current_view.id(),
            aru,
            self.next_fifo(),
            NodeId::nil(),
            SeqRange::new(self.space.none(), self.space.none()),
        );
        let _ = self.emit(&m);
        let _ = self.input_map.set_safe(self.id, aru);
        self.deliver();
    }

    /// Ack for a pending install: the gap names the new view. It carries no
    /// ARU — the old view's ARU would be meaningless under the new view id.
    fn send_install_ack(&mut self, pending: ViewId) {
        let m = Message::gap(
            self.id,
            pending,
            self.space.none(),
            self.next_fifo(),
            NodeId::nil(),
            SeqRange::new(self.space.none(), self.space.none()),
        );
        let _ = self.emit(&m);
    }

    fn send_gap_request(&mut self, source: NodeId, range: SeqRange) {
        debug!("{}: requesting {range} from {source}", self.id);
        let aru = self.input_map.aru_seq();
        let m = Message::gap(
            self.id,
            self.current_view.id(),
            aru,
            self.next_fifo(),
            source,
            range,
        );
        let _ = self.emit(&m);
        let _ = self.input_map.set_safe(self.id, aru);
    }

    fn handle_gap(&mut self, m: Message) {
        let src = m.source();
        if src == self.id {
            return;
        }
        if self.peers.get(&src).is_none() {
            self.stats.unknown_source_drops += 1;
            debug!("{}: gap from unknown {src} dropped", self.id);
            return;
        }
        if self.fifo_stale(&m) {
            return;
        }
        self.touch_peer(src);
        let Message::Gap {
            hdr,
            gap_source,
            range,
        } = m
        else {
            return;
        };

        if self.state == State::Recovery {
            if let Some(pending) = self.install_message.as_ref().map(|im| im.source_view()) {
                if hdr.source_view == pending {
                    // Install acknowledgement.
                    self.peer_mut(src).installed = true;
                    self.note_declared_aru(src, hdr.aru_seq);
                    self.deliver();
                    self.maybe_complete_install();
                    return;
                }
            }
        }
        if hdr.source_view != self.current_view.id() {
            self.stats.foreign_view_drops += 1;
            return;
        }
        if matches!(self.state, State::Joining) {
            return;
        }
        if !gap_source.is_nil() {
            self.resend_range(gap_source, range);
        }
        self.note_declared_aru(src, hdr.aru_seq);
        self.deliver();
        if self.state == State::Operational {
            self.flush_output();
        }
        if self.state == State::Recovery {
            self.maybe_complete_install();
        }
    }

    /// Re-multicast stored messages of `source` within `range`. Own
    /// messages go out directly; anything we hold for another node is
    /// forwarded wrapped in DELEGATE, since the requester evidently cannot
    /// reach that node right now.
    fn resend_range(&mut self, source: NodeId, range: SeqRange) {
        let keys = self.input_map.keys_in_range(&source, range);
        for key in keys {
            let Some(e) = self.input_map.get(&key) else {
                continue;
            };
            let mut hdr = e.hdr.clone();
            let payload = e.payload.clone();
            hdr.flags |= flags::RESEND;
            if source == self.id {
                hdr.aru_seq = self.input_map.aru_seq();
                let msg = Message::User { hdr, payload };
                if self.emit(&msg).is_ok() {
                    self.stats.resends += 1;
                }
            } else {
                let inner = Message::User { hdr, payload };
                let Ok(frame) = inner.encode() else { continue };
                let fifo = self.next_fifo();
                let msg = Message::delegate(self.id, self.current_view.id(), fifo, frame);
                if self.emit(&msg).is_ok() {
                    self.stats.delegate_forwards += 1;
                }
            }
            if let Some(e) = self.input_map.get_mut(&key) {
                e.tick = self.resend_tick;
            }
        }
    }

    // ---- join / recovery -----------------------------------------------

    /// Announce our picture of the group. With `handle_own`, the message is
    /// also fed back into the engine, which is what drives a lone node all
    /// the way to its singleton view.
    pub fn send_join(&mut self, handle_own: bool) {
        if self.poisoned || matches!(self.state, State::Closed | State::Leaving) {
            return;
        }
        let mut m = self.build_join();
        m.header_mut().fifo_seq = self.next_fifo();
        if let Err(e) = self.emit(&m) {
            warn!("{}: join announcement deferred: {e}", self.id);
        }
        self.last_sent_join = Some(m.clone());
        if handle_own {
            self.handle_join(m);
        }
    }

    fn build_join(&self) -> Message {
        let mut nodes = MemberMap::new();
        for (id, p) in self.peers.iter() {
            let (safe_seq, range) = if self.input_map.is_registered(id) {
                (
                    self.input_map.safe_of(id).unwrap_or(self.space.none()),
                    self.input_map
                        .range_of(id)
                        .unwrap_or(SeqRange::new(0, self.space.none())),
                )
            } else {
                (self.space.none(), SeqRange::new(0, self.space.none()))
            };
            nodes.insert(
                *id,
                JoinEntry {
                    name: p.name.clone(),
                    operational: p.is_operational(),
                    left: p.leaving,
                    safe_seq,
                    range,
                },
            );
        }
        Message::join(
            self.id,
            self.current_view.id(),
            self.last_sent,
            self.input_map.aru_seq(),
            0,
            nodes,
        )
    }

    /// Joins compare on protocol content: the fifo stamp differs per
    /// emission and node names are cosmetic.
    fn join_content_eq(a: &Message, b: &Message) -> bool {
        let (ha, hb) = (a.header(), b.header());
        if ha.source != hb.source
            || ha.source_view != hb.source_view
            || ha.seq != hb.seq
            || ha.aru_seq != hb.aru_seq
        {
            return false;
        }
        match (a.nodes(), b.nodes()) {
            (Some(na), Some(nb)) => {
                na.len() == nb.len()
                    && na.iter().zip(nb.iter()).all(|((ia, ra), (ib, rb))| {
                        ia == ib
                            && ra.operational == rb.operational
                            && ra.left == rb.left
                            && ra.safe_seq == rb.safe_seq
                            && ra.range == rb.range
                    })
            }
            _ => false,
        }
    }

    fn send_join_if_changed(&mut self) {
        if self.state != State::Recovery {
            return;
        }
        let candidate = self.build_join();
        if let Some(prev) = &self.last_sent_join {
            if Self::join_content_eq(prev, &candidate) {
                return;
            }
        }
        self.send_join(true);
    }

    fn handle_join(&mut self, m: Message) {
        let src = m.source();
        let is_self = src == self.id;
        self.peers.ensure(src, self.consensus_tick, self.space.none());
        if self.fifo_stale(&m) {
            return;
        }
        self.touch_peer(src);
        if self
            .peers
            .get(&src)
            .is_some_and(|p| p.join_message.as_ref() == Some(&m))
        {
            self.stats.duplicate_drops += 1;
            return;
        }
        match self.state {
            State::Closed => return,
            State::Leaving => {
                self.peer_mut(src).join_message = Some(m);
                return;
            }
            State::Joining | State::Operational => {
                // A join always opens a recovery round. Our own answer goes
                // out as part of the shift, unless this is our own join
                // already being processed.
                self.shift_to_recovery(!is_self);
            }
            State::Recovery => {}
        }

        let same_view = m.source_view() == self.current_view.id();
        let Message::Join { nodes, .. } = &m else {
            return;
        };
        let nodes = nodes.clone();

        {
            let p = self.peer_mut(src);
            p.operational = true;
            p.leaving = false;
            if let Some(rec) = nodes.get(&src) {
                if p.name.is_empty() {
                    p.name = rec.name.clone();
                }
                if same_view {
                    p.expected_range = Some(rec.range);
                }
            }
            p.join_message = Some(m.clone());
        }

        // Fold in what the sender knows: unseen nodes, and leaves we
        // missed. Mere inactivity claims are not adopted; our own timers
        // decide that.
        for (id, rec) in &nodes {
            let is_new = self
                .peers
                .ensure(*id, self.consensus_tick, self.space.none());
            let p = self.peers.get_mut(id).expect("peer just ensured");
            if p.name.is_empty() && !rec.name.is_empty() {
                p.name = rec.name.clone();
            }
            if is_new {
                p.operational = rec.operational;
                p.leaving = rec.left;
            } else if rec.left && !p.leaving && *id != self.id {
                p.leaving = true;
                p.operational = false;
            }
        }

        if same_view && !is_self {
            self.note_declared_aru(src, m.aru_seq());
            // Re-send whatever the sender is missing of the traffic we
            // hold. Their declared low is the first seq they still need.
            let mut to_resend: Vec<(NodeId, SeqRange)> = Vec::new();
            for (id, rec) in &nodes {
                if !self.input_map.is_registered(id) {
                    continue;
                }
                let our_high = self.input_map.high_of(id).unwrap_or(self.space.none());
                if self.space.is_none(our_high) {
                    continue;
                }
                let low = rec.range.low;
                if !self.space.gt_raw(low, our_high) {
                    to_resend.push((*id, SeqRange::new(low, our_high)));
                }
            }
            for (id, range) in to_resend {
                self.resend_range(id, range);
            }
            self.deliver();
        }

        if self.install_message.is_some() && !self.is_consistent(&m) {
            debug!("{}: pending install invalidated by join from {src}", self.id);
            self.install_message = None;
            self.pending_new_view.clear();
            for (_, p) in self.peers.iter_mut() {
                p.installed = false;
            }
        }

        if self.is_consensus() {
            if self.peers.representative() == Some(self.id) && self.install_message.is_none() {
                self.send_install();
            }
        } else {
            self.send_join_if_changed();
        }
        self.maybe_complete_install();
    }

    /// A JOIN or INSTALL is consistent when it sees the same group we do:
    /// equal operational and left sets, and — when it talks about our very
    /// view — the same group ARU and the same per-source message ranges.
    fn is_consistent(&self, m: &Message) -> bool {
        let Some(nodes) = m.nodes() else {
            return false;
        };
        let m_ops: Vec<NodeId> = nodes
            .iter()
            .filter(|(_, r)| r.operational)
            .map(|(id, _)| *id)
            .collect();
        let my_ops = self.peers.operational_ids();
        if m_ops != my_ops {
            return false;
        }
        let m_left: Vec<NodeId> = nodes
            .iter()
            .filter(|(_, r)| r.left)
            .map(|(id, _)| *id)
            .collect();
        let my_left: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.leaving)
            .map(|(id, _)| *id)
            .collect();
        if m_left != my_left {
            return false;
        }
        if m.source_view() == self.current_view.id() {
            if m.aru_seq() != self.input_map.aru_seq() {
                return false;
            }
            for (id, rec) in nodes {
                if !self.input_map.is_registered(id) {
                    continue;
                }
                match self.input_map.range_of(id) {
                    Ok(r) if r == rec.range => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// Consensus: every operational peer (ourselves included) has an
    /// up-to-date JOIN consistent with our own picture.
    fn is_consensus(&self) -> bool {
        for (_, p) in self.peers.iter() {
            if !p.is_operational() {
                continue;
            }
            let Some(jm) = &p.join_message else {
                return false;
            };
            if !self.is_consistent(jm) {
                return false;
            }
        }
        true
    }

    // ---- install -------------------------------------------------------

    fn send_install(&mut self) {
        let mut base: Option<u32> = self
            .view_installed
            .then(|| self.current_view.id().seq());
        for (id, p) in self.peers.iter() {
            if *id == self.id {
                continue;
            }
            if let Some(jm) = &p.join_message {
                let s = jm.source_view().seq();
                base = Some(base.map_or(s, |b| b.max(s)));
            }
        }
        let vid = ViewId::new(self.id, base.map_or(0, |b| b.wrapping_add(1)));
        let nodes = match self.build_join() {
            Message::Join { nodes, .. } => nodes,
            _ => return,
        };
        info!("{}: proposing view {vid}", self.id);
        let m = Message::install(
            self.id,
            vid,
            self.last_sent,
            self.input_map.aru_seq(),
            self.next_fifo(),
            nodes,
        );
        if let Err(e) = self.emit(&m) {
            warn!("{}: install deferred: {e}", self.id);
        }
        self.handle_install(m);
    }

    fn handle_install(&mut self, m: Message) {
        let src = m.source();
        if src != self.id && self.peers.get(&src).is_none() {
            self.stats.unknown_source_drops += 1;
            debug!("{}: install from unknown {src} dropped", self.id);
            return;
        }
        if self.fifo_stale(&m) {
            return;
        }
        self.touch_peer(src);
        if self.install_message.as_ref() == Some(&m) {
            self.stats.duplicate_drops += 1;
            return;
        }
        if self.state != State::Recovery {
            debug!("{}: install ignored in state {}", self.id, self.state);
            return;
        }
        if self.peers.representative() != Some(src) {
            warn!("{}: install from non-representative {src}", self.id);
            return;
        }
        if !self.is_consistent(&m) {
            debug!("{}: inconsistent install from {src}", self.id);
            if src != self.id {
                self.send_join_if_changed();
            }
            return;
        }
        let pending = m.source_view();
        self.install_message = Some(m);
        for (_, p) in self.peers.iter_mut() {
            p.installed = false;
        }
        self.peer_mut(self.id).installed = true;
        self.send_install_ack(pending);
        self.maybe_complete_install();
    }

    /// Complete the pending install once every member of the forming view
    /// has acknowledged it and our input map has caught up with what the
    /// same-view members declared they sent.
    fn maybe_complete_install(&mut self) {
        if self.state != State::Recovery {
            return;
        }
        let Some(im) = &self.install_message else {
            return;
        };
        let Some(nodes) = im.nodes() else {
            return;
        };
        for (id, rec) in nodes {
            if !rec.operational {
                continue;
            }
            match self.peers.get(id) {
                Some(p) if p.installed => {}
                _ => return,
            }
            if !self.input_map.is_registered(id) {
                continue;
            }
            if let Some(p) = self.peers.get(id) {
                if let Some(declared) = p.expected_range {
                    if self.space.is_none(declared.high) {
                        continue;
                    }
                    let ours = self.input_map.aru_of(id).unwrap_or(self.space.none());
                    if self.space.is_none(ours) || self.space.lt_raw(ours, declared.high) {
                        return;
                    }
                }
            }
        }
        self.install_view();
    }

    fn install_view(&mut self) {
        let Some(im) = self.install_message.clone() else {
            return;
        };
        let Some(nodes) = im.nodes() else {
            return;
        };
        let nodes = nodes.clone();
        let old = self.current_view.clone();
        let new_id = im.source_view();

        // Everything of the outgoing view that can still be delivered goes
        // up now, before the transitional view.
        self.deliver_trans();

        let name_of = |id: &NodeId, rec: &JoinEntry, peers: &PeerIndex| -> String {
            if !rec.name.is_empty() {
                return rec.name.clone();
            }
            peers.get(id).map(|p| p.name.clone()).unwrap_or_default()
        };

        let mut reg = View::new(ViewKind::Reg, new_id);
        for (id, rec) in &nodes {
            if rec.operational {
                let _ = reg.add_member(*id, &name_of(id, rec, &self.peers));
            }
        }
        for (id, rec) in &nodes {
            if rec.left {
                let _ = reg.add_left(*id, &name_of(id, rec, &self.peers));
            }
        }
        if self.view_installed {
            for (id, name) in old.members().iter() {
                if !reg.is_member(id) && !reg.left().contains(id) {
                    let _ = reg.add_partitioned(*id, name);
                }
            }
            let mut joined: Vec<(NodeId, String)> = Vec::new();
            for (id, name) in reg.members().iter() {
                if !old.is_member(id) {
                    joined.push((*id, name.to_owned()));
                }
            }
            for (id, name) in joined {
                let _ = reg.add_joined(id, &name);
            }

            let mut trans = View::new(ViewKind::Trans, old.id());
            for (id, name) in old.members().iter() {
                if reg.is_member(id) {
                    let _ = trans.add_member(*id, name);
                }
            }
            for (id, name) in reg.left().iter() {
                if old.is_member(id) {
                    let _ = trans.add_left(*id, name);
                }
            }
            for (id, name) in reg.partitioned().iter() {
                let _ = trans.add_partitioned(*id, name);
            }
            self.deliver_view(trans);
        } else {
            // First install: everything is newly joined, no transitional
            // view precedes it.
            let members: Vec<(NodeId, String)> = reg
                .members()
                .iter()
                .map(|(id, n)| (*id, n.to_owned()))
                .collect();
            for (id, name) in members {
                let _ = reg.add_joined(id, &name);
            }
        }

        info!("{}: installed {reg}", self.id);
        self.current_view = reg.clone();
        self.view_installed = true;
        self.deliver_view(reg);

        // Reset the message machinery for the new view.
        self.input_map.clear();
        let member_ids: Vec<NodeId> = self.current_view.members().ids().copied().collect();
        for id in &member_ids {
            let _ = self.input_map.insert_sa(*id);
        }
        self.last_sent = self.space.none();
        self.peers.retain(|id| member_ids.contains(id));
        for (_, p) in self.peers.iter_mut() {
            p.installed = false;
        }
        self.state = State::Operational;

        let backlog: Vec<(Header, Bytes)> = self.pending_new_view.drain(..).collect();
        for (hdr, payload) in backlog {
            self.handle_user(hdr, payload);
        }
        self.flush_output();
    }

    // ---- leave ---------------------------------------------------------

    /// Announce an orderly leave and close. Must be in LEAVING.
    pub fn send_leave(&mut self) {
        if self.poisoned || self.state != State::Leaving {
            warn!("{}: send_leave outside leaving state", self.id);
            return;
        }
        self.flush_output();
        let m = Message::leave(
            self.id,
            self.current_view.id(),
            self.last_sent,
            self.input_map.aru_seq(),
            self.next_fifo(),
        );
        let _ = self.emit(&m);
        // Drain what we can still deliver to ourselves, then say goodbye.
        self.deliver();
        self.deliver_trans();
        if self.view_installed {
            let mut trans = View::new(ViewKind::Trans, self.current_view.id());
            let _ = trans.add_member(self.id, &self.name);
            self.deliver_view(trans);
        }
        info!("{}: left the group", self.id);
        self.state = State::Closed;
    }

    fn handle_leave(&mut self, m: Message) {
        let src = m.source();
        if src == self.id {
            return;
        }
        self.peers.ensure(src, self.consensus_tick, self.space.none());
        if self.fifo_stale(&m) {
            return;
        }
        self.touch_peer(src);
        info!("{}: {src} is leaving", self.id);
        {
            let p = self.peer_mut(src);
            p.leave_message = Some(m.clone());
            p.leaving = true;
            p.operational = false;
        }
        if m.source_view() == self.current_view.id() {
            self.note_declared_aru(src, m.aru_seq());
            self.deliver();
        }
        match self.state {
            State::Operational | State::Recovery | State::Joining => {
                self.shift_to_recovery(true);
            }
            _ => {}
        }
    }

    // ---- timers --------------------------------------------------------

    /// Inactivity bookkeeping and recovery keepalive. Default period 1 s.
    pub fn handle_consensus_timer(&mut self) {
        if self.poisoned || self.state == State::Closed {
            return;
        }
        self.consensus_tick += 1;
        let expired = self.check_inactive();
        if !expired && self.state == State::Recovery {
            // Lost joins stall recovery; re-announce.
            self.send_join(true);
        }
    }

    /// Stalled install round restart. Default period 0.5 s.
    pub fn handle_install_timer(&mut self) {
        if self.poisoned || self.state != State::Recovery {
            return;
        }
        if self.install_message.is_some() {
            debug!("{}: install round timed out, restarting", self.id);
            self.install_message = None;
            for (_, p) in self.peers.iter_mut() {
                p.installed = false;
            }
            self.send_join(true);
        }
    }

    /// Retransmission and ARU acknowledgement. Default period 0.1 s.
    pub fn handle_resend_timer(&mut self) {
        if self.poisoned || matches!(self.state, State::Closed | State::Joining) {
            return;
        }
        self.resend_tick += 1;
        if self.state == State::Operational && !self.output.is_empty() {
            self.flush_output();
        }
        // Re-broadcast own messages above the group safe seq that have not
        // been touched since the previous tick.
        let stale: Vec<_> = self
            .input_map
            .keys_above_safe(&self.id)
            .into_iter()
            .filter(|k| {
                self.input_map
                    .get(k)
                    .is_some_and(|e| e.tick < self.resend_tick)
            })
            .collect();
        if !stale.is_empty() {
            let low = self.input_map.wire_seq(&stale[0]);
            let high = self.input_map.wire_seq(&stale[stale.len() - 1]);
            self.resend_range(self.id, SeqRange::new(low, high));
        }
        // Let the group know where our ARU is, so safe can advance.
        if self.state == State::Operational && self.output.is_empty() {
            let aru = self.input_map.aru_seq();
            let safe = self.input_map.safe_seq();
            if self.space.is_defined(aru)
                && (self.space.is_none(safe) || self.space.lt_raw(safe, aru))
            {
                self.send_gap_ack();
            }
        }
    }

    /// Mark a peer to be expired by the next `check_inactive`. Partition
    /// detection hook for hosts and tests.
    pub fn set_inactive(&mut self, id: NodeId) {
        if id == self.id {
            return;
        }
        self.peer_mut(id).marked_inactive = true;
    }

    /// Expire peers that have been silent too long. Any expiry opens a
    /// recovery round. Returns whether anything expired.
    pub fn check_inactive(&mut self) -> bool {
        let ticks = self.cfg.inactive_ticks();
        let now = self.consensus_tick;
        let my_id = self.id;
        let mut changed = false;
        for (id, p) in self.peers.iter_mut() {
            if *id == my_id || !p.operational {
                continue;
            }
            if p.marked_inactive || now.saturating_sub(p.tick) > ticks {
                warn!("{my_id}: peer {id} inactive");
                p.operational = false;
                changed = true;
            }
        }
        if changed && matches!(self.state, State::Operational | State::Recovery) {
            self.shift_to_recovery(true);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::QueueTransport;
    use crate::message::MessageKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[derive(Default)]
    struct Recorder {
        views: Vec<View>,
        deliveries: Vec<(NodeId, ViewId, Vec<u8>)>,
    }

    impl UpperLayer for Recorder {
        fn handle_up(&mut self, payload: Option<&Bytes>, meta: &UpMeta) {
            if let Some(view) = &meta.view {
                self.views.push(view.clone());
            } else if let Some(p) = payload {
                self.deliveries.push((meta.source, meta.source_view, p.to_vec()));
            }
        }
    }

    type Engine = Proto<QueueTransport, Recorder>;

    fn nid(idx: u32) -> NodeId {
        NodeId::from_index(idx)
    }

    fn engine_cfg(idx: u32, cfg: ProtoConfig) -> Engine {
        Proto::new(
            cfg,
            QueueTransport::new(nid(idx)),
            Recorder::default(),
            &format!("n{idx}"),
        )
        .unwrap()
    }

    fn engine(idx: u32) -> Engine {
        engine_cfg(idx, ProtoConfig::default())
    }

    /// Config for simulations: peers never expire behind the sim's back.
    fn sim_cfg() -> ProtoConfig {
        ProtoConfig {
            inactive_timeout_ms: 3_600_000,
            ..ProtoConfig::default()
        }
    }

    fn pop_frame(e: &mut Engine) -> Option<Message> {
        e.transport_mut()
            .poll()
            .map(|f| Message::unserialize_from(&f, 0).unwrap().0)
    }

    fn expect_kind(e: &mut Engine, kind: MessageKind) -> Message {
        let m = pop_frame(e).expect("expected an emitted frame");
        assert_eq!(m.kind(), kind, "unexpected emission {m}");
        m
    }

    fn assert_silent(e: &mut Engine) {
        if let Some(m) = pop_frame(e) {
            panic!("unexpected emission {m}");
        }
    }

    fn last_reg(e: &Engine) -> &View {
        e.upper()
            .views
            .iter()
            .rev()
            .find(|v| v.kind() == ViewKind::Reg)
            .expect("no regular view delivered")
    }

    fn member_ids(v: &View) -> Vec<NodeId> {
        v.members().ids().copied().collect()
    }

    /// Exactly one TRANS between any two consecutive REG views.
    fn assert_view_discipline(e: &Engine) {
        let kinds: Vec<ViewKind> = e.upper().views.iter().map(|v| v.kind()).collect();
        let mut last_reg_seen = false;
        let mut trans_since_reg = 0;
        for k in kinds {
            match k {
                ViewKind::Reg => {
                    if last_reg_seen {
                        assert_eq!(trans_since_reg, 1, "REG views without exactly one TRANS");
                    }
                    last_reg_seen = true;
                    trans_since_reg = 0;
                }
                ViewKind::Trans => trans_since_reg += 1,
                _ => {}
            }
        }
    }

    /// No (source, view, payload) delivered twice.
    fn assert_no_duplicate_delivery(e: &Engine) {
        let mut seen = std::collections::BTreeSet::new();
        for d in &e.upper().deliveries {
            assert!(seen.insert(d.clone()), "duplicate delivery {d:?}");
        }
    }

    fn boot_single(e: &mut Engine) -> (Message, Message, Message) {
        e.connect().unwrap();
        let jm = expect_kind(e, MessageKind::Join);
        let im = expect_kind(e, MessageKind::Install);
        let gm = expect_kind(e, MessageKind::Gap);
        assert_silent(e);
        assert_eq!(e.state(), State::Operational);
        (jm, im, gm)
    }

    #[test]
    fn single_node_boot() {
        let mut e = engine(1);
        let (jm, _im, _gm) = boot_single(&mut e);

        let reg = last_reg(&e);
        assert_eq!(reg.id(), ViewId::new(nid(1), 0));
        assert_eq!(member_ids(reg), [nid(1)]);
        assert_eq!(e.upper().views.len(), 1, "singleton boot has no TRANS view");

        // Re-handling our own join must change nothing and emit nothing.
        e.handle_message(jm);
        assert_silent(&mut e);
        assert_eq!(e.state(), State::Operational);
    }

    /// The canonical two-node join exchange, asserting each emission.
    fn boot_pair(e1: &mut Engine, e2: &mut Engine) {
        boot_single(e1);

        e2.shift_to(State::Joining, false);
        e2.send_join(false);
        assert_eq!(e2.state(), State::Joining);
        let jm2 = expect_kind(e2, MessageKind::Join);
        assert_silent(e2);

        e1.handle_message(jm2);
        assert_eq!(e1.state(), State::Recovery);
        let jm1 = expect_kind(e1, MessageKind::Join);
        assert_silent(e1);

        e2.handle_message(jm1);
        assert_eq!(e2.state(), State::Recovery);
        let jm2b = expect_kind(e2, MessageKind::Join);
        assert_silent(e2);

        e1.handle_message(jm2b);
        assert_eq!(e1.state(), State::Recovery);
        let im = expect_kind(e1, MessageKind::Install);
        let gm1 = expect_kind(e1, MessageKind::Gap);
        assert_silent(e1);

        e2.handle_message(im);
        assert_eq!(e2.state(), State::Recovery);
        let gm2 = expect_kind(e2, MessageKind::Gap);
        assert_silent(e2);

        e1.handle_message(gm2);
        assert_eq!(e1.state(), State::Operational);
        assert_silent(e1);

        e2.handle_message(gm1);
        assert_eq!(e2.state(), State::Operational);
        assert_silent(e2);
    }

    #[test]
    fn two_node_boot() {
        let mut e1 = engine(1);
        let mut e2 = engine(2);
        boot_pair(&mut e1, &mut e2);

        for e in [&e1, &e2] {
            let reg = last_reg(e);
            assert_eq!(reg.id(), ViewId::new(nid(1), 1));
            assert_eq!(member_ids(reg), [nid(1), nid(2)]);
            assert_view_discipline(e);
        }
        // n1 sees n2 join; n2's first regular view is the joint one.
        assert_eq!(
            last_reg(&e1).joined().ids().copied().collect::<Vec<_>>(),
            [nid(2)]
        );
        let trans: Vec<&View> = e1
            .upper()
            .views
            .iter()
            .filter(|v| v.kind() == ViewKind::Trans)
            .collect();
        assert_eq!(trans.len(), 1);
        assert_eq!(trans[0].id(), ViewId::new(nid(1), 0));
        assert_eq!(member_ids(trans[0]), [nid(1)]);
    }

    #[test]
    fn basic_user_message_exchange() {
        let mut e1 = engine(1);
        let mut e2 = engine(2);
        boot_pair(&mut e1, &mut e2);
        let space = SeqnoSpace::new(ProtoConfig::default().seqno_max);

        e1.send(Bytes::from_static(b"zero"), 0x10, Safety::Safe, false)
            .unwrap();
        let um1 = expect_kind(&mut e1, MessageKind::User);
        assert_silent(&mut e1);
        assert_eq!(um1.seq(), 0);
        assert_eq!(um1.aru_seq(), space.none());
        assert!(e1.upper().deliveries.is_empty(), "safe before acknowledgement");

        // The receiver has nothing to say, so it claims its own seq 0 with
        // an empty drop message carrying its new ARU.
        e2.handle_message(um1);
        let um2 = expect_kind(&mut e2, MessageKind::User);
        assert_silent(&mut e2);
        assert_eq!(um2.seq(), 0);
        assert_eq!(um2.aru_seq(), 0);
        assert_eq!(um2.header().safety, Safety::Drop);
        assert!(e2.upper().deliveries.is_empty());

        // The original sender acknowledges the ARU with a gap.
        e1.handle_message(um2);
        let gm = expect_kind(&mut e1, MessageKind::Gap);
        assert_silent(&mut e1);
        assert_eq!(gm.aru_seq(), 0);
        assert_eq!(e1.upper().deliveries.len(), 1);
        assert_eq!(e1.upper().deliveries[0].0, nid(1));
        assert_eq!(e1.upper().deliveries[0].2, b"zero");

        e2.handle_message(gm);
        assert_silent(&mut e2);
        assert_eq!(e2.upper().deliveries.len(), 1);
        assert_eq!(e2.upper().deliveries[0].2, b"zero");

        assert_no_duplicate_delivery(&e1);
        assert_no_duplicate_delivery(&e2);
    }

    #[test]
    fn duplicate_control_messages_are_idempotent() {
        let mut e1 = engine(1);
        let mut e2 = engine(2);
        boot_single(&mut e1);

        e2.shift_to(State::Joining, false);
        e2.send_join(false);
        let jm2 = expect_kind(&mut e2, MessageKind::Join);

        e1.handle_message(jm2.clone());
        assert_eq!(e1.state(), State::Recovery);
        let jm1 = expect_kind(&mut e1, MessageKind::Join);
        assert_silent(&mut e1);

        e2.handle_message(jm1.clone());
        let jm2b = expect_kind(&mut e2, MessageKind::Join);
        assert_silent(&mut e2);

        // Triple delivery of the same joins: the emission set must equal
        // the single-delivery case (one INSTALL, one GAP).
        e1.handle_message(jm2b.clone());
        e1.handle_message(jm1.clone());
        e1.handle_message(jm2b.clone());
        assert_eq!(e1.state(), State::Recovery);
        let im = expect_kind(&mut e1, MessageKind::Install);
        let gm1 = expect_kind(&mut e1, MessageKind::Gap);
        assert_silent(&mut e1);

        // More duplicates, including the install itself.
        e1.handle_message(jm2b.clone());
        e1.handle_message(jm1.clone());
        e1.handle_message(im.clone());
        assert_eq!(e1.state(), State::Recovery);
        assert_silent(&mut e1);

        e2.handle_message(im.clone());
        assert_eq!(e2.state(), State::Recovery);
        let gm2 = expect_kind(&mut e2, MessageKind::Gap);
        assert_silent(&mut e2);

        e1.handle_message(gm2);
        assert_eq!(e1.state(), State::Operational);
        assert_silent(&mut e1);
        e2.handle_message(gm1);
        assert_eq!(e2.state(), State::Operational);
        assert_silent(&mut e2);

        // Post-install duplicates must not reopen recovery.
        for m in [jm2b.clone(), jm1.clone(), im.clone()] {
            e1.handle_message(m);
        }
        assert_eq!(e1.state(), State::Operational);
        assert_silent(&mut e1);
        for m in [jm2b, jm1, im] {
            e2.handle_message(m);
        }
        assert_eq!(e2.state(), State::Operational);
        assert_silent(&mut e2);
    }

    #[test]
    fn leave_shrinks_the_view() {
        let mut e1 = engine(1);
        let mut e2 = engine(2);
        boot_pair(&mut e1, &mut e2);

        e1.shift_to(State::Leaving, false);
        e1.send_leave();
        assert_eq!(e1.state(), State::Closed);
        let lm = expect_kind(&mut e1, MessageKind::Leave);
        assert_silent(&mut e1);

        e2.handle_message(lm);
        let _jm = expect_kind(&mut e2, MessageKind::Join);
        let _im = expect_kind(&mut e2, MessageKind::Install);
        let _gm = expect_kind(&mut e2, MessageKind::Gap);
        assert_silent(&mut e2);
        assert_eq!(e2.state(), State::Operational);

        let reg = last_reg(&e2);
        assert_eq!(member_ids(reg), [nid(2)]);
        assert_eq!(reg.left().ids().copied().collect::<Vec<_>>(), [nid(1)]);
        assert_view_discipline(&e2);
    }

    #[test]
    fn partition_by_inactivity() {
        let mut e1 = engine(1);
        let mut e2 = engine(2);
        boot_pair(&mut e1, &mut e2);

        e1.set_inactive(nid(2));
        assert!(e1.check_inactive());
        let _jm = expect_kind(&mut e1, MessageKind::Join);
        let _im = expect_kind(&mut e1, MessageKind::Install);
        let _gm = expect_kind(&mut e1, MessageKind::Gap);
        assert_silent(&mut e1);
        assert_eq!(e1.state(), State::Operational);

        let reg = last_reg(&e1);
        assert_eq!(member_ids(reg), [nid(1)]);
        assert_eq!(
            reg.partitioned().ids().copied().collect::<Vec<_>>(),
            [nid(2)]
        );
        assert!(reg.left().is_empty());
        assert_view_discipline(&e1);
    }

    #[test]
    fn send_requires_operational_state() {
        let mut e = engine(1);
        assert_eq!(
            e.send(Bytes::from_static(b"x"), 0, Safety::Safe, false),
            Err(FlockError::NotOperational)
        );
        boot_single(&mut e);
        assert!(e.send(Bytes::from_static(b"x"), 0, Safety::Safe, false).is_ok());
    }

    #[test]
    fn blocked_transport_defers_to_resend_timer() {
        let mut e1 = engine(1);
        let mut e2 = engine(2);
        boot_pair(&mut e1, &mut e2);

        e1.transport_mut().set_blocked(true);
        e1.send(Bytes::from_static(b"held"), 0, Safety::Agreed, false)
            .unwrap();
        assert_silent(&mut e1);

        e1.transport_mut().set_blocked(false);
        e1.handle_resend_timer();
        let m = expect_kind(&mut e1, MessageKind::User);
        assert_eq!(m.seq(), 0);
        assert!(m.header().flags & flags::RESEND != 0);
        let Message::User { payload, .. } = &m else { unreachable!() };
        assert_eq!(payload.as_ref(), b"held");

        // The peer takes the retransmission like a first send.
        e2.handle_message(m);
        let mirror = expect_kind(&mut e2, MessageKind::User);
        assert_eq!(mirror.header().safety, Safety::Drop);
    }

    #[test]
    fn illegal_shift_is_fatal() {
        let mut e = engine(1);
        boot_single(&mut e);
        e.shift_to(State::Joining, false);
        assert_eq!(e.state(), State::Closed);
        // Final view: empty regular membership.
        let v = e.upper().views.last().unwrap();
        assert_eq!(v.kind(), ViewKind::Reg);
        assert!(v.members().is_empty());
        assert_eq!(e.connect(), Err(FlockError::NotOperational));
        assert_eq!(
            e.send(Bytes::new(), 0, Safety::Safe, false),
            Err(FlockError::NotOperational)
        );
    }

    // ---- multi-engine simulation ---------------------------------------

    struct Sim {
        engines: Vec<Engine>,
        sent: Vec<u32>,
        rng: StdRng,
    }

    impl Sim {
        fn new(n: u32, seed: u64) -> Self {
            let engines = (1..=n).map(|i| engine_cfg(i, sim_cfg())).collect();
            Self {
                engines,
                sent: vec![0; n as usize],
                rng: StdRng::seed_from_u64(seed),
            }
        }

        fn add_engine(&mut self) {
            let idx = self.engines.len() as u32 + 1;
            self.engines.push(engine_cfg(idx, sim_cfg()));
            self.sent.push(0);
        }

        /// One frame per engine, multicast to everyone else. Returns
        /// whether anything moved.
        fn pass(&mut self, loss_pct: u32) -> bool {
            let n = self.engines.len();
            let mut moved = false;
            for i in 0..n {
                let Some(frame) = self.engines[i].transport_mut().poll() else {
                    continue;
                };
                moved = true;
                for j in 0..n {
                    if j == i || self.engines[j].state() == State::Closed {
                        continue;
                    }
                    if loss_pct > 0 && self.rng.gen_range(0..100) < loss_pct {
                        if self.rng.gen_range(0..3) == 0 {
                            continue; // drop for this receiver only
                        }
                        break; // drop for all remaining receivers
                    }
                    self.engines[j].handle_msg(&frame);
                }
            }
            moved
        }

        fn drain(&mut self, loss_pct: u32) {
            let mut guard = 0;
            while self.pass(loss_pct) {
                guard += 1;
                assert!(guard < 1_000_000, "simulation did not quiesce");
            }
        }

        fn all_operational(&self) -> bool {
            self.engines
                .iter()
                .all(|e| matches!(e.state(), State::Operational | State::Closed))
        }

        /// Drain and, when stuck short of a stable membership, fire timers.
        fn reach_operational(&mut self) {
            let mut idle_rounds = 0;
            loop {
                self.drain(0);
                if self.all_operational() {
                    return;
                }
                idle_rounds += 1;
                assert!(idle_rounds < 200, "membership did not converge");
                for e in &mut self.engines {
                    e.handle_consensus_timer();
                    e.handle_install_timer();
                    e.handle_resend_timer();
                }
            }
        }

        fn send_random(&mut self, max_per_engine: u32) {
            for i in 0..self.engines.len() {
                if self.engines[i].state() != State::Operational {
                    continue;
                }
                let n = self.rng.gen_range(0..=max_per_engine);
                for _ in 0..n {
                    let count = self.sent[i];
                    let payload = Bytes::copy_from_slice(&count.to_le_bytes());
                    if self.engines[i]
                        .send(payload, 0xab, Safety::Safe, false)
                        .is_ok()
                    {
                        self.sent[i] += 1;
                    }
                }
            }
        }

        /// Deliver everything outstanding, nudging retransmission until
        /// every engine has seen its own messages come back.
        fn flush(&mut self) {
            for _ in 0..300 {
                self.drain(0);
                if self.complete() {
                    return;
                }
                for e in &mut self.engines {
                    e.handle_resend_timer();
                }
            }
            self.assert_complete();
        }

        fn own_delivered(&self, i: usize) -> u32 {
            let id = self.engines[i].self_id();
            self.engines[i]
                .upper()
                .deliveries
                .iter()
                .filter(|(src, _, _)| *src == id)
                .count() as u32
        }

        fn complete(&self) -> bool {
            (0..self.engines.len()).all(|i| self.own_delivered(i) == self.sent[i])
        }

        fn assert_complete(&self) {
            for i in 0..self.engines.len() {
                assert_eq!(
                    self.own_delivered(i),
                    self.sent[i],
                    "engine {} lost its own messages",
                    i + 1
                );
            }
        }

        fn assert_same_view(&self) {
            let mut ids: Vec<ViewId> = self
                .engines
                .iter()
                .filter(|e| e.state() == State::Operational)
                .map(|e| e.current_view().id())
                .collect();
            ids.dedup();
            assert_eq!(ids.len(), 1, "operational engines in different views");
        }
    }

    #[test]
    fn eight_nodes_converge_simultaneously() {
        let mut sim = Sim::new(8, 7);
        for e in &mut sim.engines {
            e.shift_to(State::Joining, false);
            e.send_join(false);
        }
        sim.reach_operational();
        sim.assert_same_view();
        for e in &sim.engines {
            assert_eq!(e.current_view().members().len(), 8);
            assert_view_discipline(e);
        }
    }

    #[test]
    fn eight_nodes_converge_one_by_one() {
        let mut sim = Sim::new(0, 11);
        for n in 1..=8u32 {
            sim.add_engine();
            let e = sim.engines.last_mut().unwrap();
            if n == 1 {
                e.connect().unwrap();
            } else {
                e.shift_to(State::Joining, false);
                e.send_join(false);
            }
            sim.reach_operational();
            sim.assert_same_view();
            assert_eq!(
                sim.engines[0].current_view().members().len(),
                n as usize
            );
        }
        for e in &sim.engines {
            assert_view_discipline(e);
            assert_no_duplicate_delivery(e);
        }
    }

    #[test]
    fn ordered_delivery_across_members() {
        let mut sim = Sim::new(3, 23);
        for e in &mut sim.engines {
            e.shift_to(State::Joining, false);
            e.send_join(false);
        }
        sim.reach_operational();

        for _ in 0..20 {
            sim.send_random(4);
            sim.drain(0);
        }
        sim.flush();
        sim.assert_complete();

        // Safe delivery is totally ordered: every member sees the same
        // sequence of (source, payload).
        let seq0: Vec<(NodeId, Vec<u8>)> = sim.engines[0]
            .upper()
            .deliveries
            .iter()
            .map(|(s, _, p)| (*s, p.clone()))
            .collect();
        for e in &sim.engines[1..] {
            let seq: Vec<(NodeId, Vec<u8>)> = e
                .upper()
                .deliveries
                .iter()
                .map(|(s, _, p)| (*s, p.clone()))
                .collect();
            assert_eq!(seq, seq0, "divergent delivery order");
        }
        for e in &sim.engines {
            assert_no_duplicate_delivery(e);
        }
    }

    #[test]
    fn lossy_run_delivers_everything() {
        let mut sim = Sim::new(8, 42);
        for e in &mut sim.engines {
            e.shift_to(State::Joining, false);
            e.send_join(false);
        }
        sim.reach_operational();

        for _ in 0..50 {
            sim.send_random(8);
            sim.drain(50);
        }
        sim.flush();
        sim.assert_complete();
        for e in &sim.engines {
            assert_no_duplicate_delivery(e);
            assert_view_discipline(e);
        }
    }

    #[test]
    fn leave_one_by_one_from_eight() {
        let mut sim = Sim::new(8, 5);
        for e in &mut sim.engines {
            e.shift_to(State::Joining, false);
            e.send_join(false);
        }
        sim.reach_operational();

        for n in (1..=8usize).rev() {
            sim.send_random(4);
            sim.engines[n - 1].disconnect();
            sim.reach_operational();
            let live = sim
                .engines
                .iter()
                .filter(|e| e.state() == State::Operational)
                .count();
            assert_eq!(live, n - 1);
        }
        for e in &sim.engines {
            assert_view_discipline(e);
            assert_no_duplicate_delivery(e);
        }
    }

    #[test]
    fn partition_then_merge() {
        let mut e1 = engine_cfg(1, sim_cfg());
        let mut e2 = engine_cfg(2, sim_cfg());
        boot_pair(&mut e1, &mut e2);

        // Both sides lose sight of each other.
        e1.set_inactive(nid(2));
        e1.check_inactive();
        e2.set_inactive(nid(1));
        e2.check_inactive();
        while pop_frame(&mut e1).is_some() || pop_frame(&mut e2).is_some() {}
        assert_eq!(e1.state(), State::Operational);
        assert_eq!(e2.state(), State::Operational);
        assert_eq!(member_ids(last_reg(&e1)), [nid(1)]);
        assert_eq!(member_ids(last_reg(&e2)), [nid(2)]);

        // Heal: both restart recovery and exchange traffic.
        e1.shift_to(State::Recovery, true);
        e2.shift_to(State::Recovery, true);
        let mut guard = 0;
        while !(e1.state() == State::Operational && e2.state() == State::Operational) {
            let mut moved = false;
            if let Some(f) = e1.transport_mut().poll() {
                e2.handle_msg(&f);
                moved = true;
            }
            if let Some(f) = e2.transport_mut().poll() {
                e1.handle_msg(&f);
                moved = true;
            }
            if !moved {
                e1.handle_consensus_timer();
                e2.handle_consensus_timer();
                e1.handle_install_timer();
                e2.handle_install_timer();
            }
            guard += 1;
            assert!(guard < 1_000, "merge did not converge");
        }
        assert_eq!(e1.current_view().id(), e2.current_view().id());
        assert_eq!(member_ids(last_reg(&e1)), [nid(1), nid(2)]);
        assert_eq!(member_ids(last_reg(&e2)), [nid(1), nid(2)]);
        assert_view_discipline(&e1);
        assert_view_discipline(&e2);
    }
}
