//! Per-source buffer of received user messages.
//!
//! Each registered source has a sliding receive window anchored just past
//! its ARU ("all received up to") sequence. Entries are held until the group
//! safe sequence covers them, so anything above safe can be re-broadcast on
//! demand.
//!
//! Sequence numbers arrive as circular wire values; internally every stored
//! entry is keyed by a monotone unwrapped u64 so that window arithmetic and
//! iteration order survive wrap-around. The congruence `logical mod bound ==
//! wire` holds for every stored key.
//!
//! Iteration is sequence-major with id-order tie-break, and stable under
//! erasing the position just visited (the cursor API hands out owned keys).

use std::collections::BTreeMap;

use bytes::Bytes;
use log::debug;

use crate::error::FlockError;
use crate::id::NodeId;
use crate::message::Header;
use crate::seqno::{SeqRange, Seqno, SeqnoSpace};

/// Position of a stored entry: unwrapped sequence, then source id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryKey {
    pub(crate) logical: u64,
    pub(crate) source: NodeId,
}

impl EntryKey {
    pub fn source(&self) -> NodeId {
        self.source
    }
}

/// A buffered user message.
#[derive(Debug, Clone)]
pub struct Entry {
    pub hdr: Header,
    pub payload: Bytes,
    /// Resend-tick stamp: set at insert, refreshed on re-broadcast.
    pub tick: u64,
    pub delivered: bool,
}

#[derive(Debug, Default, Clone)]
struct SourceState {
    aru: Option<u64>,
    high: Option<u64>,
    safe: Option<u64>,
}

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    /// Already present; nothing changed.
    Duplicate,
    /// Outside the receive window; dropped.
    OutOfWindow,
}

/// Result of an insert: what happened plus the source's range afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub outcome: InsertOutcome,
    /// `(next missing, highest received)` for the source, in wire values.
    pub range: SeqRange,
    /// Position of the stored entry when the outcome is `Stored`.
    pub key: Option<EntryKey>,
}

pub struct InputMap {
    space: SeqnoSpace,
    sources: BTreeMap<NodeId, SourceState>,
    entries: BTreeMap<EntryKey, Entry>,
}

impl InputMap {
    pub fn new(space: SeqnoSpace) -> Self {
        Self {
            space,
            sources: BTreeMap::new(),
            entries: BTreeMap::new(),
        }
    }

    pub fn space(&self) -> SeqnoSpace {
        self.space
    }

    /// Register a source. Fails with `Duplicate` if already present.
    pub fn insert_sa(&mut self, id: NodeId) -> Result<(), FlockError> {
        if self.sources.contains_key(&id) {
            return Err(FlockError::Duplicate(id));
        }
        self.sources.insert(id, SourceState::default());
        Ok(())
    }

    /// Remove a source and its entries. Fails with `Missing` if absent.
    pub fn erase_sa(&mut self, id: NodeId) -> Result<(), FlockError> {
        if self.sources.remove(&id).is_none() {
            return Err(FlockError::Missing(id));
        }
        self.entries.retain(|k, _| k.source != id);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.sources.clear();
        self.entries.clear();
    }

    pub fn is_registered(&self, id: &NodeId) -> bool {
        self.sources.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn wire(&self, logical: u64) -> Seqno {
        (logical & (self.space.max() as u64 - 1)) as Seqno
    }

    /// Map a wire seq onto the source's unwrapped axis, or `None` when it
    /// falls outside the receive window `[aru+1, aru+window]`.
    fn unwrap_seq(&self, st: &SourceState, seq: Seqno) -> Option<u64> {
        let window = self.space.window() as u64;
        match st.aru {
            None => {
                let l = seq as u64;
                (l < window).then_some(l)
            }
            Some(aru) => {
                let d = self.space.diff(self.wire(aru), seq) as u64;
                (d >= 1 && d <= window).then(|| aru + d)
            }
        }
    }

    fn source_range(&self, st: &SourceState) -> SeqRange {
        let low = match st.aru {
            None => 0,
            Some(a) => self.space.next(self.wire(a)),
        };
        let high = match st.high {
            None => self.space.none(),
            Some(h) => self.wire(h),
        };
        SeqRange::new(low, high)
    }

    /// Store a user message at `(hdr.source, hdr.seq)`.
    pub fn insert(&mut self, hdr: Header, payload: Bytes, tick: u64) -> Result<InsertResult, FlockError> {
        let source = hdr.source;
        let seq = hdr.seq;
        let st = self
            .sources
            .get(&source)
            .ok_or(FlockError::Missing(source))?;

        let Some(logical) = self.unwrap_seq(st, seq) else {
            let range = self.source_range(st);
            debug!("input map: seq {seq} from {source} outside window, dropped");
            return Ok(InsertResult {
                outcome: InsertOutcome::OutOfWindow,
                range,
                key: None,
            });
        };

        let key = EntryKey { logical, source };
        if self.entries.contains_key(&key) {
            let range = self.source_range(st);
            return Ok(InsertResult {
                outcome: InsertOutcome::Duplicate,
                range,
                key: None,
            });
        }

        let (mut aru, high) = (st.aru, st.high);
        self.entries.insert(
            key,
            Entry {
                hdr,
                payload,
                tick,
                delivered: false,
            },
        );

        // Advance the ARU over the now-contiguous prefix.
        let mut next = aru.map_or(0, |a| a + 1);
        while self.entries.contains_key(&EntryKey {
            logical: next,
            source,
        }) {
            aru = Some(next);
            next += 1;
        }
        let st = self.sources.get_mut(&source).expect("source vanished");
        st.aru = aru;
        st.high = Some(high.map_or(logical, |h| h.max(logical)));

        let st = self.sources.get(&source).expect("source vanished");
        Ok(InsertResult {
            outcome: InsertOutcome::Stored,
            range: self.source_range(st),
            key: Some(key),
        })
    }

    /// Record that `id` has declared everything up to `seq` received.
    /// A sentinel `seq` carries no information and is ignored.
    pub fn set_safe(&mut self, id: NodeId, seq: Seqno) -> Result<(), FlockError> {
        if !self.sources.contains_key(&id) {
            return Err(FlockError::Missing(id));
        }
        if self.space.is_none(seq) {
            return Ok(());
        }
        let Some(logical) = self.anchor_wire(seq) else {
            return Ok(());
        };
        let st = self.sources.get_mut(&id).expect("source vanished");
        st.safe = Some(st.safe.map_or(logical, |s| s.max(logical)));
        Ok(())
    }

    /// Unwrap a declared wire seq against the highest sequence seen anywhere.
    /// Declarations that cannot be anchored are treated as stale.
    fn anchor_wire(&self, seq: Seqno) -> Option<u64> {
        let anchor = self
            .sources
            .values()
            .filter_map(|s| s.high.or(s.aru))
            .max()
            .unwrap_or(0);
        let d = self.space.diff(self.wire(anchor), seq) as u64;
        if d < self.space.max() as u64 / 2 {
            Some(anchor + d)
        } else {
            anchor.checked_sub(self.space.max() as u64 - d)
        }
    }

    pub(crate) fn aru_logical(&self) -> Option<u64> {
        let mut min = None;
        for st in self.sources.values() {
            match st.aru {
                None => return None,
                Some(a) => min = Some(min.map_or(a, |m: u64| m.min(a))),
            }
        }
        min
    }

    pub(crate) fn safe_logical(&self) -> Option<u64> {
        let aru = self.aru_logical()?;
        let mut min = None;
        for st in self.sources.values() {
            match st.safe {
                None => return None,
                Some(s) => min = Some(min.map_or(s, |m: u64| m.min(s))),
            }
        }
        min.map(|m| m.min(aru))
    }

    /// Group ARU: the largest sequence every registered source is complete
    /// up to. Sentinel until every source has its seq 0.
    pub fn aru_seq(&self) -> Seqno {
        self.aru_logical()
            .map_or(self.space.none(), |l| self.wire(l))
    }

    /// Group safe seq: the largest sequence every member has declared
    /// received. Never exceeds the group ARU.
    pub fn safe_seq(&self) -> Seqno {
        self.safe_logical()
            .map_or(self.space.none(), |l| self.wire(l))
    }

    pub fn aru_of(&self, id: &NodeId) -> Result<Seqno, FlockError> {
        let st = self.sources.get(id).ok_or(FlockError::Missing(*id))?;
        Ok(st.aru.map_or(self.space.none(), |a| self.wire(a)))
    }

    pub(crate) fn aru_logical_of(&self, id: &NodeId) -> Option<u64> {
        self.sources.get(id).and_then(|st| st.aru)
    }

    /// Declared-safe marker of a source, sentinel when unheard.
    pub fn safe_of(&self, id: &NodeId) -> Result<Seqno, FlockError> {
        let st = self.sources.get(id).ok_or(FlockError::Missing(*id))?;
        Ok(st.safe.map_or(self.space.none(), |s| self.wire(s)))
    }

    pub fn high_of(&self, id: &NodeId) -> Result<Seqno, FlockError> {
        let st = self.sources.get(id).ok_or(FlockError::Missing(*id))?;
        Ok(st.high.map_or(self.space.none(), |h| self.wire(h)))
    }

    /// `(next missing, highest received)` for a source — what a JOIN
    /// declares about it.
    pub fn range_of(&self, id: &NodeId) -> Result<SeqRange, FlockError> {
        let st = self.sources.get(id).ok_or(FlockError::Missing(*id))?;
        Ok(self.source_range(st))
    }

    /// The missing range of a source, if it has a gap between its ARU and
    /// its highest received sequence.
    pub fn gap_of(&self, id: &NodeId) -> Option<SeqRange> {
        let st = self.sources.get(id)?;
        let high = st.high?;
        let complete = st.aru.is_some_and(|a| a >= high);
        (!complete).then(|| self.source_range(st))
    }

    // Cursor-style iteration; keys stay valid across erasure of other keys.

    pub fn first_key(&self) -> Option<EntryKey> {
        self.entries.keys().next().copied()
    }

    pub fn next_key(&self, after: &EntryKey) -> Option<EntryKey> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.entries
            .range((Excluded(*after), Unbounded))
            .next()
            .map(|(k, _)| *k)
    }

    pub fn get(&self, key: &EntryKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &EntryKey) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    pub fn erase(&mut self, key: &EntryKey) -> Option<Entry> {
        self.entries.remove(key)
    }

    pub fn wire_seq(&self, key: &EntryKey) -> Seqno {
        self.wire(key.logical)
    }

    /// Entries in `(seq, source)` order, as `(source, wire seq, entry)`.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, Seqno, &Entry)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.source, self.wire(k.logical), e))
    }

    /// Keys of a source's entries whose wire seq falls in `range`.
    pub fn keys_in_range(&self, source: &NodeId, range: SeqRange) -> Vec<EntryKey> {
        if self.space.is_none(range.low) || self.space.is_none(range.high) {
            return Vec::new();
        }
        let span = self.space.diff(range.low, range.high);
        self.entries
            .keys()
            .filter(|k| {
                k.source == *source && self.space.diff(range.low, self.wire(k.logical)) <= span
            })
            .copied()
            .collect()
    }

    /// Keys of a source's entries strictly above the group safe seq.
    pub fn keys_above_safe(&self, source: &NodeId) -> Vec<EntryKey> {
        let safe = self.safe_logical();
        self.entries
            .keys()
            .filter(|k| k.source == *source && safe.is_none_or(|s| k.logical > s))
            .copied()
            .collect()
    }
}
