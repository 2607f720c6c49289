//! Protocol messages and their binary codec.
//!
//! Six message kinds share a fixed 60-byte little-endian header followed by
//! a kind-specific tail. Frames are length-framed: a decode consumes the
//! whole remaining buffer for payload-bearing kinds, and every field access
//! is bounds-checked so truncated frames fail with `BufferTooShort` instead
//! of panicking.
//!
//! Header layout:
//!
//! ```text
//! offset  size  field
//!      0     1  version
//!      1     1  kind
//!      2     1  user_type
//!      3     1  safety
//!      4     1  flags
//!      5     1  seq_range
//!      6     2  reserved (zero)
//!      8    16  source node id
//!     24    20  source view id (uuid + u32 seq)
//!     44     4  seq
//!     48     4  aru_seq
//!     52     8  fifo_seq (i64)
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::FlockError;
use crate::id::{NodeId, ViewId};
use crate::seqno::{SeqRange, Seqno};
use crate::view::NODE_NAME_LEN;
use crate::wire;

/// Current wire version. Frames with a different version are dropped by the
/// engine, not rejected by the codec.
pub const WIRE_VERSION: u8 = 0;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 60;

const JOIN_ENTRY_LEN: usize = NodeId::WIRE_LEN + NODE_NAME_LEN + 4 + 12;
const GAP_TAIL_LEN: usize = NodeId::WIRE_LEN + 8;

/// Message kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    User = 0,
    Delegate = 1,
    Gap = 2,
    Join = 3,
    Install = 4,
    Leave = 5,
}

impl MessageKind {
    pub const COUNT: usize = 6;

    fn from_wire(v: u8) -> Result<Self, FlockError> {
        Ok(match v {
            0 => Self::User,
            1 => Self::Delegate,
            2 => Self::Gap,
            3 => Self::Join,
            4 => Self::Install,
            5 => Self::Leave,
            other => return Err(FlockError::UnknownMessageKind(other)),
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Delegate => "delegate",
            Self::Gap => "gap",
            Self::Join => "join",
            Self::Install => "install",
            Self::Leave => "leave",
        })
    }
}

/// Delivery guarantee requested for a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Safety {
    /// Consumed by the engine, never delivered upward. Keepalives.
    Drop = 0,
    /// Delivered as soon as received, gaps permitted. May overtake
    /// gap-blocked agreed/safe messages.
    Unreliable = 1,
    /// Delivered once every earlier message from the same source is in.
    Fifo = 2,
    /// Delivered once the group ARU covers it.
    Agreed = 3,
    /// Delivered once every member is known to have received it.
    Safe = 4,
}

impl Safety {
    fn from_wire(v: u8) -> Result<Self, FlockError> {
        Ok(match v {
            0 => Self::Drop,
            1 => Self::Unreliable,
            2 => Self::Fifo,
            3 => Self::Agreed,
            4 => Self::Safe,
            other => return Err(FlockError::UnknownMessageKind(other)),
        })
    }
}

/// Header flag bits.
pub mod flags {
    /// More messages are queued behind this one at the sender.
    pub const MSG_MORE: u8 = 0x01;
    /// Retransmission, not a first send.
    pub const RESEND: u8 = 0x02;
    /// Causal delivery requested (reserved).
    pub const CAUSAL: u8 = 0x04;
}

/// The fixed part shared by every message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub user_type: u8,
    pub safety: Safety,
    pub flags: u8,
    pub seq_range: u8,
    pub source: NodeId,
    pub source_view: ViewId,
    pub seq: Seqno,
    pub aru_seq: Seqno,
    pub fifo_seq: i64,
}

impl Header {
    fn control(source: NodeId, source_view: ViewId, seq: Seqno, aru_seq: Seqno, fifo_seq: i64) -> Self {
        Self {
            version: WIRE_VERSION,
            user_type: 0,
            safety: Safety::Drop,
            flags: 0,
            seq_range: 0,
            source,
            source_view,
            seq,
            aru_seq,
            fifo_seq,
        }
    }

    fn serialize_to(&self, kind: MessageKind, buf: &mut [u8], offset: usize) -> Result<usize, FlockError> {
        let off = wire::put_u8(buf, offset, self.version)?;
        let off = wire::put_u8(buf, off, kind as u8)?;
        let off = wire::put_u8(buf, off, self.user_type)?;
        let off = wire::put_u8(buf, off, self.safety as u8)?;
        let off = wire::put_u8(buf, off, self.flags)?;
        let off = wire::put_u8(buf, off, self.seq_range)?;
        let off = wire::put_u16(buf, off, 0)?;
        let off = self.source.serialize_to(buf, off)?;
        let off = self.source_view.serialize_to(buf, off)?;
        let off = wire::put_u32(buf, off, self.seq)?;
        let off = wire::put_u32(buf, off, self.aru_seq)?;
        wire::put_i64(buf, off, self.fifo_seq)
    }

    fn unserialize_from(buf: &[u8], offset: usize) -> Result<(Self, MessageKind, usize), FlockError> {
        let (version, off) = wire::get_u8(buf, offset)?;
        let (kind, off) = wire::get_u8(buf, off)?;
        let kind = MessageKind::from_wire(kind)?;
        let (user_type, off) = wire::get_u8(buf, off)?;
        let (safety, off) = wire::get_u8(buf, off)?;
        let safety = Safety::from_wire(safety)?;
        let (flags, off) = wire::get_u8(buf, off)?;
        let (seq_range, off) = wire::get_u8(buf, off)?;
        let (_reserved, off) = wire::get_u16(buf, off)?;
        let (source, off) = NodeId::unserialize_from(buf, off)?;
        let (source_view, off) = ViewId::unserialize_from(buf, off)?;
        let (seq, off) = wire::get_u32(buf, off)?;
        let (aru_seq, off) = wire::get_u32(buf, off)?;
        let (fifo_seq, off) = wire::get_i64(buf, off)?;
        Ok((
            Self {
                version,
                user_type,
                safety,
                flags,
                seq_range,
                source,
                source_view,
                seq,
                aru_seq,
                fifo_seq,
            },
            kind,
            off,
        ))
    }
}

/// Per-node record carried by JOIN and INSTALL messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEntry {
    pub name: String,
    pub operational: bool,
    pub left: bool,
    /// Declared safe marker for this node, sentinel when unknown.
    pub safe_seq: Seqno,
    /// Declared per-source message range: `low` is the next sequence the
    /// sender is missing, `high` the highest it has received.
    pub range: SeqRange,
}

impl JoinEntry {
    fn serialize_to(&self, id: &NodeId, buf: &mut [u8], offset: usize) -> Result<usize, FlockError> {
        if self.name.len() > NODE_NAME_LEN {
            return Err(FlockError::MessageTooLarge);
        }
        let off = id.serialize_to(buf, offset)?;
        let mut padded = [0u8; NODE_NAME_LEN];
        padded[..self.name.len()].copy_from_slice(self.name.as_bytes());
        let off = wire::put_bytes(buf, off, &padded)?;
        let mut bits = 0u8;
        if self.operational {
            bits |= 0x01;
        }
        if self.left {
            bits |= 0x02;
        }
        let off = wire::put_u8(buf, off, bits)?;
        let off = wire::put_u8(buf, off, 0)?;
        let off = wire::put_u16(buf, off, 0)?;
        let off = wire::put_u32(buf, off, self.safe_seq)?;
        let off = wire::put_u32(buf, off, self.range.low)?;
        wire::put_u32(buf, off, self.range.high)
    }

    fn unserialize_from(buf: &[u8], offset: usize) -> Result<(NodeId, Self, usize), FlockError> {
        let (id, off) = NodeId::unserialize_from(buf, offset)?;
        let (raw_name, off) = wire::get_array::<NODE_NAME_LEN>(buf, off)?;
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(NODE_NAME_LEN);
        let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
        let (bits, off) = wire::get_u8(buf, off)?;
        let (_pad, off) = wire::get_u8(buf, off)?;
        let (_pad2, off) = wire::get_u16(buf, off)?;
        let (safe_seq, off) = wire::get_u32(buf, off)?;
        let (low, off) = wire::get_u32(buf, off)?;
        let (high, off) = wire::get_u32(buf, off)?;
        Ok((
            id,
            Self {
                name,
                operational: bits & 0x01 != 0,
                left: bits & 0x02 != 0,
                safe_seq,
                range: SeqRange::new(low, high),
            },
            off,
        ))
    }
}

/// JOIN/INSTALL node list: id-ordered, one record per known node.
pub type MemberMap = BTreeMap<NodeId, JoinEntry>;

/// A protocol message. The header rides along in every variant; the variant
/// itself carries only what that kind adds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    User { hdr: Header, payload: Bytes },
    Delegate { hdr: Header, inner: Bytes },
    Gap { hdr: Header, gap_source: NodeId, range: SeqRange },
    Join { hdr: Header, nodes: MemberMap },
    Install { hdr: Header, nodes: MemberMap },
    Leave { hdr: Header },
}

impl Default for Message {
    /// The canonical all-zero user message.
    fn default() -> Self {
        Self::User {
            hdr: Header {
                version: 0,
                user_type: 0,
                safety: Safety::Drop,
                flags: 0,
                seq_range: 0,
                source: NodeId::nil(),
                source_view: ViewId::default(),
                seq: 0,
                aru_seq: 0,
                fifo_seq: 0,
            },
            payload: Bytes::new(),
        }
    }
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn user(
        source: NodeId,
        user_type: u8,
        safety: Safety,
        seq: Seqno,
        seq_range: u8,
        aru_seq: Seqno,
        source_view: ViewId,
        flags: u8,
        fifo_seq: i64,
        payload: Bytes,
    ) -> Self {
        Self::User {
            hdr: Header {
                version: WIRE_VERSION,
                user_type,
                safety,
                flags,
                seq_range,
                source,
                source_view,
                seq,
                aru_seq,
                fifo_seq,
            },
            payload,
        }
    }

    pub fn delegate(source: NodeId, source_view: ViewId, fifo_seq: i64, inner: Bytes) -> Self {
        Self::Delegate {
            hdr: Header::control(source, source_view, 0, 0, fifo_seq),
            inner,
        }
    }

    pub fn gap(
        source: NodeId,
        source_view: ViewId,
        aru_seq: Seqno,
        fifo_seq: i64,
        gap_source: NodeId,
        range: SeqRange,
    ) -> Self {
        Self::Gap {
            hdr: Header::control(source, source_view, 0, aru_seq, fifo_seq),
            gap_source,
            range,
        }
    }

    pub fn join(
        source: NodeId,
        source_view: ViewId,
        seq: Seqno,
        aru_seq: Seqno,
        fifo_seq: i64,
        nodes: MemberMap,
    ) -> Self {
        Self::Join {
            hdr: Header::control(source, source_view, seq, aru_seq, fifo_seq),
            nodes,
        }
    }

    pub fn install(
        source: NodeId,
        source_view: ViewId,
        seq: Seqno,
        aru_seq: Seqno,
        fifo_seq: i64,
        nodes: MemberMap,
    ) -> Self {
        Self::Install {
            hdr: Header::control(source, source_view, seq, aru_seq, fifo_seq),
            nodes,
        }
    }

    pub fn leave(source: NodeId, source_view: ViewId, seq: Seqno, aru_seq: Seqno, fifo_seq: i64) -> Self {
        Self::Leave {
            hdr: Header::control(source, source_view, seq, aru_seq, fifo_seq),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::User { .. } => MessageKind::User,
            Self::Delegate { .. } => MessageKind::Delegate,
            Self::Gap { .. } => MessageKind::Gap,
            Self::Join { .. } => MessageKind::Join,
            Self::Install { .. } => MessageKind::Install,
            Self::Leave { .. } => MessageKind::Leave,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Self::User { hdr, .. }
            | Self::Delegate { hdr, .. }
            | Self::Gap { hdr, .. }
            | Self::Join { hdr, .. }
            | Self::Install { hdr, .. }
            | Self::Leave { hdr } => hdr,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Self::User { hdr, .. }
            | Self::Delegate { hdr, .. }
            | Self::Gap { hdr, .. }
            | Self::Join { hdr, .. }
            | Self::Install { hdr, .. }
            | Self::Leave { hdr } => hdr,
        }
    }

    pub fn source(&self) -> NodeId {
        self.header().source
    }

    pub fn source_view(&self) -> ViewId {
        self.header().source_view
    }

    pub fn seq(&self) -> Seqno {
        self.header().seq
    }

    pub fn aru_seq(&self) -> Seqno {
        self.header().aru_seq
    }

    pub fn fifo_seq(&self) -> i64 {
        self.header().fifo_seq
    }

    pub fn nodes(&self) -> Option<&MemberMap> {
        match self {
            Self::Join { nodes, .. } | Self::Install { nodes, .. } => Some(nodes),
            _ => None,
        }
    }

    /// Exact encoded size in bytes.
    pub fn serial_size(&self) -> usize {
        HEADER_LEN
            + match self {
                Self::User { payload, .. } => payload.len(),
                Self::Delegate { inner, .. } => inner.len(),
                Self::Gap { .. } => GAP_TAIL_LEN,
                Self::Join { nodes, .. } | Self::Install { nodes, .. } => {
                    4 + nodes.len() * JOIN_ENTRY_LEN
                }
                Self::Leave { .. } => 0,
            }
    }

    pub fn serialize_to(&self, buf: &mut [u8], offset: usize) -> Result<usize, FlockError> {
        let off = self.header().serialize_to(self.kind(), buf, offset)?;
        match self {
            Self::User { payload, .. } => wire::put_bytes(buf, off, payload),
            Self::Delegate { inner, .. } => wire::put_bytes(buf, off, inner),
            Self::Gap { gap_source, range, .. } => {
                let off = gap_source.serialize_to(buf, off)?;
                let off = wire::put_u32(buf, off, range.low)?;
                wire::put_u32(buf, off, range.high)
            }
            Self::Join { nodes, .. } | Self::Install { nodes, .. } => {
                let mut off = wire::put_u32(buf, off, nodes.len() as u32)?;
                for (id, entry) in nodes {
                    off = entry.serialize_to(id, buf, off)?;
                }
                Ok(off)
            }
            Self::Leave { .. } => Ok(off),
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes, FlockError> {
        let mut buf = vec![0u8; self.serial_size()];
        let n = self.serialize_to(&mut buf, 0)?;
        debug_assert_eq!(n, buf.len());
        Ok(Bytes::from(buf))
    }

    /// Decode a frame. Payload-bearing kinds consume the whole remaining
    /// buffer; the returned offset is the end of the frame.
    pub fn unserialize_from(buf: &[u8], offset: usize) -> Result<(Self, usize), FlockError> {
        let (hdr, kind, off) = Header::unserialize_from(buf, offset)?;
        match kind {
            MessageKind::User => {
                let payload = Bytes::copy_from_slice(&buf[off..]);
                Ok((Self::User { hdr, payload }, buf.len()))
            }
            MessageKind::Delegate => {
                let inner = Bytes::copy_from_slice(&buf[off..]);
                Ok((Self::Delegate { hdr, inner }, buf.len()))
            }
            MessageKind::Gap => {
                let (gap_source, off) = NodeId::unserialize_from(buf, off)?;
                let (low, off) = wire::get_u32(buf, off)?;
                let (high, off) = wire::get_u32(buf, off)?;
                Ok((
                    Self::Gap {
                        hdr,
                        gap_source,
                        range: SeqRange::new(low, high),
                    },
                    off,
                ))
            }
            MessageKind::Join | MessageKind::Install => {
                let (count, mut off) = wire::get_u32(buf, off)?;
                let mut nodes = MemberMap::new();
                for _ in 0..count {
                    let (id, entry, next) = JoinEntry::unserialize_from(buf, off)?;
                    nodes.insert(id, entry);
                    off = next;
                }
                if kind == MessageKind::Join {
                    Ok((Self::Join { hdr, nodes }, off))
                } else {
                    Ok((Self::Install { hdr, nodes }, off))
                }
            }
            MessageKind::Leave => Ok((Self::Leave { hdr }, off)),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.header();
        write!(
            f,
            "{} from {} view {} seq {} aru {}",
            self.kind(),
            h.source,
            h.source_view,
            h.seq,
            h.aru_seq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seqno::SeqnoSpace;

    fn roundtrip(m: &Message) {
        let bytes = m.encode().unwrap();
        assert_eq!(bytes.len(), m.serial_size());
        let (back, off) = Message::unserialize_from(&bytes, 0).unwrap();
        assert_eq!(off, bytes.len());
        assert_eq!(&back, m);
    }

    #[test]
    fn canonical_empty_user_roundtrip() {
        roundtrip(&Message::default());
    }

    #[test]
    fn user_roundtrip() {
        let space = SeqnoSpace::new(0x8000_0000);
        let m = Message::user(
            NodeId::from_index(4),
            0x10,
            Safety::Safe,
            0x037b_137b,
            0x17,
            space.none(),
            ViewId::new(NodeId::from_index(5), 0x7373_b173),
            flags::MSG_MORE,
            42,
            Bytes::from_static(b"0534555"),
        );
        roundtrip(&m);
    }

    #[test]
    fn gap_roundtrip() {
        let m = Message::gap(
            NodeId::from_index(2),
            ViewId::new(NodeId::from_index(1), 3),
            7,
            9,
            NodeId::from_index(6),
            SeqRange::new(4, 11),
        );
        roundtrip(&m);
    }

    #[test]
    fn join_and_install_roundtrip() {
        let mut nodes = MemberMap::new();
        nodes.insert(
            NodeId::from_index(1),
            JoinEntry {
                name: "n1".to_owned(),
                operational: true,
                left: false,
                safe_seq: 3,
                range: SeqRange::new(4, 9),
            },
        );
        nodes.insert(
            NodeId::from_index(2),
            JoinEntry {
                name: String::new(),
                operational: false,
                left: true,
                safe_seq: 0x8000_0000,
                range: SeqRange::new(0, 0x8000_0000),
            },
        );
        let view = ViewId::new(NodeId::from_index(1), 1);
        roundtrip(&Message::join(NodeId::from_index(1), view, 9, 3, 1, nodes.clone()));
        roundtrip(&Message::install(NodeId::from_index(1), view, 9, 3, 2, nodes));
    }

    #[test]
    fn leave_roundtrip() {
        let m = Message::leave(
            NodeId::from_index(3),
            ViewId::new(NodeId::from_index(1), 2),
            5,
            4,
            77,
        );
        roundtrip(&m);
    }

    #[test]
    fn delegate_wraps_inner_frame() {
        let inner = Message::user(
            NodeId::from_index(7),
            0,
            Safety::Agreed,
            12,
            0,
            11,
            ViewId::new(NodeId::from_index(1), 1),
            flags::RESEND,
            5,
            Bytes::from_static(b"xyz"),
        );
        let wrapped = Message::delegate(
            NodeId::from_index(2),
            ViewId::new(NodeId::from_index(1), 1),
            6,
            inner.encode().unwrap(),
        );
        roundtrip(&wrapped);
        let Message::Delegate { inner: raw, .. } = &wrapped else {
            unreachable!()
        };
        let (unwrapped, _) = Message::unserialize_from(raw, 0).unwrap();
        assert_eq!(unwrapped, inner);
    }

    #[test]
    fn truncated_frame_fails() {
        let bytes = Message::default().encode().unwrap();
        for cut in [0, 1, 10, HEADER_LEN - 1] {
            assert!(matches!(
                Message::unserialize_from(&bytes[..cut], 0),
                Err(FlockError::BufferTooShort { .. })
            ));
        }
    }

    #[test]
    fn short_output_buffer_fails() {
        let m = Message::default();
        let mut buf = vec![0u8; m.serial_size() - 1];
        assert!(matches!(
            m.serialize_to(&mut buf, 0),
            Err(FlockError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn unknown_kind_fails() {
        let mut bytes = Message::default().encode().unwrap().to_vec();
        bytes[1] = 0x7f;
        assert_eq!(
            Message::unserialize_from(&bytes, 0),
            Err(FlockError::UnknownMessageKind(0x7f))
        );
    }

    #[test]
    fn oversize_node_name_fails() {
        let mut nodes = MemberMap::new();
        nodes.insert(
            NodeId::from_index(1),
            JoinEntry {
                name: "name-of-seventeen".to_owned(),
                operational: true,
                left: false,
                safe_seq: 0,
                range: SeqRange::new(0, 0),
            },
        );
        let m = Message::join(
            NodeId::from_index(1),
            ViewId::new(NodeId::from_index(1), 0),
            0,
            0,
            0,
            nodes,
        );
        assert_eq!(m.encode(), Err(FlockError::MessageTooLarge));
    }

    #[test]
    fn offset_decoding() {
        // A frame embedded mid-buffer decodes from its offset.
        let m = Message::gap(
            NodeId::from_index(1),
            ViewId::new(NodeId::from_index(1), 0),
            0,
            0,
            NodeId::nil(),
            SeqRange::new(0x8000_0000, 0x8000_0000),
        );
        let frame = m.encode().unwrap();
        let mut buf = vec![0xaa; 7];
        buf.extend_from_slice(&frame);
        let (back, off) = Message::unserialize_from(&buf, 7).unwrap();
        assert_eq!(back, m);
        assert_eq!(off, buf.len());
    }
}
