//! Node and view identities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlockError;
use crate::wire;

/// 128-bit node identifier.
///
/// Total order is the byte-lexicographic order of the underlying UUID, which
/// puts the nil id below every real one. The nil id is reserved as a wire
/// placeholder (e.g. the source of an acknowledgement gap).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const WIRE_LEN: usize = 16;

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Deterministic id from a small index. Index 0 maps to nil.
    ///
    /// Used by tests and simulations that want stable, ordered identities.
    pub fn from_index(n: u32) -> Self {
        Self(Uuid::from_u128(n as u128))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn serialize_to(&self, buf: &mut [u8], offset: usize) -> Result<usize, FlockError> {
        wire::put_bytes(buf, offset, self.0.as_bytes())
    }

    pub fn unserialize_from(buf: &[u8], offset: usize) -> Result<(Self, usize), FlockError> {
        let (b, off) = wire::get_array::<16>(buf, offset)?;
        Ok((Self(Uuid::from_bytes(b)), off))
    }
}

impl From<Uuid> for NodeId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full UUIDs drown the logs; the last eight hex digits identify a
        // node well enough within one group.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[24..])
    }
}

/// View identifier: the founder's id plus a sequence number that grows by
/// one per installed view. Opaque to everything but comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewId {
    uuid: NodeId,
    seq: u32,
}

impl ViewId {
    pub const WIRE_LEN: usize = NodeId::WIRE_LEN + 4;

    pub fn new(uuid: NodeId, seq: u32) -> Self {
        Self { uuid, seq }
    }

    pub fn uuid(&self) -> NodeId {
        self.uuid
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn serialize_to(&self, buf: &mut [u8], offset: usize) -> Result<usize, FlockError> {
        let off = self.uuid.serialize_to(buf, offset)?;
        wire::put_u32(buf, off, self.seq)
    }

    pub fn unserialize_from(buf: &[u8], offset: usize) -> Result<(Self, usize), FlockError> {
        let (uuid, off) = NodeId::unserialize_from(buf, offset)?;
        let (seq, off) = wire::get_u32(buf, off)?;
        Ok((Self { uuid, seq }, off))
    }
}

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.uuid, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_sorts_first() {
        assert!(NodeId::nil() < NodeId::from_index(1));
        assert!(NodeId::from_index(1) < NodeId::from_index(2));
        assert!(NodeId::nil().is_nil());
        assert!(!NodeId::from_index(3).is_nil());
    }

    #[test]
    fn node_id_roundtrip() {
        let id = NodeId::from_index(42);
        let mut buf = [0u8; 16];
        let off = id.serialize_to(&mut buf, 0).unwrap();
        assert_eq!(off, NodeId::WIRE_LEN);
        let (back, off) = NodeId::unserialize_from(&buf, 0).unwrap();
        assert_eq!(off, NodeId::WIRE_LEN);
        assert_eq!(back, id);
    }

    #[test]
    fn node_id_short_buffer() {
        let id = NodeId::from_index(1);
        let mut buf = [0u8; 10];
        assert!(matches!(
            id.serialize_to(&mut buf, 0),
            Err(FlockError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn view_id_order_is_lexicographic() {
        let a = ViewId::new(NodeId::from_index(1), 7);
        let b = ViewId::new(NodeId::from_index(2), 0);
        let c = ViewId::new(NodeId::from_index(1), 8);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn view_id_roundtrip() {
        let v = ViewId::new(NodeId::from_index(5), 0x7373_b173);
        let mut buf = [0u8; 20];
        let off = v.serialize_to(&mut buf, 0).unwrap();
        assert_eq!(off, ViewId::WIRE_LEN);
        let (back, _) = ViewId::unserialize_from(&buf, 0).unwrap();
        assert_eq!(back, v);
    }
}
