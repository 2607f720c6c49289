//! Group views and the name-carrying member list.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::FlockError;
use crate::id::{NodeId, ViewId};

/// Maximum length of a human-readable node name on the wire. Names are
/// NUL-padded to exactly this size when serialized.
pub const NODE_NAME_LEN: usize = 16;

/// Mapping from node id to human-readable name. Insertion order is
/// irrelevant; iteration follows id order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeList {
    nodes: BTreeMap<NodeId, String>,
}

impl NodeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `MessageTooLarge` if the name does not fit the wire field.
    pub fn insert(&mut self, id: NodeId, name: &str) -> Result<(), FlockError> {
        if name.len() > NODE_NAME_LEN {
            return Err(FlockError::MessageTooLarge);
        }
        self.nodes.insert(id, name.to_owned());
        Ok(())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn name(&self, id: &NodeId) -> Option<&str> {
        self.nodes.get(id).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &str)> {
        self.nodes.iter().map(|(id, n)| (id, n.as_str()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Smallest member id, if any.
    pub fn first(&self) -> Option<NodeId> {
        self.nodes.keys().next().copied()
    }
}

/// What kind of view a `View` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViewKind {
    /// Placeholder before any membership is known.
    None,
    /// Transitional view: the surviving subset of the outgoing view.
    Trans,
    /// Regular view: the new stable membership.
    Reg,
    /// Non-primary component (reserved for upper layers).
    NonPrim,
    /// Primary component (reserved for upper layers).
    Prim,
}

/// An immutable membership snapshot delivered to the upper layer.
///
/// Invariants: `joined` and `left` are disjoint, `joined ⊆ members`, and
/// `partitioned` only ever names members of the preceding view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct View {
    kind: ViewKind,
    id: ViewId,
    members: NodeList,
    joined: NodeList,
    left: NodeList,
    partitioned: NodeList,
}

impl View {
    pub fn new(kind: ViewKind, id: ViewId) -> Self {
        Self {
            kind,
            id,
            members: NodeList::new(),
            joined: NodeList::new(),
            left: NodeList::new(),
            partitioned: NodeList::new(),
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn members(&self) -> &NodeList {
        &self.members
    }

    pub fn joined(&self) -> &NodeList {
        &self.joined
    }

    pub fn left(&self) -> &NodeList {
        &self.left
    }

    pub fn partitioned(&self) -> &NodeList {
        &self.partitioned
    }

    pub fn add_member(&mut self, id: NodeId, name: &str) -> Result<(), FlockError> {
        self.members.insert(id, name)
    }

    pub fn add_joined(&mut self, id: NodeId, name: &str) -> Result<(), FlockError> {
        debug_assert!(!self.left.contains(&id));
        self.joined.insert(id, name)
    }

    pub fn add_left(&mut self, id: NodeId, name: &str) -> Result<(), FlockError> {
        debug_assert!(!self.joined.contains(&id));
        self.left.insert(id, name)
    }

    pub fn add_partitioned(&mut self, id: NodeId, name: &str) -> Result<(), FlockError> {
        self.partitioned.insert(id, name)
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }

    /// The representative: numerically smallest member.
    pub fn representative(&self) -> Option<NodeId> {
        self.members.first()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ViewKind::None => "none",
            ViewKind::Trans => "trans",
            ViewKind::Reg => "reg",
            ViewKind::NonPrim => "non-prim",
            ViewKind::Prim => "prim",
        };
        write!(f, "view {} {} {{", kind, self.id)?;
        for (i, (id, name)) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if name.is_empty() {
                write!(f, "{id}")?;
            } else {
                write!(f, "{name}({id})")?;
            }
        }
        write!(f, "}}")
    }
}
