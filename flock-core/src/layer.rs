//! Seams between the engine and its collaborators.
//!
//! The engine sits between a best-effort multicast transport below and the
//! application above. Both are capability traits owned by the engine; the
//! cyclic transport↔engine reference of the original design is modeled as
//! two one-way channels instead (frames go down through `Transport::send`,
//! received frames come back in through `Proto::handle_msg`).

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::FlockError;
use crate::id::{NodeId, ViewId};
use crate::view::View;

/// Best-effort group multicast. No duplicate generation within one send,
/// per-link FIFO, arbitrary loss.
pub trait Transport {
    /// Queue one frame for multicast. `Err(WouldBlock)` means the engine
    /// keeps the message buffered and retries from the resend timer.
    fn send(&mut self, frame: Bytes) -> Result<(), FlockError>;

    /// Stable local identity.
    fn local_id(&self) -> NodeId;
}

/// Metadata attached to every upward delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpMeta {
    pub source: NodeId,
    pub user_type: u8,
    pub source_view: ViewId,
    /// Present on view-change notifications, which carry no payload.
    pub view: Option<View>,
}

impl UpMeta {
    pub(crate) fn payload(source: NodeId, user_type: u8, source_view: ViewId) -> Self {
        Self {
            source,
            user_type,
            source_view,
            view: None,
        }
    }

    pub(crate) fn view_change(source: NodeId, view: View) -> Self {
        Self {
            source,
            user_type: 0,
            source_view: view.id(),
            view: Some(view),
        }
    }
}

/// The application side of the engine.
pub trait UpperLayer {
    /// Called once per delivered payload (`payload` set, `meta.view` empty)
    /// or view change (`payload` empty, `meta.view` set).
    fn handle_up(&mut self, payload: Option<&Bytes>, meta: &UpMeta);
}

/// An in-memory transport that parks outbound frames in a queue for the
/// harness to pick up and distribute. This is the deterministic transport
/// the test scenarios run on; it never loops frames back to the sender.
#[derive(Debug)]
pub struct QueueTransport {
    id: NodeId,
    out: VecDeque<Bytes>,
    blocked: bool,
}

impl QueueTransport {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            out: VecDeque::new(),
            blocked: false,
        }
    }

    /// Next outbound frame, if any.
    pub fn poll(&mut self) -> Option<Bytes> {
        self.out.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Make subsequent sends fail with `WouldBlock`.
    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }
}

impl Transport for QueueTransport {
    fn send(&mut self, frame: Bytes) -> Result<(), FlockError> {
        if self.blocked {
            return Err(FlockError::WouldBlock);
        }
        self.out.push_back(frame);
        Ok(())
    }

    fn local_id(&self) -> NodeId {
        self.id
    }
}
