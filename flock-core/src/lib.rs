//! Extended Virtual Synchrony group communication.
//!
//! `flock-core` keeps a dynamic set of processes agreeing on who is in the
//! group and delivers multicast messages inside each membership view with
//! per-level ordering and reliability guarantees, through message loss,
//! reordering, crashes, partitions and merges.
//!
//! The engine ([`proto::Proto`]) is transport-agnostic and single-threaded:
//! a host feeds it received frames and timer ticks, and it pushes frames
//! into a [`layer::Transport`] and deliveries into a [`layer::UpperLayer`].
//! See `flockd` for a UDP-multicast host.

pub mod config;
pub mod error;
pub mod id;
pub mod input_map;
pub mod layer;
pub mod message;
pub mod node;
pub mod proto;
pub mod seqno;
pub mod stats;
pub mod view;

mod wire;

pub use config::ProtoConfig;
pub use error::FlockError;
pub use id::{NodeId, ViewId};
pub use layer::{QueueTransport, Transport, UpMeta, UpperLayer};
pub use message::{Message, MessageKind, Safety};
pub use proto::{Proto, State};
pub use seqno::{SeqRange, Seqno, SeqnoSpace};
pub use view::{NodeList, View, ViewKind};
