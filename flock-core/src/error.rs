use crate::id::NodeId;

/// Errors surfaced by the engine and its codecs.
///
/// Inbound codec failures are not propagated to peers: the frame is dropped
/// and a counter incremented, so a corrupt or future-version peer cannot
/// crash the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlockError {
    #[error("buffer too short: need {need} bytes at offset {offset}, have {have}")]
    BufferTooShort {
        need: usize,
        have: usize,
        offset: usize,
    },

    #[error("unknown message kind {0:#04x}")]
    UnknownMessageKind(u8),

    #[error("undefined sequence number passed to comparison")]
    InvalidSequence(u32),

    #[error("duplicate entry for {0}")]
    Duplicate(NodeId),

    #[error("no entry for {0}")]
    Missing(NodeId),

    #[error("field exceeds its wire limit")]
    MessageTooLarge,

    #[error("transport would block")]
    WouldBlock,

    #[error("engine is not operational")]
    NotOperational,

    /// Invariant violation. The engine closes itself and emits a final empty
    /// regular view before refusing further calls.
    #[error("fatal: {0}")]
    Fatal(String),
}
