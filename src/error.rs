use crate::seq::SequenceNumber;
use thiserror::Error;

/// Error kinds surfaced at the API boundary.
///
/// Reception errors ([LinkError::Malformed], [LinkError::AuthFailure],
///  [LinkError::DecompressFailure]) are recovered locally: the offending packet is
///  dropped and counted, the connection stays up. [LinkError::QueueFull] and
///  [LinkError::ConnectionClosed] are returned synchronously from `send`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("authenticated decryption failed")]
    AuthFailure,

    #[error("decompression failed")]
    DecompressFailure,

    #[error("send queue full")]
    QueueFull,

    #[error("message of {size} bytes exceeds the fragmentation limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("ordered delivery buffer exceeded its cap")]
    FlowBroken,

    #[error("connection is not accepting sends in state {0}")]
    ConnectionClosed(&'static str),
}

/// Asynchronous events delivered to the application via the connection's event queue.
///
/// [LinkEvent::DeliveryFailed] and [LinkEvent::DeadlineMissed] do not terminate the
///  connection; [LinkEvent::FlowBroken] and [LinkEvent::PeerTimeout] do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// the handshake completed and the connection reached Connected
    Connected,
    /// teardown finished, all buffers are drained
    Disconnected,
    /// a reliable packet exhausted its retry budget
    DeliveryFailed(SequenceNumber),
    /// a queued packet passed its deadline before the scheduler released it
    DeadlineMissed(SequenceNumber),
    /// the ordered-delivery buffer exceeded its cap; the connection failed
    FlowBroken,
    /// no inbound traffic within the configured timeout; the connection failed
    PeerTimeout,
}
