//! Reliable messaging transport for real-time game traffic, layered on top of an
//!  unreliable datagram substrate.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* with a per-message quality
//!   of service: five reliability modes (fire-and-forget up to strictly ordered)
//!   and five scheduling classes, chosen independently per send
//! * Low latency over full in-sequence delivery: only traffic that asks for
//!   ordering pays for ordering
//! * `send` never suspends - it enqueues and returns; `receive` polls and returns
//!   immediately. A cooperative driver tick (1 kHz) does all timed work:
//!   retransmission, keep-alive, scheduling, reassembly, teardown
//! * Oversized messages are fragmented below the configured MTU and reassembled on
//!   the receive side; incomplete fragment groups are reclaimed after a timeout
//! * Outbound traffic is shaped by a five-class priority scheduler with per-packet
//!   deadlines and a token-bucket bandwidth governor
//! * Optional per-message compression and authenticated encryption with a fresh
//!   nonce per message
//! * A seedable network-condition simulator (loss, corruption, latency, jitter,
//!   reordering, bandwidth caps) for deterministic tests and development builds
//!
//! ## Wire format
//!
//! One packet, network byte order, 17 byte header:
//!
//! ```ascii
//! 0:  protocol version (u8), currently 1
//! 1:  sequence number (u32) - connection scoped, strictly increasing, compared
//!      with signed-difference arithmetic so the counter may wrap
//! 5:  sender timestamp (u32, milliseconds) - sender-local, only used for RTT
//! 9:  message id (u32) - groups the fragments of one message, 0 if unfragmented
//! 13: fragment index (u16)
//! 15: low 7 bits: total fragments, top bit: is_fragment
//! 16: low 3 bits: reliability mode, next 3 bits: priority, top 2 bits reserved
//! 17: payload
//! ```
//!
//! The payload is produced by the frame codec: a flag byte (compressed /
//!  encrypted) followed by the message bytes, optionally compressed. With
//!  encryption enabled the flag byte and body are AES-256-GCM sealed and the
//!  payload becomes `nonce (12 bytes) || ciphertext (incl. 16 byte tag)`.
//!
//! An *ack* is a packet whose payload is exactly the 4 byte big-endian sequence
//!  number being acknowledged, sent Unreliable / Immediate. Acks live outside the
//!  sequenced space: they are identified by shape, never retransmitted, never
//!  fragmented, and their own sequence field is ignored.
//!
//! ## Connections
//!
//! A connection is one peer-to-peer channel owning its reliability tables,
//!  fragment buffers, scheduler queues and statistics. There is no explicit
//!  handshake packet: an initiator sends a zero-payload reliable hello and any
//!  response completes the handshake; a receiver creates a connection on first
//!  sight of a new peer. Keep-alives flow when a connection is outbound-idle, and
//!  inbound silence beyond the configured timeout fails the connection.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod frame_codec;
pub mod packet_header;
pub mod qos;
pub mod reliability;
pub mod scheduler;
pub mod seq;
pub mod simulator;
pub mod stats;
pub mod substrate;

pub use config::LinkConfig;
pub use connection::{Connection, ConnectionState};
pub use endpoint::{ConnectionId, Endpoint};
pub use error::{LinkError, LinkEvent};
pub use qos::{Priority, QosProfile, Reliability};
pub use simulator::{NetworkCondition, NetworkSimulator};
pub use substrate::SubstrateKind;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
