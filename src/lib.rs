//! A reliable-messaging layer on top of an unreliable datagram transport,
//!  modeled on a virtual-world simulator wire protocol. The layer owns one
//!  *circuit* per peer that multiplexes variable-size application messages,
//!  provides at-least-once delivery for messages marked reliable, detects
//!  peer liveness, measures round-trip time, compresses zero runs on the
//!  wire, and dispatches decoded messages to handlers registered by name.
//!
//! ## Design goals
//!
//! * Messages, not streams: the unit of transfer is a template-described
//!   message that fits into a single datagram - no fragmentation, no ordered
//!   delivery, no connection handshake.
//! * At-least-once for what asks for it: templates flagged reliable get an
//!   unacked table, timed retransmission with a bounded retry budget, and
//!   acknowledgments that piggyback on whatever happens to flow the other
//!   way.
//! * Tolerate a lossy network: inbound sequence gaps are counted as loss and
//!   skipped over, duplicates are suppressed, and a silent peer's circuit is
//!   declared dead and reaped.
//! * Bounded work per tick: the owning application drives the system by
//!   calling [`MessageSystem::poll`] repeatedly. A tick drains the (strictly
//!   non-blocking) transport, sweeps timeouts and sends due retransmissions;
//!   there are no suspension points inside the core.
//! * Templates are data: a declarative catalogue (name, opcode, flags,
//!   blocks, variables) drives both encode and decode, so the codec is
//!   single-sourced.
//!
//! ## Wire format
//!
//! ```ascii
//! 0: flags (u8): bit 0 = reliable, bit 1 = zero-coded, rest reserved (zero)
//! 1: sequence (u32 LE), per-circuit, strictly monotonic outbound
//! 5: opcode, variable width:
//!      opcode < 0xFF     -> 1 byte
//!      opcode < 0x10000  -> 0xFF, then u16 BE
//!      otherwise         -> 0xFF, 0xFF, then u32 LE
//! *: payload: template-directed block data; zero-run compressed when the
//!      zero-coded flag is set (a run of N zero bytes becomes `0x00 N`)
//! *: ack trailer: acked sequence numbers (u32 LE each), then their count as
//!      a single byte; a lone 0x00 when nothing is acked. Appended after
//!      zero-encoding, so never compressed.
//! ```
//!
//! ## Reliability
//!
//! Sending a reliable message installs the final datagram in the circuit's
//!  unacked table. The periodic sweep promotes entries older than the resend
//!  timeout to a retry queue; each retransmission keeps the original sequence
//!  number. After the retry budget (default 3) the packet is given up on and
//!  counted as lost. Acknowledgments ride the trailer of any datagram going
//!  the other way and remove the entry, feeding the observed round trip into
//!  an exponentially weighted RTT average (weights 0.05 new / 0.95 old).
//!
//! Per-category token buckets throttle outbound bandwidth; a message that
//!  does not fit its category's bucket is dropped, not queued, and the send
//!  reports zero bytes.

mod builder;
mod circuit;
mod circuit_table;
mod config;
mod decoder;
mod error;
mod host;
mod message_system;
mod packet_buffer;
mod packet_header;
mod template;
mod throttle;
mod transport;
mod value;
mod zero_coding;

pub use circuit::{Classification, CircuitSnapshot};
pub use config::MessageConfig;
pub use decoder::{DecodedBlock, DecodedMessage};
pub use error::ProtocolError;
pub use host::Host;
pub use message_system::{HandlerId, MessageStats, MessageSystem, ReceivedMessage};
pub use packet_header::{PacketFlags, PacketHeader};
pub use template::{
    BlockCardinality, BlockSpec, MessageTemplate, TemplateRegistry, VariableSpec, VariableType,
};
pub use throttle::{ThrottleCategory, ThrottleGroup};
pub use transport::{Transport, UdpTransport};
pub use value::Value;
pub use zero_coding::{zero_decode, zero_encode};
