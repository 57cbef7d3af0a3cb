//! A reliable, message-oriented transport layered on top of UDP.
//!
//! The abstraction is sending / receiving *messages* (defined-length chunks of
//!  data as opposed to streams of bytes). Messages can be arbitrarily large;
//!  the protocol takes care of chunking them into MTU-sized segments, buffering
//!  and re-assembling, without relying on IP-level fragmentation.
//!
//! ## Design goals
//!
//! * One UDP socket per endpoint handles all peers; inbound datagrams are
//!   demultiplexed to per-peer connections by sender address.
//! * Per-message reliability with *negative* acknowledgement: the sender
//!   transmits all segments of a message optimistically, then queries the
//!   receiver for gaps and retransmits only what is missing. On a low-loss
//!   link this is far cheaper than acking every segment.
//! * A connection multiplexes up to a fixed number of concurrent in-flight
//!   messages ("transactions"). Each transaction is delivered in order
//!   internally; there is *no* ordering across transactions.
//! * Explicit receipt: the receiver confirms a fully reassembled message with
//!   a single `Received` segment, which completes the sender's blocking
//!   `send_msg` call.
//! * Liveness via periodic pings (client side) and idle-connection reaping
//!   (both sides).
//!
//! Deliberately out of scope: congestion control, encryption, NAT traversal,
//!  cross-transaction ordering, flow control beyond a fixed send window.
//!
//! ## Wire format
//!
//! Every UDP datagram carries exactly one segment. Segment header, all numbers
//!  in network byte order (BE):
//!
//! ```ascii
//! 0:  segment type (u8) - see SegmentKind
//! 1:  flags (u16) - reserved, 0
//! 3:  stream id (u32) - identifies the connection, assigned by the server at
//!      handshake time
//! 7:  transaction id (u16) - identifies the in-flight message within the
//!      connection; must be below the configured transaction slot count
//! 9:  order id (u16) - position of this segment within its transaction,
//!      starting at 0; meaningful only for `Trans` segments
//! 11: body length (u16)
//! 13: checksum ([u8;16]) - MD5 over the header with this field zeroed,
//!      followed by the body
//! 29: body (`length` bytes, at most `SEGMENT_BODY_MAX`)
//! ```
//!
//! A `Trans` transaction's payload is a 4-byte BE total-length prefix (counting
//!  the prefix itself) followed by the user bytes; the payload is sliced into
//!  bodies of at most `SEGMENT_BODY_MAX` bytes.
//!
//! ## Control traffic
//!
//! * `Syn` / `Ack`: client handshake. The `Syn` body is a fixed handshake key;
//!   the `Ack` echoes it and carries the assigned stream id in its header.
//! * `PingReq` / `PingRep`: keepalive with a 4-byte correlation id in the body.
//! * `Req` / `Rep`: inner RPC. The only defined request is *query-receive*,
//!   which asks the peer which order ids of a transaction are still missing -
//!   see [control_messages].
//! * `Received`: single-segment receipt for a fully delivered transaction.

mod config;
mod control_messages;
mod error;
mod receive_buffer;
mod segment;
mod send_buffer;
mod send_pipeline;

pub mod connection;
pub mod connection_pool;
pub mod end_point;

pub use config::Config;
pub use connection::Connection;
pub use end_point::{Client, Server};
pub use error::TransportError;
pub use segment::{Segment, SegmentKind, SEGMENT_BODY_MAX, SEGMENT_HEADER_LEN, SEGMENT_MAX};
