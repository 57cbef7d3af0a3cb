use thiserror::Error;

/// The error surface of the transport.
///
/// Decode failures on inbound datagrams are logged and swallowed by the read
///  loop (the connection survives); everything else propagates to the caller
///  of the operation that hit it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,

    #[error("connection is shut down")]
    ConnectionShutdown,

    #[error("unknown segment type {0}")]
    UnknownSegmentType(u8),

    #[error("segment checksum mismatch")]
    SegmentChecksumMismatch,

    #[error("segment truncated: expected {expected} bytes, got {actual}")]
    SegmentTruncated { expected: usize, actual: usize },

    #[error("segment body too large: {0} bytes")]
    SegmentBodyTooLarge(usize),

    #[error("transaction id {0} is outside the slot range")]
    TransIdOutOfRange(u16),

    #[error("client already exists in the connection pool")]
    ClientAlreadyExists,

    #[error("sending list is full")]
    SendingListFull,

    #[error("recving list is full")]
    RecvingListFull,

    #[error("unknown request type {0}")]
    UnknownRequestType(u8),

    #[error("empty message")]
    EmptyMessage,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
