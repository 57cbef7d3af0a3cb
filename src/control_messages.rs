use bytes::{Buf, BufMut, BytesMut};

use crate::segment::SEGMENT_BODY_MAX;

/// The only defined request kind: ask the peer which order ids of a
///  transaction (named in the segment header) are still missing.
pub const REQUEST_KIND_QUERY_RECEIVE: u8 = 1;

/// A `NotCompleted` response carries 4 bytes of echoed request id, 1 status
///  byte and 2 bytes of largest order id before the missing-id list; each
///  missing id takes 2 bytes.
pub const MAX_MISSING_IDS_PER_RESPONSE: usize = (SEGMENT_BODY_MAX - 7) / 2;

/// Leading bytes of every `Req` body: a sender-assigned correlation id that the
///  responder echoes, then the request kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u32,
    pub kind: u8,
}

impl RequestHeader {
    pub const SERIALIZED_LEN: usize = 5;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.request_id);
        buf.put_u8(self.kind);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RequestHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            anyhow::bail!("request body too short: {} bytes", buf.remaining());
        }
        let request_id = buf.get_u32();
        let kind = buf.get_u8();
        Ok(RequestHeader { request_id, kind })
    }
}

/// The responder's view of a queried transaction. Serialized after the echoed
///  request id in a `Rep` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReceiveResponse {
    /// the request kind was not understood
    UnknownType,
    /// no reassembly state for that transaction id
    NotExist,
    /// the message was fully reassembled and delivered
    Completed,
    /// still missing segments: the largest order id ever seen, plus the sorted
    ///  gaps below it (capped to the segment body budget)
    NotCompleted {
        largest_order_id: u16,
        missing: Vec<u16>,
    },
}

const STATUS_UNKNOWN_TYPE: u8 = 0;
const STATUS_NOT_EXIST: u8 = 1;
const STATUS_COMPLETED: u8 = 2;
const STATUS_NOT_COMPLETED: u8 = 3;

impl QueryReceiveResponse {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            QueryReceiveResponse::UnknownType => buf.put_u8(STATUS_UNKNOWN_TYPE),
            QueryReceiveResponse::NotExist => buf.put_u8(STATUS_NOT_EXIST),
            QueryReceiveResponse::Completed => buf.put_u8(STATUS_COMPLETED),
            QueryReceiveResponse::NotCompleted {
                largest_order_id,
                missing,
            } => {
                buf.put_u8(STATUS_NOT_COMPLETED);
                buf.put_u16(*largest_order_id);
                let capped = &missing[..missing.len().min(MAX_MISSING_IDS_PER_RESPONSE)];
                for order_id in capped {
                    buf.put_u16(*order_id);
                }
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<QueryReceiveResponse> {
        if buf.remaining() < 1 {
            anyhow::bail!("empty query-receive response");
        }
        match buf.get_u8() {
            STATUS_UNKNOWN_TYPE => Ok(QueryReceiveResponse::UnknownType),
            STATUS_NOT_EXIST => Ok(QueryReceiveResponse::NotExist),
            STATUS_COMPLETED => Ok(QueryReceiveResponse::Completed),
            STATUS_NOT_COMPLETED => {
                if buf.remaining() < 2 || buf.remaining() % 2 != 0 {
                    anyhow::bail!(
                        "malformed not-completed response: {} trailing bytes",
                        buf.remaining()
                    );
                }
                let largest_order_id = buf.get_u16();
                let mut missing = Vec::with_capacity(buf.remaining() / 2);
                while buf.has_remaining() {
                    missing.push(buf.get_u16());
                }
                Ok(QueryReceiveResponse::NotCompleted {
                    largest_order_id,
                    missing,
                })
            }
            other => anyhow::bail!("unknown query-receive status {}", other),
        }
    }
}
