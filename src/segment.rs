use bytes::{Buf, BufMut, BytesMut};

use crate::error::TransportError;

/// Maximum number of body bytes per segment. Header plus body must fit the
///  path MTU; with full Ethernet frames there is comfortable headroom.
pub const SEGMENT_BODY_MAX: usize = 1400;

/// Serialized header length, see the layout in the crate docs.
pub const SEGMENT_HEADER_LEN: usize = 29;

/// Maximum size of a single datagram on the wire.
pub const SEGMENT_MAX: usize = SEGMENT_HEADER_LEN + SEGMENT_BODY_MAX;

const CHECKSUM_OFFSET: usize = 13;
const CHECKSUM_LEN: usize = 16;

/// The discriminator in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    /// client -> server handshake open; body carries the handshake key
    Syn = 1,
    /// server -> client handshake reply; echoes the key, header carries the
    ///  assigned stream id
    Ack = 2,
    PingReq = 3,
    PingRep = 4,
    /// inner RPC request
    Req = 5,
    /// inner RPC response
    Rep = 6,
    /// full-message receipt
    Received = 7,
    /// reserved, unused
    ReTrans = 8,
    /// one segment of a user message
    Trans = 9,
}

impl TryFrom<u8> for SegmentKind {
    type Error = TransportError;

    fn try_from(raw: u8) -> Result<SegmentKind, TransportError> {
        match raw {
            1 => Ok(SegmentKind::Syn),
            2 => Ok(SegmentKind::Ack),
            3 => Ok(SegmentKind::PingReq),
            4 => Ok(SegmentKind::PingRep),
            5 => Ok(SegmentKind::Req),
            6 => Ok(SegmentKind::Rep),
            7 => Ok(SegmentKind::Received),
            8 => Ok(SegmentKind::ReTrans),
            9 => Ok(SegmentKind::Trans),
            other => Err(TransportError::UnknownSegmentType(other)),
        }
    }
}

/// One datagram on the wire: header fields plus body.
///
/// `order_id` is only meaningful for `Trans` segments; control segments carry 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub flags: u16,
    pub stream_id: u32,
    pub trans_id: u16,
    pub order_id: u16,
    pub body: Vec<u8>,
}

impl Segment {
    pub fn new(
        kind: SegmentKind,
        flags: u16,
        stream_id: u32,
        trans_id: u16,
        order_id: u16,
        body: Vec<u8>,
    ) -> Result<Segment, TransportError> {
        if body.len() > SEGMENT_BODY_MAX {
            return Err(TransportError::SegmentBodyTooLarge(body.len()));
        }
        Ok(Segment {
            kind,
            flags,
            stream_id,
            trans_id,
            order_id,
            body,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(self.kind as u8);
        buf.put_u16(self.flags);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.trans_id);
        buf.put_u16(self.order_id);
        buf.put_u16(self.body.len() as u16);
        buf.put_bytes(0, CHECKSUM_LEN);
        buf.put_slice(&self.body);

        let digest = md5::compute(&buf[start..]);
        buf[start + CHECKSUM_OFFSET..start + CHECKSUM_OFFSET + CHECKSUM_LEN]
            .copy_from_slice(&digest.0);
    }

    /// Serialize into a fresh buffer sized for one datagram.
    pub fn to_datagram(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_LEN + self.body.len());
        self.ser(&mut buf);
        buf
    }

    /// Parse and verify one received datagram.
    pub fn deser(raw: &[u8]) -> Result<Segment, TransportError> {
        if raw.len() < SEGMENT_HEADER_LEN {
            return Err(TransportError::SegmentTruncated {
                expected: SEGMENT_HEADER_LEN,
                actual: raw.len(),
            });
        }

        let mut buf = raw;
        let kind_raw = buf.get_u8();
        let flags = buf.get_u16();
        let stream_id = buf.get_u32();
        let trans_id = buf.get_u16();
        let order_id = buf.get_u16();
        let length = buf.get_u16() as usize;

        let mut checksum = [0u8; CHECKSUM_LEN];
        buf.copy_to_slice(&mut checksum);

        if raw.len() != SEGMENT_HEADER_LEN + length {
            return Err(TransportError::SegmentTruncated {
                expected: SEGMENT_HEADER_LEN + length,
                actual: raw.len(),
            });
        }

        let mut zeroed = raw.to_vec();
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].fill(0);
        if md5::compute(&zeroed).0 != checksum {
            return Err(TransportError::SegmentChecksumMismatch);
        }

        let kind = SegmentKind::try_from(kind_raw)?;

        Ok(Segment {
            kind,
            flags,
            stream_id,
            trans_id,
            order_id,
            body: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty_body(SegmentKind::Received, 0, 17, 3, 0, vec![])]
    #[case::handshake(SegmentKind::Syn, 0, 0, 0, 0, b"key".to_vec())]
    #[case::trans(SegmentKind::Trans, 7, u32::MAX, 9, 42, vec![1, 2, 3, 4, 5])]
    #[case::max_body(SegmentKind::Trans, 0, 1, 0, 0, vec![0xab; SEGMENT_BODY_MAX])]
    fn test_ser_deser(
        #[case] kind: SegmentKind,
        #[case] flags: u16,
        #[case] stream_id: u32,
        #[case] trans_id: u16,
        #[case] order_id: u16,
        #[case] body: Vec<u8>,
    ) {
        let original = Segment::new(kind, flags, stream_id, trans_id, order_id, body).unwrap();
        let wire = original.to_datagram();
        assert_eq!(wire.len(), SEGMENT_HEADER_LEN + original.body.len());

        let deser = Segment::deser(&wire).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_body_too_large_rejected() {
        let result = Segment::new(
            SegmentKind::Trans,
            0,
            1,
            0,
            0,
            vec![0; SEGMENT_BODY_MAX + 1],
        );
        assert!(matches!(result, Err(TransportError::SegmentBodyTooLarge(_))));
    }

    #[test]
    fn test_any_flipped_bit_is_detected() {
        let segment =
            Segment::new(SegmentKind::Trans, 0, 5, 1, 2, vec![10, 20, 30, 40]).unwrap();
        let wire = segment.to_datagram();

        for byte_idx in 0..wire.len() {
            for bit in 0..8 {
                let mut corrupted = wire.to_vec();
                corrupted[byte_idx] ^= 1 << bit;
                let result = Segment::deser(&corrupted);
                assert!(
                    result.is_err(),
                    "flipping bit {} of byte {} went undetected",
                    bit,
                    byte_idx
                );
            }
        }
    }

    #[test]
    fn test_truncated_header() {
        let segment = Segment::new(SegmentKind::PingReq, 0, 1, 0, 0, vec![0, 0, 0, 1]).unwrap();
        let wire = segment.to_datagram();

        let result = Segment::deser(&wire[..SEGMENT_HEADER_LEN - 1]);
        assert!(matches!(result, Err(TransportError::SegmentTruncated { .. })));
    }

    #[test]
    fn test_truncated_body() {
        let segment = Segment::new(SegmentKind::Trans, 0, 1, 0, 0, vec![1, 2, 3]).unwrap();
        let wire = segment.to_datagram();

        let result = Segment::deser(&wire[..wire.len() - 1]);
        assert!(matches!(result, Err(TransportError::SegmentTruncated { .. })));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let segment = Segment::new(SegmentKind::Trans, 0, 1, 0, 0, vec![]).unwrap();
        let mut wire = segment.to_datagram().to_vec();

        // re-stamp the type byte and fix up the checksum so only the kind is bad
        wire[0] = 0xee;
        wire[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].fill(0);
        let digest = md5::compute(&wire);
        wire[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].copy_from_slice(&digest.0);

        let result = Segment::deser(&wire);
        assert!(matches!(result, Err(TransportError::UnknownSegmentType(0xee))));
    }
}
