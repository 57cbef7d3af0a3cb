use crate::segment::{Segment, SegmentKind, SEGMENT_BODY_MAX};

/// Longest user message that still keeps every order id inside `u16`, leaving
///  room for the 4-byte length prefix.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize * SEGMENT_BODY_MAX - 4;

/// One outbound transaction: the framed payload plus everything needed to
///  synthesize any of its segments on demand.
///
/// Immutable once constructed, so retransmission rounds can re-derive any
///  segment without coordination.
pub struct SendBuffer {
    flags: u16,
    stream_id: u32,
    trans_id: u16,
    /// 4-byte BE total-length prefix (counting itself) followed by user bytes
    payload: Vec<u8>,
}

impl SendBuffer {
    /// Callers must have bounds-checked the message against
    ///  [MAX_MESSAGE_SIZE] already.
    pub fn new(stream_id: u32, trans_id: u16, message: &[u8]) -> SendBuffer {
        let mut payload = Vec::with_capacity(4 + message.len());
        payload.extend_from_slice(&((message.len() + 4) as u32).to_be_bytes());
        payload.extend_from_slice(message);

        SendBuffer {
            flags: 0,
            stream_id,
            trans_id,
            payload,
        }
    }

    pub fn trans_id(&self) -> u16 {
        self.trans_id
    }

    pub fn segment_count(&self) -> u16 {
        self.payload.len().div_ceil(SEGMENT_BODY_MAX) as u16
    }

    /// Synthesize the segment at `order_id`; ids at or beyond
    ///  [Self::segment_count] are a caller bug.
    pub fn segment(&self, order_id: u16) -> Segment {
        assert!(order_id < self.segment_count(), "order id {} out of range", order_id);

        let start = order_id as usize * SEGMENT_BODY_MAX;
        let end = (start + SEGMENT_BODY_MAX).min(self.payload.len());

        Segment {
            kind: SegmentKind::Trans,
            flags: self.flags,
            stream_id: self.stream_id,
            trans_id: self.trans_id,
            order_id,
            body: self.payload[start..end].to_vec(),
        }
    }

    /// All segments in order-id order; finite and restartable.
    pub fn iter_segments(&self) -> impl Iterator<Item = Segment> + '_ {
        (0..self.segment_count()).map(|order_id| self.segment(order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::one_byte(1, 1)]
    #[case::exactly_one_body(SEGMENT_BODY_MAX - 4, 1)]
    #[case::one_over(SEGMENT_BODY_MAX - 3, 2)]
    #[case::two_bodies(2 * SEGMENT_BODY_MAX - 4, 2)]
    #[case::many(10_000, 8)]
    fn test_segment_count(#[case] message_len: usize, #[case] expected: u16) {
        let buffer = SendBuffer::new(1, 0, &vec![0u8; message_len]);
        assert_eq!(buffer.segment_count(), expected);
    }

    #[test]
    fn test_length_prefix_covers_itself() {
        let buffer = SendBuffer::new(1, 0, &[0xaa; 100]);
        let first = buffer.segment(0);
        assert_eq!(&first.body[0..4], &[0, 0, 0, 104]);
    }

    #[test]
    fn test_segments_partition_the_payload() {
        let message: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let buffer = SendBuffer::new(3, 5, &message);

        let mut reassembled = Vec::new();
        for segment in buffer.iter_segments() {
            assert_eq!(segment.kind, SegmentKind::Trans);
            assert_eq!(segment.stream_id, 3);
            assert_eq!(segment.trans_id, 5);
            assert!(segment.body.len() <= SEGMENT_BODY_MAX);
            reassembled.extend_from_slice(&segment.body);
        }

        assert_eq!(&reassembled[0..4], &((message.len() + 4) as u32).to_be_bytes());
        assert_eq!(&reassembled[4..], &message);
    }

    #[test]
    fn test_iteration_is_restartable() {
        let buffer = SendBuffer::new(1, 0, &[1u8; 5000]);
        let first: Vec<u16> = buffer.iter_segments().map(|s| s.order_id).collect();
        let second: Vec<u16> = buffer.iter_segments().map(|s| s.order_id).collect();
        assert_eq!(first, second);
        assert_eq!(first, (0..buffer.segment_count()).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_order_id_panics() {
        let buffer = SendBuffer::new(1, 0, &[0u8; 10]);
        buffer.segment(1);
    }
}
