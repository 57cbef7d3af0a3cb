use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

use crate::segment::Segment;

/// Reassembly state for one inbound transaction.
///
/// Segments may arrive in any order and duplicated. In-order bytes are
///  streamed into `read_buf` eagerly; only the out-of-order tail is kept in
///  `saved`, so completion just flushes what little is left.
///
/// The first 4 body bytes of segment 0 are the total payload length *including
///  those 4 bytes*; `read_length` counts raw segment bodies, which include the
///  same 4 bytes, so the completion comparison is self-consistent.
pub struct ReceiveBuffer {
    inner: Mutex<ReceiveBufferInner>,
}

struct ReceiveBufferInner {
    read_buf: Vec<u8>,
    need_length: u32,
    read_length: u32,
    /// bodies received out of order, keyed by order id, not yet in `read_buf`
    saved: BTreeMap<u16, Vec<u8>>,
    /// the next order id expected in-order; one past `u16` once every possible
    ///  order id has been drained, hence the wider type
    next_id: u32,
    /// the largest order id ever seen
    largest_order_id: u16,
    /// set the moment the full payload length is accounted for; a completed
    ///  buffer ignores every further segment and must be replaced by the
    ///  caller when the transaction id is reused
    completed: bool,
}

impl ReceiveBuffer {
    pub fn new() -> ReceiveBuffer {
        ReceiveBuffer {
            inner: Mutex::new(ReceiveBufferInner {
                read_buf: Vec::new(),
                need_length: 0,
                read_length: 0,
                saved: BTreeMap::new(),
                next_id: 0,
                largest_order_id: 0,
                completed: false,
            }),
        }
    }

    /// Merge one segment; returns the complete user payload the first time the
    ///  message is fully accounted for, `None` otherwise.
    pub fn save(&self, segment: &Segment) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();

        if inner.completed {
            return None;
        }

        let order_id = segment.order_id;
        if (order_id as u32) < inner.next_id || inner.saved.contains_key(&order_id) {
            warn!(
                "duplicate segment: trans {} order {}",
                segment.trans_id, order_id
            );
            return None;
        }

        if order_id == 0 && segment.body.len() < 4 {
            warn!("initial segment of trans {} is missing the length prefix", segment.trans_id);
            return None;
        }

        inner.read_length += segment.body.len() as u32;
        if inner.largest_order_id < order_id {
            inner.largest_order_id = order_id;
        }

        if order_id as u32 == inner.next_id {
            if order_id == 0 {
                inner.need_length =
                    u32::from_be_bytes([segment.body[0], segment.body[1], segment.body[2], segment.body[3]]);
                inner.read_buf.extend_from_slice(&segment.body[4..]);
            } else {
                inner.read_buf.extend_from_slice(&segment.body);
            }

            // drain the contiguous run that was waiting on this segment
            loop {
                inner.next_id += 1;
                let Ok(next) = u16::try_from(inner.next_id) else {
                    break;
                };
                match inner.saved.remove(&next) {
                    Some(body) => inner.read_buf.extend_from_slice(&body),
                    None => break,
                }
            }
        } else {
            inner.saved.insert(order_id, segment.body.clone());
        }

        if inner.need_length > 0 && inner.read_length >= inner.need_length {
            inner.completed = true;
            // flush whatever is still parked out of order, ascending
            let saved = std::mem::take(&mut inner.saved);
            for (_, body) in saved {
                inner.read_buf.extend_from_slice(&body);
            }
            return Some(std::mem::take(&mut inner.read_buf));
        }

        None
    }

    /// The largest order id seen so far plus the sorted order ids in
    ///  `[next_id, largest_order_id)` that have not arrived. `(0, [])` once
    ///  completed.
    pub fn missing(&self) -> (u16, Vec<u16>) {
        let inner = self.inner.lock().unwrap();

        if inner.completed {
            return (0, Vec::new());
        }

        let missing = (inner.next_id..inner.largest_order_id as u32)
            .map(|order_id| order_id as u16)
            .filter(|order_id| !inner.saved.contains_key(order_id))
            .collect();
        (inner.largest_order_id, missing)
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().unwrap().completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentKind;
    use rstest::rstest;

    fn trans_segment(order_id: u16, body: Vec<u8>) -> Segment {
        Segment::new(SegmentKind::Trans, 0, 1, 0, order_id, body).unwrap()
    }

    /// carve `message` the way the sender does: 4-byte length prefix, then
    ///  bodies of at most `body_max` bytes
    fn segments_for(message: &[u8], body_max: usize) -> Vec<Segment> {
        let mut payload = ((message.len() + 4) as u32).to_be_bytes().to_vec();
        payload.extend_from_slice(message);

        payload
            .chunks(body_max)
            .enumerate()
            .map(|(i, chunk)| trans_segment(i as u16, chunk.to_vec()))
            .collect()
    }

    #[test]
    fn test_single_segment_message() {
        let buffer = ReceiveBuffer::new();
        let segments = segments_for(b"hello", 100);
        assert_eq!(segments.len(), 1);

        let delivered = buffer.save(&segments[0]);
        assert_eq!(delivered.as_deref(), Some(b"hello".as_slice()));
        assert!(buffer.is_completed());
    }

    #[test]
    fn test_in_order_delivery() {
        let message: Vec<u8> = (0..=255).cycle().take(1000).map(|b: u16| b as u8).collect();
        let segments = segments_for(&message, 64);
        let buffer = ReceiveBuffer::new();

        let mut delivered = None;
        for segment in &segments {
            let result = buffer.save(segment);
            if result.is_some() {
                assert!(delivered.is_none(), "delivered more than once");
                delivered = result;
            }
        }
        assert_eq!(delivered.unwrap(), message);
    }

    #[rstest]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::interleaved(vec![1, 3, 0, 2])]
    #[case::tail_first(vec![3, 0, 1, 2])]
    #[case::with_duplicates(vec![2, 2, 0, 1, 0, 3])]
    fn test_out_of_order_delivery(#[case] order: Vec<usize>) {
        let message: Vec<u8> = (0u16..500).map(|b| b as u8).collect();
        let segments = segments_for(&message, 128);
        assert_eq!(segments.len(), 4);

        let buffer = ReceiveBuffer::new();
        let mut delivered = None;
        for &idx in &order {
            if let Some(result) = buffer.save(&segments[idx]) {
                assert!(delivered.is_none(), "delivered more than once");
                delivered = Some(result);
            }
        }
        assert_eq!(delivered.unwrap(), message);
    }

    #[test]
    fn test_segments_after_completion_are_ignored() {
        let segments = segments_for(b"payload", 100);
        let buffer = ReceiveBuffer::new();

        assert!(buffer.save(&segments[0]).is_some());
        assert!(buffer.save(&segments[0]).is_none());
        assert!(buffer.is_completed());
        assert_eq!(buffer.missing(), (0, vec![]));
    }

    #[test]
    fn test_duplicate_does_not_inflate_read_length() {
        let message = vec![7u8; 300];
        let segments = segments_for(&message, 128);
        assert_eq!(segments.len(), 3);

        let buffer = ReceiveBuffer::new();
        assert!(buffer.save(&segments[1]).is_none());
        assert!(buffer.save(&segments[1]).is_none()); // duplicate of saved
        assert!(buffer.save(&segments[0]).is_none());
        assert!(buffer.save(&segments[0]).is_none()); // duplicate of drained

        let delivered = buffer.save(&segments[2]).expect("completion");
        assert_eq!(delivered, message);
    }

    #[test]
    fn test_missing_reports_gaps_sorted() {
        let message = vec![1u8; 1000];
        let segments = segments_for(&message, 128);
        assert_eq!(segments.len(), 8);

        let buffer = ReceiveBuffer::new();
        buffer.save(&segments[0]);
        buffer.save(&segments[2]);
        buffer.save(&segments[6]);

        let (largest, missing) = buffer.missing();
        assert_eq!(largest, 6);
        assert_eq!(missing, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_missing_on_untouched_buffer() {
        let buffer = ReceiveBuffer::new();
        assert_eq!(buffer.missing(), (0, vec![]));
        assert!(!buffer.is_completed());
    }

    #[test]
    fn test_tail_loss_reports_no_gaps() {
        // only the tail is lost: everything up to `largest` arrived, so the
        //  missing list is empty and the sender works off `largest` alone
        let message = vec![9u8; 1000];
        let segments = segments_for(&message, 128);

        let buffer = ReceiveBuffer::new();
        for segment in &segments[..5] {
            buffer.save(segment);
        }

        let (largest, missing) = buffer.missing();
        assert_eq!(largest, 4);
        assert!(missing.is_empty());
    }

    #[test]
    fn test_initial_segment_without_prefix_is_dropped() {
        let buffer = ReceiveBuffer::new();
        let bogus = trans_segment(0, vec![1, 2]);
        assert!(buffer.save(&bogus).is_none());
        assert!(!buffer.is_completed());
        assert_eq!(buffer.missing(), (0, vec![]));
    }
}
