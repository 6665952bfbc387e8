//! Resync handshake: acknowledging and re-requesting UDP-sent telemetry.
//!
//! Sequence-number lists travel delta-compressed: the first value is an
//! absolute 64-bit number, every following value is a signed 32-bit
//! decrement from the previous one (trackers enumerate newest first, so
//! decrements are the common case; negative decrements are legal). An
//! empty list writes nothing at all, not even the absolute value.

use crate::bytes;

/// Encoded size of a delta list holding `count` sequence numbers.
pub fn delta_list_size(count: usize) -> usize {
    if count > 0 {
        8 + 4 * (count - 1)
    } else {
        0
    }
}

/// Append a delta-compressed list at `pos`, returning the new offset.
///
/// Differences must fit a signed 32-bit integer; with per-device
/// monotonic issuance and at most 255 entries per message this holds for
/// any realistic tracker.
pub fn encode_delta_list(buf: &mut [u8], mut pos: usize, sns: &[u64]) -> usize {
    let mut iter = sns.iter();
    if let Some(&first) = iter.next() {
        pos = bytes::put_u64(buf, pos, first);
        let mut prev = first;
        for &sn in iter {
            pos = bytes::put_i32(buf, pos, prev.wrapping_sub(sn) as u32 as i32);
            prev = sn;
        }
    }
    pos
}

/// Decode `count` sequence numbers starting at `pos`, returning the list
/// and the offset past it.
pub fn decode_delta_list(buf: &[u8], mut pos: usize, count: usize) -> (Vec<u64>, usize) {
    let mut sns = Vec::with_capacity(count);
    if count > 0 {
        let mut sn = bytes::get_u64(buf, pos);
        pos += 8;
        sns.push(sn);
        for _ in 1..count {
            let delta = bytes::get_i32(buf, pos);
            pos += 4;
            sn = sn.wrapping_sub(delta as i64 as u64);
            sns.push(sn);
        }
    }
    (sns, pos)
}

/// Tracker lists the sequence numbers it pushed over UDP so the server
/// can confirm which ones actually arrived.
pub mod resync_request {
    use super::{decode_delta_list, delta_list_size, encode_delta_list};
    use crate::{bytes, wire};
    use uuid::Uuid;

    pub const ID: u16 = 12;

    /// Device id + count byte + padding byte, before the delta list.
    pub const MIN_SIZE: usize = wire::HEADER_SIZE + 16 + 1 + 1;

    const COUNT_OFFSET: usize = wire::HEADER_SIZE + 16;
    const LIST_OFFSET: usize = MIN_SIZE;

    /// Exact wire size for a request carrying `count` sequence numbers.
    pub fn size(count: usize) -> usize {
        MIN_SIZE + delta_list_size(count)
    }

    pub fn encode(buf: &mut [u8], device_id: Uuid, sns: &[u64]) -> usize {
        debug_assert!(sns.len() <= u8::MAX as usize);
        let pos = wire::put_header(buf, size(sns.len()) as u16, ID);
        let pos = bytes::put_device_id(buf, pos, device_id);
        let pos = bytes::put_u8(buf, pos, sns.len() as u8);
        let pos = bytes::put_u8(buf, pos, 0);
        encode_delta_list(buf, pos, sns)
    }

    pub fn device_id(buf: &[u8]) -> Uuid {
        bytes::get_device_id(buf, wire::HEADER_SIZE)
    }

    pub fn count(buf: &[u8]) -> usize {
        bytes::get_u8(buf, COUNT_OFFSET) as usize
    }

    pub fn sequence_numbers(buf: &[u8]) -> Vec<u64> {
        decode_delta_list(buf, LIST_OFFSET, count(buf)).0
    }
}

/// Server's answer: one delta list of acknowledged numbers, one of
/// numbers it never saw and wants retransmitted. Both preserve the order
/// of the request they answer.
pub mod resync_reply {
    use super::{decode_delta_list, delta_list_size, encode_delta_list};
    use crate::{bytes, wire};

    pub const ID: u16 = 13;

    /// Two count bytes, before the (possibly empty) delta lists.
    pub const MIN_SIZE: usize = wire::HEADER_SIZE + 1 + 1;

    const ACK_COUNT_OFFSET: usize = wire::HEADER_SIZE;
    const REQUEST_COUNT_OFFSET: usize = wire::HEADER_SIZE + 1;
    const LIST_OFFSET: usize = MIN_SIZE;

    /// Exact wire size for the given partition counts.
    pub fn size(ack_count: usize, request_count: usize) -> usize {
        MIN_SIZE + delta_list_size(ack_count) + delta_list_size(request_count)
    }

    pub fn encode(buf: &mut [u8], acks: &[u64], requests: &[u64]) -> usize {
        debug_assert!(acks.len() <= u8::MAX as usize);
        debug_assert!(requests.len() <= u8::MAX as usize);
        let pos = wire::put_header(buf, size(acks.len(), requests.len()) as u16, ID);
        let pos = bytes::put_u8(buf, pos, acks.len() as u8);
        let pos = bytes::put_u8(buf, pos, requests.len() as u8);
        let pos = encode_delta_list(buf, pos, acks);
        encode_delta_list(buf, pos, requests)
    }

    pub fn ack_count(buf: &[u8]) -> usize {
        bytes::get_u8(buf, ACK_COUNT_OFFSET) as usize
    }

    pub fn request_count(buf: &[u8]) -> usize {
        bytes::get_u8(buf, REQUEST_COUNT_OFFSET) as usize
    }

    /// Decode both partitions: `(acknowledged, requested)`.
    pub fn decode(buf: &[u8]) -> (Vec<u64>, Vec<u64>) {
        let (acks, pos) = decode_delta_list(buf, LIST_OFFSET, ack_count(buf));
        let (requests, _) = decode_delta_list(buf, pos, request_count(buf));
        (acks, requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use uuid::Uuid;

    fn round_trip(sns: &[u64]) -> Vec<u64> {
        let mut buf = vec![0u8; delta_list_size(sns.len())];
        let end = encode_delta_list(&mut buf, 0, sns);
        assert_eq!(end, buf.len());
        let (decoded, end) = decode_delta_list(&buf, 0, sns.len());
        assert_eq!(end, buf.len());
        decoded
    }

    #[test]
    fn test_delta_list_round_trip() {
        assert_eq!(round_trip(&[]), Vec::<u64>::new());
        assert_eq!(round_trip(&[42]), vec![42]);
        assert_eq!(round_trip(&[15, 12, 10, 5]), vec![15, 12, 10, 5]);
        // out of order and increasing runs both survive
        assert_eq!(round_trip(&[7, 900, 3, 3, 250]), vec![7, 900, 3, 3, 250]);
    }

    #[test]
    fn test_delta_list_round_trip_all_counts() {
        for n in 0..=255u64 {
            let sns: Vec<u64> = (0..n).map(|i| 1_000_000 - i * 3).collect();
            assert_eq!(round_trip(&sns), sns);
        }
    }

    #[test]
    fn test_delta_encoding_matches_wire_layout() {
        // 15, 12, 10 encodes as abs 15, decrement 3, decrement 2
        let mut buf = [0u8; 16];
        encode_delta_list(&mut buf, 0, &[15, 12, 10]);
        assert_eq!(bytes::get_u64(&buf, 0), 15);
        assert_eq!(bytes::get_i32(&buf, 8), 3);
        assert_eq!(bytes::get_i32(&buf, 12), 2);
    }

    #[test]
    fn test_resync_request_round_trip() {
        let id = Uuid::from_u64_pair(7, 9);
        let sns = [15u64, 12, 10, 5];
        let mut buf = vec![0u8; resync_request::size(sns.len())];
        let end = resync_request::encode(&mut buf, id, &sns);

        assert_eq!(end, buf.len());
        assert_eq!(wire::size(&buf) as usize, buf.len());
        assert_eq!(wire::id(&buf), resync_request::ID);
        assert_eq!(resync_request::device_id(&buf), id);
        assert_eq!(resync_request::count(&buf), 4);
        assert_eq!(resync_request::sequence_numbers(&buf), sns);
    }

    #[test]
    fn test_resync_reply_round_trip() {
        let acks = [15u64, 12, 10];
        let requests = [5u64];
        let mut buf = vec![0u8; resync_reply::size(acks.len(), requests.len())];
        let end = resync_reply::encode(&mut buf, &acks, &requests);

        assert_eq!(end, buf.len());
        assert_eq!(wire::size(&buf) as usize, buf.len());
        assert_eq!(resync_reply::ack_count(&buf), 3);
        assert_eq!(resync_reply::request_count(&buf), 1);
        let (a, r) = resync_reply::decode(&buf);
        assert_eq!(a, acks);
        assert_eq!(r, requests);
    }

    #[test]
    fn test_resync_reply_empty_partitions_write_nothing() {
        let mut buf = vec![0u8; resync_reply::size(0, 2)];
        resync_reply::encode(&mut buf, &[], &[8, 7]);
        // no absolute value for the empty ack partition
        assert_eq!(buf.len(), resync_reply::MIN_SIZE + 12);
        let (a, r) = resync_reply::decode(&buf);
        assert!(a.is_empty());
        assert_eq!(r, vec![8, 7]);

        let mut buf = vec![0u8; resync_reply::size(0, 0)];
        resync_reply::encode(&mut buf, &[], &[]);
        assert_eq!(buf.len(), resync_reply::MIN_SIZE);
    }
}
