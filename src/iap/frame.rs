//! Relay subprotocol frames.
//!
//! Every frame starts with a big-endian u16 tag. Success and Data frames
//! carry a u32 length followed by that many bytes; Ack frames carry a u64
//! cumulative byte count.

use bytes::{BufMut, Bytes, BytesMut};

/// Maximum body length of a Success or Data frame.
pub const MAX_FRAME_LEN: usize = 16384;

pub const TAG_SUCCESS: u16 = 0x0001;
pub const TAG_DATA: u16 = 0x0004;
pub const TAG_ACK: u16 = 0x0007;

/// Serialize one Data frame. `payload` must not exceed [`MAX_FRAME_LEN`];
/// callers chunk larger writes.
pub fn encode_data(payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_FRAME_LEN);

    let mut buf = BytesMut::with_capacity(6 + payload.len());
    buf.put_u16(TAG_DATA);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Serialize one Ack frame carrying the cumulative received byte count.
pub fn encode_ack(received: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u16(TAG_ACK);
    buf.put_u64(received);
    buf.freeze()
}

#[cfg(test)]
pub fn encode_success(session_id: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + session_id.len());
    buf.put_u16(TAG_SUCCESS);
    buf.put_u32(session_id.len() as u32);
    buf.put_slice(session_id);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_data() {
        let frame = encode_data(b"abc");
        assert_eq!(&frame[..], &[0x00, 0x04, 0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_data_empty() {
        let frame = encode_data(b"");
        assert_eq!(&frame[..], &[0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_ack() {
        let frame = encode_ack(0x0102030405060708);
        assert_eq!(
            &frame[..],
            &[0x00, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_encode_success() {
        let frame = encode_success(b"x");
        assert_eq!(&frame[..], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'x']);
    }
}
