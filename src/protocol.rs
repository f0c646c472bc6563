//! Wire protocol: length-prefixed binary frames.
//!
//! Every frame is an 8-byte header (4-byte big-endian magic, 4-byte
//! big-endian body length) followed by exactly `len` body bytes. There is
//! no version field; a protocol change requires a new magic value.
//!
//! The codec makes no attempt to recover from a corrupted framing boundary:
//! a bad magic or a short read means the caller must tear the connection
//! down.

use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

/// Protocol constant that starts every frame.
pub const MAGIC: u32 = 0x1234_5678;

/// Fixed header size: magic + body length, both `u32` big-endian.
pub const HEADER_SIZE: usize = 8;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub len: u32,
}

/// Benchmark payload envelope.
///
/// The body is opaque to the server except for this best-effort decode:
/// `ts` is the client's send timestamp in unix milliseconds, used only to
/// record a latency sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub ts: i64,
}

/// Encode `body` as a single frame: header + body, unmodified.
pub fn pack(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u32(MAGIC);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Read one frame from `reader`.
///
/// Fails with [`FrameError::ShortRead`] if the stream ends before a full
/// header or body arrives, [`FrameError::BadMagic`] on a magic mismatch,
/// and [`FrameError::TooLarge`] if the declared body length exceeds
/// `max_len`. The length check runs before the body allocation, so a
/// hostile peer cannot force an unbounded buffer.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_len: usize,
) -> Result<(Header, Vec<u8>), FrameError> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).map_err(map_eof)?;

    let header = Header {
        magic: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        len: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
    };

    if header.magic != MAGIC {
        return Err(FrameError::BadMagic {
            found: header.magic,
        });
    }

    let len = header.len as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(map_eof)?;

    Ok((header, body))
}

fn map_eof(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::ShortRead
    } else {
        FrameError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const TEST_MAX: usize = 1 << 20;

    #[test]
    fn test_round_trip() {
        let body = br#"{"id":7,"ts":1000}"#;
        let frame = pack(body);
        assert_eq!(frame.len(), HEADER_SIZE + body.len());

        let (header, decoded) = read_frame(&mut Cursor::new(&frame[..]), TEST_MAX).unwrap();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.len as usize, body.len());
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_empty_body_round_trip() {
        let frame = pack(b"");
        let (header, decoded) = read_frame(&mut Cursor::new(&frame[..]), TEST_MAX).unwrap();
        assert_eq!(header.len, 0);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_short_header() {
        let err = read_frame(&mut Cursor::new(&[0x12u8, 0x34, 0x56][..]), TEST_MAX).unwrap_err();
        assert!(matches!(err, FrameError::ShortRead));
    }

    #[test]
    fn test_short_body() {
        let mut frame = pack(b"hello").to_vec();
        frame.truncate(HEADER_SIZE + 2);
        let err = read_frame(&mut Cursor::new(&frame[..]), TEST_MAX).unwrap_err();
        assert!(matches!(err, FrameError::ShortRead));
    }

    #[test]
    fn test_bad_magic() {
        let mut frame = pack(b"payload").to_vec();
        frame[..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());

        let mut cursor = Cursor::new(&frame[..]);
        let err = read_frame(&mut cursor, TEST_MAX).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic { found: 0xDEADBEEF }));
        // The body bytes must not have been consumed.
        assert_eq!(cursor.position() as usize, HEADER_SIZE);
    }

    #[test]
    fn test_body_over_limit() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC.to_be_bytes());
        frame.extend_from_slice(&1024u32.to_be_bytes());
        // No body on purpose: the length check must reject before reading it.
        let err = read_frame(&mut Cursor::new(&frame[..]), 512).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 1024, max: 512 }));
    }

    #[test]
    fn test_message_envelope() {
        let msg = Message { id: 7, ts: 1000 };
        let body = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    proptest! {
        #[test]
        fn prop_round_trip_identity(body in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let frame = pack(&body);
            let (header, decoded) = read_frame(&mut Cursor::new(&frame[..]), TEST_MAX).unwrap();
            prop_assert_eq!(header.magic, MAGIC);
            prop_assert_eq!(header.len as usize, body.len());
            prop_assert_eq!(decoded, body);
        }
    }
}
