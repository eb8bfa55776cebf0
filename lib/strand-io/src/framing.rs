//! Length-delimited framing for stream transports.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many payload bytes. There is no batching and no
//! checksum: one frame carries one channel message.
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use snafu::Snafu;
use tracing::trace;

/// Length of the frame length prefix, in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on the payload length of a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framing error.
#[derive(Debug, Snafu, Eq, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum FramingError {
    /// A frame was larger than the configured limit.
    #[snafu(display("frame of {} bytes exceeds limit of {} bytes", frame_len, max_frame_len))]
    FrameTooLarge {
        /// Length of the offending frame payload.
        frame_len: usize,

        /// Configured frame limit.
        max_frame_len: usize,
    },

    /// The stream ended in the middle of a frame.
    #[snafu(display(
        "stream ended with a partial frame ({} bytes buffered, {} bytes needed)",
        remaining,
        needed
    ))]
    PartialFrame {
        /// Number of bytes needed to complete the frame, length prefix included.
        needed: usize,

        /// Number of bytes left in the buffer.
        remaining: usize,
    },
}

/// Writes `payload` to `dst` as a single length-delimited frame.
///
/// # Errors
///
/// If the payload is longer than `max_frame_len`, or cannot be described by a 32-bit length, an error is returned and
/// nothing is written.
pub fn encode_frame(payload: &[u8], max_frame_len: usize, dst: &mut BytesMut) -> Result<(), FramingError> {
    let limit = max_frame_len.min(u32::MAX as usize);
    if payload.len() > limit {
        return Err(FramingError::FrameTooLarge {
            frame_len: payload.len(),
            max_frame_len: limit,
        });
    }

    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Incremental decoder for length-delimited frames.
///
/// Bytes read from a stream are appended to a buffer, and `decode` is called until it returns `Ok(None)`. Incomplete
/// frames stay in the buffer until more data arrives.
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Creates a new `FrameDecoder` that rejects frames longer than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Returns the frame length limit.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Extracts the next complete frame from `buf`, if any.
    ///
    /// # Errors
    ///
    /// If the length prefix describes a frame longer than the limit, an error is returned. The stream cannot be
    /// resynchronized after this, and the caller should stop reading from it.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
        let frame_len = u32::from_be_bytes(prefix) as usize;
        if frame_len > self.max_frame_len {
            return Err(FramingError::FrameTooLarge {
                frame_len,
                max_frame_len: self.max_frame_len,
            });
        }

        let needed = LENGTH_PREFIX_LEN + frame_len;
        if buf.len() < needed {
            // Make room for the rest of the frame up front rather than growing in small steps.
            buf.reserve(needed - buf.len());
            return Ok(None);
        }

        trace!(frame_len, "Decoded frame.");

        buf.advance(LENGTH_PREFIX_LEN);
        Ok(Some(buf.split_to(frame_len).freeze()))
    }

    /// Extracts the next frame from `buf` once the stream has ended.
    ///
    /// # Errors
    ///
    /// Same as [`decode`][Self::decode], and additionally if the buffer holds a partial frame.
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                let needed = if buf.len() < LENGTH_PREFIX_LEN {
                    LENGTH_PREFIX_LEN
                } else {
                    let mut prefix = [0; LENGTH_PREFIX_LEN];
                    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
                    LENGTH_PREFIX_LEN + u32::from_be_bytes(prefix) as usize
                };
                Err(FramingError::PartialFrame {
                    needed,
                    remaining: buf.len(),
                })
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    use proptest::{collection::vec as arb_vec, prelude::*};

    use super::*;

    fn framed(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(payload, DEFAULT_MAX_FRAME_LEN, &mut buf).unwrap();
        buf
    }

    #[test]
    fn basic() {
        let payload = b"hello, world!";
        let mut buf = framed(payload);
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());

        let frame = FrameDecoder::default()
            .decode(&mut buf)
            .expect("should not fail to read from payload")
            .expect("should not fail to extract frame from payload");

        assert_eq!(&frame[..], payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload() {
        let mut buf = framed(b"");
        assert_eq!(buf.len(), LENGTH_PREFIX_LEN);

        let frame = FrameDecoder::default().decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_read() {
        let payload = b"hello, world!";
        let full = framed(payload);
        let mut decoder = FrameDecoder::default();

        // Not enough bytes for the length prefix itself.
        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(decoder.decode(&mut buf), Ok(None));
        assert_eq!(buf.len(), 3);

        // Length prefix, but only part of the payload.
        let mut buf = BytesMut::from(&full[..7]);
        assert_eq!(decoder.decode(&mut buf), Ok(None));
        assert_eq!(buf.len(), 7);

        // The rest arrives.
        buf.extend_from_slice(&full[7..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_read_eof() {
        let full = framed(b"hello, world!");
        let mut decoder = FrameDecoder::default();

        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(
            decoder.decode_eof(&mut buf),
            Err(FramingError::PartialFrame { needed: 4, remaining: 3 })
        );

        let mut buf = BytesMut::from(&full[..7]);
        assert_eq!(
            decoder.decode_eof(&mut buf),
            Err(FramingError::PartialFrame {
                needed: 17,
                remaining: 7
            })
        );

        let mut buf = BytesMut::new();
        assert_eq!(decoder.decode_eof(&mut buf), Ok(None));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut decoder = FrameDecoder::new(8);
        let mut buf = framed(b"way more than eight bytes");
        assert_eq!(
            decoder.decode(&mut buf),
            Err(FramingError::FrameTooLarge {
                frame_len: 25,
                max_frame_len: 8
            })
        );

        let mut dst = BytesMut::new();
        assert!(encode_frame(&[0; 9], 8, &mut dst).is_err());
        assert!(dst.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = framed(b"one");
        buf.extend_from_slice(&framed(b"two"));
        buf.extend_from_slice(&framed(b"three")[..5]);

        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(decoder.decode(&mut buf), Ok(None));
        assert_eq!(buf.len(), 5);
    }

    proptest! {
        #[test]
        fn property_test_arbitrary_chunking(
            payloads in arb_vec(arb_vec(any::<u8>(), 0..64), 0..16),
            chunk_len in 1usize..32,
        ) {
            let mut stream = BytesMut::new();
            for payload in &payloads {
                encode_frame(payload, DEFAULT_MAX_FRAME_LEN, &mut stream).unwrap();
            }

            // Feed the stream through the decoder in fixed-size chunks, as a socket read loop would.
            let mut decoder = FrameDecoder::default();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_len) {
                buf.extend_from_slice(chunk);
                while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    decoded.push(frame.to_vec());
                }
            }

            prop_assert_eq!(decoder.decode_eof(&mut buf), Ok(None));
            prop_assert_eq!(decoded, payloads);
        }
    }
}
