//! Netstring-style framing over a TCP byte stream.
//!
//! The decoder is a two-state machine: it accumulates ASCII digits until the
//! delimiter arrives, then waits until exactly that many body bytes are
//! buffered. A frame is only ever produced once the full byte count has been
//! read, no matter how the underlying stream was fragmented. A delimiter with
//! no preceding digits produces no frame.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::payload::WirePayload;

/// Separates the decimal length prefix from the frame body.
pub const DELIMITER: u8 = b':';

/// Upper bound on a declared body length. Anything larger is a protocol
/// error, not a buffer to allocate.
pub const MAX_FRAME_LEN: usize = 1 << 20;

// A length prefix longer than this cannot describe a body under
// MAX_FRAME_LEN anyway.
const MAX_PREFIX_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingLength,
    AwaitingBody(usize),
}

/// Codec for `<decimal length>:<body>` frames.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingLength,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        loop {
            match self.state {
                DecodeState::AwaitingLength => {
                    let Some(pos) = src.iter().position(|&b| b == DELIMITER) else {
                        if let Some(&bad) = src.iter().find(|&&b| !b.is_ascii_digit()) {
                            return Err(WireError::BadLength(bad));
                        }
                        if src.len() > MAX_PREFIX_DIGITS {
                            return Err(WireError::LengthOverflow);
                        }
                        return Ok(None);
                    };

                    let digits = src.split_to(pos);
                    src.advance(1);

                    if let Some(&bad) = digits.iter().find(|&&b| !b.is_ascii_digit()) {
                        return Err(WireError::BadLength(bad));
                    }
                    // A bare delimiter carries no frame.
                    if digits.is_empty() {
                        continue;
                    }

                    let text = std::str::from_utf8(&digits).expect("digits are ASCII");
                    let len: usize = text.parse().map_err(|_| WireError::LengthOverflow)?;
                    if len > MAX_FRAME_LEN {
                        return Err(WireError::Oversized {
                            len,
                            max: MAX_FRAME_LEN,
                        });
                    }
                    self.state = DecodeState::AwaitingBody(len);
                }
                DecodeState::AwaitingBody(len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len).freeze();
                    self.state = DecodeState::AwaitingLength;
                    return Ok(Some(body));
                }
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(WireError::Oversized {
                len: body.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let prefix = body.len().to_string();
        dst.reserve(prefix.len() + 1 + body.len());
        dst.extend_from_slice(prefix.as_bytes());
        dst.extend_from_slice(&[DELIMITER]);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Encoder<WirePayload> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, payload: WirePayload, dst: &mut BytesMut) -> Result<(), WireError> {
        let body = payload.encode()?;
        <Self as Encoder<Bytes>>::encode(self, body, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new()
            .encode(Bytes::copy_from_slice(body), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn whole_frame_in_one_read() {
        let mut codec = FrameCodec::new();
        let mut buf = frame(b"hello");
        assert_eq!(buf.iter().as_slice(), b"5:hello");

        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_split_across_every_byte() {
        let wire = frame(b"fragmented body");
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut out = None;

        for &b in wire.iter() {
            buf.extend_from_slice(&[b]);
            if let Some(body) = codec.decode(&mut buf).unwrap() {
                out = Some(body);
            }
        }
        assert_eq!(&out.unwrap()[..], b"fragmented body");
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = frame(b"one");
        buf.extend_from_slice(&frame(b"two"));

        let mut codec = FrameCodec::new();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bare_delimiter_produces_no_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"::3:abc"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"abc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn zero_length_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"0:"[..]);
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn non_digit_in_prefix_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"5x:hello"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::BadLength(b'x'))
        ));
    }

    #[test]
    fn oversized_declaration_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(format!("{}:", MAX_FRAME_LEN + 1).as_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::Oversized { .. })
        ));
    }

    #[test]
    fn runaway_prefix_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"99999999999999999999"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::LengthOverflow)
        ));
    }

    #[test]
    fn body_waits_for_exact_byte_count() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"10:abc"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"defg");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"hij");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"abcdefghij");
    }
}
