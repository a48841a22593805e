//! Length-prefixed framing over the socket.
//!
//! Requests go out as `[length][header][body]` where the length prefix
//! covers header and body together. Responses come back as
//! `[length][correlation_id][body]`; the decoder here peels frames off the
//! byte stream one at a time and hands the engine the correlation id along
//! with the untouched body.

use bytes::{Bytes, BytesMut};
use nombytes::NomBytes;
use tokio_util::codec::Decoder;

use crate::{
    encode::ToByte,
    error::{Error, Result},
    protocol::{parse_header_response, HeaderRequest},
};

/// Size of the response staging region: `[length: i32][correlation_id: i32]`.
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// Encode `header` behind a length prefix that also covers a body of
/// `body_len` bytes.
///
/// The body itself is not copied here; the caller writes it as the second
/// slice of the same frame. The prefix is reserved up front and patched
/// once the encoded header size is known.
pub fn encode_request_frame(header: &HeaderRequest<'_>, body_len: usize) -> Result<Bytes> {
    let mut buffer = Vec::with_capacity(32);

    buffer.extend_from_slice(&[0, 0, 0, 0]);
    header.encode(&mut buffer)?;

    let frame_len = buffer.len() - 4 + body_len;
    let size = i32::try_from(frame_len).map_err(|_| Error::EncodingError)?;
    size.encode(&mut &mut buffer[..])?;

    Ok(Bytes::from(buffer))
}

/// One framed response, still carrying its opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub correlation_id: i32,
    pub body: Bytes,
}

/// Where the decoder is inside the current frame.
///
/// `Header` waits for the 8-byte staging region; `Body` waits for the
/// declared remainder. All transitions happen in [`Decoder::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body { correlation_id: i32, remaining: usize },
}

/// Response framing state machine, driven by a
/// [`FramedRead`](tokio_util::codec::FramedRead).
///
/// The decoder only delimits frames; matching the correlation id against
/// the in-flight queue is the engine's job, because only the engine knows
/// which request is at the head.
#[derive(Debug)]
pub struct ResponseFrameDecoder {
    state: DecodeState,
}

impl ResponseFrameDecoder {
    pub fn new() -> ResponseFrameDecoder {
        ResponseFrameDecoder {
            state: DecodeState::Header,
        }
    }
}

impl Default for ResponseFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ResponseFrameDecoder {
    type Item = ResponseFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ResponseFrame>> {
        let (correlation_id, remaining) = match self.state {
            DecodeState::Header => {
                if src.len() < RESPONSE_HEADER_SIZE {
                    src.reserve(RESPONSE_HEADER_SIZE - src.len());
                    return Ok(None);
                }

                let staging = src.split_to(RESPONSE_HEADER_SIZE).freeze();
                let (_, header) = parse_header_response(NomBytes::new(staging))
                    .map_err(|_| Error::DecodingError)?;

                // The length covers the correlation id we just consumed.
                if header.length < 4 {
                    tracing::error!("Invalid response length prefix {}", header.length);
                    return Err(Error::DecodingError);
                }

                let remaining = header.length as usize - 4;
                self.state = DecodeState::Body {
                    correlation_id: header.correlation_id,
                    remaining,
                };
                (header.correlation_id, remaining)
            }
            DecodeState::Body {
                correlation_id,
                remaining,
            } => (correlation_id, remaining),
        };

        if src.len() < remaining {
            src.reserve(remaining - src.len());
            return Ok(None);
        }

        let body = src.split_to(remaining).freeze();
        self.state = DecodeState::Header;
        tracing::trace!(correlation_id, bytes = body.len(), "Read response frame");

        Ok(Some(ResponseFrame {
            correlation_id,
            body,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ResponseFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            // EOF inside a frame means the broker truncated a response.
            None if src.is_empty() && self.state == DecodeState::Header => Ok(None),
            None => Err(Error::ShortRead),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::api_key;

    fn decode_all(decoder: &mut ResponseFrameDecoder, buf: &mut BytesMut) -> Vec<ResponseFrame> {
        let mut frames = vec![];
        while let Some(frame) = decoder.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn request_frame_wire_image() {
        let header = HeaderRequest::new(api_key::API_VERSIONS, 1, "c1");
        let frame = encode_request_frame(&header, 0).unwrap();
        assert_eq!(
            frame.as_ref(),
            [
                0, 0, 0, 12, // length: header only
                0, 18, // api_key
                0, 0, // api_version
                0, 0, 0, 1, // correlation_id
                0, 2, b'c', b'1', // client_id
            ]
        );
    }

    #[test]
    fn request_frame_length_covers_body() {
        let header = HeaderRequest::new(api_key::PRODUCE, 7, "c1");
        let frame = encode_request_frame(&header, 100).unwrap();
        // 4-byte prefix + 12 header bytes on the wire here; prefix counts
        // the header plus the 100 body bytes written separately.
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[..4], [0, 0, 0, 112]);
    }

    #[test]
    fn decodes_a_whole_frame() {
        let mut buf = BytesMut::from(&[0, 0, 0, 7, 0, 0, 0, 1, b'a', b'b', b'c'][..]);
        let mut decoder = ResponseFrameDecoder::new();

        let frames = decode_all(&mut decoder, &mut buf);
        assert_eq!(
            frames,
            vec![ResponseFrame {
                correlation_id: 1,
                body: Bytes::from_static(b"abc"),
            }]
        );
    }

    #[test]
    fn decodes_across_split_reads() {
        let wire = [0, 0, 0, 7, 0, 0, 0, 9, b'x', b'y', b'z'];
        let mut decoder = ResponseFrameDecoder::new();
        let mut buf = BytesMut::new();

        for chunk in wire.chunks(3) {
            buf.extend_from_slice(chunk);
        }
        // Feed one byte short, then the rest.
        let mut partial = buf.split_to(wire.len() - 1);
        assert_eq!(decoder.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        let frame = decoder.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.correlation_id, 9);
        assert_eq!(frame.body, Bytes::from_static(b"xyz"));
    }

    #[test]
    fn zero_length_body_is_valid() {
        let mut buf = BytesMut::from(&[0, 0, 0, 4, 0, 0, 0, 2][..]);
        let mut decoder = ResponseFrameDecoder::new();

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.correlation_id, 2);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn two_back_to_back_frames() {
        let mut buf = BytesMut::from(
            &[
                0, 0, 0, 5, 0, 0, 0, 1, b'a', // frame 1
                0, 0, 0, 4, 0, 0, 0, 2, // frame 2, empty body
            ][..],
        );
        let mut decoder = ResponseFrameDecoder::new();

        let frames = decode_all(&mut decoder, &mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].correlation_id, 1);
        assert_eq!(frames[1].correlation_id, 2);
    }

    #[test]
    fn undersized_length_prefix_is_a_decoding_error() {
        let mut buf = BytesMut::from(&[0, 0, 0, 3, 0, 0, 0, 1][..]);
        let mut decoder = ResponseFrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf), Err(Error::DecodingError));
    }

    #[test]
    fn eof_mid_body_is_a_short_read() {
        // Prefix claims 10 body bytes, stream ends after 5.
        let mut buf = BytesMut::from(&[0, 0, 0, 14, 0, 0, 0, 1, b'a', b'b', b'c', b'd', b'e'][..]);
        let mut decoder = ResponseFrameDecoder::new();

        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(decoder.decode_eof(&mut buf), Err(Error::ShortRead));
    }

    #[test]
    fn eof_mid_header_is_a_short_read() {
        let mut buf = BytesMut::from(&[0, 0, 0][..]);
        let mut decoder = ResponseFrameDecoder::new();
        assert_eq!(decoder.decode_eof(&mut buf), Err(Error::ShortRead));
    }

    #[test]
    fn clean_eof_between_frames() {
        let mut buf = BytesMut::new();
        let mut decoder = ResponseFrameDecoder::new();
        assert_eq!(decoder.decode_eof(&mut buf).unwrap(), None);
    }
}
