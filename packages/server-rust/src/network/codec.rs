//! Async request framing on top of the pure netstring functions in `scgi_core`.
//!
//! [`HeaderBlockCodec`] is a `tokio_util` decoder for the `<len>:<block>,`
//! head of a request. [`read_request`] drives it against a socket and then
//! reads exactly `CONTENT_LENGTH` bytes of body.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use scgi_core::netstring::{check_terminator, decode_header_block, scan_length_prefix, LengthPrefix};
use scgi_core::HeaderSet;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

use crate::error::ConnectionError;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum DecodeState {
    #[default]
    Prefix,
    Block {
        length: usize,
    },
}

/// Decodes one netstring header block into a [`HeaderSet`].
///
/// The decoder never buffers more than one read chunk while looking for the
/// length prefix, and it leaves any bytes after the terminating `,` in the
/// source buffer for the body reader.
#[derive(Debug, Default)]
pub struct HeaderBlockCodec {
    state: DecodeState,
}

impl Decoder for HeaderBlockCodec {
    type Item = HeaderSet;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HeaderSet>, ConnectionError> {
        loop {
            match self.state {
                DecodeState::Prefix => match scan_length_prefix(src)? {
                    LengthPrefix::Incomplete => return Ok(None),
                    LengthPrefix::Complete { length, consumed } => {
                        src.advance(consumed);
                        self.state = DecodeState::Block { length };
                    }
                },
                DecodeState::Block { length } => {
                    // Block plus the terminating comma.
                    if src.len() <= length {
                        src.reserve((length + 1 - src.len()).min(READ_CHUNK));
                        return Ok(None);
                    }
                    let payload = src.split_to(length);
                    let terminator = src.get_u8();
                    self.state = DecodeState::Prefix;
                    check_terminator(terminator)?;
                    return Ok(Some(decode_header_block(&payload)?));
                }
            }
        }
    }
}

/// Reads one request head and its body from `reader`.
///
/// # Errors
///
/// Returns [`ConnectionError::Protocol`] for framing errors and
/// [`ConnectionError::Transport`] for I/O failures, including the peer
/// closing before the head or body is complete.
pub async fn read_request<R>(reader: &mut R) -> Result<(HeaderSet, Bytes), ConnectionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut codec = HeaderBlockCodec::default();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let headers = loop {
        if let Some(headers) = codec.decode(&mut buf)? {
            break headers;
        }
        buf.reserve(READ_CHUNK);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(premature_eof());
        }
    };

    let length = headers.content_length();
    // Pipelined bytes past the body are not part of this request.
    let mut body = buf.split_to(buf.len().min(length));
    while body.len() < length {
        body.reserve((length - body.len()).min(READ_CHUNK));
        if reader.read_buf(&mut body).await? == 0 {
            return Err(premature_eof());
        }
        if body.len() > length {
            body.truncate(length);
        }
    }

    Ok((headers, body.freeze()))
}

fn premature_eof() -> ConnectionError {
    ConnectionError::Transport(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "peer closed before the request was complete",
    ))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use scgi_core::netstring::encode_request;
    use scgi_core::{LengthFault, ProtocolError, CONTENT_LENGTH};
    use tokio::io::AsyncWriteExt;

    use super::*;

    const CANONICAL: &[u8] = b"24:CONTENT_LENGTH\x000\x00SCGI\x001\x00,";

    #[test]
    fn decodes_canonical_request() {
        let mut codec = HeaderBlockCodec::default();
        let mut buf = BytesMut::from(CANONICAL);

        let headers = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(headers.get(CONTENT_LENGTH), Some("0"));
        assert_eq!(headers.get("SCGI"), Some("1"));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_byte_by_byte() {
        let mut codec = HeaderBlockCodec::default();
        let mut buf = BytesMut::new();

        for (i, byte) in CANONICAL.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < CANONICAL.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(decoded.unwrap().len(), 2);
            }
        }
    }

    #[test]
    fn leaves_body_bytes_in_buffer() {
        let mut codec = HeaderBlockCodec::default();
        let mut buf = BytesMut::from(&b"17:CONTENT_LENGTH\x005\x00,hello"[..]);

        let headers = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(headers.content_length(), 5);
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn rejects_missing_comma() {
        let mut codec = HeaderBlockCodec::default();
        let mut buf = BytesMut::from(&b"17:CONTENT_LENGTH\x000\x00;"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::MalformedTerminator { found: b';' })
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        // Declared length is one byte short, so the comma check lands on the
        // final NUL.
        let mut codec = HeaderBlockCodec::default();
        let mut buf = BytesMut::from(&b"23:CONTENT_LENGTH\x000\x00SCGI\x001\x00,"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::MalformedTerminator { found: 0 })
        ));
    }

    #[test]
    fn rejects_overlong_prefix_before_colon_arrives() {
        let mut codec = HeaderBlockCodec::default();
        let mut buf = BytesMut::from(&b"99999999999"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::MalformedLength(LengthFault::TooManyDigits))
        ));
    }

    #[tokio::test]
    async fn read_request_with_body() {
        let headers: HeaderSet = [(CONTENT_LENGTH, "11"), ("SCGI", "1"), ("REQUEST_METHOD", "POST")]
            .into_iter()
            .collect();
        let wire = encode_request(&headers, b"hello world");

        let (decoded, body) = read_request(&mut &wire[..]).await.unwrap();
        assert_eq!(decoded, headers);
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn read_request_ignores_bytes_past_body() {
        let headers: HeaderSet = [(CONTENT_LENGTH, "2")].into_iter().collect();
        let wire = encode_request(&headers, b"okEXTRA");

        let (_, body) = read_request(&mut &wire[..]).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn read_request_body_spanning_many_reads() {
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let headers: HeaderSet = [(CONTENT_LENGTH, body.len().to_string())].into_iter().collect();
        let wire = encode_request(&headers, &body);

        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            client.write_all(&wire).await.unwrap();
            client
        });

        let (_, decoded) = read_request(&mut server).await.unwrap();
        assert_eq!(&decoded[..], &body[..]);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn read_request_missing_content_length_has_empty_body() {
        let wire = b"7:SCGI\x001\x00,";
        let (headers, body) = read_request(&mut &wire[..]).await.unwrap();
        assert_eq!(headers.get("SCGI"), Some("1"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn read_request_truncated_head_is_transport_error() {
        let wire = b"24:CONTENT_LENGTH\x000";
        let err = read_request(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn read_request_truncated_body_is_transport_error() {
        let wire = b"17:CONTENT_LENGTH\x009\x00,short";
        let err = read_request(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(_)));
    }

    proptest! {
        #[test]
        fn chunked_delivery_decodes_same_head(
            chunk in 1usize..32,
            body in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut headers = HeaderSet::new();
            headers.insert(CONTENT_LENGTH, body.len().to_string());
            headers.insert("SCGI", "1");
            headers.insert("REQUEST_URI", "/a/b?c=d");
            let wire = encode_request(&headers, &body);

            let mut codec = HeaderBlockCodec::default();
            let mut buf = BytesMut::new();
            let mut decoded = None;
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                if decoded.is_none() {
                    decoded = codec.decode(&mut buf).unwrap();
                }
            }

            prop_assert_eq!(decoded, Some(headers));
            prop_assert_eq!(&buf[..], &body[..]);
        }
    }
}
