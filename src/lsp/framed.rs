//! `Content-Length` framing for byte-stream transports.
use crate::lsp::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest body a peer may announce. Bigger frames are reported and skipped
/// by resuming the header search right after the offending header block.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body(usize),
}

/// Codec for `Content-Length: <n>\r\n\r\n<n bytes>` frames.
///
/// Partial headers and bodies stay in the read buffer until the rest arrives.
/// A complete header block without a usable `Content-Length` is yielded as an
/// `Err` item (the block itself is consumed) so the stream keeps decoding the
/// frames behind it; the decoder never fails the underlying stream for it.
#[derive(Debug)]
pub struct ContentLengthCodec {
    state: DecodeState,
}

impl Default for ContentLengthCodec {
    fn default() -> Self {
        ContentLengthCodec {
            state: DecodeState::Header,
        }
    }
}

impl ContentLengthCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Extract Content-Length from a header block. Case-insensitive search;
/// other headers (e.g. `Content-Type`) are ignored.
pub(crate) fn get_content_length_from(header: &str) -> Result<usize, TransportError> {
    for line in header.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<usize>().map_err(|e| {
                    TransportError::Framing(format!("invalid Content-Length '{}': {}", value.trim(), e))
                });
            }
        }
    }
    Err(TransportError::Framing(
        "Content-Length header not found".to_string(),
    ))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

impl Decoder for ContentLengthCodec {
    type Item = Result<Bytes, TransportError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(pos) = find_terminator(src) else {
                        return Ok(None);
                    };
                    let header = src.split_to(pos + HEADER_TERMINATOR.len());
                    let header = match std::str::from_utf8(&header[..pos]) {
                        Ok(header) => header,
                        Err(e) => {
                            return Ok(Some(Err(TransportError::Framing(format!(
                                "header is not valid UTF-8: {}",
                                e
                            )))))
                        }
                    };
                    match get_content_length_from(header) {
                        Ok(length) if length > MAX_FRAME_LEN => {
                            return Ok(Some(Err(TransportError::Framing(format!(
                                "Content-Length {} exceeds the {} byte frame limit",
                                length, MAX_FRAME_LEN
                            )))))
                        }
                        Ok(length) => self.state = DecodeState::Body(length),
                        Err(e) => return Ok(Some(Err(e))),
                    }
                }
                DecodeState::Body(length) => {
                    if src.len() < length {
                        return Ok(None);
                    }
                    let body = src.split_to(length).freeze();
                    self.state = DecodeState::Header;
                    return Ok(Some(Ok(body)));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() && self.state == DecodeState::Header {
            return Ok(None);
        }
        let held = src.remaining();
        let detail = match self.state {
            DecodeState::Body(length) => format!(
                "stream ended inside a frame body ({} of {} bytes)",
                held, length
            ),
            DecodeState::Header => format!("stream ended inside a frame header ({} bytes)", held),
        };
        src.clear();
        self.state = DecodeState::Header;
        Ok(Some(Err(TransportError::Framing(detail))))
    }
}

impl Encoder<String> for ContentLengthCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = format!("Content-Length: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

/// Frame a single JSON body.
pub fn encode_frame(json_body: &str) -> Bytes {
    let mut out = BytesMut::new();
    let header = format!("Content-Length: {}\r\n\r\n", json_body.len());
    out.put_slice(header.as_bytes());
    out.put_slice(json_body.as_bytes());
    out.freeze()
}
