//! Self-delimited wire framing for messages.
//!
//! Every frame is a header line followed by exactly `len` payload bytes and a
//! delimiter:
//!
//! ```text
//! <kind> <correlation-id> <timestamp-ns> <len>\n<payload>\n🐵🙈🙉\n
//! ```
//!
//! The payload length makes arbitrary payloads round-trip exactly, including
//! payloads that contain the delimiter. The delimiter lets a reader skip a
//! corrupt frame and pick up at the next one. The same framing is used on the
//! middleware pipes, by the file and socket sinks, and by the file, socket and
//! stdin sources.

use bytes::{Buf, BufMut, BytesMut};
use std::borrow::Borrow;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::message::{CorrelationId, Message, MessageKind};

/// Separator written after every payload.
pub const FRAME_DELIMITER: &[u8] = "\n🐵🙈🙉\n".as_bytes();

/// Upper bound on the header line, generous for a 20-digit timestamp and length.
const MAX_HEADER_LEN: usize = 128;

/// Default upper bound on a single payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Output of the decoder: either a message or a report of a frame that was
/// skipped. Malformed frames never terminate the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Message(Message),
    Malformed(CodecError),
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    /// Set after a malformed frame; input is discarded until the next delimiter.
    skipping: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            skipping: false,
        }
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload,
            skipping: false,
        }
    }

    fn malformed(&mut self, err: CodecError) -> Option<Decoded> {
        self.skipping = true;
        Some(Decoded::Malformed(err))
    }

    /// Discard bytes up to and including the next delimiter.
    ///
    /// Returns `false` when more input is needed to find it.
    fn skip_to_delimiter(&mut self, src: &mut BytesMut) -> bool {
        match find(src, FRAME_DELIMITER) {
            Some(pos) => {
                src.advance(pos + FRAME_DELIMITER.len());
                self.skipping = false;
                true
            }
            None => {
                // Keep a tail that may hold the start of a split delimiter.
                let keep = FRAME_DELIMITER.len() - 1;
                if src.len() > keep {
                    src.advance(src.len() - keep);
                }
                false
            }
        }
    }
}

struct FrameHeader {
    kind: MessageKind,
    correlation_id: CorrelationId,
    timestamp: u64,
    len: usize,
}

fn parse_header(line: &[u8]) -> Result<FrameHeader, CodecError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| CodecError::InvalidHeader("header is not UTF-8".into()))?;
    let mut fields = text.split(' ');

    let (Some(kind), Some(id), Some(timestamp), Some(len), None) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(CodecError::InvalidHeader(format!(
            "expected 4 fields in {text:?}"
        )));
    };

    let kind = match kind.as_bytes() {
        [marker] => MessageKind::from_marker(*marker)?,
        _ => return Err(CodecError::InvalidHeader(format!("bad kind {kind:?}"))),
    };
    let correlation_id = id.parse::<CorrelationId>()?;
    let timestamp = timestamp
        .parse::<u64>()
        .map_err(|_| CodecError::InvalidHeader(format!("bad timestamp {timestamp:?}")))?;
    let len = len
        .parse::<usize>()
        .map_err(|_| CodecError::InvalidHeader(format!("bad length {len:?}")))?;

    Ok(FrameHeader {
        kind,
        correlation_id,
        timestamp,
        len,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, io::Error> {
        if self.skipping && !self.skip_to_delimiter(src) {
            return Ok(None);
        }

        let header_end = match src.iter().take(MAX_HEADER_LEN + 1).position(|b| *b == b'\n') {
            Some(pos) => pos,
            None if src.len() > MAX_HEADER_LEN => {
                return Ok(self.malformed(CodecError::InvalidHeader("header too long".into())));
            }
            None => return Ok(None),
        };

        let header = match parse_header(&src[..header_end]) {
            Ok(header) => header,
            Err(e) => return Ok(self.malformed(e)),
        };

        if header.len > self.max_payload {
            return Ok(self.malformed(CodecError::FrameTooLarge(self.max_payload)));
        }

        let payload_start = header_end + 1;
        let payload_end = payload_start + header.len;
        let frame_end = payload_end + FRAME_DELIMITER.len();

        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        if &src[payload_end..frame_end] != FRAME_DELIMITER {
            return Ok(self.malformed(CodecError::MissingDelimiter));
        }

        let frame = src.split_to(frame_end).freeze();
        let payload = frame.slice(payload_start..payload_end);

        Ok(Some(Decoded::Message(Message {
            kind: header.kind,
            correlation_id: header.correlation_id,
            timestamp: header.timestamp,
            payload,
        })))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        src.clear();
        if std::mem::take(&mut self.skipping) {
            // Tail of a frame already reported as malformed.
            return Ok(None);
        }
        Ok(Some(Decoded::Malformed(CodecError::Truncated)))
    }
}

impl<M: Borrow<Message>> Encoder<M> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), io::Error> {
        let message = item.borrow();
        if message.payload.len() > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                CodecError::FrameTooLarge(self.max_payload),
            ));
        }
        encode_frame(message, dst);
        Ok(())
    }
}

/// Append one encoded frame to `dst`.
pub fn encode_frame(message: &Message, dst: &mut BytesMut) {
    let header = format!(
        "{} {} {} {}\n",
        message.kind.marker() as char,
        message.correlation_id,
        message.timestamp,
        message.payload.len()
    );
    dst.reserve(header.len() + message.payload.len() + FRAME_DELIMITER.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(&message.payload);
    dst.put_slice(FRAME_DELIMITER);
}

/// Encode a single message into a standalone buffer.
pub fn encode_to_bytes(message: &Message) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(message, &mut buf);
    buf
}
