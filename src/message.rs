//! The unit of traffic moved through the pipeline.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CodecError;

/// Width of a correlation id rendered as hexadecimal text.
pub const CORRELATION_ID_HEX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// An original request seen on the wire
    RequestCaptured,
    /// The original response to a captured request
    ResponseCaptured,
    /// A response obtained by replaying a request against a sink
    ReplayedResponse,
}

impl MessageKind {
    /// Single-byte marker used by the wire framing.
    pub fn marker(self) -> u8 {
        match self {
            MessageKind::RequestCaptured => b'1',
            MessageKind::ResponseCaptured => b'2',
            MessageKind::ReplayedResponse => b'3',
        }
    }

    pub fn from_marker(marker: u8) -> Result<Self, CodecError> {
        match marker {
            b'1' => Ok(MessageKind::RequestCaptured),
            b'2' => Ok(MessageKind::ResponseCaptured),
            b'3' => Ok(MessageKind::ReplayedResponse),
            other => Err(CodecError::UnknownKind(other)),
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, MessageKind::RequestCaptured)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::RequestCaptured => "request",
            MessageKind::ResponseCaptured => "response",
            MessageKind::ReplayedResponse => "replayed_response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Join key between a request and every response derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for CorrelationId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Only the fixed-width simple form is accepted on the wire.
        if s.len() != CORRELATION_ID_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CodecError::InvalidCorrelationId(s.to_string()));
        }
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|_| CodecError::InvalidCorrelationId(s.to_string()))
    }
}

/// Nanoseconds since the Unix epoch, the timestamp base used everywhere.
pub fn now_nanos() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or_default()
}

/// A captured HTTP message.
///
/// Messages are immutable once created and are shared between sinks as
/// `Arc<Message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub correlation_id: CorrelationId,
    pub timestamp: u64,
    pub payload: Bytes,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        correlation_id: CorrelationId,
        timestamp: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind,
            correlation_id,
            timestamp,
            payload: payload.into(),
        }
    }

    /// A freshly captured request with a new correlation id, stamped now.
    pub fn request(payload: impl Into<Bytes>) -> Self {
        Self::new(
            MessageKind::RequestCaptured,
            CorrelationId::new(),
            now_nanos(),
            payload,
        )
    }

    /// A message of `kind` that shares this message's correlation id.
    pub fn derive(&self, kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self::new(kind, self.correlation_id, now_nanos(), payload)
    }
}
