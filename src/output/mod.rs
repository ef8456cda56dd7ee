//! Traffic sinks.
//!
//! A sink consumes messages one at a time and reports an outcome for each
//! write. Sinks never see each other's outcomes; the emitter runs every sink
//! on its own dispatch lane.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::message::{Message, MessageKind};

pub mod discard;
pub mod file;
pub mod http;
mod rate_limit;
pub mod tcp;

pub use discard::DiscardSink;
pub use file::FileSink;
pub use http::HttpSink;
pub use tcp::TcpSink;

/// Result of one `write` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Delivered,
    /// The attempt failed but another attempt may succeed
    Retryable(String),
    /// The message will not be delivered to this sink
    Dropped(String),
}

impl WriteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WriteOutcome::Delivered => "delivered",
            WriteOutcome::Retryable(_) => "retryable",
            WriteOutcome::Dropped(_) => "dropped",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, WriteOutcome::Delivered)
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Delivered => f.write_str("delivered"),
            WriteOutcome::Retryable(reason) => write!(f, "retryable: {reason}"),
            WriteOutcome::Dropped(reason) => write!(f, "dropped: {reason}"),
        }
    }
}

/// What a dispatch lane does with a message when it is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Hold the producer until the lane has room
    Wait,
    /// Report the message `Dropped("lane full")` and move on
    Drop,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrafficSink: Send + Sync + 'static {
    /// Short identifier used in logs and metric labels
    fn name(&self) -> &str;

    /// Write one message. Implementations must tolerate duplicate
    /// correlation ids.
    async fn write(&self, message: Arc<Message>) -> WriteOutcome;

    /// Whether messages of this kind should be offered at all
    fn accepts(&self, _kind: MessageKind) -> bool {
        true
    }

    /// Writes a single dispatch lane may have outstanding at once
    fn max_in_flight(&self) -> usize {
        1
    }

    /// Sinks with their own admission limits drop instead of slowing the
    /// producer.
    fn overflow(&self) -> Overflow {
        Overflow::Wait
    }

    /// Total attempts per message, including the first
    fn retry_budget(&self) -> u32 {
        1
    }

    /// Release connections and handles
    async fn close(&self) {}
}
