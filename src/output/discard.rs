use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{TrafficSink, WriteOutcome};
use crate::message::Message;

/// Sink that accepts everything. Used to measure upstream stages.
pub struct DiscardSink {
    name: String,
    count: AtomicU64,
}

impl Default for DiscardSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscardSink {
    pub fn new() -> Self {
        Self {
            name: "discard".to_string(),
            count: AtomicU64::new(0),
        }
    }

    /// Number of messages written so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TrafficSink for DiscardSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, _message: Arc<Message>) -> WriteOutcome {
        self.count.fetch_add(1, Ordering::Relaxed);
        WriteOutcome::Delivered
    }

    fn max_in_flight(&self) -> usize {
        usize::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_delivered() {
        let sink = DiscardSink::new();
        let message = Arc::new(Message::request("GET / HTTP/1.1\r\n\r\n"));

        assert_eq!(sink.write(message.clone()).await, WriteOutcome::Delivered);
        assert_eq!(sink.write(message).await, WriteOutcome::Delivered);
        assert_eq!(sink.count(), 2);
    }
}
