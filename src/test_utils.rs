//! In-memory sources and sinks for exercising the emitter.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::SourceError;
use crate::input::TrafficSource;
use crate::message::Message;
use crate::output::{Overflow, TrafficSink, WriteOutcome};

/// What a [`VecSource`] does after its last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTail {
    End,
    Fail,
    /// Never yields again
    Hang,
}

pub struct VecSource {
    name: String,
    messages: VecDeque<Message>,
    tail: SourceTail,
    start_delay: Option<Duration>,
    interval: Option<Duration>,
}

impl VecSource {
    pub fn new(name: &str, messages: Vec<Message>, tail: SourceTail) -> Self {
        Self {
            name: name.to_string(),
            messages: messages.into(),
            tail,
            start_delay: None,
            interval: None,
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

#[async_trait]
impl TrafficSource for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        if let Some(delay) = self.start_delay.take() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.messages.pop_front() {
            if let Some(interval) = self.interval {
                tokio::time::sleep(interval).await;
            }
            return Ok(Some(message));
        }
        match self.tail {
            SourceTail::End => Ok(None),
            SourceTail::Fail => Err(SourceError::Read {
                name: self.name.clone(),
                reason: "boom".into(),
            }),
            SourceTail::Hang => std::future::pending().await,
        }
    }
}

/// Numbered requests with distinct payloads.
pub fn requests(count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| Message::request(format!("GET /{i} HTTP/1.1\r\n\r\n")))
        .collect()
}

/// Records every message it is given.
pub struct RecordingSink {
    name: String,
    written: Arc<Mutex<Vec<Message>>>,
    delay: Option<Duration>,
    max_in_flight: usize,
}

impl RecordingSink {
    pub fn new(name: &str) -> (Self, Arc<Mutex<Vec<Message>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Self {
            name: name.to_string(),
            written: written.clone(),
            delay: None,
            max_in_flight: 1,
        };
        (sink, written)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }
}

#[async_trait]
impl TrafficSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, message: Arc<Message>) -> WriteOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.written.lock().unwrap().push((*message).clone());
        WriteOutcome::Delivered
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

/// A sink whose writes never complete. Its lane drops on overflow.
pub struct StalledSink;

#[async_trait]
impl TrafficSink for StalledSink {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn write(&self, _message: Arc<Message>) -> WriteOutcome {
        std::future::pending().await
    }

    fn overflow(&self) -> Overflow {
        Overflow::Drop
    }
}

/// Returns the same outcome for every write.
pub struct FixedOutcomeSink {
    outcome: WriteOutcome,
    retry_budget: u32,
}

impl FixedOutcomeSink {
    pub fn new(outcome: WriteOutcome, retry_budget: u32) -> Self {
        Self {
            outcome,
            retry_budget,
        }
    }
}

#[async_trait]
impl TrafficSink for FixedOutcomeSink {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn write(&self, _message: Arc<Message>) -> WriteOutcome {
        self.outcome.clone()
    }

    fn retry_budget(&self) -> u32 {
        self.retry_budget
    }
}
