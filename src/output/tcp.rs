use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{TrafficSink, WriteOutcome};
use crate::codec::encode_to_bytes;
use crate::message::Message;

/// Forwards framed messages to a remote instance's tcp input.
///
/// The connection is opened on first use and re-opened after any I/O error
/// or timeout.
pub struct TcpSink {
    name: String,
    address: String,
    retry_budget: u32,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpSink {
    pub fn new(address: impl Into<String>, retry_budget: u32, timeout: Duration) -> Self {
        let address = address.into();
        Self {
            name: format!("tcp:{address}"),
            address,
            retry_budget: retry_budget.max(1),
            timeout,
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TrafficSink for TcpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, message: Arc<Message>) -> WriteOutcome {
        let frame = encode_to_bytes(&message);
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    info!(sink = %self.name, "Connected to peer");
                    *guard = Some(stream);
                }
                Ok(Err(e)) => {
                    return WriteOutcome::Retryable(format!("connect failed: {e}"));
                }
                Err(_) => return WriteOutcome::Retryable("connect timed out".into()),
            }
        }

        let Some(stream) = guard.as_mut() else {
            return WriteOutcome::Retryable("not connected".into());
        };

        // A frame cut short by a timeout leaves the peer to resync; the
        // retry goes out on a fresh connection.
        match tokio::time::timeout(self.timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(sink = %self.name, "Write failed, dropping connection: {}", e);
                *guard = None;
                return WriteOutcome::Retryable(format!("write failed: {e}"));
            }
            Err(_) => {
                warn!(sink = %self.name, "Write timed out, dropping connection");
                *guard = None;
                return WriteOutcome::Retryable("write timed out".into());
            }
        }

        debug!(sink = %self.name, correlation_id = %message.correlation_id, "Forwarded frame");
        WriteOutcome::Delivered
    }

    fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}
