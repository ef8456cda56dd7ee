use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{next_frame, TrafficSource};
use crate::codec::FrameCodec;
use crate::error::SourceError;
use crate::message::Message;
use crate::metrics::Metrics;

const PEER_QUEUE: usize = 1024;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts frames from any number of peers, typically other instances
/// running a tcp sink, and merges them into one stream.
pub struct TcpSource {
    name: String,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
}

impl TcpSource {
    pub async fn bind(address: &str, metrics: Arc<Metrics>) -> Result<Self, SourceError> {
        let name = format!("tcp:{address}");
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| SourceError::Open {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| SourceError::Open {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        info!(source = %name, %local_addr, "Listening for framed traffic");

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            tx,
            name.clone(),
            metrics,
            shutdown.clone(),
        ));

        Ok(Self {
            name,
            local_addr,
            rx,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Message>,
    name: String,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(source = %name, %peer, "Peer connected");
                    tokio::spawn(read_peer(
                        stream,
                        peer,
                        tx.clone(),
                        name.clone(),
                        metrics.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(source = %name, "Accept failed: {}", e);
                    if !pause_after_accept_error(&shutdown).await {
                        break;
                    }
                }
            }
        }
    }
}

/// Returns `false` when shutdown interrupted the pause.
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn read_peer(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Message>,
    name: String,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, FrameCodec::new());
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = next_frame(&mut frames, &name, &metrics) => next,
        };
        match next {
            Ok(Some(message)) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(source = %name, %peer, "Peer disconnected");
                return;
            }
            Err(e) => {
                warn!(source = %name, %peer, "Dropping peer: {}", e);
                return;
            }
        }
    }
}

impl Drop for TcpSource {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TrafficSource for TcpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        match self.rx.recv().await {
            Some(message) => Ok(Some(message)),
            None => Err(SourceError::Closed(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{TcpSink, TrafficSink};

    #[tokio::test]
    async fn test_merges_frames_from_several_peers() {
        let metrics = Arc::new(Metrics::new());
        let mut source = TcpSource::bind("127.0.0.1:0", metrics).await.unwrap();
        let address = source.local_addr().to_string();

        let first = TcpSink::new(address.clone(), 1, Duration::from_secs(5));
        let second = TcpSink::new(address, 1, Duration::from_secs(5));
        let a = Message::request("GET /from-a HTTP/1.1\r\n\r\n");
        let b = Message::request("GET /from-b HTTP/1.1\r\n\r\n");

        assert!(first.write(Arc::new(a.clone())).await.is_delivered());
        assert!(second.write(Arc::new(b.clone())).await.is_delivered());

        let mut received = vec![
            source.next().await.unwrap().unwrap(),
            source.next().await.unwrap().unwrap(),
        ];
        received.sort_by_key(|m| m.payload.clone());
        assert_eq!(received, vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off() {
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(pause_after_accept_error(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        shutdown.cancel();
        let started = tokio::time::Instant::now();
        assert!(!pause_after_accept_error(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let metrics = Arc::new(Metrics::new());
        let taken = TcpSource::bind("127.0.0.1:0", metrics.clone()).await.unwrap();
        let result = TcpSource::bind(&taken.local_addr().to_string(), metrics).await;
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }
}
