use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use super::{next_frame, TrafficSource};
use crate::codec::FrameCodec;
use crate::error::SourceError;
use crate::message::Message;
use crate::metrics::Metrics;

/// Frames read from standard input, or from any reader in tests.
pub struct StdinSource<R = tokio::io::Stdin> {
    name: String,
    frames: FramedRead<R, FrameCodec>,
    metrics: Arc<Metrics>,
}

impl StdinSource {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::from_reader("stdin", tokio::io::stdin(), metrics)
    }
}

impl<R: AsyncRead + Unpin> StdinSource<R> {
    pub fn from_reader(name: impl Into<String>, reader: R, metrics: Arc<Metrics>) -> Self {
        Self {
            name: name.into(),
            frames: FramedRead::new(reader, FrameCodec::new()),
            metrics,
        }
    }
}

#[async_trait]
impl<R> TrafficSource for StdinSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        next_frame(&mut self.frames, &self.name, &self.metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_to_bytes;

    #[tokio::test]
    async fn test_reads_frames_then_ends() {
        let first = Message::request("GET /1 HTTP/1.1\r\n\r\n");
        let second = Message::request("GET /2 HTTP/1.1\r\n\r\n");
        let mut input = encode_to_bytes(&first).to_vec();
        input.extend_from_slice(b"garbage line\n\xF0\x9F\x90\xB5\xF0\x9F\x99\x88\xF0\x9F\x99\x89\n");
        input.extend_from_slice(&encode_to_bytes(&second));

        let reader = tokio_test::io::Builder::new().read(&input).build();
        let metrics = Arc::new(Metrics::new());
        let mut source = StdinSource::from_reader("stdin", reader, metrics.clone());

        assert_eq!(source.next().await.unwrap(), Some(first));
        assert_eq!(source.next().await.unwrap(), Some(second));
        assert_eq!(source.next().await.unwrap(), None);
        assert_eq!(
            metrics.malformed_frames.with_label_values(&["stdin"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let reader = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pipe closed",
            ))
            .build();
        let mut source = StdinSource::from_reader("stdin", reader, Arc::new(Metrics::new()));

        assert!(matches!(
            source.next().await,
            Err(SourceError::Read { .. })
        ));
    }
}
