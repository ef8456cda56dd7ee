//! Traffic sources.
//!
//! A source is a lazy sequence of messages. `next` returns `Ok(None)` once
//! the input ends gracefully and `Err` when it cannot be read any more; both
//! end the source's read loop.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::warn;

use crate::codec::{Decoded, FrameCodec};
use crate::error::SourceError;
use crate::message::Message;
use crate::metrics::Metrics;

pub mod capture;
pub mod file;
pub mod stdin;
pub mod tcp;

pub use capture::CaptureSource;
pub use file::FileSource;
pub use stdin::StdinSource;
pub use tcp::TcpSource;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrafficSource: Send + 'static {
    /// Short identifier used in logs and metric labels
    fn name(&self) -> &str;

    async fn next(&mut self) -> Result<Option<Message>, SourceError>;
}

/// Read the next well-formed message from a framed reader, skipping and
/// counting malformed frames.
pub(crate) async fn next_frame<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    name: &str,
    metrics: &Metrics,
) -> Result<Option<Message>, SourceError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match frames.next().await {
            Some(Ok(Decoded::Message(message))) => return Ok(Some(message)),
            Some(Ok(Decoded::Malformed(e))) => {
                warn!(source = %name, "Skipping malformed frame: {}", e);
                metrics.record_malformed(name);
            }
            Some(Err(e)) => {
                return Err(SourceError::Read {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
            None => return Ok(None),
        }
    }
}
