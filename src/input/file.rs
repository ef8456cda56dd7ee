use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use super::{next_frame, TrafficSource};
use crate::codec::FrameCodec;
use crate::error::SourceError;
use crate::message::Message;
use crate::metrics::Metrics;

/// Longest pause honoured between two recorded messages.
const MAX_REPLAY_GAP: Duration = Duration::from_secs(60);

/// Replays a recording made by the file sink.
pub struct FileSource {
    name: String,
    path: PathBuf,
    looping: bool,
    speed: f64,
    frames: FramedRead<File, FrameCodec>,
    metrics: Arc<Metrics>,
    /// Timestamp of the previously returned message, for pacing
    previous: Option<u64>,
    /// Messages returned since the file was last opened
    read_this_pass: u64,
}

impl FileSource {
    pub async fn open(
        path: impl AsRef<Path>,
        looping: bool,
        speed: f64,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let name = format!("file:{}", path.display());
        let frames = open_frames(&path, &name).await?;

        Ok(Self {
            name,
            path,
            looping,
            speed,
            frames,
            metrics,
            previous: None,
            read_this_pass: 0,
        })
    }

    async fn pace(&mut self, timestamp: u64) {
        if self.speed <= 0.0 {
            return;
        }
        if let Some(previous) = self.previous.replace(timestamp) {
            let gap = timestamp.saturating_sub(previous) as f64 / self.speed;
            let delay = Duration::from_nanos(gap as u64).min(MAX_REPLAY_GAP);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn open_frames(path: &Path, name: &str) -> Result<FramedRead<File, FrameCodec>, SourceError> {
    let file = File::open(path).await.map_err(|e| SourceError::Open {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(FramedRead::new(file, FrameCodec::new()))
}

#[async_trait]
impl TrafficSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        loop {
            if let Some(message) = next_frame(&mut self.frames, &self.name, &self.metrics).await? {
                self.read_this_pass += 1;
                self.pace(message.timestamp).await;
                return Ok(Some(message));
            }

            // A pass with no messages would spin forever.
            if !self.looping || self.read_this_pass == 0 {
                info!(source = %self.name, "Reached end of file");
                return Ok(None);
            }

            debug!(source = %self.name, messages = self.read_this_pass, "Restarting replay");
            self.frames = open_frames(&self.path, &self.name).await?;
            self.previous = None;
            self.read_this_pass = 0;
        }
    }
}
