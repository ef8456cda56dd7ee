//! Append-only recording of messages.
//!
//! Each record is encoded into one buffer and appended with a single write,
//! so a record is either wholly present or torn at the end of the file. A
//! failed append is cut back to the previous record at once; a torn tail left
//! by a crash is cut off the next time the file is opened.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::{TrafficSink, WriteOutcome};
use crate::codec::{encode_to_bytes, FRAME_DELIMITER};
use crate::error::SinkError;
use crate::message::Message;

const RECOVERY_CHUNK: u64 = 64 * 1024;

pub struct FileSink {
    name: String,
    recording: Mutex<Recording>,
    sync: bool,
}

struct Recording {
    file: File,
    /// End of the last complete record
    len: u64,
    /// Set when a failed append could not be cut back
    broken: bool,
}

impl Recording {
    async fn append(&mut self, record: &[u8], sync: bool) -> Result<(), String> {
        self.file
            .write_all(record)
            .await
            .map_err(|e| format!("write failed: {e}"))?;
        self.file
            .flush()
            .await
            .map_err(|e| format!("flush failed: {e}"))?;
        if sync {
            self.file
                .sync_data()
                .await
                .map_err(|e| format!("fsync failed: {e}"))?;
        }
        self.len += record.len() as u64;
        Ok(())
    }

    /// Drop whatever a failed append left after the last complete record.
    async fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len).await
    }
}

impl FileSink {
    pub async fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let name = format!("file:{}", path.display());
        let open_error = |e: std::io::Error| SinkError::Open {
            name: name.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_error)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(open_error)?;

        let removed = truncate_torn_tail(&mut file).await.map_err(open_error)?;
        if removed > 0 {
            warn!(
                path = %path.display(),
                removed_bytes = removed,
                "Removed torn trailing record"
            );
        }

        let len = file.metadata().await.map_err(open_error)?.len();

        Ok(Self {
            name,
            recording: Mutex::new(Recording {
                file,
                len,
                broken: false,
            }),
            sync,
        })
    }
}

/// Cut the file back to the end of its last complete record.
///
/// Returns the number of bytes removed.
async fn truncate_torn_tail(file: &mut File) -> std::io::Result<u64> {
    let len = file.metadata().await?.len();
    let delimiter_len = FRAME_DELIMITER.len() as u64;
    if len == 0 {
        return Ok(0);
    }

    if len >= delimiter_len {
        let mut tail = vec![0u8; FRAME_DELIMITER.len()];
        file.seek(SeekFrom::Start(len - delimiter_len)).await?;
        file.read_exact(&mut tail).await?;
        if tail == FRAME_DELIMITER {
            return Ok(0);
        }
    }

    // Walk backwards for the last delimiter. Windows overlap so a delimiter
    // split across a chunk boundary is still found.
    let overlap = delimiter_len - 1;
    let mut end = len;
    let mut valid_len = 0;
    loop {
        let start = end.saturating_sub(RECOVERY_CHUNK);
        let mut chunk = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut chunk).await?;

        if let Some(pos) = chunk
            .windows(FRAME_DELIMITER.len())
            .rposition(|window| window == FRAME_DELIMITER)
        {
            valid_len = start + pos as u64 + delimiter_len;
            break;
        }
        if start == 0 {
            break;
        }
        end = start + overlap;
    }

    file.set_len(valid_len).await?;
    Ok(len - valid_len)
}

#[async_trait]
impl TrafficSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, message: Arc<Message>) -> WriteOutcome {
        let record = encode_to_bytes(&message);
        let mut recording = self.recording.lock().await;
        if recording.broken {
            return WriteOutcome::Dropped("recording is unusable after a failed write".into());
        }

        if let Err(reason) = recording.append(&record, self.sync).await {
            if let Err(e) = recording.rollback().await {
                error!(
                    sink = %self.name,
                    "Cannot cut back a failed write, refusing further writes: {}",
                    e
                );
                recording.broken = true;
            }
            return WriteOutcome::Dropped(reason);
        }

        debug!(
            sink = %self.name,
            correlation_id = %message.correlation_id,
            bytes = record.len(),
            "Recorded message"
        );
        WriteOutcome::Delivered
    }

    async fn close(&self) {
        let mut recording = self.recording.lock().await;
        let file = &mut recording.file;
        if let Err(e) = file.flush().await {
            warn!(sink = %self.name, "Failed to flush on close: {}", e);
        }
        if let Err(e) = file.sync_all().await {
            warn!(sink = %self.name, "Failed to sync on close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoded, FrameCodec};
    use crate::message::{CorrelationId, MessageKind};
    use bytes::BytesMut;
    use tempfile::TempDir;
    use tokio_util::codec::Decoder;

    fn read_records(path: &Path) -> Vec<Decoded> {
        let data = std::fs::read(path).unwrap();
        let mut buf = BytesMut::from(&data[..]);
        let mut codec = FrameCodec::new();
        let mut records = Vec::new();
        while let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
            records.push(frame);
        }
        records
    }

    #[tokio::test]
    async fn test_records_match_inputs_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.gor");
        let sink = FileSink::open(&path, false).await.unwrap();

        let id = CorrelationId::new();
        let messages = vec![
            Message::new(MessageKind::RequestCaptured, id, 1, "GET /a HTTP/1.1\r\n\r\n"),
            Message::new(MessageKind::ResponseCaptured, id, 2, "HTTP/1.1 200 OK\r\n\r\n"),
            Message::new(
                MessageKind::RequestCaptured,
                CorrelationId::new(),
                3,
                "GET /b HTTP/1.1\r\n\r\n",
            ),
        ];

        for message in &messages {
            let outcome = sink.write(Arc::new(message.clone())).await;
            assert_eq!(outcome, WriteOutcome::Delivered);
        }
        sink.close().await;

        let expected: Vec<_> = messages.into_iter().map(Decoded::Message).collect();
        assert_eq!(read_records(&path), expected);
    }

    #[tokio::test]
    async fn test_duplicate_correlation_ids_produce_independent_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dup.gor");
        let sink = FileSink::open(&path, true).await.unwrap();

        let message = Arc::new(Message::request("POST /dup HTTP/1.1\r\n\r\nbody"));
        sink.write(message.clone()).await;
        sink.write(message.clone()).await;
        sink.close().await;

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        for record in records {
            assert_eq!(record, Decoded::Message((*message).clone()));
        }
    }

    #[tokio::test]
    async fn test_reopen_cuts_torn_tail_and_keeps_appending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.gor");

        let first = Message::request("GET /first HTTP/1.1\r\n\r\n");
        let torn = encode_to_bytes(&Message::request("GET /torn HTTP/1.1\r\n\r\n"));
        let mut contents = encode_to_bytes(&first).to_vec();
        contents.extend_from_slice(&torn[..torn.len() - 5]);
        std::fs::write(&path, &contents).unwrap();

        let sink = FileSink::open(&path, false).await.unwrap();
        let second = Message::request("GET /second HTTP/1.1\r\n\r\n");
        sink.write(Arc::new(second.clone())).await;
        sink.close().await;

        assert_eq!(
            read_records(&path),
            vec![Decoded::Message(first), Decoded::Message(second)]
        );
    }

    #[tokio::test]
    async fn test_failed_append_is_cut_back_before_the_next_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.gor");
        let sink = FileSink::open(&path, false).await.unwrap();

        let a = Message::request("GET /a HTTP/1.1\r\n\r\n");
        assert!(sink.write(Arc::new(a.clone())).await.is_delivered());

        // Half a frame, as an append interrupted by ENOSPC would leave it.
        let torn = encode_to_bytes(&Message::request("GET /lost HTTP/1.1\r\n\r\n"));
        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(&torn[..torn.len() / 2]).unwrap();
        }
        sink.recording.lock().await.rollback().await.unwrap();

        let b = Message::request("GET /b HTTP/1.1\r\n\r\n");
        assert!(sink.write(Arc::new(b.clone())).await.is_delivered());
        sink.close().await;

        assert_eq!(
            read_records(&path),
            vec![Decoded::Message(a), Decoded::Message(b)]
        );
    }

    #[tokio::test]
    async fn test_file_without_any_complete_record_is_emptied() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.gor");
        std::fs::write(&path, b"1 partial header").unwrap();

        let sink = FileSink::open(&path, false).await.unwrap();
        sink.close().await;

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
