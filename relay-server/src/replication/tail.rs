//! JSONL tail reader
//!
//! Follows a newline-delimited JSON file of row changes, one
//! `{"database","table","event_type","data"}` object per line. After each
//! complete line the position `(file name, byte offset after the line)` is
//! reported. Partial trailing lines wait for their newline.

use super::reader::{ReaderSink, StreamReader, StreamReaderFactory};
use super::types::{ReplicationError, ReplicationResult, RowEvent, StreamPosition};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct JsonlTailReader {
    path: PathBuf,
    file_name: String,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl JsonlTailReader {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let path = path.into();
        let file_name = source_name(&path);
        Self {
            path,
            file_name,
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

#[async_trait]
impl StreamReader for JsonlTailReader {
    async fn run_from(
        &self,
        start: Option<StreamPosition>,
        sink: Arc<dyn ReaderSink>,
    ) -> ReplicationResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ReplicationError::Reader("reader already closed".to_string()));
        }

        // A checkpoint from another file means the source was replaced
        let mut offset = match start {
            Some(position) if position.file_name == self.file_name => position.offset,
            Some(position) => {
                warn!(
                    "Checkpoint names {} but source is {}, reading from the start",
                    position.file_name, self.file_name
                );
                0
            }
            None => 0,
        };

        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if u64::from(offset) > len {
            warn!(
                "Checkpoint offset {} beyond {} ({} bytes), reading from the start",
                offset,
                self.path.display(),
                len
            );
            offset = 0;
        }
        file.seek(SeekFrom::Start(u64::from(offset))).await?;
        info!("Tailing {} from offset {}", self.path.display(), offset);

        let mut reader = BufReader::new(file);
        let mut line = String::new();

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = reader.read_line(&mut line) => read?,
            };

            if read == 0 || !line.ends_with('\n') {
                // EOF, possibly mid-line: keep the partial line and poll
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }

            let consumed = u32::try_from(line.len())
                .ok()
                .and_then(|n| offset.checked_add(n))
                .ok_or_else(|| {
                    ReplicationError::Reader(format!(
                        "{} exceeds the 4 GiB position range",
                        self.file_name
                    ))
                })?;

            let trimmed = line.trim();
            if !trimmed.is_empty() {
                match serde_json::from_str::<RowEvent>(trimmed) {
                    Ok(event) => sink.on_row(event).await?,
                    Err(e) => warn!("Skipping malformed row at offset {}: {}", offset, e),
                }
            }

            offset = consumed;
            sink.on_position_synced(StreamPosition::new(self.file_name.clone(), offset))
                .await?;
            line.clear();
        }

        debug!("Tail of {} stopped at offset {}", self.path.display(), offset);
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Builds tail readers over one source file
pub struct JsonlReaderFactory {
    path: PathBuf,
    poll_interval: Duration,
}

impl JsonlReaderFactory {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }
}

impl StreamReaderFactory for JsonlReaderFactory {
    fn create(&self) -> ReplicationResult<Arc<dyn StreamReader>> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| {
            ReplicationError::Reader(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(ReplicationError::Reader(format!(
                "{} is not a file",
                self.path.display()
            )));
        }
        Ok(Arc::new(JsonlTailReader::new(
            self.path.clone(),
            self.poll_interval,
        )))
    }
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
