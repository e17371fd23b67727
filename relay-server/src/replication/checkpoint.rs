//! Durable checkpoint cache
//!
//! One record per node, overwritten in place at offset 0:
//!
//! ```text
//! crc32 u32 | name_len u16 | offset u32 | event_index i64 | name
//! ```
//!
//! All integers little-endian. The checksum covers every byte after it.

use super::types::{ReplicationError, ReplicationResult, StreamPosition};
use std::cmp::Ordering;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fixed part of an encoded record
pub const RECORD_HEADER_LEN: usize = 4 + 2 + 4 + 8;

/// File under the data dir holding the checkpoint record
pub const CHECKPOINT_FILE: &str = "checkpoint.cache";

/// Durable position in the upstream stream plus the event counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub file_name: String,
    pub offset: u32,
    pub event_index: i64,
}

impl Checkpoint {
    pub fn new(file_name: impl Into<String>, offset: u32, event_index: i64) -> Self {
        Self {
            file_name: file_name.into(),
            offset,
            event_index,
        }
    }

    pub fn position(&self) -> StreamPosition {
        StreamPosition::new(self.file_name.clone(), self.offset)
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.file_name.as_bytes();
        let name_len = name.len().min(u16::MAX as usize);

        let mut body = Vec::with_capacity(RECORD_HEADER_LEN - 4 + name_len);
        body.extend_from_slice(&(name_len as u16).to_le_bytes());
        body.extend_from_slice(&self.offset.to_le_bytes());
        body.extend_from_slice(&self.event_index.to_le_bytes());
        body.extend_from_slice(&name[..name_len]);

        let mut record = Vec::with_capacity(4 + body.len());
        record.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        record.extend_from_slice(&body);
        record
    }

    pub fn decode(data: &[u8]) -> ReplicationResult<Self> {
        if data.len() < RECORD_HEADER_LEN {
            return Err(ReplicationError::InvalidCheckpoint(format!(
                "record too short: {} bytes",
                data.len()
            )));
        }

        let expected = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let name_len = u16::from_le_bytes([data[4], data[5]]) as usize;
        let total = RECORD_HEADER_LEN + name_len;
        if data.len() < total {
            return Err(ReplicationError::InvalidCheckpoint(format!(
                "name truncated: need {} bytes, have {}",
                total,
                data.len()
            )));
        }

        let actual = crc32fast::hash(&data[4..total]);
        if actual != expected {
            return Err(ReplicationError::ChecksumMismatch { expected, actual });
        }

        let offset = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
        let mut index = [0u8; 8];
        index.copy_from_slice(&data[10..18]);
        let file_name = std::str::from_utf8(&data[RECORD_HEADER_LEN..total])
            .map_err(|e| ReplicationError::InvalidCheckpoint(e.to_string()))?
            .to_string();

        Ok(Self {
            file_name,
            offset,
            event_index: i64::from_le_bytes(index),
        })
    }

    /// True when `self` is at or past `other` in the stream
    ///
    /// Files compare in rotation order, see [`compare_file_names`].
    pub fn supersedes(&self, other: &Checkpoint) -> bool {
        match compare_file_names(&self.file_name, &other.file_name) {
            Ordering::Equal => self.offset >= other.offset,
            order => order == Ordering::Greater,
        }
    }
}

/// Rotation order of two log file names
///
/// Names sharing a stem with numeric extensions (`log.9`, `log.10`) compare
/// by number, so padding is optional. Anything else compares as strings.
pub fn compare_file_names(a: &str, b: &str) -> Ordering {
    match (numbered(a), numbered(b)) {
        (Some((stem_a, n_a)), Some((stem_b, n_b))) if stem_a == stem_b => n_a.cmp(&n_b),
        _ => a.cmp(b),
    }
}

fn numbered(name: &str) -> Option<(&str, u64)> {
    let (stem, suffix) = name.rsplit_once('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().map(|n| (stem, n))
}

struct StoreState {
    file: File,
    current: Option<Checkpoint>,
    closed: bool,
}

/// Single-record checkpoint file
///
/// The file handle, the cached record and the closed flag share one lock so
/// writers are serialized per process.
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl CheckpointStore {
    /// Open (or create) the cache and load the stored record
    ///
    /// A corrupt record is logged and treated as absent.
    pub async fn open(path: impl AsRef<Path>) -> ReplicationResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        let current = if data.is_empty() {
            debug!("No checkpoint stored at {}", path.display());
            None
        } else {
            match Checkpoint::decode(&data) {
                Ok(checkpoint) => {
                    info!(
                        "Loaded checkpoint {}:{} (event index {})",
                        checkpoint.file_name, checkpoint.offset, checkpoint.event_index
                    );
                    Some(checkpoint)
                }
                Err(e) => {
                    warn!("Ignoring unreadable checkpoint at {}: {}", path.display(), e);
                    None
                }
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                file,
                current,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn current(&self) -> Option<Checkpoint> {
        self.state.lock().await.current.clone()
    }

    /// Persist `checkpoint` unconditionally (leader path)
    pub async fn save(&self, checkpoint: &Checkpoint) -> ReplicationResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ReplicationError::Closed);
        }
        write_record(&mut state.file, checkpoint).await?;
        state.current = Some(checkpoint.clone());
        Ok(())
    }

    /// Persist `checkpoint` unless the stored one is further along (follower path)
    ///
    /// Positions are ordered by [`Checkpoint::supersedes`].
    /// Returns whether the record was written. Applying the same record twice
    /// leaves the same state as applying it once.
    pub async fn apply(&self, checkpoint: &Checkpoint) -> ReplicationResult<bool> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ReplicationError::Closed);
        }
        if let Some(current) = &state.current {
            if current == checkpoint {
                return Ok(false);
            }
            if !checkpoint.supersedes(current) {
                debug!(
                    "Skipping older checkpoint {}:{} (have {}:{})",
                    checkpoint.file_name, checkpoint.offset, current.file_name, current.offset
                );
                return Ok(false);
            }
        }
        write_record(&mut state.file, checkpoint).await?;
        state.current = Some(checkpoint.clone());
        Ok(true)
    }

    /// Flush and refuse further writes
    pub async fn close(&self) -> ReplicationResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.file.sync_all().await?;
        debug!("Checkpoint store {} closed", self.path.display());
        Ok(())
    }
}

async fn write_record(file: &mut File, checkpoint: &Checkpoint) -> ReplicationResult<()> {
    let record = checkpoint.encode();
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&record).await?;
    // A shorter file name leaves stale bytes behind without this
    file.set_len(record.len() as u64).await?;
    file.sync_data().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_layout() {
        let record = Checkpoint::new("mysql-bin.000003", 1234, 42).encode();
        assert_eq!(record.len(), RECORD_HEADER_LEN + 16);
        assert_eq!(u16::from_le_bytes([record[4], record[5]]), 16);
        assert_eq!(
            u32::from_le_bytes([record[6], record[7], record[8], record[9]]),
            1234
        );
        assert_eq!(&record[RECORD_HEADER_LEN..], b"mysql-bin.000003");
        assert_eq!(
            Checkpoint::decode(&record).unwrap(),
            Checkpoint::new("mysql-bin.000003", 1234, 42)
        );
    }

    #[test]
    fn test_corruption_detected() {
        let mut record = Checkpoint::new("log.1", 10, 1).encode();
        record[7] ^= 0x01;
        assert!(matches!(
            Checkpoint::decode(&record),
            Err(ReplicationError::ChecksumMismatch { .. })
        ));

        let record = Checkpoint::new("log.1", 10, 1).encode();
        assert!(matches!(
            Checkpoint::decode(&record[..RECORD_HEADER_LEN + 2]),
            Err(ReplicationError::InvalidCheckpoint(_))
        ));
        assert!(matches!(
            Checkpoint::decode(&record[..5]),
            Err(ReplicationError::InvalidCheckpoint(_))
        ));
    }

    #[test]
    fn test_supersedes() {
        let base = Checkpoint::new("log.2", 100, 5);
        assert!(base.supersedes(&base));
        assert!(Checkpoint::new("log.2", 101, 0).supersedes(&base));
        assert!(Checkpoint::new("log.3", 4, 0).supersedes(&base));
        assert!(!Checkpoint::new("log.2", 99, 9).supersedes(&base));
        assert!(!Checkpoint::new("log.1", 900, 9).supersedes(&base));
    }

    #[test]
    fn test_unpadded_rotation_numbers() {
        let nine = Checkpoint::new("log.9", 100, 9);
        let ten = Checkpoint::new("log.10", 4, 10);
        assert!(ten.supersedes(&nine));
        assert!(!nine.supersedes(&ten));

        assert!(
            Checkpoint::new("mysql-bin.000010", 4, 0)
                .supersedes(&Checkpoint::new("mysql-bin.000009", 900, 0))
        );
        assert_eq!(compare_file_names("changes.jsonl", "changes.jsonl"), Ordering::Equal);
        // Different stems fall back to string order
        assert_eq!(compare_file_names("a.10", "b.9"), Ordering::Less);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join(CHECKPOINT_FILE);

        let store = CheckpointStore::open(&path).await.unwrap();
        assert_eq!(store.current().await, None);
        store
            .save(&Checkpoint::new("binlog.000010", 4096, 7))
            .await
            .unwrap();
        // Shorter name must not leave a torn tail
        store.save(&Checkpoint::new("b.1", 8, 8)).await.unwrap();
        store.close().await.unwrap();

        let reopened = CheckpointStore::open(&path).await.unwrap();
        assert_eq!(reopened.current().await, Some(Checkpoint::new("b.1", 8, 8)));
    }

    #[tokio::test]
    async fn test_corrupt_file_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        std::fs::write(&path, b"not a checkpoint record at all").unwrap();

        let store = CheckpointStore::open(&path).await.unwrap();
        assert_eq!(store.current().await, None);
        store.save(&Checkpoint::new("f", 1, 1)).await.unwrap();
        assert_eq!(store.current().await, Some(Checkpoint::new("f", 1, 1)));
    }

    #[tokio::test]
    async fn test_apply_is_last_write_wins_by_position() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join(CHECKPOINT_FILE))
            .await
            .unwrap();

        let newer = Checkpoint::new("log.2", 50, 20);
        assert!(store.apply(&newer).await.unwrap());
        assert!(!store.apply(&newer).await.unwrap());
        assert!(
            !store
                .apply(&Checkpoint::new("log.1", 999, 30))
                .await
                .unwrap()
        );
        assert_eq!(store.current().await, Some(newer.clone()));

        let rotated = Checkpoint::new("log.10", 4, 21);
        assert!(store.apply(&rotated).await.unwrap());
        assert!(!store.apply(&newer).await.unwrap());
        assert_eq!(store.current().await, Some(rotated));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join(CHECKPOINT_FILE))
            .await
            .unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.save(&Checkpoint::new("f", 1, 1)).await,
            Err(ReplicationError::Closed)
        ));
        assert!(matches!(
            store.apply(&Checkpoint::new("f", 1, 1)).await,
            Err(ReplicationError::Closed)
        ));
    }
}
