//! A [`Backing`] storing one file per record in a directory.
//!
//! Each record is written as `<id>.rec`, a zstd-compressed frame:
//!
//! ```text
//! | magic (4) | sequence (8) | id (16) | attributes len (4) | attributes | body len (4) | body | crc32 (4) |
//! ```
//!
//! Integers are little-endian and the checksum covers every byte before it. Records are first
//! written to `<id>.rec.tmp`, synced, renamed into place, and the directory is synced so the rename
//! itself survives a crash. A crash never leaves a partially written record behind: temporary files
//! found on load are the remains of one and are removed.
//!
//! The highest sequence ever deleted is kept in a `high_water` file next to the records, holding
//! the sequence and its crc32. It is written the same way, before the record it covers is removed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

use super::{Backing, DurableQueue, StoredRecord};
use crate::error::{StorageError, StorageResult};
use crate::formatter::json_bytes;
use crate::sync::Arc;
use crate::{MqResult, QueueOptions};

const MAGIC: [u8; 4] = *b"DMQ1";
const EXTENSION: &str = "rec";
const TMP_EXTENSION: &str = "tmp";
const HIGH_WATER: &str = "high_water";

#[derive(Clone, Debug)]
pub struct DiskBacking {
    dir: PathBuf,
    level: i32,
    high_water: Arc<AtomicU64>,
}

impl DiskBacking {
    /// Opens the record directory, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let high_water = read_high_water(&dir.join(HIGH_WATER)).await?;

        Ok(Self { dir, level: zstd::DEFAULT_COMPRESSION_LEVEL, high_water: Arc::new(AtomicU64::new(high_water)) })
    }

    /// Sets the zstd compression level used for new records.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &uuid::Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{EXTENSION}"))
    }

    async fn read_record(&self, path: &Path) -> StorageResult<StoredRecord> {
        let location = path.display().to_string();
        let compressed = tokio::fs::read(path).await?;
        let frame = zstd::decode_all(compressed.as_slice())
            .map_err(|e| StorageError::corrupt(&location, format!("decompression failed: {e}")))?;
        let record = decode_frame(&frame).map_err(|reason| StorageError::corrupt(&location, reason))?;

        let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default();
        if stem != record.id.to_string() {
            return Err(StorageError::corrupt(location, format!("holds record {}", record.id)));
        }
        Ok(record)
    }

    /// Replaces the file at `path` with `bytes` so that either the old or the new content survives
    /// a crash, never a mix of both.
    async fn write_durably(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let tmp = tmp_path(path);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        self.sync_dir().await
    }

    async fn sync_dir(&self) -> StorageResult<()> {
        tokio::fs::File::open(&self.dir).await?.sync_all().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backing for DiskBacking {
    async fn load(&self) -> StorageResult<Vec<StoredRecord>> {
        let mut records = Vec::new();
        let mut removed = false;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|extension| extension.to_str()) {
                Some(TMP_EXTENSION) => {
                    tracing::warn!(path = %path.display(), "Removing incomplete write");
                    tokio::fs::remove_file(&path).await?;
                    removed = true;
                }
                Some(EXTENSION) => records.push(self.read_record(&path).await?),
                _ => {}
            }
        }

        if removed {
            self.sync_dir().await?;
        }

        records.sort_by_key(|record| record.sequence);
        tracing::debug!(dir = %self.dir.display(), records = records.len(), "Loaded records from disk");

        Ok(records)
    }

    async fn insert(&self, record: &StoredRecord) -> StorageResult<()> {
        let compressed = zstd::encode_all(encode_frame(record).as_slice(), self.level)?;
        self.write_durably(&self.path(&record.id), &compressed).await
    }

    async fn delete(&self, record: &StoredRecord) -> StorageResult<()> {
        if record.sequence > self.high_water.load(Ordering::Acquire) {
            self.write_durably(&self.dir.join(HIGH_WATER), &encode_high_water(record.sequence)).await?;
            self.high_water.store(record.sequence, Ordering::Release);
        }

        match tokio::fs::remove_file(self.path(&record.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(id = %record.id, "Deleted a record which was not stored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn high_water(&self) -> StorageResult<u64> {
        Ok(self.high_water.load(Ordering::Acquire))
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

impl<M> DurableQueue<M>
where
    M: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    /// Opens a queue persisting json messages under `dir`.
    pub async fn on_disk(dir: impl Into<PathBuf>, options: QueueOptions) -> MqResult<Self> {
        let backing = DiskBacking::open(dir).await?;
        Self::open(backing, json_bytes::<M>(), options).await
    }
}

fn encode_frame(record: &StoredRecord) -> Vec<u8> {
    let mut frame = Vec::with_capacity(40 + record.attributes.len() + record.body.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&record.sequence.to_le_bytes());
    frame.extend_from_slice(record.id.as_bytes());
    frame.extend_from_slice(&(record.attributes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&record.attributes);
    frame.extend_from_slice(&(record.body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&record.body);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn decode_frame(frame: &[u8]) -> Result<StoredRecord, String> {
    let Some((content, crc)) = frame.split_last_chunk::<4>() else {
        return Err(String::from("truncated frame"));
    };
    if crc32fast::hash(content) != u32::from_le_bytes(*crc) {
        return Err(String::from("checksum mismatch"));
    }

    let mut cursor = Cursor(content);
    if cursor.take(4)? != MAGIC {
        return Err(String::from("unknown record format"));
    }
    let sequence = u64::from_le_bytes(cursor.array()?);
    let id = uuid::Uuid::from_bytes(cursor.array()?);
    let len = u32::from_le_bytes(cursor.array()?) as usize;
    let attributes = cursor.take(len)?.to_vec();
    let len = u32::from_le_bytes(cursor.array()?) as usize;
    let body = cursor.take(len)?.to_vec();

    if !cursor.0.is_empty() {
        return Err(format!("{} trailing bytes", cursor.0.len()));
    }
    Ok(StoredRecord { id, sequence, attributes, body })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TMP_EXTENSION);
    PathBuf::from(name)
}

fn encode_high_water(sequence: u64) -> Vec<u8> {
    let mut bytes = sequence.to_le_bytes().to_vec();
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes
}

async fn read_high_water(path: &Path) -> StorageResult<u64> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let corrupt = |reason: &str| StorageError::corrupt(path.display().to_string(), reason);
    let (sequence, crc) = bytes.split_first_chunk::<8>().ok_or_else(|| corrupt("truncated high water mark"))?;
    let crc: [u8; 4] = crc.try_into().map_err(|_| corrupt("truncated high water mark"))?;
    if crc32fast::hash(sequence) != u32::from_le_bytes(crc) {
        return Err(corrupt("checksum mismatch"));
    }
    Ok(u64::from_le_bytes(*sequence))
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        if self.0.len() < len {
            return Err(String::from("truncated frame"));
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }
}
