use std::collections::BTreeMap;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Backing, StoredRecord};
use crate::error::StorageResult;
use crate::sync::Arc;

/// A [`Backing`] which keeps records in process memory.
///
/// Clones share the same records, so a queue re-opened over a clone of a backing recovers what the
/// previous queue left behind, exactly like it would after a restart with durable storage. Records
/// do not outlive the process.
#[derive(Clone, Debug, Default)]
pub struct MemoryBacking {
    records: Arc<std::sync::Mutex<BTreeMap<u64, StoredRecord>>>,
    high_water: Arc<AtomicU64>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, StoredRecord>> {
        // Records are only ever replaced whole, a panic cannot leave them half written.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Backing for MemoryBacking {
    async fn load(&self) -> StorageResult<Vec<StoredRecord>> {
        Ok(self.records().values().cloned().collect())
    }

    async fn insert(&self, record: &StoredRecord) -> StorageResult<()> {
        self.records().insert(record.sequence, record.clone());
        Ok(())
    }

    async fn delete(&self, record: &StoredRecord) -> StorageResult<()> {
        self.high_water.fetch_max(record.sequence, Ordering::AcqRel);
        if self.records().remove(&record.sequence).is_none() {
            tracing::warn!(sequence = record.sequence, "Deleted a record which was not stored");
        }
        Ok(())
    }

    async fn high_water(&self) -> StorageResult<u64> {
        Ok(self.high_water.load(Ordering::Acquire))
    }

    fn location(&self) -> String {
        String::from("memory")
    }
}
