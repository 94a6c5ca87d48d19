use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::StorageResult;
use crate::store::{Backing, MemoryBacking, StoredRecord};
use crate::sync::Arc;

pub(crate) type LogConfig = tracing_subscriber::fmt::SubscriberBuilder<
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Full, ()>,
    tracing_subscriber::EnvFilter,
>;

#[rstest::fixture]
pub(crate) fn log_conf() -> LogConfig {
    let env = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::fmt::Subscriber::builder().with_env_filter(env).without_time()
}

#[rstest::fixture]
pub(crate) fn log_stdout(log_conf: LogConfig) {
    let _ = log_conf.with_test_writer().try_init();
}

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds, panicking after a few seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("Condition was never met");
}

pub(crate) async fn wait_until_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("Condition was never met");
}

/// A [`MemoryBacking`] whose writes can be made to fail on demand.
#[derive(Clone, Default)]
pub(crate) struct FlakyBacking {
    records: MemoryBacking,
    fail_inserts: Arc<AtomicBool>,
    fail_deletes: Arc<AtomicBool>,
}

impl FlakyBacking {
    pub(crate) fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(std::io::Error::other("disk unplugged").into())
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Backing for FlakyBacking {
    async fn load(&self) -> StorageResult<Vec<StoredRecord>> {
        self.records.load().await
    }

    async fn insert(&self, record: &StoredRecord) -> StorageResult<()> {
        Self::check(&self.fail_inserts)?;
        self.records.insert(record).await
    }

    async fn delete(&self, record: &StoredRecord) -> StorageResult<()> {
        Self::check(&self.fail_deletes)?;
        self.records.delete(record).await
    }

    async fn high_water(&self) -> StorageResult<u64> {
        self.records.high_water().await
    }

    fn location(&self) -> String {
        String::from("flaky")
    }
}
