//! A durable, sequenced, single-consumer queue.
//!
//! [`DurableQueue`] persists every message through a [`Backing`] before making it visible to
//! readers, and keeps an in-memory mirror of the persisted records so that reads never have to
//! hit storage to find the next message.
//!
//! # Invariants
//!
//! The mirror and the backing always agree on which records exist and in which order:
//!
//! - a record is appended to the mirror only after it has been persisted,
//! - a record is removed from the mirror only after it has been deleted from the backing,
//! - records are ordered by their sequence number, which strictly increases with every post.
//!
//! Every post and read runs under a single lock, including the call to the message handler. This
//! means only one message is ever in flight for a given queue and that two readers can never
//! observe the same head message at once. A slow handler blocks producers for as long as it runs.
//!
//! # Recovery
//!
//! [`DurableQueue::open`] loads every persisted record in sequence order and rebuilds the mirror
//! and the sequence counter from them, so a restarted process resumes exactly where it left off,
//! including messages abandoned before a crash. A record that cannot be decoded is fatal: skipping
//! it would break the ordering guarantee.
//!
//! # Sequence numbers
//!
//! Sequences start at 1 and are allocated before the record is persisted. A failed persist leaves
//! a gap in the numbering. Backings remember the highest sequence they ever deleted, and the
//! counter is seeded from the greater of that and the highest persisted sequence, so numbers are
//! never reused, even once a queue has been fully drained and restarted.

#[cfg(feature = "disk")]
pub mod disk;
pub mod memory;
#[cfg(feature = "sql")]
pub mod sql;

use crate::error::{ConversionError, StorageResult};
use crate::formatter::Formatter;
use crate::reader::{Delivery, MessageSource, Subscription, SubscriptionReader};
use crate::sync::*;
use crate::{
    Attributes, DeliveryContext, Disposition, HandlerError, MessageHandler, MqError, MqResult, Queue, QueueOptions,
    Reader, ReaderOptions,
};

#[cfg(feature = "disk")]
pub use disk::DiskBacking;
pub use memory::MemoryBacking;
#[cfg(feature = "sql")]
pub use sql::SqlBacking;

/// A message as it is persisted: identity, position and serialized payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: uuid::Uuid,
    pub sequence: u64,
    pub attributes: Vec<u8>,
    pub body: Vec<u8>,
}

impl StoredRecord {
    pub fn receipt(&self) -> Receipt {
        Receipt { id: self.id, sequence: self.sequence }
    }
}

/// Identity of a message which has been durably posted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub id: uuid::Uuid,
    pub sequence: u64,
}

/// Persistent storage for a [`DurableQueue`]. A backing is owned by a single queue, which
/// serializes every call to it.
#[async_trait::async_trait]
pub trait Backing: Send + Sync + 'static {
    /// Loads every persisted record, ordered by sequence number ascending.
    async fn load(&self) -> StorageResult<Vec<StoredRecord>>;

    /// Durably persists a new record. The record must survive a crash once this returns.
    async fn insert(&self, record: &StoredRecord) -> StorageResult<()>;

    /// Deletes a record. Before the record is gone, the backing must durably remember that its
    /// sequence number has been used, see [`high_water`](Self::high_water).
    async fn delete(&self, record: &StoredRecord) -> StorageResult<()>;

    /// A sequence number at least as high as that of every record ever deleted from this backing.
    /// The queue resumes numbering after the greater of this and the records it loads.
    async fn high_water(&self) -> StorageResult<u64>;

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Where the records live, for logs and error messages.
    fn location(&self) -> String;
}

struct Entry {
    attributes: Attributes,
    record: StoredRecord,
}

struct Mirror {
    entries: std::collections::VecDeque<Entry>,
    last_sequence: u64,
}

struct Inner<M> {
    name: String,
    max_size: Option<usize>,
    backing: Box<dyn Backing>,
    formatter: Box<dyn Formatter<M, Vec<u8>>>,
    mirror: Mutex<Mirror>,
    closed: std::sync::atomic::AtomicBool,
}

/// A persisted FIFO queue, see the [module level documentation](self).
///
/// Cloning a `DurableQueue` is cheap and yields a handle to the same queue.
pub struct DurableQueue<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for DurableQueue<M> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<M> std::fmt::Debug for DurableQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("name", &self.inner.name)
            .field("max_size", &self.inner.max_size)
            .field("backing", &self.inner.backing.location())
            .finish()
    }
}

impl<M: Send + 'static> DurableQueue<M> {
    /// Opens a queue over `backing`, rebuilding its contents from the records already persisted.
    ///
    /// Fails if the backing cannot be read or if any persisted record cannot be decoded.
    pub async fn open<B, F>(backing: B, formatter: F, options: QueueOptions) -> MqResult<Self>
    where
        B: Backing,
        F: Formatter<M, Vec<u8>> + 'static,
    {
        let records = backing.load().await?;
        let location = backing.location();

        let mut entries = std::collections::VecDeque::with_capacity(records.len());
        let mut last_sequence = 0;
        for record in records {
            let corrupt = |reason: String| MqError::CorruptRecord {
                location: format!("{location}#{}", record.sequence),
                reason,
            };

            if record.sequence <= last_sequence {
                return Err(corrupt(format!("sequence does not follow {last_sequence}")));
            }
            let attributes =
                Attributes::decode(&record.attributes).map_err(|e| corrupt(format!("unreadable attributes: {e}")))?;
            formatter.revert(&record.body).map_err(|e| corrupt(format!("unreadable body: {e}")))?;

            last_sequence = record.sequence;
            entries.push_back(Entry { attributes, record });
        }

        let high_water = backing.high_water().await?;
        let last_sequence = last_sequence.max(high_water);

        tracing::info!(queue = %options.name, %location, pending = entries.len(), last_sequence, "Opened durable queue");

        let inner = Inner {
            name: options.name,
            max_size: options.max_size,
            backing: Box::new(backing),
            formatter: Box::new(formatter),
            mirror: Mutex::new(Mirror { entries, last_sequence }),
            closed: std::sync::atomic::AtomicBool::new(false),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Durably posts a message and returns its identity.
    pub async fn append(&self, message: M, attributes: Attributes) -> MqResult<Receipt> {
        self.append_inner(message, attributes, None).await
    }

    /// Same as [`append`], giving up with [`MqError::Cancelled`] if `cancellation` fires while
    /// waiting for the queue lock. Nothing is persisted in that case.
    ///
    /// [`append`]: Self::append
    pub async fn append_until(
        &self,
        message: M,
        attributes: Attributes,
        cancellation: &Cancellation,
    ) -> MqResult<Receipt> {
        self.append_inner(message, attributes, Some(cancellation)).await
    }

    #[tracing::instrument(skip_all, fields(queue = %self.inner.name))]
    async fn append_inner(
        &self,
        message: M,
        attributes: Attributes,
        cancellation: Option<&Cancellation>,
    ) -> MqResult<Receipt> {
        self.ensure_open()?;
        let mut mirror = self.lock(cancellation).await?;

        if let Some(max_size) = self.inner.max_size {
            if mirror.entries.len() >= max_size {
                tracing::debug!(max_size, "Queue is full");
                return Err(MqError::QueueFull { max_size });
            }
        }

        let body = self.inner.formatter.format(&message)?;
        let encoded = attributes.encode().map_err(ConversionError::from)?;

        mirror.last_sequence += 1;
        let record = StoredRecord { id: uuid::Uuid::new_v4(), sequence: mirror.last_sequence, attributes: encoded, body };

        if let Err(e) = self.inner.backing.insert(&record).await {
            tracing::warn!(sequence = record.sequence, error = %e, "Failed to persist message");
            return Err(e.into());
        }

        let receipt = record.receipt();
        mirror.entries.push_back(Entry { attributes, record });
        tracing::debug!(id = %receipt.id, sequence = receipt.sequence, pending = mirror.entries.len(), "Message posted");

        Ok(receipt)
    }

    /// Offers the message at the head of the queue to `handler`, without waiting if the queue is
    /// empty. Returns `None` if there was nothing to read, or the handler's disposition.
    ///
    /// A [`Disposition::Complete`] message is deleted from storage and then from the queue. An
    /// abandoned message stays at the head and is offered again on the next read. If the handler
    /// fails the message is kept as if it had been abandoned and the error is returned.
    pub async fn try_read_one<H, Fut>(&self, handler: H) -> MqResult<Option<Disposition>>
    where
        H: FnOnce(M, Attributes) -> Fut,
        Fut: std::future::Future<Output = Result<Disposition, HandlerError>>,
    {
        self.try_read_one_inner(handler, None).await
    }

    /// Same as [`try_read_one`], giving up with [`MqError::Cancelled`] if `cancellation` fires
    /// while waiting for the queue lock. Once the handler has been called it always runs to
    /// completion.
    ///
    /// [`try_read_one`]: Self::try_read_one
    pub async fn try_read_one_until<H, Fut>(
        &self,
        handler: H,
        cancellation: &Cancellation,
    ) -> MqResult<Option<Disposition>>
    where
        H: FnOnce(M, Attributes) -> Fut,
        Fut: std::future::Future<Output = Result<Disposition, HandlerError>>,
    {
        self.try_read_one_inner(handler, Some(cancellation)).await
    }

    #[tracing::instrument(skip_all, fields(queue = %self.inner.name))]
    async fn try_read_one_inner<H, Fut>(
        &self,
        handler: H,
        cancellation: Option<&Cancellation>,
    ) -> MqResult<Option<Disposition>>
    where
        H: FnOnce(M, Attributes) -> Fut,
        Fut: std::future::Future<Output = Result<Disposition, HandlerError>>,
    {
        self.ensure_open()?;
        let mut mirror = self.lock(cancellation).await?;

        let Some(head) = mirror.entries.front() else {
            return Ok(None);
        };
        let receipt = head.record.receipt();

        let message = match self.inner.formatter.revert(&head.record.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(sequence = receipt.sequence, error = %e, "Failed to decode message, keeping it at the head");
                return Err(e.into());
            }
        };

        tracing::debug!(id = %receipt.id, sequence = receipt.sequence, "Delivering message");
        let disposition = match handler(message, head.attributes.clone()).await {
            Ok(disposition) => disposition,
            Err(e) => {
                tracing::warn!(sequence = receipt.sequence, error = %e, "Handler failed, keeping message at the head");
                return Err(MqError::Handler(e));
            }
        };

        match disposition {
            Disposition::Complete => {
                if let Err(e) = self.inner.backing.delete(&head.record).await {
                    tracing::error!(sequence = receipt.sequence, error = %e, "Failed to delete completed message");
                    return Err(e.into());
                }
                mirror.entries.pop_front();
                tracing::debug!(sequence = receipt.sequence, pending = mirror.entries.len(), "Message completed");
            }
            Disposition::Abandon => {
                tracing::debug!(sequence = receipt.sequence, "Message abandoned");
            }
        }

        Ok(Some(disposition))
    }

    /// Number of messages which have been posted but not completed.
    pub async fn len(&self) -> usize {
        self.inner.mirror.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Receipts of every pending message, in delivery order.
    pub async fn pending(&self) -> Vec<Receipt> {
        self.inner.mirror.lock().await.entries.iter().map(|entry| entry.record.receipt()).collect()
    }

    async fn lock(&self, cancellation: Option<&Cancellation>) -> MqResult<tokio::sync::MutexGuard<'_, Mirror>> {
        match cancellation {
            None => Ok(self.inner.mirror.lock().await),
            Some(cancellation) => tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(MqError::Cancelled),
                guard = self.inner.mirror.lock() => Ok(guard),
            },
        }
    }

    fn ensure_open(&self) -> MqResult<()> {
        if self.inner.closed.load(std::sync::atomic::Ordering::Acquire) { Err(MqError::Closed) } else { Ok(()) }
    }
}

#[async_trait::async_trait]
impl<M: Send + 'static> Queue<M> for DurableQueue<M> {
    async fn post(&self, message: M, attributes: Attributes) -> MqResult<()> {
        self.append(message, attributes).await.map(|_| ())
    }

    fn reader(&self, options: ReaderOptions) -> MqResult<Box<dyn Reader<M>>> {
        self.ensure_open()?;
        let source: Arc<dyn MessageSource<M>> = Arc::new(self.clone());
        Ok(Box::new(SubscriptionReader::new(source, options)))
    }

    async fn close(&self) -> MqResult<()> {
        // Waiting for the lock lets an in-flight post or read finish first.
        let _mirror = self.inner.mirror.lock().await;
        if self.inner.closed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(queue = %self.inner.name, "Closing durable queue");
        self.inner.backing.close().await.map_err(MqError::from)
    }
}

#[async_trait::async_trait]
impl<M: Send + 'static> MessageSource<M> for DurableQueue<M> {
    async fn subscribe(&self, options: &ReaderOptions) -> MqResult<Box<dyn Subscription<M>>> {
        self.ensure_open()?;
        tracing::debug!(queue = %self.inner.name, reader = %options.name, "Polling reader subscribed");
        Ok(Box::new(StoreSubscription { queue: self.clone() }))
    }
}

/// Pull-based subscription: every call to `next` reads at most one message.
struct StoreSubscription<M> {
    queue: DurableQueue<M>,
}

#[async_trait::async_trait]
impl<M: Send + 'static> Subscription<M> for StoreSubscription<M> {
    async fn next(&mut self, handler: &dyn MessageHandler<M>, ctx: &DeliveryContext) -> MqResult<Delivery> {
        let outcome = self
            .queue
            .try_read_one_until(
                |message, attributes| handler.handle_message(message, attributes, ctx),
                ctx.cancellation(),
            )
            .await?;

        Ok(match outcome {
            Some(disposition) => Delivery::Handled(disposition),
            None => Delivery::Idle,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::StorageError;
    use crate::common::*;
    use crate::formatter::json_bytes;

    async fn queue(backing: &MemoryBacking, max_size: Option<usize>) -> DurableQueue<String> {
        let options = QueueOptions { name: "test".to_string(), max_size };
        DurableQueue::open(backing.clone(), json_bytes(), options).await.expect("Failed to open queue")
    }

    async fn read(queue: &DurableQueue<String>, disposition: Disposition) -> Option<(String, Attributes)> {
        let mut seen = None;
        let outcome = queue
            .try_read_one(|message, attributes| {
                seen = Some((message, attributes));
                async move { Ok(disposition) }
            })
            .await
            .expect("Failed to read");
        assert_eq!(outcome.is_some(), seen.is_some());
        seen
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn sequences_increase_and_delivery_is_fifo(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let queue = queue(&backing, None).await;

        let mut last = 0;
        for i in 0..16 {
            let receipt = queue.append(format!("message {i}"), Attributes::new()).await.unwrap();
            assert!(receipt.sequence > last, "{} does not follow {last}", receipt.sequence);
            last = receipt.sequence;
        }
        assert_eq!(queue.pending().await.first().map(|r| r.sequence), Some(1));

        for i in 0..16 {
            let (message, _) = read(&queue, Disposition::Complete).await.expect("Queue drained early");
            assert_eq!(message, format!("message {i}"));
        }

        assert!(read(&queue, Disposition::Complete).await.is_none());
        assert!(queue.is_empty().await);
        assert!(backing.is_empty());
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn attributes_survive_persistence(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let attributes = Attributes::new().with_label("orders").with_property("tenant", "acme");

        queue(&backing, None).await.append("hello".to_string(), attributes.clone()).await.unwrap();

        let reopened = queue(&backing, None).await;
        let (message, seen) = read(&reopened, Disposition::Complete).await.unwrap();
        assert_eq!(message, "hello");
        assert_eq!(seen, attributes);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn abandon_keeps_the_head(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let queue = queue(&backing, None).await;
        queue.append("first".to_string(), Attributes::new()).await.unwrap();
        queue.append("second".to_string(), Attributes::new()).await.unwrap();

        for _ in 0..5 {
            let (message, _) = read(&queue, Disposition::Abandon).await.unwrap();
            assert_eq!(message, "first");
            assert_eq!(queue.len().await, 2);
            assert_eq!(backing.len(), 2);
        }

        assert_eq!(read(&queue, Disposition::Complete).await.unwrap().0, "first");
        assert_eq!(read(&queue, Disposition::Complete).await.unwrap().0, "second");
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn handler_failure_keeps_the_message(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let queue = queue(&backing, None).await;
        queue.append("fragile".to_string(), Attributes::new()).await.unwrap();

        let res = queue.try_read_one(|_, _| async { Err::<Disposition, HandlerError>("boom".into()) }).await;
        assert_matches::assert_matches!(res, Err(MqError::Handler(e)) => { assert_eq!(e.to_string(), "boom") });

        assert_eq!(queue.len().await, 1);
        assert_eq!(read(&queue, Disposition::Complete).await.unwrap().0, "fragile");
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn reopen_restores_order_and_sequence(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let before = {
            let queue = queue(&backing, None).await;
            for i in 0..5 {
                queue.append(i.to_string(), Attributes::new()).await.unwrap();
            }
            // Abandoned messages are picked up again after a restart
            read(&queue, Disposition::Abandon).await.unwrap();
            queue.pending().await
        };

        let queue = queue(&backing, None).await;
        assert_eq!(queue.pending().await, before);

        let max = before.iter().map(|r| r.sequence).max().unwrap();
        let receipt = queue.append("after restart".to_string(), Attributes::new()).await.unwrap();
        assert!(receipt.sequence > max);

        for i in 0..5 {
            assert_eq!(read(&queue, Disposition::Complete).await.unwrap().0, i.to_string());
        }
        assert_eq!(read(&queue, Disposition::Complete).await.unwrap().0, "after restart");
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn drained_queue_does_not_reuse_sequences(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        {
            let queue = queue(&backing, None).await;
            for i in 0..3 {
                queue.append(i.to_string(), Attributes::new()).await.unwrap();
            }
            while read(&queue, Disposition::Complete).await.is_some() {}
        }
        assert!(backing.is_empty());

        let queue = queue(&backing, None).await;
        let receipt = queue.append("after restart".to_string(), Attributes::new()).await.unwrap();
        assert_eq!(receipt.sequence, 4);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn high_water_seeds_the_sequence(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let record = StoredRecord { id: uuid::Uuid::new_v4(), sequence: 41, attributes: b"{}".to_vec(), body: b"\"x\"".to_vec() };
        backing.insert(&record).await.unwrap();
        backing.delete(&record).await.unwrap();

        let queue = queue(&backing, None).await;
        assert_eq!(queue.append("x".to_string(), Attributes::new()).await.unwrap().sequence, 42);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn capacity_is_enforced(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let queue = queue(&backing, Some(3)).await;

        for i in 0..3 {
            queue.append(i.to_string(), Attributes::new()).await.unwrap();
        }
        assert_matches::assert_matches!(
            queue.append("overflow".to_string(), Attributes::new()).await,
            Err(MqError::QueueFull { max_size: 3 })
        );
        assert_eq!(backing.len(), 3);

        // A rejected post does not consume a sequence number
        assert_eq!(queue.pending().await.last().map(|r| r.sequence), Some(3));

        read(&queue, Disposition::Complete).await.unwrap();
        let receipt = queue.append("fits".to_string(), Attributes::new()).await.unwrap();
        assert_eq!(receipt.sequence, 4);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn failed_persist_leaves_a_gap(#[allow(unused)] log_stdout: ()) {
        let backing = FlakyBacking::default();
        let queue = DurableQueue::open(backing.clone(), json_bytes::<String>(), QueueOptions::default()).await.unwrap();

        assert_eq!(queue.append("a".to_string(), Attributes::new()).await.unwrap().sequence, 1);

        backing.fail_inserts(true);
        assert_matches::assert_matches!(
            queue.append("b".to_string(), Attributes::new()).await,
            Err(MqError::Storage(StorageError::Io(_)))
        );
        assert_eq!(queue.len().await, 1);

        backing.fail_inserts(false);
        assert_eq!(queue.append("c".to_string(), Attributes::new()).await.unwrap().sequence, 3);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn failed_delete_keeps_the_message(#[allow(unused)] log_stdout: ()) {
        let backing = FlakyBacking::default();
        let queue = DurableQueue::open(backing.clone(), json_bytes::<String>(), QueueOptions::default()).await.unwrap();
        queue.append("sticky".to_string(), Attributes::new()).await.unwrap();

        backing.fail_deletes(true);
        let res = queue.try_read_one(|_, _| async { Ok(Disposition::Complete) }).await;
        assert_matches::assert_matches!(res, Err(MqError::Storage(_)));
        assert_eq!(queue.len().await, 1);

        backing.fail_deletes(false);
        assert_eq!(queue.try_read_one(|_, _| async { Ok(Disposition::Complete) }).await.unwrap(), Some(Disposition::Complete));
        assert!(queue.is_empty().await);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn unserializable_body_is_not_persisted(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let refuse = crate::formatter::formatter_fn(
            |_: &String| Err::<Vec<u8>, _>(ConversionError::Custom("refused".to_string())),
            |_: &Vec<u8>| Ok(String::new()),
        );
        let queue = DurableQueue::open(backing.clone(), refuse, QueueOptions::default()).await.unwrap();

        assert_matches::assert_matches!(
            queue.append("x".to_string(), Attributes::new()).await,
            Err(MqError::Conversion(ConversionError::Custom(_)))
        );
        assert!(backing.is_empty());
        assert!(queue.is_empty().await);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn corrupt_record_is_fatal(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        queue(&backing, None).await.append("good".to_string(), Attributes::new()).await.unwrap();
        backing
            .insert(&StoredRecord { id: uuid::Uuid::new_v4(), sequence: 2, attributes: b"{}".to_vec(), body: b"null".to_vec() })
            .await
            .unwrap();

        let res = DurableQueue::open(backing.clone(), json_bytes::<String>(), QueueOptions::default()).await;
        assert_matches::assert_matches!(res, Err(MqError::CorruptRecord { reason, .. }) => {
            assert!(reason.contains("body"), "{reason}")
        });
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn corrupt_attributes_are_fatal(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        backing
            .insert(&StoredRecord { id: uuid::Uuid::new_v4(), sequence: 1, attributes: vec![0xff], body: b"\"ok\"".to_vec() })
            .await
            .unwrap();

        let res = DurableQueue::open(backing, json_bytes::<String>(), QueueOptions::default()).await;
        assert_matches::assert_matches!(res, Err(MqError::CorruptRecord { reason, .. }) => {
            assert!(reason.contains("attributes"), "{reason}")
        });
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn cancelled_lock_wait_does_not_mutate(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let queue = queue(&backing, None).await;
        queue.append("held".to_string(), Attributes::new()).await.unwrap();

        let (entered_sx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_sx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .try_read_one(|_, _| async move {
                        let _ = entered_sx.send(());
                        let _ = release_rx.await;
                        Ok(Disposition::Abandon)
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();

        let cancellation = Cancellation::new();
        let waiting = {
            let queue = queue.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move { queue.append_until("late".to_string(), Attributes::new(), &cancellation).await })
        };
        tokio::task::yield_now().await;
        cancellation.cancel();

        assert_matches::assert_matches!(waiting.await.unwrap(), Err(MqError::Cancelled));
        release_sx.send(()).unwrap();
        assert_eq!(holder.await.unwrap().unwrap(), Some(Disposition::Abandon));

        assert_eq!(queue.len().await, 1);
        assert_eq!(backing.len(), 1);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn closed_queue_rejects_operations(#[allow(unused)] log_stdout: ()) {
        let backing = MemoryBacking::new();
        let queue = queue(&backing, None).await;

        queue.close().await.unwrap();
        queue.close().await.unwrap();

        assert_matches::assert_matches!(queue.post("x".to_string(), Attributes::new()).await, Err(MqError::Closed));
        assert_matches::assert_matches!(queue.try_read_one(|_, _| async { Ok(Disposition::Complete) }).await, Err(MqError::Closed));
        assert!(queue.reader(ReaderOptions::default()).is_err());
    }
}
