use crate::formatter::Formatter;
use crate::sync::Arc;
use crate::{
    Attributes, DeliveryContext, Disposition, HandlerError, MessageHandler, MqResult, Queue, Reader, ReaderOptions,
    ReaderState, UserData,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwarderOptions {
    /// Options of the reader draining the source queue.
    pub reader: ReaderOptions,
    /// What happens to a source message which could not be converted or delivered.
    pub fallback: Disposition,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self { reader: ReaderOptions::named("forwarder"), fallback: Disposition::Abandon }
    }
}

/// Moves messages from a source queue of wire messages `W` to a destination queue of domain
/// messages `M`.
///
/// The forwarder owns a reader over the source which is started as soon as the forwarder is
/// opened. Each source message is reverted to `M` and posted to the destination. It is completed
/// on the source only once the destination accepted it, so every message which leaves the source
/// has been posted at least once.
///
/// A forwarder is itself a [`Queue<M>`]: posting formats the message and posts it to the source,
/// and readers are created over the destination.
pub struct Forwarder<M: Send + 'static, W: Send + 'static> {
    source: Arc<dyn Queue<W>>,
    destination: Arc<dyn Queue<M>>,
    formatter: Arc<dyn Formatter<M, W>>,
    reader: Box<dyn Reader<W>>,
}

impl<M: Send + 'static, W: Send + 'static> Forwarder<M, W> {
    /// Starts forwarding from `source` to `destination`, returning once the source reader is
    /// running.
    pub async fn open<F>(
        source: Arc<dyn Queue<W>>,
        destination: Arc<dyn Queue<M>>,
        formatter: F,
        options: ForwarderOptions,
    ) -> MqResult<Self>
    where
        F: Formatter<M, W> + 'static,
    {
        let formatter: Arc<dyn Formatter<M, W>> = Arc::new(formatter);
        let handler = ForwardHandler {
            destination: Arc::clone(&destination),
            formatter: Arc::clone(&formatter),
            fallback: options.fallback,
        };

        let name = options.reader.name.clone();
        let reader = source.reader(options.reader)?;
        reader.start(Arc::new(handler), UserData::none()).await?;
        tracing::info!(forwarder = %name, "Forwarding started");

        Ok(Self { source, destination, formatter, reader })
    }

    /// The reader draining the source. It can be stopped and restarted, but the handler it runs
    /// is only ever supplied by [`open`](Self::open).
    pub fn state(&self) -> ReaderState {
        self.reader.state()
    }

    /// Stops forwarding, waiting for an in-flight message to be forwarded first.
    pub async fn stop(&self) -> MqResult<()> {
        self.reader.stop().await
    }
}

#[async_trait::async_trait]
impl<M: Send + 'static, W: Send + 'static> Queue<M> for Forwarder<M, W> {
    async fn post(&self, message: M, attributes: Attributes) -> MqResult<()> {
        let wire = self.formatter.format(&message)?;
        self.source.post(wire, attributes).await
    }

    fn reader(&self, options: ReaderOptions) -> MqResult<Box<dyn Reader<M>>> {
        self.destination.reader(options)
    }

    /// Stops forwarding and closes the destination. The source is left open.
    async fn close(&self) -> MqResult<()> {
        self.reader.close().await?;
        self.destination.close().await
    }
}

struct ForwardHandler<M: Send + 'static, W: Send + 'static> {
    destination: Arc<dyn Queue<M>>,
    formatter: Arc<dyn Formatter<M, W>>,
    fallback: Disposition,
}

#[async_trait::async_trait]
impl<M: Send + 'static, W: Send + 'static> MessageHandler<W> for ForwardHandler<M, W> {
    async fn handle_message(
        &self,
        message: W,
        attributes: Attributes,
        ctx: &DeliveryContext,
    ) -> Result<Disposition, HandlerError> {
        let message = match self.formatter.revert(&message) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(forwarder = ctx.reader(), error = %e, fallback = ?self.fallback, "Failed to convert message");
                return Ok(self.fallback);
            }
        };

        match self.destination.post(message, attributes).await {
            Ok(()) => Ok(Disposition::Complete),
            Err(e) => {
                tracing::warn!(forwarder = ctx.reader(), error = %e, fallback = ?self.fallback, "Failed to forward message");
                Ok(self.fallback)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::*;
    use crate::formatter::json_bytes;
    use crate::memory::MemoryQueue;
    use crate::store::{DurableQueue, MemoryBacking};
    use crate::{MqError, QueueOptions};

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Order {
        id: u64,
    }

    fn options() -> ForwarderOptions {
        let reader = ReaderOptions::named("forwarder").with_idle_delay(std::time::Duration::from_millis(5));
        ForwarderOptions { reader, ..Default::default() }
    }

    async fn source() -> DurableQueue<Vec<u8>> {
        let identity = crate::formatter::Identity;
        DurableQueue::open(MemoryBacking::new(), identity, QueueOptions::named("source")).await.unwrap()
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn forwards_to_destination(#[allow(unused)] log_stdout: ()) {
        let source = source().await;
        let destination = MemoryQueue::<Order>::default();

        let forwarder = Forwarder::<Order, Vec<u8>>::open(
            Arc::new(source.clone()),
            Arc::new(destination.clone()),
            json_bytes::<Order>(),
            options(),
        )
        .await
        .unwrap();
        assert_eq!(forwarder.state(), ReaderState::Running);

        let attributes = Attributes::new().with_label("orders");
        forwarder.post(Order { id: 1 }, attributes.clone()).await.unwrap();

        wait_until(|| destination.len() == 1).await;
        assert_eq!(destination.snapshot(), vec![(Order { id: 1 }, attributes)]);
        wait_until_async(|| {
            let source = source.clone();
            async move { source.is_empty().await }
        })
        .await;

        forwarder.stop().await.unwrap();
        assert_eq!(forwarder.state(), ReaderState::Stopped);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn undeliverable_messages_stay_in_the_source(#[allow(unused)] log_stdout: ()) {
        let source = source().await;
        let destination = MemoryQueue::<Order>::new(QueueOptions::named("full").with_max_size(0));

        let forwarder = Forwarder::<Order, Vec<u8>>::open(
            Arc::new(source.clone()),
            Arc::new(destination.clone()),
            json_bytes::<Order>(),
            options(),
        )
        .await
        .unwrap();
        forwarder.post(Order { id: 2 }, Attributes::new()).await.unwrap();

        // Give the reader a few attempts
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        forwarder.stop().await.unwrap();

        assert_eq!(source.len().await, 1);
        assert!(destination.is_empty());
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn unconvertible_messages_use_the_fallback(#[allow(unused)] log_stdout: ()) {
        let source = source().await;
        let destination = MemoryQueue::<Order>::default();

        let options = ForwarderOptions { fallback: Disposition::Complete, ..options() };
        let forwarder = Forwarder::<Order, Vec<u8>>::open(
            Arc::new(source.clone()),
            Arc::new(destination.clone()),
            json_bytes::<Order>(),
            options,
        )
        .await
        .unwrap();

        source.append(b"not json".to_vec(), Attributes::new()).await.unwrap();
        forwarder.post(Order { id: 3 }, Attributes::new()).await.unwrap();

        wait_until(|| destination.len() == 1).await;
        assert_eq!(destination.snapshot()[0].0, Order { id: 3 });
        assert!(source.is_empty().await);
        forwarder.close().await.unwrap();
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn readers_come_from_the_destination(#[allow(unused)] log_stdout: ()) {
        let source = source().await;
        let destination = MemoryQueue::<Order>::default();
        let forwarder = Forwarder::<Order, Vec<u8>>::open(
            Arc::new(source.clone()),
            Arc::new(destination.clone()),
            json_bytes::<Order>(),
            options(),
        )
        .await
        .unwrap();

        let (sx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = crate::handler_fn(move |order: Order, _, _| {
            let sx = sx.clone();
            async move {
                sx.send(order).unwrap();
                Ok(Disposition::Complete)
            }
        });
        let reader = forwarder.reader(ReaderOptions::named("consumer")).unwrap();
        reader.start(Arc::new(handler), UserData::none()).await.unwrap();

        forwarder.post(Order { id: 4 }, Attributes::new()).await.unwrap();
        assert_eq!(rx.recv().await, Some(Order { id: 4 }));

        reader.close().await.unwrap();
        forwarder.close().await.unwrap();
        assert_matches::assert_matches!(destination.post(Order { id: 5 }, Attributes::new()).await, Err(MqError::Closed));
    }
}
