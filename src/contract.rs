use crate::sync::*;
use crate::{Attributes, ErrorAction, HandlerError, MqError, MqResult, ReaderOptions};

/// Outcome of handling a single message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processing succeeded, the message is removed for good.
    Complete,
    /// Processing failed or was deferred, the message is kept and offered again.
    Abandon,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReaderState {
    #[default]
    Stopped,
    Running,
    StopRequested,
}

/// Opaque value supplied when starting a reader and handed back to its handler on every
/// delivery.
#[derive(Clone, Default)]
pub struct UserData(Option<Arc<dyn std::any::Any + Send + Sync>>);

impl UserData {
    pub fn new<T: std::any::Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn get<T: std::any::Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref())
    }
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UserData").field(&self.0.is_some()).finish()
    }
}

/// Everything a handler receives alongside a message.
#[derive(Clone, Debug)]
pub struct DeliveryContext {
    reader: Arc<str>,
    user_data: UserData,
    cancellation: Cancellation,
}

impl DeliveryContext {
    pub(crate) fn new(reader: &str, user_data: UserData, cancellation: Cancellation) -> Self {
        Self { reader: Arc::from(reader), user_data, cancellation }
    }

    /// Name of the reader delivering the message.
    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    /// Signalled when the reader has been asked to stop. The reader waits for the current
    /// message to be handled either way, long-running handlers may use this to return early.
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}

/// Receives messages from a [`Reader`].
#[async_trait::async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync {
    /// Handles a single message. Returning an error is equivalent to [`Disposition::Abandon`]:
    /// the message is kept and offered again.
    async fn handle_message(
        &self,
        message: M,
        attributes: Attributes,
        ctx: &DeliveryContext,
    ) -> Result<Disposition, HandlerError>;

    /// Called when the backend itself fails, as opposed to a single message. By default this
    /// stops the reader so it never spins against a broken backend.
    ///
    /// Push backends also report [`MqError::Handler`] failures here. The answer is ignored for
    /// those: the message is redelivered and the reader keeps running.
    async fn handle_error(&self, error: &MqError, ctx: &DeliveryContext) -> ErrorAction {
        if error.is_backend_failure() {
            tracing::error!(reader = ctx.reader(), %error, "Backend failure, stopping reader");
        } else {
            tracing::error!(reader = ctx.reader(), %error, "Message could not be handled");
        }
        ErrorAction::Stop
    }
}

/// A [`MessageHandler`] built from an async closure, see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Builds a [`MessageHandler`] from a closure returning a future. Backend errors use the default
/// [`MessageHandler::handle_error`] policy.
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<F>
where
    M: Send + 'static,
    F: Fn(M, Attributes, DeliveryContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Disposition, HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait::async_trait]
impl<M, F, Fut> MessageHandler<M> for FnHandler<F>
where
    M: Send + 'static,
    F: Fn(M, Attributes, DeliveryContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Disposition, HandlerError>> + Send,
{
    async fn handle_message(
        &self,
        message: M,
        attributes: Attributes,
        ctx: &DeliveryContext,
    ) -> Result<Disposition, HandlerError> {
        (self.0)(message, attributes, ctx.clone()).await
    }
}

/// The uniform posting contract every backend implements.
#[async_trait::async_trait]
pub trait Queue<M: Send + 'static>: Send + Sync {
    async fn post(&self, message: M, attributes: Attributes) -> MqResult<()>;

    /// Creates a new, stopped, reader over this queue.
    fn reader(&self, options: ReaderOptions) -> MqResult<Box<dyn Reader<M>>>;

    /// Releases the resources held by this queue. Closing is idempotent.
    async fn close(&self) -> MqResult<()> {
        Ok(())
    }
}

/// A subscription to a queue, see [`SubscriptionReader`] for the lifecycle every reader
/// follows.
///
/// [`SubscriptionReader`]: crate::reader::SubscriptionReader
#[async_trait::async_trait]
pub trait Reader<M: Send + 'static>: Send + Sync {
    async fn start(&self, handler: Arc<dyn MessageHandler<M>>, user_data: UserData) -> MqResult<()>;

    async fn stop(&self) -> MqResult<()>;

    fn state(&self) -> ReaderState;

    /// Stops the reader if it is running and releases it. Closing is idempotent.
    async fn close(&self) -> MqResult<()>;
}

#[async_trait::async_trait]
impl<M: Send + 'static, Q: Queue<M> + ?Sized> Queue<M> for Arc<Q> {
    async fn post(&self, message: M, attributes: Attributes) -> MqResult<()> {
        (**self).post(message, attributes).await
    }

    fn reader(&self, options: ReaderOptions) -> MqResult<Box<dyn Reader<M>>> {
        (**self).reader(options)
    }

    async fn close(&self) -> MqResult<()> {
        (**self).close().await
    }
}
