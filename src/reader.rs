//! Reader lifecycle.
//!
//! Every backend hands out readers built on [`SubscriptionReader`], which drives a backend
//! [`Subscription`] on a background task and delivers its messages to a [`MessageHandler`]. A
//! reader goes through the following states:
//!
//! ```text
//!            start                 stop
//! Stopped ----------> Running ------------> StopRequested
//!    ^                   |                        |
//!    |                   | backend failure        | in-flight message handled
//!    |                   v                        |
//!    +-------------------+------------------------+
//! ```
//!
//! - [`start`] only returns once the backend has acknowledged the subscription. If that fails the
//!   reader stays [`Stopped`].
//! - [`stop`] signals the delivery loop, then waits for any in-flight handler to return. Handlers
//!   are never aborted, they can watch [`DeliveryContext::cancellation`] to return early.
//! - A backend failure is reported to [`MessageHandler::handle_error`]. Unless the handler asks to
//!   [`Continue`], the reader stops itself: this is an _implicit stop_, after which the reader can
//!   be started again.
//! - Push backends also report handler failures to [`MessageHandler::handle_error`], as
//!   [`Delivery::Failed`]. The message is redelivered and the reader keeps running whatever the
//!   handler answers.
//!
//! Only one transition may run at a time. Calling [`start`] or [`stop`] while another transition is
//! in progress fails immediately with a [`StateConflict`] instead of waiting.
//!
//! [`start`]: Reader::start
//! [`stop`]: Reader::stop
//! [`Stopped`]: ReaderState::Stopped
//! [`Continue`]: ErrorAction::Continue

use std::time::Duration;

use crate::sync::*;
use crate::{
    DeliveryContext, Disposition, ErrorAction, MessageHandler, MqError, MqResult, Reader, ReaderOptions, ReaderState,
    StateConflict, UserData,
};

/// What a single step of a [`Subscription`] achieved.
#[derive(Debug)]
pub enum Delivery {
    Handled(Disposition),
    /// There was nothing to deliver, the reader waits for its idle delay before trying again.
    Idle,
    /// The handler failed and the message has been kept for redelivery. The error is reported to
    /// [`MessageHandler::handle_error`] but never stops the reader.
    Failed(MqError),
}

/// A backend a [`SubscriptionReader`] can read from.
#[async_trait::async_trait]
pub trait MessageSource<M: Send + 'static>: Send + Sync + 'static {
    /// Opens a new subscription. This is the backend's acknowledgement: once it returns, the
    /// reader is live.
    async fn subscribe(&self, options: &ReaderOptions) -> MqResult<Box<dyn Subscription<M>>>;
}

/// A live subscription, driven by exactly one delivery loop.
#[async_trait::async_trait]
pub trait Subscription<M: Send + 'static>: Send {
    /// Delivers at most one message to `handler`.
    ///
    /// Push-based backends may wait for a message to arrive, in which case they must return
    /// [`MqError::Cancelled`] once `ctx`'s cancellation fires. Polling backends return
    /// [`Delivery::Idle`] instead of waiting.
    async fn next(&mut self, handler: &dyn MessageHandler<M>, ctx: &DeliveryContext) -> MqResult<Delivery>;

    /// Called once the delivery loop has ended.
    async fn close(&mut self) {}
}

struct Worker {
    cancellation: Cancellation,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<Worker>,
    closed: bool,
}

/// The [`Reader`] implementation shared by every backend, see the [module level
/// documentation](self).
pub struct SubscriptionReader<M: Send + 'static> {
    source: Arc<dyn MessageSource<M>>,
    options: ReaderOptions,
    state: Arc<watch::Sender<ReaderState>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<M: Send + 'static> SubscriptionReader<M> {
    pub fn new(source: Arc<dyn MessageSource<M>>, options: ReaderOptions) -> Self {
        let (state, _) = watch::channel(ReaderState::Stopped);
        Self { source, options, state: Arc::new(state), lifecycle: Mutex::new(Lifecycle::default()) }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// A receiver notified of every state change.
    pub fn watch(&self) -> watch::Receiver<ReaderState> {
        self.state.subscribe()
    }

    /// Cancels the delivery loop and waits for it to exit, then marks the reader as stopped.
    async fn shutdown(&self, lifecycle: &mut Lifecycle) {
        if let Some(worker) = lifecycle.worker.take() {
            worker.cancellation.cancel();
            if let Err(e) = worker.task.await {
                tracing::error!(reader = %self.options.name, error = %e, "Delivery loop panicked");
            }
        }
        self.state.send_replace(ReaderState::Stopped);
    }
}

#[async_trait::async_trait]
impl<M: Send + 'static> Reader<M> for SubscriptionReader<M> {
    #[tracing::instrument(skip_all, fields(reader = %self.options.name))]
    async fn start(&self, handler: Arc<dyn MessageHandler<M>>, user_data: UserData) -> MqResult<()> {
        let Ok(mut lifecycle) = self.lifecycle.try_lock() else {
            return Err(match self.state() {
                ReaderState::Running => StateConflict::AlreadyStarted,
                ReaderState::StopRequested => StateConflict::StopInProgress,
                ReaderState::Stopped => StateConflict::TransitionInProgress,
            }
            .into());
        };

        if lifecycle.closed {
            return Err(StateConflict::Closed.into());
        }
        match self.state() {
            ReaderState::Running => return Err(StateConflict::AlreadyStarted.into()),
            ReaderState::StopRequested => return Err(StateConflict::StopInProgress.into()),
            ReaderState::Stopped => {}
        }

        // Left behind by an implicit stop
        if let Some(worker) = lifecycle.worker.take() {
            if let Err(e) = worker.task.await {
                tracing::error!(error = %e, "Delivery loop panicked");
            }
        }

        let subscription = match self.source.subscribe(&self.options).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(error = %e, "Subscription was refused");
                return Err(e);
            }
        };

        let cancellation = Cancellation::new();
        let ctx = DeliveryContext::new(&self.options.name, user_data, cancellation.clone());
        self.state.send_replace(ReaderState::Running);

        let task = tokio::spawn(deliver(subscription, handler, ctx, self.options.idle_delay, Arc::clone(&self.state)));
        lifecycle.worker = Some(Worker { cancellation, task });

        tracing::info!("Reader started");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(reader = %self.options.name))]
    async fn stop(&self) -> MqResult<()> {
        let Ok(mut lifecycle) = self.lifecycle.try_lock() else {
            return Err(match self.state() {
                ReaderState::Stopped => StateConflict::NotRunning,
                ReaderState::StopRequested => StateConflict::StopInProgress,
                ReaderState::Running => StateConflict::TransitionInProgress,
            }
            .into());
        };

        let requested = self.state.send_if_modified(|state| match state {
            ReaderState::Running => {
                *state = ReaderState::StopRequested;
                true
            }
            _ => false,
        });
        if !requested {
            return Err(StateConflict::NotRunning.into());
        }

        tracing::debug!("Stop requested, waiting for in-flight message");
        self.shutdown(&mut lifecycle).await;

        tracing::info!("Reader stopped");
        Ok(())
    }

    fn state(&self) -> ReaderState {
        *self.state.borrow()
    }

    async fn close(&self) -> MqResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.closed {
            return Ok(());
        }

        self.state.send_if_modified(|state| match state {
            ReaderState::Running => {
                *state = ReaderState::StopRequested;
                true
            }
            _ => false,
        });
        self.shutdown(&mut lifecycle).await;
        lifecycle.closed = true;

        tracing::info!(reader = %self.options.name, "Reader closed");
        Ok(())
    }
}

impl<M: Send + 'static> Drop for SubscriptionReader<M> {
    fn drop(&mut self) {
        if let Some(worker) = &self.lifecycle.get_mut().worker {
            worker.cancellation.cancel();
        }
    }
}

/// The delivery loop, runs until cancelled or until the backend fails and the handler does not
/// ask to continue.
async fn deliver<M: Send + 'static>(
    mut subscription: Box<dyn Subscription<M>>,
    handler: Arc<dyn MessageHandler<M>>,
    ctx: DeliveryContext,
    idle_delay: Duration,
    state: Arc<watch::Sender<ReaderState>>,
) {
    let cancellation = ctx.cancellation().clone();

    while !cancellation.is_cancelled() {
        let idle = match subscription.next(handler.as_ref(), &ctx).await {
            Ok(Delivery::Handled(disposition)) => {
                tracing::trace!(reader = ctx.reader(), ?disposition, "Delivered message");
                false
            }
            Ok(Delivery::Idle) => true,
            Ok(Delivery::Failed(e)) => {
                tracing::warn!(reader = ctx.reader(), error = %e, "Message handler failed, message will be redelivered");
                let action = handler.handle_error(&e, &ctx).await;
                tracing::trace!(reader = ctx.reader(), ?action, "Handler failure reported");
                true
            }
            Err(MqError::Cancelled) => break,
            Err(e) if e.is_backend_failure() => match handler.handle_error(&e, &ctx).await {
                ErrorAction::Continue => true,
                ErrorAction::Stop => {
                    let stopped = state.send_if_modified(|state| match state {
                        ReaderState::Running => {
                            *state = ReaderState::Stopped;
                            true
                        }
                        _ => false,
                    });
                    if stopped {
                        tracing::warn!(reader = ctx.reader(), error = %e, "Reader stopped after backend failure");
                    }
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(reader = ctx.reader(), error = %e, "Message was not handled and will be redelivered");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(idle_delay) => {}
            }
        }
    }

    subscription.close().await;
    tracing::debug!(reader = ctx.reader(), "Delivery loop ended");
}
