//! A push-based, in-process queue.
//!
//! [`MemoryQueue`] keeps messages in memory only and wakes subscribed readers as soon as a message
//! is posted, instead of having them poll. It implements the same [`Queue`] contract as the durable
//! store and is mostly useful as a forwarding destination, or wherever losing pending messages on
//! restart is acceptable.
//!
//! A message handed to a handler is removed from the queue for the duration of the call but
//! still counts towards its maximum size. If the handler abandons it or fails, the message is put
//! back at the front so it is the next one to be delivered. Handler failures are also reported to
//! [`MessageHandler::handle_error`], without stopping the reader.

use std::collections::VecDeque;
use std::sync::PoisonError;

use crate::reader::{Delivery, MessageSource, Subscription, SubscriptionReader};
use crate::sync::*;
use crate::{
    Attributes, DeliveryContext, Disposition, MessageHandler, MqError, MqResult, Queue, QueueOptions, Reader,
    ReaderOptions,
};

struct State<M> {
    messages: VecDeque<(M, Attributes)>,
    /// Messages currently held by a handler.
    in_flight: usize,
    closed: bool,
}

struct Shared<M> {
    name: String,
    max_size: Option<usize>,
    state: std::sync::Mutex<State<M>>,
    notify: Notify,
}

impl<M> Shared<M> {
    fn state(&self) -> std::sync::MutexGuard<'_, State<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed(&self) -> MqError {
        MqError::Backend(format!("memory queue {} has been closed", self.name))
    }
}

/// An in-memory [`Queue`] delivering to readers as messages arrive.
///
/// Cloning a `MemoryQueue` yields a handle to the same queue.
pub struct MemoryQueue<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for MemoryQueue<M> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<M> Default for MemoryQueue<M> {
    fn default() -> Self {
        Self::new(QueueOptions::named("memory"))
    }
}

impl<M> MemoryQueue<M> {
    pub fn new(options: QueueOptions) -> Self {
        let state = State { messages: VecDeque::new(), in_flight: 0, closed: false };
        let shared = Shared {
            name: options.name,
            max_size: options.max_size,
            state: std::sync::Mutex::new(state),
            notify: Notify::new(),
        };
        Self { shared: Arc::new(shared) }
    }

    pub fn len(&self) -> usize {
        self.shared.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of the pending messages, in delivery order.
    pub fn snapshot(&self) -> Vec<(M, Attributes)>
    where
        M: Clone,
    {
        self.shared.state().messages.iter().cloned().collect()
    }

    fn take(&self) -> MqResult<Option<(M, Attributes)>> {
        let mut state = self.shared.state();
        if state.closed {
            return Err(self.shared.closed());
        }
        let message = state.messages.pop_front();
        if message.is_some() {
            state.in_flight += 1;
        }
        Ok(message)
    }
}

/// A message taken by a handler. Dropping it releases its slot and, unless it was completed, puts
/// the message back at the front of the queue.
struct InFlight<'a, M> {
    queue: &'a MemoryQueue<M>,
    message: Option<(M, Attributes)>,
}

impl<M> InFlight<'_, M> {
    fn complete(mut self) {
        self.message = None;
    }
}

impl<M> Drop for InFlight<'_, M> {
    fn drop(&mut self) {
        let put_back = {
            let mut state = self.queue.shared.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            match self.message.take() {
                Some(message) if !state.closed => {
                    state.messages.push_front(message);
                    true
                }
                _ => false,
            }
        };
        if put_back {
            self.queue.shared.notify.notify_waiters();
        }
    }
}

#[async_trait::async_trait]
impl<M: Clone + Send + 'static> Queue<M> for MemoryQueue<M> {
    async fn post(&self, message: M, attributes: Attributes) -> MqResult<()> {
        {
            let mut state = self.shared.state();
            if state.closed {
                return Err(MqError::Closed);
            }
            if let Some(max_size) = self.shared.max_size {
                if state.messages.len() + state.in_flight >= max_size {
                    return Err(MqError::QueueFull { max_size });
                }
            }
            state.messages.push_back((message, attributes));
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn reader(&self, options: ReaderOptions) -> MqResult<Box<dyn Reader<M>>> {
        let source: Arc<dyn MessageSource<M>> = Arc::new(self.clone());
        Ok(Box::new(SubscriptionReader::new(source, options)))
    }

    async fn close(&self) -> MqResult<()> {
        let dropped = {
            let mut state = self.shared.state();
            state.closed = true;
            std::mem::take(&mut state.messages).len()
        };
        if dropped > 0 {
            tracing::warn!(queue = %self.shared.name, dropped, "Closed memory queue with pending messages");
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait::async_trait]
impl<M: Clone + Send + 'static> MessageSource<M> for MemoryQueue<M> {
    async fn subscribe(&self, options: &ReaderOptions) -> MqResult<Box<dyn Subscription<M>>> {
        if self.shared.state().closed {
            return Err(self.shared.closed());
        }
        tracing::debug!(queue = %self.shared.name, reader = %options.name, "Push reader subscribed");
        Ok(Box::new(MemorySubscription { queue: self.clone() }))
    }
}

struct MemorySubscription<M> {
    queue: MemoryQueue<M>,
}

#[async_trait::async_trait]
impl<M: Clone + Send + 'static> Subscription<M> for MemorySubscription<M> {
    async fn next(&mut self, handler: &dyn MessageHandler<M>, ctx: &DeliveryContext) -> MqResult<Delivery> {
        loop {
            // Registered before checking the queue so a post in between is not missed.
            let notified = self.queue.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((message, attributes)) = self.queue.take()? {
                let in_flight = InFlight { queue: &self.queue, message: Some((message.clone(), attributes.clone())) };
                let res = handler.handle_message(message, attributes, ctx).await;
                return Ok(match res {
                    Ok(Disposition::Complete) => {
                        in_flight.complete();
                        Delivery::Handled(Disposition::Complete)
                    }
                    Ok(Disposition::Abandon) => Delivery::Handled(Disposition::Abandon),
                    Err(e) => Delivery::Failed(MqError::Handler(e)),
                });
            }

            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(MqError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }
}
