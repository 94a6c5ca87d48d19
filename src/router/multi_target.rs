use crate::sync::Arc;
use crate::{Attributes, MqError, MqResult, Queue, Reader, ReaderOptions};

type Predicate<M> = Arc<dyn Fn(&M, &Attributes) -> bool + Send + Sync>;
type Unhandled<M> = Arc<dyn Fn(&M, &Attributes) -> MqResult<()> + Send + Sync>;

struct Route<M: Send + 'static> {
    target: Arc<dyn Queue<M>>,
    predicate: Predicate<M>,
}

/// A write-only [`Queue`] fanning messages out to every target whose predicate accepts them.
///
/// Routes are evaluated in the order they were added. A message matching several routes is
/// posted to each of them, in that order. A message matching none is handed to the unhandled
/// callback, which by default logs the message and fails the post with
/// [`MqError::UnhandledMessage`].
///
/// Fan-out is not transactional: if a target fails, the targets before it have already received
/// the message and the targets after it are skipped.
pub struct MultiTargetQueue<M: Send + 'static> {
    routes: Vec<Route<M>>,
    unhandled: Unhandled<M>,
}

impl<M: Send + 'static> Default for MultiTargetQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> MultiTargetQueue<M> {
    pub fn new() -> Self {
        Self { routes: Vec::new(), unhandled: Arc::new(reject_unhandled::<M>) }
    }

    /// Adds a route, evaluated after every route added before it.
    pub fn route<P>(mut self, target: Arc<dyn Queue<M>>, predicate: P) -> Self
    where
        P: Fn(&M, &Attributes) -> bool + Send + Sync + 'static,
    {
        self.routes.push(Route { target, predicate: Arc::new(predicate) });
        self
    }

    /// Replaces the callback invoked with messages no route accepted. Its result becomes the
    /// result of the post.
    pub fn on_unhandled<F>(mut self, callback: F) -> Self
    where
        F: Fn(&M, &Attributes) -> MqResult<()> + Send + Sync + 'static,
    {
        self.unhandled = Arc::new(callback);
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait::async_trait]
impl<M: Clone + Send + 'static> Queue<M> for MultiTargetQueue<M> {
    async fn post(&self, message: M, attributes: Attributes) -> MqResult<()> {
        let mut matched = 0;

        for (index, route) in self.routes.iter().enumerate() {
            if !(route.predicate)(&message, &attributes) {
                continue;
            }
            matched += 1;

            if let Err(e) = route.target.post(message.clone(), attributes.clone()).await {
                tracing::warn!(route = index, error = %e, "Route target refused the message");
                return Err(e);
            }
        }

        if matched == 0 {
            return (self.unhandled)(&message, &attributes);
        }

        tracing::trace!(matched, "Message routed");
        Ok(())
    }

    fn reader(&self, _: ReaderOptions) -> MqResult<Box<dyn Reader<M>>> {
        Err(MqError::Unsupported("reading from a multi-target queue"))
    }

    /// Closes every target concurrently, reporting the first failure.
    async fn close(&self) -> MqResult<()> {
        let closing = self.routes.iter().map(|route| route.target.close());
        let mut res = Ok(());

        for (index, closed) in futures::future::join_all(closing).await.into_iter().enumerate() {
            if let Err(e) = closed {
                tracing::warn!(route = index, error = %e, "Failed to close route target");
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }
        res
    }
}

fn reject_unhandled<M>(_: &M, attributes: &Attributes) -> MqResult<()> {
    tracing::error!(label = ?attributes.label(), "No route accepted the message");
    Err(MqError::UnhandledMessage)
}

/// Accepts messages whose label is `label`.
pub fn label_is<M>(label: impl Into<String>) -> impl Fn(&M, &Attributes) -> bool + Send + Sync + 'static {
    let label = label.into();
    move |_, attributes| attributes.label() == Some(label.as_str())
}

/// Accepts every message.
pub fn always<M>() -> impl Fn(&M, &Attributes) -> bool + Send + Sync + 'static {
    |_, _| true
}
