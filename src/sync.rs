pub(crate) use std::sync::Arc;
pub(crate) use tokio::sync::{Mutex, Notify, watch};

/// A cooperative cancellation signal. Clones observe the same signal: once [`cancel`] has been
/// called on any of them, every clone reports itself as cancelled and every pending
/// [`cancelled`] future resolves.
///
/// Cancellation is never forced onto running code. Handlers receive this signal through their
/// [`DeliveryContext`] and are expected to check it during long-running work.
///
/// [`cancel`]: Self::cancel
/// [`cancelled`]: Self::cancelled
/// [`DeliveryContext`]: crate::DeliveryContext
#[derive(Clone)]
pub struct Cancellation(Arc<watch::Sender<bool>>);

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cancellation").field(&self.is_cancelled()).finish()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (sx, _) = watch::channel(false);
        Self(Arc::new(sx))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until the signal is cancelled. Returns immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives as long as `self`, so this can only return once the value is `true`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
