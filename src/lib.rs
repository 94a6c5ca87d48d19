//! `durable-mq` is an asynchronous message-queue abstraction layer built around a durable,
//! sequenced queue store, designed so that no message which has been successfully posted is ever
//! lost, even across crashes.
//!
//! # Usage
//!
//! Every backend implements the same [`Queue`] contract: messages are [posted] along with their
//! [`Attributes`], and consumed through a [`Reader`] which delivers them one at a time to a
//! [`MessageHandler`]. Handlers decide what happens to each message:
//!
//! 1. [`Disposition::Complete`] removes the message for good.
//!
//! 2. [`Disposition::Abandon`] keeps the message at the head of the queue so it is delivered again.
//!    Failing with an error has the same effect.
//!
//! 3. A message is never removed from storage before its handler has completed it, so a crash in
//!    the middle of handling only ever results in the message being delivered again.
//!
//! The following is a simple example of a durable queue being drained by a reader:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use durable_mq::formatter::json_bytes;
//! use durable_mq::store::{DurableQueue, MemoryBacking};
//! use durable_mq::{Attributes, Disposition, Queue, QueueOptions, ReaderOptions, UserData, handler_fn};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = QueueOptions::named("orders");
//!     let queue = DurableQueue::<String>::open(MemoryBacking::new(), json_bytes(), options).await.unwrap();
//!
//!     // Posts only return once the message has been persisted.
//!     queue.post("keyboard".to_string(), Attributes::new().with_label("hardware")).await.unwrap();
//!
//!     let (sx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let handler = handler_fn(move |order: String, _, _| {
//!         let _ = sx.send(order);
//!         async { Ok(Disposition::Complete) }
//!     });
//!
//!     let reader = queue.reader(ReaderOptions::named("shipping")).unwrap();
//!     reader.start(Arc::new(handler), UserData::none()).await.unwrap();
//!     assert_eq!(rx.recv().await.as_deref(), Some("keyboard"));
//!
//!     // Waits for the in-flight message, if any, before returning.
//!     reader.close().await.unwrap();
//! }
//! ```
//!
//! # Backends
//!
//! - [`DurableQueue`] is the durable store. It persists every message through a [`Backing`]
//!   before acknowledging it and rebuilds itself from storage on restart. Records can be kept on
//!   disk ([`DiskBacking`], `disk` feature), in SQLite ([`SqlBacking`], `sql` feature) or in
//!   memory ([`MemoryBacking`]).
//!
//! - [`MemoryQueue`] keeps messages in memory and pushes them to readers as they arrive.
//!
//! - The [`router`] module composes queues: a [`Forwarder`] moves messages from one queue to
//!   another and a [`MultiTargetQueue`] fans messages out to several queues.
//!
//! Messages are converted to and from their stored representation by [`formatter`]s, which can be
//! chained together.
//!
//! # Testing
//!
//! Every module is unit tested against its documented edge cases. On top of this, the durable
//! store is checked with [`proptest`] against a reference model over random sequences of posts,
//! completions, abandons and restarts. These tests are enabled with the `proptest` feature and log
//! to `proptest.log`.
//!
//! # Known limitations
//!
//! ## Poison messages
//!
//! A message which is always abandoned stays at the head of its queue forever and blocks every
//! message behind it. There is no dead-letter queue or retry limit yet, handlers which can fail
//! permanently should complete such messages after recording them elsewhere.
//!
//! ## Throughput
//!
//! A durable queue holds a single lock for the whole of a read, including the call to the handler,
//! so only one message is ever in flight and producers wait on slow handlers. This keeps ordering
//! and redelivery simple to reason about, at the cost of throughput.
//!
//! ## Fan-out is not transactional
//!
//! If one target of a [`MultiTargetQueue`] refuses a message, the targets before it have already
//! received it. Retrying the post delivers the message to those targets again.
//!
//! [posted]: Queue::post
//! [`DurableQueue`]: store::DurableQueue
//! [`Backing`]: store::Backing
//! [`DiskBacking`]: store::DiskBacking
//! [`SqlBacking`]: store::SqlBacking
//! [`MemoryBacking`]: store::MemoryBacking
//! [`Forwarder`]: router::Forwarder
//! [`MultiTargetQueue`]: router::MultiTargetQueue

mod attributes;
#[cfg(test)]
mod common;
mod contract;
mod error;
pub mod formatter;
pub mod memory;
mod options;
pub mod reader;
pub mod router;
pub mod store;
mod sync;

pub use attributes::Attributes;
pub use contract::*;
pub use error::*;
pub use memory::MemoryQueue;
pub use options::{ErrorAction, QueueOptions, ReaderOptions};
pub use store::{DurableQueue, Receipt};
pub use sync::Cancellation;
