//! Queues built on top of other queues.
//!
//! - [`Forwarder`] drains a source queue into a destination queue, converting messages on the way.
//! - [`MultiTargetQueue`] fans posted messages out to several queues based on predicates.
//!
//! Both implement [`Queue`](crate::Queue) themselves, so they can be nested and handed to code
//! which only knows about the posting contract.

mod forwarder;
mod multi_target;

pub use forwarder::{Forwarder, ForwarderOptions};
pub use multi_target::{MultiTargetQueue, always, label_is};
