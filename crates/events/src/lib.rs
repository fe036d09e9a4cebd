//! Change notifications and the change-feed contract.
//!
//! The document store emits one [`ChangeEvent`] per persisted mutation. Consumers
//! pull them through an [`EventSource`], which is the only thing the work queue
//! knows about a feed.

pub mod change;
pub mod feed;
pub mod in_memory_hub;

pub use change::{ChangeEvent, OperationKind};
pub use feed::{BoxedSource, ChannelSource, EventSource, FeedError, FeedFilter};
pub use in_memory_hub::{InMemoryChangeHub, Subscription};
