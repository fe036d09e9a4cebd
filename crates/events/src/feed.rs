//! Change-feed contract (mechanics only).
//!
//! ## Delivery Guarantees
//!
//! A feed is **ordered** per collection and **at-least-once**:
//! - Events are handed out in the order the store committed them
//! - Events may be delivered more than once (redelivery after restart, replays)
//! - Consumers must be idempotent (claims + conditional writes make them so)
//!
//! At-least-once delivery plus idempotent claims is the chosen consistency model;
//! there is no exactly-once machinery anywhere in the engine.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use haulage_core::VersionedAggregate;

use crate::change::{ChangeEvent, OperationKind};

/// Feed operation error.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// The feed is temporarily unavailable (connection lost, listener error).
    #[error("change feed unavailable: {0}")]
    Unavailable(String),

    /// A raw change record could not be decoded into a [`ChangeEvent`].
    #[error("failed to decode change event: {0}")]
    Decode(String),
}

/// An ordered, async-pollable source of work items.
///
/// `next()` suspends the calling task (not the thread) until an item is available.
/// `Ok(None)` means the source is closed and will never yield again.
#[async_trait]
pub trait EventSource<T>: Send + 'static {
    async fn next(&mut self) -> Result<Option<T>, FeedError>;
}

/// Type-erased source, so one engine can run over any feed implementation.
pub type BoxedSource<T> = Box<dyn EventSource<T>>;

#[async_trait]
impl<T: Send + 'static> EventSource<T> for BoxedSource<T> {
    async fn next(&mut self) -> Result<Option<T>, FeedError> {
        (**self).next().await
    }
}

type Predicate<A> = Arc<dyn Fn(&ChangeEvent<A>) -> bool + Send + Sync>;

/// Server-side style filter for a feed subscription.
///
/// - `operations`: accepted operation kinds (empty = all)
/// - `fields`: an update must touch at least one of these (empty = any)
/// - `predicate`: optional extra condition on the event (e.g. after-state)
pub struct FeedFilter<A: VersionedAggregate> {
    operations: Vec<OperationKind>,
    fields: Vec<&'static str>,
    predicate: Option<Predicate<A>>,
}

impl<A: VersionedAggregate> FeedFilter<A> {
    /// Accept every change.
    pub fn all() -> Self {
        Self {
            operations: Vec::new(),
            fields: Vec::new(),
            predicate: None,
        }
    }

    pub fn operations(mut self, ops: impl IntoIterator<Item = OperationKind>) -> Self {
        self.operations = ops.into_iter().collect();
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = &'static str>) -> Self {
        self.fields = fields.into_iter().collect();
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ChangeEvent<A>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &ChangeEvent<A>) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&event.operation()) {
            return false;
        }
        if !self.fields.is_empty() && !self.fields.iter().any(|f| event.touches(f)) {
            return false;
        }
        match &self.predicate {
            Some(p) => p(event),
            None => true,
        }
    }
}

impl<A: VersionedAggregate> Clone for FeedFilter<A> {
    fn clone(&self) -> Self {
        Self {
            operations: self.operations.clone(),
            fields: self.fields.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<A: VersionedAggregate> core::fmt::Debug for FeedFilter<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FeedFilter")
            .field("operations", &self.operations)
            .field("fields", &self.fields)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Bounded channel adapter: any producer can feed a work queue through it.
#[derive(Debug)]
pub struct ChannelSource<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T: Send + 'static> ChannelSource<T> {
    pub fn new(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { receiver: rx })
    }
}

#[async_trait]
impl<T: Send + 'static> EventSource<T> for ChannelSource<T> {
    async fn next(&mut self) -> Result<Option<T>, FeedError> {
        Ok(self.receiver.recv().await)
    }
}
