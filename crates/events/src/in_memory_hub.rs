//! In-memory change hub for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use haulage_core::VersionedAggregate;

use crate::change::ChangeEvent;
use crate::feed::{EventSource, FeedError, FeedFilter};

struct Subscriber<A: VersionedAggregate> {
    filter: FeedFilter<A>,
    tx: mpsc::UnboundedSender<ChangeEvent<A>>,
}

/// In-memory fan-out of change events to filtered subscriptions.
///
/// - No IO
/// - Per-subscription ordering equals publish order
/// - Subscriptions only see events published after they subscribed ("from now")
/// - Dropped subscriptions are pruned on the next publish
pub struct InMemoryChangeHub<A: VersionedAggregate> {
    subscribers: Mutex<Vec<Subscriber<A>>>,
}

impl<A: VersionedAggregate> InMemoryChangeHub<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscription whose filter matches.
    ///
    /// Returns the number of subscriptions the event was delivered to. Publishing
    /// the same event twice is allowed (it is how redelivery is simulated).
    pub fn publish(&self, event: &ChangeEvent<A>) -> Result<usize, FeedError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| FeedError::Unavailable("change hub lock poisoned".to_string()))?;

        subs.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for s in subs.iter() {
            if s.filter.matches(event) && s.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn subscribe(&self, filter: FeedFilter<A>) -> Subscription<A> {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned we still hand out a subscription;
        // it just never receives anything.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber { filter, tx });
        }

        Subscription { receiver: rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl<A: VersionedAggregate> Default for InMemoryChangeHub<A> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<A: VersionedAggregate> core::fmt::Debug for InMemoryChangeHub<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryChangeHub")
            .field("collection", &A::COLLECTION)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A filtered subscription to an [`InMemoryChangeHub`].
#[derive(Debug)]
pub struct Subscription<A: VersionedAggregate> {
    receiver: mpsc::UnboundedReceiver<ChangeEvent<A>>,
}

impl<A: VersionedAggregate> Subscription<A> {
    /// Take the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<ChangeEvent<A>> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
impl<A: VersionedAggregate> EventSource<ChangeEvent<A>> for Subscription<A> {
    async fn next(&mut self) -> Result<Option<ChangeEvent<A>>, FeedError> {
        Ok(self.receiver.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::OperationKind;
    use haulage_core::{Watermarks, VersionedAggregate};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Uuid,
        text: String,
        version: u64,
        watermarks: Watermarks,
    }

    impl VersionedAggregate for Note {
        type Id = Uuid;
        const COLLECTION: &'static str = "notes";

        fn id(&self) -> Uuid {
            self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
        fn watermarks(&self) -> &Watermarks {
            &self.watermarks
        }
        fn watermarks_mut(&mut self) -> &mut Watermarks {
            &mut self.watermarks
        }
    }

    fn note(text: &str, version: u64) -> Note {
        Note {
            id: Uuid::now_v7(),
            text: text.to_string(),
            version,
            watermarks: Watermarks::new(),
        }
    }

    fn update(n: &Note, fields: &[&str]) -> ChangeEvent<Note> {
        ChangeEvent::Update {
            document_id: n.id,
            version: n.version,
            changed_fields: fields.iter().map(|f| f.to_string()).collect(),
            before: None,
            after: Some(n.clone()),
        }
    }

    #[tokio::test]
    async fn subscription_receives_in_publish_order() {
        let hub = InMemoryChangeHub::<Note>::new();
        let mut sub = hub.subscribe(FeedFilter::all());

        let a = note("a", 1);
        let b = note("b", 1);
        hub.publish(&ChangeEvent::Insert { document_id: a.id, version: 1, after: a.clone() })
            .unwrap();
        hub.publish(&ChangeEvent::Insert { document_id: b.id, version: 1, after: b.clone() })
            .unwrap();

        assert_eq!(sub.next().await.unwrap().unwrap().document_id(), a.id);
        assert_eq!(sub.next().await.unwrap().unwrap().document_id(), b.id);
    }

    #[tokio::test]
    async fn field_filter_skips_unrelated_updates() {
        let hub = InMemoryChangeHub::<Note>::new();
        let mut sub = hub.subscribe(
            FeedFilter::all()
                .operations([OperationKind::Update])
                .fields(["text"]),
        );

        let n = note("x", 2);
        assert_eq!(hub.publish(&update(&n, &["other"])).unwrap(), 0);
        assert_eq!(hub.publish(&update(&n, &["text"])).unwrap(), 1);

        let ev = sub.next().await.unwrap().unwrap();
        assert!(ev.touches("text"));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn predicate_filters_on_after_state() {
        let hub = InMemoryChangeHub::<Note>::new();
        let mut sub = hub.subscribe(
            FeedFilter::all().with_predicate(|ev: &ChangeEvent<Note>| ev.after().is_some_and(|n| n.text == "ready")),
        );

        hub.publish(&update(&note("draft", 2), &["text"])).unwrap();
        hub.publish(&update(&note("ready", 3), &["text"])).unwrap();

        let ev = sub.next().await.unwrap().unwrap();
        assert_eq!(ev.version(), 3);
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let hub = InMemoryChangeHub::<Note>::new();
        let sub = hub.subscribe(FeedFilter::all());
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);

        let n = note("a", 1);
        assert_eq!(hub.publish(&update(&n, &["text"])).unwrap(), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn describe_names_collection_id_and_version() {
        let n = note("a", 4);
        let ev = update(&n, &["text"]);
        assert_eq!(ev.describe(), format!("notes/{}@4", n.id));
    }
}
