//! Periodic repair of records stuck in an in-flight marker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use haulage_fleet::message::fields;
use haulage_fleet::{Message, MessageState};

use crate::store::{Filter, Patch, SharedStore, StoreError};

/// A collection whose records can be left claimed-but-unfinished.
#[async_trait]
pub trait StaleClaimTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Reset every record whose in-flight marker was set before `cutoff` back to
    /// its pending value. Returns the number of records reset.
    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Messages stuck in `Processing` go back to `Ready`.
pub struct StaleMessages {
    name: String,
    store: SharedStore<Message>,
}

impl StaleMessages {
    pub fn new(store: SharedStore<Message>) -> Self {
        Self {
            name: "messages".to_string(),
            store,
        }
    }
}

#[async_trait]
impl StaleClaimTarget for StaleMessages {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let reset = self
            .store
            .update_many_where(
                &[
                    Filter::eq(fields::STATE, MessageState::Processing),
                    Filter::before(fields::STATE_CHANGED_AT, cutoff),
                ],
                Patch::new()
                    .set(fields::STATE, MessageState::Ready)
                    .set(fields::STATE_CHANGED_AT, Utc::now()),
            )
            .await?;

        for message in &reset {
            warn!(
                message_id = %message.id,
                channel = message.channel().as_str(),
                attempts = message.attempts,
                "orphaned message reset to Ready"
            );
        }
        Ok(reset.len())
    }
}

/// Messages left `Ready` past the threshold are touched so the feed emits them
/// again. Covers a `Ready` change whose dispatch never ran (the process died
/// after the feed cursor moved past it).
pub struct StaleReadyMessages {
    name: String,
    store: SharedStore<Message>,
}

impl StaleReadyMessages {
    pub fn new(store: SharedStore<Message>) -> Self {
        Self {
            name: "ready-messages".to_string(),
            store,
        }
    }
}

#[async_trait]
impl StaleClaimTarget for StaleReadyMessages {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let touched = self
            .store
            .update_many_where(
                &[
                    Filter::eq(fields::STATE, MessageState::Ready),
                    Filter::before(fields::STATE_CHANGED_AT, cutoff),
                ],
                Patch::new().set(fields::STATE_CHANGED_AT, Utc::now()),
            )
            .await?;

        for message in &touched {
            warn!(
                message_id = %message.id,
                channel = message.channel().as_str(),
                "undispatched ready message re-emitted"
            );
        }
        Ok(touched.len())
    }
}

#[derive(Debug, Clone)]
pub struct OrphanSweeperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Minimum age of an in-flight marker before it is considered orphaned
    pub older_than: Duration,
}

impl Default for OrphanSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            older_than: Duration::from_secs(300),
        }
    }
}

/// Periodically resets orphaned in-flight records on every registered target.
pub struct OrphanSweeper {
    config: OrphanSweeperConfig,
    targets: Vec<Arc<dyn StaleClaimTarget>>,
}

impl OrphanSweeper {
    pub fn new(config: OrphanSweeperConfig, targets: Vec<Arc<dyn StaleClaimTarget>>) -> Self {
        Self { config, targets }
    }

    /// One pass over every target, treating `now` as the current time.
    ///
    /// Failures are logged per target and never abort the pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let older_than = chrono::Duration::from_std(self.config.older_than)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(older_than).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut total = 0;
        for target in &self.targets {
            match target.reset_stale(cutoff).await {
                Ok(0) => debug!(target = target.name(), "no orphans"),
                Ok(n) => {
                    info!(target = target.name(), reset = n, %cutoff, "orphans reset");
                    total += n;
                }
                Err(e) => error!(target = target.name(), error = %e, "sweep failed"),
            }
        }
        total
    }

    /// Spawn the periodic sweep loop.
    pub fn start(self) -> SweeperHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            info!(
                interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
                older_than_ms = u64::try_from(self.config.older_than.as_millis()).unwrap_or(u64::MAX),
                "orphan sweeper started"
            );

            let mut ticks = tokio::time::interval(self.config.interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so a fresh start does
            // not race the queues it is supposed to back up.
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticks.tick() => {
                        self.sweep_once(Utc::now()).await;
                    }
                }
            }

            info!("orphan sweeper stopped");
        });

        SweeperHandle {
            shutdown,
            join: Some(join),
        }
    }
}

/// Handle to stop a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal the loop and wait for an in-progress pass to finish.
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "orphan sweeper panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use haulage_core::MessageId;
    use haulage_events::FeedFilter;

    use haulage_fleet::MessageChannel;

    use crate::handlers::MessageDispatchHandler;
    use crate::store::{DocumentStore, InMemoryDocumentStore};

    fn sweeper(store: SharedStore<Message>) -> OrphanSweeper {
        OrphanSweeper::new(
            OrphanSweeperConfig {
                interval: Duration::from_millis(10),
                older_than: Duration::from_secs(60),
            },
            vec![Arc::new(StaleMessages::new(store)) as Arc<dyn StaleClaimTarget>],
        )
    }

    async fn processing_since(
        store: &SharedStore<Message>,
        at: DateTime<Utc>,
    ) -> MessageId {
        let msg = store.insert(Message::email("a@b.c", "s", "b")).await.unwrap();
        store
            .update_where(
                msg.id,
                &[],
                Patch::new()
                    .set(fields::STATE, MessageState::Processing)
                    .set(fields::STATE_CHANGED_AT, at),
            )
            .await
            .unwrap();
        msg.id
    }

    #[tokio::test]
    async fn resets_only_records_older_than_threshold() {
        let mem = InMemoryDocumentStore::<Message>::arc();
        let store: SharedStore<Message> = mem.clone();
        let now = Utc::now();

        let stale = processing_since(&store, now - chrono::Duration::seconds(61)).await;
        let fresh = processing_since(&store, now - chrono::Duration::seconds(59)).await;

        let mut feed = mem.hub().subscribe(FeedFilter::all().fields([fields::STATE]));
        let reset = sweeper(store.clone()).sweep_once(now).await;
        assert_eq!(reset, 1);

        let stale = store.get(stale).await.unwrap().unwrap();
        let fresh = store.get(fresh).await.unwrap().unwrap();
        assert_eq!(stale.state, MessageState::Ready);
        assert_eq!(fresh.state, MessageState::Processing);

        // The reset is an ordinary change, so dispatch queues see it.
        let event = feed.try_next().unwrap();
        assert_eq!(event.document_id(), stale.id);
        assert!(feed.try_next().is_none());
    }

    #[tokio::test]
    async fn second_pass_does_not_reset_again() {
        let store: SharedStore<Message> = InMemoryDocumentStore::<Message>::arc();
        let now = Utc::now();
        processing_since(&store, now - chrono::Duration::minutes(10)).await;

        let sweeper = sweeper(store);
        assert_eq!(sweeper.sweep_once(now).await, 1);
        assert_eq!(sweeper.sweep_once(now).await, 0);
    }

    #[tokio::test]
    async fn stale_ready_message_is_emitted_again() {
        let mem = InMemoryDocumentStore::<Message>::arc();
        let store: SharedStore<Message> = mem.clone();
        let now = Utc::now();

        let mut stale = Message::email("a@b.c", "s", "b").ready();
        stale.state_changed_at = now - chrono::Duration::minutes(5);
        let stale = store.insert(stale).await.unwrap();
        let fresh = store
            .insert(Message::email("a@b.c", "s", "b").ready())
            .await
            .unwrap();

        let mut feed = mem.hub().subscribe(MessageDispatchHandler::feed_filter(MessageChannel::Email));
        let sweeper = OrphanSweeper::new(
            OrphanSweeperConfig {
                interval: Duration::from_millis(10),
                older_than: Duration::from_secs(60),
            },
            vec![Arc::new(StaleReadyMessages::new(store.clone())) as Arc<dyn StaleClaimTarget>],
        );
        assert_eq!(sweeper.sweep_once(now).await, 1);

        let event = feed.try_next().unwrap();
        assert_eq!(event.document_id(), stale.id);
        assert!(feed.try_next().is_none());

        let stale = store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.state, MessageState::Ready);
        assert!(stale.state_changed_at > now - chrono::Duration::minutes(1));
        assert_eq!(store.get(fresh.id).await.unwrap().unwrap().version, fresh.version);

        // Touched records are young again.
        assert_eq!(sweeper.sweep_once(now).await, 0);
    }

    #[tokio::test]
    async fn terminal_messages_are_never_touched() {
        let store: SharedStore<Message> = InMemoryDocumentStore::<Message>::arc();
        let msg = store.insert(Message::email("a@b.c", "s", "b")).await.unwrap();
        store
            .update_where(
                msg.id,
                &[],
                Patch::new()
                    .set(fields::STATE, MessageState::Sent)
                    .set(fields::STATE_CHANGED_AT, Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        assert_eq!(sweeper(store.clone()).sweep_once(Utc::now()).await, 0);
        let stored = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Sent);
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl StaleClaimTarget for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn reset_stale(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Storage("down".to_string()))
        }
    }

    #[tokio::test]
    async fn failures_are_not_fatal_and_loop_keeps_ticking() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let handle = OrphanSweeper::new(
            OrphanSweeperConfig {
                interval: Duration::from_millis(5),
                older_than: Duration::from_secs(1),
            },
            vec![failing.clone() as Arc<dyn StaleClaimTarget>],
        )
        .start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;
        assert!(failing.0.load(Ordering::SeqCst) >= 2);
    }
}
