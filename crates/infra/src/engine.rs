//! Engine wiring: four work queues over the change feeds plus the orphan sweeper.
//!
//! | queue          | feed                                  | handler                  |
//! |----------------|---------------------------------------|--------------------------|
//! | `load-stops`   | loads, inserts + `stops` updates      | [`LoadRouteHandler`]     |
//! | `load-status`  | loads, `stops`/`truck_id`/`status`    | [`LoadStatusHandler`]    |
//! | `email`        | messages, Ready email                 | [`MessageDispatchHandler`] |
//! | `push`         | messages, Ready push                  | [`MessageDispatchHandler`] |
//!
//! Nothing is global: [`Engine::start`] owns what it builds and
//! [`EngineHandle::stop`] tears it down.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{error, info};

use haulage_events::{BoxedSource, ChangeEvent, FeedError, InMemoryChangeHub};
use haulage_fleet::{Load, Message, MessageChannel, Truck};

use crate::collaborators::{DistanceService, MessageSender};
use crate::config::EngineConfig;
use crate::feed_cursor::FeedCursorStore;
use crate::handlers::{LoadRouteHandler, LoadStatusHandler, MessageDispatchHandler};
use crate::queue::{QueueHandle, QueueStats, WorkQueue, WorkQueueConfig};
use crate::store::{
    InMemoryDocumentStore, PgChangeFeed, PostgresDocumentStore, SharedStore,
};
use crate::sweeper::{
    OrphanSweeper, OrphanSweeperConfig, StaleClaimTarget, StaleMessages, StaleReadyMessages,
    SweeperHandle,
};

pub const LOAD_STOPS_QUEUE: &str = "load-stops";
pub const LOAD_STATUS_QUEUE: &str = "load-status";
pub const EMAIL_QUEUE: &str = "email";
pub const PUSH_QUEUE: &str = "push";

/// Document stores the handlers read and write.
#[derive(Clone)]
pub struct Stores {
    pub loads: SharedStore<Load>,
    pub trucks: SharedStore<Truck>,
    pub messages: SharedStore<Message>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            loads: Arc::new(PostgresDocumentStore::<Load>::new(pool.clone())),
            trucks: Arc::new(PostgresDocumentStore::<Truck>::new(pool.clone())),
            messages: Arc::new(PostgresDocumentStore::<Message>::new(pool)),
        }
    }
}

/// In-memory stores with their change hubs, for tests and local runs.
pub struct InMemoryBackend {
    pub loads: Arc<InMemoryDocumentStore<Load>>,
    pub trucks: Arc<InMemoryDocumentStore<Truck>>,
    pub messages: Arc<InMemoryDocumentStore<Message>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            loads: InMemoryDocumentStore::arc(),
            trucks: InMemoryDocumentStore::arc(),
            messages: InMemoryDocumentStore::arc(),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            loads: self.loads.clone(),
            trucks: self.trucks.clone(),
            messages: self.messages.clone(),
        }
    }

    /// Subscribe every queue now, so no write made after this call is missed.
    pub fn feeds(&self) -> Feeds {
        Feeds::in_memory(self.loads.hub(), self.messages.hub())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One source per queue, each already filtered for its handler.
pub struct Feeds {
    pub load_stops: BoxedSource<ChangeEvent<Load>>,
    pub load_status: BoxedSource<ChangeEvent<Load>>,
    pub email: BoxedSource<ChangeEvent<Message>>,
    pub push: BoxedSource<ChangeEvent<Message>>,
}

impl Feeds {
    pub fn in_memory(loads: &InMemoryChangeHub<Load>, messages: &InMemoryChangeHub<Message>) -> Self {
        Self {
            load_stops: Box::new(loads.subscribe(LoadRouteHandler::feed_filter())),
            load_status: Box::new(loads.subscribe(LoadStatusHandler::feed_filter())),
            email: Box::new(messages.subscribe(MessageDispatchHandler::feed_filter(
                MessageChannel::Email,
            ))),
            push: Box::new(messages.subscribe(MessageDispatchHandler::feed_filter(
                MessageChannel::Push,
            ))),
        }
    }

    /// Postgres change-log feeds. With `cursors`, each queue resumes from its own
    /// named cursor; without, every feed starts from the current head.
    pub async fn postgres(
        pool: &PgPool,
        cursors: Option<Arc<dyn FeedCursorStore>>,
    ) -> Result<Self, FeedError> {
        let named = |queue: &str| cursors.clone().map(|store| (store, queue.to_string()));

        let load_stops =
            PgChangeFeed::open(pool.clone(), LoadRouteHandler::feed_filter(), named(LOAD_STOPS_QUEUE))
                .await?;
        let load_status = PgChangeFeed::open(
            pool.clone(),
            LoadStatusHandler::feed_filter(),
            named(LOAD_STATUS_QUEUE),
        )
        .await?;
        let email = PgChangeFeed::open(
            pool.clone(),
            MessageDispatchHandler::feed_filter(MessageChannel::Email),
            named(EMAIL_QUEUE),
        )
        .await?;
        let push = PgChangeFeed::open(
            pool.clone(),
            MessageDispatchHandler::feed_filter(MessageChannel::Push),
            named(PUSH_QUEUE),
        )
        .await?;

        Ok(Self {
            load_stops: Box::new(load_stops),
            load_status: Box::new(load_status),
            email: Box::new(email),
            push: Box::new(push),
        })
    }
}

/// Outbound services.
#[derive(Clone)]
pub struct Collaborators {
    pub distances: Arc<dyn DistanceService>,
    pub email: Arc<dyn MessageSender>,
    pub push: Arc<dyn MessageSender>,
}

pub struct Engine;

impl Engine {
    /// Start every queue and the sweeper on the current runtime.
    pub fn start(
        config: &EngineConfig,
        stores: Stores,
        feeds: Feeds,
        collaborators: Collaborators,
    ) -> EngineHandle {
        let queue_config = |name: &str| {
            WorkQueueConfig::default()
                .with_name(name)
                .with_max_parallel(config.max_parallel_tasks)
                .with_task_timeout(config.task_timeout)
                .with_shutdown_grace(config.shutdown_grace)
                .with_source_retry_delay(config.source_retry_delay)
        };

        let queues = vec![
            WorkQueue::start(
                queue_config(LOAD_STOPS_QUEUE),
                feeds.load_stops,
                LoadRouteHandler::new(stores.loads.clone(), collaborators.distances),
            ),
            WorkQueue::start(
                queue_config(LOAD_STATUS_QUEUE),
                feeds.load_status,
                LoadStatusHandler::new(
                    stores.loads.clone(),
                    stores.trucks.clone(),
                    stores.messages.clone(),
                ),
            ),
            WorkQueue::start(
                queue_config(EMAIL_QUEUE),
                feeds.email,
                MessageDispatchHandler::new(
                    stores.messages.clone(),
                    MessageChannel::Email,
                    collaborators.email,
                ),
            ),
            WorkQueue::start(
                queue_config(PUSH_QUEUE),
                feeds.push,
                MessageDispatchHandler::new(
                    stores.messages.clone(),
                    MessageChannel::Push,
                    collaborators.push,
                ),
            ),
        ];

        let sweeper = OrphanSweeper::new(
            OrphanSweeperConfig {
                interval: config.restart_interval,
                older_than: config.restart_tasks_older_than,
            },
            vec![
                Arc::new(StaleMessages::new(stores.messages.clone())) as Arc<dyn StaleClaimTarget>,
                Arc::new(StaleReadyMessages::new(stores.messages)) as Arc<dyn StaleClaimTarget>,
            ],
        )
        .start();

        info!(
            queues = queues.len(),
            max_parallel_tasks = config.max_parallel_tasks,
            "engine started"
        );
        EngineHandle { queues, sweeper }
    }
}

/// Running engine.
#[derive(Debug)]
pub struct EngineHandle {
    queues: Vec<QueueHandle>,
    sweeper: SweeperHandle,
}

impl EngineHandle {
    /// Current statistics per queue name.
    pub fn stats(&self) -> Vec<(String, QueueStats)> {
        self.queues
            .iter()
            .map(|q| (q.name().to_string(), q.stats()))
            .collect()
    }

    /// Stop the sweeper, then every queue concurrently (each with its own grace period).
    pub async fn stop(self) -> Vec<(String, QueueStats)> {
        self.sweeper.stop().await;

        let stopping: Vec<_> = self
            .queues
            .into_iter()
            .map(|q| (q.name().to_string(), tokio::spawn(q.stop())))
            .collect();

        let mut stats = Vec::with_capacity(stopping.len());
        for (name, join) in stopping {
            match join.await {
                Ok(s) => stats.push((name, s)),
                Err(e) => error!(queue = %name, error = %e, "queue shutdown panicked"),
            }
        }
        info!("engine stopped");
        stats
    }
}
