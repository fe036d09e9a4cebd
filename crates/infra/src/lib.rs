//! Infrastructure layer: document stores, change feeds, work queues, handlers and
//! the engine that wires them together.

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod feed_cursor;
pub mod gate;
pub mod handlers;
pub mod queue;
pub mod store;
pub mod sweeper;


pub use config::{ConfigError, EngineConfig};
pub use engine::{Collaborators, Engine, EngineHandle, Feeds, InMemoryBackend, Stores};
pub use gate::VersionGate;
pub use queue::{QueueHandle, QueueStats, TaskHandler, WorkQueue, WorkQueueConfig};
pub use store::{DocumentStore, Filter, Patch, SharedStore, StoreError};
pub use sweeper::{
    OrphanSweeper, OrphanSweeperConfig, StaleMessages, StaleReadyMessages, SweeperHandle,
};
